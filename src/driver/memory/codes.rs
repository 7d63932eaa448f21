//! Status codes reported by the in-memory driver, numbered like the
//! server's own status vector codes.

pub const ARITH_EXCEPT: i64 = 335544321;
pub const BAD_DB_HANDLE: i64 = 335544324;
pub const BAD_REQ_HANDLE: i64 = 335544327;
pub const BAD_SEGSTR_HANDLE: i64 = 335544328;
pub const BAD_SEGSTR_ID: i64 = 335544329;
pub const BAD_TRANS_HANDLE: i64 = 335544332;
pub const IO_ERROR: i64 = 335544344;
pub const LOCK_CONFLICT: i64 = 335544345;
pub const NOT_VALID: i64 = 335544347;
pub const NO_META_UPDATE: i64 = 335544351;
pub const NO_PRIV: i64 = 335544352;
pub const READ_ONLY_TRANS: i64 = 335544361;
pub const OBJECT_IN_USE: i64 = 335544453;
pub const GEN_NOT_FOUND: i64 = 335544463;
pub const LOGIN: i64 = 335544472;
pub const BAD_STMT_HANDLE: i64 = 335544485;
pub const SHUTDOWN: i64 = 335544528;
pub const BAD_SVC_HANDLE: i64 = 335544559;
pub const DSQL_ERROR: i64 = 335544569;
pub const DSQL_CURSOR_ERR: i64 = 335544572;
pub const DSQL_FIELD_ERR: i64 = 335544578;
pub const DSQL_RELATION_ERR: i64 = 335544580;
pub const UNIQUE_KEY_VIOLATION: i64 = 335544665;
pub const READ_ONLY_DATABASE: i64 = 335544765;
pub const EVENT_NOT_POSTED: i64 = 335544434;
pub const BAD_EVENT_HANDLE: i64 = 335544435;
pub const USER_NOT_FOUND: i64 = 335544753;
