// ============================================================================
// ibase: client access layer for InterBase-style database servers
// ============================================================================

pub mod core;
pub mod driver;
pub mod connection;
pub mod transaction;
pub mod statement;
pub mod result;
pub mod blob;
pub mod event;
pub mod service;

// Re-export main types for convenience
pub use core::{
    BackupOptions, BlobId, BlobInfo, DbInfoAction, DriverError, Error, FetchFlags, FieldInfo,
    FieldType, MaintenanceAction, ParamInfo, Result, ServerInfoAction, ServiceReply,
    TransactionOptions, UsageError, UserSpec, Value,
};
pub use driver::{Driver, SharedDriver, shared};
pub use driver::memory::{Failpoint, MemoryDriver};

pub use connection::{Connection, ConnectionConfig};
pub use transaction::TransactionState;
pub use statement::Statement;
pub use result::{AssocRow, Cell, Execution, ObjectRow, QueryResult, ResultSet};
pub use blob::{Blob, BlobMode};
pub use event::{EventNames, EventSubscription, MAX_EVENTS};
pub use service::AdminService;
