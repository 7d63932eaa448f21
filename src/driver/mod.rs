//! The narrow interface the access layer needs from a database driver.
//!
//! Every call returns its own [`DriverResult`]; there is no ambient
//! "last error" the caller has to query after a failed call.
//! [`Driver::last_error`] is kept only as a diagnostic.

pub mod memory;

use crate::connection::ConnectionConfig;
use crate::core::{
    BackupOptions, BlobId, BlobInfo, DbInfoAction, DriverError, DriverResult, FetchFlags,
    FieldInfo, MaintenanceAction, ParamInfo, ServerInfoAction, ServiceReply, TransactionOptions,
    UserSpec, Value,
};
use crate::event::EventNames;
use std::cell::RefCell;
use std::fmt;
use std::io::{Read, Write};
use std::rc::Rc;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

handle!(
    /// An attached database session.
    SessionHandle
);
handle!(
    /// A started transaction.
    TransactionHandle
);
handle!(
    /// A prepared query.
    QueryHandle
);
handle!(
    /// An open cursor over query results.
    CursorHandle
);
handle!(
    /// An open BLOB read or write stream.
    BlobHandle
);
handle!(
    /// A registered set of event watchers.
    EventHandle
);
handle!(
    /// An attached service manager session.
    ServiceHandle
);

/// Target of query execution: the transaction if one is active, else the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Session(SessionHandle),
    Transaction(TransactionHandle),
}

/// What the driver produced for an executed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawExecution {
    /// The statement succeeded without a result (DDL and the like).
    Done,
    /// A data-modifying statement and its affected-row count.
    Affected(u64),
    /// The statement produced rows.
    Cursor(CursorHandle),
}

/// Callback invoked with the posted event name. Returning `false` cancels
/// the registration.
///
/// Callbacks run while the driver is busy posting the event and must not
/// call back into it.
pub type EventCallback = Box<dyn FnMut(&str) -> bool>;

pub trait Driver {
    // Sessions
    fn connect(&mut self, config: &ConnectionConfig) -> DriverResult<SessionHandle>;
    fn pconnect(&mut self, config: &ConnectionConfig) -> DriverResult<SessionHandle>;
    fn disconnect(&mut self, session: SessionHandle) -> DriverResult<()>;
    fn drop_database(&mut self, session: SessionHandle) -> DriverResult<()>;

    // Transactions
    fn begin_transaction(
        &mut self,
        session: SessionHandle,
        options: TransactionOptions,
    ) -> DriverResult<TransactionHandle>;
    fn commit(&mut self, resource: Resource) -> DriverResult<()>;
    fn commit_retaining(&mut self, resource: Resource) -> DriverResult<()>;
    fn rollback(&mut self, resource: Resource) -> DriverResult<()>;
    fn rollback_retaining(&mut self, resource: Resource) -> DriverResult<()>;

    // Statements
    fn prepare(
        &mut self,
        session: SessionHandle,
        transaction: Option<TransactionHandle>,
        sql: &str,
    ) -> DriverResult<QueryHandle>;
    fn execute(&mut self, query: QueryHandle, args: &[Value]) -> DriverResult<RawExecution>;
    fn free_query(&mut self, query: QueryHandle) -> DriverResult<()>;
    fn num_params(&self, query: QueryHandle) -> DriverResult<usize>;
    fn param_info(&self, query: QueryHandle, position: usize) -> DriverResult<ParamInfo>;
    fn query(&mut self, resource: Resource, sql: &str, args: &[Value]) -> DriverResult<RawExecution>;
    fn affected_rows(&self, resource: Resource) -> DriverResult<u64>;

    // Cursors
    /// Fetches the next row. `Ok(None)` means the cursor is exhausted and no
    /// error is pending.
    fn fetch(&mut self, cursor: CursorHandle, flags: FetchFlags) -> DriverResult<Option<Vec<Value>>>;
    fn field_info(&self, cursor: CursorHandle, index: usize) -> DriverResult<FieldInfo>;
    fn num_fields(&self, cursor: CursorHandle) -> DriverResult<usize>;
    fn name_result(&mut self, cursor: CursorHandle, name: &str) -> DriverResult<()>;
    fn free_result(&mut self, cursor: CursorHandle) -> DriverResult<()>;

    // BLOBs
    fn blob_create(&mut self, session: SessionHandle) -> DriverResult<BlobHandle>;
    fn blob_open(&mut self, session: SessionHandle, id: BlobId) -> DriverResult<BlobHandle>;
    fn blob_add(&mut self, blob: BlobHandle, data: &[u8]) -> DriverResult<()>;
    fn blob_get(&mut self, blob: BlobHandle, len: usize) -> DriverResult<Vec<u8>>;
    /// Closes the stream; for a write stream the returned id is newly assigned.
    fn blob_close(&mut self, blob: BlobHandle) -> DriverResult<BlobId>;
    fn blob_cancel(&mut self, blob: BlobHandle) -> DriverResult<()>;
    fn blob_info(&self, session: SessionHandle, id: BlobId) -> DriverResult<BlobInfo>;
    fn blob_echo(&self, session: SessionHandle, id: BlobId, out: &mut dyn Write) -> DriverResult<()>;
    fn blob_import(&mut self, session: SessionHandle, source: &mut dyn Read) -> DriverResult<BlobId>;

    // Generators
    fn gen_id(&mut self, session: SessionHandle, generator: &str, increment: i64) -> DriverResult<i64>;

    // Events
    fn set_event_handler(
        &mut self,
        session: SessionHandle,
        names: &EventNames,
        callback: EventCallback,
    ) -> DriverResult<EventHandle>;
    fn wait_event(&mut self, session: SessionHandle, names: &EventNames) -> DriverResult<String>;
    fn free_event_handler(&mut self, handle: EventHandle) -> DriverResult<()>;

    // Service manager
    fn service_attach(&mut self, host: &str, user: &str, password: &str) -> DriverResult<ServiceHandle>;
    fn service_detach(&mut self, service: ServiceHandle) -> DriverResult<()>;
    fn add_user(&mut self, service: ServiceHandle, user: &UserSpec) -> DriverResult<ServiceReply>;
    fn modify_user(&mut self, service: ServiceHandle, user: &UserSpec) -> DriverResult<ServiceReply>;
    fn delete_user(&mut self, service: ServiceHandle, user_name: &str) -> DriverResult<ServiceReply>;
    fn backup(
        &mut self,
        service: ServiceHandle,
        source_db: &str,
        dest_file: &str,
        options: BackupOptions,
        verbose: bool,
    ) -> DriverResult<ServiceReply>;
    fn restore(
        &mut self,
        service: ServiceHandle,
        source_file: &str,
        dest_db: &str,
        options: BackupOptions,
        verbose: bool,
    ) -> DriverResult<ServiceReply>;
    fn maintain_db(
        &mut self,
        service: ServiceHandle,
        db: &str,
        action: MaintenanceAction,
        argument: i64,
    ) -> DriverResult<ServiceReply>;
    fn db_info(
        &mut self,
        service: ServiceHandle,
        db: &str,
        action: DbInfoAction,
        argument: i64,
    ) -> DriverResult<ServiceReply>;
    fn server_info(&mut self, service: ServiceHandle, action: ServerInfoAction) -> DriverResult<ServiceReply>;

    /// The error recorded by the most recent failing call, if any.
    fn last_error(&self) -> Option<DriverError>;
}

/// A driver shared by every resource opened through it.
pub type SharedDriver = Rc<RefCell<dyn Driver>>;

/// Wraps a concrete driver for use by connections and services.
pub fn shared<D: Driver + 'static>(driver: D) -> SharedDriver {
    Rc::new(RefCell::new(driver))
}
