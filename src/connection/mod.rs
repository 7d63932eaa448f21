pub mod config;

use crate::blob::Blob;
use crate::core::{
    BlobId, BlobInfo, DriverError, DriverResult, Error, Result, TransactionOptions, UsageError,
    Value,
};
use crate::driver::{Driver, Resource, SessionHandle, SharedDriver, TransactionHandle};
use crate::event::{EventNames, EventSubscription};
use crate::result::Execution;
use crate::statement::Statement;
use crate::transaction::{Transaction, TransactionState};
pub use config::ConnectionConfig;
use log::{debug, warn};
use std::cell::Cell;
use std::io::{Read, Write};
use std::rc::Rc;

/// Session shared between a connection and everything opened through it.
///
/// Only the connection releases the session. Statements, result sets, blobs
/// and event subscriptions hold the link to reach the driver and check at
/// every call that the session is still there.
pub(crate) struct Link {
    driver: SharedDriver,
    session: Cell<Option<SessionHandle>>,
}

impl Link {
    pub(crate) fn new(driver: SharedDriver, session: SessionHandle) -> Self {
        Self {
            driver,
            session: Cell::new(Some(session)),
        }
    }

    /// The live session, or `ConnectionClosed`.
    pub(crate) fn session(&self) -> Result<SessionHandle> {
        self.session
            .get()
            .ok_or(Error::Usage(UsageError::ConnectionClosed))
    }

    pub(crate) fn is_open(&self) -> bool {
        self.session.get().is_some()
    }

    /// Runs a driver call, converting its failure into [`Error::Driver`].
    pub(crate) fn call<T>(&self, f: impl FnOnce(&mut dyn Driver) -> DriverResult<T>) -> Result<T> {
        let mut driver = self.driver.borrow_mut();
        f(&mut *driver).map_err(Error::from)
    }

    pub(crate) fn last_error(&self) -> Option<DriverError> {
        self.driver.borrow().last_error()
    }

    fn release(&self) -> Option<SessionHandle> {
        self.session.take()
    }
}

/// Database connection handle
///
/// Owns the driver session and at most one active transaction. Queries run
/// against the transaction when there is one, otherwise against the session.
///
/// # Examples
///
/// ```
/// use ibase::{Connection, ConnectionConfig, MemoryDriver, TransactionOptions, Value};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let driver = MemoryDriver::with_database("employee.fdb").into_shared();
/// let mut conn = Connection::open(driver, ConnectionConfig::default())?;
///
/// conn.query("CREATE TABLE users (id INTEGER, name VARCHAR(40))")?;
///
/// conn.begin(TransactionOptions::default())?;
/// conn.query_with_args("INSERT INTO users VALUES (?, ?)", &[Value::from(1), Value::from("Alice")])?;
/// conn.commit()?;
///
/// let mut rows = conn.query("SELECT name FROM users")?.into_result_set().unwrap();
/// let row = rows.fetch_assoc(Default::default())?.unwrap();
/// assert_eq!(row["NAME"].as_str(), Some("Alice"));
/// # Ok(())
/// # }
/// ```
pub struct Connection {
    link: Rc<Link>,
    transaction: Option<Transaction>,
    config: ConnectionConfig,
}

impl Connection {
    /// Attach to the database described by `config`.
    ///
    /// Persistent configurations go through the driver's persistent
    /// attachment call.
    pub fn open(driver: SharedDriver, config: ConnectionConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Usage(UsageError::InvalidConfig(e)))?;

        let session = {
            let mut d = driver.borrow_mut();
            if config.persistent {
                d.pconnect(&config)?
            } else {
                d.connect(&config)?
            }
        };

        debug!(
            "connected to {} as {} ({})",
            config.database,
            config.user.as_deref().unwrap_or("<default>"),
            session
        );

        Ok(Self {
            link: Rc::new(Link::new(driver, session)),
            transaction: None,
            config,
        })
    }

    /// Attach to `target` with a user and password.
    ///
    /// `target` may carry the `p;` persistent prefix.
    pub fn open_target(driver: SharedDriver, target: &str, user: &str, password: &str) -> Result<Self> {
        Self::open(driver, ConnectionConfig::new(target).credentials(user, password))
    }

    /// Configuration used to open this connection
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The active transaction, if any
    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub fn state(&self) -> TransactionState {
        match (self.link.is_open(), &self.transaction) {
            (false, _) => TransactionState::Closed,
            (true, None) => TransactionState::Idle,
            (true, Some(_)) => TransactionState::Active,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn is_closed(&self) -> bool {
        !self.link.is_open()
    }

    /// The error recorded by the driver's most recent failing call.
    pub fn last_error(&self) -> Option<DriverError> {
        self.link.last_error()
    }

    /// Execution context: the active transaction, else the session.
    fn resource(&self) -> Result<Resource> {
        let session = self.link.session()?;
        Ok(match &self.transaction {
            Some(tx) => Resource::Transaction(tx.handle()),
            None => Resource::Session(session),
        })
    }

    fn transaction_handle(&self) -> Result<TransactionHandle> {
        self.link.session()?;
        self.transaction
            .as_ref()
            .map(Transaction::handle)
            .ok_or(Error::Usage(UsageError::TransactionClosed))
    }

    /// Begin a new transaction
    ///
    /// An active transaction is rolled back first.
    pub fn begin(&mut self, options: TransactionOptions) -> Result<()> {
        let session = self.link.session()?;

        if self.transaction.is_some() {
            debug!("rolling back active transaction before starting a new one");
            self.rollback()?;
        }

        let handle = self.link.call(|d| d.begin_transaction(session, options))?;
        debug!("started {} with {:?}", handle, options);
        self.transaction = Some(Transaction::new(handle, options));
        Ok(())
    }

    /// Commit the active transaction
    ///
    /// On failure the transaction stays active.
    pub fn commit(&mut self) -> Result<()> {
        let handle = self.transaction_handle()?;
        self.link.call(|d| d.commit(Resource::Transaction(handle)))?;
        debug!("committed {}", handle);
        self.transaction = None;
        Ok(())
    }

    /// Commit the work so far and keep the transaction open
    pub fn commit_retaining(&mut self) -> Result<()> {
        let handle = self.transaction_handle()?;
        self.link.call(|d| d.commit_retaining(Resource::Transaction(handle)))?;
        if let Some(tx) = self.transaction.as_mut() {
            tx.mark_retained();
        }
        Ok(())
    }

    /// Rollback the active transaction
    ///
    /// On failure the transaction stays active.
    pub fn rollback(&mut self) -> Result<()> {
        let handle = self.transaction_handle()?;
        self.link.call(|d| d.rollback(Resource::Transaction(handle)))?;
        debug!("rolled back {}", handle);
        self.transaction = None;
        Ok(())
    }

    /// Undo the work so far and keep the transaction open
    pub fn rollback_retaining(&mut self) -> Result<()> {
        let handle = self.transaction_handle()?;
        self.link.call(|d| d.rollback_retaining(Resource::Transaction(handle)))?;
        if let Some(tx) = self.transaction.as_mut() {
            tx.mark_retained();
        }
        Ok(())
    }

    /// Run `f` inside a new transaction.
    ///
    /// Commits when `f` succeeds and rolls back when it fails. The rollback
    /// error, if any, is logged and the error from `f` is returned.
    pub fn with_transaction<T>(
        &mut self,
        options: TransactionOptions,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        self.begin(options)?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if self.transaction.is_some()
                    && let Err(rollback_err) = self.rollback()
                {
                    warn!("rollback after failed unit of work failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    /// Close the connection
    ///
    /// Rolls back an active transaction (errors are logged, not returned)
    /// and releases the session. Closing a closed connection does nothing.
    /// When the driver refuses to disconnect the connection stays open, so
    /// `close` (or drop) can try again.
    pub fn close(&mut self) -> Result<()> {
        let Ok(session) = self.link.session() else {
            return Ok(());
        };

        if let Some(tx) = self.transaction.take() {
            let handle = tx.handle();
            if let Err(e) = self.link.call(|d| d.rollback(Resource::Transaction(handle))) {
                warn!("rollback of {} during close failed: {}", handle, e);
            }
        }

        debug!("disconnecting {}", session);
        self.link.call(|d| d.disconnect(session))?;
        self.link.release();
        Ok(())
    }

    /// Drop the database this connection is attached to
    ///
    /// On success the connection is closed and the database is gone.
    pub fn drop_database(&mut self) -> Result<()> {
        let session = self.link.session()?;
        self.link.call(|d| d.drop_database(session))?;
        debug!("dropped database {}", self.config.database);
        self.link.release();
        self.transaction = None;
        Ok(())
    }

    /// Rows affected by the last statement in the execution context
    pub fn affected_rows(&self) -> Result<u64> {
        let resource = self.resource()?;
        self.link.call(|d| d.affected_rows(resource))
    }

    /// Execute SQL in the execution context
    pub fn query(&mut self, sql: &str) -> Result<Execution> {
        self.query_with_args(sql, &[])
    }

    /// Execute SQL with positional arguments in the execution context
    pub fn query_with_args(&mut self, sql: &str, args: &[Value]) -> Result<Execution> {
        let resource = self.resource()?;
        let raw = self.link.call(|d| d.query(resource, sql, args))?;
        Execution::from_raw(&self.link, raw)
    }

    /// Prepare a statement against the execution context
    pub fn prepare(&mut self, sql: &str) -> Result<Statement> {
        let session = self.link.session()?;
        let transaction = self.transaction.as_ref().map(Transaction::handle);
        let handle = self.link.call(|d| d.prepare(session, transaction, sql))?;
        Ok(Statement::new(Rc::clone(&self.link), handle))
    }

    /// Start a new BLOB for writing
    pub fn blob_create(&self) -> Result<Blob> {
        Blob::create(Rc::clone(&self.link))
    }

    /// Open an existing BLOB for reading
    pub fn blob_open(&self, id: BlobId) -> Result<Blob> {
        Blob::open(Rc::clone(&self.link), id)
    }

    pub fn blob_info(&self, id: BlobId) -> Result<BlobInfo> {
        let session = self.link.session()?;
        self.link.call(|d| d.blob_info(session, id))
    }

    /// Write the BLOB contents to standard output
    pub fn blob_echo(&self, id: BlobId) -> Result<()> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        self.blob_echo_to(id, &mut out)
    }

    /// Write the BLOB contents to `out`
    pub fn blob_echo_to(&self, id: BlobId, out: &mut dyn Write) -> Result<()> {
        let session = self.link.session()?;
        self.link.call(|d| d.blob_echo(session, id, out))
    }

    /// Store everything readable from `source` as a new BLOB
    pub fn blob_import(&self, source: &mut dyn Read) -> Result<BlobId> {
        let session = self.link.session()?;
        self.link.call(|d| d.blob_import(session, source))
    }

    /// Increment a generator and return its new value
    pub fn gen_id(&self, generator: &str, increment: i64) -> Result<i64> {
        let session = self.link.session()?;
        self.link.call(|d| d.gen_id(session, generator, increment))
    }

    /// Register `callback` for the given events
    pub fn set_event_handler(
        &self,
        names: &EventNames,
        callback: impl FnMut(&str) -> bool + 'static,
    ) -> Result<EventSubscription> {
        let session = self.link.session()?;
        let handle = self
            .link
            .call(|d| d.set_event_handler(session, names, Box::new(callback)))?;
        Ok(EventSubscription::new(Rc::clone(&self.link), handle))
    }

    /// Wait for one of the given events and return its name
    pub fn wait_event(&self, names: &EventNames) -> Result<String> {
        let session = self.link.session()?;
        self.link.call(|d| d.wait_event(session, names))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("closing connection to {} failed: {}", self.config.database, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::{Failpoint, MemoryDriver};
    use std::cell::RefCell;

    fn setup() -> (Rc<RefCell<MemoryDriver>>, Connection) {
        let driver = MemoryDriver::with_database("test.fdb").into_shared();
        let conn = Connection::open(driver.clone(), ConnectionConfig::new("test.fdb").credentials("SYSDBA", "masterkey")).unwrap();
        (driver, conn)
    }

    #[test]
    fn test_connection_creation() {
        let (_driver, conn) = setup();
        assert!(!conn.is_closed());
        assert!(!conn.in_transaction());
        assert_eq!(conn.state(), TransactionState::Idle);
    }

    #[test]
    fn test_open_unknown_database_fails_with_driver_error() {
        let driver = MemoryDriver::new().into_shared();
        let err = Connection::open_target(driver, "missing.fdb", "SYSDBA", "masterkey")
            .err()
            .unwrap();
        assert!(err.is_driver());
        assert!(err.code().is_some());
    }

    #[test]
    fn test_open_rejects_bad_credentials() {
        let driver = MemoryDriver::with_database("test.fdb").into_shared();
        let err = Connection::open_target(driver, "test.fdb", "SYSDBA", "wrong").err().unwrap();
        assert!(err.is_driver());
    }

    #[test]
    fn test_transaction_lifecycle() {
        let (_driver, mut conn) = setup();

        conn.begin(TransactionOptions::default()).unwrap();
        assert!(conn.in_transaction());
        assert_eq!(conn.state(), TransactionState::Active);

        conn.commit().unwrap();
        assert!(!conn.in_transaction());

        let err = conn.commit().unwrap_err();
        assert_eq!(err.as_usage(), Some(&UsageError::TransactionClosed));
    }

    #[test]
    fn test_transaction_rollback() {
        let (_driver, mut conn) = setup();

        conn.begin(TransactionOptions::default()).unwrap();
        conn.rollback().unwrap();
        assert!(!conn.in_transaction());

        let err = conn.rollback().unwrap_err();
        assert_eq!(err.as_usage(), Some(&UsageError::TransactionClosed));
    }

    #[test]
    fn test_retaining_keeps_transaction() {
        let (_driver, mut conn) = setup();

        conn.begin(TransactionOptions::default()).unwrap();
        let handle = conn.transaction().unwrap().handle();

        conn.commit_retaining().unwrap();
        conn.rollback_retaining().unwrap();

        assert!(conn.in_transaction());
        assert_eq!(conn.transaction().unwrap().handle(), handle);
        assert_eq!(conn.transaction().unwrap().retained(), 2);
    }

    #[test]
    fn test_retaining_requires_transaction() {
        let (_driver, mut conn) = setup();
        assert!(conn.commit_retaining().unwrap_err().is_usage());
        assert!(conn.rollback_retaining().unwrap_err().is_usage());
    }

    #[test]
    fn test_failed_commit_keeps_transaction_active() {
        let (driver, mut conn) = setup();
        conn.begin(TransactionOptions::default()).unwrap();

        driver
            .borrow_mut()
            .fail_next(Failpoint::Commit, DriverError::new(335544345, "lock conflict"));

        let err = conn.commit().unwrap_err();
        assert_eq!(err.code(), Some(335544345));
        assert!(conn.in_transaction());
        assert_eq!(conn.last_error().unwrap().code, Some(335544345));

        conn.rollback().unwrap();
        assert!(!conn.in_transaction());
    }

    #[test]
    fn test_failed_begin_leaves_no_transaction() {
        let (driver, mut conn) = setup();
        conn.begin(TransactionOptions::default()).unwrap();

        driver
            .borrow_mut()
            .fail_next(Failpoint::Begin, DriverError::new(335544324, "invalid database handle"));

        assert!(conn.begin(TransactionOptions::default()).is_err());
        assert!(!conn.in_transaction());
    }

    #[test]
    fn test_connection_close() {
        let (_driver, mut conn) = setup();

        conn.close().unwrap();
        assert!(conn.is_closed());
        assert_eq!(conn.state(), TransactionState::Closed);

        // Should fail after close
        let err = conn.query("SELECT 1 FROM RDB$DATABASE").unwrap_err();
        assert_eq!(err.as_usage(), Some(&UsageError::ConnectionClosed));
        assert!(conn.begin(TransactionOptions::default()).unwrap_err().is_usage());
        assert!(conn.prepare("SELECT 1 FROM RDB$DATABASE").is_err());
        assert!(conn.affected_rows().is_err());
        assert!(conn.gen_id("G", 1).is_err());

        // Idempotent
        assert!(conn.close().is_ok());
    }

    #[test]
    fn test_close_rolls_back_and_suppresses_errors() {
        let (driver, mut conn) = setup();
        conn.begin(TransactionOptions::default()).unwrap();

        driver
            .borrow_mut()
            .fail_next(Failpoint::Rollback, DriverError::new(335544332, "invalid transaction handle"));

        assert!(conn.close().is_ok());
        assert!(conn.is_closed());
        assert!(!conn.in_transaction());
    }

    #[test]
    fn test_auto_rollback_on_drop() {
        let (driver, mut conn) = setup();
        conn.begin(TransactionOptions::default()).unwrap();

        drop(conn);
        assert_eq!(driver.borrow().session_count(), 0);
        assert_eq!(driver.borrow().transaction_count(), 0);
    }

    #[test]
    fn test_failed_disconnect_keeps_connection_open() {
        let (driver, mut conn) = setup();
        driver
            .borrow_mut()
            .fail_next(Failpoint::Disconnect, DriverError::new(335544344, "connection lost"));

        assert!(conn.close().unwrap_err().is_driver());
        assert!(!conn.is_closed());
        assert_eq!(driver.borrow().session_count(), 1);

        conn.close().unwrap();
        assert!(conn.is_closed());
        assert_eq!(driver.borrow().session_count(), 0);
    }

    #[test]
    fn test_drop_retries_failed_disconnect() {
        let (driver, mut conn) = setup();
        driver
            .borrow_mut()
            .fail_next(Failpoint::Disconnect, DriverError::new(335544344, "connection lost"));

        assert!(conn.close().is_err());
        drop(conn);
        assert_eq!(driver.borrow().session_count(), 0);
    }

    #[test]
    fn test_persistent_session_is_reused() {
        let driver = MemoryDriver::with_database("test.fdb").into_shared();

        let mut first = Connection::open_target(driver.clone(), "p;test.fdb", "SYSDBA", "masterkey").unwrap();
        assert!(first.config().persistent);
        first.close().unwrap();

        let _second = Connection::open_target(driver.clone(), "P;test.fdb", "SYSDBA", "masterkey").unwrap();
        assert_eq!(driver.borrow().session_count(), 1);
    }

    #[test]
    fn test_drop_database_closes_connection() {
        let (driver, mut conn) = setup();

        conn.drop_database().unwrap();
        assert!(conn.is_closed());
        assert!(!driver.borrow().has_database("test.fdb"));
        assert!(conn.close().is_ok());
    }

    #[test]
    fn test_gen_id() {
        let (_driver, mut conn) = setup();
        conn.query("CREATE SEQUENCE GEN_USERS").unwrap();

        assert_eq!(conn.gen_id("GEN_USERS", 1).unwrap(), 1);
        assert_eq!(conn.gen_id("GEN_USERS", 10).unwrap(), 11);
        assert_eq!(conn.gen_id("GEN_USERS", 0).unwrap(), 11);
        assert!(conn.gen_id("NO_SUCH_GEN", 1).unwrap_err().is_driver());
    }

    #[test]
    fn test_with_transaction_commits_or_rolls_back() {
        let (_driver, mut conn) = setup();
        conn.query("CREATE TABLE t (id INTEGER)").unwrap();

        conn.with_transaction(TransactionOptions::default(), |c| {
            c.query("INSERT INTO t VALUES (1)")?;
            Ok(())
        })
        .unwrap();

        let result: Result<()> = conn.with_transaction(TransactionOptions::default(), |c| {
            c.query("INSERT INTO t VALUES (2)")?;
            c.query("INSERT INTO missing VALUES (3)")?;
            Ok(())
        });
        assert!(result.is_err());
        assert!(!conn.in_transaction());

        let mut rows = conn.query("SELECT id FROM t").unwrap().into_result_set().unwrap();
        assert_eq!(rows.fetch_row(Default::default()).unwrap().unwrap()[0].as_i64(), Some(1));
        assert!(rows.fetch_row(Default::default()).unwrap().is_none());
    }
}
