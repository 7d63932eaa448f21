//! In-memory implementation of [`Driver`].
//!
//! Keeps whole databases in memory: tables as persistent maps so that a
//! transaction can work on a cheap snapshot, BLOBs in a per-database store,
//! generators, user accounts and event queues. Understands a small SQL
//! subset (see [`sql`]) and can inject failures for testing error paths.

pub mod codes;
mod engine;
mod service;
mod sql;
mod storage;
mod users;

pub use users::{ADMIN_PASSWORD, ADMIN_USER};

use crate::connection::ConnectionConfig;
use crate::core::{
    BackupOptions, BlobId, BlobInfo, DbInfoAction, DriverError, DriverResult, FetchFlags,
    FieldInfo, MaintenanceAction, ParamInfo, ServerInfoAction, ServiceReply, TransactionOptions,
    UserSpec, Value,
};
use crate::driver::{
    BlobHandle, CursorHandle, Driver, EventCallback, EventHandle, QueryHandle, RawExecution,
    Resource, ServiceHandle, SessionHandle, TransactionHandle,
};
use crate::event::EventNames;
use chrono::{DateTime, Utc};
use engine::{Outcome, Scope};
use log::{debug, info, trace};
use sql::Parsed;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::rc::Rc;
use storage::{Database, Tables, MAX_SEGMENT};
use users::UserRegistry;

/// Events remembered per session for `wait_event`.
const PENDING_EVENT_LIMIT: usize = 256;

/// Driver call that can be made to fail once with [`MemoryDriver::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Failpoint {
    Connect,
    Disconnect,
    Begin,
    Commit,
    Rollback,
    Prepare,
    Execute,
    Fetch,
    FreeResult,
    BlobOpen,
    BlobClose,
    Service,
}

struct Session {
    database: String,
    user: String,
    persistent: bool,
    idle: bool,
    affected: u64,
    pending_events: VecDeque<String>,
}

struct TxState {
    session: SessionHandle,
    options: TransactionOptions,
    tables: Tables,
    touched: HashSet<String>,
    affected: u64,
}

struct Prepared {
    session: SessionHandle,
    transaction: Option<TransactionHandle>,
    parsed: Parsed,
    params: Vec<ParamInfo>,
}

struct Cursor {
    session: SessionHandle,
    /// Transaction the rows were read in; its end closes the cursor.
    transaction: Option<TransactionHandle>,
    open: bool,
    fields: Vec<FieldInfo>,
    rows: VecDeque<Vec<Value>>,
    name: Option<String>,
}

enum OpenBlob {
    Write {
        session: SessionHandle,
        segments: Vec<Vec<u8>>,
    },
    Read {
        session: SessionHandle,
        id: BlobId,
        data: Vec<u8>,
        pos: usize,
    },
}

impl OpenBlob {
    fn session(&self) -> SessionHandle {
        match self {
            OpenBlob::Write { session, .. } | OpenBlob::Read { session, .. } => *session,
        }
    }
}

struct Watcher {
    session: SessionHandle,
    names: EventNames,
    callback: EventCallback,
}

/// Reference driver keeping every database in memory
pub struct MemoryDriver {
    databases: BTreeMap<String, Database>,
    users: UserRegistry,
    sessions: HashMap<SessionHandle, Session>,
    transactions: HashMap<TransactionHandle, TxState>,
    queries: HashMap<QueryHandle, Prepared>,
    cursors: HashMap<CursorHandle, Cursor>,
    blobs: HashMap<BlobHandle, OpenBlob>,
    watchers: BTreeMap<EventHandle, Watcher>,
    /// Registrations whose callback asked to stop; freeing them still succeeds.
    cancelled_watchers: BTreeMap<EventHandle, SessionHandle>,
    services: HashMap<ServiceHandle, String>,
    next_handle: u64,
    failpoints: HashMap<Failpoint, DriverError>,
    last_error: RefCell<Option<DriverError>>,
    started: DateTime<Utc>,
}

impl MemoryDriver {
    /// Driver with no databases and only the administrator account
    pub fn new() -> Self {
        Self {
            databases: BTreeMap::new(),
            users: UserRegistry::with_admin(ADMIN_PASSWORD),
            sessions: HashMap::new(),
            transactions: HashMap::new(),
            queries: HashMap::new(),
            cursors: HashMap::new(),
            blobs: HashMap::new(),
            watchers: BTreeMap::new(),
            cancelled_watchers: BTreeMap::new(),
            services: HashMap::new(),
            next_handle: 0,
            failpoints: HashMap::new(),
            last_error: RefCell::new(None),
            started: Utc::now(),
        }
    }

    /// Driver with one empty database at `path`
    pub fn with_database(path: &str) -> Self {
        let mut driver = Self::new();
        driver.databases.insert(path.to_string(), Database::new());
        driver
    }

    pub fn into_shared(self) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(self))
    }

    /// Create an empty database
    pub fn create_database(&mut self, path: &str) -> DriverResult<()> {
        if self.databases.contains_key(path) {
            return Err(DriverError::new(
                codes::IO_ERROR,
                format!("I/O error during \"open O_CREAT\" operation for file \"{}\"\nfile exists", path),
            ));
        }
        info!("created database {}", path);
        self.databases.insert(path.to_string(), Database::new());
        Ok(())
    }

    pub fn has_database(&self, path: &str) -> bool {
        self.databases.contains_key(path)
    }

    /// Make the next call through `point` fail with `error`
    pub fn fail_next(&mut self, point: Failpoint, error: DriverError) {
        self.failpoints.insert(point, error);
    }

    /// Post an event on `database`
    ///
    /// Runs every matching callback; a callback returning `false` is
    /// unregistered. The name is also queued for `wait_event` on every
    /// session attached to the database. Returns the number of callbacks run.
    pub fn post_event(&mut self, database: &str, name: &str) -> usize {
        let attached: HashSet<SessionHandle> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.database == database && !s.idle)
            .map(|(h, _)| *h)
            .collect();

        for handle in &attached {
            if let Some(session) = self.sessions.get_mut(handle) {
                if session.pending_events.len() >= PENDING_EVENT_LIMIT {
                    session.pending_events.pop_front();
                }
                session.pending_events.push_back(name.to_string());
            }
        }

        let mut fired = 0;
        let mut cancelled = Vec::new();
        for (handle, watcher) in self.watchers.iter_mut() {
            if attached.contains(&watcher.session) && watcher.names.contains(name) {
                fired += 1;
                if !(watcher.callback)(name) {
                    cancelled.push(*handle);
                }
            }
        }
        for handle in cancelled {
            if let Some(watcher) = self.watchers.remove(&handle) {
                self.cancelled_watchers.insert(handle, watcher.session);
            }
        }

        debug!("posted event {} on {}: {} callback(s)", name, database, fired);
        fired
    }

    /// Whether `password` is the current password of `user`
    pub fn verify_user(&self, user: &str, password: &str) -> bool {
        self.users.authenticate(user, password)
    }

    /// Attached sessions, including idle persistent ones
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }

    pub fn open_blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Committed BLOBs in `database`
    pub fn stored_blob_count(&self, database: &str) -> usize {
        self.databases.get(database).map(|db| db.blobs.len()).unwrap_or(0)
    }

    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn record<T>(&self, result: DriverResult<T>) -> DriverResult<T> {
        if let Err(e) = &result {
            trace!("driver call failed: {}", e);
            *self.last_error.borrow_mut() = Some(e.clone());
        }
        result
    }

    fn check_failpoint(&mut self, point: Failpoint) -> DriverResult<()> {
        match self.failpoints.remove(&point) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn session(&self, handle: SessionHandle) -> DriverResult<&Session> {
        self.sessions
            .get(&handle)
            .filter(|s| !s.idle)
            .ok_or_else(|| bad_db_handle(handle))
    }

    fn database_of(&self, handle: SessionHandle) -> DriverResult<&Database> {
        let session = self.session(handle)?;
        let db = self
            .databases
            .get(&session.database)
            .ok_or_else(|| bad_db_handle(handle))?;
        if !db.online {
            return Err(shutdown_error(&session.database));
        }
        Ok(db)
    }

    fn database_of_mut(&mut self, handle: SessionHandle) -> DriverResult<&mut Database> {
        let name = self.session(handle)?.database.clone();
        let db = self
            .databases
            .get_mut(&name)
            .ok_or_else(|| bad_db_handle(handle))?;
        if !db.online {
            return Err(shutdown_error(&name));
        }
        Ok(db)
    }

    fn transaction(&self, handle: TransactionHandle) -> DriverResult<&TxState> {
        self.transactions
            .get(&handle)
            .ok_or_else(|| bad_trans_handle(handle))
    }

    fn attach(&mut self, config: &ConnectionConfig, persistent: bool) -> DriverResult<SessionHandle> {
        self.check_failpoint(Failpoint::Connect)?;

        let db = self.databases.get(&config.database).ok_or_else(|| {
            DriverError::new(
                codes::IO_ERROR,
                format!(
                    "I/O error during \"open\" operation for file \"{}\"\nError while trying to open file",
                    config.database
                ),
            )
        })?;

        let user = config.user.as_deref().unwrap_or_default();
        let password = config.password.as_deref().unwrap_or_default();
        if !self.users.authenticate(user, password) {
            return Err(DriverError::new(
                codes::LOGIN,
                "Your user name and password are not defined. Ask your database administrator to set up a login.",
            ));
        }
        if !db.online {
            return Err(shutdown_error(&config.database));
        }

        let handle = SessionHandle(self.next_handle());
        self.sessions.insert(
            handle,
            Session {
                database: config.database.clone(),
                user: user.to_uppercase(),
                persistent,
                idle: false,
                affected: 0,
                pending_events: VecDeque::new(),
            },
        );
        info!("{} attached to {} as {}", handle, config.database, user.to_uppercase());
        Ok(handle)
    }

    fn reuse_persistent(&mut self, config: &ConnectionConfig) -> DriverResult<SessionHandle> {
        let user = config.user.as_deref().unwrap_or_default().to_uppercase();
        let idle = self
            .sessions
            .iter()
            .filter(|(_, s)| s.persistent && s.idle && s.database == config.database && s.user == user)
            .map(|(h, _)| *h)
            .min();

        let Some(handle) = idle else {
            return self.attach(config, true);
        };

        let password = config.password.as_deref().unwrap_or_default();
        if !self.users.authenticate(&user, password) {
            return Err(DriverError::new(
                codes::LOGIN,
                "Your user name and password are not defined. Ask your database administrator to set up a login.",
            ));
        }
        if let Some(session) = self.sessions.get_mut(&handle) {
            session.idle = false;
            session.affected = 0;
        }
        debug!("reusing persistent {}", handle);
        Ok(handle)
    }

    /// Drops everything opened through `session`; open transactions are rolled back.
    fn release_session_resources(&mut self, session: SessionHandle) {
        self.transactions.retain(|_, tx| tx.session != session);
        self.queries.retain(|_, q| q.session != session);
        self.cursors.retain(|_, c| c.session != session);
        self.blobs.retain(|_, b| b.session() != session);
        self.watchers.retain(|_, w| w.session != session);
        self.cancelled_watchers.retain(|_, s| *s != session);
    }

    fn end_transaction(&mut self, resource: Resource, commit: bool, retain: bool) -> DriverResult<()> {
        self.check_failpoint(if commit { Failpoint::Commit } else { Failpoint::Rollback })?;

        let handle = match resource {
            Resource::Session(session) => {
                // Session-level work is committed as it runs.
                self.session(session)?;
                return Ok(());
            }
            Resource::Transaction(handle) => handle,
        };

        let session = self.transaction(handle)?.session;
        let db_name = self.session(session)?.database.clone();
        let db = self
            .databases
            .get_mut(&db_name)
            .ok_or_else(|| bad_db_handle(session))?;

        if retain {
            let Some(tx) = self.transactions.get_mut(&handle) else {
                return Err(bad_trans_handle(handle));
            };
            if commit {
                apply(db, &tx.tables, &tx.touched);
            }
            tx.tables = db.tables.clone();
            tx.touched.clear();
        } else {
            let Some(tx) = self.transactions.remove(&handle) else {
                return Err(bad_trans_handle(handle));
            };
            if commit {
                apply(db, &tx.tables, &tx.touched);
            }
            for cursor in self.cursors.values_mut().filter(|c| c.transaction == Some(handle)) {
                cursor.open = false;
                cursor.rows.clear();
            }
        }

        debug!(
            "{} {}{}",
            if commit { "committed" } else { "rolled back" },
            handle,
            if retain { " (retaining)" } else { "" }
        );
        Ok(())
    }

    /// Runs a parsed statement in a transaction or, for a session, as its own unit of work.
    fn run_parsed(&mut self, resource: Resource, parsed: &Parsed, args: &[Value]) -> DriverResult<RawExecution> {
        if args.len() != parsed.params {
            return Err(sql::dsql_error(
                -804,
                format!(
                    "Count of parameters mismatch: expected {}, got {}",
                    parsed.params,
                    args.len()
                ),
            ));
        }

        let transaction = match resource {
            Resource::Transaction(handle) => Some(handle),
            Resource::Session(_) => None,
        };
        let (session, outcome) = match resource {
            Resource::Transaction(handle) => {
                let session = self.transaction(handle)?.session;
                let db_name = self.session(session)?.database.clone();
                let db = self
                    .databases
                    .get_mut(&db_name)
                    .ok_or_else(|| bad_db_handle(session))?;
                if !db.online {
                    return Err(shutdown_error(&db_name));
                }
                let tx = self
                    .transactions
                    .get_mut(&handle)
                    .ok_or_else(|| bad_trans_handle(handle))?;

                let read_only = if tx.options.contains(TransactionOptions::READ) {
                    Some(DriverError::new(
                        codes::READ_ONLY_TRANS,
                        "attempted update during read-only transaction",
                    ))
                } else {
                    read_only_database(db, &db_name)
                };
                let mut scope = Scope {
                    tables: &mut tx.tables,
                    touched: &mut tx.touched,
                    generators: &mut db.generators,
                    blobs: &mut db.blobs,
                    read_only,
                };
                let outcome = engine::run(&parsed.command, args, &mut scope)?;
                if let Outcome::Affected(n) = outcome {
                    tx.affected = n;
                }
                (session, outcome)
            }
            Resource::Session(session) => {
                let db_name = self.session(session)?.database.clone();
                let db = self.database_of_mut(session)?;
                let mut tables = db.tables.clone();
                let mut touched = HashSet::new();
                let read_only = read_only_database(db, &db_name);
                let mut scope = Scope {
                    tables: &mut tables,
                    touched: &mut touched,
                    generators: &mut db.generators,
                    blobs: &mut db.blobs,
                    read_only,
                };
                let outcome = engine::run(&parsed.command, args, &mut scope)?;
                apply(db, &tables, &touched);
                if let (Outcome::Affected(n), Some(s)) = (&outcome, self.sessions.get_mut(&session)) {
                    s.affected = *n;
                }
                (session, outcome)
            }
        };

        Ok(match outcome {
            Outcome::Done => RawExecution::Done,
            Outcome::Affected(n) => RawExecution::Affected(n),
            Outcome::Rows { fields, rows } => {
                let handle = CursorHandle(self.next_handle());
                trace!("{} holds {} row(s)", handle, rows.len());
                self.cursors.insert(
                    handle,
                    Cursor {
                        session,
                        transaction,
                        open: true,
                        fields,
                        rows: rows.into(),
                        name: None,
                    },
                );
                RawExecution::Cursor(handle)
            }
        })
    }

    /// Tables visible to a new statement in the given context.
    fn visible_tables(&self, session: SessionHandle, transaction: Option<TransactionHandle>) -> DriverResult<&Tables> {
        match transaction {
            Some(handle) => {
                let tx = self.transaction(handle)?;
                if tx.session != session {
                    return Err(bad_trans_handle(handle));
                }
                Ok(&tx.tables)
            }
            None => Ok(&self.database_of(session)?.tables),
        }
    }

    fn open_blob(&self, handle: BlobHandle) -> DriverResult<&OpenBlob> {
        self.blobs.get(&handle).ok_or_else(|| bad_blob_handle(handle))
    }

    fn cursor(&self, handle: CursorHandle) -> DriverResult<&Cursor> {
        let cursor = self.cursors.get(&handle).ok_or_else(|| bad_req_handle(handle))?;
        self.session(cursor.session)?;
        Ok(cursor)
    }

    fn prepared(&self, handle: QueryHandle) -> DriverResult<&Prepared> {
        let query = self.queries.get(&handle).ok_or_else(|| {
            DriverError::new(codes::BAD_STMT_HANDLE, format!("invalid statement handle {}", handle))
        })?;
        self.session(query.session)?;
        Ok(query)
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes a transaction's changed tables to the database.
fn apply(db: &mut Database, tables: &Tables, touched: &HashSet<String>) {
    for name in touched {
        match tables.get(name) {
            Some(table) => {
                db.tables.insert(name.clone(), table.clone());
            }
            None => {
                db.tables.remove(name);
            }
        }
    }
}

fn read_only_database(db: &Database, name: &str) -> Option<DriverError> {
    db.read_only.then(|| {
        DriverError::new(
            codes::READ_ONLY_DATABASE,
            format!("attempted update on read-only database {}", name),
        )
    })
}

fn bad_db_handle(handle: SessionHandle) -> DriverError {
    DriverError::new(codes::BAD_DB_HANDLE, format!("invalid database handle (no active connection) {}", handle))
}

fn bad_trans_handle(handle: TransactionHandle) -> DriverError {
    DriverError::new(codes::BAD_TRANS_HANDLE, format!("invalid transaction handle (expecting explicit transaction start) {}", handle))
}

fn bad_req_handle(handle: CursorHandle) -> DriverError {
    DriverError::new(codes::BAD_REQ_HANDLE, format!("invalid request handle {}", handle))
}

fn bad_blob_handle(handle: BlobHandle) -> DriverError {
    DriverError::new(codes::BAD_SEGSTR_HANDLE, format!("invalid BLOB handle {}", handle))
}

fn shutdown_error(database: &str) -> DriverError {
    DriverError::new(codes::SHUTDOWN, format!("database {} shutdown", database))
}

fn io_error(detail: impl std::fmt::Display) -> DriverError {
    DriverError::new(codes::IO_ERROR, format!("I/O error: {}", detail))
}

impl Driver for MemoryDriver {
    fn connect(&mut self, config: &ConnectionConfig) -> DriverResult<SessionHandle> {
        let result = self.attach(config, false);
        self.record(result)
    }

    fn pconnect(&mut self, config: &ConnectionConfig) -> DriverResult<SessionHandle> {
        let result = self.reuse_persistent(config);
        self.record(result)
    }

    fn disconnect(&mut self, session: SessionHandle) -> DriverResult<()> {
        let result = (|| -> DriverResult<()> {
            self.check_failpoint(Failpoint::Disconnect)?;
            let persistent = self.session(session)?.persistent;
            self.release_session_resources(session);
            if persistent {
                if let Some(s) = self.sessions.get_mut(&session) {
                    s.idle = true;
                    s.pending_events.clear();
                }
                debug!("{} returned to the persistent pool", session);
            } else {
                self.sessions.remove(&session);
                debug!("{} detached", session);
            }
            Ok(())
        })();
        self.record(result)
    }

    fn drop_database(&mut self, session: SessionHandle) -> DriverResult<()> {
        let result = (|| -> DriverResult<()> {
            let database = self.session(session)?.database.clone();
            let in_use = self
                .sessions
                .iter()
                .any(|(h, s)| *h != session && s.database == database && !s.idle);
            if in_use {
                return Err(DriverError::new(
                    codes::OBJECT_IN_USE,
                    format!("lock time-out on wait transaction\nobject {} is in use", database),
                ));
            }

            self.release_session_resources(session);
            self.sessions.retain(|_, s| s.database != database);
            self.databases.remove(&database);
            info!("dropped database {}", database);
            Ok(())
        })();
        self.record(result)
    }

    fn begin_transaction(&mut self, session: SessionHandle, options: TransactionOptions) -> DriverResult<TransactionHandle> {
        let result = (|| -> DriverResult<TransactionHandle> {
            self.check_failpoint(Failpoint::Begin)?;
            let tables = self.database_of(session)?.tables.clone();
            let handle = TransactionHandle(self.next_handle());
            self.transactions.insert(
                handle,
                TxState {
                    session,
                    options,
                    tables,
                    touched: HashSet::new(),
                    affected: 0,
                },
            );
            debug!("{} started on {}", handle, session);
            Ok(handle)
        })();
        self.record(result)
    }

    fn commit(&mut self, resource: Resource) -> DriverResult<()> {
        let result = self.end_transaction(resource, true, false);
        self.record(result)
    }

    fn commit_retaining(&mut self, resource: Resource) -> DriverResult<()> {
        let result = self.end_transaction(resource, true, true);
        self.record(result)
    }

    fn rollback(&mut self, resource: Resource) -> DriverResult<()> {
        let result = self.end_transaction(resource, false, false);
        self.record(result)
    }

    fn rollback_retaining(&mut self, resource: Resource) -> DriverResult<()> {
        let result = self.end_transaction(resource, false, true);
        self.record(result)
    }

    fn prepare(&mut self, session: SessionHandle, transaction: Option<TransactionHandle>, sql: &str) -> DriverResult<QueryHandle> {
        let result = (|| -> DriverResult<QueryHandle> {
            self.check_failpoint(Failpoint::Prepare)?;
            let parsed = sql::parse(sql)?;
            let tables = self.visible_tables(session, transaction)?;
            engine::validate(&parsed.command, tables)?;
            let params = engine::describe_params(&parsed.command, parsed.params, tables);

            let handle = QueryHandle(self.next_handle());
            self.queries.insert(
                handle,
                Prepared {
                    session,
                    transaction,
                    parsed,
                    params,
                },
            );
            Ok(handle)
        })();
        self.record(result)
    }

    fn execute(&mut self, query: QueryHandle, args: &[Value]) -> DriverResult<RawExecution> {
        let result = (|| -> DriverResult<RawExecution> {
            self.check_failpoint(Failpoint::Execute)?;
            let prepared = self.prepared(query)?;
            let resource = match prepared.transaction {
                Some(tx) => Resource::Transaction(tx),
                None => Resource::Session(prepared.session),
            };
            let parsed = prepared.parsed.clone();
            self.run_parsed(resource, &parsed, args)
        })();
        self.record(result)
    }

    fn free_query(&mut self, query: QueryHandle) -> DriverResult<()> {
        let result = self
            .queries
            .remove(&query)
            .map(|_| ())
            .ok_or_else(|| DriverError::new(codes::BAD_STMT_HANDLE, format!("invalid statement handle {}", query)));
        self.record(result)
    }

    fn num_params(&self, query: QueryHandle) -> DriverResult<usize> {
        let result = self.prepared(query).map(|q| q.parsed.params);
        self.record(result)
    }

    fn param_info(&self, query: QueryHandle, position: usize) -> DriverResult<ParamInfo> {
        let result = self.prepared(query).and_then(|q| {
            q.params.get(position).cloned().ok_or_else(|| {
                sql::dsql_error(-804, format!("parameter {} out of range (statement has {})", position, q.params.len()))
            })
        });
        self.record(result)
    }

    fn query(&mut self, resource: Resource, sql: &str, args: &[Value]) -> DriverResult<RawExecution> {
        let result = (|| -> DriverResult<RawExecution> {
            self.check_failpoint(Failpoint::Execute)?;
            let parsed = sql::parse(sql)?;
            self.run_parsed(resource, &parsed, args)
        })();
        self.record(result)
    }

    fn affected_rows(&self, resource: Resource) -> DriverResult<u64> {
        let result = match resource {
            Resource::Session(session) => self.session(session).map(|s| s.affected),
            Resource::Transaction(handle) => self.transaction(handle).map(|tx| tx.affected),
        };
        self.record(result)
    }

    fn fetch(&mut self, cursor: CursorHandle, flags: FetchFlags) -> DriverResult<Option<Vec<Value>>> {
        let result = (|| -> DriverResult<Option<Vec<Value>>> {
            self.check_failpoint(Failpoint::Fetch)?;
            let state = self.cursor(cursor)?;
            if !state.open {
                return Err(DriverError::new(
                    codes::DSQL_CURSOR_ERR,
                    format!("Dynamic SQL Error\nSQL error code = -504\nCursor is not open\n{}", cursor),
                ));
            }
            let session = state.session;
            let Some(mut row) = self.cursors.get_mut(&cursor).and_then(|c| c.rows.pop_front()) else {
                return Ok(None);
            };

            if flags.contains(FetchFlags::TEXT_BLOBS) {
                let db = self.database_of(session)?;
                let blob_fields: Vec<usize> = self
                    .cursor(cursor)?
                    .fields
                    .iter()
                    .enumerate()
                    .filter(|(_, f)| f.field_type.is_blob())
                    .map(|(i, _)| i)
                    .collect();
                for index in blob_fields {
                    if let Some(&Value::Blob(id)) = row.get(index) {
                        let data = db.blobs.read(id)?;
                        row[index] = Value::Bytes(data);
                    }
                }
            }
            Ok(Some(row))
        })();
        self.record(result)
    }

    fn field_info(&self, cursor: CursorHandle, index: usize) -> DriverResult<FieldInfo> {
        let result = self.cursor(cursor).and_then(|c| {
            c.fields.get(index).cloned().ok_or_else(|| {
                sql::dsql_error(-804, format!("field {} out of range (cursor has {})", index, c.fields.len()))
            })
        });
        self.record(result)
    }

    fn num_fields(&self, cursor: CursorHandle) -> DriverResult<usize> {
        let result = self.cursor(cursor).map(|c| c.fields.len());
        self.record(result)
    }

    fn name_result(&mut self, cursor: CursorHandle, name: &str) -> DriverResult<()> {
        let result = (|| -> DriverResult<()> {
            let session = self.cursor(cursor)?.session;
            let taken = self
                .cursors
                .iter()
                .any(|(h, c)| *h != cursor && c.session == session && c.name.as_deref() == Some(name));
            if taken {
                return Err(sql::dsql_error(-502, format!("Attempt to reopen an open cursor {}", name)));
            }
            if let Some(c) = self.cursors.get_mut(&cursor) {
                c.name = Some(name.to_string());
            }
            Ok(())
        })();
        self.record(result)
    }

    fn free_result(&mut self, cursor: CursorHandle) -> DriverResult<()> {
        let result = (|| -> DriverResult<()> {
            self.check_failpoint(Failpoint::FreeResult)?;
            self.cursors
                .remove(&cursor)
                .map(|_| ())
                .ok_or_else(|| bad_req_handle(cursor))
        })();
        self.record(result)
    }

    fn blob_create(&mut self, session: SessionHandle) -> DriverResult<BlobHandle> {
        let result = (|| -> DriverResult<BlobHandle> {
            self.database_of(session)?;
            let handle = BlobHandle(self.next_handle());
            self.blobs.insert(
                handle,
                OpenBlob::Write {
                    session,
                    segments: Vec::new(),
                },
            );
            Ok(handle)
        })();
        self.record(result)
    }

    fn blob_open(&mut self, session: SessionHandle, id: BlobId) -> DriverResult<BlobHandle> {
        let result = (|| -> DriverResult<BlobHandle> {
            self.check_failpoint(Failpoint::BlobOpen)?;
            let data = self.database_of(session)?.blobs.read(id)?;
            let handle = BlobHandle(self.next_handle());
            self.blobs.insert(
                handle,
                OpenBlob::Read {
                    session,
                    id,
                    data,
                    pos: 0,
                },
            );
            Ok(handle)
        })();
        self.record(result)
    }

    fn blob_add(&mut self, blob: BlobHandle, data: &[u8]) -> DriverResult<()> {
        let result = (|| -> DriverResult<()> {
            self.session(self.open_blob(blob)?.session())?;
            match self.blobs.get_mut(&blob) {
                Some(OpenBlob::Write { segments, .. }) => {
                    segments.extend(data.chunks(MAX_SEGMENT).map(<[u8]>::to_vec));
                    Ok(())
                }
                _ => Err(bad_blob_handle(blob)),
            }
        })();
        self.record(result)
    }

    fn blob_get(&mut self, blob: BlobHandle, len: usize) -> DriverResult<Vec<u8>> {
        let result = (|| -> DriverResult<Vec<u8>> {
            self.session(self.open_blob(blob)?.session())?;
            match self.blobs.get_mut(&blob) {
                Some(OpenBlob::Read { data, pos, .. }) => {
                    let end = data.len().min(pos.saturating_add(len));
                    let chunk = data[*pos..end].to_vec();
                    *pos = end;
                    Ok(chunk)
                }
                _ => Err(bad_blob_handle(blob)),
            }
        })();
        self.record(result)
    }

    fn blob_close(&mut self, blob: BlobHandle) -> DriverResult<BlobId> {
        let result = (|| -> DriverResult<BlobId> {
            self.check_failpoint(Failpoint::BlobClose)?;
            let session = self.open_blob(blob)?.session();
            self.database_of(session)?;
            match self.blobs.remove(&blob) {
                Some(OpenBlob::Write { segments, .. }) => {
                    let db = self.database_of_mut(session)?;
                    let id = db.blobs.insert(segments);
                    debug!("stored {} from {}", id, blob);
                    Ok(id)
                }
                Some(OpenBlob::Read { id, .. }) => Ok(id),
                None => Err(bad_blob_handle(blob)),
            }
        })();
        self.record(result)
    }

    fn blob_cancel(&mut self, blob: BlobHandle) -> DriverResult<()> {
        let result = self
            .blobs
            .remove(&blob)
            .map(|_| ())
            .ok_or_else(|| bad_blob_handle(blob));
        self.record(result)
    }

    fn blob_info(&self, session: SessionHandle, id: BlobId) -> DriverResult<BlobInfo> {
        let result = self.database_of(session).and_then(|db| db.blobs.info(id));
        self.record(result)
    }

    fn blob_echo(&self, session: SessionHandle, id: BlobId, out: &mut dyn Write) -> DriverResult<()> {
        let result = self
            .database_of(session)
            .and_then(|db| db.blobs.read(id))
            .and_then(|data| out.write_all(&data).and_then(|_| out.flush()).map_err(io_error));
        self.record(result)
    }

    fn blob_import(&mut self, session: SessionHandle, source: &mut dyn Read) -> DriverResult<BlobId> {
        let result = (|| -> DriverResult<BlobId> {
            self.database_of(session)?;
            let mut data = Vec::new();
            source.read_to_end(&mut data).map_err(io_error)?;
            let id = self.database_of_mut(session)?.blobs.insert_bytes(&data);
            debug!("imported {} byte(s) as {}", data.len(), id);
            Ok(id)
        })();
        self.record(result)
    }

    fn gen_id(&mut self, session: SessionHandle, generator: &str, increment: i64) -> DriverResult<i64> {
        let result = (|| -> DriverResult<i64> {
            let name = generator.to_uppercase();
            let db = self.database_of_mut(session)?;
            if increment != 0 && db.read_only {
                return Err(DriverError::new(codes::READ_ONLY_DATABASE, "attempted update on read-only database"));
            }
            let value = db
                .generators
                .get_mut(&name)
                .ok_or_else(|| engine::generator_error(&name))?;
            *value = value
                .checked_add(increment)
                .ok_or_else(|| DriverError::new(codes::ARITH_EXCEPT, "arithmetic exception: generator overflow"))?;
            Ok(*value)
        })();
        self.record(result)
    }

    fn set_event_handler(&mut self, session: SessionHandle, names: &EventNames, callback: EventCallback) -> DriverResult<EventHandle> {
        let result = (|| -> DriverResult<EventHandle> {
            self.database_of(session)?;
            let handle = EventHandle(self.next_handle());
            self.watchers.insert(
                handle,
                Watcher {
                    session,
                    names: names.clone(),
                    callback,
                },
            );
            Ok(handle)
        })();
        self.record(result)
    }

    fn wait_event(&mut self, session: SessionHandle, names: &EventNames) -> DriverResult<String> {
        let result = (|| -> DriverResult<String> {
            self.database_of(session)?;
            let s = self
                .sessions
                .get_mut(&session)
                .ok_or_else(|| bad_db_handle(session))?;
            let position = s.pending_events.iter().position(|n| names.contains(n));
            position
                .and_then(|i| s.pending_events.remove(i))
                .ok_or_else(|| {
                    DriverError::new(
                        codes::EVENT_NOT_POSTED,
                        format!("none of {} event(s) has been posted", names.len()),
                    )
                })
        })();
        self.record(result)
    }

    fn free_event_handler(&mut self, handle: EventHandle) -> DriverResult<()> {
        let result = if self.watchers.remove(&handle).is_some() || self.cancelled_watchers.remove(&handle).is_some() {
            Ok(())
        } else {
            Err(DriverError::new(codes::BAD_EVENT_HANDLE, format!("invalid event handle {}", handle)))
        };
        self.record(result)
    }

    fn service_attach(&mut self, host: &str, user: &str, password: &str) -> DriverResult<ServiceHandle> {
        let result = self.attach_service(host, user, password);
        self.record(result)
    }

    fn service_detach(&mut self, service: ServiceHandle) -> DriverResult<()> {
        let result = self.detach_service(service);
        self.record(result)
    }

    fn add_user(&mut self, service: ServiceHandle, user: &UserSpec) -> DriverResult<ServiceReply> {
        let result = self.service_user_add(service, user);
        self.record(result)
    }

    fn modify_user(&mut self, service: ServiceHandle, user: &UserSpec) -> DriverResult<ServiceReply> {
        let result = self.service_user_modify(service, user);
        self.record(result)
    }

    fn delete_user(&mut self, service: ServiceHandle, user_name: &str) -> DriverResult<ServiceReply> {
        let result = self.service_user_delete(service, user_name);
        self.record(result)
    }

    fn backup(
        &mut self,
        service: ServiceHandle,
        source_db: &str,
        dest_file: &str,
        options: BackupOptions,
        verbose: bool,
    ) -> DriverResult<ServiceReply> {
        let result = self.service_backup(service, source_db, dest_file, options, verbose);
        self.record(result)
    }

    fn restore(
        &mut self,
        service: ServiceHandle,
        source_file: &str,
        dest_db: &str,
        options: BackupOptions,
        verbose: bool,
    ) -> DriverResult<ServiceReply> {
        let result = self.service_restore(service, source_file, dest_db, options, verbose);
        self.record(result)
    }

    fn maintain_db(&mut self, service: ServiceHandle, db: &str, action: MaintenanceAction, argument: i64) -> DriverResult<ServiceReply> {
        let result = self.service_maintain(service, db, action, argument);
        self.record(result)
    }

    fn db_info(&mut self, service: ServiceHandle, db: &str, action: DbInfoAction, argument: i64) -> DriverResult<ServiceReply> {
        let result = self.service_db_info(service, db, action, argument);
        self.record(result)
    }

    fn server_info(&mut self, service: ServiceHandle, action: ServerInfoAction) -> DriverResult<ServiceReply> {
        let result = self.service_server_info(service, action);
        self.record(result)
    }

    fn last_error(&self) -> Option<DriverError> {
        self.last_error.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("test.fdb").credentials(ADMIN_USER, ADMIN_PASSWORD)
    }

    #[test]
    fn test_transaction_isolation_and_commit() {
        let mut driver = MemoryDriver::with_database("test.fdb");
        let session = driver.connect(&config()).unwrap();
        driver
            .query(Resource::Session(session), "CREATE TABLE t (id INTEGER)", &[])
            .unwrap();

        let tx = driver.begin_transaction(session, TransactionOptions::empty()).unwrap();
        driver
            .query(Resource::Transaction(tx), "INSERT INTO t VALUES (1)", &[])
            .unwrap();
        assert_eq!(driver.databases["test.fdb"].row_count(), 0);

        driver.commit(Resource::Transaction(tx)).unwrap();
        assert_eq!(driver.databases["test.fdb"].row_count(), 1);
        assert!(driver.commit(Resource::Transaction(tx)).is_err());
    }

    #[test]
    fn test_rollback_retaining_discards_work() {
        let mut driver = MemoryDriver::with_database("test.fdb");
        let session = driver.connect(&config()).unwrap();
        driver
            .query(Resource::Session(session), "CREATE TABLE t (id INTEGER)", &[])
            .unwrap();

        let tx = driver.begin_transaction(session, TransactionOptions::empty()).unwrap();
        driver
            .query(Resource::Transaction(tx), "INSERT INTO t VALUES (1)", &[])
            .unwrap();
        driver.rollback_retaining(Resource::Transaction(tx)).unwrap();
        driver
            .query(Resource::Transaction(tx), "INSERT INTO t VALUES (2)", &[])
            .unwrap();
        driver.commit_retaining(Resource::Transaction(tx)).unwrap();

        assert_eq!(driver.databases["test.fdb"].row_count(), 1);
        assert_eq!(driver.transaction_count(), 1);
    }

    #[test]
    fn test_transaction_end_closes_its_cursors() {
        let mut driver = MemoryDriver::with_database("test.fdb");
        let session = driver.connect(&config()).unwrap();
        driver
            .query(Resource::Session(session), "CREATE TABLE t (id INTEGER)", &[])
            .unwrap();
        driver
            .query(Resource::Session(session), "INSERT INTO t VALUES (1), (2)", &[])
            .unwrap();

        let tx = driver.begin_transaction(session, TransactionOptions::empty()).unwrap();
        let RawExecution::Cursor(cursor) = driver.query(Resource::Transaction(tx), "SELECT id FROM t", &[]).unwrap() else {
            panic!("expected a cursor");
        };
        let RawExecution::Cursor(session_cursor) = driver.query(Resource::Session(session), "SELECT id FROM t", &[]).unwrap() else {
            panic!("expected a cursor");
        };

        // retaining keeps the cursor usable
        driver.commit_retaining(Resource::Transaction(tx)).unwrap();
        assert!(driver.fetch(cursor, FetchFlags::empty()).unwrap().is_some());

        driver.commit(Resource::Transaction(tx)).unwrap();
        let err = driver.fetch(cursor, FetchFlags::empty()).unwrap_err();
        assert_eq!(err.code, Some(codes::DSQL_CURSOR_ERR));
        assert!(driver.fetch(session_cursor, FetchFlags::empty()).unwrap().is_some());

        driver.free_result(cursor).unwrap();
        assert_eq!(driver.cursor_count(), 1);
    }

    #[test]
    fn test_read_only_transaction() {
        let mut driver = MemoryDriver::with_database("test.fdb");
        let session = driver.connect(&config()).unwrap();
        driver
            .query(Resource::Session(session), "CREATE TABLE t (id INTEGER)", &[])
            .unwrap();

        let tx = driver.begin_transaction(session, TransactionOptions::READ).unwrap();
        let err = driver
            .query(Resource::Transaction(tx), "INSERT INTO t VALUES (1)", &[])
            .unwrap_err();
        assert_eq!(err.code, Some(codes::READ_ONLY_TRANS));
        assert_eq!(driver.last_error(), Some(err));
    }

    #[test]
    fn test_parameter_count_must_match() {
        let mut driver = MemoryDriver::with_database("test.fdb");
        let session = driver.connect(&config()).unwrap();
        driver
            .query(Resource::Session(session), "CREATE TABLE t (id INTEGER)", &[])
            .unwrap();

        let err = driver
            .query(Resource::Session(session), "INSERT INTO t VALUES (?)", &[])
            .unwrap_err();
        assert_eq!(err.code, Some(codes::DSQL_ERROR));
    }

    #[test]
    fn test_prepare_checks_tables() {
        let mut driver = MemoryDriver::with_database("test.fdb");
        let session = driver.connect(&config()).unwrap();
        let err = driver.prepare(session, None, "SELECT * FROM missing").unwrap_err();
        assert_eq!(err.code, Some(codes::DSQL_RELATION_ERR));
    }

    #[test]
    fn test_fetch_exhaustion_and_text_blobs() {
        let mut driver = MemoryDriver::with_database("test.fdb");
        let session = driver.connect(&config()).unwrap();
        driver
            .query(Resource::Session(session), "CREATE TABLE d (body BLOB)", &[])
            .unwrap();
        driver
            .query(Resource::Session(session), "INSERT INTO d VALUES ('text')", &[])
            .unwrap();

        let RawExecution::Cursor(cursor) = driver
            .query(Resource::Session(session), "SELECT body FROM d", &[])
            .unwrap()
        else {
            panic!("expected a cursor");
        };
        let row = driver.fetch(cursor, FetchFlags::TEXT_BLOBS).unwrap().unwrap();
        assert_eq!(row, vec![Value::Bytes(b"text".to_vec())]);
        assert_eq!(driver.fetch(cursor, FetchFlags::empty()).unwrap(), None);
        assert_eq!(driver.last_error(), None);
    }

    #[test]
    fn test_disconnect_releases_resources() {
        let mut driver = MemoryDriver::with_database("test.fdb");
        let session = driver.connect(&config()).unwrap();
        driver.begin_transaction(session, TransactionOptions::empty()).unwrap();
        driver.blob_create(session).unwrap();

        driver.disconnect(session).unwrap();
        assert_eq!(driver.session_count(), 0);
        assert_eq!(driver.transaction_count(), 0);
        assert_eq!(driver.open_blob_count(), 0);
        assert!(driver.disconnect(session).is_err());
    }

    #[test]
    fn test_drop_database_in_use() {
        let mut driver = MemoryDriver::with_database("test.fdb");
        let first = driver.connect(&config()).unwrap();
        let second = driver.connect(&config()).unwrap();

        let err = driver.drop_database(first).unwrap_err();
        assert_eq!(err.code, Some(codes::OBJECT_IN_USE));

        driver.disconnect(second).unwrap();
        driver.drop_database(first).unwrap();
        assert!(!driver.has_database("test.fdb"));
        assert_eq!(driver.session_count(), 0);
    }

    #[test]
    fn test_failpoint_fires_once() {
        let mut driver = MemoryDriver::with_database("test.fdb");
        driver.fail_next(Failpoint::Connect, DriverError::new(codes::IO_ERROR, "network down"));

        assert!(driver.connect(&config()).is_err());
        assert!(driver.connect(&config()).is_ok());
    }

    #[test]
    fn test_create_database() {
        let mut driver = MemoryDriver::new();
        driver.create_database("new.fdb").unwrap();
        assert!(driver.create_database("new.fdb").is_err());
        assert!(driver.has_database("new.fdb"));
    }
}
