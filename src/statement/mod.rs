use crate::connection::Link;
use crate::core::{Error, ParamInfo, Result, UsageError, Value};
use crate::driver::QueryHandle;
use crate::result::Execution;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::rc::Rc;

/// A prepared query
///
/// Parameters are bound by 1-based position and kept until [`Statement::clear`].
/// The statement does not keep its connection alive; once the connection is
/// closed every call fails with `ConnectionClosed`.
pub struct Statement {
    link: Rc<Link>,
    handle: QueryHandle,
    params: BTreeMap<usize, Value>,
}

impl Statement {
    pub(crate) fn new(link: Rc<Link>, handle: QueryHandle) -> Self {
        debug!("prepared {}", handle);
        Self {
            link,
            handle,
            params: BTreeMap::new(),
        }
    }

    pub fn handle(&self) -> QueryHandle {
        self.handle
    }

    /// Bind a copy of `value` at `position` (1-based)
    pub fn bind_param(&mut self, position: i64, value: &Value) -> Result<()> {
        self.bind_value(position, value.clone())
    }

    /// Bind `value` at `position` (1-based)
    ///
    /// A position below 1 is rejected and leaves the bindings untouched.
    pub fn bind_value(&mut self, position: i64, value: impl Into<Value>) -> Result<()> {
        let index = usize::try_from(position)
            .ok()
            .filter(|p| *p >= 1)
            .ok_or(Error::Usage(UsageError::InvalidPosition(position)))?;
        self.params.insert(index, value.into());
        Ok(())
    }

    /// Remove all bound parameters
    pub fn clear(&mut self) {
        self.params.clear();
    }

    /// Currently bound parameters in position order
    pub fn bound(&self) -> impl Iterator<Item = (usize, &Value)> {
        self.params.iter().map(|(p, v)| (*p, v))
    }

    /// Bound values as a contiguous argument list.
    fn args(&self) -> Result<Vec<Value>> {
        let mut args = Vec::with_capacity(self.params.len());
        for (expected, (position, value)) in (1..).zip(&self.params) {
            if *position != expected {
                return Err(Error::Usage(UsageError::MissingParameter(expected)));
            }
            args.push(value.clone());
        }
        Ok(args)
    }

    /// Execute with the bound parameters
    pub fn execute(&mut self) -> Result<Execution> {
        let args = self.args()?;
        self.execute_with_args(&args)
    }

    /// Execute with an explicit argument list, ignoring bound parameters
    pub fn execute_with_args(&mut self, args: &[Value]) -> Result<Execution> {
        self.link.session()?;
        let handle = self.handle;
        let raw = self.link.call(|d| d.execute(handle, args))?;
        Execution::from_raw(&self.link, raw)
    }

    /// Number of placeholders in the statement
    pub fn num_params(&self) -> Result<usize> {
        self.link.session()?;
        self.link.call(|d| d.num_params(self.handle))
    }

    /// Metadata for the placeholder at `position` (0-based, as the driver numbers them)
    pub fn param_info(&self, position: usize) -> Result<ParamInfo> {
        self.link.session()?;
        self.link.call(|d| d.param_info(self.handle, position))
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        if !self.link.is_open() {
            return;
        }
        let handle = self.handle;
        if let Err(e) = self.link.call(|d| d.free_query(handle)) {
            warn!("freeing {} failed: {}", handle, e);
        }
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("handle", &self.handle)
            .field("params", &self.params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::core::{FieldType, UsageError, Value};
    use crate::driver::memory::MemoryDriver;
    use crate::{Connection, ConnectionConfig};

    fn setup() -> Connection {
        let driver = MemoryDriver::with_database("employee.fdb").into_shared();
        let mut conn = Connection::open(driver, ConnectionConfig::default()).unwrap();
        conn.query("CREATE TABLE users (id INTEGER, name VARCHAR(40), bio BLOB)").unwrap();
        conn
    }

    #[test]
    fn test_bind_rejects_non_positive_positions() {
        let mut conn = setup();
        let mut stmt = conn.prepare("INSERT INTO users VALUES (?, ?, ?)").unwrap();

        let err = stmt.bind_value(0, 1).unwrap_err();
        assert_eq!(err.as_usage(), Some(&UsageError::InvalidPosition(0)));
        assert_eq!(err.code(), Some(5));
        assert!(stmt.bind_value(-3, 1).is_err());
        assert_eq!(stmt.bound().count(), 0);

        stmt.bind_value(1, 42).unwrap();
        assert_eq!(stmt.bound().collect::<Vec<_>>(), vec![(1, &Value::Integer(42))]);
    }

    #[test]
    fn test_clear_removes_bindings() {
        let mut conn = setup();
        let mut stmt = conn.prepare("SELECT * FROM users WHERE id = ?").unwrap();

        stmt.bind_value(1, 1).unwrap();
        stmt.clear();
        assert_eq!(stmt.bound().count(), 0);
    }

    #[test]
    fn test_execute_with_gap_is_rejected() {
        let mut conn = setup();
        let mut stmt = conn.prepare("INSERT INTO users VALUES (?, ?, ?)").unwrap();

        stmt.bind_value(1, 1).unwrap();
        stmt.bind_value(3, Value::Null).unwrap();
        let err = stmt.execute().unwrap_err();
        assert_eq!(err.as_usage(), Some(&UsageError::MissingParameter(2)));
    }

    #[test]
    fn test_execute_dml_reports_affected_rows() {
        let mut conn = setup();
        let mut stmt = conn.prepare("INSERT INTO users VALUES (?, ?, ?)").unwrap();

        stmt.bind_value(1, 1).unwrap();
        stmt.bind_value(2, "Alice").unwrap();
        stmt.bind_value(3, Value::Null).unwrap();
        let affected = stmt.execute().unwrap().scalar().cloned();
        assert_eq!(affected, Some(Value::Integer(1)));

        let affected = stmt
            .execute_with_args(&[2.into(), "Bob".into(), Value::Null])
            .unwrap()
            .scalar()
            .cloned();
        assert_eq!(affected, Some(Value::Integer(1)));
        assert_eq!(conn.affected_rows().unwrap(), 1);
    }

    #[test]
    fn test_param_metadata() {
        let mut conn = setup();
        let stmt = conn.prepare("INSERT INTO users (id, bio) VALUES (?, ?)").unwrap();

        assert_eq!(stmt.num_params().unwrap(), 2);
        assert_eq!(stmt.param_info(0).unwrap().field_type, FieldType::Integer);
        assert_eq!(stmt.param_info(1).unwrap().field_type, FieldType::Blob);
        assert!(stmt.param_info(2).unwrap_err().is_driver());
    }

    #[test]
    fn test_statement_fails_after_connection_close() {
        let mut conn = setup();
        let mut stmt = conn.prepare("SELECT * FROM users").unwrap();
        conn.close().unwrap();

        let err = stmt.execute().unwrap_err();
        assert_eq!(err.as_usage(), Some(&UsageError::ConnectionClosed));
        assert!(stmt.num_params().is_err());
    }
}
