pub mod table;

pub use table::QueryResult;

use crate::blob::Blob;
use crate::connection::Link;
use crate::core::{BlobId, FetchFlags, FieldInfo, Result, Value};
use crate::driver::{CursorHandle, RawExecution};
use indexmap::IndexMap;
use log::{debug, trace, warn};
use std::fmt;
use std::ops::Index;
use std::rc::Rc;

/// Outcome of executing a query or prepared statement
#[derive(Debug)]
pub enum Execution {
    /// The statement produced no result (DDL and the like)
    NoResult,
    /// A single value, the affected-row count for data-modifying statements
    Scalar(Value),
    /// The statement produced rows
    Cursor(ResultSet),
}

/// Affected-row count as a SQL integer, saturating at `i64::MAX`.
fn affected_count(n: u64) -> Value {
    Value::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

impl Execution {
    pub(crate) fn from_raw(link: &Rc<Link>, raw: RawExecution) -> Result<Self> {
        Ok(match raw {
            RawExecution::Done => Self::NoResult,
            RawExecution::Affected(n) => Self::Scalar(affected_count(n)),
            RawExecution::Cursor(cursor) => Self::Cursor(ResultSet::new(Rc::clone(link), cursor)?),
        })
    }

    pub fn into_result_set(self) -> Option<ResultSet> {
        match self {
            Self::Cursor(rs) => Some(rs),
            _ => None,
        }
    }

    pub fn scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// Affected-row count of a data-modifying statement
    pub fn affected(&self) -> Option<u64> {
        self.scalar()
            .and_then(Value::as_i64)
            .and_then(|n| u64::try_from(n).ok())
    }

    pub fn is_cursor(&self) -> bool {
        matches!(self, Self::Cursor(_))
    }
}

/// One column of a fetched row: a plain value or an opened BLOB
#[derive(Debug)]
pub enum Cell {
    Value(Value),
    Blob(Blob),
}

impl Cell {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Blob(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Blob(_) => None,
        }
    }

    pub fn blob(&self) -> Option<&Blob> {
        match self {
            Self::Blob(b) => Some(b),
            Self::Value(_) => None,
        }
    }

    pub fn blob_mut(&mut self) -> Option<&mut Blob> {
        match self {
            Self::Blob(b) => Some(b),
            Self::Value(_) => None,
        }
    }

    pub fn into_blob(self) -> Option<Blob> {
        match self {
            Self::Blob(b) => Some(b),
            Self::Value(_) => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Value(Value::Null))
    }

    pub fn is_blob(&self) -> bool {
        matches!(self, Self::Blob(_))
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.value().and_then(Value::as_i64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value().and_then(Value::as_f64)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value().and_then(Value::as_str)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        self.value().and_then(Value::as_bytes)
    }

    /// The BLOB locator, whether or not the column was opened
    pub fn blob_id(&self) -> Option<BlobId> {
        match self {
            Self::Value(v) => v.as_blob_id(),
            Self::Blob(b) => b.id(),
        }
    }
}

impl PartialEq<Value> for Cell {
    fn eq(&self, other: &Value) -> bool {
        self.value() == Some(other)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{}", v),
            Self::Blob(b) => match b.id() {
                Some(id) => write!(f, "<blob {}>", id),
                None => write!(f, "<blob>"),
            },
        }
    }
}

/// Row keyed by column alias, in column order
pub type AssocRow = IndexMap<String, Cell>;

/// Row with attribute-style access by column alias
#[derive(Debug)]
pub struct ObjectRow {
    fields: AssocRow,
}

impl ObjectRow {
    pub fn get(&self, name: &str) -> Option<&Cell> {
        self.fields.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cell> {
        self.fields.get_mut(name)
    }

    /// Remove the cell, e.g. to take ownership of an opened BLOB
    pub fn take(&mut self, name: &str) -> Option<Cell> {
        self.fields.shift_remove(name)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Cell::as_i64)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Cell::as_f64)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Cell::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn into_assoc(self) -> AssocRow {
        self.fields
    }
}

impl Index<&str> for ObjectRow {
    type Output = Cell;

    fn index(&self, name: &str) -> &Cell {
        &self.fields[name]
    }
}

/// A BLOB-typed column, found when the result set was created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobColumn {
    pub index: usize,
    pub alias: String,
}

/// Cursor over the rows of an executed query
///
/// BLOB columns are detected once, when the result set is created. Unless
/// the fetch flags say otherwise, every non-null value in such a column is
/// replaced with a [`Blob`] opened for reading.
pub struct ResultSet {
    link: Rc<Link>,
    cursor: CursorHandle,
    fields: Vec<FieldInfo>,
    blob_columns: Vec<BlobColumn>,
}

impl ResultSet {
    pub(crate) fn new(link: Rc<Link>, cursor: CursorHandle) -> Result<Self> {
        let mut rs = Self {
            link,
            cursor,
            fields: Vec::new(),
            blob_columns: Vec::new(),
        };

        let count = rs.link.call(|d| d.num_fields(cursor))?;
        for index in 0..count {
            let info = rs.link.call(|d| d.field_info(cursor, index))?;
            if info.field_type.is_blob() {
                rs.blob_columns.push(BlobColumn {
                    index,
                    alias: info.alias.clone(),
                });
            }
            rs.fields.push(info);
        }

        debug!(
            "opened {} with {} field(s), {} blob column(s)",
            cursor,
            rs.fields.len(),
            rs.blob_columns.len()
        );
        Ok(rs)
    }

    pub fn handle(&self) -> CursorHandle {
        self.cursor
    }

    /// Field metadata captured when the result set was created
    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    pub fn blob_columns(&self) -> &[BlobColumn] {
        &self.blob_columns
    }

    fn is_blob_column(&self, index: usize) -> bool {
        self.blob_columns.iter().any(|c| c.index == index)
    }

    fn fetch_values(&mut self, flags: FetchFlags) -> Result<Option<Vec<Value>>> {
        self.link.session()?;
        let cursor = self.cursor;
        let row = self.link.call(|d| d.fetch(cursor, flags))?;
        trace!("fetch on {}: {:?}", cursor, row);
        Ok(row)
    }

    fn materialize(&self, values: Vec<Value>, flags: FetchFlags) -> Result<Vec<Cell>> {
        let open = flags.opens_blobs();
        values
            .into_iter()
            .enumerate()
            .map(|(index, value)| match value {
                Value::Blob(id) if open && self.is_blob_column(index) => {
                    Blob::open(Rc::clone(&self.link), id).map(Cell::Blob)
                }
                value => Ok(Cell::Value(value)),
            })
            .collect()
    }

    /// Fetch the next row as a positional vector
    ///
    /// Returns `Ok(None)` at the end of data.
    pub fn fetch_row(&mut self, flags: FetchFlags) -> Result<Option<Vec<Cell>>> {
        match self.fetch_values(flags)? {
            Some(values) => self.materialize(values, flags).map(Some),
            None => Ok(None),
        }
    }

    /// Fetch the next row keyed by column alias
    pub fn fetch_assoc(&mut self, flags: FetchFlags) -> Result<Option<AssocRow>> {
        let Some(cells) = self.fetch_row(flags)? else {
            return Ok(None);
        };
        Ok(Some(
            self.fields
                .iter()
                .map(|f| f.alias.clone())
                .zip(cells)
                .collect(),
        ))
    }

    /// Fetch the next row with attribute-style access
    pub fn fetch_object(&mut self, flags: FetchFlags) -> Result<Option<ObjectRow>> {
        Ok(self.fetch_assoc(flags)?.map(|fields| ObjectRow { fields }))
    }

    /// Metadata of the field at `index`, as reported by the driver
    pub fn field_info(&self, index: usize) -> Result<FieldInfo> {
        self.link.session()?;
        self.link.call(|d| d.field_info(self.cursor, index))
    }

    pub fn num_fields(&self) -> Result<usize> {
        self.link.session()?;
        self.link.call(|d| d.num_fields(self.cursor))
    }

    /// Give the cursor a name, for positioned updates
    pub fn name_result(&mut self, name: &str) -> Result<()> {
        self.link.session()?;
        let cursor = self.cursor;
        self.link.call(|d| d.name_result(cursor, name))
    }
}

impl Iterator for ResultSet {
    type Item = Result<Vec<Cell>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.fetch_row(FetchFlags::empty()).transpose()
    }
}

impl Drop for ResultSet {
    fn drop(&mut self) {
        if !self.link.is_open() {
            return;
        }
        let cursor = self.cursor;
        if let Err(e) = self.link.call(|d| d.free_result(cursor)) {
            warn!("freeing {} failed: {}", cursor, e);
        }
    }
}

impl fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSet")
            .field("cursor", &self.cursor)
            .field("fields", &self.fields)
            .field("blob_columns", &self.blob_columns)
            .finish()
    }
}
