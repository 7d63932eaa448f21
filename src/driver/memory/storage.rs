use crate::core::{BlobId, BlobInfo, DriverError, DriverResult, FieldType, Value};
use crate::driver::memory::codes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum size of one stored BLOB segment.
pub const MAX_SEGMENT: usize = 65535;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub field_type: FieldType,
    pub length: usize,
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub rows: im::Vector<Vec<Value>>,
}

impl Table {
    pub fn new(name: String, columns: Vec<ColumnDef>) -> Self {
        Self {
            name,
            columns,
            rows: im::Vector::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> DriverResult<(usize, &ColumnDef)> {
        self.column_index(name)
            .map(|i| (i, &self.columns[i]))
            .ok_or_else(|| {
                DriverError::new(
                    codes::DSQL_FIELD_ERR,
                    format!("Column unknown: {}", name),
                )
            })
    }
}

/// Tables as seen by one transaction; cloning is cheap.
pub type Tables = im::HashMap<String, Table>;

/// Committed BLOB contents, kept as the segments they were written in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlobStore {
    blobs: im::HashMap<BlobId, Vec<Vec<u8>>>,
    next_id: u64,
}

impl BlobStore {
    pub fn insert(&mut self, segments: Vec<Vec<u8>>) -> BlobId {
        self.next_id += 1;
        let id = BlobId(self.next_id);
        self.blobs.insert(id, segments);
        id
    }

    /// Stores `data` split into segments of at most [`MAX_SEGMENT`] bytes.
    pub fn insert_bytes(&mut self, data: &[u8]) -> BlobId {
        let segments = data.chunks(MAX_SEGMENT).map(<[u8]>::to_vec).collect();
        self.insert(segments)
    }

    pub fn contains(&self, id: BlobId) -> bool {
        self.blobs.contains_key(&id)
    }

    pub fn read(&self, id: BlobId) -> DriverResult<Vec<u8>> {
        self.segments(id).map(|s| s.concat())
    }

    pub fn info(&self, id: BlobId) -> DriverResult<BlobInfo> {
        let segments = self.segments(id)?;
        Ok(BlobInfo {
            length: segments.iter().map(Vec::len).sum(),
            num_segments: segments.len(),
            max_segment: segments.iter().map(Vec::len).max().unwrap_or(0),
            is_stream: false,
        })
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    fn segments(&self, id: BlobId) -> DriverResult<&Vec<Vec<u8>>> {
        self.blobs
            .get(&id)
            .ok_or_else(|| DriverError::new(codes::BAD_SEGSTR_ID, format!("invalid BLOB ID {}", id)))
    }
}

/// One database "file".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub tables: Tables,
    pub generators: BTreeMap<String, i64>,
    pub blobs: BlobStore,
    pub read_only: bool,
    pub online: bool,
    pub sweep_interval: i64,
    pub created: DateTime<Utc>,
}

impl Database {
    pub fn new() -> Self {
        Self {
            tables: Tables::new(),
            generators: BTreeMap::new(),
            blobs: BlobStore::default(),
            read_only: false,
            online: true,
            sweep_interval: 20000,
            created: Utc::now(),
        }
    }

    /// Copy without rows or BLOBs.
    pub fn metadata_only(&self) -> Self {
        let tables = self
            .tables
            .iter()
            .map(|(name, table)| (name.clone(), Table::new(table.name.clone(), table.columns.clone())))
            .collect();
        Self {
            tables,
            generators: self.generators.keys().map(|g| (g.clone(), 0)).collect(),
            blobs: BlobStore::default(),
            ..self.clone()
        }
    }

    pub fn row_count(&self) -> usize {
        self.tables.values().map(|t| t.rows.len()).sum()
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

/// Contents of a backup file.
#[derive(Debug, Serialize, Deserialize)]
pub struct BackupImage {
    pub version: u32,
    pub source: String,
    pub taken_at: DateTime<Utc>,
    pub database: Database,
}

impl BackupImage {
    pub const VERSION: u32 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_store_segments() {
        let mut store = BlobStore::default();
        let id = store.insert(vec![b"ab".to_vec(), b"cde".to_vec()]);

        assert_eq!(store.read(id).unwrap(), b"abcde");
        let info = store.info(id).unwrap();
        assert_eq!(info.length, 5);
        assert_eq!(info.num_segments, 2);
        assert_eq!(info.max_segment, 3);
        assert_eq!(store.read(BlobId(99)).unwrap_err().code, Some(codes::BAD_SEGSTR_ID));
    }

    #[test]
    fn test_large_data_is_split() {
        let mut store = BlobStore::default();
        let id = store.insert_bytes(&vec![7u8; MAX_SEGMENT + 10]);
        assert_eq!(store.info(id).unwrap().num_segments, 2);
    }

    #[test]
    fn test_metadata_only_keeps_schema() {
        let mut db = Database::new();
        let mut table = Table::new(
            "T".into(),
            vec![ColumnDef {
                name: "ID".into(),
                field_type: FieldType::Integer,
                length: 4,
                nullable: true,
            }],
        );
        table.rows.push_back(vec![Value::Integer(1)]);
        db.tables.insert("T".into(), table);
        db.generators.insert("G".into(), 10);
        db.blobs.insert_bytes(b"x");

        let copy = db.metadata_only();
        assert_eq!(copy.tables["T"].columns.len(), 1);
        assert_eq!(copy.row_count(), 0);
        assert_eq!(copy.generators["G"], 0);
        assert!(copy.blobs.is_empty());
    }
}
