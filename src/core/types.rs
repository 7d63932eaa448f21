use std::fmt;
use serde::{Deserialize, Serialize};

/// Opaque BLOB locator assigned by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId(pub u64);

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}:{:08x}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

/// Column type as reported in field and parameter metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Integer,
    Float,
    Varchar,
    Boolean,
    Blob,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Float => "DOUBLE PRECISION",
            Self::Varchar => "VARCHAR",
            Self::Boolean => "BOOLEAN",
            Self::Blob => "BLOB",
        }
    }

    pub fn is_blob(&self) -> bool {
        matches!(self, Self::Blob)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for one result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub alias: String,
    pub relation: String,
    pub length: usize,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

/// Parameter metadata has the same shape as column metadata.
pub type ParamInfo = FieldInfo;

/// Result of a BLOB info lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub length: usize,
    pub num_segments: usize,
    pub max_segment: usize,
    pub is_stream: bool,
}

bitflags::bitflags! {
    /// Options for starting a transaction. The empty set is the driver default.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct TransactionOptions: u32 {
        /// Read-only transaction.
        const READ = 0x0001;
        /// Read-write transaction.
        const WRITE = 0x0002;
        /// Table-locking isolation.
        const CONSISTENCY = 0x0004;
        /// Snapshot isolation.
        const CONCURRENCY = 0x0008;
        /// Read-committed isolation.
        const COMMITTED = 0x0010;
        /// Read-committed without record versions.
        const REC_NO_VERSION = 0x0020;
        /// Read-committed with record versions.
        const REC_VERSION = 0x0040;
        /// Wait on lock conflicts.
        const WAIT = 0x0080;
        /// Fail immediately on lock conflicts.
        const NOWAIT = 0x0100;
    }
}

bitflags::bitflags! {
    /// Flags accepted by the fetch calls of a result set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FetchFlags: u32 {
        /// Ask the driver to inline BLOB contents instead of returning locators.
        const TEXT_BLOBS = 0x0001;
        /// Leave BLOB locators untouched instead of opening them.
        const RAW_BLOBS = 0x0100;
    }
}

impl FetchFlags {
    /// Whether BLOB columns should be turned into open read handles.
    pub fn opens_blobs(&self) -> bool {
        !self.intersects(Self::TEXT_BLOBS | Self::RAW_BLOBS)
    }
}

bitflags::bitflags! {
    /// Options for backup and restore service calls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct BackupOptions: u32 {
        const IGNORE_CHECKSUMS = 0x0001;
        const METADATA_ONLY = 0x0004;
        const NO_GARBAGE_COLLECT = 0x0008;
        /// Restore: replace an existing database.
        const REPLACE = 0x1000;
        /// Restore: create a new database.
        const CREATE = 0x2000;
    }
}

/// Account fields used by the user-management service calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    pub user_name: String,
    pub password: String,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
}

impl UserSpec {
    pub fn new(user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn first_name(mut self, name: impl Into<String>) -> Self {
        self.first_name = Some(name.into());
        self
    }

    pub fn middle_name(mut self, name: impl Into<String>) -> Self {
        self.middle_name = Some(name.into());
        self
    }

    pub fn last_name(mut self, name: impl Into<String>) -> Self {
        self.last_name = Some(name.into());
        self
    }
}

/// Maintenance actions for `maintain_db`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaintenanceAction {
    Sweep,
    Shutdown,
    Online,
    SetSweepInterval,
    ReadOnly,
    ReadWrite,
}

/// Queries for `db_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbInfoAction {
    Statistics,
    Tables,
}

/// Queries for `server_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerInfoAction {
    Version,
    Implementation,
    Users,
    Databases,
    Uptime,
}

/// Raw reply of an administrative service call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceReply {
    Done(bool),
    Text(String),
    Lines(Vec<String>),
}

impl ServiceReply {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn lines(&self) -> &[String] {
        match self {
            Self::Lines(lines) => lines,
            _ => &[],
        }
    }
}
