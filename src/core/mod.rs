pub mod error;
pub mod types;
pub mod value;

pub use error::{DriverError, DriverResult, Error, Result, UsageError};
pub use types::{
    BackupOptions, BlobId, BlobInfo, DbInfoAction, FetchFlags, FieldInfo, FieldType,
    MaintenanceAction, ParamInfo, ServerInfoAction, ServiceReply, TransactionOptions, UserSpec,
};
pub use value::Value;
