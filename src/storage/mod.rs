// pgdumps3/src/storage/mod.rs
pub(crate) mod s3;
#[cfg(test)]
pub(crate) mod memory;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::errors::StorageError;

pub use s3::S3Store;

/// Byte stream flowing into or out of the bucket.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub location: String,
    pub bytes: u64,
}

/// Streaming access to the backup bucket. Implementations must never buffer a whole object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Consumes `body` until EOF and stores it under `key`.
    async fn put_stream(&self, key: &str, body: ObjectReader) -> Result<UploadReceipt, StorageError>;

    /// Opens the object stored under `key` for reading.
    async fn get_stream(&self, key: &str) -> Result<ObjectReader, StorageError>;

    fn bucket(&self) -> &str;
}
