//! Storage backend seam: list by prefix, stat by path, stream bytes.

pub mod gcs;
pub mod memory;

use crate::error::RemoteFailure;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use gcs::GcsClient;
pub use memory::InMemoryStore;

/// One object found by listing or stat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub path: String,
    pub size: u64,
}

impl ObjectEntry {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }
}

/// One page of a prefix listing, in lexicographic key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub entries: Vec<ObjectEntry>,
    pub next_page_token: Option<String>,
}

/// An opened object body.
pub struct ObjectStream {
    /// Lowercase hex MD5 of the full object, when the backend reports one.
    pub md5: Option<String>,
    pub body: BoxStream<'static, Result<Bytes, RemoteFailure>>,
}

impl std::fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStream")
            .field("md5", &self.md5)
            .finish_non_exhaustive()
    }
}

/// Provider-shaped object storage API.
///
/// Implementations report failures as [`RemoteFailure`] and never retry on
/// their own; callers wrap every method in [`crate::retry::with_retry`].
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// Returns `false` when the bucket does not exist.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, RemoteFailure>;

    /// Lists one page of keys starting with `prefix`.
    ///
    /// `start_after` (exclusive) only applies to the first page, that is when
    /// `page_token` is `None`. Later pages continue from the token.
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        start_after: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<ListPage, RemoteFailure>;

    /// Returns `None` when the object does not exist.
    async fn stat_object(
        &self,
        bucket: &str,
        path: &str,
    ) -> Result<Option<ObjectEntry>, RemoteFailure>;

    async fn object_exists(&self, bucket: &str, path: &str) -> Result<bool, RemoteFailure> {
        Ok(self.stat_object(bucket, path).await?.is_some())
    }

    async fn open_stream(&self, bucket: &str, path: &str) -> Result<ObjectStream, RemoteFailure>;
}
