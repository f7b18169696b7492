//! In-memory object store for tests and dry runs.

use crate::error::RemoteFailure;
use crate::storage::{ListPage, ObjectEntry, ObjectStore, ObjectStream};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use md5::{Digest, Md5};
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    md5: String,
}

/// Buckets of objects kept in sorted maps, listed in pages like a real backend.
///
/// Failures queued with [`InMemoryStore::fail_next`] are returned, one per
/// call, before any real work is done.
#[derive(Debug)]
pub struct InMemoryStore {
    buckets: Mutex<BTreeMap<String, BTreeMap<String, StoredObject>>>,
    failures: Mutex<VecDeque<RemoteFailure>>,
    page_size: usize,
    calls: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(VecDeque::new()),
            page_size: 1000,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.lock_buckets().entry(bucket.to_string()).or_default();
    }

    /// Stores an object, creating the bucket if needed.
    pub fn put_object(&self, bucket: &str, path: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let md5 = format!("{:x}", Md5::digest(&data));
        self.put_object_with_md5(bucket, path, data, md5);
    }

    /// Stores an object with an explicit checksum, which may deliberately be wrong.
    pub fn put_object_with_md5(
        &self,
        bucket: &str,
        path: &str,
        data: impl Into<Bytes>,
        md5: impl Into<String>,
    ) {
        self.lock_buckets().entry(bucket.to_string()).or_default().insert(
            path.to_string(),
            StoredObject {
                data: data.into(),
                md5: md5.into(),
            },
        );
    }

    /// Queues a failure to be returned by the next call.
    pub fn fail_next(&self, failure: RemoteFailure) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(failure);
    }

    /// Total number of backend calls made so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lock_buckets(
        &self,
    ) -> std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<String, StoredObject>>> {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin_call(&self) -> Result<(), RemoteFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        match injected {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn not_found(bucket: &str) -> RemoteFailure {
        RemoteFailure::from_response(
            404,
            format!(r#"{{"error":{{"code":404,"message":"The specified bucket does not exist: {bucket}"}}}}"#),
        )
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, RemoteFailure> {
        self.begin_call()?;
        Ok(self.lock_buckets().contains_key(bucket))
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        start_after: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<ListPage, RemoteFailure> {
        self.begin_call()?;
        let buckets = self.lock_buckets();
        let objects = buckets.get(bucket).ok_or_else(|| Self::not_found(bucket))?;

        // The page token is the last key of the previous page.
        let lower = match page_token.or(start_after) {
            Some(key) => Bound::Excluded(key),
            None => Bound::Included(prefix),
        };

        let mut matching = objects
            .range::<str, _>((lower, Bound::Unbounded))
            .skip_while(|(key, _)| key.as_str() < prefix)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectEntry::new(key.clone(), object.data.len() as u64));

        let entries: Vec<ObjectEntry> = matching.by_ref().take(self.page_size).collect();
        let next_page_token = match matching.next() {
            Some(_) => entries.last().map(|e| e.path.clone()),
            None => None,
        };

        Ok(ListPage {
            entries,
            next_page_token,
        })
    }

    async fn stat_object(
        &self,
        bucket: &str,
        path: &str,
    ) -> Result<Option<ObjectEntry>, RemoteFailure> {
        self.begin_call()?;
        let buckets = self.lock_buckets();
        let objects = buckets.get(bucket).ok_or_else(|| Self::not_found(bucket))?;
        Ok(objects
            .get(path)
            .map(|object| ObjectEntry::new(path, object.data.len() as u64)))
    }

    async fn open_stream(&self, bucket: &str, path: &str) -> Result<ObjectStream, RemoteFailure> {
        self.begin_call()?;
        let object = {
            let buckets = self.lock_buckets();
            let objects = buckets.get(bucket).ok_or_else(|| Self::not_found(bucket))?;
            objects.get(path).cloned().ok_or_else(|| {
                RemoteFailure::from_response(
                    404,
                    format!(r#"{{"error":{{"code":404,"message":"No such object: {bucket}/{path}"}}}}"#),
                )
            })?
        };

        // Two chunks, so consumers are exercised on split bodies.
        let mid = object.data.len() / 2;
        let chunks = vec![
            Ok(object.data.slice(..mid)),
            Ok(object.data.slice(mid..)),
        ];
        Ok(ObjectStream {
            md5: Some(object.md5),
            body: stream::iter(chunks).boxed(),
        })
    }
}
