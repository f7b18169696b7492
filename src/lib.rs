//! gcs-ingest - Discover, partition and stream Google Cloud Storage objects
//!
//! This library lists the objects under a prefix (or validates an explicit
//! path list), splits them into tasks, streams every task's objects into a
//! sink and hands back a checkpoint so the next run resumes after the last
//! object seen.
//!
//! # Features
//!
//! - **Incremental Listing**: Resume after `last_path` using an encoded page token
//! - **Deterministic Partitioning**: Greedy, order-preserving task groups
//! - **Compact Task Descriptors**: Paths stored as a gzip blob
//! - **Classified Retry**: Bounded backoff driven by a pluggable classifier
//! - **MD5 Verification**: Streamed bytes are checked against the backend hash
//!
//! # Example
//!
//! ```no_run
//! use gcs_ingest::{
//!     load_config, transaction, DefaultClassifier, FileInputProcessor, GcsClient,
//!     ParallelControl, SinkTarget,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config(Some("gcs-ingest.toml".as_ref()))?;
//! let store = Arc::new(GcsClient::from_config(&config)?);
//! let classifier = Arc::new(DefaultClassifier::new());
//!
//! let processor = FileInputProcessor::new(store.clone(), SinkTarget::Discard, classifier.clone());
//! let control = ParallelControl::new(processor, config.max_concurrent_tasks);
//!
//! let diff = transaction(config, store.as_ref(), classifier.as_ref(), &control).await?;
//! println!("{diff}");
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod file_set;
pub mod input;
pub mod lister;
pub mod planner;
pub mod retry;
pub mod storage;
pub mod transaction;

pub use auth::{AuthMethod, Credentials, TokenSource};
pub use config::{load_config, InputConfig};
pub use error::{IngestError, RemoteFailure};
pub use file_set::{FileSet, FileSetBuilder};
pub use input::{FileInputProcessor, RecordSink, RecordSinkFactory, SinkTarget};
pub use lister::PathLister;
pub use planner::plan;
pub use retry::{with_retry, DefaultClassifier, RetryClassifier, RetryDecision, RetryPolicy};
pub use storage::gcs::encode_page_token;
pub use storage::{GcsClient, InMemoryStore, ObjectEntry, ObjectStore};
pub use transaction::{
    cleanup, commit, plan_task, resume, transaction, ConfigDiff, Control, ParallelControl,
    TaskDescriptor, TaskProcessor, TaskReport,
};
