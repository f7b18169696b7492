//! Default task processor: stream each assigned object into a sink.

use crate::error::{IngestError, RemoteFailure};
use crate::retry::{with_retry, RetryClassifier};
use crate::storage::ObjectStore;
use crate::transaction::{TaskDescriptor, TaskProcessor, TaskReport};
use async_trait::async_trait;
use futures_util::StreamExt;
use md5::{Digest, Md5};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Receives the bytes of each file of a task, in partition order.
#[async_trait]
pub trait RecordSink: Send {
    async fn begin_file(&mut self, path: &str) -> Result<(), IngestError>;

    async fn write(&mut self, chunk: &[u8]) -> Result<(), IngestError>;

    async fn finish_file(&mut self) -> Result<(), IngestError>;

    async fn close(&mut self) -> Result<(), IngestError> {
        Ok(())
    }
}

/// Opens one sink per task.
pub trait RecordSinkFactory: Send + Sync + 'static {
    type Sink: RecordSink;

    fn open(&self, task_index: usize) -> Result<Self::Sink, IngestError>;
}

/// Mirrors object keys as files under a root directory.
#[derive(Debug)]
pub struct DirectorySink {
    root: PathBuf,
    current: Option<File>,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            current: None,
        }
    }

    /// Target path for `key`, keeping it inside the root.
    pub fn target_for(&self, key: &str) -> Result<PathBuf, IngestError> {
        let mut target = self.root.clone();
        let mut pushed = false;
        for component in Path::new(key).components() {
            if let Component::Normal(part) = component {
                target.push(part);
                pushed = true;
            }
        }
        if !pushed {
            return Err(IngestError::Config(format!(
                "object key '{key}' has no usable file name"
            )));
        }
        Ok(target)
    }
}

#[async_trait]
impl RecordSink for DirectorySink {
    async fn begin_file(&mut self, path: &str) -> Result<(), IngestError> {
        let target = self.target_for(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.current = Some(File::create(&target).await?);
        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), IngestError> {
        match self.current.as_mut() {
            Some(file) => Ok(file.write_all(chunk).await?),
            None => Err(IngestError::Dispatch(
                "write before begin_file".to_string(),
            )),
        }
    }

    async fn finish_file(&mut self) -> Result<(), IngestError> {
        if let Some(mut file) = self.current.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

/// Drops all bytes.
#[derive(Debug, Default)]
pub struct DiscardSink;

#[async_trait]
impl RecordSink for DiscardSink {
    async fn begin_file(&mut self, _path: &str) -> Result<(), IngestError> {
        Ok(())
    }

    async fn write(&mut self, _chunk: &[u8]) -> Result<(), IngestError> {
        Ok(())
    }

    async fn finish_file(&mut self) -> Result<(), IngestError> {
        Ok(())
    }
}

/// Where the CLI sends object bytes.
#[derive(Debug, Clone)]
pub enum SinkTarget {
    Directory(PathBuf),
    Discard,
}

#[derive(Debug)]
pub enum TargetSink {
    Directory(DirectorySink),
    Discard(DiscardSink),
}

impl RecordSinkFactory for SinkTarget {
    type Sink = TargetSink;

    fn open(&self, _task_index: usize) -> Result<TargetSink, IngestError> {
        Ok(match self {
            SinkTarget::Directory(root) => TargetSink::Directory(DirectorySink::new(root)),
            SinkTarget::Discard => TargetSink::Discard(DiscardSink),
        })
    }
}

#[async_trait]
impl RecordSink for TargetSink {
    async fn begin_file(&mut self, path: &str) -> Result<(), IngestError> {
        match self {
            TargetSink::Directory(sink) => sink.begin_file(path).await,
            TargetSink::Discard(sink) => sink.begin_file(path).await,
        }
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), IngestError> {
        match self {
            TargetSink::Directory(sink) => sink.write(chunk).await,
            TargetSink::Discard(sink) => sink.write(chunk).await,
        }
    }

    async fn finish_file(&mut self) -> Result<(), IngestError> {
        match self {
            TargetSink::Directory(sink) => sink.finish_file().await,
            TargetSink::Discard(sink) => sink.finish_file().await,
        }
    }
}

/// Streams the files of one task, verifying each against the backend MD5.
pub struct FileInputProcessor<F> {
    store: Arc<dyn ObjectStore>,
    sinks: F,
    classifier: Arc<dyn RetryClassifier>,
}

impl<F: RecordSinkFactory> FileInputProcessor<F> {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        sinks: F,
        classifier: Arc<dyn RetryClassifier>,
    ) -> Self {
        Self {
            store,
            sinks,
            classifier,
        }
    }
}

#[async_trait]
impl<F: RecordSinkFactory> TaskProcessor for FileInputProcessor<F> {
    async fn process(
        &self,
        descriptor: &TaskDescriptor,
        index: usize,
    ) -> Result<TaskReport, IngestError> {
        let config = &descriptor.config;
        let retry = config.retry_policy();
        let paths = descriptor.files.task_paths(index)?;
        let mut sink = self.sinks.open(index)?;
        let mut report = TaskReport::default();

        for path in paths {
            // Only opening is retried; a stream that breaks midway fails the task.
            let mut stream = with_retry(&retry, self.classifier.as_ref(), "open object", || {
                self.store.open_stream(&config.bucket, &path)
            })
            .await?;

            sink.begin_file(&path).await?;
            let mut hasher = Md5::new();
            let mut bytes = 0u64;
            while let Some(chunk) = stream.body.next().await {
                let chunk = chunk.map_err(|source: RemoteFailure| IngestError::GiveUp {
                    operation: format!("read {path}"),
                    attempts: 1,
                    source,
                })?;
                hasher.update(&chunk);
                bytes += chunk.len() as u64;
                sink.write(&chunk).await?;
            }
            sink.finish_file().await?;

            let actual = format!("{:x}", hasher.finalize());
            if let Some(expected) = stream.md5 {
                if !expected.eq_ignore_ascii_case(&actual) {
                    return Err(IngestError::Integrity {
                        path,
                        expected,
                        actual,
                    });
                }
            }

            debug!(task = index, path = %path, bytes, "File ingested");
            report.files += 1;
            report.bytes += bytes;
            report.last_path = Some(path);
        }

        sink.close().await?;
        info!(
            task = index,
            files = report.files,
            bytes = report.bytes,
            "Task finished"
        );
        Ok(report)
    }
}
