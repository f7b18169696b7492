//! Transaction lifecycle: discover, dispatch tasks, aggregate, commit.
//!
//! ```text
//! transaction = plan_task -> resume
//! resume      = Control::run -> commit -> cleanup
//! ```
//!
//! `resume` never rediscovers. It is what a runner calls when it already
//! holds a [`TaskDescriptor`] from an earlier run.

use crate::config::InputConfig;
use crate::error::IngestError;
use crate::file_set::FileSet;
use crate::planner::plan;
use crate::retry::RetryClassifier;
use crate::storage::ObjectStore;
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Outcome of one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub files: u64,
    pub bytes: u64,
    /// Last path the task finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_path: Option<String>,
    /// Set when the task failed and the control was told to carry on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskReport {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Checkpoint handed back to the caller for the next run.
///
/// Serialises to `{"last_path": "..."}`, or `{}` when not incremental.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDiff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_path: Option<String>,
}

impl ConfigDiff {
    pub fn load(path: &Path) -> Result<Self, IngestError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), IngestError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

impl fmt::Display for ConfigDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// What crosses into tasks: the validated configuration and its partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub config: InputConfig,
    pub files: FileSet,
}

impl TaskDescriptor {
    pub fn task_count(&self) -> usize {
        self.files.task_count()
    }

    /// Writes the descriptor as JSON.
    pub fn dump(&self, path: &Path) -> Result<(), IngestError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        info!(path = %path.display(), tasks = self.task_count(), "Task descriptor written");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, IngestError> {
        let reader = BufReader::new(File::open(path)?);
        let descriptor: Self = serde_json::from_reader(reader)?;
        descriptor.config.validate()?;
        Ok(descriptor)
    }
}

/// Runs every task index of a descriptor and returns one report per index.
#[async_trait]
pub trait Control: Send + Sync {
    async fn run(
        &self,
        descriptor: &TaskDescriptor,
        task_count: usize,
    ) -> Result<Vec<TaskReport>, IngestError>;
}

#[async_trait]
impl<F> Control for F
where
    F: Fn(&TaskDescriptor, usize) -> Result<Vec<TaskReport>, IngestError> + Send + Sync,
{
    async fn run(
        &self,
        descriptor: &TaskDescriptor,
        task_count: usize,
    ) -> Result<Vec<TaskReport>, IngestError> {
        self(descriptor, task_count)
    }
}

/// Work done for a single task index.
#[async_trait]
pub trait TaskProcessor: Send + Sync + 'static {
    async fn process(
        &self,
        descriptor: &TaskDescriptor,
        index: usize,
    ) -> Result<TaskReport, IngestError>;
}

/// Dispatches task indices onto tokio tasks, bounded by a semaphore.
pub struct ParallelControl<P> {
    processor: Arc<P>,
    max_concurrent: usize,
    continue_on_error: bool,
    show_progress: bool,
}

impl<P: TaskProcessor> ParallelControl<P> {
    pub fn new(processor: P, max_concurrent: usize) -> Self {
        Self {
            processor: Arc::new(processor),
            max_concurrent: max_concurrent.max(1),
            continue_on_error: false,
            show_progress: false,
        }
    }

    /// Report failed tasks instead of aborting the run.
    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    pub fn show_progress(mut self, enabled: bool) -> Self {
        self.show_progress = enabled;
        self
    }

    fn progress_bar(&self, task_count: usize) -> Option<ProgressBar> {
        if !self.show_progress {
            return None;
        }
        let pb = ProgressBar::new(task_count as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} tasks | {elapsed_precise} elapsed, ETA {eta_precise}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░ ");
        pb.set_style(style);
        Some(pb)
    }
}

#[async_trait]
impl<P: TaskProcessor> Control for ParallelControl<P> {
    async fn run(
        &self,
        descriptor: &TaskDescriptor,
        task_count: usize,
    ) -> Result<Vec<TaskReport>, IngestError> {
        let descriptor = Arc::new(descriptor.clone());
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let pb = self.progress_bar(task_count);

        let mut handles = Vec::with_capacity(task_count);
        for index in 0..task_count {
            let semaphore = Arc::clone(&semaphore);
            let processor = Arc::clone(&self.processor);
            let descriptor = Arc::clone(&descriptor);
            let pb = pb.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| IngestError::Dispatch(e.to_string()))?;
                let result = processor.process(&descriptor, index).await;
                if let Some(pb) = &pb {
                    pb.inc(1);
                }
                result
            }));
        }

        let mut reports = Vec::with_capacity(task_count);
        let mut pending = handles.into_iter().enumerate();
        while let Some((index, handle)) = pending.next() {
            let failure = match handle.await {
                Ok(Ok(report)) => {
                    reports.push(report);
                    continue;
                }
                Ok(Err(e)) if self.continue_on_error => {
                    warn!(task = index, error = %e, "Task failed, continuing");
                    reports.push(TaskReport::failed(e.to_string()));
                    continue;
                }
                Ok(Err(e)) => IngestError::Task {
                    index,
                    source: Box::new(e),
                },
                Err(e) => IngestError::Dispatch(format!("task {index} join error: {e}")),
            };

            error!(error = %failure, "Task failed");
            for (_, rest) in pending {
                rest.abort();
            }
            if let Some(pb) = &pb {
                pb.abandon_with_message("failed");
            }
            return Err(failure);
        }

        if let Some(pb) = &pb {
            pb.finish_with_message("done");
        }
        Ok(reports)
    }
}

/// Discovers files and packs them into a descriptor.
pub async fn plan_task(
    config: InputConfig,
    store: &dyn ObjectStore,
    classifier: &dyn RetryClassifier,
) -> Result<TaskDescriptor, IngestError> {
    let files = plan(&config, store, classifier).await?;
    Ok(TaskDescriptor { config, files })
}

/// Runs a full transaction and returns the checkpoint for the next run.
///
/// # Arguments
///
/// * `config` - Connector configuration
/// * `store` - Storage backend, shared read-only
/// * `classifier` - Retry classification for discovery calls
/// * `control` - Dispatches the discovered tasks
pub async fn transaction(
    config: InputConfig,
    store: &dyn ObjectStore,
    classifier: &dyn RetryClassifier,
    control: &dyn Control,
) -> Result<ConfigDiff, IngestError> {
    let descriptor = plan_task(config, store, classifier).await?;
    let task_count = descriptor.task_count();
    info!(tasks = task_count, "Dispatching tasks");
    resume(&descriptor, task_count, control).await
}

/// Dispatches an already planned descriptor, without rediscovery.
pub async fn resume(
    descriptor: &TaskDescriptor,
    task_count: usize,
    control: &dyn Control,
) -> Result<ConfigDiff, IngestError> {
    if task_count > descriptor.task_count() {
        return Err(IngestError::Config(format!(
            "task count {} exceeds the {} task(s) in the descriptor",
            task_count,
            descriptor.task_count()
        )));
    }

    let reports = control.run(descriptor, task_count).await?;
    if reports.len() != task_count {
        return Err(IngestError::ReportCount {
            expected: task_count,
            actual: reports.len(),
        });
    }

    let diff = commit(descriptor, &reports);
    cleanup(descriptor, task_count, &reports);
    Ok(diff)
}

/// Builds the checkpoint from the descriptor and the task reports.
///
/// Incremental runs carry the greatest path seen, falling back to the
/// configured `last_path` and then to `""`. Other runs carry nothing.
pub fn commit(descriptor: &TaskDescriptor, reports: &[TaskReport]) -> ConfigDiff {
    if !descriptor.config.incremental {
        return ConfigDiff::default();
    }

    let last_path = reports
        .iter()
        .filter_map(|r| r.last_path.as_deref())
        .chain(descriptor.files.last_path())
        .max()
        .map(str::to_string)
        .or_else(|| descriptor.config.last_path.clone())
        .unwrap_or_default();

    ConfigDiff {
        last_path: Some(last_path),
    }
}

/// End-of-run hook. Only logs a summary.
pub fn cleanup(descriptor: &TaskDescriptor, task_count: usize, reports: &[TaskReport]) {
    let files: u64 = reports.iter().map(|r| r.files).sum();
    let bytes: u64 = reports.iter().map(|r| r.bytes).sum();
    let failed = reports.iter().filter(|r| r.error.is_some()).count();
    info!(
        bucket = %descriptor.config.bucket,
        tasks = task_count,
        files,
        bytes,
        failed,
        "Transaction finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_set::FileSetBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    fn descriptor(paths: &[&str], incremental: bool) -> TaskDescriptor {
        let config = InputConfig::from_toml_str(&format!(
            "bucket = \"bucket\"\npath_prefix = \"in/\"\nauth_method = \"compute_engine\"\nincremental = {incremental}"
        ))
        .unwrap();
        let mut builder = FileSetBuilder::new();
        for path in paths {
            builder.add(*path, 1);
        }
        TaskDescriptor {
            config,
            files: builder.build().unwrap(),
        }
    }

    struct Echo {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TaskProcessor for Echo {
        async fn process(
            &self,
            descriptor: &TaskDescriptor,
            index: usize,
        ) -> Result<TaskReport, IngestError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            let paths = descriptor.files.task_paths(index)?;
            if paths.iter().any(|p| p.ends_with("bad")) {
                return Err(IngestError::Config(format!("bad file in task {index}")));
            }
            Ok(TaskReport {
                files: paths.len() as u64,
                bytes: paths.len() as u64,
                last_path: paths.last().cloned(),
                error: None,
            })
        }
    }

    fn echo() -> Echo {
        Echo {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    #[test]
    fn test_config_diff_json() {
        assert_eq!(ConfigDiff::default().to_string(), "{}");
        let diff = ConfigDiff {
            last_path: Some("in/a".to_string()),
        };
        assert_eq!(diff.to_string(), r#"{"last_path":"in/a"}"#);
    }

    #[test]
    fn test_commit_takes_greatest_path() {
        let descriptor = descriptor(&["in/a", "in/b"], true);
        let reports = vec![
            TaskReport {
                last_path: Some("in/c".to_string()),
                ..TaskReport::default()
            },
            TaskReport::default(),
        ];
        assert_eq!(commit(&descriptor, &reports).last_path.as_deref(), Some("in/c"));
        assert_eq!(commit(&descriptor, &[]).last_path.as_deref(), Some("in/b"));
    }

    #[test]
    fn test_commit_falls_back() {
        let mut empty = descriptor(&[], true);
        assert_eq!(commit(&empty, &[]).last_path.as_deref(), Some(""));

        empty.config.last_path = Some("in/prev".to_string());
        assert_eq!(commit(&empty, &[]).last_path.as_deref(), Some("in/prev"));

        let not_incremental = descriptor(&["in/a"], false);
        assert_eq!(commit(&not_incremental, &[]), ConfigDiff::default());
    }

    #[tokio::test]
    async fn test_resume_with_no_tasks_keeps_last_path() {
        let descriptor = descriptor(&["in/aa/a"], true);
        let control = |_: &TaskDescriptor, _: usize| -> Result<Vec<TaskReport>, IngestError> {
            Ok(Vec::new())
        };
        let diff = resume(&descriptor, 0, &control).await.unwrap();
        assert_eq!(diff.last_path.as_deref(), Some("in/aa/a"));
    }

    #[tokio::test]
    async fn test_resume_checks_counts() {
        let descriptor = descriptor(&["in/a"], true);
        let short = |_: &TaskDescriptor, _: usize| -> Result<Vec<TaskReport>, IngestError> {
            Ok(Vec::new())
        };
        assert!(matches!(
            resume(&descriptor, 1, &short).await,
            Err(IngestError::ReportCount { expected: 1, actual: 0 })
        ));
        assert!(matches!(
            resume(&descriptor, 2, &short).await,
            Err(IngestError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_parallel_control_orders_reports_and_bounds_concurrency() {
        let paths: Vec<String> = (0..8).map(|i| format!("in/{i}")).collect();
        let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
        let descriptor = descriptor(&refs, true);

        let control = ParallelControl::new(echo(), 3);
        let reports = control.run(&descriptor, 8).await.unwrap();
        let last: Vec<_> = reports.iter().map(|r| r.last_path.clone().unwrap()).collect();
        assert_eq!(last, paths);
        assert!(control.processor.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_parallel_control_failure_modes() {
        let descriptor = descriptor(&["in/a", "in/bad", "in/c"], true);

        let strict = ParallelControl::new(echo(), 2);
        match strict.run(&descriptor, 3).await {
            Err(IngestError::Task { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected task failure, got {other:?}"),
        }

        let lenient = ParallelControl::new(echo(), 2).continue_on_error(true);
        let reports = lenient.run(&descriptor, 3).await.unwrap();
        assert!(reports[1].error.as_deref().unwrap().contains("bad file"));
        assert_eq!(reports[2].last_path.as_deref(), Some("in/c"));
    }

    #[test]
    fn test_descriptor_dump_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("task.json");
        let original = descriptor(&["in/a", "in/b"], true);
        original.dump(&path).unwrap();
        assert_eq!(TaskDescriptor::load(&path).unwrap(), original);

        let state = dir.path().join("state/diff.json");
        let diff = commit(&original, &[]);
        diff.save(&state).unwrap();
        assert_eq!(ConfigDiff::load(&state).unwrap(), diff);
    }

    #[test]
    fn test_descriptor_dump_leaves_out_access_token() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("task.json");
        let mut original = descriptor(&["in/a"], true);
        original.config.access_token = Some("ya29.SECRET".to_string());
        original.dump(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("ya29.SECRET"));

        let loaded = TaskDescriptor::load(&path).unwrap();
        assert_eq!(loaded.config.access_token, None);
        assert_eq!(loaded.files, original.files);
    }
}
