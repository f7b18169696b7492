//! Discovery: validate, check the bucket, list, partition.

use crate::config::InputConfig;
use crate::error::IngestError;
use crate::file_set::{FileSet, FileSetBuilder};
use crate::lister::PathLister;
use crate::retry::{with_retry, RetryClassifier};
use crate::storage::ObjectStore;
use std::time::Instant;
use tracing::info;

/// Builds the partitioned [`FileSet`] for a configuration.
///
/// Nothing partial is returned: any failure, including the optional
/// `discovery_timeout_millis` deadline, aborts the whole discovery.
pub async fn plan(
    config: &InputConfig,
    store: &dyn ObjectStore,
    classifier: &dyn RetryClassifier,
) -> Result<FileSet, IngestError> {
    config.validate()?;

    let started = Instant::now();
    let files = match config.discovery_timeout() {
        Some(limit) => tokio::time::timeout(limit, list_files(config, store, classifier))
            .await
            .map_err(|_| {
                IngestError::Timeout(format!(
                    "discovery in bucket '{}' exceeded {}",
                    config.bucket,
                    humantime::format_duration(limit)
                ))
            })??,
        None => list_files(config, store, classifier).await?,
    };

    info!(
        bucket = %config.bucket,
        files = files.len(),
        tasks = files.task_count(),
        bytes = files.total_size(),
        elapsed = %humantime::format_duration(started.elapsed()),
        "Discovery complete"
    );
    Ok(files)
}

async fn list_files(
    config: &InputConfig,
    store: &dyn ObjectStore,
    classifier: &dyn RetryClassifier,
) -> Result<FileSet, IngestError> {
    let retry = config.retry_policy();
    let bucket = config.bucket.as_str();

    let exists = with_retry(&retry, classifier, "check bucket", || {
        store.bucket_exists(bucket)
    })
    .await?;
    if !exists {
        return Err(IngestError::Config(format!(
            "bucket '{bucket}' does not exist"
        )));
    }

    let mut builder = FileSetBuilder::new().min_task_size(config.min_task_size);
    if let Some(limit) = config.total_file_count_limit {
        builder = builder.limit_total_file_count(limit);
    }

    let lister = PathLister::new(store, bucket, retry, classifier);
    match (&config.paths, &config.path_prefix) {
        (Some(paths), _) => {
            lister.validate_paths(paths, &mut builder).await?;
        }
        (None, prefix) => {
            let pattern = config.path_match_regex()?;
            lister
                .list_by_prefix(
                    prefix.as_deref().unwrap_or_default(),
                    config.start_after(),
                    Some(&pattern),
                    &mut builder,
                )
                .await?;
        }
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteFailure;
    use crate::retry::DefaultClassifier;
    use crate::storage::{InMemoryStore, ListPage, ObjectEntry, ObjectStream};
    use async_trait::async_trait;
    use std::time::Duration;

    fn config(extra: &str) -> InputConfig {
        InputConfig::from_toml_str(&format!(
            "bucket = \"bucket\"\nauth_method = \"compute_engine\"\ninitial_retry_interval_millis = 1\nmaximum_retry_interval_millis = 2\n{extra}"
        ))
        .unwrap()
    }

    fn store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.put_object("bucket", "in/aa/a", "aaaa");
        store.put_object("bucket", "in/bb/b", "bb");
        store.put_object("bucket", "in/cc/c", "c");
        store
    }

    #[tokio::test]
    async fn test_prefix_with_last_path() {
        let files = plan(
            &config("path_prefix = \"in/\"\nlast_path = \"in/aa/a\""),
            &store(),
            &DefaultClassifier::new(),
        )
        .await
        .unwrap();
        assert_eq!(files.paths().unwrap(), vec!["in/bb/b", "in/cc/c"]);
        assert_eq!(files.last_path(), Some("in/cc/c"));
    }

    #[tokio::test]
    async fn test_empty_last_path_lists_everything() {
        let files = plan(
            &config("path_prefix = \"in/\"\nlast_path = \"\"\nmin_task_size = 5"),
            &store(),
            &DefaultClassifier::new(),
        )
        .await
        .unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files.task_count(), 2);
    }

    #[tokio::test]
    async fn test_paths_mode_and_file_limit() {
        let files = plan(
            &config("paths = [\"in/cc/c\", \"in/aa/a\"]\ntotal_file_count_limit = 1"),
            &store(),
            &DefaultClassifier::new(),
        )
        .await
        .unwrap();
        assert_eq!(files.paths().unwrap(), vec!["in/cc/c"]);
    }

    #[tokio::test]
    async fn test_missing_bucket_is_config_error() {
        let mut cfg = config("path_prefix = \"in/\"");
        cfg.bucket = "non-exists-bucket".to_string();
        match plan(&cfg, &store(), &DefaultClassifier::new()).await {
            Err(IngestError::Config(message)) => assert!(message.contains("non-exists-bucket")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[derive(Debug)]
    struct StallingStore;

    #[async_trait]
    impl ObjectStore for StallingStore {
        async fn bucket_exists(&self, _bucket: &str) -> Result<bool, RemoteFailure> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(true)
        }

        async fn list_page(
            &self,
            _bucket: &str,
            _prefix: &str,
            _start_after: Option<&str>,
            _page_token: Option<&str>,
        ) -> Result<ListPage, RemoteFailure> {
            Ok(ListPage::default())
        }

        async fn stat_object(
            &self,
            _bucket: &str,
            _path: &str,
        ) -> Result<Option<ObjectEntry>, RemoteFailure> {
            Ok(None)
        }

        async fn open_stream(
            &self,
            _bucket: &str,
            _path: &str,
        ) -> Result<ObjectStream, RemoteFailure> {
            Err(RemoteFailure::Other("not readable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_discovery_timeout() {
        let cfg = config("path_prefix = \"in/\"\ndiscovery_timeout_millis = 20");
        let err = plan(&cfg, &StallingStore, &DefaultClassifier::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_fatal_listing_failure_aborts() {
        let store = store();
        store.fail_next(RemoteFailure::from_response(
            403,
            r#"{"error":{"code":403,"message":"forbidden"}}"#,
        ));
        let err = plan(
            &config("path_prefix = \"in/\""),
            &store,
            &DefaultClassifier::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IngestError::GiveUp { attempts: 1, .. }));
    }
}
