use gcs_ingest::{
    resume, transaction, ConfigDiff, DefaultClassifier, FileInputProcessor, FileSetBuilder,
    InMemoryStore, IngestError, InputConfig, ParallelControl, RemoteFailure, SinkTarget,
    TaskDescriptor, TaskReport,
};
use std::sync::Arc;

const BUCKET: &str = "ingest-test";

fn config(extra: &str) -> InputConfig {
    InputConfig::from_toml_str(&format!(
        r#"
bucket = "{BUCKET}"
auth_method = "compute_engine"
initial_retry_interval_millis = 1
maximum_retry_interval_millis = 2
{extra}
"#
    ))
    .unwrap()
}

fn seeded_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new().with_page_size(1));
    store.create_bucket(BUCKET);
    store.put_object(BUCKET, "gcs-test/", "");
    store.put_object(BUCKET, "gcs-test/sample_01.csv", "id,name\n1,foo\n");
    store.put_object(BUCKET, "gcs-test/sample_02.csv", "id,name\n2,bar\n");
    store
}

async fn run(config: InputConfig, store: Arc<InMemoryStore>) -> Result<ConfigDiff, IngestError> {
    let classifier = Arc::new(DefaultClassifier::new());
    let processor = FileInputProcessor::new(store.clone(), SinkTarget::Discard, classifier.clone());
    let control = ParallelControl::new(processor, 2);
    transaction(config, store.as_ref(), classifier.as_ref(), &control).await
}

#[tokio::test]
async fn prefix_run_checkpoints_last_file() {
    let diff = run(config(r#"path_prefix = "gcs-test/""#), seeded_store())
        .await
        .unwrap();
    assert_eq!(diff.last_path.as_deref(), Some("gcs-test/sample_02.csv"));
    assert_eq!(diff.to_string(), r#"{"last_path":"gcs-test/sample_02.csv"}"#);
}

#[tokio::test]
async fn one_task_per_file_and_pattern_filters() {
    let store = seeded_store();
    let classifier = DefaultClassifier::new();

    let all = gcs_ingest::plan_task(config(r#"path_prefix = "gcs-test/""#), store.as_ref(), &classifier)
        .await
        .unwrap();
    assert_eq!(all.task_count(), 2);
    assert_eq!(all.files.last_path(), Some("gcs-test/sample_02.csv"));

    let one = gcs_ingest::plan_task(
        config("path_prefix = \"gcs-test/\"\npath_match_pattern = \"1\""),
        store.as_ref(),
        &classifier,
    )
    .await
    .unwrap();
    assert_eq!(one.task_count(), 1);
    assert_eq!(one.files.paths().unwrap(), vec!["gcs-test/sample_01.csv"]);
}

#[tokio::test]
async fn empty_prefix_match_yields_empty_checkpoint() {
    let diff = run(
        config("path_prefix = \"nothing-here/\"\nlast_path = \"\""),
        seeded_store(),
    )
    .await
    .unwrap();
    assert_eq!(diff.last_path.as_deref(), Some(""));
}

#[tokio::test]
async fn second_run_resumes_after_checkpoint() {
    let store = seeded_store();
    let first = run(config(r#"path_prefix = "gcs-test/""#), store.clone())
        .await
        .unwrap();

    store.put_object(BUCKET, "gcs-test/sample_03.csv", "id,name\n3,baz\n");
    let mut next = config(r#"path_prefix = "gcs-test/""#);
    next.last_path = first.last_path;

    let classifier = DefaultClassifier::new();
    let descriptor = gcs_ingest::plan_task(next, store.as_ref(), &classifier)
        .await
        .unwrap();
    assert_eq!(descriptor.files.paths().unwrap(), vec!["gcs-test/sample_03.csv"]);
}

#[tokio::test]
async fn non_incremental_run_returns_empty_diff() {
    let diff = run(
        config("path_prefix = \"gcs-test/\"\nincremental = false"),
        seeded_store(),
    )
    .await
    .unwrap();
    assert_eq!(diff, ConfigDiff::default());
    assert_eq!(diff.to_string(), "{}");
}

#[tokio::test]
async fn missing_bucket_is_a_configuration_error() {
    let mut cfg = config(r#"path_prefix = "gcs-test/""#);
    cfg.bucket = "non-exists-bucket".to_string();
    assert!(matches!(
        run(cfg, seeded_store()).await,
        Err(IngestError::Config(_))
    ));
}

#[tokio::test]
async fn empty_paths_is_a_configuration_error() {
    let err = run(config("paths = []"), seeded_store()).await.unwrap_err();
    assert!(err
        .to_string()
        .contains("No file is found. Confirm paths option isn't empty"));
}

#[tokio::test]
async fn last_path_length_bound() {
    let ok = config(&format!(
        "path_prefix = \"gcs-test/\"\nlast_path = \"{}\"",
        "c".repeat(127)
    ));
    assert!(run(ok, seeded_store()).await.is_ok());

    let too_long = config(&format!(
        "path_prefix = \"gcs-test/\"\nlast_path = \"{}\"",
        "c".repeat(128)
    ));
    assert!(matches!(
        run(too_long, seeded_store()).await,
        Err(IngestError::Config(_))
    ));
}

#[tokio::test]
async fn resume_without_tasks_keeps_discovered_last_path() {
    let mut builder = FileSetBuilder::new();
    builder.add("in/aa/a", 1);
    let descriptor = TaskDescriptor {
        config: config(r#"path_prefix = "in/""#),
        files: builder.build().unwrap(),
    };

    let control = |_: &TaskDescriptor, _: usize| -> Result<Vec<TaskReport>, IngestError> {
        Ok(Vec::new())
    };
    let diff = resume(&descriptor, 0, &control).await.unwrap();
    assert_eq!(diff.last_path.as_deref(), Some("in/aa/a"));
}

#[tokio::test]
async fn transient_listing_failures_are_retried() {
    let store = seeded_store();
    store.fail_next(RemoteFailure::from_response(403, "Fake Exception"));
    store.fail_next(RemoteFailure::from_response(403, "Fake Exception"));

    let diff = run(config(r#"path_prefix = "gcs-test/""#), store.clone())
        .await
        .unwrap();
    assert_eq!(diff.last_path.as_deref(), Some("gcs-test/sample_02.csv"));
}
