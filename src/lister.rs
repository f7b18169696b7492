//! Turns a prefix or an explicit path list into builder entries.

use crate::error::IngestError;
use crate::file_set::FileSetBuilder;
use crate::retry::{with_retry, RetryClassifier, RetryPolicy};
use crate::storage::ObjectStore;
use regex::Regex;
use tracing::{debug, info};

/// Lists one bucket through an [`ObjectStore`], retrying every remote call.
pub struct PathLister<'a> {
    store: &'a dyn ObjectStore,
    bucket: &'a str,
    retry: RetryPolicy,
    classifier: &'a dyn RetryClassifier,
}

impl<'a> PathLister<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        bucket: &'a str,
        retry: RetryPolicy,
        classifier: &'a dyn RetryClassifier,
    ) -> Self {
        Self {
            store,
            bucket,
            retry,
            classifier,
        }
    }

    /// Adds every non-empty object under `prefix` to `builder`, in key order.
    ///
    /// # Arguments
    ///
    /// * `prefix` - Key prefix, may be empty
    /// * `start_after` - Exclusive lower bound for the first page
    /// * `pattern` - Matched against the key with `prefix` stripped
    /// * `builder` - Receives entries until its file count limit is hit
    ///
    /// # Returns
    ///
    /// The number of entries added.
    pub async fn list_by_prefix(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        pattern: Option<&Regex>,
        builder: &mut FileSetBuilder,
    ) -> Result<usize, IngestError> {
        let mut added = 0;
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        while builder.needs_more() {
            let token = page_token.as_deref();
            let page = with_retry(&self.retry, self.classifier, "list objects", || {
                self.store.list_page(self.bucket, prefix, start_after, token)
            })
            .await?;
            pages += 1;

            for entry in page.entries {
                // Zero-byte keys are directory placeholders.
                if entry.size == 0 {
                    debug!(path = %entry.path, "Skipping empty object");
                    continue;
                }
                let suffix = entry.path.strip_prefix(prefix).unwrap_or(&entry.path);
                if pattern.is_some_and(|re| !re.is_match(suffix)) {
                    debug!(path = %entry.path, "Path does not match pattern");
                    continue;
                }
                if !builder.add(entry.path, entry.size) {
                    break;
                }
                added += 1;
            }

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        info!(
            bucket = self.bucket,
            prefix,
            pages,
            files = added,
            "Listed objects"
        );
        Ok(added)
    }

    /// Checks that every explicit path exists and adds it with its real size.
    pub async fn validate_paths(
        &self,
        paths: &[String],
        builder: &mut FileSetBuilder,
    ) -> Result<usize, IngestError> {
        if paths.is_empty() {
            return Err(IngestError::Config(
                "No file is found. Confirm paths option isn't empty".to_string(),
            ));
        }

        let mut added = 0;
        for path in paths {
            let found = with_retry(&self.retry, self.classifier, "stat object", || {
                self.store.stat_object(self.bucket, path)
            })
            .await?;
            let entry = found.ok_or_else(|| {
                IngestError::Config(format!(
                    "'paths' entry {} does not exist in bucket '{}'",
                    path, self.bucket
                ))
            })?;
            if !builder.add(entry.path, entry.size) {
                break;
            }
            added += 1;
        }

        info!(bucket = self.bucket, files = added, "Validated explicit paths");
        Ok(added)
    }
}
