//! Connector configuration, loaded from TOML and `GCS_INGEST_*` variables.

use crate::auth::{AuthMethod, Credentials};
use crate::error::IngestError;
use crate::retry::RetryPolicy;
use crate::storage::gcs::MAX_PAGE_TOKEN_PATH_BYTES;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const ENV_PREFIX: &str = "GCS_INGEST_";
pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
pub const DEFAULT_APPLICATION_NAME: &str = "gcs-ingest";

/// Everything a discovery run and its tasks need to know.
///
/// Exactly one of `path_prefix` and `paths` selects the input set.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputConfig {
    pub bucket: String,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub paths: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub incremental: bool,
    /// Resume listing strictly after this key.
    #[serde(default)]
    pub last_path: Option<String>,
    /// Applied to the key with `path_prefix` stripped.
    #[serde(default = "default_pattern")]
    pub path_match_pattern: String,
    #[serde(default)]
    pub total_file_count_limit: Option<usize>,
    /// Bytes per task; 0 puts every file in its own task.
    #[serde(default)]
    pub min_task_size: u64,

    #[serde(default)]
    pub auth_method: AuthMethod,
    #[serde(default)]
    pub service_account_email: Option<String>,
    #[serde(default)]
    pub p12_keyfile: Option<PathBuf>,
    #[serde(default)]
    pub p12_keyfile_fullpath: Option<PathBuf>,
    #[serde(default)]
    pub json_keyfile: Option<PathBuf>,
    /// Externally minted bearer token; overrides every auth method.
    ///
    /// Never written into task descriptors. See [`InputConfig::restore_access_token`].
    #[serde(default, skip_serializing)]
    pub access_token: Option<String>,

    #[serde(default = "default_application_name")]
    pub application_name: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_initial_retry_interval")]
    pub initial_retry_interval_millis: u64,
    #[serde(default = "default_maximum_retry_interval")]
    pub maximum_retry_interval_millis: u64,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default)]
    pub retry_jitter: bool,

    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default)]
    pub discovery_timeout_millis: Option<u64>,
}

impl fmt::Debug for InputConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputConfig")
            .field("bucket", &self.bucket)
            .field("path_prefix", &self.path_prefix)
            .field("paths", &self.paths)
            .field("incremental", &self.incremental)
            .field("last_path", &self.last_path)
            .field("path_match_pattern", &self.path_match_pattern)
            .field("total_file_count_limit", &self.total_file_count_limit)
            .field("min_task_size", &self.min_task_size)
            .field("auth_method", &self.auth_method)
            .field("service_account_email", &self.service_account_email)
            .field("p12_keyfile", &self.p12_keyfile)
            .field("p12_keyfile_fullpath", &self.p12_keyfile_fullpath)
            .field("json_keyfile", &self.json_keyfile)
            .field("access_token", &self.access_token.as_ref().map(|_| ".."))
            .field("application_name", &self.application_name)
            .field("endpoint", &self.endpoint)
            .field("initial_retry_interval_millis", &self.initial_retry_interval_millis)
            .field("maximum_retry_interval_millis", &self.maximum_retry_interval_millis)
            .field("retry_limit", &self.retry_limit)
            .field("retry_jitter", &self.retry_jitter)
            .field("max_concurrent_tasks", &self.max_concurrent_tasks)
            .field("discovery_timeout_millis", &self.discovery_timeout_millis)
            .finish()
    }
}

fn default_true() -> bool {
    true
}

fn default_pattern() -> String {
    ".*".to_string()
}

fn default_application_name() -> String {
    DEFAULT_APPLICATION_NAME.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_initial_retry_interval() -> u64 {
    RetryPolicy::default().initial_interval_ms
}

fn default_maximum_retry_interval() -> u64 {
    RetryPolicy::default().max_interval_ms
}

fn default_retry_limit() -> u32 {
    RetryPolicy::default().max_retries
}

fn default_max_concurrent_tasks() -> usize {
    4
}

impl InputConfig {
    /// Parses a TOML document without consulting the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, IngestError> {
        Ok(Figment::from(Toml::string(toml)).extract()?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval_ms: self.initial_retry_interval_millis,
            max_interval_ms: self.maximum_retry_interval_millis,
            max_retries: self.retry_limit,
            jitter: self.retry_jitter,
        }
    }

    pub fn discovery_timeout(&self) -> Option<Duration> {
        self.discovery_timeout_millis.map(Duration::from_millis)
    }

    pub fn path_match_regex(&self) -> Result<Regex, IngestError> {
        Ok(Regex::new(&self.path_match_pattern)?)
    }

    /// Picks `access_token` back up from `GCS_INGEST_ACCESS_TOKEN` when unset.
    ///
    /// Dumped descriptors carry no token, so a resumed run needs this.
    pub fn restore_access_token(&mut self) {
        if self.access_token.is_none() {
            self.access_token = std::env::var(format!("{ENV_PREFIX}ACCESS_TOKEN"))
                .ok()
                .filter(|t| !t.is_empty());
        }
    }

    /// `last_path`, unless it is unset or empty.
    pub fn start_after(&self) -> Option<&str> {
        self.last_path.as_deref().filter(|p| !p.is_empty())
    }

    /// Checks every field that can be checked without the network.
    ///
    /// # Returns
    ///
    /// The validated credentials for the configured `auth_method`.
    pub fn validate(&self) -> Result<Credentials, IngestError> {
        if self.bucket.trim().is_empty() {
            return Err(IngestError::Config("'bucket' must not be empty".to_string()));
        }

        match (&self.path_prefix, &self.paths) {
            (None, None) => {
                return Err(IngestError::Config(
                    "either 'path_prefix' or 'paths' is required".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(IngestError::Config(
                    "'path_prefix' and 'paths' cannot both be set".to_string(),
                ))
            }
            _ => {}
        }

        if let Some(last_path) = &self.last_path {
            if last_path.len() > MAX_PAGE_TOKEN_PATH_BYTES {
                return Err(IngestError::Config(format!(
                    "'last_path' is {} bytes long; at most {} bytes are supported",
                    last_path.len(),
                    MAX_PAGE_TOKEN_PATH_BYTES
                )));
            }
        }

        Regex::new(&self.path_match_pattern).map_err(|e| {
            IngestError::Config(format!(
                "'path_match_pattern' {} is not a valid regex: {}",
                self.path_match_pattern, e
            ))
        })?;

        if self.max_concurrent_tasks == 0 {
            return Err(IngestError::Config(
                "'max_concurrent_tasks' must be at least 1".to_string(),
            ));
        }
        if self.initial_retry_interval_millis > self.maximum_retry_interval_millis {
            return Err(IngestError::Config(
                "'initial_retry_interval_millis' exceeds 'maximum_retry_interval_millis'"
                    .to_string(),
            ));
        }

        Credentials::from_config(self)
    }
}

/// Loads the configuration from an optional TOML file and the environment.
///
/// `GCS_INGEST_*` variables override values from the file.
pub fn load_config(path: Option<&Path>) -> Result<InputConfig, IngestError> {
    info!(file = ?path, "Loading configuration");

    let figment = match path {
        Some(path) => {
            if !path.exists() {
                return Err(IngestError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            Figment::new().merge(Toml::file(path))
        }
        None => Figment::new(),
    };

    Ok(figment.merge(Env::prefixed(ENV_PREFIX)).extract()?)
}
