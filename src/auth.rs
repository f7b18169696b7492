//! Credential validation and bearer token sources.
//!
//! Each `auth_method` maps to one [`Credentials`] variant, validated on its
//! own. Minting tokens from service-account key material (JWT or P12
//! signing) is left to an external collaborator: those variants need an
//! `access_token` to talk to the API.

use crate::config::InputConfig;
use crate::error::{IngestError, RemoteFailure};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// How the connector authenticates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    #[default]
    PrivateKey,
    JsonKey,
    ComputeEngine,
    ApplicationDefault,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthMethod::PrivateKey => "private_key",
            AuthMethod::JsonKey => "json_key",
            AuthMethod::ComputeEngine => "compute_engine",
            AuthMethod::ApplicationDefault => "application_default",
        };
        f.write_str(name)
    }
}

/// Contents of a JSON key file.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JsonKeyFile {
    ServiceAccount {
        client_email: String,
        private_key: String,
        #[serde(default = "default_token_uri")]
        token_uri: String,
    },
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl fmt::Debug for JsonKeyFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonKeyFile::ServiceAccount {
                client_email,
                token_uri,
                ..
            } => f
                .debug_struct("ServiceAccount")
                .field("client_email", client_email)
                .field("token_uri", token_uri)
                .finish_non_exhaustive(),
            JsonKeyFile::AuthorizedUser { client_id, .. } => f
                .debug_struct("AuthorizedUser")
                .field("client_id", client_id)
                .finish_non_exhaustive(),
        }
    }
}

impl JsonKeyFile {
    /// Reads and parses a key file, reporting problems as configuration errors.
    pub fn load(field: &str, path: &Path) -> Result<Self, IngestError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("'{}' {} cannot be read: {}", field, path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            IngestError::Config(format!(
                "'{}' {} is not a valid service_account or authorized_user key: {}",
                field,
                path.display(),
                e
            ))
        })
    }
}

/// Validated credentials, one variant per auth method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    PrivateKey {
        service_account_email: String,
        p12_keyfile: PathBuf,
    },
    JsonKey(JsonKeyFile),
    ComputeEngine,
    /// Key file from `GOOGLE_APPLICATION_CREDENTIALS`, or the metadata server.
    ApplicationDefault(Option<JsonKeyFile>),
}

impl Credentials {
    pub fn from_config(config: &InputConfig) -> Result<Self, IngestError> {
        match config.auth_method {
            AuthMethod::PrivateKey => Self::private_key(config),
            AuthMethod::JsonKey => {
                let keyfile = config.json_keyfile.as_deref().ok_or_else(|| {
                    IngestError::Config(
                        "'json_keyfile' is required when auth_method is json_key".to_string(),
                    )
                })?;
                Ok(Credentials::JsonKey(JsonKeyFile::load("json_keyfile", keyfile)?))
            }
            AuthMethod::ComputeEngine => Ok(Credentials::ComputeEngine),
            AuthMethod::ApplicationDefault => {
                match std::env::var_os("GOOGLE_APPLICATION_CREDENTIALS") {
                    Some(path) => Ok(Credentials::ApplicationDefault(Some(JsonKeyFile::load(
                        "GOOGLE_APPLICATION_CREDENTIALS",
                        Path::new(&path),
                    )?))),
                    None => Ok(Credentials::ApplicationDefault(None)),
                }
            }
        }
    }

    fn private_key(config: &InputConfig) -> Result<Self, IngestError> {
        let p12_keyfile = match (&config.p12_keyfile, &config.p12_keyfile_fullpath) {
            (Some(_), Some(_)) => {
                return Err(IngestError::Config(
                    "'p12_keyfile' and 'p12_keyfile_fullpath' cannot both be set".to_string(),
                ))
            }
            (None, None) => {
                return Err(IngestError::Config(
                    "'p12_keyfile' is required when auth_method is private_key".to_string(),
                ))
            }
            (Some(path), None) | (None, Some(path)) => path.clone(),
        };

        let service_account_email = config
            .service_account_email
            .clone()
            .filter(|email| !email.trim().is_empty())
            .ok_or_else(|| {
                IngestError::Config(
                    "'service_account_email' is required when auth_method is private_key"
                        .to_string(),
                )
            })?;

        let metadata = std::fs::metadata(&p12_keyfile).map_err(|e| {
            IngestError::Config(format!(
                "'p12_keyfile' {} cannot be read: {}",
                p12_keyfile.display(),
                e
            ))
        })?;
        if !metadata.is_file() || metadata.len() == 0 {
            return Err(IngestError::Config(format!(
                "'p12_keyfile' {} is not a valid key file",
                p12_keyfile.display()
            )));
        }

        Ok(Credentials::PrivateKey {
            service_account_email,
            p12_keyfile,
        })
    }
}

/// Supplies bearer tokens for storage requests.
#[async_trait]
pub trait TokenSource: Send + Sync + fmt::Debug {
    async fn token(&self) -> Result<String, RemoteFailure>;
}

/// A fixed, externally minted access token.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticToken(..)")
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, RemoteFailure> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

impl CachedToken {
    fn from_response(response: TokenResponse) -> Self {
        let lifetime = Duration::from_secs(response.expires_in.unwrap_or(3600));
        Self {
            value: response.access_token,
            refresh_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
        }
    }

    fn fresh(&self) -> Option<String> {
        (Instant::now() < self.refresh_at).then(|| self.value.clone())
    }
}

async fn read_token_response(
    request: reqwest::RequestBuilder,
) -> Result<TokenResponse, RemoteFailure> {
    let response = request
        .send()
        .await
        .map_err(|e| RemoteFailure::Transport(e.to_string()))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| RemoteFailure::Transport(e.to_string()))?;
    if !status.is_success() {
        return Err(RemoteFailure::from_token_response(status.as_u16(), body));
    }
    serde_json::from_str(&body)
        .map_err(|e| RemoteFailure::Transport(format!("malformed token response: {e}")))
}

/// Token from the instance metadata server.
#[derive(Debug)]
pub struct MetadataServerToken {
    http: reqwest::Client,
    url: String,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataServerToken {
    /// `host` defaults to `GCE_METADATA_HOST`, then `metadata.google.internal`.
    pub fn new(http: reqwest::Client, host: Option<String>) -> Self {
        let host = host
            .or_else(|| std::env::var("GCE_METADATA_HOST").ok())
            .unwrap_or_else(|| "metadata.google.internal".to_string());
        let base = if host.starts_with("http://") || host.starts_with("https://") {
            host
        } else {
            format!("http://{host}")
        };
        Self {
            http,
            url: format!("{}{}", base.trim_end_matches('/'), METADATA_TOKEN_PATH),
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TokenSource for MetadataServerToken {
    async fn token(&self) -> Result<String, RemoteFailure> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().and_then(CachedToken::fresh) {
            return Ok(token);
        }
        debug!(url = %self.url, "Fetching token from metadata server");
        let response =
            read_token_response(self.http.get(&self.url).header("Metadata-Flavor", "Google"))
                .await?;
        let token = CachedToken::from_response(response);
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }
}

/// OAuth refresh-token flow for `authorized_user` key files.
pub struct RefreshTokenSource {
    http: reqwest::Client,
    token_uri: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    cached: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for RefreshTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshTokenSource")
            .field("token_uri", &self.token_uri)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl RefreshTokenSource {
    pub fn new(
        http: reqwest::Client,
        token_uri: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            token_uri: token_uri.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TokenSource for RefreshTokenSource {
    async fn token(&self) -> Result<String, RemoteFailure> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().and_then(CachedToken::fresh) {
            return Ok(token);
        }
        debug!(token_uri = %self.token_uri, "Refreshing access token");
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", self.refresh_token.as_str()),
        ];
        let response = read_token_response(self.http.post(&self.token_uri).form(&form)).await?;
        let token = CachedToken::from_response(response);
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }
}

fn key_file_source(
    key: &JsonKeyFile,
    http: reqwest::Client,
) -> Result<Arc<dyn TokenSource>, IngestError> {
    match key {
        JsonKeyFile::AuthorizedUser {
            client_id,
            client_secret,
            refresh_token,
        } => Ok(Arc::new(RefreshTokenSource::new(
            http,
            DEFAULT_TOKEN_URI,
            client_id.as_str(),
            client_secret.as_str(),
            refresh_token.as_str(),
        ))),
        JsonKeyFile::ServiceAccount { client_email, .. } => Err(IngestError::Config(format!(
            "service account key for {client_email} must be exchanged externally; set 'access_token'"
        ))),
    }
}

/// Picks the token source for validated credentials.
///
/// An explicit `access_token` always wins.
pub fn token_source(
    credentials: &Credentials,
    config: &InputConfig,
    http: reqwest::Client,
) -> Result<Arc<dyn TokenSource>, IngestError> {
    if let Some(token) = config.access_token.as_deref().filter(|t| !t.is_empty()) {
        info!(auth_method = %config.auth_method, "Using configured access token");
        return Ok(Arc::new(StaticToken::new(token)));
    }

    match credentials {
        Credentials::PrivateKey {
            service_account_email,
            ..
        } => Err(IngestError::Config(format!(
            "p12 key for {service_account_email} must be exchanged externally; set 'access_token'"
        ))),
        Credentials::JsonKey(key) | Credentials::ApplicationDefault(Some(key)) => {
            key_file_source(key, http)
        }
        Credentials::ComputeEngine | Credentials::ApplicationDefault(None) => {
            Ok(Arc::new(MetadataServerToken::new(http, None)))
        }
    }
}
