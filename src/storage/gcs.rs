//! Google Cloud Storage JSON API backend.

use crate::auth::{token_source, Credentials, TokenSource};
use crate::config::InputConfig;
use crate::error::{IngestError, RemoteFailure};
use crate::storage::{ListPage, ObjectEntry, ObjectStore, ObjectStream};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::StreamExt;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// Longest path, in UTF-8 bytes, that fits in a single-byte length prefix.
pub const MAX_PAGE_TOKEN_PATH_BYTES: usize = 127;

/// Encodes `path` as a list page token that resumes *after* that key.
///
/// The token is a protobuf message with the key as field 1:
/// `0x0A, len, utf-8 bytes`, base64 encoded. Returns `None` when the path
/// is too long for a one-byte length.
pub fn encode_page_token(path: &str) -> Option<String> {
    let bytes = path.as_bytes();
    if bytes.len() > MAX_PAGE_TOKEN_PATH_BYTES {
        return None;
    }
    let mut token = Vec::with_capacity(bytes.len() + 2);
    token.push(0x0A);
    token.push(bytes.len() as u8);
    token.extend_from_slice(bytes);
    Some(STANDARD.encode(token))
}

#[derive(Debug, Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectResource>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectResource {
    name: String,
    // uint64 values are rendered as strings by the JSON API
    #[serde(default)]
    size: Option<String>,
}

impl ObjectResource {
    fn into_entry(self) -> Result<ObjectEntry, RemoteFailure> {
        let size = match self.size {
            Some(raw) => raw.parse::<u64>().map_err(|e| {
                RemoteFailure::Transport(format!("invalid size '{}' for {}: {}", raw, self.name, e))
            })?,
            None => 0,
        };
        Ok(ObjectEntry::new(self.name, size))
    }
}

/// Storage client speaking the JSON API over `reqwest`.
#[derive(Debug, Clone)]
pub struct GcsClient {
    http: reqwest::Client,
    endpoint: Url,
    tokens: Arc<dyn TokenSource>,
}

impl GcsClient {
    /// Creates a client for `endpoint` (e.g. `https://storage.googleapis.com`).
    pub fn new(
        endpoint: &str,
        application_name: &str,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, IngestError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| IngestError::Config(format!("invalid 'endpoint' {endpoint}: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(IngestError::Config(format!(
                "invalid 'endpoint' {endpoint}: not a base URL"
            )));
        }
        let http = reqwest::Client::builder()
            .user_agent(application_name)
            .build()
            .map_err(|e| IngestError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint,
            tokens,
        })
    }

    /// Builds a client and its token source from a validated configuration.
    pub fn from_config(config: &InputConfig) -> Result<Self, IngestError> {
        let credentials = Credentials::from_config(config)?;
        let http = reqwest::Client::new();
        let tokens = token_source(&credentials, config, http)?;
        Self::new(&config.endpoint, &config.application_name, tokens)
    }

    fn url(&self, segments: &[&str]) -> Result<Url, RemoteFailure> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteFailure::Other(format!("endpoint {} is not a base URL", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response, RemoteFailure> {
        let token = self.tokens.token().await?;
        debug!(%url, "GET");
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RemoteFailure::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteFailure::from_response(status.as_u16(), body))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, RemoteFailure> {
        self.get(url)
            .await?
            .json::<T>()
            .await
            .map_err(|e| RemoteFailure::Transport(format!("malformed response: {e}")))
    }
}

fn is_not_found(failure: &RemoteFailure) -> bool {
    failure.status() == Some(StatusCode::NOT_FOUND.as_u16())
}

/// Extracts the MD5 from an `x-goog-hash: crc32c=...,md5=...` header as hex.
fn md5_from_goog_hash(header: &str) -> Option<String> {
    header
        .split(',')
        .filter_map(|part| part.trim().strip_prefix("md5="))
        .next()
        .and_then(|encoded| STANDARD.decode(encoded).ok())
        .map(|raw| raw.iter().map(|b| format!("{b:02x}")).collect())
}

#[async_trait]
impl ObjectStore for GcsClient {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, RemoteFailure> {
        let mut url = self.url(&["storage", "v1", "b", bucket])?;
        url.query_pairs_mut().append_pair("fields", "name");
        match self.get(url).await {
            Ok(_) => Ok(true),
            Err(failure) if is_not_found(&failure) => Ok(false),
            Err(failure) => Err(failure),
        }
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        start_after: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<ListPage, RemoteFailure> {
        let mut url = self.url(&["storage", "v1", "b", bucket, "o"])?;
        // Keys longer than a page token can carry fall back to an inclusive
        // startOffset, with the boundary key itself dropped below.
        let mut skip_exact = None;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("prefix", prefix)
                .append_pair("fields", "items(name,size),nextPageToken");
            match (page_token, start_after) {
                (Some(token), _) => {
                    query.append_pair("pageToken", token);
                }
                (None, Some(after)) => match encode_page_token(after) {
                    Some(token) => {
                        query.append_pair("pageToken", &token);
                    }
                    None => {
                        query.append_pair("startOffset", after);
                        skip_exact = Some(after);
                    }
                },
                (None, None) => {}
            }
        }

        let list: ObjectList = self.get_json(url).await?;
        let entries = list
            .items
            .into_iter()
            .filter(|item| Some(item.name.as_str()) != skip_exact)
            .map(ObjectResource::into_entry)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ListPage {
            entries,
            next_page_token: list.next_page_token,
        })
    }

    async fn stat_object(
        &self,
        bucket: &str,
        path: &str,
    ) -> Result<Option<ObjectEntry>, RemoteFailure> {
        let mut url = self.url(&["storage", "v1", "b", bucket, "o", path])?;
        url.query_pairs_mut().append_pair("fields", "name,size");
        match self.get_json::<ObjectResource>(url).await {
            Ok(resource) => resource.into_entry().map(Some),
            Err(failure) if is_not_found(&failure) => Ok(None),
            Err(failure) => Err(failure),
        }
    }

    async fn open_stream(&self, bucket: &str, path: &str) -> Result<ObjectStream, RemoteFailure> {
        let mut url = self.url(&["storage", "v1", "b", bucket, "o", path])?;
        url.query_pairs_mut().append_pair("alt", "media");
        let response = self.get(url).await?;

        let md5 = response
            .headers()
            .get_all("x-goog-hash")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(md5_from_goog_hash);

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| RemoteFailure::Transport(e.to_string())))
            .boxed();

        Ok(ObjectStream { md5, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GcsClient {
        GcsClient::new(
            &server.uri(),
            "gcs-ingest-test",
            Arc::new(StaticToken::new("test-token")),
        )
        .unwrap()
    }

    #[test]
    fn test_encode_page_token_golden() {
        assert_eq!(encode_page_token("c").unwrap(), "CgFj");
        assert_eq!(encode_page_token("c2").unwrap(), "CgJjMg==");
        assert_eq!(encode_page_token("test.csv").unwrap(), "Cgh0ZXN0LmNzdg==");
        assert_eq!(
            encode_page_token("gcs-test/sample_01.csv").unwrap(),
            "ChZnY3MtdGVzdC9zYW1wbGVfMDEuY3N2"
        );
        assert_eq!(
            encode_page_token("テストダミー/テス123/テストダミー/テストダミ.csv").unwrap(),
            "CkPjg4bjgrnjg4jjg4Djg5/jg7wv44OG44K5MTIzL+ODhuOCueODiOODgOODn+ODvC/jg4bjgrnjg4jjg4Djg58uY3N2"
        );
    }

    #[test]
    fn test_encode_page_token_length_bound() {
        let longest = format!("{}127", "c".repeat(124));
        assert_eq!(
            encode_page_token(&longest).unwrap(),
            "Cn9jY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjY2NjMTI3"
        );
        assert!(encode_page_token(&format!("{}128", "c".repeat(125))).is_none());
    }

    #[test]
    fn test_md5_from_goog_hash() {
        // md5("hello") = 5d41402abc4b2a76b9719d911017c592
        assert_eq!(
            md5_from_goog_hash("crc32c=mnG7TA==, md5=XUFAKrxLKna5cZ2REBfFkg==").as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
        assert!(md5_from_goog_hash("crc32c=mnG7TA==").is_none());
    }

    #[tokio::test]
    async fn test_bucket_exists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/present"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"name": "present"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(
                serde_json::json!({"error": {"code": 404, "message": "Not Found"}}),
            ))
            .mount(&server)
            .await;

        let gcs = client(&server);
        assert!(gcs.bucket_exists("present").await.unwrap());
        assert!(!gcs.bucket_exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_page_uses_encoded_start_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bucket/o"))
            .and(query_param("prefix", "in/"))
            .and(query_param("pageToken", "CgFj"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {"name": "in/d", "size": "10"},
                    {"name": "in/e", "size": "0"}
                ],
                "nextPageToken": "next"
            })))
            .mount(&server)
            .await;

        let page = client(&server)
            .list_page("bucket", "in/", Some("c"), None)
            .await
            .unwrap();
        assert_eq!(
            page.entries,
            vec![ObjectEntry::new("in/d", 10), ObjectEntry::new("in/e", 0)]
        );
        assert_eq!(page.next_page_token.as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn test_list_page_falls_back_to_start_offset() {
        let server = MockServer::start().await;
        let long_key = format!("in/{}", "x".repeat(200));
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bucket/o"))
            .and(query_param("startOffset", long_key.as_str()))
            .and(query_param_is_missing("pageToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {"name": long_key, "size": "1"},
                    {"name": "in/y", "size": "2"}
                ]
            })))
            .mount(&server)
            .await;

        let page = client(&server)
            .list_page("bucket", "in/", Some(&long_key), None)
            .await
            .unwrap();
        assert_eq!(page.entries, vec![ObjectEntry::new("in/y", 2)]);
        assert!(page.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_stat_object_encodes_name_and_maps_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bucket/o/dir%2Fa.csv"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"name": "dir/a.csv", "size": "42"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bucket/o/dir%2Fgone.csv"))
            .respond_with(ResponseTemplate::new(404).set_body_json(
                serde_json::json!({"error": {"code": 404, "message": "No such object"}}),
            ))
            .mount(&server)
            .await;

        let gcs = client(&server);
        assert_eq!(
            gcs.stat_object("bucket", "dir/a.csv").await.unwrap(),
            Some(ObjectEntry::new("dir/a.csv", 42))
        );
        assert_eq!(gcs.stat_object("bucket", "dir/gone.csv").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_error_response_carries_detail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bucket/o"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "error": {"code": 403, "message": "caller does not have storage.objects.list access"}
            })))
            .mount(&server)
            .await;

        let failure = client(&server)
            .list_page("bucket", "", None, None)
            .await
            .unwrap_err();
        match failure {
            RemoteFailure::Http { status, detail, .. } => {
                assert_eq!(status, 403);
                assert_eq!(detail.unwrap().code, Some(403));
            }
            other => panic!("unexpected failure {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_stream_reads_body_and_md5() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bucket/o/hello.txt"))
            .and(query_param("alt", "media"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-goog-hash", "crc32c=mnG7TA==,md5=XUFAKrxLKna5cZ2REBfFkg==")
                    .set_body_bytes(b"hello".to_vec()),
            )
            .mount(&server)
            .await;

        let mut stream = client(&server)
            .open_stream("bucket", "hello.txt")
            .await
            .unwrap();
        assert_eq!(stream.md5.as_deref(), Some("5d41402abc4b2a76b9719d911017c592"));
        let mut body = Vec::new();
        while let Some(chunk) = stream.body.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"hello");
    }
}
