use std::{sync::OnceLock, time::Duration};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{Method, Request, StatusCode, Uri, header};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use serde::Serialize;
use serde_json::value::RawValue;

type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    Status { status: u16, body: String },
    Transport(String),
    Timeout,
    InvalidEndpoint(String),
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status { status, body } => {
                write!(f, "remote store returned {status}: {body}")
            }
            Self::Transport(message) => write!(f, "remote store request failed: {message}"),
            Self::Timeout => write!(f, "remote store request timed out"),
            Self::InvalidEndpoint(message) => write!(f, "invalid endpoint: {message}"),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Wire shape of one clip row. Exactly one of `har_data` and `storage_path`
/// is non-null.
#[derive(Debug, Serialize)]
pub struct ClipRow {
    pub clip_name: Option<String>,
    pub time_range_start: String,
    pub time_range_end: String,
    pub duration_seconds: i64,
    pub tab_filter: TabFilter,
    pub entry_count: u64,
    pub total_size_bytes: u64,
    pub har_data: Option<Box<RawValue>>,
    pub storage_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TabFilter {
    All,
    Tabs { tabs: Vec<i64> },
}

/// Whether a process-wide rustls crypto provider is available, installing
/// ring on first use. Losing the install race to another thread still counts
/// as ready; the answer never changes afterwards, so it is cached.
fn tls_provider_ready() -> bool {
    static READY: OnceLock<bool> = OnceLock::new();
    *READY.get_or_init(|| {
        rustls::crypto::CryptoProvider::get_default().is_some()
            || rustls::crypto::ring::default_provider()
                .install_default()
                .is_ok()
            || rustls::crypto::CryptoProvider::get_default().is_some()
    })
}

fn build_https_client() -> Result<HttpsClient, RemoteError> {
    if !tls_provider_ready() {
        return Err(RemoteError::Transport(
            "no process-wide TLS crypto provider available".to_owned(),
        ));
    }
    let connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|err| RemoteError::Transport(format!("read system certificate roots: {err}")))?
        .https_or_http()
        .enable_all_versions()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

/// Stateless HTTPS client for the remote clip store. Every request carries
/// the endpoint key in both `apikey` and `Authorization: Bearer` headers.
#[derive(Debug, Clone)]
pub struct Uploader {
    client: HttpsClient,
    endpoint_url: String,
    endpoint_key: String,
    bucket: String,
}

impl Uploader {
    pub fn new(endpoint_url: &str, endpoint_key: &str, bucket: &str) -> Result<Self, RemoteError> {
        Ok(Self {
            client: build_https_client()?,
            endpoint_url: endpoint_url.trim_end_matches('/').to_owned(),
            endpoint_key: endpoint_key.to_owned(),
            bucket: bucket.to_owned(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Inserts one clip row; returns the row identifier from the returned
    /// representation when the remote provides one.
    pub async fn insert_clip_row(&self, row: &ClipRow) -> Result<Option<String>, RemoteError> {
        let uri = self.parse_uri(&format!("{}/rest/v1/clips", self.endpoint_url))?;
        let body = serde_json::to_vec(row)
            .map_err(|err| RemoteError::Transport(format!("serialize clip row: {err}")))?;

        let request = self
            .base_request(Method::POST, uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header("prefer", "return=representation")
            .body(Full::new(Bytes::from(body)))
            .map_err(|err| RemoteError::Transport(format!("build row request: {err}")))?;

        let (status, response_body) = self.dispatch(request).await?;
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body: response_body,
            });
        }
        Ok(extract_row_id(&response_body))
    }

    /// Writes the serialized HAR bytes to a storage object, upserting on
    /// name collision.
    pub async fn upload_har_blob(
        &self,
        object_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), RemoteError> {
        let uri = self.parse_uri(&format!(
            "{}/storage/v1/object/{}/{object_name}",
            self.endpoint_url, self.bucket
        ))?;

        let request = self
            .base_request(Method::POST, uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-upsert", "true")
            .body(Full::new(Bytes::from(bytes)))
            .map_err(|err| RemoteError::Transport(format!("build blob request: {err}")))?;

        let (status, response_body) = self.dispatch(request).await?;
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body: response_body,
            });
        }
        Ok(())
    }

    /// Probes the REST surface with the candidate credentials.
    pub async fn test_connection(endpoint_url: &str, endpoint_key: &str) -> Result<(), RemoteError> {
        let uploader = Self::new(endpoint_url, endpoint_key, "clips")?;
        let uri = uploader.parse_uri(&format!("{}/rest/v1/", uploader.endpoint_url))?;
        let request = uploader
            .base_request(Method::GET, uri)
            .body(Full::new(Bytes::new()))
            .map_err(|err| RemoteError::Transport(format!("build probe request: {err}")))?;

        let (status, response_body) = uploader.dispatch(request).await?;
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body: response_body,
            });
        }
        Ok(())
    }

    fn base_request(&self, method: Method, uri: Uri) -> hyper::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("apikey", &self.endpoint_key)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.endpoint_key),
            )
    }

    fn parse_uri(&self, raw: &str) -> Result<Uri, RemoteError> {
        raw.parse::<Uri>()
            .map_err(|err| RemoteError::InvalidEndpoint(format!("{raw}: {err}")))
    }

    async fn dispatch(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<(StatusCode, String), RemoteError> {
        let response = tokio::time::timeout(UPLOAD_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| RemoteError::Timeout)?
            .map_err(|err| RemoteError::Transport(err.to_string()))?;

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|err| RemoteError::Transport(format!("read response body: {err}")))?
            .to_bytes();
        let body = String::from_utf8_lossy(&body_bytes).into_owned();
        Ok((status, body))
    }
}

/// Pulls the row identifier out of a `return=representation` reply.
fn extract_row_id(body: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
    let id = parsed.get(0)?.get("id")?;
    match id {
        serde_json::Value::String(id) => Some(id.clone()),
        serde_json::Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{ClipRow, TabFilter, extract_row_id, tls_provider_ready};

    #[test]
    fn tls_provider_becomes_ready_on_first_use() {
        assert!(tls_provider_ready());
        // Cached answer on the second call.
        assert!(tls_provider_ready());
    }

    #[test]
    fn clip_row_serializes_null_har_data_for_blob_rows() {
        let row = ClipRow {
            clip_name: None,
            time_range_start: "2024-05-01T00:00:00.000Z".to_owned(),
            time_range_end: "2024-05-01T01:00:00.000Z".to_owned(),
            duration_seconds: 3600,
            tab_filter: TabFilter::All,
            entry_count: 12,
            total_size_bytes: 2_000_000,
            har_data: None,
            storage_path: Some("clip-2024-05-01T00-00-00-000Z.json".to_owned()),
        };
        let json = serde_json::to_value(&row).unwrap();

        assert_eq!(json["har_data"], serde_json::Value::Null);
        assert_eq!(
            json["storage_path"],
            serde_json::json!("clip-2024-05-01T00-00-00-000Z.json")
        );
        assert_eq!(json["tab_filter"], serde_json::json!({"type": "all"}));
    }

    #[test]
    fn clip_row_serializes_inline_har_data_verbatim() {
        let har = serde_json::value::RawValue::from_string(r#"{"log":{"version":"1.2"}}"#.to_owned())
            .unwrap();
        let row = ClipRow {
            clip_name: Some("repro".to_owned()),
            time_range_start: "2024-05-01T00:00:00.000Z".to_owned(),
            time_range_end: "2024-05-01T01:00:00.000Z".to_owned(),
            duration_seconds: 3600,
            tab_filter: TabFilter::Tabs { tabs: vec![4, 9] },
            entry_count: 1,
            total_size_bytes: 25,
            har_data: Some(har),
            storage_path: None,
        };
        let json = serde_json::to_value(&row).unwrap();

        assert_eq!(json["storage_path"], serde_json::Value::Null);
        assert_eq!(json["har_data"]["log"]["version"], serde_json::json!("1.2"));
        assert_eq!(
            json["tab_filter"],
            serde_json::json!({"type": "tabs", "tabs": [4, 9]})
        );
    }

    #[test]
    fn row_id_extraction_handles_string_and_numeric_ids() {
        assert_eq!(
            extract_row_id(r#"[{"id":"4f2c"}]"#),
            Some("4f2c".to_owned())
        );
        assert_eq!(extract_row_id(r#"[{"id":17}]"#), Some("17".to_owned()));
        assert_eq!(extract_row_id(r#"[]"#), None);
        assert_eq!(extract_row_id("not json"), None);
    }
}
