use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// URL schemes the tap refuses to observe. Tabs on these surfaces are never
/// attached.
const PRIVILEGED_URL_PREFIXES: [&str; 6] = [
    "chrome://",
    "chrome-extension://",
    "edge://",
    "about:",
    "devtools://",
    "chrome-devtools://",
];

pub fn is_capturable_url(url: &str) -> bool {
    !PRIVILEGED_URL_PREFIXES
        .iter()
        .any(|prefix| url.starts_with(prefix))
}

/// Converts a tap timestamp (seconds, fractional) to epoch milliseconds.
pub fn timestamp_ms(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TapRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub post_data: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TapResponse {
    pub status: i64,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub encoded_data_length: i64,
    #[serde(default)]
    pub url: String,
}

/// Raw events delivered by the browser-side tap, one channel per attached
/// tab. Timestamps arrive in seconds and are converted on ingest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TapEvent {
    RequestWillBeSent {
        request_id: String,
        timestamp: f64,
        request: TapRequest,
        #[serde(default)]
        resource_type: String,
        #[serde(default)]
        redirect_response: Option<TapResponse>,
    },
    ResponseReceived {
        request_id: String,
        response: TapResponse,
    },
    LoadingFinished {
        request_id: String,
        encoded_data_length: i64,
    },
    LoadingFailed {
        request_id: String,
        error_text: String,
    },
    WsCreated {
        request_id: String,
        url: String,
    },
    WsFrameSent {
        request_id: String,
        timestamp: f64,
        opcode: i64,
        payload_data: String,
    },
    WsFrameReceived {
        request_id: String,
        timestamp: f64,
        opcode: i64,
        payload_data: String,
    },
    WsClosed {
        request_id: String,
    },
    SseMessage {
        request_id: String,
        timestamp: f64,
        #[serde(default)]
        event_name: String,
        #[serde(default)]
        event_id: String,
        data: String,
    },
}

/// Reply to a body-retrieval call. `body` is base64 when the tap says so.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TapBody {
    pub body: String,
    #[serde(rename = "base64Encoded")]
    pub base64_encoded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapError {
    AttachRefused(String),
    BodyUnavailable(String),
    Channel(String),
}

impl std::fmt::Display for TapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AttachRefused(message) => write!(f, "tap refused attach: {message}"),
            Self::BodyUnavailable(message) => write!(f, "response body unavailable: {message}"),
            Self::Channel(message) => write!(f, "tap channel error: {message}"),
        }
    }
}

impl std::error::Error for TapError {}

/// Outbound half of the tap contract: attach/detach per tab and the
/// body-retrieval round-trip issued on loading_finished.
#[async_trait::async_trait]
pub trait Tap: Send + Sync {
    async fn attach(&self, tab_id: i64) -> Result<(), TapError>;

    async fn detach(&self, tab_id: i64) -> Result<(), TapError>;

    async fn fetch_response_body(
        &self,
        tab_id: i64,
        request_id: &str,
    ) -> Result<TapBody, TapError>;
}
