use serde_json::value::RawValue;

use crate::{
    config::Settings,
    har::{BrowserInfo, HarSnapshot, build_document},
    sanitize::Sanitizer,
    store::{Store, StoreError, iso_millis, now_unix_ms},
    uploader::{ClipRow, RemoteError, TabFilter, Uploader},
};

/// Serialized documents strictly below this size ride inline in the clip
/// row; everything else goes to a blob object.
pub const INLINE_LIMIT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipRequest {
    pub start_ms: i64,
    pub end_ms: i64,
    pub tab_ids: Option<Vec<i64>>,
    pub clip_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipReceipt {
    pub clip_id: Option<String>,
    pub entry_count: u64,
    pub size_bytes: u64,
    pub storage_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClipError {
    InvalidRange(String),
    NotConfigured(String),
    Snapshot(StoreError),
    Remote(RemoteError),
    Cancelled,
    Internal(String),
}

impl std::fmt::Display for ClipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRange(message) | Self::NotConfigured(message) => f.write_str(message),
            Self::Snapshot(err) => write!(f, "read clip snapshot: {err}"),
            Self::Remote(err) => write!(f, "{err}"),
            Self::Cancelled => f.write_str("clip request cancelled"),
            Self::Internal(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for ClipError {}

impl From<StoreError> for ClipError {
    fn from(value: StoreError) -> Self {
        Self::Snapshot(value)
    }
}

impl From<RemoteError> for ClipError {
    fn from(value: RemoteError) -> Self {
        Self::Remote(value)
    }
}

fn routes_inline(serialized_len: usize) -> bool {
    serialized_len < INLINE_LIMIT_BYTES
}

/// Blob object name for a clip uploaded at `now_ms`: the ISO timestamp with
/// colons and dots replaced by dashes.
fn blob_object_name(now_ms: i64) -> String {
    format!("clip-{}.json", iso_millis(now_ms).replace([':', '.'], "-"))
}

/// Materializes a sanitized extended-HAR slice of the buffer and ships it to
/// the remote store. Owns its snapshot for the duration of one clip.
#[derive(Debug, Clone)]
pub struct ClipBuilder {
    store: Store,
    settings: Settings,
    browser: BrowserInfo,
}

impl ClipBuilder {
    pub fn new(store: Store, settings: Settings, browser: BrowserInfo) -> Self {
        Self {
            store,
            settings,
            browser,
        }
    }

    /// `cancelled` is polled between phases; a cancelled clip short-circuits
    /// with no partial remote writes.
    pub async fn create_clip(
        &self,
        request: ClipRequest,
        cancelled: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<ClipReceipt, ClipError> {
        if request.start_ms > request.end_ms {
            return Err(ClipError::InvalidRange(format!(
                "clip start {} is after end {}",
                request.start_ms, request.end_ms
            )));
        }

        let snapshot_settings = self.settings.snapshot();
        let Some(remote) = snapshot_settings.remote.clone() else {
            return Err(ClipError::NotConfigured(
                "remote endpoint is not configured".to_owned(),
            ));
        };
        let uploader = Uploader::new(&remote.endpoint_url, &remote.endpoint_key, &remote.bucket)?;

        let tab_filter = request
            .tab_ids
            .clone()
            .filter(|tabs| !tabs.is_empty());

        if cancelled() {
            return Err(ClipError::Cancelled);
        }

        let snapshot = HarSnapshot {
            http: self
                .store
                .scan(request.start_ms, request.end_ms, tab_filter.clone())
                .await?,
            ws: self
                .store
                .scan(request.start_ms, request.end_ms, tab_filter.clone())
                .await?,
            sse: self
                .store
                .scan(request.start_ms, request.end_ms, tab_filter.clone())
                .await?,
        };
        let entry_count = snapshot.record_count();

        if cancelled() {
            return Err(ClipError::Cancelled);
        }

        let mut document = build_document(&snapshot, &self.browser);
        Sanitizer::new(
            &snapshot_settings.custom_header_patterns,
            snapshot_settings.sanitize_url_params,
        )
        .sanitize_document(&mut document);

        // Serialized exactly once; the same bytes are sized, inlined, or
        // uploaded.
        let serialized = serde_json::to_vec(&document)
            .map_err(|err| ClipError::Internal(format!("serialize HAR document: {err}")))?;
        let size_bytes = serialized.len() as u64;

        if cancelled() {
            return Err(ClipError::Cancelled);
        }

        let (har_data, storage_path) = if routes_inline(serialized.len()) {
            let raw = String::from_utf8(serialized)
                .map_err(|err| ClipError::Internal(format!("HAR document not UTF-8: {err}")))?;
            let raw = RawValue::from_string(raw)
                .map_err(|err| ClipError::Internal(format!("wrap HAR document: {err}")))?;
            (Some(raw), None)
        } else {
            let object_name = blob_object_name(now_unix_ms());
            uploader.upload_har_blob(&object_name, serialized).await?;
            (None, Some(object_name))
        };

        if cancelled() && storage_path.is_none() {
            return Err(ClipError::Cancelled);
        }

        let row = ClipRow {
            clip_name: request.clip_name.clone(),
            time_range_start: iso_millis(request.start_ms),
            time_range_end: iso_millis(request.end_ms),
            duration_seconds: (request.end_ms - request.start_ms) / 1000,
            tab_filter: match &tab_filter {
                Some(tabs) => TabFilter::Tabs { tabs: tabs.clone() },
                None => TabFilter::All,
            },
            entry_count,
            total_size_bytes: size_bytes,
            har_data,
            storage_path: storage_path.clone(),
        };

        let clip_id = match uploader.insert_clip_row(&row).await {
            Ok(clip_id) => clip_id,
            Err(err) => {
                if let Some(orphan) = &storage_path {
                    // The blob stays behind; sweeping orphans is out of band.
                    tracing::warn!(storage_path = %orphan, error = %err, "clip row write failed after blob upload");
                }
                return Err(err.into());
            }
        };

        Ok(ClipReceipt {
            clip_id,
            entry_count,
            size_bytes,
            storage_path,
        })
    }
}
