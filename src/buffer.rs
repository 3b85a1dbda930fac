use std::time::Duration;

use serde::Serialize;

use crate::{
    config::Settings,
    store::{
        META_LAST_CLEANUP_AT, META_LAST_USAGE_BYTES, Store, StoreError, Stream, now_unix_ms,
    },
};

/// Age horizon of the rolling buffer.
pub const MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;

/// Cadence of the scheduled cleanup pass.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Coarse per-record byte estimate used to turn an eviction byte budget into
/// a record count. Convergence is amortized over successive passes.
const ESTIMATED_RECORD_BYTES: u64 = 2000;

const EVICTION_TARGET_RATIO: f64 = 0.9;
const WARNING_RATIO: f64 = 0.8;
const CRITICAL_RATIO: f64 = 0.95;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Pressure {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BufferSpan {
    pub oldest_ts: Option<i64>,
    pub newest_ts: Option<i64>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamCounts {
    pub http: u64,
    pub ws: u64,
    pub sse: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BufferStatus {
    #[serde(flatten)]
    pub span: BufferSpan,
    pub counts: StreamCounts,
    pub pressure: Pressure,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired: u64,
    pub evicted: u64,
    pub usage_bytes: u64,
}

/// Records-per-stream to evict when usage exceeds the cap. Aims at 90% of
/// cap using the coarse per-record estimate.
pub fn eviction_per_stream(usage_bytes: u64, cap_bytes: u64) -> u64 {
    if usage_bytes <= cap_bytes {
        return 0;
    }
    let target = (cap_bytes as f64 * EVICTION_TARGET_RATIO) as u64;
    let to_evict_bytes = usage_bytes.saturating_sub(target);
    to_evict_bytes.div_ceil(ESTIMATED_RECORD_BYTES * Stream::ALL.len() as u64)
}

pub fn pressure_for(usage_bytes: u64, cap_bytes: u64) -> Pressure {
    let usage = usage_bytes as f64;
    let cap = cap_bytes as f64;
    if usage >= cap * CRITICAL_RATIO {
        Pressure::Critical
    } else if usage >= cap * WARNING_RATIO {
        Pressure::Warning
    } else {
        Pressure::Normal
    }
}

/// True when the cap, not age, is what limits retention: the buffer holds
/// less than the full horizon while usage is already near the cap.
pub fn is_truncated(duration_ms: i64, usage_bytes: u64, cap_bytes: u64) -> bool {
    duration_ms < MAX_AGE_MS && usage_bytes as f64 > cap_bytes as f64 * WARNING_RATIO
}

/// Enforces the two buffer invariants: nothing older than 24 hours survives
/// a pass, and usage converges below the configured cap. Failures are
/// logged; the next pass retries.
#[derive(Debug, Clone)]
pub struct BufferManager {
    store: Store,
    settings: Settings,
}

impl BufferManager {
    pub fn new(store: Store, settings: Settings) -> Self {
        Self { store, settings }
    }

    pub async fn run_pass(&self) -> Result<CleanupReport, StoreError> {
        self.run_pass_at(now_unix_ms()).await
    }

    pub async fn run_pass_at(&self, now_ms: i64) -> Result<CleanupReport, StoreError> {
        let t_cut = now_ms - MAX_AGE_MS;
        let mut expired = 0;
        for stream in Stream::ALL {
            expired += self.store.delete_older_than(stream, t_cut).await?;
        }

        let usage_bytes = self.store.estimate_usage().await?.usage_bytes;
        let cap_bytes = self.settings.cap_bytes();

        let mut evicted = 0;
        let per_stream = eviction_per_stream(usage_bytes, cap_bytes);
        if per_stream > 0 {
            for stream in Stream::ALL {
                evicted += self.store.delete_oldest(stream, per_stream).await?;
            }
        }

        self.store.put_meta(META_LAST_CLEANUP_AT, &now_ms).await?;
        self.store
            .put_meta(META_LAST_USAGE_BYTES, &usage_bytes)
            .await?;

        if expired > 0 || evicted > 0 {
            tracing::info!(expired, evicted, usage_bytes, "cleanup pass");
        }
        Ok(CleanupReport {
            expired,
            evicted,
            usage_bytes,
        })
    }

    /// Oldest and newest timestamps across the three streams.
    pub async fn buffer_span(&self) -> Result<BufferSpan, StoreError> {
        let mut oldest: Option<i64> = None;
        let mut newest: Option<i64> = None;
        for stream in Stream::ALL {
            if let Some((min_ts, max_ts)) = self.store.extremes(stream).await? {
                oldest = Some(oldest.map_or(min_ts, |current| current.min(min_ts)));
                newest = Some(newest.map_or(max_ts, |current| current.max(max_ts)));
            }
        }
        let duration_ms = match (oldest, newest) {
            (Some(oldest), Some(newest)) => newest - oldest,
            _ => 0,
        };
        Ok(BufferSpan {
            oldest_ts: oldest,
            newest_ts: newest,
            duration_ms,
        })
    }

    pub async fn status(&self) -> Result<BufferStatus, StoreError> {
        let span = self.buffer_span().await?;
        let usage_bytes = self.store.estimate_usage().await?.usage_bytes;
        let cap_bytes = self.settings.cap_bytes();
        let counts = StreamCounts {
            http: self.store.count(Stream::Http).await?,
            ws: self.store.count(Stream::Ws).await?,
            sse: self.store.count(Stream::Sse).await?,
        };
        Ok(BufferStatus {
            span,
            counts,
            pressure: pressure_for(usage_bytes, cap_bytes),
            truncated: is_truncated(span.duration_ms, usage_bytes, cap_bytes),
        })
    }
}
