use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use rusqlite::{Connection, OpenFlags, params, params_from_iter};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

const SCHEMA_VERSION: i32 = 1;
pub const CAPTURE_DB_FILENAME: &str = "capture.db";

pub const META_LAST_CLEANUP_AT: &str = "last-cleanup-at";
pub const META_LAST_USAGE_BYTES: &str = "last-usage-bytes";
pub const META_PAUSED: &str = "paused";

/// The three event streams held by the store. Each stream has its own table;
/// cross-stream ordering is recovered at clip-build time by the timestamp
/// sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Http,
    Ws,
    Sse,
}

impl Stream {
    pub const ALL: [Stream; 3] = [Stream::Http, Stream::Ws, Stream::Sse];

    fn table(self) -> &'static str {
        match self {
            Self::Http => "http_entries",
            Self::Ws => "ws_frames",
            Self::Sse => "sse_events",
        }
    }
}

/// Common envelope shared by all stream records. `ts` is epoch milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub entry_id: String,
    pub ts: i64,
    pub tab_id: i64,
    pub hostname: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

impl NameValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostData {
    pub mime_type: String,
    pub text: String,
}

/// HAR-shaped request half of an HTTP entry. Headers are stored raw;
/// scrubbing happens at clip time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub headers: Vec<NameValue>,
    pub query_string: Vec<NameValue>,
    pub cookies: Vec<NameValue>,
    pub headers_size: i64,
    pub body_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<PostData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseContent {
    pub size: i64,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub status: i64,
    pub status_text: String,
    pub http_version: String,
    pub headers: Vec<NameValue>,
    pub cookies: Vec<NameValue>,
    pub content: ResponseContent,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: i64,
    #[serde(rename = "_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One completed HTTP transaction. Created only on transaction termination
/// and never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpEntryRecord {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub started_at: String,
    pub request: RequestRecord,
    pub response: ResponseRecord,
    pub time_ms: f64,
    pub resource_type: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WsDirection {
    Send,
    Receive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WsFrameRecord {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub connection_id: String,
    pub url: String,
    pub direction: WsDirection,
    pub opcode: i64,
    pub data: String,
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SseEventRecord {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub url: String,
    pub event_type: String,
    pub data: String,
    pub event_id: String,
}

/// A record that can live in one of the three streams.
pub trait StreamRecord: Serialize + DeserializeOwned + Send + 'static {
    const STREAM: Stream;

    fn envelope(&self) -> &Envelope;
    fn envelope_mut(&mut self) -> &mut Envelope;
}

impl StreamRecord for HttpEntryRecord {
    const STREAM: Stream = Stream::Http;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }
}

impl StreamRecord for WsFrameRecord {
    const STREAM: Stream = Stream::Ws;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }
}

impl StreamRecord for SseEventRecord {
    const STREAM: Stream = Stream::Sse;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Closed,
    DuplicateId(String),
    Quota(String),
    Internal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "store is closed"),
            Self::DuplicateId(entry_id) => {
                write!(f, "record with identifier `{entry_id}` already stored")
            }
            Self::Quota(message) | Self::Internal(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

fn internal(context: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Internal(format!("{context}: {err}"))
}

fn classify_sqlite_error(entry_id: &str, err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, ref message) = err {
        match failure.code {
            rusqlite::ErrorCode::ConstraintViolation => {
                return StoreError::DuplicateId(entry_id.to_owned());
            }
            rusqlite::ErrorCode::DiskFull => {
                return StoreError::Quota(format!(
                    "append rejected by host: {}",
                    message.as_deref().unwrap_or("database full")
                ));
            }
            _ => {}
        }
    }
    internal("append record", err)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageEstimate {
    pub usage_bytes: u64,
    pub quota_bytes: u64,
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}

/// Renders epoch milliseconds as an ISO-8601 UTC timestamp with millisecond
/// precision, e.g. `2024-05-01T12:30:00.250Z`.
pub fn iso_millis(ts: i64) -> String {
    use chrono::{DateTime, SecondsFormat, Utc};
    DateTime::<Utc>::from_timestamp_millis(ts)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Durable, crash-safe storage for the three event streams plus metadata.
/// Every operation is a single SQLite transaction; scans under WAL are
/// snapshot-consistent.
#[derive(Debug, Clone)]
pub struct Store {
    db_path: PathBuf,
    closed: Arc<AtomicBool>,
}

impl Store {
    pub fn open(db_path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| internal("create store dir", err))?;
        }

        let store = Self {
            db_path,
            closed: Arc::new(AtomicBool::new(false)),
        };
        store.init()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Marks the store closed. Operations issued afterwards fail with
    /// `StoreError::Closed`; in-flight blocking work is allowed to finish.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub async fn append<R: StreamRecord>(&self, mut record: R) -> Result<String, StoreError> {
        if record.envelope().ts == 0 {
            record.envelope_mut().ts = now_unix_ms();
        }
        let entry_id = record.envelope().entry_id.clone();
        self.run_blocking("append", move |path| append_blocking(path, &record))
            .await?;
        Ok(entry_id)
    }

    /// Yields records with `t_lo <= ts <= t_hi`, ascending by timestamp with
    /// ties broken by insertion order. When `tab_filter` is present only
    /// records whose tab identifier is in the set are returned.
    pub async fn scan<R: StreamRecord>(
        &self,
        t_lo: i64,
        t_hi: i64,
        tab_filter: Option<Vec<i64>>,
    ) -> Result<Vec<R>, StoreError> {
        self.run_blocking("scan", move |path| {
            scan_blocking(path, t_lo, t_hi, tab_filter.as_deref())
        })
        .await
    }

    pub async fn delete_older_than(&self, stream: Stream, t_cut: i64) -> Result<u64, StoreError> {
        self.run_blocking("delete_older_than", move |path| {
            delete_older_than_blocking(path, stream, t_cut)
        })
        .await
    }

    /// Removes the `n` records with smallest timestamp, ascending.
    pub async fn delete_oldest(&self, stream: Stream, n: u64) -> Result<u64, StoreError> {
        if n == 0 {
            return Ok(0);
        }
        self.run_blocking("delete_oldest", move |path| {
            delete_oldest_blocking(path, stream, n)
        })
        .await
    }

    pub async fn count(&self, stream: Stream) -> Result<u64, StoreError> {
        self.run_blocking("count", move |path| count_blocking(path, stream))
            .await
    }

    pub async fn extremes(&self, stream: Stream) -> Result<Option<(i64, i64)>, StoreError> {
        self.run_blocking("extremes", move |path| extremes_blocking(path, stream))
            .await
    }

    /// Best-effort on-disk byte cost (database plus WAL sidecar) and the
    /// database's growth ceiling as the host-provided quota.
    pub async fn estimate_usage(&self) -> Result<UsageEstimate, StoreError> {
        self.run_blocking("estimate_usage", estimate_usage_blocking)
            .await
    }

    pub async fn put_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let key = key.to_owned();
        let value_json =
            serde_json::to_string(value).map_err(|err| internal("serialize meta value", err))?;
        self.run_blocking("put_meta", move |path| {
            put_meta_blocking(path, &key, &value_json)
        })
        .await
    }

    pub async fn get_meta<T: DeserializeOwned + Send + 'static>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let key = key.to_owned();
        self.run_blocking("get_meta", move |path| get_meta_blocking(path, &key))
            .await
    }

    /// Wipes the three streams, each in its own transaction. Metadata is
    /// left intact.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        self.run_blocking("clear_all", clear_all_blocking).await
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = open_connection(&self.db_path)?;
        migrate(&conn)
    }

    async fn run_blocking<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StoreError> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || f(&db_path))
            .await
            .map_err(|err| internal(&format!("join {op} task"), err))?
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .map_err(|err| internal("open sqlite", err))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|err| internal("set PRAGMA journal_mode=WAL", err))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|err| internal("set PRAGMA synchronous=NORMAL", err))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(|err| internal("set sqlite busy_timeout", err))?;

    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .map_err(|err| internal("read PRAGMA user_version", err))?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS http_entries (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  entry_id TEXT NOT NULL UNIQUE,
                  ts INTEGER NOT NULL,
                  tab_id INTEGER NOT NULL,
                  hostname TEXT NOT NULL,
                  record_json TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS http_entries_ts_idx ON http_entries(ts);
                CREATE INDEX IF NOT EXISTS http_entries_hostname_idx ON http_entries(hostname);
                CREATE INDEX IF NOT EXISTS http_entries_tab_idx ON http_entries(tab_id);

                CREATE TABLE IF NOT EXISTS ws_frames (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  entry_id TEXT NOT NULL UNIQUE,
                  ts INTEGER NOT NULL,
                  tab_id INTEGER NOT NULL,
                  hostname TEXT NOT NULL,
                  record_json TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS ws_frames_ts_idx ON ws_frames(ts);
                CREATE INDEX IF NOT EXISTS ws_frames_hostname_idx ON ws_frames(hostname);
                CREATE INDEX IF NOT EXISTS ws_frames_tab_idx ON ws_frames(tab_id);

                CREATE TABLE IF NOT EXISTS sse_events (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  entry_id TEXT NOT NULL UNIQUE,
                  ts INTEGER NOT NULL,
                  tab_id INTEGER NOT NULL,
                  hostname TEXT NOT NULL,
                  record_json TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS sse_events_ts_idx ON sse_events(ts);
                CREATE INDEX IF NOT EXISTS sse_events_hostname_idx ON sse_events(hostname);
                CREATE INDEX IF NOT EXISTS sse_events_tab_idx ON sse_events(tab_id);

                CREATE TABLE IF NOT EXISTS meta (
                  key TEXT PRIMARY KEY,
                  value_json TEXT NOT NULL
                );
                "#,
            )
            .map_err(|err| internal("create sqlite schema v1", err))?;

            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(|err| internal("set PRAGMA user_version=1", err))?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => Err(StoreError::Internal(format!(
            "unsupported capture.db schema version {user_version} (expected {SCHEMA_VERSION})"
        ))),
    }
}

fn append_blocking<R: StreamRecord>(path: &Path, record: &R) -> Result<(), StoreError> {
    let conn = open_connection(path)?;
    let envelope = record.envelope();
    let record_json =
        serde_json::to_string(record).map_err(|err| internal("serialize record", err))?;

    let sql = format!(
        "INSERT INTO {} (entry_id, ts, tab_id, hostname, record_json) VALUES (?1, ?2, ?3, ?4, ?5)",
        R::STREAM.table()
    );
    conn.execute(
        &sql,
        params![
            envelope.entry_id,
            envelope.ts,
            envelope.tab_id,
            envelope.hostname,
            record_json,
        ],
    )
    .map_err(|err| classify_sqlite_error(&envelope.entry_id, err))?;
    Ok(())
}

fn scan_blocking<R: StreamRecord>(
    path: &Path,
    t_lo: i64,
    t_hi: i64,
    tab_filter: Option<&[i64]>,
) -> Result<Vec<R>, StoreError> {
    let conn = open_connection(path)?;

    let mut sql = format!(
        "SELECT record_json FROM {} WHERE ts >= ?1 AND ts <= ?2",
        R::STREAM.table()
    );
    let mut bound: Vec<i64> = vec![t_lo, t_hi];
    if let Some(tabs) = tab_filter {
        let placeholders = (3..tabs.len() + 3)
            .map(|idx| format!("?{idx}"))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" AND tab_id IN ({placeholders})"));
        bound.extend_from_slice(tabs);
    }
    sql.push_str(" ORDER BY ts ASC, id ASC");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|err| internal("prepare scan", err))?;
    let mut rows = stmt
        .query(params_from_iter(bound))
        .map_err(|err| internal("query scan", err))?;

    let mut records = Vec::new();
    while let Some(row) = rows.next().map_err(|err| internal("iterate scan", err))? {
        let record_json: String = row
            .get(0)
            .map_err(|err| internal("read scan record_json", err))?;
        let record: R = serde_json::from_str(&record_json)
            .map_err(|err| internal("deserialize scan record", err))?;
        records.push(record);
    }
    Ok(records)
}

fn delete_older_than_blocking(path: &Path, stream: Stream, t_cut: i64) -> Result<u64, StoreError> {
    let conn = open_connection(path)?;
    let deleted = conn
        .execute(
            &format!("DELETE FROM {} WHERE ts <= ?1", stream.table()),
            params![t_cut],
        )
        .map_err(|err| internal("delete by age", err))?;
    Ok(deleted as u64)
}

fn delete_oldest_blocking(path: &Path, stream: Stream, n: u64) -> Result<u64, StoreError> {
    let conn = open_connection(path)?;
    let table = stream.table();
    let limit = i64::try_from(n).unwrap_or(i64::MAX);
    let deleted = conn
        .execute(
            &format!(
                "DELETE FROM {table} WHERE id IN \
                 (SELECT id FROM {table} ORDER BY ts ASC, id ASC LIMIT ?1)"
            ),
            params![limit],
        )
        .map_err(|err| internal("delete oldest", err))?;
    Ok(deleted as u64)
}

fn count_blocking(path: &Path, stream: Stream) -> Result<u64, StoreError> {
    let conn = open_connection(path)?;
    let count: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM {}", stream.table()),
            [],
            |row| row.get(0),
        )
        .map_err(|err| internal("count stream", err))?;
    Ok(count as u64)
}

fn extremes_blocking(path: &Path, stream: Stream) -> Result<Option<(i64, i64)>, StoreError> {
    let conn = open_connection(path)?;
    let (min_ts, max_ts): (Option<i64>, Option<i64>) = conn
        .query_row(
            &format!("SELECT MIN(ts), MAX(ts) FROM {}", stream.table()),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|err| internal("query stream extremes", err))?;
    Ok(min_ts.zip(max_ts))
}

fn estimate_usage_blocking(path: &Path) -> Result<UsageEstimate, StoreError> {
    let conn = open_connection(path)?;
    let page_size: i64 = conn
        .query_row("PRAGMA page_size;", [], |row| row.get(0))
        .map_err(|err| internal("read PRAGMA page_size", err))?;
    let max_page_count: i64 = conn
        .query_row("PRAGMA max_page_count;", [], |row| row.get(0))
        .map_err(|err| internal("read PRAGMA max_page_count", err))?;

    let mut usage_bytes = file_len(path);
    let mut wal_path = path.as_os_str().to_owned();
    wal_path.push("-wal");
    usage_bytes += file_len(Path::new(&wal_path));

    Ok(UsageEstimate {
        usage_bytes,
        quota_bytes: (page_size as u64).saturating_mul(max_page_count as u64),
    })
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

fn put_meta_blocking(path: &Path, key: &str, value_json: &str) -> Result<(), StoreError> {
    let conn = open_connection(path)?;
    conn.execute(
        "INSERT INTO meta (key, value_json) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        params![key, value_json],
    )
    .map_err(|err| internal("write meta", err))?;
    Ok(())
}

fn get_meta_blocking<T: DeserializeOwned>(path: &Path, key: &str) -> Result<Option<T>, StoreError> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare("SELECT value_json FROM meta WHERE key = ?1")
        .map_err(|err| internal("prepare meta read", err))?;
    let mut rows = stmt
        .query(params![key])
        .map_err(|err| internal("query meta", err))?;

    let Some(row) = rows.next().map_err(|err| internal("iterate meta", err))? else {
        return Ok(None);
    };
    let value_json: String = row
        .get(0)
        .map_err(|err| internal("read meta value", err))?;
    let value = serde_json::from_str(&value_json)
        .map_err(|err| internal("deserialize meta value", err))?;
    Ok(Some(value))
}

fn clear_all_blocking(path: &Path) -> Result<(), StoreError> {
    let conn = open_connection(path)?;
    for stream in Stream::ALL {
        conn.execute(&format!("DELETE FROM {}", stream.table()), [])
            .map_err(|err| internal("clear stream", err))?;
    }
    Ok(())
}

/// Minimal HTTP entry for tests across the crate.
#[cfg(test)]
pub(crate) fn sample_http_entry(
    entry_id: &str,
    ts: i64,
    tab_id: i64,
    host: &str,
) -> HttpEntryRecord {
    HttpEntryRecord {
        envelope: Envelope {
            entry_id: entry_id.to_owned(),
            ts,
            tab_id,
            hostname: host.to_owned(),
        },
        started_at: iso_millis(ts),
        request: RequestRecord {
            method: "GET".to_owned(),
            url: format!("https://{host}/"),
            http_version: "HTTP/1.1".to_owned(),
            ..RequestRecord::default()
        },
        response: ResponseRecord {
            status: 200,
            status_text: "OK".to_owned(),
            http_version: "HTTP/1.1".to_owned(),
            content: ResponseContent {
                size: 0,
                mime_type: "text/plain".to_owned(),
                text: None,
                encoding: None,
            },
            ..ResponseRecord::default()
        },
        time_ms: 1.0,
        resource_type: "xhr".to_owned(),
    }
}
