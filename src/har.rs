use serde::{Deserialize, Serialize};

use crate::store::{
    HttpEntryRecord, RequestRecord, ResponseRecord, SseEventRecord, WsDirection, WsFrameRecord,
    iso_millis,
};

pub const HAR_VERSION: &str = "1.2";
pub const CREATOR_NAME: &str = "Browser Clip";

/// Identity of the browser being observed, recorded in the HAR `browser`
/// field. Falls back to "unknown" when the host cannot tell us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserInfo {
    pub name: String,
    pub version: String,
}

impl Default for BrowserInfo {
    fn default() -> Self {
        Self {
            name: "unknown".to_owned(),
            version: "unknown".to_owned(),
        }
    }
}

/// The three stream slices a clip is built from, already filtered by time
/// window and tab set. Owned by the clip builder for the duration of one
/// clip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HarSnapshot {
    pub http: Vec<HttpEntryRecord>,
    pub ws: Vec<WsFrameRecord>,
    pub sse: Vec<SseEventRecord>,
}

impl HarSnapshot {
    pub fn record_count(&self) -> u64 {
        (self.http.len() + self.ws.len() + self.sse.len()) as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarDocument {
    pub log: HarLog,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarLog {
    pub version: String,
    pub creator: HarCreator,
    pub browser: HarBrowser,
    pub pages: Vec<HarPage>,
    pub entries: Vec<HarEntry>,
    #[serde(rename = "_webSocketMessages")]
    pub web_socket_messages: Vec<HarWsMessage>,
    #[serde(rename = "_serverSentEvents")]
    pub server_sent_events: Vec<HarSseEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarCreator {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarBrowser {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HarPage {
    pub started_date_time: String,
    pub id: String,
    pub title: String,
    pub page_timings: HarPageTimings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HarPageTimings {
    pub on_content_load: i64,
    pub on_load: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    pub started_date_time: String,
    pub time: f64,
    pub request: RequestRecord,
    pub response: ResponseRecord,
    pub cache: serde_json::Map<String, serde_json::Value>,
    pub timings: HarTimings,
    #[serde(rename = "_tabId")]
    pub tab_id: i64,
    #[serde(rename = "_hostname")]
    pub hostname: String,
    #[serde(rename = "_resourceType")]
    pub resource_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarTimings {
    pub blocked: f64,
    pub dns: f64,
    pub connect: f64,
    pub ssl: f64,
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HarWsMessage {
    pub timestamp: String,
    pub tab_id: i64,
    pub url: String,
    pub connection_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub opcode: i64,
    pub data: String,
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HarSseEvent {
    pub timestamp: String,
    pub tab_id: i64,
    pub url: String,
    pub event: String,
    pub data: String,
    pub id: String,
}

/// Assembles the extended HAR document from a snapshot. Entries are sorted
/// ascending by timestamp with stable ties; pages are derived one per unique
/// hostname in first-seen order.
pub fn build_document(snapshot: &HarSnapshot, browser: &BrowserInfo) -> HarDocument {
    let mut http = snapshot.http.clone();
    http.sort_by_key(|entry| entry.envelope.ts);
    let mut ws = snapshot.ws.clone();
    ws.sort_by_key(|frame| frame.envelope.ts);
    let mut sse = snapshot.sse.clone();
    sse.sort_by_key(|event| event.envelope.ts);

    let pages = derive_pages(&http);
    let entries = http.into_iter().map(har_entry).collect();
    let web_socket_messages = ws.into_iter().map(har_ws_message).collect();
    let server_sent_events = sse.into_iter().map(har_sse_event).collect();

    HarDocument {
        log: HarLog {
            version: HAR_VERSION.to_owned(),
            creator: HarCreator {
                name: CREATOR_NAME.to_owned(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
            },
            browser: HarBrowser {
                name: browser.name.clone(),
                version: browser.version.clone(),
            },
            pages,
            entries,
            web_socket_messages,
            server_sent_events,
        },
    }
}

fn derive_pages(sorted_http: &[HttpEntryRecord]) -> Vec<HarPage> {
    let mut pages: Vec<HarPage> = Vec::new();
    for entry in sorted_http {
        let hostname = page_id(&entry.envelope.hostname);
        if pages.iter().any(|page| page.id == hostname) {
            continue;
        }
        pages.push(HarPage {
            started_date_time: entry.started_at.clone(),
            id: hostname.clone(),
            title: hostname,
            page_timings: HarPageTimings {
                on_content_load: -1,
                on_load: -1,
            },
        });
    }
    pages
}

fn page_id(hostname: &str) -> String {
    if hostname.is_empty() {
        "unknown".to_owned()
    } else {
        hostname.to_owned()
    }
}

fn har_entry(record: HttpEntryRecord) -> HarEntry {
    let HttpEntryRecord {
        envelope,
        started_at,
        request,
        response,
        time_ms,
        resource_type,
    } = record;
    HarEntry {
        started_date_time: started_at,
        time: time_ms,
        request,
        response,
        cache: serde_json::Map::new(),
        timings: HarTimings {
            blocked: -1.0,
            dns: -1.0,
            connect: -1.0,
            ssl: -1.0,
            send: 0.0,
            wait: time_ms,
            receive: 0.0,
        },
        tab_id: envelope.tab_id,
        hostname: envelope.hostname,
        resource_type,
    }
}

fn har_ws_message(frame: WsFrameRecord) -> HarWsMessage {
    HarWsMessage {
        timestamp: iso_millis(frame.envelope.ts),
        tab_id: frame.envelope.tab_id,
        url: frame.url,
        connection_id: frame.connection_id,
        kind: match frame.direction {
            WsDirection::Send => "send".to_owned(),
            WsDirection::Receive => "receive".to_owned(),
        },
        opcode: frame.opcode,
        data: frame.data,
        size: frame.size,
    }
}

fn har_sse_event(event: SseEventRecord) -> HarSseEvent {
    HarSseEvent {
        timestamp: iso_millis(event.envelope.ts),
        tab_id: event.envelope.tab_id,
        url: event.url,
        event: event.event_type,
        data: event.data,
        id: event.event_id,
    }
}

#[cfg(test)]
mod tests {
    use super::{BrowserInfo, HarDocument, HarSnapshot, build_document};
    use crate::store::{
        Envelope, HttpEntryRecord, RequestRecord, ResponseContent, ResponseRecord, SseEventRecord,
        WsDirection, WsFrameRecord,
    };

    fn http_entry(entry_id: &str, ts: i64, host: &str) -> HttpEntryRecord {
        HttpEntryRecord {
            envelope: Envelope {
                entry_id: entry_id.to_owned(),
                ts,
                tab_id: 1,
                hostname: host.to_owned(),
            },
            started_at: crate::store::iso_millis(ts),
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
                    size: 2,
                    mime_type: "text/plain".to_owned(),
                    text: Some("ok".to_owned()),
                    encoding: None,
                },
                ..ResponseRecord::default()
            },
            time_ms: 12.5,
            resource_type: "xhr".to_owned(),
        }
    }

    fn ws_frame(entry_id: &str, ts: i64) -> WsFrameRecord {
        WsFrameRecord {
            envelope: Envelope {
                entry_id: entry_id.to_owned(),
                ts,
                tab_id: 1,
                hostname: "ws.example.com".to_owned(),
            },
            connection_id: "conn-1".to_owned(),
            url: "wss://ws.example.com/socket".to_owned(),
            direction: WsDirection::Receive,
            opcode: 1,
            data: "hello".to_owned(),
            size: 5,
        }
    }

    fn sse_event(entry_id: &str, ts: i64) -> SseEventRecord {
        SseEventRecord {
            envelope: Envelope {
                entry_id: entry_id.to_owned(),
                ts,
                tab_id: 1,
                hostname: "sse.example.com".to_owned(),
            },
            url: "https://sse.example.com/events".to_owned(),
            event_type: "message".to_owned(),
            data: "tick".to_owned(),
            event_id: String::new(),
        }
    }

    #[test]
    fn document_carries_version_creator_and_browser() {
        let doc = build_document(&HarSnapshot::default(), &BrowserInfo::default());
        assert_eq!(doc.log.version, "1.2");
        assert_eq!(doc.log.creator.name, "Browser Clip");
        assert_eq!(doc.log.browser.name, "unknown");
        assert!(doc.log.pages.is_empty());
        assert!(doc.log.entries.is_empty());
    }

    #[test]
    fn entries_sort_by_timestamp_across_insertion_order() {
        let snapshot = HarSnapshot {
            http: vec![
                http_entry("h-2", 2_000, "b.example"),
                http_entry("h-1", 1_000, "a.example"),
            ],
            ws: vec![ws_frame("w-2", 4_000), ws_frame("w-1", 3_000)],
            sse: vec![sse_event("s-2", 6_000), sse_event("s-1", 5_000)],
        };
        let doc = build_document(&snapshot, &BrowserInfo::default());

        let urls: Vec<&str> = doc
            .log
            .entries
            .iter()
            .map(|entry| entry.request.url.as_str())
            .collect();
        assert_eq!(urls, vec!["https://a.example/", "https://b.example/"]);
        assert!(doc.log.web_socket_messages[0].timestamp < doc.log.web_socket_messages[1].timestamp);
        assert!(doc.log.server_sent_events[0].timestamp < doc.log.server_sent_events[1].timestamp);
    }

    #[test]
    fn pages_are_one_per_hostname_in_first_seen_order() {
        let snapshot = HarSnapshot {
            http: vec![
                http_entry("h-1", 1_000, "a.example"),
                http_entry("h-2", 2_000, "b.example"),
                http_entry("h-3", 3_000, "a.example"),
            ],
            ..HarSnapshot::default()
        };
        let doc = build_document(&snapshot, &BrowserInfo::default());

        assert_eq!(doc.log.pages.len(), 2);
        assert_eq!(doc.log.pages[0].id, "a.example");
        assert_eq!(doc.log.pages[0].started_date_time, crate::store::iso_millis(1_000));
        assert_eq!(doc.log.pages[1].id, "b.example");
        assert_eq!(doc.log.pages[0].page_timings.on_content_load, -1);
        assert_eq!(doc.log.pages[0].page_timings.on_load, -1);
    }

    #[test]
    fn entry_extension_fields_and_timings_are_populated() {
        let snapshot = HarSnapshot {
            http: vec![http_entry("h-1", 1_000, "a.example")],
            ..HarSnapshot::default()
        };
        let doc = build_document(&snapshot, &BrowserInfo::default());
        let entry = &doc.log.entries[0];

        assert_eq!(entry.tab_id, 1);
        assert_eq!(entry.hostname, "a.example");
        assert_eq!(entry.resource_type, "xhr");
        assert_eq!(entry.timings.blocked, -1.0);
        assert_eq!(entry.timings.send, 0.0);
        assert_eq!(entry.timings.wait, entry.time);

        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.pointer("/log/entries/0/_tabId").is_some());
        assert!(json.pointer("/log/entries/0/_hostname").is_some());
        assert!(json.pointer("/log/entries/0/_resourceType").is_some());
        assert_eq!(
            json.pointer("/log/entries/0/cache"),
            Some(&serde_json::json!({}))
        );
    }

    #[test]
    fn ws_direction_maps_to_type_and_sse_fields_rename() {
        let snapshot = HarSnapshot {
            ws: vec![ws_frame("w-1", 1_000)],
            sse: vec![sse_event("s-1", 2_000)],
            ..HarSnapshot::default()
        };
        let doc = build_document(&snapshot, &BrowserInfo::default());
        let json = serde_json::to_value(&doc).unwrap();

        assert_eq!(
            json.pointer("/log/_webSocketMessages/0/type"),
            Some(&serde_json::json!("receive"))
        );
        assert_eq!(
            json.pointer("/log/_serverSentEvents/0/event"),
            Some(&serde_json::json!("message"))
        );
    }

    #[test]
    fn document_round_trips_through_json() {
        let snapshot = HarSnapshot {
            http: vec![http_entry("h-1", 1_000, "a.example")],
            ws: vec![ws_frame("w-1", 2_000)],
            sse: vec![sse_event("s-1", 3_000)],
        };
        let doc = build_document(&snapshot, &BrowserInfo::default());

        let bytes = serde_json::to_vec(&doc).unwrap();
        let parsed: HarDocument = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, doc);
    }
}
