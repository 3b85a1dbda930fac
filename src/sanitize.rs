use regex::Regex;
use serde_json::Value;

use crate::{har::HarDocument, store::NameValue};

pub const REDACTION_PLACEHOLDER: &str = "[REDACTED]";

/// Header names redacted by exact (case-insensitive) match.
const EXACT_HEADER_BLOCKLIST: [&str; 6] = [
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
    "x-access-token",
];

/// Substring patterns applied to header names, query-parameter names, and
/// JSON object keys. Caller-supplied custom patterns join this set.
const SUBSTRING_PATTERNS: [&str; 9] = [
    "token",
    "key",
    "secret",
    "password",
    "credential",
    "auth",
    "session",
    "jwt",
    "bearer",
];

/// Clip-time scrubber. Operates on the built HAR document only; the store
/// keeps raw records so pattern changes never invalidate the buffer.
#[derive(Debug)]
pub struct Sanitizer {
    patterns: Vec<String>,
    sanitize_url_params: bool,
    body_regexes: Vec<Regex>,
}

impl Sanitizer {
    pub fn new(custom_patterns: &[String], sanitize_url_params: bool) -> Self {
        let mut patterns: Vec<String> = SUBSTRING_PATTERNS
            .iter()
            .map(|pattern| (*pattern).to_owned())
            .collect();
        for custom in custom_patterns {
            let normalized = custom.trim().to_ascii_lowercase();
            if !normalized.is_empty() && !patterns.contains(&normalized) {
                patterns.push(normalized);
            }
        }

        let body_regexes = patterns
            .iter()
            .filter_map(|pattern| {
                Regex::new(&format!(
                    r"(?i)({}[=:]\s*)([^&\s]+)",
                    regex::escape(pattern)
                ))
                .ok()
            })
            .collect();

        Self {
            patterns,
            sanitize_url_params,
            body_regexes,
        }
    }

    pub fn sanitize_document(&self, doc: &mut HarDocument) {
        for entry in &mut doc.log.entries {
            self.scrub_headers(&mut entry.request.headers);
            self.scrub_headers(&mut entry.response.headers);
            entry.request.cookies.clear();
            entry.response.cookies.clear();

            if self.sanitize_url_params {
                self.scrub_query_params(&mut entry.request.query_string);
                entry.request.url = self.scrub_url(&entry.request.url);
            }

            if let Some(post_data) = &mut entry.request.post_data {
                post_data.text = self.scrub_body_text(&post_data.text);
            }
        }

        for message in &mut doc.log.web_socket_messages {
            if self.sanitize_url_params {
                message.url = self.scrub_url(&message.url);
            }
            // Only text frames carry inspectable payloads.
            if message.opcode == 1
                && let Some(scrubbed) = self.scrub_json_text(&message.data)
            {
                message.data = scrubbed;
            }
        }

        for event in &mut doc.log.server_sent_events {
            if self.sanitize_url_params {
                event.url = self.scrub_url(&event.url);
            }
            if let Some(scrubbed) = self.scrub_json_text(&event.data) {
                event.data = scrubbed;
            }
        }
    }

    fn header_is_sensitive(&self, name: &str) -> bool {
        let lowered = name.to_ascii_lowercase();
        EXACT_HEADER_BLOCKLIST.contains(&lowered.as_str()) || self.key_matches(&lowered)
    }

    fn key_matches(&self, key: &str) -> bool {
        let lowered = key.to_ascii_lowercase();
        self.patterns
            .iter()
            .any(|pattern| lowered.contains(pattern.as_str()))
    }

    fn scrub_headers(&self, headers: &mut [NameValue]) {
        for header in headers {
            if self.header_is_sensitive(&header.name) {
                header.value = REDACTION_PLACEHOLDER.to_owned();
            }
        }
    }

    fn scrub_query_params(&self, params: &mut [NameValue]) {
        for param in params {
            if self.key_matches(&param.name) {
                param.value = REDACTION_PLACEHOLDER.to_owned();
            }
        }
    }

    /// Rewrites the query string of `url`, replacing values of matching
    /// parameter names. Everything before `?` is left untouched.
    fn scrub_url(&self, url: &str) -> String {
        let Some((base, query)) = url.split_once('?') else {
            return url.to_owned();
        };
        if query.is_empty() {
            return url.to_owned();
        }

        let rewritten = query
            .split('&')
            .map(|segment| {
                let Some((name, _value)) = segment.split_once('=') else {
                    return segment.to_owned();
                };
                if self.key_matches(name) {
                    format!("{name}={REDACTION_PLACEHOLDER}")
                } else {
                    segment.to_owned()
                }
            })
            .collect::<Vec<_>>()
            .join("&");

        format!("{base}?{rewritten}")
    }

    /// JSON payloads get the recursive key walk; anything else passes
    /// through unchanged.
    fn scrub_json_text(&self, text: &str) -> Option<String> {
        let mut parsed: Value = serde_json::from_str(text).ok()?;
        if !self.scrub_json_value(&mut parsed) {
            return None;
        }
        serde_json::to_string(&parsed).ok()
    }

    fn scrub_json_value(&self, value: &mut Value) -> bool {
        match value {
            Value::Object(map) => {
                let mut changed = false;
                for (key, nested) in map {
                    if self.key_matches(key) {
                        let replacement = Value::String(REDACTION_PLACEHOLDER.to_owned());
                        if *nested != replacement {
                            *nested = replacement;
                            changed = true;
                        }
                        continue;
                    }
                    changed |= self.scrub_json_value(nested);
                }
                changed
            }
            Value::Array(values) => {
                let mut changed = false;
                for nested in values {
                    changed |= self.scrub_json_value(nested);
                }
                changed
            }
            _ => false,
        }
    }

    /// Request bodies: JSON gets the recursive walk, non-JSON gets the
    /// per-pattern `name=value` / `name: value` regex pass.
    fn scrub_body_text(&self, text: &str) -> String {
        if let Some(scrubbed) = self.scrub_json_text(text) {
            return scrubbed;
        }
        if serde_json::from_str::<Value>(text).is_ok() {
            // Valid JSON with nothing to scrub.
            return text.to_owned();
        }

        let mut scrubbed = text.to_owned();
        for regex in &self.body_regexes {
            scrubbed = regex
                .replace_all(&scrubbed, format!("${{1}}{REDACTION_PLACEHOLDER}"))
                .into_owned();
        }
        scrubbed
    }
}

#[cfg(test)]
mod tests {
    use super::{REDACTION_PLACEHOLDER, Sanitizer};
    use crate::{
        har::{BrowserInfo, HarDocument, HarSnapshot, build_document},
        store::{
            Envelope, HttpEntryRecord, NameValue, PostData, RequestRecord, ResponseContent,
            ResponseRecord, SseEventRecord, WsDirection, WsFrameRecord,
        },
    };

    fn sanitizer() -> Sanitizer {
        Sanitizer::new(&[], true)
    }

    fn entry_with(url: &str, headers: Vec<NameValue>, post_data: Option<PostData>) -> HttpEntryRecord {
        HttpEntryRecord {
            envelope: Envelope {
                entry_id: "h-1".to_owned(),
                ts: 1_000,
                tab_id: 1,
                hostname: "api.example.com".to_owned(),
            },
            started_at: crate::store::iso_millis(1_000),
            request: RequestRecord {
                method: "GET".to_owned(),
                url: url.to_owned(),
                http_version: "HTTP/1.1".to_owned(),
                headers,
                query_string: url
                    .split_once('?')
                    .map(|(_, query)| {
                        query
                            .split('&')
                            .filter_map(|segment| segment.split_once('='))
                            .map(|(name, value)| NameValue::new(name, value))
                            .collect()
                    })
                    .unwrap_or_default(),
                cookies: vec![NameValue::new("sid", "abc")],
                post_data,
                ..RequestRecord::default()
            },
            response: ResponseRecord {
                status: 200,
                status_text: "OK".to_owned(),
                http_version: "HTTP/1.1".to_owned(),
                headers: vec![NameValue::new("Set-Cookie", "sid=abc")],
                cookies: vec![NameValue::new("sid", "abc")],
                content: ResponseContent {
                    size: 0,
                    mime_type: "application/json".to_owned(),
                    text: None,
                    encoding: None,
                },
                ..ResponseRecord::default()
            },
            time_ms: 1.0,
            resource_type: "xhr".to_owned(),
        }
    }

    fn document_with(entry: HttpEntryRecord) -> HarDocument {
        build_document(
            &HarSnapshot {
                http: vec![entry],
                ..HarSnapshot::default()
            },
            &BrowserInfo::default(),
        )
    }

    #[test]
    fn sensitive_headers_are_redacted_and_cookies_emptied() {
        let entry = entry_with(
            "https://api.example.com/users",
            vec![
                NameValue::new("Authorization", "Bearer x"),
                NameValue::new("X-Session-Id", "s-1"),
                NameValue::new("Accept", "application/json"),
            ],
            None,
        );
        let mut doc = document_with(entry);
        sanitizer().sanitize_document(&mut doc);

        let request = &doc.log.entries[0].request;
        assert_eq!(request.headers[0].value, REDACTION_PLACEHOLDER);
        // "session" substring match.
        assert_eq!(request.headers[1].value, REDACTION_PLACEHOLDER);
        assert_eq!(request.headers[2].value, "application/json");
        assert!(request.cookies.is_empty());

        let response = &doc.log.entries[0].response;
        assert_eq!(response.headers[0].value, REDACTION_PLACEHOLDER);
        assert!(response.cookies.is_empty());
    }

    #[test]
    fn custom_patterns_extend_the_blocklist() {
        let entry = entry_with(
            "https://api.example.com/users",
            vec![NameValue::new("X-Tenant-Badge", "t-1")],
            None,
        );
        let mut doc = document_with(entry);
        Sanitizer::new(&["badge".to_owned()], true).sanitize_document(&mut doc);

        assert_eq!(
            doc.log.entries[0].request.headers[0].value,
            REDACTION_PLACEHOLDER
        );
    }

    #[test]
    fn url_params_matching_patterns_are_rewritten() {
        let entry = entry_with(
            "https://api.example.com/users?token=abc&page=1",
            Vec::new(),
            None,
        );
        let mut doc = document_with(entry);
        sanitizer().sanitize_document(&mut doc);

        let request = &doc.log.entries[0].request;
        assert_eq!(
            request.url,
            format!("https://api.example.com/users?token={REDACTION_PLACEHOLDER}&page=1")
        );
        assert_eq!(request.query_string[0].value, REDACTION_PLACEHOLDER);
        assert_eq!(request.query_string[1].value, "1");
    }

    #[test]
    fn url_params_pass_through_when_disabled() {
        let entry = entry_with(
            "https://api.example.com/users?token=abc",
            Vec::new(),
            None,
        );
        let mut doc = document_with(entry);
        Sanitizer::new(&[], false).sanitize_document(&mut doc);

        assert_eq!(
            doc.log.entries[0].request.url,
            "https://api.example.com/users?token=abc"
        );
    }

    #[test]
    fn json_request_bodies_are_recursively_redacted() {
        let entry = entry_with(
            "https://api.example.com/login",
            Vec::new(),
            Some(PostData {
                mime_type: "application/json".to_owned(),
                text: r#"{"user":"ada","password":"pw","nested":{"api_key":"k","safe":"ok"}}"#
                    .to_owned(),
            }),
        );
        let mut doc = document_with(entry);
        sanitizer().sanitize_document(&mut doc);

        let text = doc.log.entries[0]
            .request
            .post_data
            .as_ref()
            .unwrap()
            .text
            .clone();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            parsed.pointer("/password").and_then(|v| v.as_str()),
            Some(REDACTION_PLACEHOLDER)
        );
        assert_eq!(
            parsed.pointer("/nested/api_key").and_then(|v| v.as_str()),
            Some(REDACTION_PLACEHOLDER)
        );
        assert_eq!(parsed.pointer("/nested/safe").and_then(|v| v.as_str()), Some("ok"));
        assert_eq!(parsed.pointer("/user").and_then(|v| v.as_str()), Some("ada"));
    }

    #[test]
    fn non_json_bodies_get_the_regex_pass() {
        let entry = entry_with(
            "https://api.example.com/form",
            Vec::new(),
            Some(PostData {
                mime_type: "application/x-www-form-urlencoded".to_owned(),
                text: "token=abc&page=1&Password: hunter2".to_owned(),
            }),
        );
        let mut doc = document_with(entry);
        sanitizer().sanitize_document(&mut doc);

        let text = &doc.log.entries[0].request.post_data.as_ref().unwrap().text;
        assert!(text.contains(&format!("token={REDACTION_PLACEHOLDER}")), "{text}");
        assert!(text.contains("page=1"), "{text}");
        assert!(
            text.contains(&format!("Password: {REDACTION_PLACEHOLDER}")),
            "{text}"
        );
    }

    #[test]
    fn ws_text_frames_and_sse_data_are_redacted() {
        let snapshot = HarSnapshot {
            ws: vec![
                WsFrameRecord {
                    envelope: Envelope {
                        entry_id: "w-1".to_owned(),
                        ts: 1_000,
                        tab_id: 1,
                        hostname: "ws.example.com".to_owned(),
                    },
                    connection_id: "conn-1".to_owned(),
                    url: "wss://ws.example.com/socket?auth_token=zzz".to_owned(),
                    direction: WsDirection::Send,
                    opcode: 1,
                    data: r#"{"auth_token":"s","msg":"hi"}"#.to_owned(),
                    size: 29,
                },
                WsFrameRecord {
                    envelope: Envelope {
                        entry_id: "w-2".to_owned(),
                        ts: 2_000,
                        tab_id: 1,
                        hostname: "ws.example.com".to_owned(),
                    },
                    connection_id: "conn-1".to_owned(),
                    url: "wss://ws.example.com/socket".to_owned(),
                    direction: WsDirection::Receive,
                    opcode: 2,
                    data: r#"{"auth_token":"binary-so-untouched"}"#.to_owned(),
                    size: 36,
                },
            ],
            sse: vec![SseEventRecord {
                envelope: Envelope {
                    entry_id: "s-1".to_owned(),
                    ts: 3_000,
                    tab_id: 1,
                    hostname: "sse.example.com".to_owned(),
                },
                url: "https://sse.example.com/events".to_owned(),
                event_type: "update".to_owned(),
                data: r#"{"session_id":"s","value":3}"#.to_owned(),
                event_id: "9".to_owned(),
            }],
            ..HarSnapshot::default()
        };
        let mut doc = build_document(&snapshot, &BrowserInfo::default());
        sanitizer().sanitize_document(&mut doc);

        let text_frame: serde_json::Value =
            serde_json::from_str(&doc.log.web_socket_messages[0].data).unwrap();
        assert_eq!(
            text_frame.pointer("/auth_token").and_then(|v| v.as_str()),
            Some(REDACTION_PLACEHOLDER)
        );
        assert_eq!(text_frame.pointer("/msg").and_then(|v| v.as_str()), Some("hi"));
        assert!(
            doc.log.web_socket_messages[0]
                .url
                .ends_with(&format!("auth_token={REDACTION_PLACEHOLDER}"))
        );

        // Binary frames pass through even when the payload happens to parse.
        assert_eq!(
            doc.log.web_socket_messages[1].data,
            r#"{"auth_token":"binary-so-untouched"}"#
        );

        let sse: serde_json::Value =
            serde_json::from_str(&doc.log.server_sent_events[0].data).unwrap();
        assert_eq!(
            sse.pointer("/session_id").and_then(|v| v.as_str()),
            Some(REDACTION_PLACEHOLDER)
        );
    }

    #[test]
    fn non_json_ws_payloads_pass_through() {
        let snapshot = HarSnapshot {
            ws: vec![WsFrameRecord {
                envelope: Envelope {
                    entry_id: "w-1".to_owned(),
                    ts: 1_000,
                    tab_id: 1,
                    hostname: "ws.example.com".to_owned(),
                },
                connection_id: "conn-1".to_owned(),
                url: "wss://ws.example.com/socket".to_owned(),
                direction: WsDirection::Send,
                opcode: 1,
                data: "token=abc plain frame".to_owned(),
                size: 21,
            }],
            ..HarSnapshot::default()
        };
        let mut doc = build_document(&snapshot, &BrowserInfo::default());
        sanitizer().sanitize_document(&mut doc);

        assert_eq!(doc.log.web_socket_messages[0].data, "token=abc plain frame");
    }

    #[test]
    fn sanitization_is_idempotent() {
        let entry = entry_with(
            "https://api.example.com/users?token=abc&page=1",
            vec![NameValue::new("Authorization", "Bearer x")],
            Some(PostData {
                mime_type: "application/x-www-form-urlencoded".to_owned(),
                text: "token=abc&page=1".to_owned(),
            }),
        );
        let mut doc = document_with(entry);

        let sanitizer = sanitizer();
        sanitizer.sanitize_document(&mut doc);
        let once = serde_json::to_string(&doc).unwrap();
        sanitizer.sanitize_document(&mut doc);
        let twice = serde_json::to_string(&doc).unwrap();
        assert_eq!(once, twice);
    }
}
