use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use crate::{
    store::{
        Envelope, HttpEntryRecord, NameValue, PostData, RequestRecord, ResponseContent,
        ResponseRecord, SseEventRecord, Store, WsDirection, WsFrameRecord, iso_millis,
    },
    tap::{Tap, TapEvent, TapRequest, TapResponse, is_capturable_url, timestamp_ms},
};

/// Response bodies above this ceiling are never retrieved from the tap; the
/// entry keeps the original size with the text omitted.
pub const MAX_BODY_BYTES: i64 = 5 * 1024 * 1024;

const DEFAULT_HTTP_VERSION: &str = "HTTP/1.1";

#[derive(Debug)]
struct PendingHttp {
    tab_id: i64,
    ts: i64,
    observed: Instant,
    request: TapRequest,
    resource_type: String,
    response: Option<TapResponse>,
}

#[derive(Debug)]
struct OpenWebSocket {
    tab_id: i64,
    url: String,
}

/// Converts the raw tap event stream into normalized store records. Sole
/// owner of the pending-HTTP and open-WebSocket maps; capture-time failures
/// are logged and never surfaced.
pub struct CapturePipeline {
    tap: Arc<dyn Tap>,
    store: Store,
    pending_http: HashMap<String, PendingHttp>,
    open_ws: HashMap<String, OpenWebSocket>,
    attached_tabs: HashSet<i64>,
    known_tabs: HashMap<i64, String>,
    paused: bool,
    entry_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureCounts {
    pub attached_tabs: usize,
    pub pending_http: usize,
    pub open_ws: usize,
}

impl CapturePipeline {
    pub fn new(tap: Arc<dyn Tap>, store: Store, paused: bool) -> Self {
        Self {
            tap,
            store,
            pending_http: HashMap::new(),
            open_ws: HashMap::new(),
            attached_tabs: HashSet::new(),
            known_tabs: HashMap::new(),
            paused,
            entry_seq: 0,
        }
    }

    pub fn counts(&self) -> CaptureCounts {
        CaptureCounts {
            attached_tabs: self.attached_tabs.len(),
            pending_http: self.pending_http.len(),
            open_ws: self.open_ws.len(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub async fn handle_tab_created(&mut self, tab_id: i64, url: String) {
        self.known_tabs.insert(tab_id, url.clone());
        self.maybe_attach(tab_id, &url).await;
    }

    pub async fn handle_tab_navigated(&mut self, tab_id: i64, url: String) {
        self.known_tabs.insert(tab_id, url.clone());
        if self.attached_tabs.contains(&tab_id) && !is_capturable_url(&url) {
            self.detach_tab(tab_id).await;
            return;
        }
        if !self.attached_tabs.contains(&tab_id) {
            self.maybe_attach(tab_id, &url).await;
        }
    }

    /// Tears down per-tab state without emitting: abandoned transactions do
    /// not reach the store.
    pub async fn handle_tab_closed(&mut self, tab_id: i64) {
        self.known_tabs.remove(&tab_id);
        if self.attached_tabs.contains(&tab_id) {
            self.detach_tab(tab_id).await;
        }
        self.pending_http
            .retain(|_, pending| pending.tab_id != tab_id);
        self.open_ws.retain(|_, socket| socket.tab_id != tab_id);
    }

    /// Releases every attachment and drops all in-flight state.
    pub async fn pause(&mut self) {
        self.paused = true;
        let attached: Vec<i64> = self.attached_tabs.drain().collect();
        for tab_id in attached {
            if let Err(err) = self.tap.detach(tab_id).await {
                tracing::debug!(tab_id, error = %err, "detach on pause failed");
            }
        }
        self.pending_http.clear();
        self.open_ws.clear();
    }

    /// Re-attaches to every known capturable tab.
    pub async fn resume(&mut self) {
        self.paused = false;
        let tabs: Vec<(i64, String)> = self
            .known_tabs
            .iter()
            .map(|(tab_id, url)| (*tab_id, url.clone()))
            .collect();
        for (tab_id, url) in tabs {
            self.maybe_attach(tab_id, &url).await;
        }
    }

    pub async fn handle_event(&mut self, tab_id: i64, event: TapEvent) {
        match event {
            TapEvent::RequestWillBeSent {
                request_id,
                timestamp,
                request,
                resource_type,
                redirect_response,
            } => {
                if let Some(redirect) = redirect_response
                    && let Some(prior) = self.pending_http.remove(&request_id)
                {
                    self.emit_redirect_leg(&request_id, prior, redirect, &request.url)
                        .await;
                }
                self.pending_http.insert(
                    request_id,
                    PendingHttp {
                        tab_id,
                        ts: timestamp_ms(timestamp),
                        observed: Instant::now(),
                        request,
                        resource_type,
                        response: None,
                    },
                );
            }
            TapEvent::ResponseReceived {
                request_id,
                response,
            } => {
                if let Some(pending) = self.pending_http.get_mut(&request_id) {
                    pending.response = Some(response);
                } else {
                    tracing::debug!(request_id, "response for unknown transaction dropped");
                }
            }
            TapEvent::LoadingFinished {
                request_id,
                encoded_data_length,
            } => {
                self.finish_transaction(&request_id, encoded_data_length)
                    .await;
            }
            TapEvent::LoadingFailed {
                request_id,
                error_text,
            } => {
                self.fail_transaction(&request_id, error_text).await;
            }
            TapEvent::WsCreated { request_id, url } => {
                if self.open_ws.contains_key(&request_id) {
                    tracing::debug!(request_id, "websocket connection id reused; replacing");
                }
                self.open_ws
                    .insert(request_id, OpenWebSocket { tab_id, url });
            }
            TapEvent::WsFrameSent {
                request_id,
                timestamp,
                opcode,
                payload_data,
            } => {
                self.emit_ws_frame(
                    &request_id,
                    timestamp,
                    WsDirection::Send,
                    opcode,
                    payload_data,
                )
                .await;
            }
            TapEvent::WsFrameReceived {
                request_id,
                timestamp,
                opcode,
                payload_data,
            } => {
                self.emit_ws_frame(
                    &request_id,
                    timestamp,
                    WsDirection::Receive,
                    opcode,
                    payload_data,
                )
                .await;
            }
            TapEvent::WsClosed { request_id } => {
                self.open_ws.remove(&request_id);
            }
            TapEvent::SseMessage {
                request_id,
                timestamp,
                event_name,
                event_id,
                data,
            } => {
                self.emit_sse_event(tab_id, &request_id, timestamp, event_name, event_id, data)
                    .await;
            }
        }
    }

    async fn maybe_attach(&mut self, tab_id: i64, url: &str) {
        if self.paused || !is_capturable_url(url) || self.attached_tabs.contains(&tab_id) {
            return;
        }
        match self.tap.attach(tab_id).await {
            Ok(()) => {
                self.attached_tabs.insert(tab_id);
            }
            Err(err) => {
                tracing::warn!(tab_id, error = %err, "tap attach failed; tab not captured");
            }
        }
    }

    async fn detach_tab(&mut self, tab_id: i64) {
        self.attached_tabs.remove(&tab_id);
        if let Err(err) = self.tap.detach(tab_id).await {
            tracing::debug!(tab_id, error = %err, "tap detach failed");
        }
    }

    async fn finish_transaction(&mut self, request_id: &str, encoded_data_length: i64) {
        let Some(pending) = self.pending_http.remove(request_id) else {
            tracing::debug!(request_id, "loading_finished for unknown transaction");
            return;
        };

        let mut text = None;
        let mut encoding = None;
        if encoded_data_length <= MAX_BODY_BYTES {
            match self
                .tap
                .fetch_response_body(pending.tab_id, request_id)
                .await
            {
                Ok(body) => {
                    encoding = body.base64_encoded.then(|| "base64".to_owned());
                    text = Some(body.body);
                }
                Err(err) => {
                    tracing::debug!(request_id, error = %err, "response body unavailable");
                }
            }
        }

        let response = pending.response.clone();
        let entry = self.build_http_entry(
            request_id,
            pending,
            response,
            encoded_data_length,
            text,
            encoding,
            None,
            String::new(),
        );
        self.append_entry(entry).await;
    }

    async fn fail_transaction(&mut self, request_id: &str, error_text: String) {
        let Some(pending) = self.pending_http.remove(request_id) else {
            tracing::debug!(request_id, "loading_failed for unknown transaction");
            return;
        };

        let response = pending.response.clone();
        let size = response
            .as_ref()
            .map(|response| response.encoded_data_length)
            .unwrap_or(0);
        let entry = self.build_http_entry(
            request_id,
            pending,
            response,
            size,
            None,
            None,
            Some(error_text),
            String::new(),
        );
        self.append_entry(entry).await;
    }

    async fn emit_redirect_leg(
        &mut self,
        request_id: &str,
        pending: PendingHttp,
        redirect: TapResponse,
        next_url: &str,
    ) {
        let redirect_url = header_lookup(&redirect.headers, "location")
            .unwrap_or_else(|| next_url.to_owned());
        let size = redirect.encoded_data_length;
        let entry = self.build_http_entry(
            request_id,
            pending,
            Some(redirect),
            size,
            None,
            None,
            None,
            redirect_url,
        );
        self.append_entry(entry).await;
    }

    #[allow(clippy::too_many_arguments)]
    fn build_http_entry(
        &mut self,
        request_id: &str,
        pending: PendingHttp,
        response: Option<TapResponse>,
        body_size: i64,
        text: Option<String>,
        encoding: Option<String>,
        error: Option<String>,
        redirect_url: String,
    ) -> HttpEntryRecord {
        let entry_id = self.next_entry_id(request_id);
        let http_version = response
            .as_ref()
            .filter(|response| !response.protocol.is_empty())
            .map(|response| response.protocol.clone())
            .unwrap_or_else(|| DEFAULT_HTTP_VERSION.to_owned());

        let request = RequestRecord {
            method: pending.request.method.clone(),
            url: pending.request.url.clone(),
            http_version: http_version.clone(),
            headers: header_list(&pending.request.headers),
            query_string: query_params(&pending.request.url),
            cookies: Vec::new(),
            headers_size: headers_size(&pending.request.headers),
            body_size: pending
                .request
                .post_data
                .as_ref()
                .map(|data| data.len() as i64)
                .unwrap_or(0),
            post_data: pending.request.post_data.as_ref().map(|text| PostData {
                mime_type: header_lookup(&pending.request.headers, "content-type")
                    .unwrap_or_else(|| "application/octet-stream".to_owned()),
                text: text.clone(),
            }),
        };

        let response_record = match response {
            Some(response) => ResponseRecord {
                status: response.status,
                status_text: response.status_text.clone(),
                http_version,
                headers: header_list(&response.headers),
                cookies: Vec::new(),
                content: ResponseContent {
                    size: body_size,
                    mime_type: response.mime_type.clone(),
                    text,
                    encoding,
                },
                redirect_url,
                headers_size: headers_size(&response.headers),
                body_size,
                error,
            },
            None => ResponseRecord {
                status: 0,
                status_text: String::new(),
                http_version,
                content: ResponseContent {
                    size: 0,
                    mime_type: String::new(),
                    text: None,
                    encoding: None,
                },
                redirect_url,
                error,
                ..ResponseRecord::default()
            },
        };

        HttpEntryRecord {
            envelope: Envelope {
                entry_id,
                ts: pending.ts,
                tab_id: pending.tab_id,
                hostname: hostname_of(&pending.request.url),
            },
            started_at: iso_millis(pending.ts),
            request,
            response: response_record,
            time_ms: pending.observed.elapsed().as_secs_f64() * 1000.0,
            resource_type: pending.resource_type,
        }
    }

    async fn emit_ws_frame(
        &mut self,
        request_id: &str,
        timestamp: f64,
        direction: WsDirection,
        opcode: i64,
        payload_data: String,
    ) {
        let Some(socket) = self.open_ws.get(request_id) else {
            tracing::debug!(request_id, "frame before ws_created dropped");
            return;
        };
        let (tab_id, url) = (socket.tab_id, socket.url.clone());

        let frame = WsFrameRecord {
            envelope: Envelope {
                entry_id: self.next_entry_id(request_id),
                ts: timestamp_ms(timestamp),
                tab_id,
                hostname: hostname_of(&url),
            },
            connection_id: request_id.to_owned(),
            url,
            direction,
            opcode,
            size: payload_data.len() as i64,
            data: payload_data,
        };
        if let Err(err) = self.store.append(frame).await {
            tracing::warn!(request_id, error = %err, "append ws frame failed");
        }
    }

    async fn emit_sse_event(
        &mut self,
        tab_id: i64,
        request_id: &str,
        timestamp: f64,
        event_name: String,
        event_id: String,
        data: String,
    ) {
        let url = self
            .pending_http
            .get(request_id)
            .map(|pending| pending.request.url.clone())
            .unwrap_or_default();

        let event = SseEventRecord {
            envelope: Envelope {
                entry_id: self.next_entry_id(request_id),
                ts: timestamp_ms(timestamp),
                tab_id,
                hostname: hostname_of(&url),
            },
            url,
            event_type: if event_name.is_empty() {
                "message".to_owned()
            } else {
                event_name
            },
            data,
            event_id,
        };
        if let Err(err) = self.store.append(event).await {
            tracing::warn!(request_id, error = %err, "append sse event failed");
        }
    }

    async fn append_entry(&mut self, entry: HttpEntryRecord) {
        let request_url = entry.request.url.clone();
        if let Err(err) = self.store.append(entry).await {
            tracing::warn!(url = %request_url, error = %err, "append http entry failed");
        }
    }

    fn next_entry_id(&mut self, request_id: &str) -> String {
        self.entry_seq += 1;
        format!("{request_id}-{}", self.entry_seq)
    }
}

fn hostname_of(url: &str) -> String {
    url.parse::<hyper::Uri>()
        .ok()
        .and_then(|uri| uri.host().map(str::to_owned))
        .unwrap_or_default()
}

fn header_list(headers: &BTreeMap<String, String>) -> Vec<NameValue> {
    headers
        .iter()
        .map(|(name, value)| NameValue::new(name.clone(), value.clone()))
        .collect()
}

fn header_lookup(headers: &BTreeMap<String, String>, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.clone())
}

fn headers_size(headers: &BTreeMap<String, String>) -> i64 {
    headers
        .iter()
        .map(|(name, value)| name.len() + value.len() + 4)
        .sum::<usize>() as i64
}

fn query_params(url: &str) -> Vec<NameValue> {
    let Some((_, query)) = url.split_once('?') else {
        return Vec::new();
    };
    let mut params = Vec::new();
    for segment in query.split('&') {
        if segment.is_empty() {
            continue;
        }
        let mut parts = segment.splitn(2, '=');
        let name = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        params.push(NameValue::new(name, value));
    }
    params
}
