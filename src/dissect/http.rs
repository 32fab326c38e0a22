//! HTTP message extraction over reassembled stream buffers.
//!
//! Messages are yielded only when complete: the header terminator must be
//! present, and when `Content-Length` is declared the body must be fully
//! buffered. The consumed prefix is reported so the caller can drop it from
//! the stream buffer. Completed requests queue per stream and pair FIFO with
//! responses into transactions.

use std::collections::{HashMap, VecDeque};

use serde::ser::SerializeMap;
use serde::Serialize;

use crate::config;

/// Methods accepted on a request line.
const METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH"];

/// Ordered header mapping with case-insensitive lookup.
///
/// Serializes as a JSON map in insertion order; original key casing is
/// preserved so a parsed message reserializes byte-identically.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, key: String, value: String) {
        self.0.push((key, value));
    }

    /// Case-insensitive lookup of the first matching header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn content_length(&self) -> Option<usize> {
        self.get("content-length").and_then(|v| v.trim().parse().ok())
    }

    fn is_chunked(&self) -> bool {
        self.get("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }
}

impl Serialize for Headers {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A complete HTTP request extracted from the outbound buffer.
#[derive(Debug, Clone, Serialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub version: String,
    pub headers: Headers,
    #[serde(skip)]
    pub body: Vec<u8>,
    pub timestamp: f64,
    pub stream_id: u64,
    /// Same URL requested again within the retry window.
    pub is_retry: bool,
}

impl HttpRequest {
    /// Re-serialize to the on-the-wire representation, preserving header
    /// order and casing.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method, self.url, self.version).as_bytes(),
        );
        for (k, v) in self.headers.iter() {
            out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// A complete HTTP response extracted from the inbound buffer.
#[derive(Debug, Clone, Serialize)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    #[serde(skip)]
    pub body: Vec<u8>,
    pub timestamp: f64,
    pub stream_id: u64,
}

/// A request paired FIFO with its response on the same stream.
#[derive(Debug, Clone, Serialize)]
pub struct HttpTransaction {
    pub request: HttpRequest,
    pub response: Option<HttpResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

/// Decode header bytes losslessly (every byte maps to one char).
fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Outcome of a completeness probe over a buffer.
struct MessageSpan {
    header_end: usize,
    body_len: usize,
}

impl MessageSpan {
    fn consumed(&self) -> usize {
        self.header_end + 4 + self.body_len
    }
}

/// Check whether a complete message starts the buffer.
///
/// When `Content-Length` is declared the buffer must hold the full body;
/// without it the header terminator alone completes the message. A chunked
/// message without `Content-Length` takes the raw remainder as its body.
fn probe_complete(buf: &[u8], headers: &Headers) -> Option<MessageSpan> {
    let header_end = find_terminator(buf)?;
    let body_len = match headers.content_length() {
        Some(len) => {
            if buf.len() < header_end + 4 + len {
                return None;
            }
            len
        }
        None if headers.is_chunked() => buf.len() - header_end - 4,
        None => 0,
    };
    Some(MessageSpan {
        header_end,
        body_len,
    })
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_header_lines(lines: &[&str]) -> Headers {
    let mut headers = Headers::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.push(key.trim().to_string(), value.trim().to_string());
        }
    }
    headers
}

/// Parse a complete request at the start of `buf`.
/// Returns the request and the number of consumed bytes.
fn parse_request(buf: &[u8], ts: f64, stream_id: u64) -> Option<(HttpRequest, usize)> {
    let header_end = find_terminator(buf)?;
    let header_text = latin1(&buf[..header_end]);
    let mut lines = header_text.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.split(' ').filter(|p| !p.is_empty());
    let method = parts.next()?;
    let url = parts.next()?;
    let version = parts.next()?;
    if !METHODS.contains(&method) || !version.starts_with("HTTP/") {
        return None;
    }

    let header_lines: Vec<&str> = lines.collect();
    let headers = parse_header_lines(&header_lines);
    let span = probe_complete(buf, &headers)?;
    let body = buf[span.header_end + 4..span.consumed()].to_vec();

    Some((
        HttpRequest {
            method: method.to_string(),
            url: url.to_string(),
            version: version.to_string(),
            headers,
            body,
            timestamp: ts,
            stream_id,
            is_retry: false,
        },
        span.consumed(),
    ))
}

/// Parse a complete response at the start of `buf`.
fn parse_response(buf: &[u8], ts: f64, stream_id: u64) -> Option<(HttpResponse, usize)> {
    let header_end = find_terminator(buf)?;
    let header_text = latin1(&buf[..header_end]);
    let mut lines = header_text.split("\r\n");

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let status: u16 = parts.next()?.parse().ok()?;
    let reason = parts.next().unwrap_or("").trim().to_string();

    let header_lines: Vec<&str> = lines.collect();
    let headers = parse_header_lines(&header_lines);
    let span = probe_complete(buf, &headers)?;
    let body = buf[span.header_end + 4..span.consumed()].to_vec();

    Some((
        HttpResponse {
            version: version.to_string(),
            status,
            reason,
            headers,
            body,
            timestamp: ts,
            stream_id,
        },
        span.consumed(),
    ))
}

/// Stateful parser: per-stream pending requests, retry history, completed
/// transactions.
pub struct HttpStreamParser {
    pending: HashMap<u64, VecDeque<HttpRequest>>,
    /// URL → recent request timestamps, bounded per URL.
    url_history: HashMap<String, VecDeque<f64>>,
    transactions: VecDeque<HttpTransaction>,
}

impl HttpStreamParser {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            url_history: HashMap::new(),
            transactions: VecDeque::new(),
        }
    }

    /// Try to extract one complete request from the front of `buf`.
    ///
    /// On success the request is flagged for retries, queued for pairing, and
    /// returned with the byte count the caller must drop from its buffer.
    pub fn poll_request(&mut self, buf: &[u8], ts: f64, stream_id: u64) -> Option<(HttpRequest, usize)> {
        let (mut request, consumed) = parse_request(buf, ts, stream_id)?;
        request.is_retry = self.check_retry(&request.url, ts);
        tracing::debug!("Parsed request: {} {}", request.method, request.url);

        self.pending
            .entry(stream_id)
            .or_default()
            .push_back(request.clone());
        Some((request, consumed))
    }

    /// Try to extract one complete response, pairing it with the oldest
    /// pending request on the stream.
    pub fn poll_response(
        &mut self,
        buf: &[u8],
        ts: f64,
        stream_id: u64,
    ) -> Option<(HttpResponse, usize, Option<HttpTransaction>)> {
        let (response, consumed) = parse_response(buf, ts, stream_id)?;
        tracing::debug!("Parsed response: {} {}", response.status, response.reason);

        let transaction = match self.pending.get_mut(&stream_id).and_then(VecDeque::pop_front) {
            Some(request) => {
                let duration_ms = (response.timestamp - request.timestamp) * 1000.0;
                let txn = HttpTransaction {
                    request,
                    response: Some(response.clone()),
                    duration_ms: Some(duration_ms),
                };
                self.transactions.push_back(txn.clone());
                if self.transactions.len() > config::TRANSACTION_HISTORY_CAP {
                    self.transactions.pop_front();
                }
                Some(txn)
            }
            None => {
                tracing::warn!("No matching request for response in stream {stream_id}");
                None
            }
        };

        Some((response, consumed, transaction))
    }

    /// Whether a request to `url` was already seen within the retry window.
    /// Records `ts` in the bounded per-URL history either way.
    fn check_retry(&mut self, url: &str, ts: f64) -> bool {
        let history = self.url_history.entry(url.to_string()).or_default();
        let is_retry = history
            .iter()
            .any(|&prev| ts - prev < config::RETRY_WINDOW_SECS);
        history.push_back(ts);
        while history.len() > config::RETRY_HISTORY_CAP {
            history.pop_front();
        }
        if is_retry {
            tracing::debug!("Retry detected for {url}");
        }
        is_retry
    }

    /// Most recent completed transactions, oldest first.
    pub fn transactions(&self, limit: usize) -> impl Iterator<Item = &HttpTransaction> {
        let skip = self.transactions.len().saturating_sub(limit);
        self.transactions.iter().skip(skip)
    }

    pub fn pending_count(&self, stream_id: u64) -> usize {
        self.pending.get(&stream_id).map_or(0, VecDeque::len)
    }
}

impl Default for HttpStreamParser {
    fn default() -> Self {
        Self::new()
    }
}
