//! Connection handlers: drive the HTTP parser against the two reassembled
//! streams of a connection and turn parsed messages into records.
//!
//! Two variants share the trait: [`HttpConnectionHandler`] consumes request
//! and response in lockstep so each record carries the full exchange, while
//! [`FastConnectionHandler`] runs one independent consumer per direction
//! and trades strict pairing for throughput.

use core::fmt::Write as _;
use core::str::FromStr;
use core::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use tokio_util::task::TaskTracker;

use crate::filter::{wildcard_match, Counter, IntSet};
use crate::http::{self, BodyFraming, Headers, Request, Response};
use crate::printer::RecordSender;
use crate::stream::StreamReader;
use crate::tcp::ConnectionKey;

/// How long the strict handler waits for the response of an already parsed
/// request before emitting it unpaired.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Rendered bodies beyond this size are truncated with a note.
const MAX_RENDERED_BODY: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// First line only.
    L0,
    /// `METHOD host+uri` for requests, nothing for responses.
    Url,
    /// Start line and headers, body reported as a byte count.
    Header,
    /// Everything, with textual bodies decoded and rendered.
    All,
}

impl FromStr for Level {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "l0" => Ok(Self::L0),
            "url" => Ok(Self::Url),
            "header" => Ok(Self::Header),
            "all" => Ok(Self::All),
            other => anyhow::bail!("unknown output level `{other}`"),
        }
    }
}

/// Output and filtering options shared by both handler variants.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub level: Level,
    /// Glob matched against the request `Host` header.
    pub host_pattern: Option<String>,
    /// Glob matched against the request URI.
    pub uri_pattern: Option<String>,
    /// Comma-separated method list.
    pub methods: Option<String>,
    pub print_responses: bool,
    /// Response status filter; an empty set matches everything.
    pub status: IntSet,
    /// Render bodies even when the content type doesn't look textual.
    pub force_body: bool,
}

/// Reader halves of one tracked connection, handed over by the assembler.
///
/// `key` is oriented client → server; `client_id` names the initiator.
pub struct ConnectionStreams {
    pub key: ConnectionKey,
    pub client_id: String,
    pub request: StreamReader,
    pub response: StreamReader,
}

#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Take ownership of a new connection's streams and spawn its
    /// consumer task(s).
    fn handle(&self, conn: ConnectionStreams);

    /// Wait until every consumer task spawned by `handle` has returned.
    async fn finish(&self);
}

// === shared parser driver === //

struct HandlerCore {
    cfg: HandlerConfig,
    sender: RecordSender,
    request_counter: Counter,
    response_counter: Counter,
}

impl HandlerCore {
    fn new(cfg: HandlerConfig, sender: RecordSender) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            sender,
            request_counter: Counter::new(),
            response_counter: Counter::new(),
        })
    }

    /// `true` when the request fails any of the host/uri/method filters.
    fn request_filtered(&self, request: &Request) -> bool {
        if let Some(pattern) = &self.cfg.host_pattern {
            if !wildcard_match(request.headers.host().unwrap_or_default(), pattern) {
                return true;
            }
        }

        if let Some(pattern) = &self.cfg.uri_pattern {
            if !wildcard_match(&request.uri, pattern) {
                return true;
            }
        }

        if let Some(methods) = &self.cfg.methods {
            if !methods.split(',').any(|m| m.trim().eq_ignore_ascii_case(&request.method)) {
                return true;
            }
        }

        false
    }

    fn response_filtered(&self, status: u16) -> bool {
        !self.cfg.status.is_empty() && !self.cfg.status.contains(status)
    }

    /// Format one request into `buf`, consuming its body from the stream
    /// according to the output level.
    async fn print_request(&self, buf: &mut String, key: &ConnectionKey, request: &Request, reader: &mut StreamReader) {
        let seq = self.request_counter.incr();
        let framing = http::request_body_framing(request);

        if self.cfg.level == Level::Url {
            let _ = writeln!(
                buf,
                "{} {}{}",
                request.method,
                request.headers.host().unwrap_or_default(),
                request.uri
            );
            self.skip_body(buf, framing, reader).await;
            return;
        }

        let _ = writeln!(
            buf,
            "\n### REQUEST #{seq} {} {}->{} {}",
            format_uuid(request.uuid),
            key.src,
            key.dst,
            format_timestamp(request.timestamp),
        );
        let _ = writeln!(buf, "{} {} {}", request.method, request.uri, request.version);

        if self.cfg.level == Level::L0 {
            self.skip_body(buf, framing, reader).await;
            return;
        }

        for line in request.headers.lines() {
            let _ = writeln!(buf, "{line}");
        }

        self.print_body(buf, &request.headers, framing, reader).await;
    }

    /// Format one response into `buf`; always consumes the body so the
    /// stream stays aligned on message boundaries.
    async fn print_response(
        &self,
        buf: &mut String,
        key: &ConnectionKey,
        response: &Response,
        reader: &mut StreamReader,
    ) {
        let seq = self.response_counter.incr();
        let framing = http::response_body_framing(response);

        if self.cfg.level == Level::Url {
            self.skip_body(buf, framing, reader).await;
            return;
        }

        let _ = writeln!(
            buf,
            "\n### RESPONSE #{seq} {} {}<-{} {}",
            format_uuid(response.uuid),
            key.src,
            key.dst,
            format_timestamp(response.timestamp),
        );
        let _ = writeln!(buf, "{}", response.status_line);

        if self.cfg.level == Level::L0 {
            self.skip_body(buf, framing, reader).await;
            return;
        }

        for line in response.headers.lines() {
            let _ = writeln!(buf, "{line}");
        }

        self.print_body(buf, &response.headers, framing, reader).await;
    }

    /// Discard an unwanted body. A framing failure is a body-level problem:
    /// the record gets an annotation and the message loop carries on (a
    /// desynced stream surfaces as a parse error on the next head).
    async fn skip_body(&self, buf: &mut String, framing: BodyFraming, reader: &mut StreamReader) {
        if let Err(error) = http::drain_body(reader, framing).await {
            warn!(%error, "Error reading HTTP body");
            let _ = writeln!(buf, "\n// body decode error: {error:#}");
        }
    }

    async fn print_body(&self, buf: &mut String, headers: &Headers, framing: BodyFraming, reader: &mut StreamReader) {
        if !framing.has_body() {
            return;
        }

        if self.cfg.level == Level::Header {
            match http::drain_body(reader, framing).await {
                Ok(size) => {
                    let _ = writeln!(buf, "\n// body size: {size}, set [level = all] to display http body");
                }
                Err(error) => {
                    warn!(%error, "Error reading HTTP body");
                    let _ = writeln!(buf, "\n// body decode error: {error:#}");
                }
            }
            return;
        }

        let (body, total) = match http::read_body(reader, framing, MAX_RENDERED_BODY).await {
            Ok(read) => read,
            Err(error) => {
                warn!(%error, "Error reading HTTP body");
                let _ = writeln!(buf, "\n// body decode error: {error:#}");
                return;
            }
        };

        let content_type = headers.content_type().unwrap_or_default();
        let printable =
            self.cfg.force_body || content_type.is_empty() || http::is_textual_content_type(content_type);

        if !printable {
            let _ = writeln!(buf, "\n// body size: {total}, content-type {content_type} not printable");
            return;
        }

        buf.push('\n');
        match http::decode_content(&body, headers.content_encoding()) {
            Ok(decoded) => {
                buf.push_str(&String::from_utf8_lossy(&decoded));
                buf.push('\n');
            }
            Err(error) => {
                let _ = writeln!(buf, "// body decode error: {error:#}");
            }
        }

        if total > body.len() as u64 {
            let _ = writeln!(buf, "// body truncated, full size: {total}");
        }
    }
}

fn format_uuid(uuid: Option<uuid::Uuid>) -> String {
    uuid.map(|u| u.to_string()).unwrap_or_else(|| "-".to_owned())
}

fn format_timestamp(timestamp: Option<chrono::DateTime<chrono::Utc>>) -> String {
    timestamp
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .unwrap_or_else(|| "-".to_owned())
}

/// Request-only consumer loop, shared by the fast handler and the strict
/// handler when responses are not printed.
async fn consume_requests(core: &HandlerCore, key: ConnectionKey, reader: &mut StreamReader) {
    loop {
        let request = match http::read_request(reader).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, connection = %key, "Error parsing HTTP request");
                break;
            }
        };

        if core.request_filtered(&request) {
            let framing = http::request_body_framing(&request);
            if let Err(error) = http::drain_body(reader, framing).await {
                debug!(%error, connection = %key, "Error draining filtered request body");
            }
            continue;
        }

        let mut buf = String::new();
        core.print_request(&mut buf, &key, &request, reader).await;
        if !buf.is_empty() {
            core.sender.send(buf).await;
        }
    }

    reader.drain().await;
}

/// Response-only consumer loop for the fast handler.
async fn consume_responses(core: &HandlerCore, key: ConnectionKey, client_id: String, reader: &mut StreamReader) {
    if !core.cfg.print_responses {
        reader.drain().await;
        return;
    }

    loop {
        let response = match http::read_response(reader).await {
            Ok(Some(response)) => response,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, connection = %key, client = %client_id, "Error parsing HTTP response");
                break;
            }
        };

        if core.response_filtered(response.status) {
            let framing = http::response_body_framing(&response);
            if let Err(error) = http::drain_body(reader, framing).await {
                debug!(%error, connection = %key, "Error draining filtered response body");
            }
            continue;
        }

        let mut buf = String::new();
        core.print_response(&mut buf, &key, &response, reader).await;
        if !buf.is_empty() {
            core.sender.send(buf).await;
        }
    }

    reader.drain().await;
}

// === strict variant === //

/// Consumes request and response in lockstep and emits one record per
/// exchange, so every response is attributed to its request.
pub struct HttpConnectionHandler {
    core: Arc<HandlerCore>,
    tasks: TaskTracker,
}

impl HttpConnectionHandler {
    pub fn new(cfg: HandlerConfig, sender: RecordSender) -> Self {
        Self {
            core: HandlerCore::new(cfg, sender),
            tasks: TaskTracker::new(),
        }
    }
}

#[async_trait]
impl ConnectionHandler for HttpConnectionHandler {
    fn handle(&self, conn: ConnectionStreams) {
        let core = Arc::clone(&self.core);
        let _ = self.tasks.spawn(handle_paired(core, conn));
    }

    async fn finish(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn handle_paired(core: Arc<HandlerCore>, conn: ConnectionStreams) {
    let ConnectionStreams {
        key,
        client_id,
        mut request,
        mut response,
    } = conn;

    if !core.cfg.print_responses {
        // No pairing to maintain; keep the response side drained so the
        // producer isn't forced to evict.
        tokio::join!(consume_requests(&core, key, &mut request), response.drain());
        return;
    }

    let mut response_alive = true;

    loop {
        let parsed = match http::read_request(&mut request).await {
            Ok(Some(parsed)) => parsed,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, connection = %key, "Error parsing HTTP request");
                break;
            }
        };

        let mut buf = String::new();
        let request_passes = !core.request_filtered(&parsed);

        if request_passes {
            core.print_request(&mut buf, &key, &parsed, &mut request).await;
        } else {
            let framing = http::request_body_framing(&parsed);
            if let Err(error) = http::drain_body(&mut request, framing).await {
                debug!(%error, connection = %key, "Error draining filtered request body");
            }
        }

        if response_alive {
            match tokio::time::timeout(RESPONSE_TIMEOUT, http::read_response(&mut response)).await {
                Ok(Ok(Some(parsed_response))) => {
                    if core.response_filtered(parsed_response.status) {
                        let framing = http::response_body_framing(&parsed_response);
                        if let Err(error) = http::drain_body(&mut response, framing).await {
                            debug!(%error, connection = %key, "Error draining filtered response body");
                        }
                    } else {
                        core.print_response(&mut buf, &key, &parsed_response, &mut response).await;
                    }
                }
                Ok(Ok(None)) => {
                    response_alive = false;
                    if request_passes {
                        let _ = writeln!(buf, "\n// unpaired request: response stream ended");
                    }
                }
                Ok(Err(error)) => {
                    warn!(%error, connection = %key, client = %client_id, "Error parsing HTTP response");
                    response_alive = false;
                    if request_passes {
                        let _ = writeln!(buf, "\n// unpaired request: malformed response");
                    }
                }
                Err(_elapsed) => {
                    if request_passes {
                        let _ = writeln!(buf, "\n// unpaired request: no response within {RESPONSE_TIMEOUT:?}");
                    }
                }
            }
        }

        if !buf.is_empty() {
            core.sender.send(buf).await;
        }
    }

    tokio::join!(request.drain(), response.drain());
}

// === fast variant === //

/// Runs one independent consumer per direction; pairing is implicit through
/// the connection key and the monotonic sequence numbers.
pub struct FastConnectionHandler {
    core: Arc<HandlerCore>,
    tasks: TaskTracker,
}

impl FastConnectionHandler {
    pub fn new(cfg: HandlerConfig, sender: RecordSender) -> Self {
        Self {
            core: HandlerCore::new(cfg, sender),
            tasks: TaskTracker::new(),
        }
    }
}

#[async_trait]
impl ConnectionHandler for FastConnectionHandler {
    fn handle(&self, conn: ConnectionStreams) {
        let ConnectionStreams {
            key,
            client_id,
            mut request,
            mut response,
        } = conn;

        let request_core = Arc::clone(&self.core);
        let _ = self.tasks.spawn(async move {
            consume_requests(&request_core, key, &mut request).await;
        });

        let response_core = Arc::clone(&self.core);
        let _ = self.tasks.spawn(async move {
            consume_responses(&response_core, key, client_id, &mut response).await;
        });
    }

    async fn finish(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HandlerConfig {
        HandlerConfig {
            level: Level::Header,
            host_pattern: None,
            uri_pattern: None,
            methods: None,
            print_responses: true,
            status: IntSet::default(),
            force_body: false,
        }
    }

    fn request(method: &str, uri: &str, host: &str) -> Request {
        Request {
            method: method.to_owned(),
            uri: uri.to_owned(),
            version: "HTTP/1.1".to_owned(),
            headers: Headers::from_lines(vec![format!("Host: {host}")]),
            uuid: None,
            timestamp: None,
        }
    }

    fn core_with(cfg: HandlerConfig) -> Arc<HandlerCore> {
        HandlerCore::new(cfg, RecordSender::test_stub())
    }

    #[test]
    fn level_parses_all_known_names() {
        assert_eq!("l0".parse::<Level>().unwrap(), Level::L0);
        assert_eq!("url".parse::<Level>().unwrap(), Level::Url);
        assert_eq!("header".parse::<Level>().unwrap(), Level::Header);
        assert_eq!("all".parse::<Level>().unwrap(), Level::All);
        assert!("verbose".parse::<Level>().is_err());
    }

    #[test]
    fn host_filter_uses_wildcards() {
        let mut cfg = config();
        cfg.host_pattern = Some("*.example.com".to_owned());
        let core = core_with(cfg);

        assert!(!core.request_filtered(&request("GET", "/", "api.example.com")));
        assert!(core.request_filtered(&request("GET", "/", "evil.org")));
    }

    #[test]
    fn uri_filter_uses_wildcards() {
        let mut cfg = config();
        cfg.uri_pattern = Some("/api/*".to_owned());
        let core = core_with(cfg);

        assert!(!core.request_filtered(&request("GET", "/api/users", "h")));
        assert!(core.request_filtered(&request("GET", "/health", "h")));
    }

    #[test]
    fn method_filter_is_a_csv_membership_test() {
        let mut cfg = config();
        cfg.methods = Some("GET,POST".to_owned());
        let core = core_with(cfg);

        assert!(!core.request_filtered(&request("GET", "/", "h")));
        assert!(!core.request_filtered(&request("post", "/", "h")));
        assert!(core.request_filtered(&request("DELETE", "/", "h")));
    }

    #[test]
    fn empty_status_set_passes_everything() {
        let core = core_with(config());
        assert!(!core.response_filtered(200));
        assert!(!core.response_filtered(500));

        let mut cfg = config();
        cfg.status = "200-299".parse().unwrap();
        let core = core_with(cfg);
        assert!(!core.response_filtered(204));
        assert!(core.response_filtered(404));
    }
}
