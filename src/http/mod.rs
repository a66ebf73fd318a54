//! HTTP/1.x message reading over a reassembled stream.
//!
//! Only the pieces a passive observer needs: start line, headers, and the
//! three body framings (`Content-Length`, chunked, read-until-EOF). Header
//! lines are kept verbatim because re-serialising canonicalised headers
//! would lose their original ordering and casing.

use std::io::Read as _;

use anyhow::Context as _;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use uuid::Uuid;

use crate::stream::StreamReader;

/// Upper bound on an accumulated message head; anything larger is treated
/// as garbage rather than HTTP.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Header block of one message, original lines retained verbatim.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    lines: Vec<String>,
}

#[cfg(test)]
impl Headers {
    pub(crate) fn from_lines(lines: Vec<String>) -> Self {
        Self { lines }
    }
}

impl Headers {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// First value of the named header, case-insensitive, trimmed.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let (header, value) = line.split_once(':')?;
            header.trim().eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get("Content-Length")?.parse().ok()
    }

    pub fn is_chunked(&self) -> bool {
        self.get("Transfer-Encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("Content-Type")
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.get("Content-Encoding")
    }

    pub fn host(&self) -> Option<&str> {
        self.get("Host")
    }
}

#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    /// Segment that carried the end of the message head.
    pub uuid: Option<Uuid>,
    /// Capture timestamp of that segment; approximates the message start.
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct Response {
    /// Status line exactly as captured, e.g. `HTTP/1.1 200 OK`.
    pub status_line: String,
    pub status: u16,
    pub headers: Headers,
    pub uuid: Option<Uuid>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Read one request head from the stream.
///
/// `Ok(None)` means the stream ended cleanly at a message boundary;
/// anything malformed or truncated mid-head is an error.
pub async fn read_request(reader: &mut StreamReader) -> anyhow::Result<Option<Request>> {
    let Some(head) = read_head(reader).await? else {
        return Ok(None);
    };

    let mut parsed_headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut parsed_headers);
    match parsed.parse(&head).context("malformed request head")? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => anyhow::bail!("truncated request head"),
    }

    let request = Request {
        method: parsed.method.context("request without method")?.to_owned(),
        uri: parsed.path.context("request without URI")?.to_owned(),
        version: format!("HTTP/1.{}", parsed.version.context("request without version")?),
        headers: raw_header_lines(&head).1,
        uuid: reader.last_uuid(),
        timestamp: reader.last_timestamp(),
    };

    Ok(Some(request))
}

/// Read one response head from the stream; `Ok(None)` on clean EOF.
pub async fn read_response(reader: &mut StreamReader) -> anyhow::Result<Option<Response>> {
    let Some(head) = read_head(reader).await? else {
        return Ok(None);
    };

    let mut parsed_headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut parsed_headers);
    match parsed.parse(&head).context("malformed response head")? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => anyhow::bail!("truncated response head"),
    }

    let (status_line, headers) = raw_header_lines(&head);

    let response = Response {
        status_line,
        status: parsed.code.context("response without status code")?,
        headers,
        uuid: reader.last_uuid(),
        timestamp: reader.last_timestamp(),
    };

    Ok(Some(response))
}

async fn read_head(reader: &mut StreamReader) -> anyhow::Result<Option<BytesMut>> {
    let mut head = BytesMut::new();

    loop {
        match reader.read_byte().await {
            Some(byte) => {
                head.extend_from_slice(&[byte]);
                if head.ends_with(b"\r\n\r\n") {
                    return Ok(Some(head));
                }
                if head.len() > MAX_HEAD_SIZE {
                    anyhow::bail!("message head exceeds {MAX_HEAD_SIZE} bytes");
                }
            }
            None if head.is_empty() => return Ok(None),
            None => anyhow::bail!("stream ended in the middle of a message head"),
        }
    }
}

fn raw_header_lines(head: &[u8]) -> (String, Headers) {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");

    let start_line = lines.next().unwrap_or_default().to_owned();
    let header_lines = lines
        .take_while(|line| !line.is_empty())
        .map(str::to_owned)
        .collect();

    (start_line, Headers { lines: header_lines })
}

// === body framing === //

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head.
    None,
    /// Exactly this many bytes follow.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Body runs until the peer closes the connection.
    UntilEof,
}

impl BodyFraming {
    pub fn has_body(self) -> bool {
        !matches!(self, BodyFraming::None)
    }
}

pub fn request_body_framing(request: &Request) -> BodyFraming {
    if matches!(request.method.as_str(), "GET" | "HEAD" | "TRACE" | "OPTIONS") {
        return BodyFraming::None;
    }
    if request.headers.is_chunked() {
        return BodyFraming::Chunked;
    }
    match request.headers.content_length() {
        Some(n) if n > 0 => BodyFraming::Length(n),
        // Requests without explicit framing carry no body.
        _ => BodyFraming::None,
    }
}

pub fn response_body_framing(response: &Response) -> BodyFraming {
    if matches!(response.status, 204 | 304) {
        return BodyFraming::None;
    }
    if response.headers.is_chunked() {
        return BodyFraming::Chunked;
    }
    match response.headers.content_length() {
        Some(0) => BodyFraming::None,
        Some(n) => BodyFraming::Length(n),
        None => BodyFraming::UntilEof,
    }
}

/// Read the framed body, still content-encoded, capped at `limit` bytes
/// (the remainder is drained and counted but not kept).
pub async fn read_body(
    reader: &mut StreamReader,
    framing: BodyFraming,
    limit: usize,
) -> anyhow::Result<(Vec<u8>, u64)> {
    let mut body = Vec::new();
    let total = consume_body(reader, framing, &mut |bytes| {
        let room = limit.saturating_sub(body.len());
        body.extend_from_slice(&bytes[..bytes.len().min(room)]);
    })
    .await?;
    Ok((body, total))
}

/// Discard the framed body, returning the number of bytes skipped.
pub async fn drain_body(reader: &mut StreamReader, framing: BodyFraming) -> anyhow::Result<u64> {
    consume_body(reader, framing, &mut |_| {}).await
}

async fn consume_body(
    reader: &mut StreamReader,
    framing: BodyFraming,
    sink: &mut (dyn FnMut(&[u8]) + Send),
) -> anyhow::Result<u64> {
    match framing {
        BodyFraming::None => Ok(0),
        BodyFraming::Length(n) => read_exact(reader, n, sink).await,
        BodyFraming::UntilEof => {
            let mut buf = [0u8; 4096];
            let mut total = 0u64;
            loop {
                match reader.read(&mut buf).await {
                    0 => return Ok(total),
                    n => {
                        sink(&buf[..n]);
                        total += n as u64;
                    }
                }
            }
        }
        BodyFraming::Chunked => {
            let mut total = 0u64;
            loop {
                let size_line = read_line(reader).await?;
                let size_field = size_line.split(';').next().unwrap_or_default().trim();
                let size = u64::from_str_radix(size_field, 16)
                    .with_context(|| format!("bad chunk size line `{size_line}`"))?;

                if size == 0 {
                    // Skip optional trailers up to the final empty line.
                    loop {
                        if read_line(reader).await?.is_empty() {
                            return Ok(total);
                        }
                    }
                }

                total += read_exact(reader, size, sink).await?;

                let delimiter = read_line(reader).await?;
                if !delimiter.is_empty() {
                    anyhow::bail!("missing CRLF after chunk data");
                }
            }
        }
    }
}

async fn read_exact(reader: &mut StreamReader, n: u64, sink: &mut (dyn FnMut(&[u8]) + Send)) -> anyhow::Result<u64> {
    let mut buf = [0u8; 4096];
    let mut remaining = n;
    while remaining > 0 {
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(buf.len()));
        match reader.read(&mut buf[..want]).await {
            0 => anyhow::bail!("stream ended with {remaining} body bytes missing"),
            got => {
                sink(&buf[..got]);
                remaining -= got as u64;
            }
        }
    }
    Ok(n)
}

async fn read_line(reader: &mut StreamReader) -> anyhow::Result<String> {
    let mut line = Vec::new();
    loop {
        match reader.read_byte().await {
            Some(b'\n') => {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            Some(byte) => {
                line.push(byte);
                if line.len() > MAX_HEAD_SIZE {
                    anyhow::bail!("line exceeds {MAX_HEAD_SIZE} bytes");
                }
            }
            None => anyhow::bail!("stream ended in the middle of a line"),
        }
    }
}

// === content inspection === //

/// Decode `Content-Encoding` on a fully collected body.
pub fn decode_content(body: &[u8], encoding: Option<&str>) -> anyhow::Result<Vec<u8>> {
    let encoding = encoding.map(|e| e.trim().to_ascii_lowercase());

    match encoding.as_deref() {
        None | Some("") | Some("identity") => Ok(body.to_vec()),
        Some("gzip") | Some("x-gzip") => {
            let mut decoded = Vec::new();
            MultiGzDecoder::new(body)
                .read_to_end(&mut decoded)
                .context("bad gzip body")?;
            Ok(decoded)
        }
        Some("deflate") => {
            // Zlib-wrapped per the RFC, but some servers send raw deflate.
            let mut decoded = Vec::new();
            if ZlibDecoder::new(body).read_to_end(&mut decoded).is_ok() {
                return Ok(decoded);
            }
            decoded.clear();
            DeflateDecoder::new(body)
                .read_to_end(&mut decoded)
                .context("bad deflate body")?;
            Ok(decoded)
        }
        Some(other) => anyhow::bail!("unsupported content encoding `{other}`"),
    }
}

const TEXTUAL_APPLICATION_TYPES: &[&str] = &[
    "application/json",
    "application/xml",
    "application/xhtml+xml",
    "application/x-www-form-urlencoded",
    "application/javascript",
    "application/ecmascript",
];

/// Whether a content type is worth rendering as UTF-8 text.
pub fn is_textual_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    essence.starts_with("text/")
        || TEXTUAL_APPLICATION_TYPES.contains(&essence.as_str())
        || content_type.to_ascii_lowercase().contains("charset=")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::stream_pair;
    use crate::tcp::Segment;

    fn stream_with(bytes: &[u8]) -> StreamReader {
        let (mut stream, reader) = stream_pair("test".to_owned(), 64);
        stream.push(Segment {
            seq: 1,
            payload: bytes.to_vec(),
            timestamp: Utc::now(),
            uuid: Uuid::new_v4(),
            syn: false,
            ack: true,
            fin: false,
            rst: false,
        });
        stream.close();
        reader
    }

    #[tokio::test]
    async fn parses_simple_request() {
        let mut reader = stream_with(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n");

        let request = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.uri, "/x");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.headers.host(), Some("a"));
        assert_eq!(request_body_framing(&request), BodyFraming::None);

        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn preserves_raw_header_lines() {
        let mut reader = stream_with(b"POST /u HTTP/1.1\r\nX-CuStOm-CASING: kept\r\nHost: a\r\nContent-Length: 0\r\n\r\n");

        let request = read_request(&mut reader).await.unwrap().unwrap();
        let lines: Vec<&str> = request.headers.lines().collect();
        assert_eq!(lines[0], "X-CuStOm-CASING: kept");
        assert_eq!(lines[1], "Host: a");
        assert_eq!(request.headers.get("x-custom-casing"), Some("kept"));
    }

    #[tokio::test]
    async fn reads_content_length_body() {
        let mut reader = stream_with(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc");

        let response = read_response(&mut reader).await.unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.status_line, "HTTP/1.1 200 OK");

        let framing = response_body_framing(&response);
        assert_eq!(framing, BodyFraming::Length(3));
        let (body, total) = read_body(&mut reader, framing, 1024).await.unwrap();
        assert_eq!(body, b"abc");
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn reads_chunked_body() {
        let mut reader =
            stream_with(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n");

        let response = read_response(&mut reader).await.unwrap().unwrap();
        let framing = response_body_framing(&response);
        assert_eq!(framing, BodyFraming::Chunked);

        let (body, total) = read_body(&mut reader, framing, 1024).await.unwrap();
        assert_eq!(body, b"abcde");
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn response_without_framing_reads_until_eof() {
        let mut reader = stream_with(b"HTTP/1.1 200 OK\r\n\r\nrest of the stream");

        let response = read_response(&mut reader).await.unwrap().unwrap();
        let framing = response_body_framing(&response);
        assert_eq!(framing, BodyFraming::UntilEof);

        let (body, _) = read_body(&mut reader, framing, 1024).await.unwrap();
        assert_eq!(body, b"rest of the stream");
    }

    #[tokio::test]
    async fn pipelined_requests_parse_in_order() {
        let mut reader = stream_with(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n");

        let first = read_request(&mut reader).await.unwrap().unwrap();
        let second = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.uri, "/a");
        assert_eq!(second.uri, "/b");
        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_head_is_an_error() {
        let mut reader = stream_with(b"GET /x HTTP/1.1\r\nHost: a");
        assert!(read_request(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn bad_chunk_size_is_an_error() {
        let mut reader = stream_with(b"zz\r\nabc\r\n");
        assert!(drain_body(&mut reader, BodyFraming::Chunked).await.is_err());
    }

    #[test]
    fn gzip_round_trip_decodes() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write as _;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello gzip").unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decode_content(&compressed, Some("gzip")).unwrap();
        assert_eq!(decoded, b"hello gzip");
    }

    #[test]
    fn textual_content_types() {
        assert!(is_textual_content_type("text/html; charset=utf-8"));
        assert!(is_textual_content_type("application/json"));
        assert!(is_textual_content_type("Application/XML"));
        assert!(!is_textual_content_type("application/octet-stream"));
        assert!(!is_textual_content_type("image/png"));
    }
}
