use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use http::{HeaderMap, Method, StatusCode, header::HeaderName};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::io_util::timeout_with_context;

use super::body::BodyPlan;

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub async fn read_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    max_len: usize,
    context: &str,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();

    loop {
        let available = timeout_with_context(timeout_dur, reader.fill_buf(), context).await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while {context}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("line length overflow while {context}"))?
            > max_len
        {
            bail!("line exceeds configured limit of {max_len} bytes while {context}");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string =
        String::from_utf8(collected).map_err(|_| anyhow!("invalid bytes while {context}"))?;
    let len = string.len();
    *buf = string;
    Ok(len)
}

#[derive(Debug, Clone)]
pub struct HeaderLine {
    pub name: String,
    pub value: String,
    lower_name: String,
}

impl HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let lower_name = name.to_ascii_lowercase();
        Self {
            name,
            value: value.into(),
            lower_name,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }
}

/// Collects header lines, enforcing a total byte budget and tracking the
/// fields the proxy cares about.
pub struct HeaderAccumulator {
    headers: Vec<HeaderLine>,
    max_bytes: usize,
    total_bytes: usize,
    connection_tokens: Vec<String>,
}

impl HeaderAccumulator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            headers: Vec::new(),
            max_bytes,
            total_bytes: 0,
            connection_tokens: Vec::new(),
        }
    }

    /// Parses one header line. Returns false once the blank terminator line
    /// has been consumed.
    pub fn push_line(&mut self, line: &str) -> Result<bool> {
        self.total_bytes = self
            .total_bytes
            .checked_add(line.len())
            .ok_or_else(|| anyhow!("header size overflow"))?;
        ensure!(
            self.total_bytes <= self.max_bytes,
            "headers exceed configured limit of {} bytes",
            self.max_bytes
        );

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(false);
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();
        ensure!(!name.is_empty(), "header name must not be empty");
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;

        let header = HeaderLine::new(name, value);
        if header.lower_name() == "connection" {
            for token in header.value.split(',') {
                let token = token.trim();
                if !token.is_empty() {
                    self.connection_tokens.push(token.to_ascii_lowercase());
                }
            }
        }
        self.headers.push(header);
        Ok(true)
    }

    pub fn get(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.lower_name() == lower_name)
            .map(|header| header.value.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.get("host")
    }

    pub fn content_length(&self) -> Result<Option<u64>> {
        match self.get("content-length") {
            Some(value) => {
                let parsed = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| anyhow!("invalid Content-Length '{value}'"))?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .iter()
            .filter(|header| header.lower_name() == "transfer-encoding")
            .any(|header| {
                header
                    .value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
            })
    }

    pub fn wants_connection_close(&self) -> bool {
        self.connection_tokens.iter().any(|token| token == "close")
    }

    /// The end-to-end headers, with hop-by-hop fields and anything named in
    /// Connection tokens dropped.
    pub fn end_to_end_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for header in &self.headers {
            let lower = header.lower_name();
            if lower == "host"
                || lower == "content-length"
                || HOP_BY_HOP_HEADERS.contains(&lower)
                || self.connection_tokens.iter().any(|token| token == lower)
            {
                continue;
            }
            if let Ok(name) = HeaderName::from_bytes(header.name.as_bytes())
                && let Ok(value) = http::HeaderValue::from_str(&header.value)
            {
                map.append(name, value);
            }
        }
        map
    }

    pub fn into_lines(self) -> Vec<HeaderLine> {
        self.headers
    }
}

#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: Method,
    pub target: String,
    pub version: String,
}

pub fn parse_request_line(line: &str) -> Result<RequestLine> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let mut parts = trimmed.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow!("missing request method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("missing request target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("missing request version"))?;
    ensure!(
        parts.next().is_none(),
        "malformed request line '{trimmed}'"
    );
    ensure!(
        version == "HTTP/1.1" || version == "HTTP/1.0",
        "unsupported protocol version '{version}'"
    );
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| anyhow!("invalid request method '{method}'"))?;
    Ok(RequestLine {
        method,
        target: target.to_string(),
        version: version.to_string(),
    })
}

/// The parsed head of an HTTP/1.1 response: status line and header lines
/// verbatim, plus the framing fields derived from them.
#[derive(Debug)]
pub struct ResponseHead {
    pub status_line: String,
    pub status: StatusCode,
    pub headers: Vec<HeaderLine>,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

impl ResponseHead {
    pub fn new(status: StatusCode, headers: Vec<HeaderLine>, content_length: Option<u64>) -> Self {
        let reason = status.canonical_reason().unwrap_or("");
        Self {
            status_line: format!("HTTP/1.1 {} {}", status.as_u16(), reason)
                .trim_end()
                .to_string(),
            status,
            headers,
            content_length,
            chunked: false,
        }
    }

    pub fn get(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.lower_name() == lower_name)
            .map(|header| header.value.as_str())
    }

    pub fn get_all<'a>(&'a self, lower_name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |header| header.lower_name() == lower_name)
            .map(|header| header.value.as_str())
    }

    /// Encodes the head for the wire or for disk. Hop-by-hop headers and
    /// message framing headers are dropped and re-derived from the body
    /// plan, so the output is canonical for a given (head, plan) pair.
    pub fn encode(&self, plan: BodyPlan, close: bool) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(256);
        buffer.extend_from_slice(self.status_line.as_bytes());
        buffer.extend_from_slice(b"\r\n");

        for header in &self.headers {
            let lower = header.lower_name();
            if lower == "content-length" || HOP_BY_HOP_HEADERS.contains(&lower) {
                continue;
            }
            buffer.extend_from_slice(header.name.as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(header.value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }

        match plan {
            BodyPlan::Fixed(length) => {
                buffer.extend_from_slice(b"Content-Length: ");
                buffer.extend_from_slice(length.to_string().as_bytes());
                buffer.extend_from_slice(b"\r\n");
            }
            BodyPlan::Chunked => {
                buffer.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
            }
            BodyPlan::Empty => {
                if let Some(length) = self.content_length {
                    buffer.extend_from_slice(b"Content-Length: ");
                    buffer.extend_from_slice(length.to_string().as_bytes());
                    buffer.extend_from_slice(b"\r\n");
                }
            }
            BodyPlan::UntilClose => {}
        }

        if close || matches!(plan, BodyPlan::UntilClose) {
            buffer.extend_from_slice(b"Connection: close\r\n");
        }
        buffer.extend_from_slice(b"\r\n");
        buffer
    }
}

pub async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    max_header_bytes: usize,
    context: &str,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let read = read_line_with_timeout(reader, &mut line, timeout_dur, max_header_bytes, context)
        .await?;
    ensure!(read > 0, "unexpected EOF while {context}");

    let status_line = line.trim_end_matches(['\r', '\n']).to_string();
    let mut parts = status_line.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("missing protocol version while {context}"))?;
    ensure!(
        version.starts_with("HTTP/1."),
        "unsupported protocol version '{version}' while {context}"
    );
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("missing status code while {context}"))?;
    let status = status
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| anyhow!("invalid status code '{status}' while {context}"))?;

    let mut accumulator = HeaderAccumulator::new(max_header_bytes);
    loop {
        let read =
            read_line_with_timeout(reader, &mut line, timeout_dur, max_header_bytes, context)
                .await?;
        ensure!(read > 0, "unexpected EOF in headers while {context}");
        if !accumulator.push_line(&line)? {
            break;
        }
    }

    let content_length = accumulator.content_length()?;
    let chunked = accumulator.is_chunked();
    Ok(ResponseHead {
        status_line,
        status,
        headers: accumulator.into_lines(),
        content_length,
        chunked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn parse(raw: &[u8]) -> Result<ResponseHead> {
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
        read_response_head(
            &mut reader,
            Duration::from_secs(1),
            8192,
            "reading test response",
        )
        .await
    }

    #[tokio::test]
    async fn parses_response_head() -> Result<()> {
        let head = parse(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 3\r\n\r\nxyz",
        )
        .await?;
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.status_line, "HTTP/1.1 200 OK");
        assert_eq!(head.content_length, Some(3));
        assert!(!head.chunked);
        assert_eq!(head.get("content-type"), Some("text/plain"));
        Ok(())
    }

    #[tokio::test]
    async fn detects_chunked_encoding() -> Result<()> {
        let head =
            parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n").await?;
        assert!(head.chunked);
        assert_eq!(head.content_length, None);
        Ok(())
    }

    #[tokio::test]
    async fn encode_parse_round_trip_is_stable() -> Result<()> {
        let head = parse(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nETag: \"v1\"\r\nContent-Length: 5\r\n\r\n",
        )
        .await?;
        let encoded = head.encode(BodyPlan::Fixed(5), false);
        let reparsed = parse(&encoded).await?;
        let reencoded = reparsed.encode(BodyPlan::Fixed(5), false);
        assert_eq!(encoded, reencoded);
        assert_eq!(reparsed.status, head.status);
        assert_eq!(reparsed.get("etag"), Some("\"v1\""));
        Ok(())
    }

    #[tokio::test]
    async fn encode_strips_hop_by_hop_headers() -> Result<()> {
        let head = parse(
            b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nKeep-Alive: timeout=5\r\nContent-Length: 2\r\n\r\n",
        )
        .await?;
        let encoded = String::from_utf8(head.encode(BodyPlan::Fixed(2), false))?;
        assert!(!encoded.to_ascii_lowercase().contains("keep-alive"));
        assert!(encoded.contains("Content-Length: 2"));
        Ok(())
    }

    #[tokio::test]
    async fn rejects_invalid_status_line() {
        assert!(parse(b"NONSENSE\r\n\r\n").await.is_err());
        assert!(parse(b"HTTP/1.1 abc OK\r\n\r\n").await.is_err());
    }

    #[test]
    fn parses_request_line_forms() -> Result<()> {
        let line = parse_request_line("GET http://example.com/a HTTP/1.1\r\n")?;
        assert_eq!(line.method, Method::GET);
        assert_eq!(line.target, "http://example.com/a");

        let connect = parse_request_line("CONNECT example.com:443 HTTP/1.1\r\n")?;
        assert_eq!(connect.method, Method::CONNECT);
        assert_eq!(connect.target, "example.com:443");

        assert!(parse_request_line("GET /\r\n").is_err());
        assert!(parse_request_line("GET / HTTP/2.0\r\n").is_err());
        Ok(())
    }

    #[test]
    fn accumulator_enforces_budget_and_tracks_fields() -> Result<()> {
        let mut accumulator = HeaderAccumulator::new(1024);
        assert!(accumulator.push_line("Host: example.com\r\n")?);
        assert!(accumulator.push_line("Content-Length: 12\r\n")?);
        assert!(accumulator.push_line("Connection: close\r\n")?);
        assert!(!accumulator.push_line("\r\n")?);
        assert_eq!(accumulator.host(), Some("example.com"));
        assert_eq!(accumulator.content_length()?, Some(12));
        assert!(accumulator.wants_connection_close());

        let mut tiny = HeaderAccumulator::new(8);
        assert!(tiny.push_line("X-Long-Header: value\r\n").is_err());
        Ok(())
    }

    #[test]
    fn end_to_end_map_drops_hop_by_hop() -> Result<()> {
        let mut accumulator = HeaderAccumulator::new(1024);
        accumulator.push_line("Host: example.com\r\n")?;
        accumulator.push_line("Connection: x-custom\r\n")?;
        accumulator.push_line("X-Custom: 1\r\n")?;
        accumulator.push_line("Accept: */*\r\n")?;
        accumulator.push_line("Proxy-Connection: keep-alive\r\n")?;
        accumulator.push_line("\r\n")?;

        let map = accumulator.end_to_end_header_map();
        assert!(map.get("accept").is_some());
        assert!(map.get("host").is_none());
        assert!(map.get("x-custom").is_none());
        assert!(map.get("proxy-connection").is_none());
        Ok(())
    }
}
