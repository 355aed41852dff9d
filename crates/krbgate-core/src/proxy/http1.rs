/// Minimal HTTP/1.1 message plumbing for the proxy front-end.
///
/// Only what a forwarding proxy needs: bounded head parsing, header editing
/// with order preserved, and body framing for streaming copies. Tunnelled
/// bytes never pass through this module.

use anyhow::{anyhow, bail, Result};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a request or response head, including all header lines.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Ordered, case-insensitive header map.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace every occurrence of `name` with a single entry.
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.entries.push((name.to_string(), value.to_string()));
    }

    pub fn append(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Comma-separated value tokens of every `name` entry, lowercased.
    pub fn tokens(&self, name: &str) -> Vec<String> {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Message heads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Request target exactly as received: absolute-form for proxied plain
    /// HTTP, authority-form (`host:port`) for CONNECT.
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

/// Read a full message head (request or status line plus headers) up to and
/// including the blank line. Returns `None` on clean EOF before the first
/// byte. Stream-level problems are reported as [`io::Error`] so callers can
/// classify them.
pub async fn read_head<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Option<Vec<u8>>> {
    let mut head = Vec::new();
    loop {
        let start = head.len();
        let n = r
            .read_until(b'\n', &mut head)
            .await
            .map_err(anyhow::Error::from)?;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of stream inside message head",
            )
            .into());
        }
        if head.len() > MAX_HEAD_SIZE {
            bail!("message head exceeds {} bytes", MAX_HEAD_SIZE);
        }
        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }
    Ok(Some(head))
}

fn parse_header_lines(lines: std::str::Lines<'_>) -> Result<Headers> {
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed header line: {}", line))?;
        headers.append(name.trim(), value.trim());
    }
    Ok(headers)
}

pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead> {
    let text = std::str::from_utf8(raw).map_err(|_| anyhow!("message head is not valid UTF-8"))?;
    let mut lines = text.lines();
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request head"))?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();
    let version = parts.next().unwrap_or("").to_string();
    if method.is_empty() || target.is_empty() {
        bail!("malformed request line: {}", request_line);
    }
    if !version.starts_with("HTTP/1.") {
        bail!("unsupported protocol version: {}", version);
    }

    Ok(RequestHead {
        method,
        target,
        version,
        headers: parse_header_lines(lines)?,
    })
}

pub fn parse_response_head(raw: &[u8]) -> Result<ResponseHead> {
    let text = std::str::from_utf8(raw).map_err(|_| anyhow!("message head is not valid UTF-8"))?;
    let mut lines = text.lines();
    let status_line = lines.next().ok_or_else(|| anyhow!("empty response head"))?;

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("").to_string();
    let status_text = parts.next().unwrap_or("");
    let reason = parts.next().unwrap_or("").to_string();
    if !version.starts_with("HTTP/1.") {
        bail!("malformed status line: {}", status_line);
    }
    let status: u16 = status_text
        .parse()
        .map_err(|_| anyhow!("non-numeric status code: {}", status_text))?;

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers: parse_header_lines(lines)?,
    })
}

pub async fn read_request_head<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Option<RequestHead>> {
    match read_head(r).await? {
        None => Ok(None),
        Some(raw) => parse_request_head(&raw).map(Some),
    }
}

/// Read a response head; EOF before the status line is a stream error here.
pub async fn read_response_head<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<ResponseHead> {
    match read_head(r).await? {
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before response head",
        )
        .into()),
        Some(raw) => parse_response_head(&raw),
    }
}

pub async fn write_request_head<W: AsyncWrite + Unpin>(
    w: &mut W,
    head: &RequestHead,
) -> Result<()> {
    let mut out = format!("{} {} {}\r\n", head.method, head.target, head.version);
    for (name, value) in head.headers.iter() {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    w.write_all(out.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

pub async fn write_response_head<W: AsyncWrite + Unpin>(
    w: &mut W,
    head: &ResponseHead,
) -> Result<()> {
    let mut out = format!("{} {} {}\r\n", head.version, head.status, head.reason);
    for (name, value) in head.headers.iter() {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    w.write_all(out.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Write a synthetic response with an optional short plain-text body. Used
/// for the proxy's own 405/500/502 answers.
pub async fn write_simple_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: u16,
    reason: &str,
    body: Option<&str>,
) -> Result<()> {
    let body = body.unwrap_or("");
    let mut head = ResponseHead {
        version: "HTTP/1.1".to_string(),
        status,
        reason: reason.to_string(),
        headers: Headers::new(),
    };
    head.headers.set("Content-Length", &body.len().to_string());
    if !body.is_empty() {
        head.headers.set("Content-Type", "text/plain; charset=utf-8");
    }
    head.headers.set("Connection", "close");
    write_response_head(w, &head).await?;
    if !body.is_empty() {
        w.write_all(body.as_bytes()).await?;
        w.flush().await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Body framing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head.
    None,
    /// Exactly this many bytes follow.
    Length(u64),
    /// Chunked transfer coding.
    Chunked,
    /// Body is delimited by connection close.
    Close,
}

impl BodyFraming {
    /// A delimited body lets the connection be reused afterwards.
    pub fn is_delimited(&self) -> bool {
        !matches!(self, BodyFraming::Close)
    }
}

pub fn request_body_framing(head: &RequestHead) -> Result<BodyFraming> {
    if head
        .headers
        .tokens("Transfer-Encoding")
        .iter()
        .any(|t| t == "chunked")
    {
        return Ok(BodyFraming::Chunked);
    }
    if let Some(len) = head.headers.get("Content-Length") {
        let len: u64 = len
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid Content-Length: {}", len))?;
        return Ok(if len == 0 {
            BodyFraming::None
        } else {
            BodyFraming::Length(len)
        });
    }
    // Requests have no body unless framing says otherwise (RFC 7230 §3.3.3).
    Ok(BodyFraming::None)
}

pub fn response_body_framing(request_method: &str, head: &ResponseHead) -> Result<BodyFraming> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || head.status / 100 == 1
        || head.status == 204
        || head.status == 304
    {
        return Ok(BodyFraming::None);
    }
    if request_method.eq_ignore_ascii_case("CONNECT") && head.status / 100 == 2 {
        return Ok(BodyFraming::None);
    }
    if head
        .headers
        .tokens("Transfer-Encoding")
        .iter()
        .any(|t| t == "chunked")
    {
        return Ok(BodyFraming::Chunked);
    }
    if let Some(len) = head.headers.get("Content-Length") {
        let len: u64 = len
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid Content-Length: {}", len))?;
        return Ok(if len == 0 {
            BodyFraming::None
        } else {
            BodyFraming::Length(len)
        });
    }
    Ok(BodyFraming::Close)
}

/// Stream a message body from `r` to `w` according to `framing`, preserving
/// the original wire form. Returns the number of body bytes relayed.
pub async fn copy_body<R, W>(r: &mut R, w: &mut W, framing: BodyFraming) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match framing {
        BodyFraming::None => 0,
        BodyFraming::Length(len) => {
            let mut limited = (&mut *r).take(len);
            let n = tokio::io::copy(&mut limited, w).await?;
            if n < len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside message body",
                )
                .into());
            }
            n
        }
        BodyFraming::Chunked => copy_chunked(r, w).await?,
        BodyFraming::Close => tokio::io::copy(r, w).await?,
    };
    w.flush().await?;
    Ok(copied)
}

/// Relay a chunked body verbatim: size lines, chunk data, trailers.
async fn copy_chunked<R, W>(r: &mut R, w: &mut W) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let mut line = Vec::new();
        let n = r.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside chunked body",
            )
            .into());
        }
        w.write_all(&line).await?;
        total += line.len() as u64;

        let size_text = std::str::from_utf8(&line)
            .map_err(|_| anyhow!("malformed chunk size line"))?
            .trim();
        let size_text = size_text.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_text, 16)
            .map_err(|_| anyhow!("malformed chunk size: {}", size_text))?;

        if size == 0 {
            // Trailer section, terminated by a blank line.
            loop {
                let mut trailer = Vec::new();
                let n = r.read_until(b'\n', &mut trailer).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside chunk trailers",
                    )
                    .into());
                }
                w.write_all(&trailer).await?;
                total += trailer.len() as u64;
                if trailer == b"\r\n" || trailer == b"\n" {
                    return Ok(total);
                }
            }
        }

        // Chunk data plus its trailing CRLF.
        let mut limited = (&mut *r).take(size + 2);
        let copied = tokio::io::copy(&mut limited, w).await?;
        if copied < size + 2 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside chunk data",
            )
            .into());
        }
        total += copied;
    }
}

/// Read and drop a body; used for the 407 challenge page.
pub async fn discard_body<R: AsyncBufRead + Unpin>(r: &mut R, framing: BodyFraming) -> Result<u64> {
    let mut sink = tokio::io::sink();
    copy_body(r, &mut sink, framing).await
}

// ---------------------------------------------------------------------------
// Hop-by-hop headers
// ---------------------------------------------------------------------------

/// Remove connection-scoped headers before relaying a message.
///
/// `Transfer-Encoding` and `Content-Length` stay: the body is relayed with
/// its original framing.
pub fn strip_hop_by_hop(headers: &mut Headers) {
    // Headers nominated by Connection are hop-by-hop too.
    let nominated = headers.tokens("Connection");
    for name in nominated {
        if !name.eq_ignore_ascii_case("close") && !name.eq_ignore_ascii_case("keep-alive") {
            headers.remove(&name);
        }
    }
    for name in [
        "Connection",
        "Proxy-Connection",
        "Keep-Alive",
        "TE",
        "Trailer",
        "Upgrade",
        "Proxy-Authenticate",
    ] {
        headers.remove(name);
    }
}

/// Does this message ask for the connection to be closed after it?
pub fn wants_close(headers: &Headers, version: &str) -> bool {
    let tokens = headers.tokens("Connection");
    if tokens.iter().any(|t| t == "close") {
        return true;
    }
    // HTTP/1.0 defaults to close unless keep-alive is negotiated.
    version == "HTTP/1.0" && !tokens.iter().any(|t| t == "keep-alive")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_parse_request_head() {
        let raw = b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\nUser-Agent: curl/8.0\r\n\r\n";
        let mut r = BufReader::new(Cursor::new(&raw[..]));
        let head = read_request_head(&mut r).await.unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://example.com/index.html");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.headers.get("host"), Some("example.com"));
        assert_eq!(head.headers.get("USER-AGENT"), Some("curl/8.0"));
    }

    #[tokio::test]
    async fn test_parse_request_eof() {
        let mut r = BufReader::new(Cursor::new(&b""[..]));
        assert!(read_request_head(&mut r).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_head_is_unexpected_eof() {
        let raw = b"GET / HTTP/1.1\r\nHost: exam";
        let mut r = BufReader::new(Cursor::new(&raw[..]));
        let err = read_request_head(&mut r).await.unwrap_err();
        let io_err = err.downcast_ref::<io::Error>().unwrap();
        assert_eq!(io_err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_parse_response_head() {
        let raw = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Negotiate\r\nContent-Length: 42\r\n\r\n";
        let mut r = BufReader::new(Cursor::new(&raw[..]));
        let head = read_response_head(&mut r).await.unwrap();
        assert_eq!(head.status, 407);
        assert_eq!(head.reason, "Proxy Authentication Required");
        assert_eq!(head.headers.get("content-length"), Some("42"));
    }

    #[test]
    fn test_rejects_non_http1() {
        assert!(parse_request_head(b"PRI * HTTP/2.0\r\n\r\n").is_err());
    }

    #[test]
    fn test_headers_set_replaces_all() {
        let mut h = Headers::new();
        h.append("Proxy-Authorization", "Basic from-client");
        h.append("proxy-authorization", "Basic again");
        h.set("Proxy-Authorization", "Negotiate abc");
        assert_eq!(h.get_all("Proxy-Authorization").count(), 1);
        assert_eq!(h.get("proxy-authorization"), Some("Negotiate abc"));
    }

    #[test]
    fn test_framing_detection() {
        let head = parse_request_head(b"POST http://a/ HTTP/1.1\r\nContent-Length: 5\r\n\r\n").unwrap();
        assert_eq!(request_body_framing(&head).unwrap(), BodyFraming::Length(5));

        let head =
            parse_request_head(b"POST http://a/ HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
                .unwrap();
        assert_eq!(request_body_framing(&head).unwrap(), BodyFraming::Chunked);

        let head = parse_request_head(b"GET http://a/ HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(request_body_framing(&head).unwrap(), BodyFraming::None);

        let resp = parse_response_head(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        assert_eq!(
            response_body_framing("GET", &resp).unwrap(),
            BodyFraming::Close
        );
        assert_eq!(
            response_body_framing("HEAD", &resp).unwrap(),
            BodyFraming::None
        );
        assert_eq!(
            response_body_framing("CONNECT", &resp).unwrap(),
            BodyFraming::None
        );
    }

    #[tokio::test]
    async fn test_copy_body_length() {
        let mut r = BufReader::new(Cursor::new(&b"hello world"[..]));
        let mut out = Vec::new();
        let n = copy_body(&mut r, &mut out, BodyFraming::Length(5)).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_copy_body_chunked_verbatim() {
        let body = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut r = BufReader::new(Cursor::new(&body[..]));
        let mut out = Vec::new();
        copy_body(&mut r, &mut out, BodyFraming::Chunked).await.unwrap();
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn test_copy_body_chunked_with_extension_and_trailer() {
        let body = b"4;ext=1\r\nwiki\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let mut r = BufReader::new(Cursor::new(&body[..]));
        let mut out = Vec::new();
        copy_body(&mut r, &mut out, BodyFraming::Chunked).await.unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut h = Headers::new();
        h.append("Connection", "keep-alive, X-Custom");
        h.append("X-Custom", "1");
        h.append("Proxy-Connection", "keep-alive");
        h.append("Keep-Alive", "timeout=5");
        h.append("Transfer-Encoding", "chunked");
        h.append("Host", "example.com");
        strip_hop_by_hop(&mut h);
        assert!(!h.contains("Connection"));
        assert!(!h.contains("X-Custom"));
        assert!(!h.contains("Proxy-Connection"));
        assert!(!h.contains("Keep-Alive"));
        assert!(h.contains("Transfer-Encoding"));
        assert!(h.contains("Host"));
    }

    #[test]
    fn test_wants_close() {
        let head = parse_request_head(b"GET http://a/ HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(wants_close(&head.headers, &head.version));

        let head = parse_request_head(b"GET http://a/ HTTP/1.1\r\n\r\n").unwrap();
        assert!(!wants_close(&head.headers, &head.version));

        let head = parse_request_head(b"GET http://a/ HTTP/1.0\r\n\r\n").unwrap();
        assert!(wants_close(&head.headers, &head.version));
    }
}
