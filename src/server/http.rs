/*!
HTTP wire helpers: tolerant request-head parsing, streaming body framing and response
writers.

The head parser accepts CRLF and bare LF line endings and caps the head at 64 KiB. The
body is never buffered: `BodyReader` decodes Content-Length and chunked framing on the
fly so bytes reach the child process as they arrive.
*/

use std::fmt;
use std::io::{self, BufRead, Read, Write};

/// Request methods we dispatch on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other(String),
}

impl Method {
    fn parse(s: &str) -> Method {
        match s {
            "GET" => Method::Get,
            "POST" => Method::Post,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, multi-valued header list. Names keep the case the client sent;
/// lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Headers grouped by case-insensitive name, in first-appearance order.
    /// The group takes the spelling of its first occurrence.
    pub fn grouped(&self) -> Vec<(&str, Vec<&str>)> {
        let mut out: Vec<(&str, Vec<&str>)> = Vec::new();
        for (k, v) in &self.0 {
            match out.iter_mut().find(|(name, _)| name.eq_ignore_ascii_case(k)) {
                Some((_, values)) => values.push(v.as_str()),
                None => out.push((k.as_str(), vec![v.as_str()])),
            }
        }
        out
    }

    /// True when a comma-separated header contains `token` (case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

/// Everything the handlers need to know about one request, minus its body.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    /// Request target exactly as sent.
    pub target: String,
    /// Percent-encoded path as sent.
    pub raw_path: String,
    /// Decoded path.
    pub path: String,
    /// Raw query string (without '?').
    pub query: String,
    pub headers: Headers,
    /// Peer socket address (`ip:port`).
    pub remote_addr: String,
    pub tls: bool,
    pub host: String,
    /// Local port the connection was accepted on.
    pub server_port: u16,
}

impl RequestContext {
    pub fn is_chunked(&self) -> bool {
        self.headers.has_token("transfer-encoding", "chunked")
    }

    /// Declared body length. A chunked request declares none.
    pub fn content_length(&self) -> Option<u64> {
        if self.is_chunked() {
            return None;
        }
        self.headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").filter(|v| !v.is_empty())
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers.has_token("upgrade", "websocket")
            && self.headers.has_token("connection", "upgrade")
    }

    pub fn expects_continue(&self) -> bool {
        self.headers
            .get("expect")
            .map(|v| v.trim().eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
    }

    pub fn accepts_html(&self) -> bool {
        self.headers
            .get("accept")
            .map(|v| v.contains("html"))
            .unwrap_or(false)
    }

    /// Raw path plus `?query` when a query is present.
    pub fn request_uri(&self) -> String {
        if self.query.is_empty() {
            self.raw_path.clone()
        } else {
            format!("{}?{}", self.raw_path, self.query)
        }
    }

    /// First decoded value of a query parameter.
    pub fn query_value(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }
}

const HDR_CAP: usize = 64 * 1024;
const LINE_CAP: u64 = 8 * 1024;

/// Parse the request line and headers. The reader is left positioned at the first
/// body byte.
///
/// Errors: `UnexpectedEof` when the peer closes before a request line,
/// `InvalidInput` when the head exceeds 64 KiB, `InvalidData` when malformed.
pub fn read_request_head<R: BufRead>(
    reader: &mut R,
    remote_addr: &str,
    server_port: u16,
) -> io::Result<RequestContext> {
    let mut total = 0usize;
    let mut request_line: Option<String> = None;
    let mut headers = Headers::new();
    loop {
        if total >= HDR_CAP {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "request headers too large",
            ));
        }
        let mut raw = Vec::new();
        let n = reader
            .by_ref()
            .take((HDR_CAP - total) as u64)
            .read_until(b'\n', &mut raw)?;
        if n == 0 {
            if request_line.is_none() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before request",
                ));
            }
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "incomplete request head",
            ));
        }
        total += n;
        if raw.last() != Some(&b'\n') {
            // Cap reached mid-line; the loop head reports it.
            continue;
        }
        let line = String::from_utf8_lossy(trim_eol(&raw)).into_owned();
        match request_line {
            None => {
                // Tolerate stray empty lines before the request line
                if !line.trim().is_empty() {
                    request_line = Some(line);
                }
            }
            Some(_) => {
                if line.is_empty() {
                    break;
                }
                if let Some((k, v)) = line.split_once(':') {
                    headers.push(k.trim(), v.trim());
                }
            }
        }
    }

    let request_line = request_line.unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().map(Method::parse);
    let target = parts.next().map(str::to_string);
    let (method, target) = match (method, target) {
        (Some(m), Some(t)) => (m, t),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed request line",
            ))
        }
    };

    let (authority, raw_path, query) = split_target(&target)?;
    let path = urlencoding::decode(&raw_path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| raw_path.clone());
    let host = authority
        .or_else(|| headers.get("host").map(str::to_string))
        .unwrap_or_default();

    Ok(RequestContext {
        method,
        target,
        raw_path,
        path,
        query,
        headers,
        remote_addr: remote_addr.to_string(),
        tls: false,
        host,
        server_port,
    })
}

/// Split a request target into (authority, raw path, raw query).
/// Absolute-form targets (`http://host/path`) carry their own authority.
fn split_target(target: &str) -> io::Result<(Option<String>, String, String)> {
    let lower = target.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        let url = url::Url::parse(target)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let authority = url.host_str().map(|h| match url.port() {
            Some(p) => format!("{h}:{p}"),
            None => h.to_string(),
        });
        return Ok((
            authority,
            url.path().to_string(),
            url.query().unwrap_or_default().to_string(),
        ));
    }
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };
    Ok((None, path.to_string(), query.to_string()))
}

fn trim_eol(raw: &[u8]) -> &[u8] {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }
    &raw[..end]
}

fn read_line<R: BufRead>(reader: &mut R) -> io::Result<String> {
    let mut raw = Vec::new();
    let n = reader.by_ref().take(LINE_CAP).read_until(b'\n', &mut raw)?;
    if n == 0 || raw.last() != Some(&b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "request body ended early",
        ));
    }
    Ok(String::from_utf8_lossy(trim_eol(&raw)).into_owned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(u64),
    DataEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length(u64),
    Chunked(Chunk),
    Done,
}

/// Streaming request body. Yields `Ok(0)` once the declared body is complete and
/// `UnexpectedEof` if the connection ends before that.
#[derive(Debug)]
pub struct BodyReader<R> {
    inner: R,
    framing: Framing,
}

impl<R: BufRead> BodyReader<R> {
    pub fn for_request(ctx: &RequestContext, inner: R) -> Self {
        let framing = if ctx.is_chunked() {
            Framing::Chunked(Chunk::Size)
        } else {
            match ctx.content_length() {
                Some(n) if n > 0 => Framing::Length(n),
                _ => Framing::Done,
            }
        };
        BodyReader { inner, framing }
    }

    pub fn is_done(&self) -> bool {
        self.framing == Framing::Done
    }

    /// The underlying connection reader, positioned after whatever the body consumed.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: BufRead> Read for BodyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.framing {
                Framing::Done => return Ok(0),
                Framing::Length(0) => self.framing = Framing::Done,
                Framing::Length(remaining) => {
                    let max = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let n = self.inner.read(&mut buf[..max])?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "request body ended early",
                        ));
                    }
                    self.framing = Framing::Length(remaining - n as u64);
                    return Ok(n);
                }
                Framing::Chunked(Chunk::Size) => {
                    let line = read_line(&mut self.inner)?;
                    let size_hex = line.split(';').next().unwrap_or_default().trim();
                    if size_hex.is_empty() {
                        continue;
                    }
                    let size = u64::from_str_radix(size_hex, 16).map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size")
                    })?;
                    if size == 0 {
                        // Trailers until the blank line
                        while !read_line(&mut self.inner)?.is_empty() {}
                        self.framing = Framing::Done;
                    } else {
                        self.framing = Framing::Chunked(Chunk::Data(size));
                    }
                }
                Framing::Chunked(Chunk::Data(remaining)) => {
                    let max = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let n = self.inner.read(&mut buf[..max])?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "request body ended early",
                        ));
                    }
                    let left = remaining - n as u64;
                    self.framing = if left == 0 {
                        Framing::Chunked(Chunk::DataEnd)
                    } else {
                        Framing::Chunked(Chunk::Data(left))
                    };
                    return Ok(n);
                }
                Framing::Chunked(Chunk::DataEnd) => {
                    if !read_line(&mut self.inner)?.is_empty() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "missing CRLF after chunk",
                        ));
                    }
                    self.framing = Framing::Chunked(Chunk::Size);
                }
            }
        }
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Write a status line and headers. Every response closes the connection.
pub fn write_head<W: Write>(w: &mut W, status: u16, headers: &[(&str, String)]) -> io::Result<()> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    for (k, v) in headers {
        head.push_str(&format!("{k}: {v}\r\n"));
    }
    head.push_str("Connection: close\r\n\r\n");
    w.write_all(head.as_bytes())
}

/// Complete response with a Content-Length body.
pub fn respond_bytes<W: Write>(
    w: &mut W,
    status: u16,
    content_type: &str,
    extra: &[(&str, String)],
    body: &[u8],
) -> io::Result<()> {
    let mut headers: Vec<(&str, String)> = vec![
        ("Content-Type", content_type.to_string()),
        ("Content-Length", body.len().to_string()),
    ];
    headers.extend(extra.iter().cloned());
    write_head(w, status, &headers)?;
    w.write_all(body)?;
    w.flush()
}

/// Chunked transfer-encoding writer; every chunk is flushed as soon as it is written.
#[derive(Debug)]
pub struct ChunkedWriter<W: Write> {
    inner: W,
}

impl<W: Write> ChunkedWriter<W> {
    pub fn new(inner: W) -> Self {
        ChunkedWriter { inner }
    }

    pub fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        if !chunk.is_empty() {
            write!(self.inner, "{:X}\r\n", chunk.len())?;
            self.inner.write_all(chunk)?;
            self.inner.write_all(b"\r\n")?;
            self.inner.flush()?;
        }
        Ok(())
    }

    /// Terminating zero-size chunk.
    pub fn finish(&mut self) -> io::Result<()> {
        self.inner.write_all(b"0\r\n\r\n")?;
        self.inner.flush()
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: Write> Write for ChunkedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_chunk(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
