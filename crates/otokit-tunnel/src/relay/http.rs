//! Minimal HTTP/1.x head handling for inspected flows.
//!
//! Only the head is parsed; bodies are relayed untouched.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

const METHODS: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ", b"PATCH ", b"CONNECT ",
];

/// Whether the first bytes of a stream look like an HTTP request line.
/// A TLS ClientHello (0x16) never does.
pub fn looks_like_http(prefix: &[u8]) -> bool {
    METHODS.iter().any(|m| {
        let n = m.len().min(prefix.len());
        n > 0 && prefix[..n] == m[..n]
    })
}

/// Offset just past the `\r\n\r\n` that ends a head.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Outcome of reading a head from a stream.
#[derive(Debug)]
pub enum HeadRead {
    /// `buf[..head_len]` is the head; anything after belongs to the body.
    Complete { buf: Vec<u8>, head_len: usize },
    /// The stream stopped being HTTP-shaped, ended early, went quiet or
    /// exceeded the limit. The bytes read so far must still be relayed.
    Partial(Vec<u8>),
}

/// Read until the end of a head, giving up at `max_bytes`, when a read
/// stalls past `wait`, or as soon as the first bytes rule out a plaintext
/// HTTP request (when `request` is set).
pub async fn read_head<S>(
    stream: &mut S,
    max_bytes: usize,
    request: bool,
    wait: Duration,
) -> io::Result<HeadRead>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];

    loop {
        if let Some(head_len) = find_head_end(&buf) {
            return Ok(HeadRead::Complete { buf, head_len });
        }
        if buf.len() >= max_bytes || (request && !buf.is_empty() && !looks_like_http(&buf)) {
            return Ok(HeadRead::Partial(buf));
        }
        let n = match tokio::time::timeout(wait, stream.read(&mut chunk)).await {
            Ok(read) => read?,
            Err(_) => return Ok(HeadRead::Partial(buf)),
        };
        if n == 0 {
            return Ok(HeadRead::Partial(buf));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> io::Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed header line"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn head_text(raw: &[u8]) -> io::Result<&str> {
    std::str::from_utf8(raw)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "head was not valid UTF-8"))
}

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target: path plus query.
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn parse(raw: &[u8]) -> io::Result<Self> {
        let text = head_text(raw)?;
        let mut lines = text.split("\r\n");
        let request_line = lines
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request line is missing"))?;
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed request line",
            ));
        };

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers: parse_headers(lines)?,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    /// The path component of the target (origin-form or absolute-form).
    pub fn path(&self) -> &str {
        let target = self.path_and_query();
        target.split('?').next().unwrap_or(target)
    }

    /// Path plus query, without any scheme or authority.
    pub fn path_and_query(&self) -> &str {
        let target = self.target.as_str();
        match target.find("://") {
            Some(scheme_end) => {
                let rest = &target[scheme_end + 3..];
                rest.find('/').map_or("/", |p| &rest[p..])
            }
            None => target,
        }
    }

    /// Name/value pairs from every `Cookie` header.
    pub fn cookies(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("cookie"))
            .flat_map(|(_, v)| parse_cookie_header(v))
            .collect()
    }

    /// Replace every header of this name with a single value.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Serialize back to wire form, including the terminating blank line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// A parsed response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn parse(raw: &[u8]) -> io::Result<Self> {
        let text = head_text(raw)?;
        let mut lines = text.split("\r\n");
        let status_line = lines
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "status line is missing"))?;
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid status code"))?;

        Ok(Self {
            status,
            headers: parse_headers(lines)?,
        })
    }

    /// Name/value pairs from every `Set-Cookie` header; attributes dropped.
    pub fn set_cookies(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("set-cookie"))
            .filter_map(|(_, v)| parse_set_cookie(v))
            .collect()
    }
}

/// Split a `Cookie` header value into pairs.
pub fn parse_cookie_header(value: &str) -> Vec<(String, String)> {
    value
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// The leading name/value pair of a `Set-Cookie` header value.
pub fn parse_set_cookie(value: &str) -> Option<(String, String)> {
    let first = value.split(';').next()?;
    let (name, value) = first.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

/// A complete `302 Found` response pointing at `location`.
pub fn redirect_response(location: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        location
    )
    .into_bytes()
}
