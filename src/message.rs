//! The HTTP/1.0 message object and its wire codec.
//!
//! One structure carries both requests and responses, with the cookie
//! split rules this proxy relies on: a request's `cookie:` header breaks
//! apart on `"; "`, a response keeps one cookie per `set-cookie:` line.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::error::{ProxyError, Result};

/// Whether a [`Message`] travels toward the origin or toward the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Method and URI are meaningful
    Request,
    /// Status and reason are meaningful
    Response,
}

/// Request methods whose responses may be cached.
pub const UNCACHEABLE_METHODS: [&str; 3] = ["POST", "PUT", "DELETE"];

/// Reason phrase for the status codes the proxy emits itself.
fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        302 => "Found",
        400 => "Bad Request",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "ERROR",
    }
}

/// A case-insensitive header bag that keeps insertion order for emission.
///
/// Keys are normalized to lowercase on the way in. `set` replaces every
/// value under the key, `append` adds another one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderBag(Vec<(String, String)>);

impl HeaderBag {
    /// Creates an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// First value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.0.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
    }

    /// Replaces every value under `key` with a single one.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.remove(key);
        self.0.push((key.to_ascii_lowercase(), value.into()));
    }

    /// Adds a value under `key`, keeping existing ones.
    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        self.0.push((key.to_ascii_lowercase(), value.into()));
    }

    /// Drops every value under `key`.
    pub fn remove(&mut self, key: &str) {
        let key = key.to_ascii_lowercase();
        self.0.retain(|(k, _)| *k != key);
    }

    /// Whether any value is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Iterates pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// An HTTP/1.0 request or response.
///
/// One structure serves both directions; [`Message::direction`] says which
/// of (method, uri) or (status, reason) is meaningful. Cookies are kept as
/// an ordered list of raw `name=value[; attrs]` strings, split out of the
/// `cookie:`/`set-cookie:` headers at parse time and re-emitted per
/// direction: requests carry one `cookie:` header joined with `"; "`,
/// responses carry one `set-cookie:` line per cookie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Request or response
    pub direction: Direction,
    /// Request method (requests only)
    pub method: String,
    /// Request URI (requests only)
    pub uri: String,
    /// Protocol tag, e.g. `HTTP/1.0`
    pub protocol: String,
    /// Status code (responses only)
    pub status: u16,
    /// Reason phrase as received; emission falls back to a builtin table
    pub reason: Option<String>,
    /// Header bag, excluding cookie headers
    pub headers: HeaderBag,
    /// Ordered cookie list
    pub cookies: Vec<String>,
    /// Body bytes
    pub body: Vec<u8>,
    /// When the message arrived, for render timing
    #[serde(skip)]
    pub received_on: Option<Instant>,
}

impl Message {
    /// A fresh request.
    pub fn request(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            direction: Direction::Request,
            method: method.into(),
            uri: uri.into(),
            protocol: "HTTP/1.0".to_string(),
            status: 200,
            reason: None,
            headers: HeaderBag::new(),
            cookies: Vec::new(),
            body: Vec::new(),
            received_on: None,
        }
    }

    /// A fresh response.
    pub fn response(status: u16) -> Self {
        Self {
            direction: Direction::Response,
            method: "GET".to_string(),
            uri: String::new(),
            protocol: "HTTP/1.0".to_string(),
            status,
            reason: None,
            headers: HeaderBag::new(),
            cookies: Vec::new(),
            body: Vec::new(),
            received_on: None,
        }
    }

    /// First value of `key`, if present.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Sets `key`, replacing earlier values.
    pub fn set_header(&mut self, key: &str, value: impl Into<String>) {
        self.headers.set(key, value);
    }

    /// Removes every value of `key`.
    pub fn remove_header(&mut self, key: &str) {
        self.headers.remove(key);
    }

    /// Value of the cookie named `key`, if present.
    ///
    /// Attributes after the first `"; "` are ignored; an embedded `=` in
    /// the value survives.
    pub fn cookie(&self, key: &str) -> Option<String> {
        for cookie in &self.cookies {
            let pair = cookie.split("; ").next().unwrap_or(cookie);
            let mut parts = pair.splitn(2, '=');
            let name = parts.next().unwrap_or("");
            if name.eq_ignore_ascii_case(key) {
                return Some(parts.next().unwrap_or("").to_string());
            }
        }
        None
    }

    /// Appends a cookie with the root path.
    pub fn add_cookie(&mut self, key: &str, value: &str) {
        self.cookies.push(format!("{key}={value}; path=/"));
    }

    /// Parses `max-age=N` out of a `"; "`-separated control header.
    pub fn max_age(&self, header: &str) -> Option<u64> {
        let value = self.header(header)?;
        for element in value.split("; ") {
            if let Some((key, val)) = element.split_once('=') {
                if key == "max-age" {
                    return val.parse().ok();
                }
            }
        }
        None
    }

    /// The client address as forwarded by upstream proxies, falling back
    /// to the TCP peer. Takes the last element of a comma-separated list.
    pub fn client_ip(&self, peer: &str) -> String {
        let raw = self
            .header("true-client-ip")
            .or_else(|| self.header("x-forwarded-for"))
            .or_else(|| self.header("x-real-ip"))
            .unwrap_or(peer);
        raw.split(',').next_back().unwrap_or(raw).trim().to_string()
    }

    fn status_line(&self) -> String {
        let reason = self
            .reason
            .as_deref()
            .unwrap_or_else(|| reason_phrase(self.status));
        format!("{} {} {}\r\n", self.protocol, self.status, reason)
    }

    fn command_line(&self) -> String {
        format!("{} {} {}\r\n", self.method, self.uri, self.protocol)
    }

    fn header_block(&self) -> String {
        self.headers
            .iter()
            .map(|(k, v)| format!("{k}: {v}\r\n"))
            .collect::<String>()
    }

    fn cookie_block(&self) -> String {
        if self.cookies.is_empty() {
            return String::new();
        }
        match self.direction {
            Direction::Request => format!("cookie: {}\r\n", self.cookies.join("; ")),
            Direction::Response => self
                .cookies
                .iter()
                .map(|cookie| format!("set-cookie: {cookie}\r\n"))
                .collect(),
        }
    }

    /// Serializes as a response, with an optional body override.
    ///
    /// `content-length` always reflects the emitted body.
    pub fn write_response(&mut self, body: Option<&[u8]>) -> Vec<u8> {
        let body = body.unwrap_or(&self.body).to_vec();
        self.set_header("content-length", body.len().to_string());
        let mut out = Vec::new();
        out.extend_from_slice(self.status_line().as_bytes());
        out.extend_from_slice(self.header_block().as_bytes());
        out.extend_from_slice(self.cookie_block().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&body);
        out
    }

    /// Serializes as a request.
    pub fn write_request(&mut self) -> Vec<u8> {
        self.set_header("content-length", self.body.len().to_string());
        let mut out = Vec::new();
        out.extend_from_slice(self.command_line().as_bytes());
        out.extend_from_slice(self.header_block().as_bytes());
        out.extend_from_slice(self.cookie_block().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

const KNOWN_METHODS: [&str; 5] = ["GET", "PUT", "POST", "DELETE", "HEAD"];

async fn read_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> Result<Option<String>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

/// Reads one HTTP/1.0 message off the wire.
///
/// Line-oriented until the blank line ending the headers, then a fixed
/// `content-length` body when one is declared. Anything that does not
/// parse is a [`ProxyError::BadMessage`].
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> Result<Message> {
    let first = read_line(reader)
        .await?
        .ok_or_else(|| ProxyError::BadMessage("connection closed".to_string()))?;
    let parts: Vec<&str> = first.split_whitespace().collect();
    if parts.is_empty() {
        return Err(ProxyError::BadMessage(first));
    }
    let mut message = if KNOWN_METHODS.contains(&parts[0].to_ascii_uppercase().as_str()) {
        if parts.len() != 3 {
            return Err(ProxyError::BadMessage(first));
        }
        let mut request = Message::request(parts[0].to_ascii_uppercase(), parts[1]);
        request.protocol = parts[2].to_string();
        request
    } else {
        if parts.len() < 2 {
            return Err(ProxyError::BadMessage(first));
        }
        let status: u16 = parts[1]
            .parse()
            .map_err(|_| ProxyError::BadMessage(first.clone()))?;
        let mut response = Message::response(status);
        response.protocol = parts[0].to_string();
        if parts.len() > 2 {
            response.reason = Some(parts[2..].join(" "));
        }
        response
    };
    message.received_on = Some(Instant::now());

    loop {
        let line = read_line(reader)
            .await?
            .ok_or_else(|| ProxyError::BadMessage("truncated headers".to_string()))?;
        if line.is_empty() {
            break;
        }
        let (key, value) = line
            .split_once(": ")
            .ok_or_else(|| ProxyError::BadMessage(line.clone()))?;
        if key.eq_ignore_ascii_case("cookie") {
            message
                .cookies
                .extend(value.split("; ").map(|cookie| cookie.to_string()));
        } else if key.eq_ignore_ascii_case("set-cookie") {
            message.cookies.push(value.to_string());
        } else {
            message.headers.append(key, value);
        }
    }

    if let Some(raw) = message.header("content-length") {
        let length: usize = raw
            .trim()
            .parse()
            .map_err(|_| ProxyError::BadMessage(format!("content-length: {raw}")))?;
        if length > 0 {
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).await?;
            message.body = body;
        }
    }
    Ok(message)
}
