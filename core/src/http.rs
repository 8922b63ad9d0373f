//! HTTP message types for the host-does-IO pattern.
//!
//! # Design
//! These types describe request and response heads as plain data. The core
//! encodes `HttpRequest` heads into bytes and receives `ResponseHead` values
//! from the parser; body bytes travel separately as raw chunks. Header lists
//! keep the order and casing they arrived with, and lookups are
//! case-insensitive.

use std::fmt;

/// HTTP method for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    Connect,
    Trace,
    Extension(String),
}

impl HttpMethod {
    pub fn parse(method: &str) -> Self {
        match method {
            "GET" => HttpMethod::Get,
            "HEAD" => HttpMethod::Head,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "DELETE" => HttpMethod::Delete,
            "OPTIONS" => HttpMethod::Options,
            "PATCH" => HttpMethod::Patch,
            "CONNECT" => HttpMethod::Connect,
            "TRACE" => HttpMethod::Trace,
            other => HttpMethod::Extension(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Extension(m) => m,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive header lookup returning the first match.
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Whether any `Connection` header lists `token`.
pub fn connection_has(headers: &[(String, String)], token: &str) -> bool {
    headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, v)| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// An outgoing request head described as plain data.
///
/// Body bytes are not part of the head; the caller writes them through
/// `Client::write` after the request is queued.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: &str, headers: Vec<(String, String)>) -> Self {
        Self {
            method,
            url: url.to_string(),
            headers,
        }
    }

    /// Whether the request allows the connection to be reused afterwards.
    pub fn keep_alive(&self) -> bool {
        !connection_has(&self.headers, "close")
    }

    /// Serialize the request line and headers. A `Host` header naming
    /// `authority` is added when the caller did not supply one.
    pub fn encode_head(&self, authority: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.url.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");

        if header_value(&self.headers, "host").is_none() {
            out.extend_from_slice(b"Host: ");
            out.extend_from_slice(authority.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// A parsed response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Minor version: `1` for HTTP/1.1, `0` for HTTP/1.0.
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Whether the peer intends to close the connection after this response.
    pub fn wants_close(&self) -> bool {
        if connection_has(&self.headers, "close") {
            return true;
        }
        self.version == 0 && !connection_has(&self.headers, "keep-alive")
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status)
    }

    /// Statuses that never carry a body regardless of framing headers.
    pub fn is_bodyless(&self) -> bool {
        self.is_informational() || self.status == 204 || self.status == 304
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .and_then(|te| te.rsplit(',').next())
            .map(|last| last.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    /// Whether the body, if any, ends only when the peer closes.
    pub fn is_close_delimited(&self) -> bool {
        !self.is_bodyless() && !self.is_chunked() && self.header("content-length").is_none()
    }
}
