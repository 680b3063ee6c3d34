//! The HTTP/1.1 upgrade handshake: request parsing and response formatting.
//!
//! A client opens a session by sending a `GET` request carrying the upgrade
//! headers of RFC 6455 §4.2.1. The parser here consumes the bytes of that
//! single request (bounded to [`MAX_REQUEST_LENGTH`]), validates the required
//! headers, and produces a [`Request`] the application can inspect in its
//! connect callback. The server proves protocol knowledge by echoing
//! `base64(SHA-1(key ++ GUID))` in the `Sec-WebSocket-Accept` header of the
//! `101 Switching Protocols` response.

use std::collections::HashMap;
use std::time::SystemTime;

use base64::prelude::*;
use sha1::{Digest, Sha1};

use crate::{Result, WsError};

/// Upper bound on the size of the upgrade request, in bytes.
pub const MAX_REQUEST_LENGTH: usize = 2048;

/// The GUID appended to the client key before hashing, fixed by RFC 6455.
const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A query-string parameter value.
///
/// Parameters that appear once decode to `Single`; repeated names collect
/// into `Multi` in order of appearance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    Single(String),
    Multi(Vec<String>),
}

impl QueryValue {
    fn push(&mut self, value: String) {
        match self {
            QueryValue::Single(prev) => {
                *self = QueryValue::Multi(vec![std::mem::take(prev), value]);
            }
            QueryValue::Multi(list) => list.push(value),
        }
    }
}

/// A parsed and validated WebSocket upgrade request.
///
/// Header names are lowercased; duplicate headers keep the last value.
/// Query parameters and cookies are percent-decoded.
#[derive(Debug, Clone)]
pub struct Request {
    path: String,
    query: HashMap<String, QueryValue>,
    headers: HashMap<String, String>,
    cookies: HashMap<String, String>,
}

impl Request {
    /// The request path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// A header value by lowercased name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// All headers, keys lowercased.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// A decoded query parameter by name.
    pub fn query(&self, name: &str) -> Option<&QueryValue> {
        self.query.get(name)
    }

    /// A decoded cookie by name.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// The client's `Sec-WebSocket-Key`, verified present during parsing.
    pub(crate) fn sec_websocket_key(&self) -> &str {
        self.headers
            .get("sec-websocket-key")
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Splits on any of the three line terminators the request grammar accepts
/// (CRLF, LF, lone CR).
struct Lines<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Lines<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.rest.is_empty() {
            return None;
        }
        match self.rest.find(['\r', '\n']) {
            Some(pos) => {
                let line = &self.rest[..pos];
                let skip = if self.rest[pos..].starts_with("\r\n") { 2 } else { 1 };
                self.rest = &self.rest[pos + skip..];
                Some(line)
            }
            None => Some(std::mem::take(&mut self.rest)),
        }
    }
}

/// Parses and validates one upgrade request.
///
/// The input is whatever a single read off the socket produced; anything
/// past the blank line is the peer's framing data and is not touched here
/// (see [`body_offset`]).
///
/// # Errors
///
/// Any malformation or missing required header yields a handshake error;
/// the caller answers with `400 Bad Request` and closes.
pub fn parse_request(buf: &[u8]) -> Result<Request> {
    if buf.len() > MAX_REQUEST_LENGTH {
        return Err(WsError::RequestTooLarge);
    }
    let head = &buf[..body_offset(buf)];
    let text = std::str::from_utf8(head).map_err(|_| WsError::BadRequest)?;

    let mut lines = Lines { rest: text };
    let request_line = lines.next().ok_or(WsError::BadRequest)?;
    let (path, query) = parse_request_line(request_line)?;

    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        // A line without a colon ends the header block.
        let Some((name, value)) = line.split_once(':') else {
            break;
        };
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    let cookies = headers
        .get("cookie")
        .map(|raw| parse_cookies(raw))
        .unwrap_or_default();

    validate_headers(&headers)?;

    Ok(Request {
        path,
        query,
        headers,
        cookies,
    })
}

/// Byte offset of the first position after the header terminator, or the
/// buffer length when no terminator is present.
///
/// Bytes past this offset were pipelined by the peer and belong to the
/// framed stream.
pub(crate) fn body_offset(buf: &[u8]) -> usize {
    if let Some(pos) = find(buf, b"\r\n\r\n") {
        return pos + 4;
    }
    if let Some(pos) = find(buf, b"\n\n") {
        return pos + 2;
    }
    buf.len()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Matches `GET <target> HTTP/<digits>.<digits>` and splits the target into
/// path and decoded query parameters. URI fragments are rejected.
fn parse_request_line(line: &str) -> Result<(String, HashMap<String, QueryValue>)> {
    let mut parts = line.splitn(3, ' ');
    let method = parts.next().ok_or(WsError::BadRequest)?;
    let target = parts.next().ok_or(WsError::BadRequest)?;
    let version = parts.next().ok_or(WsError::BadRequest)?;

    if method != "GET" || target.is_empty() {
        return Err(WsError::BadRequest);
    }

    let digits = version.strip_prefix("HTTP/").ok_or(WsError::BadRequest)?;
    let (major, minor) = digits.split_once('.').ok_or(WsError::BadRequest)?;
    if major.is_empty()
        || minor.is_empty()
        || !major.bytes().all(|b| b.is_ascii_digit())
        || !minor.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(WsError::BadRequest);
    }

    if target.contains('#') {
        return Err(WsError::BadRequest);
    }

    let (path, query_str) = match target.split_once('?') {
        Some((path, qs)) => (path, Some(qs)),
        None => (target, None),
    };

    let mut query: HashMap<String, QueryValue> = HashMap::new();
    if let Some(qs) = query_str {
        for (name, value) in url::form_urlencoded::parse(qs.as_bytes()) {
            match query.get_mut(name.as_ref()) {
                Some(existing) => existing.push(value.into_owned()),
                None => {
                    query.insert(name.into_owned(), QueryValue::Single(value.into_owned()));
                }
            }
        }
    }

    Ok((path.to_string(), query))
}

/// Splits a `Cookie:` header on `;` and percent-decodes each `name=value`
/// pair. Pairs without `=` are skipped.
fn parse_cookies(raw: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for part in raw.split(';') {
        let part = part.trim();
        if !part.contains('=') {
            continue;
        }
        if let Some((name, value)) = url::form_urlencoded::parse(part.as_bytes()).next() {
            cookies.insert(name.into_owned(), value.into_owned());
        }
    }
    cookies
}

/// The required-header check of RFC 6455 §4.2.1.
fn validate_headers(headers: &HashMap<String, String>) -> Result<()> {
    match headers.get("host") {
        Some(host) if !host.is_empty() => {}
        _ => return Err(WsError::MissingHost),
    }

    let upgrade = headers.get("upgrade").ok_or(WsError::InvalidUpgradeHeader)?;
    if !upgrade.to_ascii_lowercase().contains("websocket") {
        return Err(WsError::InvalidUpgradeHeader);
    }

    let connection = headers
        .get("connection")
        .ok_or(WsError::InvalidConnectionHeader)?;
    if !connection.to_ascii_lowercase().contains("upgrade") {
        return Err(WsError::InvalidConnectionHeader);
    }

    let key = headers
        .get("sec-websocket-key")
        .ok_or(WsError::MissingSecWebSocketKey)?;
    match BASE64_STANDARD.decode(key) {
        Ok(nonce) if nonce.len() == 16 => {}
        _ => return Err(WsError::InvalidSecWebSocketKey),
    }

    if headers.get("sec-websocket-version").map(String::as_str) != Some("13") {
        return Err(WsError::InvalidSecWebSocketVersion);
    }

    Ok(())
}

/// Computes the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID);
    let result = sha1.finalize();
    BASE64_STANDARD.encode(&result[..])
}

/// The `101 Switching Protocols` response completing the handshake.
pub(crate) fn switching_protocols(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    )
}

/// A minimal pre-handshake error response (400/401/403/404) carrying an
/// RFC 1123 `Date:` header.
pub fn error_response(code: u16) -> String {
    let date = httpdate::fmt_http_date(SystemTime::now());
    format!("HTTP/1.1 {code} {}\r\nDate: {date}\r\n\r\n", reason(code))
}

/// A minimal pre-handshake redirect response (301/302/307).
pub fn redirect_response(code: u16, location: &str) -> String {
    format!("HTTP/1.1 {code} {}\r\nLocation: {location}\r\n\r\n", reason(code))
}

fn reason(code: u16) -> &'static str {
    match code {
        301 => "Moved Permanently",
        302 => "Found",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Error",
    }
}
