//! Minimal HTTP/1.1 request parsing and response formatting.
//!
//! One request per connection, `Connection: close` on every response. No
//! allocation: requests borrow from the receive buffer and responses are
//! formatted into fixed-capacity strings.

use core::fmt::Write as FmtWrite;
use heapless::String as HString;

use crate::error::{ApiError, HttpError};

/// Largest request head (request line plus headers) accepted.
pub const MAX_HEAD: usize = 1024;

/// Largest buffered request body. Larger bodies are only accepted on the
/// streaming firmware-update route.
pub const MAX_BODY: usize = 512;

pub const MAX_RESPONSE_BODY: usize = 768;
pub const MAX_RESPONSE: usize = 1024;

pub const REALM: &str = "multitool";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other,
}

impl Method {
    fn parse(s: &str) -> Self {
        match s {
            "GET" => Method::Get,
            "POST" => Method::Post,
            _ => Method::Other,
        }
    }
}

pub fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// A parsed request head plus whatever body bytes arrived with it.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub method: Method,
    pub path: &'a str,
    headers: &'a str,
    pub body: &'a [u8],
}

impl<'a> Request<'a> {
    /// Parse a buffered request. `Incomplete` means more bytes are needed.
    pub fn parse(data: &'a [u8]) -> Result<Self, HttpError> {
        let Some(head_end) = find_header_end(data) else {
            return Err(if data.len() >= MAX_HEAD {
                HttpError::TooLarge
            } else {
                HttpError::Incomplete
            });
        };
        if head_end > MAX_HEAD {
            return Err(HttpError::TooLarge);
        }
        let head = core::str::from_utf8(&data[..head_end]).map_err(|_| HttpError::Encoding)?;
        let (line, headers) = head.split_once("\r\n").unwrap_or((head, ""));

        let mut parts = line.split_whitespace();
        let method = parts.next().ok_or(HttpError::BadRequestLine)?;
        let target = parts.next().ok_or(HttpError::BadRequestLine)?;
        if !parts.next().is_some_and(|v| v.starts_with("HTTP/1.")) {
            return Err(HttpError::BadRequestLine);
        }
        let path = target.split('?').next().unwrap_or(target);

        Ok(Self {
            method: Method::parse(method),
            path,
            headers,
            body: &data[head_end + 4..],
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.parse().ok()
    }

    /// True once the whole declared body is buffered.
    pub fn is_complete(&self) -> bool {
        self.body.len() >= self.content_length().unwrap_or(0)
    }

    pub fn body_str(&self) -> Result<&'a str, ApiError> {
        let len = self.content_length().unwrap_or(self.body.len()).min(self.body.len());
        core::str::from_utf8(&self.body[..len]).map_err(|_| ApiError::BadRequest("Invalid JSON"))
    }

    pub fn basic_auth(&self) -> Option<BasicAuth> {
        let value = self.header("authorization")?;
        let (scheme, token) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        BasicAuth::decode(token.trim())
    }
}

/// Decoded `user:password` pair from an `Authorization: Basic` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    decoded: HString<160>,
    split: usize,
}

impl BasicAuth {
    fn decode(token: &str) -> Option<Self> {
        let mut raw = [0u8; 160];
        let n = base64_decode(token.as_bytes(), &mut raw)?;
        let text = core::str::from_utf8(&raw[..n]).ok()?;
        let split = text.find(':')?;
        let mut decoded = HString::new();
        decoded.push_str(text).ok()?;
        Some(Self { decoded, split })
    }

    pub fn user(&self) -> &str {
        &self.decoded[..self.split]
    }

    pub fn password(&self) -> &str {
        &self.decoded[self.split + 1..]
    }

    /// Compare against the expected credentials without an early exit on the
    /// first differing byte.
    pub fn matches(&self, user: &str, password: &str) -> bool {
        constant_time_eq(self.user().as_bytes(), user.as_bytes())
            & constant_time_eq(self.password().as_bytes(), password.as_bytes())
    }
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Standard-alphabet base64 with optional padding. `None` on bad input or
/// when `out` is too small.
pub fn base64_decode(input: &[u8], out: &mut [u8]) -> Option<usize> {
    fn sextet(c: u8) -> Option<u32> {
        match c {
            b'A'..=b'Z' => Some((c - b'A') as u32),
            b'a'..=b'z' => Some((c - b'a' + 26) as u32),
            b'0'..=b'9' => Some((c - b'0' + 52) as u32),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }

    let trimmed = match input {
        [rest @ .., b'=', b'='] => rest,
        [rest @ .., b'='] => rest,
        _ => input,
    };
    if trimmed.len() % 4 == 1 {
        return None;
    }

    let mut len = 0;
    for chunk in trimmed.chunks(4) {
        let mut acc = 0u32;
        for (i, &c) in chunk.iter().enumerate() {
            acc |= sextet(c)? << (18 - 6 * i);
        }
        let bytes = acc.to_be_bytes();
        let produced = chunk.len() - 1;
        let dst = out.get_mut(len..len + produced)?;
        dst.copy_from_slice(&bytes[1..1 + produced]);
        len += produced;
    }
    Some(len)
}

pub fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

pub type Body = HString<MAX_RESPONSE_BODY>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: u16,
    content_type: &'static str,
    challenge: bool,
    body: Body,
}

impl Response {
    pub fn json(status: u16, body: Body) -> Self {
        Self {
            status,
            content_type: "application/json",
            challenge: false,
            body,
        }
    }

    pub fn text(status: u16, text: &str) -> Self {
        let mut body = Body::new();
        let _ = body.push_str(text);
        Self {
            status,
            content_type: "text/plain",
            challenge: false,
            body,
        }
    }

    pub fn html(status: u16, page: &str) -> Self {
        Self {
            content_type: "text/html",
            ..Self::text(status, page)
        }
    }

    /// `{"status":"<word>"}`
    pub fn ok(word: &str) -> Self {
        let mut body = Body::new();
        let _ = write!(body, r#"{{"status":"{}"}}"#, word);
        Self::json(200, body)
    }

    pub fn unauthorized() -> Self {
        Self {
            challenge: true,
            ..Self::text(401, "Unauthorized")
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    /// Full wire form including status line and headers.
    pub fn serialize(&self) -> HString<MAX_RESPONSE> {
        let mut r = HString::new();
        let _ = write!(
            r,
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n",
            self.status,
            reason(self.status),
            self.content_type,
            self.body.len(),
        );
        if self.challenge {
            let _ = write!(r, "WWW-Authenticate: Basic realm=\"{}\"\r\n", REALM);
        }
        let _ = write!(r, "\r\n{}", self.body);
        r
    }
}

impl From<ApiError> for Response {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Unauthorized => Response::unauthorized(),
            ApiError::MethodNotAllowed => Response::text(405, "Method Not Allowed"),
            ApiError::NotFound => Response::text(404, "Not Found"),
            other => {
                let mut body = Body::new();
                let _ = write!(body, r#"{{"error":"{}"}}"#, other);
                Response::json(other.status(), body)
            }
        }
    }
}
