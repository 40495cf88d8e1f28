// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{
    headers::Headers,
    method::Method,
    uri::{SipUri, Uri},
};

/// The only protocol version spoken by the stack.
pub const SIP_VERSION: &str = "SIP/2.0";

const MAX_REASON_LENGTH: usize = 256;
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024; // 10MB

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    InvalidStatusCode { code: u16 },
    ReasonTooLong { max: usize, actual: usize },
    InvalidReason(String),
    BodyTooLarge { max: usize, actual: usize },
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidStatusCode { code } => {
                write!(f, "invalid SIP status code: {} (must be 100-699)", code)
            }
            Self::ReasonTooLong { max, actual } => {
                write!(f, "reason phrase too long (max {}, got {})", max, actual)
            }
            Self::InvalidReason(msg) => write!(f, "invalid reason phrase: {}", msg),
            Self::BodyTooLarge { max, actual } => {
                write!(f, "body too large (max {}, got {})", max, actual)
            }
        }
    }
}

impl std::error::Error for MessageError {}

/// First line of a SIP request: `Method SP Request-URI SP SIP-Version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    method: Method,
    uri: Uri,
}

impl RequestLine {
    /// Creates a request line for the given method and target URI.
    pub fn new(method: Method, uri: impl Into<Uri>) -> Self {
        Self {
            method,
            uri: uri.into(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }
}

/// First line of a SIP response.
///
/// The status code is restricted to 100-699 and the reason phrase may not
/// contain control characters, which keeps CRLF out of the status line.
///
/// # Examples
///
/// ```
/// use sip_core::StatusLine;
///
/// let status = StatusLine::new(200, "OK").unwrap();
/// assert_eq!(status.code(), 200);
/// assert!(StatusLine::new(99, "Invalid").is_err());
/// assert!(StatusLine::new(200, "OK\r\nInjected").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    code: u16,
    reason: SmolStr,
}

impl StatusLine {
    /// Creates a status line with the provided code and reason phrase.
    pub fn new(code: u16, reason: impl AsRef<str>) -> Result<Self, MessageError> {
        if !(100..=699).contains(&code) {
            return Err(MessageError::InvalidStatusCode { code });
        }

        let reason = reason.as_ref();
        validate_reason_phrase(reason)?;

        Ok(Self {
            code,
            reason: SmolStr::new(reason),
        })
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// In-memory representation of a SIP request message.
///
/// # Examples
///
/// ```
/// use sip_core::{Request, RequestLine, Method, Uri, Headers};
/// use bytes::Bytes;
///
/// let uri = Uri::parse("sip:bob@example.com").unwrap();
/// let request = Request::new(RequestLine::new(Method::Invite, uri), Headers::new(), Bytes::new()).unwrap();
/// assert_eq!(request.method(), &Method::Invite);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    start: RequestLine,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Builds a request from its components.
    ///
    /// # Errors
    ///
    /// Returns an error if the body exceeds MAX_BODY_SIZE.
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Result<Self, MessageError> {
        validate_body_size(&body)?;

        Ok(Self {
            start,
            headers,
            body,
        })
    }

    pub fn start_line(&self) -> &RequestLine {
        &self.start
    }

    pub fn method(&self) -> &Method {
        self.start.method()
    }

    pub fn uri(&self) -> &Uri {
        self.start.uri()
    }

    /// Returns the Request-URI when it is a SIP or SIPS URI.
    pub fn sip_uri(&self) -> Option<&SipUri> {
        self.start.uri.as_sip()
    }

    /// Returns the Request-URI mutably when it is a SIP or SIPS URI.
    pub fn sip_uri_mut(&mut self) -> Option<&mut SipUri> {
        self.start.uri.as_sip_mut()
    }

    pub fn set_uri(&mut self, uri: impl Into<Uri>) {
        self.start.uri = uri.into();
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the Call-ID header value.
    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID").map(|v| v.as_str())
    }

    /// Returns the CSeq sequence number and method.
    pub fn cseq(&self) -> Option<(u32, Method)> {
        parse_cseq(self.headers.get("CSeq")?)
    }

    /// Consumes self and returns the components.
    pub fn into_parts(self) -> (RequestLine, Headers, Bytes) {
        (self.start, self.headers, self.body)
    }
}

/// In-memory representation of a SIP response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    start: StatusLine,
    headers: Headers,
    body: Bytes,
}

impl Response {
    /// Builds a response from its components.
    ///
    /// # Errors
    ///
    /// Returns an error if the body exceeds MAX_BODY_SIZE.
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Result<Self, MessageError> {
        validate_body_size(&body)?;

        Ok(Self {
            start,
            headers,
            body,
        })
    }

    pub fn start_line(&self) -> &StatusLine {
        &self.start
    }

    pub fn code(&self) -> u16 {
        self.start.code()
    }

    pub fn reason(&self) -> &str {
        self.start.reason()
    }

    /// Replaces the reason phrase, keeping the status code.
    pub fn set_reason(&mut self, reason: impl AsRef<str>) -> Result<(), MessageError> {
        self.start = StatusLine::new(self.start.code, reason)?;
        Ok(())
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the Call-ID header value.
    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID").map(|v| v.as_str())
    }

    /// Returns the CSeq sequence number and method.
    pub fn cseq(&self) -> Option<(u32, Method)> {
        parse_cseq(self.headers.get("CSeq")?)
    }

    /// Returns true for 1xx responses.
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.code())
    }

    /// Returns true for any response of class 2xx or above.
    pub fn is_final(&self) -> bool {
        self.code() >= 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code())
    }

    pub fn is_global_failure(&self) -> bool {
        (600..700).contains(&self.code())
    }

    /// Returns the status class digit (1..=6).
    pub fn class(&self) -> u16 {
        self.code() / 100
    }

    /// Consumes self and returns the components.
    pub fn into_parts(self) -> (StatusLine, Headers, Bytes) {
        (self.start, self.headers, self.body)
    }
}

/// Either a SIP request or response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::Request(req) => req.call_id(),
            Self::Response(res) => res.call_id(),
        }
    }
}

fn parse_cseq(value: &str) -> Option<(u32, Method)> {
    let mut parts = value.split_whitespace();
    let number = parts.next()?.parse().ok()?;
    let method = Method::from_token(parts.next()?);
    Some((number, method))
}

fn validate_reason_phrase(reason: &str) -> Result<(), MessageError> {
    if reason.len() > MAX_REASON_LENGTH {
        return Err(MessageError::ReasonTooLong {
            max: MAX_REASON_LENGTH,
            actual: reason.len(),
        });
    }

    // UTF8-TEXT excludes control characters, CRLF included
    if reason.chars().any(|c| c.is_ascii_control()) {
        return Err(MessageError::InvalidReason(
            "contains control characters".to_string(),
        ));
    }

    Ok(())
}

fn validate_body_size(body: &Bytes) -> Result<(), MessageError> {
    if body.len() > MAX_BODY_SIZE {
        return Err(MessageError::BodyTooLarge {
            max: MAX_BODY_SIZE,
            actual: body.len(),
        });
    }
    Ok(())
}
