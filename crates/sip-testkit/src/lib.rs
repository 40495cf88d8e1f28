// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test harness for the registrar and proxy cores.
//!
//! Provides request/response builders, an in-memory SIP stack that records
//! everything sent through it, and a manually driven timer scheduler.
//!
//! # Example
//! ```
//! use sip_core::Method;
//! use sip_testkit::RequestBuilder;
//!
//! let req = RequestBuilder::new(Method::Options, "sip:bob@example.com").build();
//! assert_eq!(req.method().as_str(), "OPTIONS");
//! assert_eq!(req.cseq(), Some((1, Method::Options)));
//! ```

use bytes::Bytes;
use sip_core::{build_response, Headers, Method, Request, RequestLine, Response, Uri};
use sip_parse::serialize_request;
use smol_str::SmolStr;

mod stack;
mod timer;

pub use stack::{MockClientTransaction, MockProvider, MockServerTransaction};
pub use timer::ManualScheduler;

/// Fluent builder for test requests.
///
/// Starts from a complete minimal request: one Via, From with tag, To set
/// to the Request-URI, Call-ID, `CSeq: 1 <METHOD>` and `Max-Forwards: 70`.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: Method,
    uri: Uri,
    headers: Headers,
    body: Bytes,
}

impl RequestBuilder {
    /// # Panics
    /// Panics if `uri` cannot be parsed.
    pub fn new(method: Method, uri: &str) -> Self {
        let uri = Uri::parse(uri).unwrap_or_else(|| panic!("invalid test URI {}", uri));
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP client.example.com:5060;branch=z9hG4bKtest");
        headers.push("Max-Forwards", "70");
        headers.push("From", "<sip:alice@example.com>;tag=1234");
        headers.push("To", format!("<{}>", uri));
        headers.push("Call-ID", "test-callid@example.com");
        headers.push("CSeq", format!("1 {}", method));
        Self {
            method,
            uri,
            headers,
            body: Bytes::new(),
        }
    }

    /// Replaces every value of `name` with `value`.
    pub fn header(mut self, name: &str, value: impl Into<SmolStr>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Appends another value of `name`.
    pub fn add_header(mut self, name: &str, value: impl Into<SmolStr>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn without(mut self, name: &str) -> Self {
        self.headers.remove(name);
        self
    }

    /// Replaces the Via stack with a single Via carrying `branch`.
    pub fn branch(self, branch: &str) -> Self {
        self.header(
            "Via",
            format!("SIP/2.0/UDP client.example.com:5060;branch={}", branch),
        )
    }

    pub fn call_id(self, call_id: &str) -> Self {
        self.header("Call-ID", call_id)
    }

    pub fn cseq(self, seq: u32) -> Self {
        let method = self.method.clone();
        self.header("CSeq", format!("{} {}", seq, method))
    }

    pub fn body(mut self, body: &'static [u8]) -> Self {
        self.body = Bytes::from_static(body);
        self
    }

    /// # Panics
    /// Panics if the headers do not form a valid request.
    pub fn build(self) -> Request {
        Request::new(RequestLine::new(self.method, self.uri), self.headers, self.body)
            .unwrap_or_else(|e| panic!("invalid test request: {}", e))
    }
}

/// REGISTER for `aor` carrying the given Contact values.
pub fn build_register(aor: &str, contacts: &[&str], call_id: &str, cseq: u32) -> Request {
    let (_, domain) = aor.split_once('@').unwrap_or(("", aor));
    let mut builder = RequestBuilder::new(Method::Register, &format!("sip:{}", domain))
        .header("To", format!("<{}>", aor))
        .header("From", format!("<{}>;tag=reg", aor))
        .call_id(call_id)
        .cseq(cseq);
    for contact in contacts {
        builder = builder.add_header("Contact", *contact);
    }
    builder.build()
}

/// INVITE to `uri` whose top Via carries `branch`.
pub fn build_invite(uri: &str, branch: &str, call_id: &str) -> Request {
    RequestBuilder::new(Method::Invite, uri)
        .branch(branch)
        .call_id(call_id)
        .add_header("Contact", "<sip:alice@client.example.com:5060>")
        .build()
}

/// Response a downstream element would send for `request`.
///
/// # Panics
/// Panics if `request` lacks the headers a response needs.
pub fn response_to(request: &Request, code: u16) -> Response {
    build_response(request, code).unwrap_or_else(|e| panic!("invalid test response: {}", e))
}

/// Serializes a request to bytes for transport-layer testing.
pub fn as_bytes(request: &Request) -> Bytes {
    serialize_request(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_parse::parse_request;

    #[test]
    fn register_builder_sets_dialog_headers() {
        let request = build_register(
            "sip:alice@openjsip.net",
            &["<sip:alice@10.0.0.7>", "<sip:alice@10.0.0.8>;expires=60"],
            "reg-1",
            7,
        );
        assert_eq!(request.uri().to_string(), "sip:openjsip.net");
        assert_eq!(request.headers().count("Contact"), 2);
        assert_eq!(request.cseq(), Some((7, Method::Register)));
        assert_eq!(request.call_id(), Some("reg-1"));
    }

    #[test]
    fn builder_output_survives_the_wire() {
        let request = build_invite("sip:bob@example.com", "z9hG4bKinv1", "call-1");
        let parsed = parse_request(&as_bytes(&request)).unwrap();
        assert_eq!(parsed.method(), &Method::Invite);
        assert_eq!(parsed.headers().get("Via"), request.headers().get("Via"));
        assert_eq!(parsed.call_id(), Some("call-1"));
    }
}
