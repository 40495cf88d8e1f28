// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Building responses to received requests (RFC 3261 §8.2.6).

use bytes::Bytes;
use rand::{distributions::Alphanumeric, Rng};
use smol_str::SmolStr;

use crate::{Headers, MessageError, Request, Response, StatusLine};

/// Returns the RFC 3261 default reason phrase for a status code.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        305 => "Use Proxy",
        380 => "Alternative Service",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        410 => "Gone",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Unsupported URI Scheme",
        420 => "Bad Extension",
        421 => "Extension Required",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        482 => "Loop Detected",
        483 => "Too Many Hops",
        484 => "Address Incomplete",
        485 => "Ambiguous",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        491 => "Request Pending",
        493 => "Undecipherable",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        505 => "Version Not Supported",
        513 => "Message Too Large",
        600 => "Busy Everywhere",
        603 => "Decline",
        604 => "Does Not Exist Anywhere",
        606 => "Not Acceptable",
        _ => match code / 100 {
            1 => "Trying",
            2 => "OK",
            3 => "Redirection",
            4 => "Client Error",
            5 => "Server Error",
            _ => "Global Failure",
        },
    }
}

/// Creates a response to `request` with the default reason phrase.
///
/// Via, From, To, Call-ID and CSeq are copied from the request. Responses
/// other than 100 get a To tag when the request did not carry one.
pub fn build_response(request: &Request, code: u16) -> Result<Response, MessageError> {
    let mut headers = Headers::new();
    for via in request.headers().get_all("Via") {
        headers.push("Via", via.clone());
    }
    if let Some(from) = request.headers().get("From") {
        headers.push("From", from.clone());
    }
    if let Some(to) = request.headers().get("To") {
        headers.push("To", to.clone());
    }
    if let Some(call_id) = request.headers().get("Call-ID") {
        headers.push("Call-ID", call_id.clone());
    }
    if let Some(cseq) = request.headers().get("CSeq") {
        headers.push("CSeq", cseq.clone());
    }
    headers.push("Content-Length", "0");

    let mut response = Response::new(
        StatusLine::new(code, reason_phrase(code))?,
        headers,
        Bytes::new(),
    )?;
    if code > 100 {
        ensure_to_tag(&mut response);
    }
    Ok(response)
}

/// Adds a random tag to the To header if it does not have one.
pub fn ensure_to_tag(response: &mut Response) {
    let Some(to) = response.headers().get("To") else {
        return;
    };
    if to.to_ascii_lowercase().contains(";tag=") {
        return;
    }
    let tagged = format!("{};tag={}", to, generate_tag());
    response.headers_mut().set("To", tagged);
}

/// Generates a random 8 character tag.
pub fn generate_tag() -> SmolStr {
    let tag: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    SmolStr::new(tag)
}
