//! SIP wire codec and header-value parsers.
//!
//! Messages are parsed into [`sip_core`] types with list-valued headers
//! (Via, Route, Record-Route, Contact) exploded to one value per entry.

use bytes::{Bytes, BytesMut};
use sip_core::{
    Headers, Method, Request, RequestLine, Response, SipMessage, StatusLine, Uri, SIP_VERSION,
};
use smol_str::SmolStr;

mod header_values;

pub use header_values::{
    parse_authorization_header, parse_contact_header, parse_contact_headers,
    parse_delta_seconds, parse_name_addr, parse_option_tags, parse_via_header,
    split_list_headers, split_quoted_commas, AuthorizationHeader, LIST_HEADERS,
};

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Parses either a request or a response from raw network bytes.
pub fn parse_message(datagram: &Bytes) -> Option<SipMessage> {
    if datagram.starts_with(b"SIP/") {
        parse_response(datagram).map(SipMessage::Response)
    } else {
        parse_request(datagram).map(SipMessage::Request)
    }
}

/// Parses a SIP request from raw network bytes.
pub fn parse_request(datagram: &Bytes) -> Option<Request> {
    if datagram.len() > DEFAULT_MAX_MESSAGE_SIZE {
        return None;
    }
    let (head, body_bytes) = split_head_body(datagram)?;
    let mut lines = head.split("\r\n");
    let first = lines.next()?.trim();
    if first.is_empty() {
        return None;
    }

    let (method, uri) = parse_request_line(first)?;
    let headers = split_list_headers(parse_headers(lines)?);
    let body = extract_body(body_bytes, &headers)?;

    Request::new(RequestLine::new(method, uri), headers, body).ok()
}

/// Parses a SIP response from raw network bytes.
pub fn parse_response(datagram: &Bytes) -> Option<Response> {
    if datagram.len() > DEFAULT_MAX_MESSAGE_SIZE {
        return None;
    }
    let (head, body_bytes) = split_head_body(datagram)?;
    let mut lines = head.split("\r\n");
    let first = lines.next()?.trim();
    if first.is_empty() {
        return None;
    }

    let status = parse_status_line(first)?;
    let headers = split_list_headers(parse_headers(lines)?);
    let body = extract_body(body_bytes, &headers)?;

    Response::new(status, headers, body).ok()
}

/// Serializes a SIP request while normalising the `Content-Length` header.
pub fn serialize_request(req: &Request) -> Bytes {
    let start = format!("{} {} {}\r\n", req.method(), req.uri(), SIP_VERSION);
    serialize(start, req.headers(), req.body())
}

/// Serializes a SIP response while normalising the `Content-Length` header.
pub fn serialize_response(res: &Response) -> Bytes {
    let start = format!("{} {} {}\r\n", SIP_VERSION, res.code(), res.reason());
    serialize(start, res.headers(), res.body())
}

fn serialize(start: String, headers: &Headers, body: &Bytes) -> Bytes {
    use std::fmt::Write;

    let mut buf = start;
    for header in headers.iter() {
        if header.name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value.trim());
    }
    let _ = write!(buf, "Content-Length: {}\r\n\r\n", body.len());

    let mut out = BytesMut::with_capacity(buf.len() + body.len());
    out.extend_from_slice(buf.as_bytes());
    out.extend_from_slice(body.as_ref());
    out.freeze()
}

/// Parses the request-line into a method and request URI of any scheme.
fn parse_request_line(line: &str) -> Option<(Method, Uri)> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1, combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(is_token_char),
        space1::<_, nom::error::Error<_>>,
        take_while1::<_, _, nom::error::Error<_>>(|c: char| !c.is_whitespace()),
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (method_token, _, uri_token, _, version_token)) = parser(line).ok()?;

    if !version_token.trim().eq_ignore_ascii_case(SIP_VERSION) {
        return None;
    }
    let uri = Uri::parse(uri_token)?;
    Some((Method::from_token(method_token), uri))
}

/// Parses the status-line of a SIP response.
fn parse_status_line(line: &str) -> Option<StatusLine> {
    use nom::{
        bytes::complete::tag_no_case,
        character::complete::{space0, space1, u16 as nom_u16},
        combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        tag_no_case::<_, _, nom::error::Error<_>>(SIP_VERSION),
        space1::<_, nom::error::Error<_>>,
        nom_u16::<_, nom::error::Error<_>>,
        space0::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (_, _, code, _, reason)) = parser(line).ok()?;

    StatusLine::new(code, reason.trim()).ok()
}

/// Splits raw bytes into header text and body slice using the `\r\n\r\n` separator.
fn split_head_body(datagram: &Bytes) -> Option<(&str, &[u8])> {
    let data = datagram.as_ref();
    let delim = b"\r\n\r\n";

    if let Some(pos) = data.windows(delim.len()).position(|window| window == delim) {
        let head = std::str::from_utf8(&data[..pos]).ok()?;
        Some((head, &data[pos + delim.len()..]))
    } else {
        let head = std::str::from_utf8(data).ok()?;
        Some((head.trim_end_matches("\r\n"), &[]))
    }
}

/// Parses SIP headers, handling folded continuation lines per RFC 3261 §7.3.1.
fn parse_headers<'a, I>(lines: I) -> Option<Headers>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut headers = Headers::new();
    let mut current: Option<(SmolStr, String)> = None;

    for line in lines {
        if line.is_empty() {
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            let (_, value) = current.as_mut()?;
            let folded = line.trim();
            if !folded.is_empty() {
                value.push(' ');
                value.push_str(folded);
            }
            continue;
        }

        let (name, value) = line.split_once(':')?;
        if let Some((prev_name, prev_value)) = current.take() {
            headers.push(prev_name, prev_value.trim());
        }
        current = Some((canonical_header_name(name.trim()), value.trim().to_owned()));
    }

    if let Some((name, value)) = current {
        headers.push(name, value.trim());
    }

    Some(headers)
}

/// Expands compact header forms and normalises the spelling of common headers.
fn canonical_header_name(name: &str) -> SmolStr {
    let lower = name.to_ascii_lowercase();
    let canonical = match lower.as_str() {
        "i" | "call-id" => "Call-ID",
        "f" | "from" => "From",
        "t" | "to" => "To",
        "m" | "contact" => "Contact",
        "l" | "content-length" => "Content-Length",
        "c" | "content-type" => "Content-Type",
        "v" | "via" => "Via",
        "k" | "supported" => "Supported",
        "s" => "Subject",
        "cseq" => "CSeq",
        "route" => "Route",
        "record-route" => "Record-Route",
        "max-forwards" => "Max-Forwards",
        "expires" => "Expires",
        "proxy-require" => "Proxy-Require",
        _ => name,
    };
    SmolStr::new(canonical)
}

/// Returns the body truncated to the declared `Content-Length`, or [`None`] if shorter.
fn extract_body(body_bytes: &[u8], headers: &Headers) -> Option<Bytes> {
    let declared = headers
        .get("Content-Length")
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(body_bytes.len());
    if declared > body_bytes.len() {
        return None;
    }
    Some(Bytes::copy_from_slice(&body_bytes[..declared]))
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '.' | '^' | '_' | '`' | '|' | '~'
        )
}
