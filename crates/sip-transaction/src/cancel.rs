//! CANCEL (RFC 3261 §9.1) and non-2xx ACK (§17.1.1.3) construction.

use bytes::Bytes;
use sip_core::{Headers, MessageError, Method, Request, RequestLine, Response};

/// Builds a CANCEL for a pending request.
///
/// The CANCEL reuses the Request-URI, Call-ID, To, From and CSeq number of
/// `request`, carries only its top Via and keeps its Route set.
pub fn build_cancel(request: &Request) -> Result<Request, MessageError> {
    let mut headers = Headers::new();
    if let Some(via) = request.headers().get("Via") {
        headers.push("Via", via.clone());
    }
    for route in request.headers().get_all("Route") {
        headers.push("Route", route.clone());
    }
    headers.push("Max-Forwards", "70");
    for name in ["From", "To", "Call-ID"] {
        if let Some(value) = request.headers().get(name) {
            headers.push(name, value.clone());
        }
    }
    if let Some((seq, _)) = request.cseq() {
        headers.push("CSeq", format!("{} {}", seq, Method::Cancel));
    }
    headers.push("Content-Length", "0");

    Request::new(
        RequestLine::new(Method::Cancel, request.uri().clone()),
        headers,
        Bytes::new(),
    )
}

/// Builds the ACK a client INVITE transaction sends for a non-2xx final response.
pub fn build_ack(request: &Request, response: &Response) -> Result<Request, MessageError> {
    let mut headers = Headers::new();
    if let Some(via) = request.headers().get("Via") {
        headers.push("Via", via.clone());
    }
    for route in request.headers().get_all("Route") {
        headers.push("Route", route.clone());
    }
    headers.push("Max-Forwards", "70");
    if let Some(from) = request.headers().get("From") {
        headers.push("From", from.clone());
    }
    if let Some(to) = response
        .headers()
        .get("To")
        .or_else(|| request.headers().get("To"))
    {
        headers.push("To", to.clone());
    }
    if let Some(call_id) = request.call_id() {
        headers.push("Call-ID", call_id);
    }
    if let Some((seq, _)) = request.cseq() {
        headers.push("CSeq", format!("{} {}", seq, Method::Ack));
    }
    headers.push("Content-Length", "0");

    Request::new(
        RequestLine::new(Method::Ack, request.uri().clone()),
        headers,
        Bytes::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_core::Uri;

    #[test]
    fn cancel_mirrors_invite() {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP proxy.example.com:5060;branch=z9hG4bKtop");
        headers.push("Via", "SIP/2.0/UDP ua.example.com;branch=z9hG4bKua");
        headers.push("Route", "<sip:next.example.com;lr>");
        headers.push("Max-Forwards", "69");
        headers.push("From", "<sip:alice@example.com>;tag=1");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "call-1");
        headers.push("CSeq", "7 INVITE");
        headers.push("Content-Type", "application/sdp");
        let invite = Request::new(
            RequestLine::new(Method::Invite, Uri::parse("sip:bob@10.0.0.5").unwrap()),
            headers,
            Bytes::from_static(b"v=0"),
        )
        .unwrap();

        let cancel = build_cancel(&invite).unwrap();
        assert_eq!(cancel.method(), &Method::Cancel);
        assert_eq!(cancel.uri(), invite.uri());
        assert_eq!(cancel.headers().count("Via"), 1);
        assert!(cancel.headers().get("Via").unwrap().contains("z9hG4bKtop"));
        assert_eq!(cancel.headers().count("Route"), 1);
        assert_eq!(cancel.cseq(), Some((7, Method::Cancel)));
        assert_eq!(cancel.headers().get("To").unwrap(), "<sip:bob@example.com>");
        assert!(cancel.body().is_empty());
        assert!(!cancel.headers().contains("Content-Type"));
    }

    #[test]
    fn ack_takes_to_tag_from_response() {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP proxy.example.com;branch=z9hG4bKtop");
        headers.push("From", "<sip:alice@example.com>;tag=1");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "call-2");
        headers.push("CSeq", "3 INVITE");
        let invite = Request::new(
            RequestLine::new(Method::Invite, Uri::parse("sip:bob@10.0.0.5").unwrap()),
            headers,
            Bytes::new(),
        )
        .unwrap();
        let mut busy = sip_core::build_response(&invite, 486).unwrap();
        busy.headers_mut().set("To", "<sip:bob@example.com>;tag=xyz");

        let ack = build_ack(&invite, &busy).unwrap();
        assert_eq!(ack.cseq(), Some((3, Method::Ack)));
        assert_eq!(ack.headers().get("To").unwrap(), "<sip:bob@example.com>;tag=xyz");
        assert_eq!(ack.uri(), invite.uri());
    }
}
