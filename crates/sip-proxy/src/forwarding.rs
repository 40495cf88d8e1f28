//! RFC 3261 §16.6 request forwarding.

use sip_core::{NameAddr, Request, Uri, ViaHeader, MAGIC_COOKIE};
use sip_parse::parse_name_addr;
use sip_registrar::to_address;
use sip_transaction::{branch_from_via, top_via, ListeningPoint};
use smol_str::SmolStr;

/// Max-Forwards inserted when the request has none.
pub const DEFAULT_MAX_FORWARDS: u32 = 70;

/// Builds the copy of `request` sent to `target`.
///
/// `local` is the hop the proxy advertises in Record-Route and Via: its host
/// is the interface hostname, not necessarily the bound address.
pub fn prepare_forward(
    request: &Request,
    target: &Uri,
    local: &ListeningPoint,
    branch: &str,
) -> Request {
    let mut forwarded = request.clone();
    forwarded.set_uri(target.clone());

    let max_forwards = forwarded
        .headers()
        .get("Max-Forwards")
        .and_then(|value| value.trim().parse::<u32>().ok())
        .map(|hops| hops.saturating_sub(1))
        .unwrap_or(DEFAULT_MAX_FORWARDS);
    forwarded
        .headers_mut()
        .set("Max-Forwards", max_forwards.to_string());

    forwarded.headers_mut().prepend(
        "Record-Route",
        format!("<sip:{}:{};lr>", local.host, local.port),
    );

    postprocess_routes(&mut forwarded);

    let via = ViaHeader::new(&local.transport, &local.host, local.port, branch);
    forwarded.headers_mut().prepend("Via", via.to_string());

    if !forwarded.headers().contains("Content-Length") {
        let length = forwarded.body().len();
        forwarded
            .headers_mut()
            .push("Content-Length", length.to_string());
    }
    forwarded
}

/// Makes a strict-routing next hop work: the Request-URI moves to the end
/// of the route set and the first Route becomes the Request-URI.
pub fn postprocess_routes(request: &mut Request) {
    let Some(first) = request
        .headers()
        .get("Route")
        .and_then(|route| parse_name_addr(route))
    else {
        return;
    };
    if first.sip_uri().map(|uri| uri.is_loose_route()).unwrap_or(false) {
        return;
    }
    let current = NameAddr::new(request.uri().clone());
    request.headers_mut().push("Route", current.to_string());
    request.set_uri(first.uri().clone());
    request.headers_mut().remove_first("Route");
}

/// Branch for a request forwarded without a client transaction.
///
/// Retransmissions of one request map to the same branch: an RFC 3261
/// branch is hashed on its own, anything else on the Via, tags, Call-ID,
/// CSeq number and Request-URI.
pub fn stateless_branch(request: &Request) -> SmolStr {
    let via = top_via(request).map(SmolStr::as_str).unwrap_or_default();
    let material = match branch_from_via(via) {
        Some(branch) if branch.starts_with(MAGIC_COOKIE) => polynomial_hash(branch).to_string(),
        _ => {
            let to_tag = to_address(request)
                .and_then(|to| to.tag().map(str::to_owned))
                .unwrap_or_default();
            let from_tag = request
                .headers()
                .get("From")
                .and_then(|from| parse_name_addr(from))
                .and_then(|from| from.tag().map(str::to_owned))
                .unwrap_or_default();
            let cseq = request
                .cseq()
                .map(|(seq, _)| seq.to_string())
                .unwrap_or_default();
            format!(
                "{}{}{}{}{}{}",
                via,
                to_tag,
                from_tag,
                request.call_id().unwrap_or_default(),
                cseq,
                request.uri()
            )
        }
    };
    SmolStr::new(format!("{}{:x}", MAGIC_COOKIE, md5::compute(material)))
}

/// Base-31 polynomial hash over UTF-16 code units, wrapping at 32 bits.
fn polynomial_hash(value: &str) -> i32 {
    value
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}
