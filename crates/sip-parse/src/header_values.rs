use std::collections::BTreeMap;

use sip_core::{ContactHeader, Headers, NameAddr, Uri, ViaHeader};
use smol_str::SmolStr;

/// Headers whose comma separated values are stored one per entry.
pub const LIST_HEADERS: [&str; 4] = ["Via", "Route", "Record-Route", "Contact"];

/// Parsed credentials or challenge (`Authorization`, `Proxy-Authorization`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationHeader {
    pub scheme: SmolStr,
    pub params: BTreeMap<SmolStr, SmolStr>,
}

impl AuthorizationHeader {
    /// Looks up an auth-param by case-insensitive name.
    pub fn param(&self, name: &str) -> Option<&SmolStr> {
        self.params.get(&SmolStr::new(name.to_ascii_lowercase()))
    }
}

pub fn parse_via_header(value: &str) -> Option<ViaHeader> {
    use nom::{
        bytes::complete::{tag_no_case, take_till1, take_while1},
        character::complete::{space0, space1},
        combinator::rest,
        sequence::tuple,
    };

    let input = value.trim();
    let transport_token =
        take_while1::<_, _, nom::error::Error<_>>(|c: char| c.is_ascii_alphanumeric() || c == '-');
    let mut parser = tuple((
        tag_no_case::<_, _, nom::error::Error<_>>("SIP"),
        space0::<_, nom::error::Error<_>>,
        tag_no_case::<_, _, nom::error::Error<_>>("/"),
        space0::<_, nom::error::Error<_>>,
        tag_no_case::<_, _, nom::error::Error<_>>("2.0"),
        space0::<_, nom::error::Error<_>>,
        tag_no_case::<_, _, nom::error::Error<_>>("/"),
        space0::<_, nom::error::Error<_>>,
        transport_token,
        space1::<_, nom::error::Error<_>>,
        take_till1::<_, _, nom::error::Error<_>>(|c: char| c == ';'),
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (_, _, _, _, _, _, _, _, transport, _, sent_by, params_part)) =
        parser(input).ok()?;

    let (host, port) = split_sent_by(sent_by.trim())?;
    Some(ViaHeader {
        transport: SmolStr::new(transport.to_ascii_uppercase()),
        host: SmolStr::new(host),
        port,
        params: parse_params(params_part),
    })
}

/// Parses a Contact header value, including the `*` wildcard.
pub fn parse_contact_header(value: &str) -> Option<ContactHeader> {
    if value.trim() == "*" {
        return Some(ContactHeader::Wildcard);
    }
    parse_name_addr(value).map(ContactHeader::Address)
}

/// Parses every Contact value of a message, skipping malformed ones.
pub fn parse_contact_headers(headers: &Headers) -> Vec<ContactHeader> {
    headers
        .get_all("Contact")
        .flat_map(|value| split_quoted_commas(value))
        .filter_map(|part| parse_contact_header(&part))
        .collect()
}

/// Parses From, To, Route and Record-Route style values.
pub fn parse_name_addr(value: &str) -> Option<NameAddr> {
    let input = value.trim();
    if input.is_empty() {
        return None;
    }
    if let Some(start) = input.find('<') {
        let end_rel = input[start + 1..].find('>')?;
        let end = start + 1 + end_rel;
        let display = input[..start].trim();
        let uri = Uri::parse(input[start + 1..end].trim())?;
        let params = parse_params(input[end + 1..].trim());
        Some(NameAddr {
            display_name: if display.is_empty() {
                None
            } else {
                Some(SmolStr::new(display.trim_matches('"')))
            },
            uri,
            params,
        })
    } else {
        // addr-spec form: parameters after the URI belong to the header
        let (uri_part, param_part) = input.split_once(';').unwrap_or((input, ""));
        let uri = Uri::parse(uri_part.trim())?;
        Some(NameAddr {
            display_name: None,
            uri,
            params: parse_params(param_part),
        })
    }
}

pub fn parse_authorization_header(value: &str) -> Option<AuthorizationHeader> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (scheme, remainder) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
    let mut params = BTreeMap::new();
    for part in split_quoted_commas(remainder) {
        if let Some((name, val)) = part.split_once('=') {
            let cleaned = val.trim().trim_matches('"');
            params.insert(
                SmolStr::new(name.trim().to_ascii_lowercase()),
                SmolStr::new(cleaned),
            );
        }
    }
    Some(AuthorizationHeader {
        scheme: SmolStr::new(scheme.trim()),
        params,
    })
}

/// Collects every option tag listed in the named headers (e.g. `Proxy-Require`).
pub fn parse_option_tags(headers: &Headers, name: &str) -> Vec<SmolStr> {
    headers
        .get_all(name)
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(SmolStr::new)
        .collect()
}

/// Parses a delta-seconds header such as `Expires`.
pub fn parse_delta_seconds(value: &str) -> Option<u32> {
    value.trim().parse().ok()
}

/// Splits list-valued headers so that every value has its own entry.
pub fn split_list_headers(headers: Headers) -> Headers {
    let mut out = Headers::new();
    for header in headers {
        if LIST_HEADERS
            .iter()
            .any(|name| header.name.eq_ignore_ascii_case(name))
        {
            for part in split_quoted_commas(&header.value) {
                out.push(header.name.clone(), part);
            }
        } else {
            out.push(header.name, header.value);
        }
    }
    out
}

pub(crate) fn parse_params(input: &str) -> BTreeMap<SmolStr, Option<SmolStr>> {
    let mut params = BTreeMap::new();
    for raw in input.split(';') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        if let Some((name, value)) = raw.split_once('=') {
            params.insert(
                SmolStr::new(name.trim().to_ascii_lowercase()),
                Some(SmolStr::new(value.trim().trim_matches('"'))),
            );
        } else {
            params.insert(SmolStr::new(raw.to_ascii_lowercase()), None);
        }
    }
    params
}

fn split_sent_by(input: &str) -> Option<(&str, Option<u16>)> {
    if let Some(stripped) = input.strip_prefix('[') {
        let end = stripped.find(']')?;
        let port = match stripped[end + 1..].trim().strip_prefix(':') {
            Some(port) => Some(port.trim().parse().ok()?),
            None => None,
        };
        return Some((&stripped[..end], port));
    }
    match input.split_once(':') {
        Some((host, port)) => Some((host.trim(), Some(port.trim().parse().ok()?))),
        None => Some((input, None)),
    }
}

/// Splits a header value on commas that are outside quotes and angle brackets.
pub fn split_quoted_commas(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_brackets = false;
    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '<' if !in_quotes => {
                in_brackets = true;
                current.push(ch);
            }
            '>' if !in_quotes => {
                in_brackets = false;
                current.push(ch);
            }
            ',' if !in_quotes && !in_brackets => {
                if !current.trim().is_empty() {
                    parts.push(current.trim().to_owned());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_owned());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_via_with_port_and_params() {
        let via =
            parse_via_header("SIP/2.0/udp 10.0.0.1:5070;branch=z9hG4bK74bf9;received=1.2.3.4")
                .unwrap();
        assert_eq!(via.transport(), "UDP");
        assert_eq!(via.host, "10.0.0.1");
        assert_eq!(via.port, Some(5070));
        assert_eq!(via.branch(), Some("z9hG4bK74bf9"));
        assert!(via.param("received").is_some());
    }

    #[test]
    fn parses_via_without_port_or_params() {
        let via = parse_via_header("SIP / 2.0 / TCP pc33.example.com").unwrap();
        assert_eq!(via.transport(), "TCP");
        assert_eq!(via.host, "pc33.example.com");
        assert_eq!(via.port, None);
        assert!(via.branch().is_none());
    }

    #[test]
    fn parses_ipv6_sent_by() {
        let via = parse_via_header("SIP/2.0/UDP [2001:db8::9]:5080;branch=z9hG4bKx").unwrap();
        assert_eq!(via.host, "2001:db8::9");
        assert_eq!(via.port, Some(5080));
    }

    #[test]
    fn contact_forms() {
        assert!(parse_contact_header(" * ").unwrap().is_wildcard());
        let contact = parse_contact_header("\"Alice\" <sip:alice@10.0.0.1;transport=tcp>;expires=60")
            .unwrap();
        assert_eq!(contact.expires(), Some(60));
        assert_eq!(contact.sip_uri().unwrap().transport(), Some("tcp"));
        let bare = parse_contact_header("sip:bob@10.0.0.2;expires=0").unwrap();
        assert_eq!(bare.expires(), Some(0));
        assert!(bare.sip_uri().unwrap().params.is_empty());
    }

    #[test]
    fn splits_contact_list() {
        let mut headers = Headers::new();
        headers.push(
            "Contact",
            "<sip:a@10.0.0.1>;expires=10, \"Doe, John\" <sip:b@10.0.0.2>",
        );
        let contacts = parse_contact_headers(&headers);
        assert_eq!(contacts.len(), 2);
        assert_eq!(
            contacts[1].inner().unwrap().display_name.as_deref(),
            Some("Doe, John")
        );
    }

    #[test]
    fn splits_list_headers_into_entries() {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP a.example.com;branch=z9hG4bK1, SIP/2.0/UDP b.example.com;branch=z9hG4bK2");
        headers.push("Subject", "hello, world");
        let split = split_list_headers(headers);
        assert_eq!(split.count("Via"), 2);
        assert_eq!(split.get("Subject").unwrap(), "hello, world");
    }

    #[test]
    fn parses_digest_credentials() {
        let auth = parse_authorization_header(
            "Digest username=\"alice\", realm=\"openjsip.net\", nonce=\"abc\", uri=\"sip:bob@openjsip.net\", response=\"0123\"",
        )
        .unwrap();
        assert_eq!(auth.scheme, "Digest");
        assert_eq!(auth.param("USERNAME").unwrap(), "alice");
        assert_eq!(auth.param("uri").unwrap(), "sip:bob@openjsip.net");
    }

    #[test]
    fn collects_option_tags() {
        let mut headers = Headers::new();
        headers.push("Proxy-Require", "foo, bar");
        headers.push("Proxy-Require", "baz");
        let tags = parse_option_tags(&headers, "proxy-require");
        assert_eq!(tags, vec!["foo", "bar", "baz"]);
    }
}
