//! RFC 3261 §16.7 step 6: choosing the response sent upstream.

use sip_core::{build_response, MessageError, Request, Response};

/// 4xx codes carrying information the client can act on, most useful first.
const PREFERRED_4XX: [u16; 5] = [401, 407, 415, 420, 484];

/// Final responses collected from the branches of one forked request.
#[derive(Debug, Default, Clone)]
pub struct ResponseContext {
    finals: Vec<Response>,
}

impl ResponseContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, response: Response) {
        self.finals.push(response);
    }

    pub fn len(&self) -> usize {
        self.finals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.finals.is_empty()
    }

    pub fn finals(&self) -> &[Response] {
        &self.finals
    }

    /// Picks the best response to `request` from the collected finals.
    pub fn best_response(&self, request: &Request) -> Result<Response, MessageError> {
        select_response(request, &self.finals)
    }
}

/// Selects the response forwarded upstream once every branch is done.
///
/// No finals yields a synthesized 408. A 6xx beats every other class,
/// otherwise the lowest class wins and the first response of that class is
/// taken, except that 4xx prefers [`PREFERRED_4XX`] and a 5xx class made
/// only of 503 becomes a synthesized 500. A selected 401 or 407 carries the
/// challenges of every other response with the same code.
pub fn select_response(request: &Request, finals: &[Response]) -> Result<Response, MessageError> {
    if finals.is_empty() {
        return build_response(request, 408);
    }

    let first_of_class = |class: u16| finals.iter().find(|r| r.class() == class);

    if let Some(global) = first_of_class(6) {
        return Ok(global.clone());
    }
    if let Some(success) = first_of_class(2) {
        return Ok(success.clone());
    }
    if let Some(redirect) = first_of_class(3) {
        return Ok(redirect.clone());
    }

    if let Some(first_4xx) = first_of_class(4) {
        let chosen = PREFERRED_4XX
            .iter()
            .find_map(|code| finals.iter().find(|r| r.code() == *code))
            .unwrap_or(first_4xx);
        let mut chosen = chosen.clone();
        let challenge = match chosen.code() {
            401 => Some("WWW-Authenticate"),
            407 => Some("Proxy-Authenticate"),
            _ => None,
        };
        if let Some(name) = challenge {
            merge_challenges(&mut chosen, finals, name);
        }
        return Ok(chosen);
    }

    let server_errors: Vec<&Response> = finals.iter().filter(|r| r.class() == 5).collect();
    if server_errors.is_empty() {
        // finals below 200 are never collected
        return build_response(request, 408);
    }
    // 503 is never forwarded (RFC 3261 §16.7 step 6)
    match server_errors.iter().find(|r| r.code() != 503) {
        Some(chosen) => Ok((*chosen).clone()),
        None => build_response(request, 500),
    }
}

/// Copies the `name` challenges of the other finals with the chosen code.
fn merge_challenges(chosen: &mut Response, finals: &[Response], name: &str) {
    let code = chosen.code();
    let mut seen_self = false;
    for other in finals.iter().filter(|r| r.code() == code) {
        // the chosen response is the first one with its code
        if !seen_self {
            seen_self = true;
            continue;
        }
        for value in other.headers().get_all(name) {
            chosen.headers_mut().push(name.to_owned(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_core::Method;
    use sip_testkit::{response_to, RequestBuilder};

    fn invite() -> Request {
        RequestBuilder::new(Method::Invite, "sip:bob@openjsip.net").build()
    }

    fn finals(request: &Request, codes: &[u16]) -> Vec<Response> {
        codes.iter().map(|code| response_to(request, *code)).collect()
    }

    fn selected(codes: &[u16]) -> u16 {
        let request = invite();
        select_response(&request, &finals(&request, codes))
            .unwrap()
            .code()
    }

    #[test]
    fn no_finals_times_out() {
        assert_eq!(selected(&[]), 408);
    }

    #[test]
    fn global_failure_beats_success() {
        assert_eq!(selected(&[200, 603, 486]), 603);
    }

    #[test]
    fn lowest_class_wins() {
        assert_eq!(selected(&[500, 486, 302]), 302);
        assert_eq!(selected(&[503, 404]), 404);
        assert_eq!(selected(&[486, 200]), 200);
    }

    #[test]
    fn first_4xx_without_preferred_code() {
        assert_eq!(selected(&[486, 404, 408]), 486);
    }

    #[test]
    fn preferred_4xx_codes_in_order() {
        assert_eq!(selected(&[486, 484, 415]), 415);
        assert_eq!(selected(&[404, 407, 401]), 401);
    }

    #[test]
    fn all_503_becomes_500() {
        assert_eq!(selected(&[503, 503]), 500);
        assert_eq!(selected(&[503, 502, 503]), 502);
        assert_eq!(selected(&[500, 503]), 500);
        assert_eq!(selected(&[504, 502]), 504);
    }

    #[test]
    fn unauthorized_merges_challenges() {
        let request = invite();
        let mut responses = finals(&request, &[401, 486, 401]);
        responses[0]
            .headers_mut()
            .push("WWW-Authenticate", "Digest realm=\"a.net\"");
        responses[2]
            .headers_mut()
            .push("WWW-Authenticate", "Digest realm=\"b.net\"");

        let chosen = select_response(&request, &responses).unwrap();
        assert_eq!(chosen.code(), 401);
        let realms: Vec<&str> = chosen
            .headers()
            .get_all("WWW-Authenticate")
            .map(|v| v.as_str())
            .collect();
        assert_eq!(realms, vec!["Digest realm=\"a.net\"", "Digest realm=\"b.net\""]);
    }

    #[test]
    fn context_accumulates() {
        let request = invite();
        let mut context = ResponseContext::new();
        assert_eq!(context.best_response(&request).unwrap().code(), 408);
        context.add(response_to(&request, 480));
        context.add(response_to(&request, 486));
        assert_eq!(context.len(), 2);
        assert_eq!(context.best_response(&request).unwrap().code(), 480);
    }
}
