//! Header filtering for forwarded exchanges.
//!
//! # Responsibilities
//! - Copy only allow-listed request headers to the origin
//! - Strip connection-management headers from origin responses
//!
//! # Design Decisions
//! - Allow-list, not deny-list: credentials and unknown headers never leave
//! - Multiple `cookie` fields (split by HTTP/2 clients) are folded into one
//!   field for the HTTP/1.1 origin

use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CACHE_CONTROL,
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, TRANSFER_ENCODING,
    UPGRADE_INSECURE_REQUESTS,
};

/// Request headers copied to the outbound request.
pub static FORWARDED_REQUEST_HEADERS: [HeaderName; 8] = [
    ACCEPT,
    ACCEPT_ENCODING,
    ACCEPT_LANGUAGE,
    CACHE_CONTROL,
    CONTENT_LENGTH,
    CONTENT_TYPE,
    COOKIE,
    UPGRADE_INSECURE_REQUESTS,
];

/// Response headers never relayed back to the client.
pub static STRIPPED_RESPONSE_HEADERS: [HeaderName; 2] = [CONNECTION, TRANSFER_ENCODING];

/// Build the outbound header map from the inbound one.
pub fn filter_request_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut outbound = HeaderMap::new();
    for name in FORWARDED_REQUEST_HEADERS.iter() {
        if *name == COOKIE {
            if let Some(cookie) = fold_cookies(inbound) {
                outbound.insert(COOKIE, cookie);
            }
            continue;
        }
        for value in inbound.get_all(name) {
            outbound.append(name.clone(), value.clone());
        }
    }
    outbound
}

fn fold_cookies(inbound: &HeaderMap) -> Option<HeaderValue> {
    let mut values = inbound.get_all(COOKIE).iter();
    let first = values.next()?;
    let rest: Vec<&HeaderValue> = values.collect();
    if rest.is_empty() {
        return Some(first.clone());
    }

    let mut folded = first.as_bytes().to_vec();
    for value in rest {
        folded.extend_from_slice(b"; ");
        folded.extend_from_slice(value.as_bytes());
    }
    HeaderValue::from_bytes(&folded).ok()
}

/// Remove framing and connection headers from an origin response.
pub fn strip_response_headers(headers: &mut HeaderMap) {
    for name in STRIPPED_RESPONSE_HEADERS.iter() {
        headers.remove(name);
    }
}
