//! Header names the proxy owns and hop-by-hop handling.

use http::HeaderMap;
use http::header::{CONNECTION, CONTENT_LENGTH, HeaderName, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE};

/// Request header that turns filtering off for the exchange; removed before forwarding.
pub const X_INTERCEPT_BYPASS: HeaderName = HeaderName::from_static("x-intercept-bypass");

/// Content-Length of a body before an editing filter or content decoding changed it.
pub const X_ORIGINAL_CONTENT_LENGTH: HeaderName = HeaderName::from_static("x-original-content-length");

/// Names of the filters that attached to a message.
pub const X_INTERCEPT_FILTERS: HeaderName = HeaderName::from_static("x-intercept-filters");

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Removes the headers that only describe one hop.
///
/// Framing headers (Content-Length, Transfer-Encoding) stay, they are rewritten when the
/// message is encoded again.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .filter(|name| *name != CONTENT_LENGTH && *name != TRANSFER_ENCODING)
        .collect();
    for name in named {
        headers.remove(name);
    }

    for name in [CONNECTION, KEEP_ALIVE, PROXY_CONNECTION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER, UPGRADE] {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HOST;

    #[test]
    fn strips_listed_and_standard_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "example.com".parse().unwrap());
        headers.insert(CONNECTION, "keep-alive, X-Hop, Content-Length".parse().unwrap());
        headers.insert("x-hop", "1".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert(PROXY_AUTHORIZATION, "Basic Zm9v".parse().unwrap());
        headers.insert(CONTENT_LENGTH, "3".parse().unwrap());
        headers.insert(TRANSFER_ENCODING, "chunked".parse().unwrap());

        strip_hop_by_hop(&mut headers);

        assert!(headers.contains_key(HOST));
        assert!(headers.contains_key(CONTENT_LENGTH));
        assert!(headers.contains_key(TRANSFER_ENCODING));
        assert!(!headers.contains_key(CONNECTION));
        assert!(!headers.contains_key("x-hop"));
        assert!(!headers.contains_key("keep-alive"));
        assert!(!headers.contains_key(PROXY_AUTHORIZATION));
    }
}
