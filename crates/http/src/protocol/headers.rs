//! Helpers for the headers that govern framing and connection reuse.

use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, StatusCode, Version};

use crate::protocol::{ParseError, PayloadSize, status_forbids_body};

/// Checks if the Transfer-Encoding header indicates chunked encoding.
///
/// According to RFC 7230, chunked must be the last encoding if present.
pub fn is_chunked(header_value: Option<&HeaderValue>) -> bool {
    const CHUNKED: &[u8] = b"chunked";
    if let Some(value) = header_value {
        if let Some(bytes) = value.as_bytes().rsplit(|b| *b == b',').next() {
            return bytes.trim_ascii().eq_ignore_ascii_case(CHUNKED);
        }
    }
    false
}

/// Parses the Content-Length header, `Ok(None)` when absent.
///
/// Repeated values are accepted only when they all agree.
pub fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ParseError> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let cl_str = value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;
        for part in cl_str.split(',') {
            let parsed = part
                .trim()
                .parse::<u64>()
                .map_err(|_| ParseError::invalid_content_length(format!("value {cl_str} is not u64")))?;
            match length {
                Some(previous) if previous != parsed => {
                    return Err(ParseError::invalid_content_length(format!("conflicting values {previous} and {parsed}")));
                }
                _ => length = Some(parsed),
            }
        }
    }
    Ok(length)
}

/// Returns true if any comma separated element of the header equals `token`, ignoring case.
pub fn contains_token(headers: &HeaderMap, name: http::header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|element| element.trim().eq_ignore_ascii_case(token))
}

/// Returns true if the message asks for the connection to be closed after this exchange.
///
/// HTTP/1.0 messages close unless they explicitly ask for `keep-alive`.
pub fn has_close_directive(headers: &HeaderMap, version: Version) -> bool {
    if contains_token(headers, CONNECTION, "close") {
        return true;
    }
    version == Version::HTTP_10 && !contains_token(headers, CONNECTION, "keep-alive")
}

/// Sets `Transfer-Encoding: chunked` and drops any Content-Length.
pub fn force_chunked(headers: &mut HeaderMap) {
    headers.remove(CONTENT_LENGTH);
    if !is_chunked(headers.get(TRANSFER_ENCODING)) {
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    }
}

/// Determines how a request body is framed, according to RFC 7230 section 3.3.3.
///
/// - Transfer-Encoding ending in chunked: chunked
/// - Content-Length: exactly that many bytes
/// - neither: no body
///
/// A request carrying both headers, or a Transfer-Encoding that is not chunked, is rejected.
pub fn request_payload_size(headers: &HeaderMap) -> Result<PayloadSize, ParseError> {
    // refer: https://www.rfc-editor.org/rfc/rfc9112.html#name-transfer-encoding
    let te_header = headers.get(TRANSFER_ENCODING);
    let has_cl = headers.contains_key(CONTENT_LENGTH);

    match (te_header, has_cl) {
        (None, false) => Ok(PayloadSize::new_empty()),
        (Some(_), false) => {
            if is_chunked(te_header) {
                Ok(PayloadSize::new_chunked())
            } else {
                Err(ParseError::invalid_header("request transfer-encoding must end with chunked"))
            }
        }
        (None, true) => Ok(content_length(headers)?.map_or(PayloadSize::Empty, PayloadSize::new_length)),
        (Some(_), true) => Err(ParseError::invalid_content_length("transfer_encoding and content_length both present in headers")),
    }
}

/// Determines how a response body is framed, according to RFC 7230 section 3.3.3.
pub fn response_payload_size(status: StatusCode, head_request: bool, headers: &HeaderMap) -> Result<PayloadSize, ParseError> {
    if head_request || status_forbids_body(status) {
        return Ok(PayloadSize::new_empty());
    }

    if let Some(te_value) = headers.get(TRANSFER_ENCODING) {
        return if is_chunked(Some(te_value)) { Ok(PayloadSize::new_chunked()) } else { Ok(PayloadSize::UntilEof) };
    }

    match content_length(headers)? {
        Some(length) => Ok(PayloadSize::new_length(length)),
        None => Ok(PayloadSize::UntilEof),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_is_chunked() {
        {
            let headers = HeaderMap::new();
            assert!(!is_chunked(headers.get(TRANSFER_ENCODING)));
        }

        {
            let mut headers = HeaderMap::new();
            headers.insert("Transfer-Encoding", "gzip, chunked".parse().unwrap());
            assert!(is_chunked(headers.get(TRANSFER_ENCODING)));
        }

        {
            let mut headers = HeaderMap::new();
            headers.insert("Transfer-Encoding", "chunked, gzip".parse().unwrap());
            assert!(!is_chunked(headers.get(TRANSFER_ENCODING)));
        }

        {
            let mut headers = HeaderMap::new();
            headers.insert("Transfer-Encoding", "Chunked".parse().unwrap());
            assert!(is_chunked(headers.get(TRANSFER_ENCODING)));
        }
    }

    #[test]
    fn content_length_values() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers).unwrap(), None);

        headers.insert(CONTENT_LENGTH, "42".parse().unwrap());
        assert_eq!(content_length(&headers).unwrap(), Some(42));

        headers.append(CONTENT_LENGTH, "42".parse().unwrap());
        assert_eq!(content_length(&headers).unwrap(), Some(42));

        headers.append(CONTENT_LENGTH, "43".parse().unwrap());
        assert!(content_length(&headers).is_err());

        headers.insert(CONTENT_LENGTH, "-1".parse().unwrap());
        assert!(content_length(&headers).is_err());
    }

    #[test]
    fn close_directives() {
        let mut headers = HeaderMap::new();
        assert!(!has_close_directive(&headers, Version::HTTP_11));
        assert!(has_close_directive(&headers, Version::HTTP_10));

        headers.insert(CONNECTION, "Keep-Alive".parse().unwrap());
        assert!(!has_close_directive(&headers, Version::HTTP_10));

        headers.insert(CONNECTION, "upgrade, Close".parse().unwrap());
        assert!(has_close_directive(&headers, Version::HTTP_11));
    }

    #[test]
    fn force_chunked_rewrites_framing() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, "100".parse().unwrap());
        force_chunked(&mut headers);
        assert!(headers.get(CONTENT_LENGTH).is_none());
        assert_eq!(headers.get(TRANSFER_ENCODING).unwrap(), "chunked");
    }
}
