//! HTTP response header handling implementation.
//!
//! Response heads use the standard `http::Response` type with an empty body placeholder,
//! the body travels separately as a byte stream.

use http::{Response, StatusCode};

/// Type alias for HTTP response headers.
///
/// The actual response body is attached later with [`Response::map`].
pub type ResponseHead = Response<()>;

/// Returns true for statuses that must not carry a body (1xx, 204, 304).
pub fn status_forbids_body(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bodiless_statuses() {
        assert!(status_forbids_body(StatusCode::CONTINUE));
        assert!(status_forbids_body(StatusCode::NO_CONTENT));
        assert!(status_forbids_body(StatusCode::NOT_MODIFIED));
        assert!(!status_forbids_body(StatusCode::OK));
        assert!(!status_forbids_body(StatusCode::NOT_FOUND));
    }
}
