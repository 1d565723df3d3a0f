//! HTTP request header handling implementation.
//!
//! This module wraps the standard `http::Request` type to provide the
//! request-line level helpers the proxy needs while a body is still being framed.

use http::request::Parts;
use http::{HeaderMap, Method, Request, Uri, Version};

/// Represents an HTTP request header.
///
/// This struct wraps a `http::Request<()>` to provide:
/// - Access to standard HTTP header fields
/// - Conversion from different request formats
/// - Body attachment capabilities
#[derive(Debug, Clone)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl AsMut<Request<()>> for RequestHeader {
    fn as_mut(&mut self) -> &mut Request<()> {
        &mut self.inner
    }
}

impl RequestHeader {
    /// Consumes the header and returns the inner `Request<()>`.
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    /// Attaches a body to this header, converting it into a full `Request<T>`.
    pub fn body<T>(self, body: T) -> Request<T> {
        self.inner.map(|()| body)
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    /// Path component of the request target, `/` for authority-form targets.
    pub fn path(&self) -> &str {
        self.inner.uri().path()
    }

    /// Returns true for `CONNECT host:port` tunnel requests.
    pub fn is_connect(&self) -> bool {
        self.inner.method() == Method::CONNECT
    }

    /// Returns true if the response to this request never carries a body.
    pub fn expects_bodiless_response(&self) -> bool {
        self.inner.method() == Method::HEAD
    }
}

impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request() {
        let header = RequestHeader::from(Request::builder().method(Method::CONNECT).uri("example.com:443").body(()).unwrap());
        assert!(header.is_connect());
        assert!(!header.expects_bodiless_response());
        assert_eq!(header.uri().authority().map(|a| a.as_str()), Some("example.com:443"));
    }

    #[test]
    fn absolute_form_path() {
        let header = RequestHeader::from(Request::builder().uri("http://example.com/a/b?c=d").body(()).unwrap());
        assert_eq!(header.path(), "/a/b");
        assert_eq!(header.uri().query(), Some("c=d"));
    }

    #[test]
    fn attach_body() {
        let header = RequestHeader::from(Request::builder().method(Method::HEAD).uri("/").body(()).unwrap());
        assert!(header.expects_bodiless_response());
        let request = header.body("payload");
        assert_eq!(*request.body(), "payload");
    }
}
