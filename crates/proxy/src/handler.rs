//! What the proxy does with a request once its head and body are ready.

use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, Request, Response, StatusCode};
use tracing::warn;

use crate::ProxyError;
use crate::body::Body;
use crate::error::BoxError;

/// Produces the response for one request.
///
/// The request body is decoded and filtered; it borrows the client connection and has to
/// be consumed, if at all, before `handle` returns. The response body is the raw wire
/// stream, framed the way the response headers describe it.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: Request<Body<'_>>) -> Result<Response<Body<'static>>, BoxError>;
}

#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

impl<F, Err> RequestHandler for HandlerFn<F>
where
    F: for<'a> Fn(Request<Body<'a>>) -> Result<Response<Body<'static>>, Err> + Send + Sync,
    Err: Into<BoxError>,
{
    fn handle(&self, request: Request<Body<'_>>) -> Result<Response<Body<'static>>, BoxError> {
        (self.f)(request).map_err(Into::into)
    }
}

pub fn make_handler<F, Err>(f: F) -> HandlerFn<F>
where
    F: for<'a> Fn(Request<Body<'a>>) -> Result<Response<Body<'static>>, Err> + Send + Sync,
    Err: Into<BoxError>,
{
    HandlerFn { f }
}

/// Builds the response sent when a handler fails or a request can't be served.
pub trait ErrorResponder: Send + Sync {
    fn respond(&self, status: StatusCode, error: Option<&(dyn std::error::Error + 'static)>) -> Response<Body<'static>>;
}

/// Plain text response carrying the reason phrase of the status.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorResponder;

impl ErrorResponder for DefaultErrorResponder {
    fn respond(&self, status: StatusCode, _error: Option<&(dyn std::error::Error + 'static)>) -> Response<Body<'static>> {
        let reason = status.canonical_reason().unwrap_or("Error");
        let mut response = Response::new(Body::from(reason));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(reason.len()));
        response
    }
}

/// Status sent for a failed handler: gateway errors for upstream trouble, 500 otherwise.
pub fn status_for_error(error: &BoxError) -> StatusCode {
    match error.downcast_ref::<ProxyError>() {
        Some(ProxyError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        Some(ProxyError::Upstream { source, .. }) if source.kind() == std::io::ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        Some(ProxyError::Upstream { .. } | ProxyError::Parse { .. } | ProxyError::Io { .. }) => StatusCode::BAD_GATEWAY,
        Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
        None => {
            if error.downcast_ref::<std::io::Error>().is_some() {
                StatusCode::BAD_GATEWAY
            } else {
                warn!(cause = %error, "handler failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
