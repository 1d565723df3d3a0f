//! Message filters and what they can attach to a body.
//!
//! A [`MessageFilter`] is offered every message whose request target and content type
//! match its patterns. When offered, it may change the headers and attach stream filters
//! to the message's [`FilterRegistration`]:
//!
//! | kind | changes the body | unit |
//! |---|---|---|
//! | [`ByteFilter`] | yes | block |
//! | [`ByteObserver`] | no | block |
//! | [`TextFilter`] | yes | line |
//! | [`TextObserver`] | no | line |
//!
//! ```
//! use bytes::Bytes;
//! use intercept_proxy::filter::{FilterRegistry, FnFilter};
//! use intercept_proxy::BoxError;
//!
//! let registry = FilterRegistry::new();
//! registry.register(
//!     FnFilter::new("shout", r"^http://example\.com/", "^text/plain$", |context| {
//!         context.registration().add_text_filter(|line: String| -> Result<String, BoxError> { Ok(line.to_uppercase()) });
//!         Ok(())
//!     })
//!     .unwrap(),
//! );
//! assert_eq!(registry.len(), 1);
//! ```

mod registration;
mod registry;

pub use registration::{ByteFilter, ByteObserver, FilterRegistration, TextFilter, TextObserver};
pub use registry::FilterRegistry;

use http::{HeaderMap, Uri};
use mime::Mime;
use regex::Regex;

use crate::error::BoxError;

/// Which message of an exchange is being filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// A filter the pipeline offers matching messages.
pub trait MessageFilter: Send + Sync {
    fn name(&self) -> &str;

    fn direction(&self) -> Direction {
        Direction::Response
    }

    /// Matched against the request target as it appeared in the request line.
    fn url_pattern(&self) -> &Regex;

    /// Matched against the media type of the message without parameters, or against the
    /// empty string when there is no Content-Type.
    fn content_type_pattern(&self) -> &Regex;

    /// Called exactly once for every matching message, before any body byte is read.
    ///
    /// Returning an error discards every change this and the other filters made to the
    /// message, the body then passes unfiltered.
    fn offer(&self, context: &mut OfferContext<'_>) -> Result<(), BoxError>;
}

/// What a filter sees while it is offered a message.
pub struct OfferContext<'a> {
    direction: Direction,
    uri: &'a Uri,
    captures: Vec<Option<String>>,
    content_type: Option<&'a Mime>,
    headers: &'a mut HeaderMap,
    registration: &'a mut FilterRegistration,
}

impl std::fmt::Debug for OfferContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfferContext")
            .field("direction", &self.direction)
            .field("uri", self.uri)
            .field("content_type", &self.content_type)
            .field("registration", &*self.registration)
            .finish_non_exhaustive()
    }
}

impl<'a> OfferContext<'a> {
    pub(crate) fn new(
        direction: Direction,
        uri: &'a Uri,
        captures: Vec<Option<String>>,
        content_type: Option<&'a Mime>,
        headers: &'a mut HeaderMap,
        registration: &'a mut FilterRegistration,
    ) -> Self {
        Self { direction, uri, captures, content_type, headers, registration }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn uri(&self) -> &Uri {
        self.uri
    }

    /// Capture group `index` of the url pattern, 0 being the whole match.
    pub fn capture(&self, index: usize) -> Option<&str> {
        self.captures.get(index).and_then(|capture| capture.as_deref())
    }

    pub fn content_type(&self) -> Option<&Mime> {
        self.content_type
    }

    pub fn headers(&self) -> &HeaderMap {
        self.headers
    }

    /// Headers of the message being offered; changes are sent with it.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.headers
    }

    pub fn registration(&mut self) -> &mut FilterRegistration {
        self.registration
    }
}

type OfferFn = dyn Fn(&mut OfferContext<'_>) -> Result<(), BoxError> + Send + Sync;

/// A [`MessageFilter`] built from two patterns and a closure.
pub struct FnFilter {
    name: String,
    direction: Direction,
    url_pattern: Regex,
    content_type_pattern: Regex,
    offer: Box<OfferFn>,
}

impl std::fmt::Debug for FnFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnFilter")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("url_pattern", &self.url_pattern.as_str())
            .field("content_type_pattern", &self.content_type_pattern.as_str())
            .finish()
    }
}

impl FnFilter {
    /// A response filter, see [`FnFilter::for_requests`] to filter request bodies.
    pub fn new<F>(name: impl Into<String>, url_pattern: &str, content_type_pattern: &str, offer: F) -> Result<Self, regex::Error>
    where
        F: Fn(&mut OfferContext<'_>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Ok(Self {
            name: name.into(),
            direction: Direction::Response,
            url_pattern: Regex::new(url_pattern)?,
            content_type_pattern: Regex::new(content_type_pattern)?,
            offer: Box::new(offer),
        })
    }

    pub fn for_requests(mut self) -> Self {
        self.direction = Direction::Request;
        self
    }
}

impl MessageFilter for FnFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn url_pattern(&self) -> &Regex {
        &self.url_pattern
    }

    fn content_type_pattern(&self) -> &Regex {
        &self.content_type_pattern
    }

    fn offer(&self, context: &mut OfferContext<'_>) -> Result<(), BoxError> {
        (self.offer)(context)
    }
}
