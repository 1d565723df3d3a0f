//! Core HTTP protocol abstractions.
//!
//! This module provides the fundamental building blocks shared by the codec and by the
//! proxy: message heads, payload framing information and error types.
//!
//! # Architecture
//!
//! - **Message Handling** ([`message`]): Payload items and framing
//!   - [`PayloadItem`]: Handles individual payload chunks and EOF
//!   - [`PayloadSize`]: How a payload is framed on the wire
//!
//! - **Request Processing** ([`request`]): [`RequestHeader`] wraps `http::Request<()>`
//!
//! - **Response Processing** ([`response`]): [`ResponseHead`] alias and status rules
//!
//! - **Framing headers** ([`headers`]): Transfer-Encoding, Content-Length and
//!   Connection helpers that keep those headers consistent
//!
//! - **Error Handling** ([`error`]):
//!   - [`HttpError`]: Top-level error type
//!   - [`ParseError`]: Message parsing errors
//!   - [`SendError`]: Message sending errors

mod message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHeader;

mod response;
pub use response::ResponseHead;
pub use response::status_forbids_body;

pub mod headers;

mod error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;
