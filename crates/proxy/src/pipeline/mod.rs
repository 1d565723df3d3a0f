//! Decode, filter and re-frame message bodies while they stream.
//!
//! [`BodyPipeline::prepare`] runs before the head of a message is sent on. It offers the
//! message to the registered filters, wraps the transfer-decoded body with whatever they
//! attached and rewrites the framing headers so they describe the body that will actually
//! be sent:
//!
//! - an editing filter makes the length unknown: Content-Length goes (kept as
//!   `X-Original-Content-Length`) and the body is sent chunked, decoded if it had a
//!   content coding
//! - observers alone leave the body, its Content-Length and its Content-Encoding as they
//!   are; a content-coded body is decoded for them on the side
//! - without any attached filter nothing changes, the body passes byte for byte
//!
//! Filtering happens on the thread reading the body, block by block, never ahead of it.

mod byte_stage;
mod charset;
mod content;
mod tee;
mod text_stage;

pub use byte_stage::ByteFilterReader;
pub use charset::Charset;
pub use text_stage::LineFilterReader;

use std::io;
use std::io::{Cursor, Read};

use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Uri};
use intercept_http::protocol::PayloadSize;
use intercept_http::protocol::headers::force_chunked;
use mime::Mime;
use tracing::{debug, warn};

use crate::ProxyError;
use crate::config::ProxyConfig;
use crate::filter::{Direction, FilterRegistration, FilterRegistry, OfferContext};
use crate::headers::{X_INTERCEPT_FILTERS, X_ORIGINAL_CONTENT_LENGTH};
use tee::{Tap, TeeReader};

/// The exchange a body belongs to.
#[derive(Debug, Clone, Copy)]
pub struct MessageContext<'a> {
    pub direction: Direction,
    /// Target of the request, also for the response to it
    pub uri: &'a Uri,
    /// Set when the client asked for the exchange to pass unfiltered
    pub bypass: bool,
}

/// A body ready to be sent on.
pub struct PreparedBody<'a> {
    pub reader: Box<dyn Read + Send + 'a>,
    /// How the body has to be framed when it is sent, matching the rewritten headers
    pub payload_size: PayloadSize,
    /// Names of the filters that attached to the message
    pub applied: Vec<String>,
}

/// What one filter attached when it was offered a message.
struct Attachment {
    name: String,
    byte_stage: bool,
    text_stage: bool,
}

impl std::fmt::Debug for PreparedBody<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedBody").field("payload_size", &self.payload_size).field("applied", &self.applied).finish_non_exhaustive()
    }
}

impl<'a> PreparedBody<'a> {
    fn unchanged(reader: Box<dyn Read + Send + 'a>, payload_size: PayloadSize) -> Self {
        Self { reader, payload_size, applied: Vec::new() }
    }
}

#[derive(Debug, Clone)]
pub struct BodyPipeline {
    registry: FilterRegistry,
    block_size: usize,
    max_line_length: usize,
    default_charset: Charset,
}

impl BodyPipeline {
    pub fn new(registry: FilterRegistry, config: &ProxyConfig) -> Result<Self, ProxyError> {
        let default_charset = Charset::from_label(&config.default_charset)
            .ok_or_else(|| ProxyError::config(format!("unsupported default_charset {}", config.default_charset)))?;
        Ok(Self { registry, block_size: config.filter_block_size, max_line_length: config.max_line_length, default_charset })
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    /// Offers a message to the filters and builds the stream its body is sent from.
    ///
    /// `body` is the transfer-decoded body, `payload_size` the framing it arrived with.
    /// `headers` are rewritten in place.
    ///
    /// # Errors
    ///
    /// Only reading the body can fail here, which happens when a markup body has to be
    /// sniffed for its charset.
    pub fn prepare<'a>(
        &self,
        context: &MessageContext<'_>,
        headers: &mut HeaderMap,
        payload_size: PayloadSize,
        body: Box<dyn Read + Send + 'a>,
    ) -> io::Result<PreparedBody<'a>> {
        if payload_size.is_empty() || context.bypass || self.registry.is_empty() {
            return Ok(PreparedBody::unchanged(body, payload_size));
        }

        let snapshot = headers.clone();
        let mime = headers.get(CONTENT_TYPE).and_then(|value| value.to_str().ok()).and_then(|value| value.parse::<Mime>().ok());

        let Some((mut registration, attachments)) = self.offer(context, headers, mime.as_ref(), &snapshot) else {
            return Ok(PreparedBody::unchanged(body, payload_size));
        };
        if registration.is_empty() {
            return Ok(PreparedBody::unchanged(body, payload_size));
        }

        let codings = match content::content_codings(headers) {
            Ok(codings) => codings,
            Err(coding) => {
                warn!(coding, "can't decode content coding, message passes unfiltered");
                *headers = snapshot;
                return Ok(PreparedBody::unchanged(body, payload_size));
            }
        };
        let (mut reader, tap) = if codings.is_empty() {
            (body, None)
        } else {
            let tap = Tap::new(body);
            (content::decode(&codings, Box::new(tap.clone()))?, Some(tap))
        };

        let charset = if registration.has_text_stage() {
            let (charset, sniffed) = self.resolve_charset(mime.as_ref(), &mut reader)?;
            if let Some(sniffed) = sniffed {
                reader = Box::new(Cursor::new(sniffed).chain(reader));
            }
            if charset.is_none() {
                registration.text_filters.clear();
                registration.text_observers.clear();
            }
            charset
        } else {
            None
        };

        let applied: Vec<String> = attachments
            .into_iter()
            .filter(|attachment| attachment.byte_stage || (attachment.text_stage && charset.is_some()))
            .map(|attachment| attachment.name)
            .collect();

        let editing = registration.has_editing();
        let FilterRegistration { byte_filters, byte_observers, text_filters, text_observers } = registration;
        if !byte_filters.is_empty() || !byte_observers.is_empty() {
            reader = Box::new(ByteFilterReader::new(reader, byte_filters, byte_observers, self.block_size));
        }
        if let Some(charset) = charset.filter(|_| !text_filters.is_empty() || !text_observers.is_empty()) {
            reader = Box::new(LineFilterReader::new(reader, charset, text_filters, text_observers, self.block_size, self.max_line_length));
        }

        // observers see the decoded body, the peer gets the bytes as they arrived
        let content_decoded = editing && tap.is_some();
        let reader: Box<dyn Read + Send + 'a> = match tap {
            Some(tap) if !editing => Box::new(TeeReader::new(tap, reader, self.block_size)),
            Some(tap) => {
                tap.stop_recording();
                reader
            }
            None => reader,
        };

        let payload_size = if editing {
            if let Some(length) = headers.get(CONTENT_LENGTH).cloned() {
                headers.insert(X_ORIGINAL_CONTENT_LENGTH, length);
            }
            if content_decoded {
                headers.remove(CONTENT_ENCODING);
            }
            force_chunked(headers);
            PayloadSize::Chunked
        } else {
            payload_size
        };

        if !applied.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&applied.join(", ")) {
                headers.insert(X_INTERCEPT_FILTERS, value);
            }
        }
        debug!(direction = ?context.direction, uri = %context.uri, filters = ?applied, editing, content_decoded, "body filtered");

        Ok(PreparedBody { reader, payload_size, applied })
    }

    /// Offers the message to every matching filter in registration order.
    ///
    /// `None` if an offer failed, the headers are restored then.
    fn offer(
        &self,
        context: &MessageContext<'_>,
        headers: &mut HeaderMap,
        mime: Option<&Mime>,
        snapshot: &HeaderMap,
    ) -> Option<(FilterRegistration, Vec<Attachment>)> {
        let target = context.uri.to_string();
        let essence = mime.map(Mime::essence_str).unwrap_or_default();

        let mut registration = FilterRegistration::default();
        let mut attachments = Vec::new();
        for filter in self.registry.snapshot().iter() {
            if filter.direction() != context.direction {
                continue;
            }
            let Some(captures) = filter.url_pattern().captures(&target) else {
                continue;
            };
            if !filter.content_type_pattern().is_match(essence) {
                continue;
            }

            let captures = captures.iter().map(|group| group.map(|m| m.as_str().to_string())).collect();
            let (bytes_before, text_before) = registration.stage_sizes();
            let mut offer_context = OfferContext::new(context.direction, context.uri, captures, mime, headers, &mut registration);
            if let Err(e) = filter.offer(&mut offer_context) {
                warn!(filter = filter.name(), cause = %e, "filter offer failed, message passes unfiltered");
                *headers = snapshot.clone();
                return None;
            }
            let (bytes_after, text_after) = registration.stage_sizes();
            let attachment =
                Attachment { name: filter.name().to_string(), byte_stage: bytes_after > bytes_before, text_stage: text_after > text_before };
            if attachment.byte_stage || attachment.text_stage {
                attachments.push(attachment);
            }
        }
        Some((registration, attachments))
    }

    /// Picks the charset of a text body.
    ///
    /// Returns the bytes read while sniffing, they have to go in front of the body again.
    fn resolve_charset(&self, mime: Option<&Mime>, reader: &mut Box<dyn Read + Send + '_>) -> io::Result<(Option<Charset>, Option<Vec<u8>>)> {
        if let Some(label) = mime.and_then(|mime| mime.get_param(mime::CHARSET)) {
            let charset = Charset::from_label(label.as_str());
            if charset.is_none() {
                warn!(charset = label.as_str(), "unsupported charset, text filters skipped");
            }
            return Ok((charset, None));
        }

        if mime.is_some_and(charset::is_markup) {
            let mut block = Vec::with_capacity(self.block_size);
            reader.by_ref().take(self.block_size as u64).read_to_end(&mut block)?;
            let charset = match charset::sniff(&block) {
                Some(label) => {
                    let charset = Charset::from_label(label);
                    if charset.is_none() {
                        warn!(charset = label, "unsupported declared charset, text filters skipped");
                    }
                    charset
                }
                None => Some(self.default_charset),
            };
            return Ok((charset, Some(block)));
        }

        Ok((Some(self.default_charset), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::filter::FnFilter;
    use bytes::Bytes;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use http::header::TRANSFER_ENCODING;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    fn pipeline(registry: &FilterRegistry) -> BodyPipeline {
        BodyPipeline::new(registry.clone(), &ProxyConfig { filter_block_size: 64, ..ProxyConfig::default() }).unwrap()
    }

    fn response_headers(content_type: &str, content_length: usize) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, content_type.parse().unwrap());
        headers.insert(CONTENT_LENGTH, content_length.into());
        headers
    }

    fn run(pipeline: &BodyPipeline, uri: &str, headers: &mut HeaderMap, body: &'static [u8]) -> (Vec<u8>, PayloadSize, Vec<String>) {
        let uri: Uri = uri.parse().unwrap();
        let context = MessageContext { direction: Direction::Response, uri: &uri, bypass: false };
        let prepared = pipeline.prepare(&context, headers, PayloadSize::Length(body.len() as u64), Box::new(body)).unwrap();
        let mut reader = prepared.reader;
        let mut output = Vec::new();
        reader.read_to_end(&mut output).unwrap();
        (output, prepared.payload_size, prepared.applied)
    }

    fn upper_bytes() -> impl Fn(&mut OfferContext<'_>) -> Result<(), BoxError> + Send + Sync + 'static {
        |context: &mut OfferContext<'_>| {
            context.registration().add_byte_filter(|block: Bytes| -> Result<Bytes, BoxError> { Ok(Bytes::from(block.to_ascii_uppercase())) });
            Ok(())
        }
    }

    #[test]
    fn editing_filter_forces_rechunk() {
        let registry = FilterRegistry::new();
        registry.register(FnFilter::new("upper", ".*", "^text/plain$", upper_bytes()).unwrap());

        let body: &'static [u8] = &[b'a'; 100];
        let mut headers = response_headers("text/plain", 100);
        let (output, payload_size, applied) = run(&pipeline(&registry), "http://h/x", &mut headers, body);

        assert_eq!(output, vec![b'A'; 100]);
        assert_eq!(payload_size, PayloadSize::Chunked);
        assert!(headers.get(CONTENT_LENGTH).is_none());
        assert_eq!(headers[TRANSFER_ENCODING], "chunked");
        assert_eq!(headers[X_ORIGINAL_CONTENT_LENGTH], "100");
        assert_eq!(headers[X_INTERCEPT_FILTERS], "upper");
        assert_eq!(applied, vec!["upper"]);
    }

    #[test]
    fn readonly_filter_preserves_length() {
        let registry = FilterRegistry::new();
        registry.register(
            FnFilter::new("count", ".*", ".*", |context| {
                context.registration().add_byte_observer(|_: &[u8]| -> Result<(), BoxError> { Ok(()) });
                context.registration().add_text_observer(|_: &str| -> Result<(), BoxError> { Ok(()) });
                Ok(())
            })
            .unwrap(),
        );

        let body: &'static [u8] = &[b'a'; 100];
        let mut headers = response_headers("text/plain", 100);
        let (output, payload_size, _) = run(&pipeline(&registry), "http://h/x", &mut headers, body);

        assert_eq!(output, body);
        assert_eq!(payload_size, PayloadSize::Length(100));
        assert_eq!(headers[CONTENT_LENGTH], "100");
        assert!(headers.get(TRANSFER_ENCODING).is_none());
        assert!(headers.get(X_ORIGINAL_CONTENT_LENGTH).is_none());
    }

    #[test]
    fn no_match_is_noop() {
        let registry = FilterRegistry::new();
        registry.register(FnFilter::new("upper", r"^http://other/", ".*", upper_bytes()).unwrap());
        registry.register(FnFilter::new("json", ".*", "^application/json$", upper_bytes()).unwrap());

        let mut headers = response_headers("text/plain", 11);
        let before = headers.clone();
        let (output, payload_size, applied) = run(&pipeline(&registry), "http://h/x", &mut headers, b"hello world");

        assert_eq!(output, b"hello world");
        assert_eq!(payload_size, PayloadSize::Length(11));
        assert!(applied.is_empty());
        assert_eq!(headers, before);
    }

    #[test]
    fn bypass_skips_offer() {
        let registry = FilterRegistry::new();
        registry.register(FnFilter::new("upper", ".*", ".*", upper_bytes()).unwrap());

        let uri: Uri = "/x".parse().unwrap();
        let context = MessageContext { direction: Direction::Response, uri: &uri, bypass: true };
        let mut headers = response_headers("text/plain", 3);
        let prepared = pipeline(&registry).prepare(&context, &mut headers, PayloadSize::Length(3), Box::new(&b"abc"[..])).unwrap();
        assert_eq!(prepared.payload_size, PayloadSize::Length(3));
        assert!(prepared.applied.is_empty());
    }

    #[test]
    fn failed_offer_restores_headers() {
        let registry = FilterRegistry::new();
        registry.register(FnFilter::new("upper", ".*", ".*", upper_bytes()).unwrap());
        registry.register(
            FnFilter::new("broken", ".*", ".*", |context| {
                context.headers_mut().insert("x-broken", HeaderValue::from_static("1"));
                Err("refused".into())
            })
            .unwrap(),
        );

        let mut headers = response_headers("text/plain", 3);
        let before = headers.clone();
        let (output, payload_size, applied) = run(&pipeline(&registry), "http://h/x", &mut headers, b"abc");
        assert_eq!(output, b"abc");
        assert_eq!(payload_size, PayloadSize::Length(3));
        assert!(applied.is_empty());
        assert_eq!(headers, before);
    }

    #[test]
    fn url_captures_and_direction() {
        let registry = FilterRegistry::new();
        registry.register(
            FnFilter::new("tag", r"^http://h/items/(\d+)$", ".*", |context| {
                let id = context.capture(1).unwrap_or_default().to_string();
                context.headers_mut().insert("x-item", id.parse()?);
                context.registration().add_byte_observer(|_: &[u8]| -> Result<(), BoxError> { Ok(()) });
                Ok(())
            })
            .unwrap(),
        );
        registry.register(FnFilter::new("requests", ".*", ".*", upper_bytes()).unwrap().for_requests());

        let mut headers = response_headers("text/plain", 3);
        let (output, _, applied) = run(&pipeline(&registry), "http://h/items/7", &mut headers, b"abc");
        assert_eq!(output, b"abc");
        assert_eq!(headers["x-item"], "7");
        assert_eq!(applied, vec!["tag"]);
    }

    #[test]
    fn gzip_body_is_decoded_for_filters() {
        let registry = FilterRegistry::new();
        registry.register(
            FnFilter::new("html", ".*", "^text/html$", |context| {
                context.registration().add_text_filter(|line: String| -> Result<String, BoxError> { Ok(line.replace('A', "B")) });
                Ok(())
            })
            .unwrap(),
        );

        let mut gzip = GzEncoder::new(Vec::new(), Compression::default());
        gzip.write_all(b"<html>A</html>").unwrap();
        let encoded: &'static [u8] = gzip.finish().unwrap().leak();

        let mut headers = response_headers("text/html", encoded.len());
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let (output, payload_size, _) = run(&pipeline(&registry), "http://h/x", &mut headers, encoded);

        assert_eq!(output, b"<html>B</html>");
        assert_eq!(payload_size, PayloadSize::Chunked);
        assert!(headers.get(CONTENT_ENCODING).is_none());
        assert_eq!(headers[X_ORIGINAL_CONTENT_LENGTH], encoded.len().to_string().as_str());
    }

    #[test]
    fn gzip_body_with_observers_is_sent_as_is() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = FilterRegistry::new();
        let sink = Arc::clone(&seen);
        registry.register(
            FnFilter::new("watch", ".*", ".*", move |context| {
                let sink = Arc::clone(&sink);
                context.registration().add_byte_observer(move |block: &[u8]| -> Result<(), BoxError> {
                    sink.lock().unwrap().extend_from_slice(block);
                    Ok(())
                });
                Ok(())
            })
            .unwrap(),
        );

        let text = "<p>line of markup</p>\n".repeat(50);
        let mut gzip = GzEncoder::new(Vec::new(), Compression::default());
        gzip.write_all(text.as_bytes()).unwrap();
        let encoded: &'static [u8] = gzip.finish().unwrap().leak();

        let mut headers = response_headers("text/html", encoded.len());
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let (output, payload_size, applied) = run(&pipeline(&registry), "http://h/x", &mut headers, encoded);

        assert_eq!(output, encoded);
        assert_eq!(payload_size, PayloadSize::Length(encoded.len() as u64));
        assert_eq!(headers[CONTENT_ENCODING], "gzip");
        assert_eq!(headers[CONTENT_LENGTH], encoded.len().to_string().as_str());
        assert!(headers.get(TRANSFER_ENCODING).is_none());
        assert!(headers.get(X_ORIGINAL_CONTENT_LENGTH).is_none());
        assert_eq!(applied, vec!["watch"]);
        assert_eq!(*seen.lock().unwrap(), text.as_bytes());
    }

    #[test]
    fn windows_1252_text_filter_sees_euro() {
        let registry = FilterRegistry::new();
        registry.register(
            FnFilter::new("euro", ".*", ".*", |context| {
                context.registration().add_text_filter(|line: String| -> Result<String, BoxError> { Ok(line.replace('\u{20ac}', "EUR")) });
                Ok(())
            })
            .unwrap(),
        );

        let mut headers = response_headers("text/plain; charset=windows-1252", 4);
        let (output, payload_size, _) = run(&pipeline(&registry), "http://h/x", &mut headers, b"5\x80\r\n");
        assert_eq!(output, b"5EUR\r\n");
        assert_eq!(payload_size, PayloadSize::Chunked);
    }

    #[test]
    fn skipped_text_filter_is_not_reported() {
        let registry = FilterRegistry::new();
        registry.register(
            FnFilter::new("text", ".*", ".*", |context| {
                context.registration().add_text_observer(|_: &str| -> Result<(), BoxError> { Ok(()) });
                Ok(())
            })
            .unwrap(),
        );
        registry.register(
            FnFilter::new("bytes", ".*", ".*", |context| {
                context.registration().add_byte_observer(|_: &[u8]| -> Result<(), BoxError> { Ok(()) });
                Ok(())
            })
            .unwrap(),
        );

        let mut headers = response_headers("text/plain; charset=shift_jis", 3);
        let (output, _, applied) = run(&pipeline(&registry), "http://h/x", &mut headers, b"abc");
        assert_eq!(output, b"abc");
        assert_eq!(applied, vec!["bytes"]);
        assert_eq!(headers[X_INTERCEPT_FILTERS], "bytes");
    }

    #[test]
    fn unsupported_coding_passes_unfiltered() {
        let registry = FilterRegistry::new();
        registry.register(FnFilter::new("upper", ".*", ".*", upper_bytes()).unwrap());

        let mut headers = response_headers("text/plain", 3);
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("compress"));
        let (output, payload_size, _) = run(&pipeline(&registry), "http://h/x", &mut headers, b"abc");
        assert_eq!(output, b"abc");
        assert_eq!(payload_size, PayloadSize::Length(3));
        assert!(headers.get(X_INTERCEPT_FILTERS).is_none());
    }

    #[test]
    fn sniffed_charset_keeps_bytes() {
        let registry = FilterRegistry::new();
        registry.register(
            FnFilter::new("html", ".*", "^text/html$", |context| {
                context.registration().add_text_filter(|line: String| -> Result<String, BoxError> { Ok(line.replace("caf\u{e9}", "CAF\u{c9}")) });
                Ok(())
            })
            .unwrap(),
        );

        let body: &'static [u8] = b"<meta charset=\"iso-8859-1\">\ncaf\xe9\n";
        let mut headers = response_headers("text/html", body.len());
        let (output, _, _) = run(&pipeline(&registry), "http://h/x", &mut headers, body);
        assert_eq!(output, b"<meta charset=\"iso-8859-1\">\nCAF\xc9\n");
    }

    #[test]
    fn unsupported_charset_skips_text_filters() {
        let registry = FilterRegistry::new();
        registry.register(
            FnFilter::new("text", ".*", ".*", |context| {
                context.registration().add_text_filter(|line: String| -> Result<String, BoxError> { Ok(line.to_uppercase()) });
                Ok(())
            })
            .unwrap(),
        );

        let mut headers = response_headers("text/plain; charset=shift_jis", 3);
        let (output, payload_size, applied) = run(&pipeline(&registry), "http://h/x", &mut headers, b"abc");
        assert_eq!(output, b"abc");
        assert_eq!(payload_size, PayloadSize::Length(3));
        assert_eq!(headers[CONTENT_LENGTH], "3");
        assert!(applied.is_empty());
        assert!(headers.get(X_INTERCEPT_FILTERS).is_none());
    }
}
