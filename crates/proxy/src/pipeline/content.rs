//! Content-Encoding decoders wrapped around a transfer-decoded body.

use std::io;
use std::io::Read;

use flate2::read::{MultiGzDecoder, ZlibDecoder};
use http::HeaderMap;
use http::header::CONTENT_ENCODING;
use tracing::trace;
use zstd::stream::read::Decoder as ZstdDecoder;

const BROTLI_BUFFER_SIZE: usize = 4 * 1024;

/// Content codings the pipeline can undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContentCoding {
    Gzip,
    Deflate,
    Zstd,
    Br,
}

impl ContentCoding {
    fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(ContentCoding::Gzip),
            "deflate" => Some(ContentCoding::Deflate),
            "zstd" => Some(ContentCoding::Zstd),
            "br" => Some(ContentCoding::Br),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ContentCoding::Gzip => "gzip",
            ContentCoding::Deflate => "deflate",
            ContentCoding::Zstd => "zstd",
            ContentCoding::Br => "br",
        }
    }
}

/// Codings of the message in the order they were applied, `identity` left out.
///
/// `Err` carries the first coding that can't be decoded.
pub(crate) fn content_codings(headers: &HeaderMap) -> Result<Vec<ContentCoding>, String> {
    let mut codings = Vec::new();
    for value in headers.get_all(CONTENT_ENCODING) {
        let value = value.to_str().map_err(|_| String::from("<opaque>"))?;
        for token in value.split(',').map(str::trim).filter(|token| !token.is_empty()) {
            if token.eq_ignore_ascii_case("identity") {
                continue;
            }
            codings.push(ContentCoding::from_token(token).ok_or_else(|| token.to_string())?);
        }
    }
    Ok(codings)
}

/// Wraps `body` so that reading it undoes `codings`, last applied first.
pub(crate) fn decode<'a>(codings: &[ContentCoding], body: Box<dyn Read + Send + 'a>) -> io::Result<Box<dyn Read + Send + 'a>> {
    let mut reader = body;
    for coding in codings.iter().rev() {
        trace!(coding = coding.name(), "decode content coding");
        reader = match coding {
            ContentCoding::Gzip => Box::new(MultiGzDecoder::new(reader)),
            ContentCoding::Deflate => Box::new(ZlibDecoder::new(reader)),
            ContentCoding::Zstd => Box::new(ZstdDecoder::new(reader)?),
            ContentCoding::Br => Box::new(brotli::Decompressor::new(reader, BROTLI_BUFFER_SIZE)),
        };
    }
    Ok(reader)
}
