//! Inputs shared by the benchmarks.

/// A message head or body captured from the wire.
#[derive(Debug, Copy, Clone)]
pub struct Capture {
    name: &'static str,
    content: &'static [u8],
}

impl Capture {
    pub const fn new(name: &'static str, content: &'static [u8]) -> Self {
        Self { name, content }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn content(&self) -> &'static [u8] {
        self.content
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// An html document of `lines` lines, LF terminated, with an `a` in every line.
pub fn html_body(lines: usize) -> Vec<u8> {
    let mut body = Vec::with_capacity(lines * 48);
    body.extend_from_slice(b"<html><body>\n");
    for line in 0..lines {
        body.extend_from_slice(format!("<p class=\"item\">line {line} of a generated page</p>\n").as_bytes());
    }
    body.extend_from_slice(b"</body></html>\n");
    body
}

/// `body` in the chunked transfer coding, `chunk_size` bytes per chunk, followed by one trailer.
pub fn chunked(body: &[u8], chunk_size: usize) -> Vec<u8> {
    let mut wire = Vec::with_capacity(body.len() + body.len() / chunk_size.max(1) * 8 + 32);
    for chunk in body.chunks(chunk_size.max(1)) {
        wire.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        wire.extend_from_slice(chunk);
        wire.extend_from_slice(b"\r\n");
    }
    wire.extend_from_slice(b"0\r\nx-checksum: 0\r\n\r\n");
    wire
}
