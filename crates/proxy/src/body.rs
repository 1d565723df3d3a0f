use std::fmt;
use std::io;
use std::io::{Cursor, Read};

use bytes::Bytes;

/// A message body as a single-use byte stream.
///
/// Request bodies given to a handler are already decoded and filtered. Response bodies a
/// handler returns are raw wire bytes, framed the way the response headers say.
pub struct Body<'a> {
    stream: Option<Box<dyn Read + Send + 'a>>,
}

impl<'a> Body<'a> {
    pub fn new<R: Read + Send + 'a>(stream: R) -> Self {
        Self { stream: Some(Box::new(stream)) }
    }

    pub fn empty() -> Self {
        Self { stream: None }
    }

    /// Hands out the stream, later calls return `None`.
    pub fn take_stream(&mut self) -> Option<Box<dyn Read + Send + 'a>> {
        self.stream.take()
    }

    pub fn is_taken(&self) -> bool {
        self.stream.is_none()
    }

    /// Reads the whole remaining body into memory.
    pub fn read_all(&mut self) -> io::Result<Bytes> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

impl Read for Body<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.read(buf),
            None => Ok(0),
        }
    }
}

impl Default for Body<'_> {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body").field("taken", &self.is_taken()).finish()
    }
}

impl From<Bytes> for Body<'static> {
    fn from(bytes: Bytes) -> Self {
        Self::new(Cursor::new(bytes))
    }
}

impl From<Vec<u8>> for Body<'static> {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(Cursor::new(bytes))
    }
}

impl From<String> for Body<'static> {
    fn from(str: String) -> Self {
        Self::new(Cursor::new(str.into_bytes()))
    }
}

impl From<&'static str> for Body<'static> {
    fn from(str: &'static str) -> Self {
        Self::new(Cursor::new(str.as_bytes()))
    }
}
