use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid http uri")]
    InvalidUri,

    #[error("invalid http status")]
    InvalidStatus,

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid chunk size: {reason}")]
    InvalidChunkSize { reason: String },

    #[error("chunk size {size} exceed the limit {max_size}")]
    ChunkTooLarge { size: u64, max_size: u64 },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("stream ended before the message was complete")]
    UnexpectedEof,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn invalid_chunk_size<S: ToString>(str: S) -> Self {
        Self::InvalidChunkSize { reason: str.to_string() }
    }

    pub fn chunk_too_large(size: u64, max_size: u64) -> Self {
        Self::ChunkTooLarge { size, max_size }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// Converts the error into an [`io::Error`] so it can travel through `Read` impls.
    ///
    /// Parse failures keep their message under [`io::ErrorKind::InvalidData`], so a body
    /// reader never reports a protocol error as a plain end of stream.
    pub fn into_io(self) -> io::Error {
        match self {
            ParseError::Io { source } => source,
            ParseError::UnexpectedEof => io::Error::new(io::ErrorKind::UnexpectedEof, ParseError::UnexpectedEof),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("buffer overflow: {len} bytes exceed the capacity {capacity}")]
    BufferOverflow { len: usize, capacity: usize },

    #[error("stream already closed")]
    Closed,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn buffer_overflow(len: usize, capacity: usize) -> Self {
        Self::BufferOverflow { len, capacity }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// Converts the error into an [`io::Error`] so it can travel through `Write` impls.
    pub fn into_io(self) -> io::Error {
        match self {
            SendError::Io { source } => source,
            SendError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, SendError::Closed),
            other => io::Error::new(io::ErrorKind::InvalidInput, other),
        }
    }
}
