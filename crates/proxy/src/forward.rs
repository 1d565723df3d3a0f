//! Plain HTTP forwarding to the origin server.

use std::io;
use std::io::{Cursor, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::BytesMut;
use http::header::{CONNECTION, HOST};
use http::uri::Authority;
use http::{HeaderMap, HeaderValue, Request, Response, Uri, Version};
use intercept_http::codec::{RequestHeadEncoder, ResponseHeadDecoder};
use intercept_http::io::{FramedReader, PayloadWriter, TrailerSlot};
use intercept_http::protocol::headers::request_payload_size;
use intercept_http::protocol::{ParseError, RequestHeader};
use tokio_util::codec::Encoder;
use tracing::{debug, trace};

use crate::ProxyError;
use crate::body::Body;
use crate::config::ProxyConfig;
use crate::error::BoxError;
use crate::handler::RequestHandler;
use crate::headers::strip_hop_by_hop;

const DEFAULT_PORT: u16 = 80;

/// Sends every request on to the server it names, one upstream connection per request.
///
/// The target comes from an absolute-form request uri, or from the Host header for
/// origin-form requests. Only `http` targets are forwarded; `https` goes through CONNECT.
#[derive(Debug, Clone)]
pub struct ForwardHandler {
    connect_timeout: Duration,
    io_timeout: Duration,
    buffer_size: usize,
    block_size: usize,
}

impl ForwardHandler {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            connect_timeout: config.upstream_connect_timeout(),
            io_timeout: config.io_timeout(),
            buffer_size: config.buffer_size,
            block_size: config.filter_block_size,
        }
    }

    fn send_request(&self, stream: &TcpStream, authority: &str, request: Request<Body<'_>>) -> Result<(), ProxyError> {
        let (mut parts, mut body) = request.into_parts();
        let trailers = parts.extensions.get::<TrailerSlot>().cloned();
        let payload_size = request_payload_size(&parts.headers)?;

        strip_hop_by_hop(&mut parts.headers);
        parts.headers.insert(CONNECTION, HeaderValue::from_static("close"));
        if !parts.headers.contains_key(HOST) {
            let host = HeaderValue::from_str(authority).map_err(|e| ProxyError::Handler(Box::new(e)))?;
            parts.headers.insert(HOST, host);
        }
        parts.uri = origin_form(&parts.uri)?;
        parts.version = Version::HTTP_11;

        let mut head = BytesMut::new();
        RequestHeadEncoder.encode((RequestHeader::from(parts), payload_size), &mut head)?;
        let upstream_failed = |e: io::Error| ProxyError::upstream(authority, e);
        let mut upstream = stream;
        upstream.write_all(&head).map_err(upstream_failed)?;

        let mut writer = PayloadWriter::with_block_size(upstream, payload_size, self.block_size);
        if let Some(mut reader) = body.take_stream() {
            let copied = io::copy(&mut reader, &mut writer).map_err(upstream_failed)?;
            trace!(authority, copied, "request body forwarded");
        }
        let trailers = trailers.and_then(|slot| slot.take()).unwrap_or_default();
        writer.finish(trailers).map_err(upstream_failed)?;
        Ok(())
    }
}

impl RequestHandler for ForwardHandler {
    fn handle(&self, request: Request<Body<'_>>) -> Result<Response<Body<'static>>, BoxError> {
        let authority = target_authority(request.uri(), request.headers())?;
        let method = request.method().clone();
        debug!(authority, method = %method, uri = %request.uri(), "forward request");

        let stream = connect_upstream(&authority, self.connect_timeout)?;
        let upstream_failed = |e: io::Error| ProxyError::upstream(&authority, timed_out(e));
        stream.set_read_timeout(Some(self.io_timeout)).map_err(upstream_failed)?;
        stream.set_write_timeout(Some(self.io_timeout)).map_err(upstream_failed)?;

        self.send_request(&stream, &authority, request)?;

        let mut framed = FramedReader::with_capacity(stream, self.buffer_size);
        let (head, _) = match framed.decode(&mut ResponseHeadDecoder::for_request(&method)) {
            Ok(Some(head)) => head,
            Ok(None) => return Err(upstream_failed(io::Error::new(io::ErrorKind::UnexpectedEof, "no response")).into()),
            Err(ParseError::Io { source }) => return Err(upstream_failed(source).into()),
            Err(e) => return Err(ProxyError::from(e).into()),
        };

        let (mut parts, ()) = head.into_parts();
        // the upstream hop ends here, its connection handling is not the client's
        strip_hop_by_hop(&mut parts.headers);
        parts.version = Version::HTTP_11;

        let (stream, leftover) = framed.into_parts();
        let body = Body::new(Cursor::new(leftover.freeze()).chain(stream));
        debug!(authority, status = parts.status.as_u16(), "upstream responded");
        Ok(Response::from_parts(parts, body))
    }
}

/// Opens a connection to `authority` (`host:port`), trying every resolved address.
pub(crate) fn connect_upstream(authority: &str, timeout: Duration) -> Result<TcpStream, ProxyError> {
    let addrs = authority.to_socket_addrs().map_err(|e| ProxyError::upstream(authority, e))?;
    let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no address resolved");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true).map_err(|e| ProxyError::upstream(authority, e))?;
                trace!(authority, %addr, "upstream connected");
                return Ok(stream);
            }
            Err(e) => {
                trace!(authority, %addr, cause = %e, "connect failed");
                last_error = e;
            }
        }
    }
    Err(ProxyError::upstream(authority, last_error))
}

fn target_authority(uri: &Uri, headers: &HeaderMap) -> Result<String, ProxyError> {
    match uri.scheme_str() {
        None | Some("http") => {}
        Some(scheme) => return Err(ProxyError::Handler(format!("can't forward {scheme} requests, use CONNECT").into())),
    }

    let authority = match uri.authority() {
        Some(authority) => authority.clone(),
        None => headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<Authority>().ok())
            .ok_or_else(|| ProxyError::Handler("request names no target host".into()))?,
    };
    Ok(format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(DEFAULT_PORT)))
}

fn origin_form(uri: &Uri) -> Result<Uri, ProxyError> {
    let path = uri.path_and_query().map_or("/", |path| path.as_str());
    path.parse().map_err(|e: http::uri::InvalidUri| ProxyError::Handler(Box::new(e)))
}

/// Socket read timeouts surface as `WouldBlock` on some platforms.
fn timed_out(e: io::Error) -> io::Error {
    if e.kind() == io::ErrorKind::WouldBlock { io::Error::new(io::ErrorKind::TimedOut, e) } else { e }
}
