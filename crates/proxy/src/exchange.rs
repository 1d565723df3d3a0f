//! One request/response exchange on a client connection.
//!
//! A worker pulling a connection off the queue runs [`Exchange::serve`] once: parse one
//! request head, run the request body through the pipeline into the handler, send the
//! handler's response through the pipeline back to the client, then decide whether the
//! connection goes back to the queue.

use std::error::Error;
use std::io;
use std::io::Write;
use std::sync::Arc;

use bytes::BytesMut;
use http::header::{CONNECTION, EXPECT};
use http::{HeaderValue, Method, Response, StatusCode, Uri, Version};
use intercept_http::codec::{PayloadDecoder, RequestHeadDecoder, ResponseHeadEncoder};
use intercept_http::io::{FramedReader, PayloadReader, PayloadWriter, TrailerSlot};
use intercept_http::protocol::headers::{has_close_directive, response_payload_size};
use intercept_http::protocol::{ParseError, PayloadSize, RequestHeader, ResponseHead};
use tokio_util::codec::Encoder;
use tracing::{debug, info, trace, warn};

use crate::ProxyError;
use crate::body::Body;
use crate::config::ProxyConfig;
use crate::connection::{Connection, ConnectionReader};
use crate::filter::Direction;
use crate::handler::{DefaultErrorResponder, ErrorResponder, RequestHandler, status_for_error};
use crate::headers::{X_INTERCEPT_BYPASS, strip_hop_by_hop};
use crate::pipeline::{BodyPipeline, MessageContext, PreparedBody};
use crate::pool::{ConnectionService, ExchangeOutcome};
use crate::tunnel::TunnelHandler;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const CLOSE_VALUE: HeaderValue = HeaderValue::from_static("close");
const KEEP_ALIVE_VALUE: HeaderValue = HeaderValue::from_static("keep-alive");

/// What the response of an exchange is sent for.
struct ResponseTarget<'a> {
    uri: &'a Uri,
    head_request: bool,
    client_version: Version,
    bypass: bool,
    /// The client asked to close, or its request body was not read cleanly
    close: bool,
}

/// The [`ConnectionService`] of the proxy.
pub struct Exchange {
    config: Arc<ProxyConfig>,
    pipeline: BodyPipeline,
    handler: Arc<dyn RequestHandler>,
    tunnel: Option<Arc<dyn TunnelHandler>>,
    error_responder: Arc<dyn ErrorResponder>,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("pipeline", &self.pipeline)
            .field("tunnel", &self.tunnel.is_some())
            .finish_non_exhaustive()
    }
}

impl Exchange {
    pub fn new(config: Arc<ProxyConfig>, pipeline: BodyPipeline, handler: Arc<dyn RequestHandler>) -> Self {
        Self { config, pipeline, handler, tunnel: None, error_responder: Arc::new(DefaultErrorResponder) }
    }

    /// Serves CONNECT requests with `tunnel`; without one they are refused with 405.
    pub fn with_tunnel(mut self, tunnel: Arc<dyn TunnelHandler>) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    pub fn with_error_responder(mut self, error_responder: Arc<dyn ErrorResponder>) -> Self {
        self.error_responder = error_responder;
        self
    }

    /// Runs one exchange after the request head was parsed.
    ///
    /// Returns whether the connection may carry another request.
    fn exchange(
        &self,
        connection: &Arc<Connection>,
        mut header: RequestHeader,
        payload_size: PayloadSize,
        framed: &mut FramedReader<ConnectionReader>,
    ) -> Result<bool, ProxyError> {
        let token = connection.token().0;
        let client_version = header.version();
        let request_close = has_close_directive(header.headers(), client_version);
        let bypass = header.headers_mut().remove(X_INTERCEPT_BYPASS).is_some();
        strip_hop_by_hop(header.headers_mut());

        let uri = header.uri().clone();
        let head_request = header.method() == Method::HEAD;
        debug!(token, method = %header.method(), uri = %uri, ?payload_size, bypass, "request received");

        if expects_continue(&header) {
            if client_version == Version::HTTP_11 && !payload_size.is_empty() {
                let mut writer = connection.writer();
                writer.write_all(CONTINUE)?;
                writer.flush()?;
                trace!(token, "sent 100 continue");
            }
            header.headers_mut().remove(EXPECT);
        }

        let trailers = TrailerSlot::new();
        let decoder = PayloadDecoder::with_max_chunk_size(payload_size, self.config.max_chunk_size);
        let (result, drained) = {
            let mut raw = PayloadReader::with_trailer_slot(&mut *framed, decoder, trailers.clone());
            let context = MessageContext { direction: Direction::Request, uri: &uri, bypass };
            let PreparedBody { reader, .. } = self.pipeline.prepare(&context, header.headers_mut(), payload_size, Box::new(&mut raw))?;

            let mut request = header.body(Body::new(reader));
            request.extensions_mut().insert(trailers);
            let result = self.handler.handle(request);

            // the handler may leave the body unread, the next request starts after it
            (result, raw.drain())
        };

        let mut close = request_close;
        if let Err(e) = &drained {
            debug!(token, cause = %e, "request body not read cleanly, closing after the response");
            close = true;
        }

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let status = match &drained {
                    Err(d) if d.kind() == io::ErrorKind::InvalidData => StatusCode::BAD_REQUEST,
                    _ => status_for_error(&e),
                };
                warn!(token, uri = %uri, status = status.as_u16(), cause = %e, "request handler failed");
                self.error_responder.respond(status, Some(&*e))
            }
        };

        let target = ResponseTarget { uri: &uri, head_request, client_version, bypass, close };
        self.send_response(connection, response, &target)
    }

    fn send_response(&self, connection: &Arc<Connection>, response: Response<Body<'static>>, target: &ResponseTarget<'_>) -> Result<bool, ProxyError> {
        let token = connection.token().0;
        let (mut parts, mut body) = response.into_parts();

        let framing = match response_payload_size(parts.status, target.head_request, &parts.headers) {
            Ok(framing) => framing,
            Err(e) => {
                warn!(token, status = parts.status.as_u16(), cause = %e, "response framing is invalid");
                let (error_parts, error_body) = self.error_responder.respond(StatusCode::BAD_GATEWAY, Some(&e)).into_parts();
                (parts, body) = (error_parts, error_body);
                response_payload_size(parts.status, target.head_request, &parts.headers).unwrap_or(PayloadSize::UntilEof)
            }
        };
        let response_close = has_close_directive(&parts.headers, parts.version);

        let trailers = TrailerSlot::new();
        let stream = body.take_stream().unwrap_or_else(|| Box::new(io::empty()));
        let decoder = PayloadDecoder::with_max_chunk_size(framing, self.config.max_chunk_size);
        let raw = PayloadReader::with_trailer_slot(FramedReader::with_capacity(stream, self.config.buffer_size), decoder, trailers.clone());

        let context = MessageContext { direction: Direction::Response, uri: target.uri, bypass: target.bypass };
        let prepared = match self.pipeline.prepare(&context, &mut parts.headers, framing, Box::new(raw)) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(token, uri = %target.uri, cause = %e, "can't read response body");
                self.send_error(connection, StatusCode::BAD_GATEWAY, Some(&e));
                return Ok(false);
            }
        };

        let mut close = target.close || response_close;
        let payload_size = match prepared.payload_size {
            // no chunked coding for HTTP/1.0 clients, the end of the body is the end of the connection
            PayloadSize::Chunked | PayloadSize::UntilEof if target.client_version == Version::HTTP_10 => {
                close = true;
                PayloadSize::UntilEof
            }
            PayloadSize::UntilEof => PayloadSize::Chunked,
            size => size,
        };

        strip_hop_by_hop(&mut parts.headers);
        if close {
            parts.headers.insert(CONNECTION, CLOSE_VALUE);
        } else if target.client_version == Version::HTTP_10 {
            parts.headers.insert(CONNECTION, KEEP_ALIVE_VALUE);
        }
        parts.version = Version::HTTP_11;
        let status = parts.status;

        let mut head = BytesMut::new();
        ResponseHeadEncoder.encode((ResponseHead::from_parts(parts, ()), payload_size), &mut head)?;

        let mut writer = connection.writer();
        writer.write_all(&head)?;
        let mut body_writer = PayloadWriter::with_block_size(writer, payload_size, self.config.filter_block_size);
        let mut reader = prepared.reader;
        let copied = io::copy(&mut reader, &mut body_writer)?;
        body_writer.finish(trailers.take().unwrap_or_default())?;

        debug!(token, status = status.as_u16(), ?payload_size, copied, close, "response sent");
        Ok(!close)
    }

    /// Writes a response that ends the connection, for requests that never reach a handler.
    fn send_error(&self, connection: &Arc<Connection>, status: StatusCode, error: Option<&(dyn Error + 'static)>) {
        let response = self.error_responder.respond(status, error);
        if let Err(e) = write_final(connection, response) {
            debug!(token = connection.token().0, status = status.as_u16(), cause = %e, "can't send error response");
        }
    }

    fn open_tunnel(&self, connection: &Arc<Connection>, header: RequestHeader, framed: FramedReader<ConnectionReader>) -> ExchangeOutcome {
        let token = connection.token().0;
        let Some(tunnels) = &self.tunnel else {
            debug!(token, uri = %header.uri(), "CONNECT refused, no tunnel handler");
            self.send_error(connection, StatusCode::METHOD_NOT_ALLOWED, None);
            return ExchangeOutcome::Close;
        };

        let tunnel = match tunnels.open(&header) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                let status = status_for_error(&e);
                warn!(token, uri = %header.uri(), status = status.as_u16(), cause = %e, "can't open tunnel");
                self.send_error(connection, status, Some(&*e));
                return ExchangeOutcome::Close;
            }
        };

        let mut writer = connection.writer();
        if let Err(e) = writer.write_all(CONNECTION_ESTABLISHED).and_then(|()| writer.flush()) {
            debug!(token, cause = %e, "can't confirm tunnel");
            return ExchangeOutcome::Close;
        }

        // bytes the client sent right after the head belong to the tunnel
        let leftover = framed.into_remaining();
        connection.delegate(move |stream, unread| tunnel.run(stream, unread));
        connection.unread(leftover);
        connection.close_read();
        if let Err(e) = connection.close_write() {
            debug!(token, cause = %e, "flush before delegation failed");
        }
        info!(token, uri = %header.uri(), "tunnel established");
        ExchangeOutcome::Delegated
    }
}

impl ConnectionService for Exchange {
    fn serve(&self, connection: &Arc<Connection>) -> ExchangeOutcome {
        let token = connection.token().0;
        let mut framed = FramedReader::with_capacity(connection.reader(), self.config.buffer_size);

        let (header, payload_size) = match framed.decode(&mut RequestHeadDecoder) {
            Ok(Some(head)) => head,
            Ok(None) => {
                trace!(token, "client closed the connection");
                return ExchangeOutcome::Close;
            }
            Err(e @ (ParseError::Io { .. } | ParseError::UnexpectedEof)) => {
                debug!(token, cause = %e, "can't read request head");
                return ExchangeOutcome::Close;
            }
            Err(e) => {
                warn!(token, cause = %e, "malformed request head");
                self.send_error(connection, StatusCode::BAD_REQUEST, Some(&e));
                return ExchangeOutcome::Close;
            }
        };

        if header.is_connect() {
            return self.open_tunnel(connection, header, framed);
        }

        match self.exchange(connection, header, payload_size, &mut framed) {
            Ok(true) => {
                connection.unread(framed.into_remaining());
                ExchangeOutcome::KeepAlive
            }
            Ok(false) => ExchangeOutcome::Close,
            Err(e) => {
                debug!(token, cause = %e, "exchange failed");
                ExchangeOutcome::Close
            }
        }
    }
}

fn expects_continue(header: &RequestHeader) -> bool {
    header.headers().get(EXPECT).is_some_and(|value| {
        let value = value.as_bytes();
        value.len() >= 4 && value[..4].eq_ignore_ascii_case(b"100-")
    })
}

fn write_final(connection: &Arc<Connection>, response: Response<Body<'static>>) -> Result<(), ProxyError> {
    let (mut parts, mut body) = response.into_parts();
    let content = body.read_all()?;

    strip_hop_by_hop(&mut parts.headers);
    parts.headers.insert(CONNECTION, CLOSE_VALUE);
    parts.version = Version::HTTP_11;
    let payload_size = if content.is_empty() { PayloadSize::Empty } else { PayloadSize::Length(content.len() as u64) };

    let mut buffer = BytesMut::new();
    ResponseHeadEncoder.encode((ResponseHead::from_parts(parts, ()), payload_size), &mut buffer)?;
    buffer.extend_from_slice(&content);

    let mut writer = connection.writer();
    writer.write_all(&buffer)?;
    writer.flush()?;
    Ok(())
}
