use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{Request, Response};
use indoc::indoc;
use intercept_proxy::body::Body;
use intercept_proxy::config::ProxyConfig;
use intercept_proxy::filter::{FilterRegistry, FnFilter};
use intercept_proxy::handler::{RequestHandler, make_handler};
use intercept_proxy::tunnel::SpliceTunnelHandler;
use intercept_proxy::{BoxError, ProxyServer, ServerHandle};

fn config() -> ProxyConfig {
    ProxyConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        worker_min: 2,
        io_timeout_ms: 5_000,
        filter_block_size: 64,
        ..ProxyConfig::default()
    }
}

struct Proxy(Option<ServerHandle>);

impl Proxy {
    fn start(handler: impl RequestHandler + 'static, filters: FilterRegistry) -> Self {
        let server = ProxyServer::builder().config(config()).filters(filters).handler(handler).build().unwrap();
        Proxy(Some(server.start().unwrap()))
    }

    fn connect(&self) -> TcpStream {
        let addr = self.0.as_ref().unwrap().local_addr();
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.shutdown();
            let _ = handle.join();
        }
    }
}

fn html_handler() -> impl RequestHandler {
    make_handler(|_request: Request<Body<'_>>| {
        Response::builder()
            .header(CONTENT_TYPE, "text/html")
            .header(CONTENT_LENGTH, 14)
            .body(Body::from("<html>A</html>"))
    })
}

fn text_handler(body: &'static str) -> impl RequestHandler {
    make_handler(move |_request: Request<Body<'_>>| {
        Response::builder().header(CONTENT_TYPE, "text/plain").header(CONTENT_LENGTH, body.len()).body(Body::from(body))
    })
}

fn replace_a_with_b() -> FnFilter {
    FnFilter::new("a-to-b", ".*", "^text/html$", |context| {
        context.registration().add_text_filter(|line: String| -> Result<String, BoxError> { Ok(line.replace('A', "B")) });
        Ok(())
    })
    .unwrap()
}

fn read_to_close(mut stream: TcpStream) -> String {
    let mut output = Vec::new();
    stream.read_to_end(&mut output).unwrap();
    String::from_utf8(output).unwrap()
}

/// Reads one response delimited by Content-Length, returns head and body.
fn read_response(stream: &mut TcpStream) -> (String, String) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length: "))
        .map_or(0, |value| value.trim().parse::<usize>().unwrap());
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).unwrap();
    (head, String::from_utf8(body).unwrap())
}

#[test]
fn filtered_html_is_rechunked() {
    let filters = FilterRegistry::new();
    filters.register(replace_a_with_b());
    let proxy = Proxy::start(html_handler(), filters);

    let mut stream = proxy.connect();
    stream.write_all(b"GET /x HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n").unwrap();
    let output = read_to_close(stream);

    assert!(output.starts_with("HTTP/1.1 200 OK\r\n"), "{output}");
    assert!(output.contains("transfer-encoding: chunked\r\n"));
    assert!(output.contains("x-original-content-length: 14\r\n"));
    assert!(output.contains("x-intercept-filters: a-to-b\r\n"));
    assert!(!output.contains("\r\ncontent-length"));
    assert!(output.ends_with("\r\n\r\ne\r\n<html>B</html>\r\n0\r\n\r\n"), "{output}");
}

#[test]
fn forwards_through_origin_with_filter() {
    let origin = TcpListener::bind("127.0.0.1:0").unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_thread = thread::spawn(move || {
        let (mut stream, _) = origin.accept().unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 512];
        while !request.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let response = indoc! {"
            HTTP/1.1 200 OK\r
            Content-Type: text/html; charset=utf-8\r
            Content-Length: 14\r
            Connection: close\r
            \r
            <html>A</html>"};
        stream.write_all(response.as_bytes()).unwrap();
        String::from_utf8(request).unwrap()
    });

    let filters = FilterRegistry::new();
    filters.register(replace_a_with_b());
    let server = ProxyServer::builder().config(config()).filters(filters).build().unwrap();
    let proxy = Proxy(Some(server.start().unwrap()));

    let mut stream = proxy.connect();
    let request = format!("GET http://{origin_addr}/page HTTP/1.1\r\nHost: {origin_addr}\r\nProxy-Connection: keep-alive\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).unwrap();
    let output = read_to_close(stream);

    assert!(output.ends_with("e\r\n<html>B</html>\r\n0\r\n\r\n"), "{output}");
    let forwarded = origin_thread.join().unwrap();
    assert!(forwarded.starts_with("GET /page HTTP/1.1\r\n"), "{forwarded}");
    assert!(!forwarded.contains("proxy-connection"));
}

#[test]
fn keep_alive_table() {
    let handler = make_handler(|request: Request<Body<'_>>| {
        let mut builder = Response::builder().header(CONTENT_LENGTH, 2);
        if request.uri().path() == "/close" {
            builder = builder.header(CONNECTION, "close");
        }
        builder.body(Body::from("ok"))
    });
    let proxy = Proxy::start(handler, FilterRegistry::new());

    for request_close in [false, true] {
        for response_close in [false, true] {
            let mut stream = proxy.connect();
            let path = if response_close { "/close" } else { "/keep" };
            let connection = if request_close { "Connection: close\r\n" } else { "" };
            stream.write_all(format!("GET {path} HTTP/1.1\r\nHost: h\r\n{connection}\r\n").as_bytes()).unwrap();

            let (head, body) = read_response(&mut stream);
            assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
            assert_eq!(body, "ok");
            let announced_close = head.contains("connection: close\r\n");

            // a second request is only answered on a kept connection
            let _ = stream.write_all(b"GET /keep HTTP/1.1\r\nHost: h\r\n\r\n");
            let mut buf = [0u8; 64];
            let closed = !matches!(stream.read(&mut buf), Ok(n) if n > 0);

            let expected = request_close || response_close;
            assert_eq!(closed, expected, "request close {request_close}, response close {response_close}");
            assert_eq!(announced_close, expected);
        }
    }
}

#[test]
fn half_closed_client_still_gets_response() {
    let echo = make_handler(|request: Request<Body<'_>>| {
        let content = request.into_body().read_all()?;
        Response::builder().header(CONTENT_LENGTH, content.len()).body(Body::from(content)).map_err(BoxError::from)
    });
    let proxy = Proxy::start(echo, FilterRegistry::new());

    let mut stream = proxy.connect();
    stream.write_all(b"POST /echo HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello").unwrap();
    stream.shutdown(Shutdown::Write).unwrap();

    let output = read_to_close(stream);
    assert!(output.starts_with("HTTP/1.1 200 OK\r\n"), "{output}");
    assert!(output.ends_with("\r\n\r\nhello"));
}

#[test]
fn readonly_filters_keep_content_length() {
    let filters = FilterRegistry::new();
    filters.register(
        FnFilter::new("watch", ".*", "^text/plain$", |context| {
            context.registration().add_byte_observer(|_: &[u8]| -> Result<(), BoxError> { Ok(()) });
            context.registration().add_text_observer(|_: &str| -> Result<(), BoxError> { Ok(()) });
            Ok(())
        })
        .unwrap(),
    );
    let proxy = Proxy::start(text_handler("line one\nline two\n"), filters);

    let mut stream = proxy.connect();
    stream.write_all(b"GET /doc HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.contains("content-length: 18\r\n"), "{head}");
    assert!(!head.contains("transfer-encoding"));
    assert!(!head.contains("x-original-content-length"));
    assert!(head.contains("x-intercept-filters: watch\r\n"));
    assert_eq!(body, "line one\nline two\n");
}

#[test]
fn editing_byte_filter_drops_content_length() {
    let filters = FilterRegistry::new();
    filters.register(
        FnFilter::new("upper", ".*", ".*", |context| {
            context.registration().add_byte_filter(|block: Bytes| -> Result<Bytes, BoxError> { Ok(Bytes::from(block.to_ascii_uppercase())) });
            Ok(())
        })
        .unwrap(),
    );
    let proxy = Proxy::start(text_handler("abc"), filters);

    let mut stream = proxy.connect();
    stream.write_all(b"GET /doc HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n").unwrap();
    let output = read_to_close(stream);
    assert!(output.contains("transfer-encoding: chunked\r\n"), "{output}");
    assert!(output.contains("x-original-content-length: 3\r\n"));
    assert!(!output.contains("\r\ncontent-length"));
    assert!(output.ends_with("3\r\nABC\r\n0\r\n\r\n"));
}

#[test]
fn unmatched_message_passes_identically() {
    let filters = FilterRegistry::new();
    filters.register(replace_a_with_b());
    let proxy = Proxy::start(text_handler("A plain A"), filters);

    let mut stream = proxy.connect();
    stream.write_all(b"GET /doc HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.contains("content-length: 9\r\n"), "{head}");
    assert!(!head.contains("x-intercept-filters"));
    assert_eq!(body, "A plain A");
}

#[test]
fn bypass_header_skips_filters() {
    let filters = FilterRegistry::new();
    filters.register(replace_a_with_b());
    let proxy = Proxy::start(html_handler(), filters);

    let mut stream = proxy.connect();
    stream.write_all(b"GET /x HTTP/1.1\r\nHost: h\r\nX-Intercept-Bypass: 1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.contains("content-length: 14\r\n"), "{head}");
    assert_eq!(body, "<html>A</html>");
}

#[test]
fn request_filter_edits_body_seen_by_handler() {
    let filters = FilterRegistry::new();
    filters.register(
        FnFilter::new("request-upper", "^/submit$", ".*", |context| {
            context.registration().add_byte_filter(|block: Bytes| -> Result<Bytes, BoxError> { Ok(Bytes::from(block.to_ascii_uppercase())) });
            Ok(())
        })
        .unwrap()
        .for_requests(),
    );
    let handler = make_handler(|request: Request<Body<'_>>| {
        let chunked = request.headers().get(TRANSFER_ENCODING).is_some_and(|value| value == "chunked");
        let content = request.into_body().read_all()?;
        let text = format!("{chunked}:{}", String::from_utf8_lossy(&content));
        Response::builder().header(CONTENT_LENGTH, text.len()).body(Body::from(text)).map_err(BoxError::from)
    });
    let proxy = Proxy::start(handler, filters);

    let mut stream = proxy.connect();
    stream.write_all(b"POST /submit HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello").unwrap();
    let (_, body) = read_response(&mut stream);
    assert_eq!(body, "true:HELLO");
}

#[test]
fn trailers_reach_the_client() {
    let handler = make_handler(|_request: Request<Body<'_>>| {
        Response::builder()
            .header(TRANSFER_ENCODING, "chunked")
            .body(Body::from("5\r\nhello\r\n0\r\nx-checksum: 42\r\n\r\n"))
    });
    let proxy = Proxy::start(handler, FilterRegistry::new());

    let mut stream = proxy.connect();
    stream.write_all(b"GET /t HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n").unwrap();
    let output = read_to_close(stream);
    assert!(output.ends_with("\r\n\r\n5\r\nhello\r\n0\r\nx-checksum: 42\r\n\r\n"), "{output}");
}

#[test]
fn connect_tunnel_relays_bytes() {
    let origin = TcpListener::bind("127.0.0.1:0").unwrap();
    let origin_addr = origin.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = origin.accept().unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        stream.write_all(&buf).unwrap();
    });

    let config = config();
    let tunnel = SpliceTunnelHandler::new(&config);
    let server = ProxyServer::builder().config(config).handler(text_handler("unused")).tunnel(tunnel).build().unwrap();
    let proxy = Proxy(Some(server.start().unwrap()));

    let mut stream = proxy.connect();
    stream.write_all(format!("CONNECT {origin_addr} HTTP/1.1\r\nHost: {origin_addr}\r\n\r\nping").as_bytes()).unwrap();

    let established = b"HTTP/1.1 200 Connection Established\r\n\r\n";
    let mut head = vec![0u8; established.len()];
    stream.read_exact(&mut head).unwrap();
    assert_eq!(&head[..], &established[..]);

    let mut echoed = [0u8; 4];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"ping");
}
