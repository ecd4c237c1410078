//! End-to-end tests over real TCP connections.
//!
//! Each test starts an [`HttpServer`] on an ephemeral port and talks raw
//! HTTP/1.1 to it, so the codec, the connection state machine and the
//! response writer are exercised together.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use brrtengine::error_handler::{ErrorHandler, ErrorHandlerChain};
use brrtengine::response::{HandlerResponse, Outcome};
use brrtengine::router::RouteTable;
use brrtengine::server::{AppService, HttpServer, ServerHandle};
use common::engine::{service_with, test_config};
use common::wire::{parse_responses, RawResponse};
use http::Method;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

struct NotFoundText;

impl ErrorHandler for NotFoundText {
    fn on_no_route(&self, _method: &Method, _path: &str) -> Option<HandlerResponse> {
        Some(HandlerResponse::not_found().with_text("not found"))
    }
}

/// Server fixture; stops the server when dropped.
struct TestServer {
    service: AppService,
    handle: Option<ServerHandle>,
    addr: SocketAddr,
}

impl TestServer {
    fn start() -> Self {
        let routes = RouteTable::new()
            .route(Method::POST, "/xml/post1", |ctx| {
                let body = ctx
                    .parsed_body()
                    .map_err(anyhow::Error::from)?
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(HandlerResponse::ok().render(body).into())
            })
            .route(Method::GET, "/hello", |ctx| {
                let name = ctx.query_param("name").unwrap_or("world").to_string();
                Ok(HandlerResponse::ok().with_text(format!("hello {name}")).into())
            })
            .route(Method::GET, "/async", |_ctx| {
                Ok(Outcome::deferred(|| {
                    may::coroutine::sleep(Duration::from_millis(20));
                    Ok(HandlerResponse::ok().with_text("async"))
                }))
            })
            .route(Method::GET, "/async/fail", |_ctx| {
                Ok(Outcome::deferred(|| Err(anyhow::anyhow!("async boom"))))
            })
            .route(Method::POST, "/echo", |ctx| {
                let mut raw = String::new();
                if let Some(mut body) = ctx.raw_body().map_err(anyhow::Error::from)? {
                    body.read_to_string(&mut raw).map_err(anyhow::Error::from)?;
                }
                Ok(HandlerResponse::ok().with_text(raw).into())
            });
        let chain = Arc::new(ErrorHandlerChain::new());
        chain.register(Arc::new(NotFoundText));
        let service = service_with(routes, chain, test_config());
        let handle = HttpServer(service.clone()).start("127.0.0.1:0").unwrap();
        handle.wait_ready().unwrap();
        let addr = handle.addr();
        Self {
            service,
            handle: Some(handle),
            addr,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
    }
}

/// Length of the first complete response in `buf`, if there is one.
fn complete_len(buf: &[u8]) -> Option<usize> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut headers);
    let httparse::Status::Complete(head) = resp.parse(buf).ok()? else {
        return None;
    };
    let length = resp
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .and_then(|h| std::str::from_utf8(h.value).ok()?.parse::<usize>().ok())?;
    (buf.len() >= head + length).then_some(head + length)
}

/// Read until `count` length-delimited responses have arrived.
fn read_responses(stream: &mut TcpStream, count: usize) -> Vec<RawResponse> {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 4096];
    loop {
        let mut offset = 0;
        let mut seen = 0;
        while let Some(len) = complete_len(&buf[offset..]) {
            offset += len;
            seen += 1;
        }
        if seen >= count {
            return parse_responses(&buf[..offset]);
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "server closed after {seen} responses");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Read until the server closes the connection.
fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    buf
}

#[test]
fn test_xml_post_round_trip() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(
            b"POST /xml/post1 HTTP/1.1\r\nHost: test\r\nContent-Type: text/xml\r\n\
              Content-Length: 23\r\n\r\n<element>name</element>",
        )
        .unwrap();

    let raw = read_responses(&mut stream, 1).remove(0);
    assert_eq!(raw.status, 200);
    assert_eq!(raw.header("content-type"), Some("text/xml"));
    let body = raw.body_text();
    assert!(body.contains("<element>") && body.contains("name") && body.contains("</element>"));
}

#[test]
fn test_missing_route_over_tcp() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(b"GET /missing HTTP/1.1\r\nHost: test\r\n\r\n")
        .unwrap();

    let raw = read_responses(&mut stream, 1).remove(0);
    assert_eq!(raw.status, 404);
    assert_eq!(raw.body_text(), "not found");
}

#[test]
fn test_pipelined_requests_answer_in_order() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(
            b"GET /hello?name=a HTTP/1.1\r\n\r\n\
              GET /async HTTP/1.1\r\n\r\n\
              GET /hello?name=b HTTP/1.1\r\n\r\n",
        )
        .unwrap();

    let bodies: Vec<String> = read_responses(&mut stream, 3)
        .iter()
        .map(RawResponse::body_text)
        .collect();
    assert_eq!(bodies, vec!["hello a", "async", "hello b"]);
}

#[test]
fn test_async_fault_over_tcp_keeps_connection_usable() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(b"GET /async/fail HTTP/1.1\r\n\r\n")
        .unwrap();
    let raw = read_responses(&mut stream, 1).remove(0);
    assert_eq!(raw.status, 500);
    assert_eq!(raw.body_text(), "async boom");

    stream.write_all(b"GET /hello HTTP/1.1\r\n\r\n").unwrap();
    let raw = read_responses(&mut stream, 1).remove(0);
    assert_eq!(raw.body_text(), "hello world");
}

#[test]
fn test_chunked_request_body() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(
            b"POST /echo HTTP/1.1\r\nContent-Type: application/octet-stream\r\n\
              Transfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .unwrap();

    let raw = read_responses(&mut stream, 1).remove(0);
    assert_eq!(raw.body_text(), "hello world");
}

#[test]
fn test_body_split_across_writes() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 10\r\n\r\n01234")
        .unwrap();
    stream.flush().unwrap();
    std::thread::sleep(Duration::from_millis(20));
    stream.write_all(b"56789").unwrap();

    let raw = read_responses(&mut stream, 1).remove(0);
    assert_eq!(raw.body_text(), "0123456789");
}

#[test]
fn test_connection_close_is_honored() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();

    let bytes = read_to_close(&mut stream);
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.ends_with("hello world"), "{text}");
}

#[test]
fn test_malformed_request_gets_bad_request_and_close() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: nope\r\n\r\n")
        .unwrap();

    let bytes = read_to_close(&mut stream);
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.starts_with("HTTP/1.1 400 Bad Request"), "{text}");
}

#[test]
fn test_http10_request_closes_after_response() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream.write_all(b"GET /hello HTTP/1.0\r\n\r\n").unwrap();

    let bytes = read_to_close(&mut stream);
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.starts_with("HTTP/1.0 200 OK\r\n"), "{text}");
    assert!(!text.to_ascii_lowercase().contains("content-length"));
}

#[test]
fn test_requests_are_cleaned_up() {
    let server = TestServer::start();
    let mut stream = server.connect();
    for _ in 0..3 {
        stream
            .write_all(b"POST /echo HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nhi")
            .unwrap();
        let raw = read_responses(&mut stream, 1).remove(0);
        assert_eq!(raw.body_text(), "hi");
    }
    // cleanup runs right after the response is flushed
    let stats = server.service.stats();
    for _ in 0..200 {
        if stats.cleanups() == 3 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(stats.requests_started(), 3);
    assert_eq!(stats.cleanups(), 3);
    assert_eq!(stats.live_decoders(), 0);
}
