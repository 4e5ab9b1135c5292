//! End-to-end HTTP/1.1 behaviour over real sockets.

use std::io::{Read, Write};
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::{HeaderValue, StatusCode};

use harbor::config::{CompressionConfig, DecompressionConfig, DecompressionLimit, ServerConfig};
use harbor::http::{responder_fn, BoxError, Request, Response, ResponseBody};
use harbor::pipeline::{Context, Handler, Inbound, Outbound, PipelineError};

mod common;
use common::{start_server, test_config, RawClient};

/// Routes used by every test in this file.
async fn app(request: Request) -> Result<Response, BoxError> {
    let path = request.uri().path().to_string();
    let response = match path.as_str() {
        "/" => Response::ok("hello"),
        "/echo" => Response::ok(request.into_body()),
        "/fail" => return Err("responder failed".into()),
        "/stream" => Response::ok(ResponseBody::stream(None, |mut writer| async move {
            for part in ["one ", "two ", "three"] {
                if writer.write_bytes(part).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let _ = writer.end().await;
        })),
        "/slow-stream" => Response::ok(ResponseBody::stream(None, |mut writer| async move {
            if writer.write_bytes("first ").await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            if writer.write_bytes("second").await.is_err() {
                return;
            }
            let _ = writer.end().await;
        })),
        "/text" => Response::ok("compress me ".repeat(64)),
        "/upgrade" => Response::switching_protocols(HeaderValue::from_static("echo"), || {
            vec![Box::new(Echo) as Box<dyn Handler>]
        }),
        other if other.starts_with("/delay/") => {
            let millis: u64 = other["/delay/".len()..].parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Response::ok(other.to_string())
        }
        _ => Response::new(StatusCode::NOT_FOUND),
    };
    Ok(response)
}

/// Echoes raw bytes once the connection has switched protocols.
struct Echo;

impl Handler for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn inbound(&mut self, ctx: &mut Context<'_>, msg: Inbound) {
        match msg {
            Inbound::Bytes(bytes) if &bytes[..] == b"boom" => {
                ctx.fire_error(PipelineError::Upgraded("echo failed".into()))
            }
            Inbound::Bytes(bytes) => ctx.fire_outbound(Outbound::Bytes(bytes)),
            Inbound::Eof => ctx.close(),
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_malformed_request_gets_bare_400_and_close() {
    let (server, addr) = start_server(test_config(), responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    client.send(b"GET / HTTP/9.9\r\n\r\n").await;
    let received = client.read_to_end().await;
    assert_eq!(
        received,
        b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_request_after_valid_one_is_answered_in_order() {
    let (server, addr) = start_server(test_config(), responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    client
        .send(b"GET /delay/50 HTTP/1.1\r\nHost: a\r\n\r\nGET / HTTP/9.9\r\n\r\n")
        .await;

    let response = client.read_response().await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_str(), "/delay/50");
    assert_eq!(response.header("connection"), None);

    assert_eq!(
        client.read_to_end().await,
        b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_request_during_streaming_response_gets_no_status_line() {
    let (server, addr) = start_server(test_config(), responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    client.send(b"GET /slow-stream HTTP/1.1\r\nHost: a\r\n\r\n").await;
    let head = client.read_head().await;
    assert_eq!(head.status, 200);
    assert_eq!(head.header("transfer-encoding"), Some("chunked"));

    // the response above is still being written
    client.send(b"GET / HTTP/9.9\r\n\r\n").await;

    let rest = client.read_to_end().await;
    let rest = String::from_utf8(rest).unwrap();
    assert!(!rest.contains("HTTP/1.1"), "{}", rest);
    assert!(rest.contains("second"), "{}", rest);
    assert!(rest.ends_with("0\r\n\r\n"), "{}", rest);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_keep_alive_serves_sequential_requests() {
    let (server, addr) = start_server(test_config(), responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    for _ in 0..3 {
        client.send(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        let response = client.read_response().await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body_str(), "hello");
        assert_eq!(response.header("content-length"), Some("5"));
        assert!(response.header("date").is_some());
    }

    client
        .send(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await;
    let response = client.read_response().await;
    assert_eq!(response.header("connection"), Some("close"));
    assert!(client.read_to_end().await.is_empty());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pipelined_responses_keep_request_order() {
    let (server, addr) = start_server(test_config(), responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    // the first request finishes last
    client
        .send(
            b"GET /delay/80 HTTP/1.1\r\nHost: a\r\n\r\n\
              GET /delay/40 HTTP/1.1\r\nHost: a\r\n\r\n\
              GET /delay/0 HTTP/1.1\r\nHost: a\r\n\r\n",
        )
        .await;

    let mut bodies = Vec::new();
    for _ in 0..3 {
        bodies.push(client.read_response().await.body_str().to_string());
    }
    assert_eq!(bodies, vec!["/delay/80", "/delay/40", "/delay/0"]);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pipelining_disabled_still_answers_in_order() {
    let config = ServerConfig {
        supports_pipelining: false,
        ..test_config()
    };
    let (server, addr) = start_server(config, responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    client
        .send(
            b"GET /delay/40 HTTP/1.1\r\nHost: a\r\n\r\n\
              GET /delay/0 HTTP/1.1\r\nHost: a\r\n\r\n",
        )
        .await;
    assert_eq!(client.read_response().await.body_str(), "/delay/40");
    assert_eq!(client.read_response().await.body_str(), "/delay/0");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_chunked_request_body() {
    let (server, addr) = start_server(test_config(), responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    client
        .send(
            b"POST /echo HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .await;
    let response = client.read_response().await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_str(), "hello world");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expect_continue_is_answered() {
    let (server, addr) = start_server(test_config(), responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    client
        .send(b"POST /echo HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n")
        .await;
    let interim = client.read_head().await;
    assert_eq!(interim.status, 100);

    client.send(b"ping").await;
    let response = client.read_response().await;
    assert_eq!(response.body_str(), "ping");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_streaming_response_is_chunked() {
    let (server, addr) = start_server(test_config(), responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    client.send(b"GET /stream HTTP/1.1\r\nHost: a\r\n\r\n").await;
    let response = client.read_response().await;
    assert_eq!(response.header("transfer-encoding"), Some("chunked"));
    assert_eq!(response.header("content-length"), None);
    assert_eq!(response.body_str(), "one two three");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_head_response_has_no_body() {
    let (server, addr) = start_server(test_config(), responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    client
        .send(b"HEAD / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n")
        .await;
    let head = client.read_head().await;
    assert_eq!(head.status, 200);
    assert_eq!(head.header("content-length"), Some("5"));
    assert!(client.read_to_end().await.is_empty());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_http10_closes_after_response() {
    let (server, addr) = start_server(test_config(), responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    client.send(b"GET / HTTP/1.0\r\n\r\n").await;
    let response = client.read_response().await;
    assert_eq!(response.body_str(), "hello");
    assert!(client.read_to_end().await.is_empty());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_responder_error_closes_connection() {
    let (server, addr) = start_server(test_config(), responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    client.send(b"GET /fail HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert!(client.read_to_end().await.is_empty());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_gzip_response_compression() {
    let config = ServerConfig {
        response_compression: CompressionConfig::enabled(),
        ..test_config()
    };
    let (server, addr) = start_server(config, responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    client
        .send(b"GET /text HTTP/1.1\r\nHost: a\r\nAccept-Encoding: gzip\r\n\r\n")
        .await;
    let response = client.read_response().await;
    assert_eq!(response.header("content-encoding"), Some("gzip"));
    assert_eq!(response.header("vary"), Some("accept-encoding"));

    let mut decoded = String::new();
    GzDecoder::new(&response.body[..])
        .read_to_string(&mut decoded)
        .unwrap();
    assert_eq!(decoded, "compress me ".repeat(64));

    // no Accept-Encoding, no compression
    client.send(b"GET /text HTTP/1.1\r\nHost: a\r\n\r\n").await;
    let response = client.read_response().await;
    assert_eq!(response.header("content-encoding"), None);
    assert_eq!(response.body_str(), "compress me ".repeat(64));

    server.shutdown().await.unwrap();
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn compressed_post(body: &[u8]) -> Vec<u8> {
    let mut request = format!(
        "POST /echo HTTP/1.1\r\nHost: a\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(body);
    request
}

#[tokio::test]
async fn test_request_decompression_within_limit() {
    let config = ServerConfig {
        request_decompression: DecompressionConfig::Enabled {
            limit: DecompressionLimit::Size(1024),
        },
        ..test_config()
    };
    let (server, addr) = start_server(config, responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    client.send(&compressed_post(&gzip(b"inflated payload"))).await;
    let response = client.read_response().await;
    assert_eq!(response.body_str(), "inflated payload");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_decompression_limit_closes_connection() {
    let config = ServerConfig {
        request_decompression: DecompressionConfig::Enabled {
            limit: DecompressionLimit::Size(64),
        },
        ..test_config()
    };
    let (server, addr) = start_server(config, responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    client.send(&compressed_post(&gzip(&[0u8; 4096]))).await;
    assert!(client.read_to_end().await.is_empty());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_upgrade_hands_connection_to_new_handlers() {
    let (server, addr) = start_server(test_config(), responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    // bytes after the head belong to the upgraded protocol
    client
        .send(b"GET /upgrade HTTP/1.1\r\nHost: a\r\nConnection: upgrade\r\nUpgrade: echo\r\n\r\nearly")
        .await;
    let head = client.read_head().await;
    assert_eq!(head.status, 101);
    assert_eq!(head.header("upgrade"), Some("echo"));
    assert_eq!(client.read_exact(5).await, b"early");

    client.send(b"later").await;
    assert_eq!(client.read_exact(5).await, b"later");

    // errors from the new handlers still reach close-on-error
    client.send(b"boom").await;
    assert!(client.read_to_end().await.is_empty());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_axum_router_as_responder() {
    use axum::routing::get;

    let router = axum::Router::new().route("/ping", get(|| async { "pong" }));
    let (server, addr) = start_server(test_config(), router).await;

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let response = client
        .get(format!("http://{}/ping", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "pong");

    let missing = client
        .get(format!("http://{}/missing", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_body_over_limit_is_rejected() {
    let config = ServerConfig {
        max_body_size: 8,
        ..test_config()
    };
    let (server, addr) = start_server(config, responder_fn(app)).await;

    let mut client = RawClient::connect(addr).await;
    client
        .send(b"POST /echo HTTP/1.1\r\nHost: a\r\nContent-Length: 32\r\n\r\n")
        .await;
    let response = client.read_response().await;
    assert_eq!(response.status, 400);
    assert!(client.read_to_end().await.is_empty());

    server.shutdown().await.unwrap();
}
