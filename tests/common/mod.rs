//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use harbor::config::{BindAddress, ServerConfig};
use harbor::{Responder, Server};

pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A configuration bound to an ephemeral loopback port.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        address: BindAddress::hostname("127.0.0.1", 0),
        ..ServerConfig::default()
    }
}

/// Start a server and return it with its bound TCP address.
pub async fn start_server(config: ServerConfig, responder: impl Responder) -> (Server, SocketAddr) {
    let server = Server::new(config, responder);
    let addr = server
        .start(None)
        .await
        .expect("server failed to start")
        .as_inet()
        .expect("not a TCP listener");
    (server, addr)
}

/// A scratch directory unique to this process and `name`.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("harbor-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// A response read off the wire.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).expect("body is not UTF-8")
    }
}

/// A plain TCP client that speaks just enough HTTP/1.1 to read responses.
pub struct RawClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.expect("connect failed"),
            buf: BytesMut::new(),
        }
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write failed");
    }

    pub async fn shutdown_write(&mut self) {
        self.stream.shutdown().await.expect("shutdown failed");
    }

    async fn fill(&mut self) -> usize {
        tokio::time::timeout(READ_TIMEOUT, self.stream.read_buf(&mut self.buf))
            .await
            .expect("read timed out")
            .expect("read failed")
    }

    /// Everything the server sends until it closes the connection.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        while self.fill().await > 0 {}
        self.buf.split().to_vec()
    }

    /// Exactly `n` bytes.
    pub async fn read_exact(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            assert!(self.fill().await > 0, "unexpected EOF");
        }
        self.buf.split_to(n).to_vec()
    }

    async fn read_line(&mut self) -> Vec<u8> {
        loop {
            if let Some(pos) = find(&self.buf, b"\r\n") {
                let line = self.buf.split_to(pos + 2);
                return line[..pos].to_vec();
            }
            assert!(self.fill().await > 0, "unexpected EOF");
        }
    }

    /// Status line and headers only.
    pub async fn read_head(&mut self) -> RawResponse {
        let end = loop {
            if let Some(pos) = find(&self.buf, b"\r\n\r\n") {
                break pos + 4;
            }
            assert!(self.fill().await > 0, "unexpected EOF before end of head");
        };
        let head = self.buf.split_to(end);

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Response::new(&mut headers);
        let status = parsed.parse(&head).expect("malformed response head");
        assert!(status.is_complete());

        RawResponse {
            status: parsed.code.expect("no status code"),
            headers: parsed
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect(),
            body: Vec::new(),
        }
    }

    /// A full response, with the body framed by its headers.
    pub async fn read_response(&mut self) -> RawResponse {
        let mut response = self.read_head().await;
        let chunked = response
            .header("transfer-encoding")
            .is_some_and(|te| te.eq_ignore_ascii_case("chunked"));

        if chunked {
            loop {
                let line = self.read_line().await;
                let size = std::str::from_utf8(&line).unwrap().split(';').next().unwrap();
                let size = usize::from_str_radix(size.trim(), 16).expect("bad chunk size");
                if size == 0 {
                    // no trailers expected
                    assert!(self.read_line().await.is_empty());
                    break;
                }
                let mut data = self.read_exact(size + 2).await;
                data.truncate(size);
                response.body.extend_from_slice(&data);
            }
        } else if let Some(length) = response.header("content-length") {
            let length: usize = length.parse().expect("bad content-length");
            response.body = self.read_exact(length).await;
        } else if response.status >= 200 && response.status != 204 && response.status != 304 {
            response.body = self.read_to_end().await;
        }
        response
    }

    /// Bytes already buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.remaining()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
