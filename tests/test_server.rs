use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use portico::config::Config;
use portico::http::request::Request;
use portico::http::response::{Response, ResponseBuilder, StatusCode};
use portico::routing::{handler_fn, Handler, Interceptor, Next};
use portico::server::Phase;
use portico::ws::frame::{close_code, encode_frame, parse_frame, Frame, OpCode};
use portico::ws::{Message, WsHandler, WsSender};
use portico::{Server, ServerError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

const WAIT: Duration = Duration::from_secs(5);

struct Streamed;

#[async_trait]
impl Handler for Streamed {
    async fn handle(&self, _request: &mut Request) -> anyhow::Result<Response> {
        let (response, body) = ResponseBuilder::new(StatusCode::Ok)
            .header("Content-Type", "text/plain")
            .stream();
        tokio::spawn(async move {
            for part in ["one", "two", "three"] {
                if body.send(part).await.is_err() {
                    break;
                }
            }
        });
        Ok(response)
    }
}

/// Blocks until the gate opens, reporting when it starts.
struct Slow {
    started: mpsc::UnboundedSender<()>,
    gate: watch::Receiver<bool>,
}

#[async_trait]
impl Handler for Slow {
    async fn handle(&self, _request: &mut Request) -> anyhow::Result<Response> {
        let _ = self.started.send(());
        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;
        Ok(Response::ok("finally"))
    }
}

struct Stamp;

#[async_trait]
impl Interceptor for Stamp {
    async fn intercept(&self, request: &mut Request, next: Next<'_>) -> anyhow::Result<Response> {
        let mut response = next.run(request).await?;
        response.headers.insert("X-Stamp", "1");
        Ok(response)
    }
}

struct Echo;

#[async_trait]
impl WsHandler for Echo {
    async fn on_message(&self, session: &WsSender, message: Message) -> anyhow::Result<()> {
        match message {
            Message::Text(text) => session.send_text(text).await?,
            Message::Binary(data) => session.send_binary(data).await?,
        }
        Ok(())
    }
}

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.server.listen_addr = "127.0.0.1:0".to_string();
    cfg.server.shutdown_timeout = 5;
    cfg.thread_pool.core_size = 2;
    cfg.thread_pool.max_size = 4;
    cfg.thread_pool.queue_size = 8;
    cfg
}

fn build(cfg: Config, slow: Option<Slow>) -> Server {
    let mut server = Server::new(cfg);
    server
        .register_handler(
            &["/hello"],
            handler_fn(|request: &mut Request| {
                let name = request.query_param("name").unwrap_or_else(|| "world".to_string());
                Ok(Response::ok(format!("Hello, {}!", name)))
            }),
        )
        .unwrap()
        .register_handler(&["/stream"], Streamed)
        .unwrap()
        .register_interceptor(Stamp, &["/hello"])
        .unwrap()
        .register_websocket(&["/ws"], Echo)
        .unwrap();
    if let Some(slow) = slow {
        server.register_handler(&["/slow"], slow).unwrap();
    }
    server
}

async fn running(server: &mut Server) -> SocketAddr {
    server.init().await.unwrap();
    server.start().unwrap();
    server.local_addrs()[0]
}

struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

struct Client {
    reader: BufReader<TcpStream>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            reader: BufReader::new(stream),
        }
    }

    async fn send(&mut self, raw: &str) {
        self.reader.get_mut().write_all(raw.as_bytes()).await.unwrap();
    }

    async fn get(&mut self, path: &str) -> Reply {
        self.send(&format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path))
            .await;
        self.reply().await
    }

    async fn reply(&mut self) -> Reply {
        tokio::time::timeout(WAIT, self.read_reply())
            .await
            .expect("response in time")
    }

    async fn read_reply(&mut self) -> Reply {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        let status = line
            .split_whitespace()
            .nth(1)
            .expect("status line")
            .parse()
            .unwrap();

        let mut headers = Vec::new();
        loop {
            line.clear();
            self.reader.read_line(&mut line).await.unwrap();
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }
            let (name, value) = trimmed.split_once(':').unwrap();
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let mut reply = Reply {
            status,
            headers,
            body: Vec::new(),
        };

        if reply.header("Transfer-Encoding") == Some("chunked") {
            loop {
                line.clear();
                self.reader.read_line(&mut line).await.unwrap();
                let size = usize::from_str_radix(line.trim(), 16).unwrap();
                if size == 0 {
                    line.clear();
                    self.reader.read_line(&mut line).await.unwrap();
                    break;
                }
                let mut chunk = vec![0u8; size + 2];
                self.reader.read_exact(&mut chunk).await.unwrap();
                reply.body.extend_from_slice(&chunk[..size]);
            }
        } else if let Some(len) = reply.header("Content-Length") {
            let mut body = vec![0u8; len.parse().unwrap()];
            self.reader.read_exact(&mut body).await.unwrap();
            reply.body = body;
        }

        reply
    }

    /// True once the server has closed its side.
    async fn at_eof(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(
            tokio::time::timeout(WAIT, self.reader.read(&mut byte)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    async fn send_frame(&mut self, frame: Frame) {
        let raw = encode_frame(&frame, Some([9, 8, 7, 6]));
        self.reader.get_mut().write_all(&raw).await.unwrap();
    }

    async fn recv_frame(&mut self, buf: &mut BytesMut) -> Frame {
        loop {
            if let Some((frame, used)) = parse_frame(buf, usize::MAX).unwrap() {
                buf.advance(used);
                return frame;
            }
            let n = tokio::time::timeout(WAIT, self.reader.read_buf(buf))
                .await
                .expect("frame in time")
                .unwrap();
            assert!(n > 0, "server closed the connection");
        }
    }
}

#[tokio::test]
async fn test_keep_alive_serves_several_requests() {
    let mut server = build(test_config(), None);
    let addr = running(&mut server).await;
    let mut client = Client::connect(addr).await;

    let first = client.get("/hello?name=Ann").await;
    assert_eq!(first.status, 200);
    assert_eq!(first.body, b"Hello, Ann!");
    assert_eq!(first.header("X-Stamp"), Some("1"));

    let second = client.get("/hello").await;
    assert_eq!(second.status, 200);
    assert_eq!(second.body, b"Hello, world!");
    assert_eq!(server.connection_count(), 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let mut server = build(test_config(), None);
    let addr = running(&mut server).await;
    let mut client = Client::connect(addr).await;

    client
        .send("GET /hello?name=a HTTP/1.1\r\nHost: x\r\n\r\nGET /hello?name=b HTTP/1.1\r\nHost: x\r\n\r\n")
        .await;

    assert_eq!(client.reply().await.body, b"Hello, a!");
    assert_eq!(client.reply().await.body, b"Hello, b!");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_path_is_404_without_interceptors() {
    let mut server = build(test_config(), None);
    let addr = running(&mut server).await;
    let mut client = Client::connect(addr).await;

    let reply = client.get("/missing").await;
    assert_eq!(reply.status, 404);
    assert_eq!(reply.header("X-Stamp"), None);

    // The connection survives a 404
    assert_eq!(client.get("/hello").await.status, 200);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_connection_close_ends_the_connection() {
    let mut server = build(test_config(), None);
    let addr = running(&mut server).await;
    let mut client = Client::connect(addr).await;

    client
        .send("GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await;
    let reply = client.reply().await;

    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("Connection"), Some("close"));
    assert!(client.at_eof().await);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_request_gets_400_and_close() {
    let mut server = build(test_config(), None);
    let addr = running(&mut server).await;
    let mut client = Client::connect(addr).await;

    client.send("NONSENSE\r\n\r\n").await;
    let reply = client.reply().await;

    assert_eq!(reply.status, 400);
    assert!(client.at_eof().await);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_streamed_response_is_chunked() {
    let mut server = build(test_config(), None);
    let addr = running(&mut server).await;
    let mut client = Client::connect(addr).await;

    let reply = client.get("/stream").await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("Transfer-Encoding"), Some("chunked"));
    assert_eq!(reply.body, b"onetwothree");

    // Still usable afterwards
    assert_eq!(client.get("/hello").await.status, 200);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_streamed_response_to_http10_client_ends_with_close() {
    let mut server = build(test_config(), None);
    let addr = running(&mut server).await;
    let mut client = Client::connect(addr).await;

    client
        .send("GET /stream HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
        .await;
    let reply = client.reply().await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("Transfer-Encoding"), None);
    assert_eq!(reply.header("Connection"), Some("close"));

    // Body runs to the end of the connection
    let mut body = Vec::new();
    tokio::time::timeout(WAIT, client.reader.read_to_end(&mut body))
        .await
        .expect("server closes after the body")
        .unwrap();
    assert_eq!(body, b"onetwothree");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_websocket_upgrade_and_echo() {
    let mut server = build(test_config(), None);
    let addr = running(&mut server).await;
    let mut client = Client::connect(addr).await;

    client
        .send(
            "GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .await;
    let reply = client.reply().await;
    assert_eq!(reply.status, 101);
    assert_eq!(
        reply.header("Sec-WebSocket-Accept"),
        Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
    );

    let mut buf = BytesMut::new();
    client.send_frame(Frame::text("ping me")).await;
    let echo = client.recv_frame(&mut buf).await;
    assert_eq!(echo.opcode, OpCode::Text);
    assert_eq!(echo.payload, b"ping me");

    client.send_frame(Frame::close(close_code::NORMAL, "")).await;
    let close = client.recv_frame(&mut buf).await;
    assert_eq!(close.close_code(), Some(close_code::NORMAL));
    assert!(client.at_eof().await);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_plain_request_to_websocket_endpoint_is_426() {
    let mut server = build(test_config(), None);
    let addr = running(&mut server).await;
    let mut client = Client::connect(addr).await;

    let reply = client.get("/ws").await;
    assert_eq!(reply.status, 426);
    assert_eq!(reply.header("Upgrade"), Some("websocket"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_bad_websocket_version_is_400() {
    let mut server = build(test_config(), None);
    let addr = running(&mut server).await;
    let mut client = Client::connect(addr).await;

    client
        .send(
            "GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 8\r\n\r\n",
        )
        .await;
    let reply = client.reply().await;

    assert_eq!(reply.status, 400);
    assert_eq!(reply.header("Sec-WebSocket-Version"), Some("13"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_saturated_pool_answers_503() {
    let mut cfg = test_config();
    cfg.thread_pool.core_size = 1;
    cfg.thread_pool.max_size = 1;
    cfg.thread_pool.queue_size = 0;

    let (started_tx, mut started) = mpsc::unbounded_channel();
    let (open, gate) = watch::channel(false);
    let mut server = build(
        cfg,
        Some(Slow {
            started: started_tx,
            gate,
        }),
    );
    let addr = running(&mut server).await;

    let mut busy = Client::connect(addr).await;
    busy.send("GET /slow HTTP/1.1\r\nHost: x\r\n\r\n").await;
    tokio::time::timeout(WAIT, started.recv())
        .await
        .expect("slow handler started");

    let mut rejected = Client::connect(addr).await;
    let reply = rejected.get("/hello").await;
    assert_eq!(reply.status, 503);
    assert_eq!(reply.header("Connection"), Some("close"));
    assert!(rejected.at_eof().await);

    open.send_replace(true);
    let reply = busy.reply().await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"finally");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_inline_cycles_without_pool() {
    let mut cfg = test_config();
    cfg.thread_pool.enabled = false;
    let mut server = build(cfg, None);
    let addr = running(&mut server).await;
    assert!(server.pool_stats().is_none());

    let mut client = Client::connect(addr).await;
    assert_eq!(client.get("/hello?name=inline").await.body, b"Hello, inline!");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_idle_connection_is_reaped() {
    let mut cfg = test_config();
    cfg.server.keep_alive_time = 1;
    let mut server = build(cfg, None);
    let addr = running(&mut server).await;

    let mut client = Client::connect(addr).await;
    assert_eq!(client.get("/hello").await.status, 200);

    assert!(client.at_eof().await);
    assert_eq!(server.connection_count(), 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_closes_idle_connections() {
    let mut server = build(test_config(), None);
    let addr = running(&mut server).await;

    let mut client = Client::connect(addr).await;
    assert_eq!(client.get("/hello").await.status, 200);
    assert_eq!(server.connection_count(), 1);

    server.stop().await.unwrap();
    assert_eq!(server.phase(), Phase::Stopped);
    assert_eq!(server.connection_count(), 0);
    assert!(client.at_eof().await);

    server.destroy().unwrap();
    assert_eq!(server.phase(), Phase::Destroyed);
}

#[tokio::test]
async fn test_lifecycle_order_is_enforced() {
    let mut server = build(test_config(), None);

    assert!(matches!(
        server.start(),
        Err(ServerError::Lifecycle {
            phase: Phase::Configured,
            ..
        })
    ));
    assert!(server.destroy().is_err());

    server.init().await.unwrap();
    assert_eq!(server.phase(), Phase::Initialized);
    assert!(server.init().await.is_err());
    assert!(server.stop().await.is_err());
    assert!(matches!(
        server.register_handler(&["/late"], handler_fn(|_req: &mut Request| Ok(Response::ok("late")))),
        Err(ServerError::Lifecycle {
            phase: Phase::Initialized,
            ..
        })
    ));

    server.destroy().unwrap();
    assert!(server.destroy().is_err());
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let mut cfg = test_config();
    cfg.server.listen_addr = "not-an-address".to_string();
    let mut server = build(cfg, None);

    assert!(matches!(server.init().await, Err(ServerError::Bind { .. })));
    assert_eq!(server.phase(), Phase::Configured);
}
