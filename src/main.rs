use std::time::Duration;

use async_trait::async_trait;
use portico::http::request::Request;
use portico::http::response::{Response, ResponseBuilder, StatusCode};
use portico::routing::{handler_fn, Interceptor, Next};
use portico::ws::{Capability, Message, WsHandler, WsSender};
use portico::{Config, Server};
use tracing_subscriber::EnvFilter;

/// Streams a few server-sent events, one per second.
struct Ticker;

#[async_trait]
impl portico::Handler for Ticker {
    async fn handle(&self, _request: &mut Request) -> anyhow::Result<Response> {
        let (response, body) = ResponseBuilder::new(StatusCode::Ok)
            .header("Content-Type", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .stream();

        tokio::spawn(async move {
            for tick in 1..=5 {
                if body.send(format!("data: tick {}\n\n", tick)).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });

        Ok(response)
    }
}

/// Tags every response with the server name.
struct ServerHeader;

#[async_trait]
impl Interceptor for ServerHeader {
    async fn intercept(&self, request: &mut Request, next: Next<'_>) -> anyhow::Result<Response> {
        let mut response = next.run(request).await?;
        response.headers.insert("Server", "portico");
        Ok(response)
    }
}

struct Echo;

#[async_trait]
impl WsHandler for Echo {
    fn capability(&self) -> Capability {
        Capability::ALL
    }

    async fn on_message(&self, session: &WsSender, message: Message) -> anyhow::Result<()> {
        match message {
            Message::Text(text) => session.send_text(text).await?,
            Message::Binary(data) => session.send_binary(data).await?,
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load();

    let level = cfg
        .as_ref()
        .map(|cfg| cfg.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let cfg = cfg?;
    let mut server = Server::new(cfg);
    server
        .register_handler(
            &["/", "/hello"],
            handler_fn(|request| {
                let name = request.query_param("name").unwrap_or_else(|| "world".to_string());
                Ok(Response::ok(format!("Hello, {}!\n", name)))
            }),
        )?
        .register_handler(&["/events"], Ticker)?
        .register_interceptor(ServerHeader, &["/*"])?
        .register_websocket(&["/ws/echo"], Echo)?;

    server.init().await?;
    server.start()?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    server.stop().await?;
    server.destroy()?;
    Ok(())
}
