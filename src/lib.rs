//! Portico - embeddable HTTP/1.1 server
//!
//! Core library for connection handling, request dispatch and WebSocket
//! sessions.

pub mod config;
pub mod error;
pub mod http;
pub mod routing;
pub mod server;
pub mod ws;

pub use config::Config;
pub use error::ServerError;
pub use http::request::{Method, Request};
pub use http::response::{Response, ResponseBuilder, StatusCode};
pub use routing::{handler_fn, Handler, Interceptor, Next};
pub use server::Server;
pub use ws::{Capability, Message, WsHandler, WsSender};
