//! HTTP protocol implementation.
//!
//! This module implements HTTP/1.1 request cycles over keep-alive connections.
//!
//! # Architecture
//!
//! The HTTP layer is organized into several submodules:
//!
//! - **`connection`**: A client byte stream plus its unparsed read buffer
//! - **`dispatcher`**: The request-cycle state machine
//! - **`parser`**: Parses incoming HTTP requests from byte buffers
//! - **`multipart`**: Splits `multipart/form-data` bodies into parts
//! - **`request`**: HTTP request representation and parsing utilities
//! - **`response`**: HTTP response representation with builder pattern
//! - **`writer`**: Serializes and writes HTTP responses to the client
//!
//! # Request Cycle State Machine
//!
//! Each request on a connection goes through a state machine:
//!
//! ```text
//!        ┌─────────────┐
//!        │  Receiving  │ ← Read until a whole request is buffered
//!        └──────┬──────┘
//!               │ Request received
//!               ▼
//!        ┌──────────────────┐
//!        │    Matching      │ ← Pick handler, or 404 / upgrade
//!        └──────┬───────────┘
//!               │ Handler found
//!               ▼
//!        ┌──────────────────┐
//!        │    Executing     │ ← Interceptors, then the handler
//!        └──────┬───────────┘
//!               │ Response ready
//!               ▼
//!        ┌──────────────────┐
//!        │   Responding     │ ← Send response to client
//!        └──────┬───────────┘
//!               │ Response sent
//!               ├─ Keep-Alive → Receiving (next cycle, same connection)
//!               └─ Close → Closed
//! ```
//!
//! A WebSocket endpoint takes the `Upgrading` branch from Matching instead:
//! the 101 is written and the connection is handed to a WebSocket session.
//!
//! # Example
//!
//! ```ignore
//! use portico::http::connection::Connection;
//! use portico::http::dispatcher::Dispatcher;
//!
//! let mut conn = Connection::new(stream, ParseLimits::default(), read_timeout);
//! while sock.begin_cycle() {
//!     match dispatcher.run_cycle(&mut conn, &sock).await {
//!         CycleOutcome::KeepAlive => sock.end_cycle(),
//!         _ => break,
//!     };
//! }
//! ```

pub mod connection;
pub mod dispatcher;
pub mod multipart;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
