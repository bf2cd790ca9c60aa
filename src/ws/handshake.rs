//! WebSocket opening handshake (RFC 6455 section 4.2).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};

pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const WS_VERSION: &str = "13";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("upgrade requests must use GET")]
    NotGet,
    #[error("missing `Upgrade: websocket` header")]
    MissingUpgrade,
    #[error("`Connection` header does not contain `upgrade`")]
    MissingConnectionUpgrade,
    #[error("unsupported WebSocket version {0:?}")]
    UnsupportedVersion(Option<String>),
    #[error("missing Sec-WebSocket-Key")]
    MissingKey,
    #[error("Sec-WebSocket-Key is not a base64 encoded 16-byte nonce")]
    InvalidKey,
}

impl HandshakeError {
    /// Response sent in place of the 101 when the handshake fails.
    pub fn response(&self) -> Response {
        let mut builder = ResponseBuilder::new(StatusCode::BadRequest)
            .header("Content-Type", "text/plain");
        if let HandshakeError::UnsupportedVersion(_) = self {
            builder = builder.header("Sec-WebSocket-Version", WS_VERSION);
        }
        builder.body(self.to_string()).build()
    }
}

/// Whether the request asks to switch to the WebSocket protocol.
pub fn is_upgrade_request(request: &Request) -> bool {
    request.headers.has_token("Upgrade", "websocket")
        && request.headers.has_token("Connection", "upgrade")
}

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Checks the upgrade headers and returns the accept key.
pub fn validate(request: &Request) -> Result<String, HandshakeError> {
    if request.method != Method::GET {
        return Err(HandshakeError::NotGet);
    }
    if !request.headers.has_token("Upgrade", "websocket") {
        return Err(HandshakeError::MissingUpgrade);
    }
    if !request.headers.has_token("Connection", "upgrade") {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }

    let version = request.header("Sec-WebSocket-Version").map(str::trim);
    if version != Some(WS_VERSION) {
        return Err(HandshakeError::UnsupportedVersion(version.map(str::to_string)));
    }

    let key = request
        .header("Sec-WebSocket-Key")
        .map(str::trim)
        .ok_or(HandshakeError::MissingKey)?;
    let nonce = STANDARD.decode(key).map_err(|_| HandshakeError::InvalidKey)?;
    if nonce.len() != 16 {
        return Err(HandshakeError::InvalidKey);
    }

    Ok(accept_key(key))
}

/// Validates the request and builds the `101 Switching Protocols` response.
pub fn handshake_response(request: &Request) -> Result<Response, HandshakeError> {
    let accept = validate(request)?;

    Ok(ResponseBuilder::new(StatusCode::SwitchingProtocols)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", accept)
        .build())
}
