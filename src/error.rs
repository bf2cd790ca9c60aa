//! Errors surfaced by the server lifecycle.

use thiserror::Error;

use crate::config::ConfigError;
use crate::routing::router::RouteError;
use crate::server::Phase;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot {action} a server that is {phase:?}")]
    Lifecycle { action: &'static str, phase: Phase },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Route(#[from] RouteError),
}
