//! WebSocket support: handshake, frame codec and sessions.

pub mod frame;
pub mod handshake;
pub mod session;

pub use frame::{close_code, Frame, FrameError, OpCode};
pub use session::{
    Accepts, Capability, DeliveryMode, Fragment, Message, MessageKind, WsHandler, WsSender,
};
