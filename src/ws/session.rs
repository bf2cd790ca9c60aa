//! WebSocket sessions: frame-mode I/O on an upgraded connection.
//!
//! Inbound frames are read on the session task and handed to the endpoint's
//! [`WsHandler`] one message at a time, in arrival order. Outbound frames go
//! through a [`WsSender`] to a writer task, so handlers may also push
//! messages from elsewhere.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures_util::FutureExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::server::sock::{Sock, SockId};
use crate::ws::frame::{close_code, encode_frame, parse_frame, Frame, FrameError, OpCode};

/// Frames queued for the writer before senders wait.
const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// A complete, reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Text(_) => MessageKind::Text,
            Message::Binary(_) => MessageKind::Binary,
        }
    }
}

/// One data frame's payload, delivered to streaming handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub kind: MessageKind,
    pub data: Vec<u8>,
    /// Set on the frame that completes the message.
    pub last: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepts {
    Text,
    Binary,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Only reassembled messages, via `on_message`
    Whole,
    /// Every data frame as it arrives, via `on_fragment`
    Streaming,
}

/// Which messages a handler consumes and how it wants them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub accepts: Accepts,
    pub mode: DeliveryMode,
}

impl Capability {
    pub const TEXT: Self = Self {
        accepts: Accepts::Text,
        mode: DeliveryMode::Whole,
    };
    pub const BINARY: Self = Self {
        accepts: Accepts::Binary,
        mode: DeliveryMode::Whole,
    };
    pub const ALL: Self = Self {
        accepts: Accepts::Both,
        mode: DeliveryMode::Whole,
    };

    pub const fn streaming(accepts: Accepts) -> Self {
        Self {
            accepts,
            mode: DeliveryMode::Streaming,
        }
    }

    pub fn accepts(&self, kind: MessageKind) -> bool {
        matches!(
            (self.accepts, kind),
            (Accepts::Both, _)
                | (Accepts::Text, MessageKind::Text)
                | (Accepts::Binary, MessageKind::Binary)
        )
    }
}

impl Default for Capability {
    fn default() -> Self {
        Self::ALL
    }
}

/// Consumer of a WebSocket endpoint's messages.
///
/// A message of a kind the capability does not accept closes the session
/// with 1003. Handler errors close it with 1011.
#[async_trait]
pub trait WsHandler: Send + Sync {
    fn capability(&self) -> Capability {
        Capability::default()
    }

    async fn on_open(&self, _session: &WsSender) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_message(&self, _session: &WsSender, _message: Message) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_fragment(&self, _session: &WsSender, _fragment: Fragment) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_close(&self, _session: &WsSender, _code: u16) {}
}

/// Accumulates continuation frames into whole messages.
#[derive(Debug)]
pub struct Reassembler {
    partial: Option<(MessageKind, Vec<u8>)>,
    streaming: Option<MessageKind>,
    max_size: usize,
}

impl Reassembler {
    pub fn new(max_size: usize) -> Self {
        Self {
            partial: None,
            streaming: None,
            max_size,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.partial.is_some() || self.streaming.is_some()
    }

    /// Feeds a data frame; yields a message once a `fin` frame completes it.
    ///
    /// Control frames are ignored: they may arrive between fragments.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, FrameError> {
        let kind = match frame.opcode {
            OpCode::Text => MessageKind::Text,
            OpCode::Binary => MessageKind::Binary,
            OpCode::Continuation => {
                let (kind, mut data) = self
                    .partial
                    .take()
                    .ok_or(FrameError::UnexpectedContinuation)?;
                if data.len() + frame.payload.len() > self.max_size {
                    return Err(FrameError::TooLarge(self.max_size));
                }
                data.extend_from_slice(&frame.payload);
                if frame.fin {
                    return finish(kind, data).map(Some);
                }
                self.partial = Some((kind, data));
                return Ok(None);
            }
            _ => return Ok(None),
        };

        if self.partial.is_some() {
            return Err(FrameError::InterleavedMessage);
        }
        if frame.fin {
            return finish(kind, frame.payload).map(Some);
        }
        self.partial = Some((kind, frame.payload));
        Ok(None)
    }

    /// Tracks message boundaries without buffering, for streaming delivery.
    pub fn fragment(&mut self, frame: Frame) -> Result<Option<Fragment>, FrameError> {
        let kind = match (frame.opcode, self.streaming) {
            (OpCode::Text, None) => MessageKind::Text,
            (OpCode::Binary, None) => MessageKind::Binary,
            (OpCode::Text | OpCode::Binary, Some(_)) => {
                return Err(FrameError::InterleavedMessage);
            }
            (OpCode::Continuation, Some(kind)) => kind,
            (OpCode::Continuation, None) => return Err(FrameError::UnexpectedContinuation),
            _ => return Ok(None),
        };

        self.streaming = if frame.fin { None } else { Some(kind) };
        Ok(Some(Fragment {
            kind,
            data: frame.payload,
            last: frame.fin,
        }))
    }
}

fn finish(kind: MessageKind, data: Vec<u8>) -> Result<Message, FrameError> {
    match kind {
        MessageKind::Text => String::from_utf8(data)
            .map(Message::Text)
            .map_err(|_| FrameError::InvalidUtf8),
        MessageKind::Binary => Ok(Message::Binary(data)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("WebSocket session closed")]
pub struct SessionClosed;

/// Handle for sending on a session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WsSender {
    id: SockId,
    tx: mpsc::Sender<Frame>,
    closing: Arc<AtomicBool>,
}

impl WsSender {
    pub fn id(&self) -> SockId {
        self.id
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SessionClosed> {
        self.send(Frame::text(text)).await
    }

    pub async fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<(), SessionClosed> {
        self.send(Frame::binary(data)).await
    }

    pub async fn ping(&self, data: impl Into<Vec<u8>>) -> Result<(), SessionClosed> {
        self.send(Frame::ping(data)).await
    }

    /// Starts the closing handshake. Later sends fail.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), SessionClosed> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.tx
            .send(Frame::close(code, reason))
            .await
            .map_err(|_| SessionClosed)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    async fn send(&self, frame: Frame) -> Result<(), SessionClosed> {
        if self.is_closing() {
            return Err(SessionClosed);
        }
        self.tx.send(frame).await.map_err(|_| SessionClosed)
    }

    /// Control replies bypass the closing check.
    async fn send_control(&self, frame: Frame) -> Result<(), SessionClosed> {
        self.tx.send(frame).await.map_err(|_| SessionClosed)
    }
}

/// How the read side ended.
struct ReadEnd {
    code: u16,
    /// A close frame is queued and must reach the peer before the Sock closes
    flush: bool,
}

enum Flow {
    Continue,
    Stop(ReadEnd),
}

/// An upgraded connection bound to a WebSocket endpoint.
pub struct WsSession {
    sock: Weak<Sock>,
    handler: Arc<dyn WsHandler>,
    reassembler: Reassembler,
    max_message_size: usize,
    read_timeout: Duration,
}

impl WsSession {
    pub fn new(
        sock: &Arc<Sock>,
        handler: Arc<dyn WsHandler>,
        max_message_size: usize,
        read_timeout: Duration,
    ) -> Self {
        Self {
            sock: Arc::downgrade(sock),
            handler,
            reassembler: Reassembler::new(max_message_size),
            max_message_size,
            read_timeout,
        }
    }

    /// Runs the session until either side closes. `buffered` holds bytes
    /// read past the handshake request.
    pub async fn run<S>(mut self, stream: S, buffered: BytesMut)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let Some(sock) = self.sock.upgrade() else {
            return;
        };
        // Reaped or shut down before the session started
        if sock.is_closed() {
            tracing::debug!(sock = %sock.id(), "WebSocket session skipped, connection already closed");
            return;
        }
        let id = sock.id();
        drop(sock);

        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let sender = WsSender {
            id,
            tx,
            closing: Arc::new(AtomicBool::new(false)),
        };

        let mut writer_task = tokio::spawn(write_loop(writer, rx, self.sock.clone()));
        tracing::debug!(sock = %id, "WebSocket session opened");

        let handler = Arc::clone(&self.handler);
        let end = match AssertUnwindSafe(handler.on_open(&sender)).catch_unwind().await {
            Ok(Ok(())) => self.read_loop(reader, buffered, &sender).await,
            Ok(Err(e)) => {
                tracing::warn!(sock = %id, error = %e, "WebSocket open handler failed");
                self.fail(&sender, close_code::INTERNAL_ERROR).await
            }
            Err(_) => {
                tracing::error!(sock = %id, "WebSocket open handler panicked");
                self.fail(&sender, close_code::INTERNAL_ERROR).await
            }
        };

        handler.on_close(&sender, end.code).await;
        drop(sender);

        if end.flush {
            if tokio::time::timeout(self.read_timeout, &mut writer_task)
                .await
                .is_err()
            {
                writer_task.abort();
            }
            self.close_sock();
        } else {
            self.close_sock();
            let _ = writer_task.await;
        }

        tracing::debug!(sock = %id, code = end.code, "WebSocket session closed");
    }

    async fn read_loop<R>(&mut self, mut reader: R, mut buf: BytesMut, sender: &WsSender) -> ReadEnd
    where
        R: AsyncRead + Unpin,
    {
        loop {
            match parse_frame(&buf, self.max_message_size) {
                Ok(Some((frame, used))) => {
                    buf.advance(used);
                    if let Some(sock) = self.sock.upgrade() {
                        sock.touch();
                    }
                    if let Flow::Stop(end) = self.on_frame(frame, sender).await {
                        return end;
                    }
                }
                Ok(None) => {
                    let Some(sock) = self.sock.upgrade() else {
                        return ReadEnd {
                            code: close_code::GOING_AWAY,
                            flush: false,
                        };
                    };

                    // After sending our close, the echo must come back in time
                    let deadline = if sender.is_closing() {
                        self.read_timeout
                    } else {
                        Duration::MAX
                    };

                    let read = tokio::select! {
                        read = tokio::time::timeout(deadline, reader.read_buf(&mut buf)) => read,
                        _ = sock.closed() => {
                            return ReadEnd { code: close_code::GOING_AWAY, flush: false };
                        }
                    };

                    match read {
                        Ok(Ok(0)) | Ok(Err(_)) | Err(_) => {
                            return ReadEnd {
                                code: close_code::GOING_AWAY,
                                flush: false,
                            };
                        }
                        Ok(Ok(_)) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(sock = %sender.id(), error = %e, "WebSocket protocol error");
                    return self.fail(sender, e.close_code()).await;
                }
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame, sender: &WsSender) -> Flow {
        if !frame.masked {
            tracing::warn!(sock = %sender.id(), "Unmasked client frame");
            return Flow::Stop(self.fail(sender, FrameError::Unmasked.close_code()).await);
        }

        match frame.opcode {
            OpCode::Ping => {
                let _ = sender.send_control(Frame::pong(frame.payload)).await;
                Flow::Continue
            }
            OpCode::Pong => Flow::Continue,
            OpCode::Close => {
                let code = frame.close_code().unwrap_or(close_code::NO_STATUS);
                if !sender.closing.swap(true, Ordering::AcqRel) {
                    // Echo the peer's status code back; codes that may not
                    // go on the wire are answered with a normal close
                    let echo = match frame.close_code() {
                        Some(code) if close_code::is_sendable(code) => Frame::close(code, ""),
                        None if frame.payload.is_empty() => Frame::new(true, OpCode::Close, Vec::new()),
                        _ => Frame::close(close_code::NORMAL, ""),
                    };
                    let _ = sender.send_control(echo).await;
                }
                Flow::Stop(ReadEnd { code, flush: true })
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => self.deliver(frame, sender).await,
        }
    }

    async fn deliver(&mut self, frame: Frame, sender: &WsSender) -> Flow {
        let Some(sock) = self.sock.upgrade() else {
            return Flow::Stop(ReadEnd {
                code: close_code::GOING_AWAY,
                flush: false,
            });
        };

        // Closed by the reaper or shutdown while the frame was read
        if !sock.begin_cycle() {
            return Flow::Stop(ReadEnd {
                code: close_code::GOING_AWAY,
                flush: false,
            });
        }

        let outcome = self.dispatch(frame, sender).await;
        sock.end_cycle();

        match outcome {
            Ok(()) => Flow::Continue,
            Err(code) => Flow::Stop(self.fail(sender, code).await),
        }
    }

    /// Hands a data frame to the handler. Errors carry the close code.
    async fn dispatch(&mut self, frame: Frame, sender: &WsSender) -> Result<(), u16> {
        let capability = self.handler.capability();

        let delivery = match capability.mode {
            DeliveryMode::Whole => match self.reassembler.push(frame) {
                Ok(Some(message)) => {
                    if !capability.accepts(message.kind()) {
                        return Err(close_code::UNSUPPORTED_DATA);
                    }
                    AssertUnwindSafe(self.handler.on_message(sender, message))
                        .catch_unwind()
                        .await
                }
                Ok(None) => return Ok(()),
                Err(e) => return Err(e.close_code()),
            },
            DeliveryMode::Streaming => match self.reassembler.fragment(frame) {
                Ok(Some(fragment)) => {
                    if !capability.accepts(fragment.kind) {
                        return Err(close_code::UNSUPPORTED_DATA);
                    }
                    AssertUnwindSafe(self.handler.on_fragment(sender, fragment))
                        .catch_unwind()
                        .await
                }
                Ok(None) => return Ok(()),
                Err(e) => return Err(e.close_code()),
            },
        };

        match delivery {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::error!(sock = %sender.id(), error = %e, "WebSocket handler failed");
                Err(close_code::INTERNAL_ERROR)
            }
            Err(_) => {
                tracing::error!(sock = %sender.id(), "WebSocket handler panicked");
                Err(close_code::INTERNAL_ERROR)
            }
        }
    }

    /// Sends a close frame for a failure and ends the read side.
    async fn fail(&self, sender: &WsSender, code: u16) -> ReadEnd {
        let flush = sender.close(code, "").await.is_ok();
        ReadEnd { code, flush }
    }

    fn close_sock(&self) {
        if let Some(sock) = self.sock.upgrade() {
            sock.close();
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Frame>, sock: Weak<Sock>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => frame,
            _ = sock_closed(&sock) => None,
        };
        let Some(frame) = frame else {
            break;
        };

        let bytes = encode_frame(&frame, None);
        let written = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            tracing::debug!(error = %e, "WebSocket write failed");
            break;
        }

        if let Some(sock) = sock.upgrade() {
            sock.touch();
        }
        if frame.opcode == OpCode::Close {
            break;
        }
    }

    let _ = writer.shutdown().await;
}

async fn sock_closed(sock: &Weak<Sock>) {
    if let Some(sock) = sock.upgrade() {
        sock.closed().await;
    }
}
