use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::http::parser::{find_head_end, parse_head, BodyDecoder, ParseError, ParseLimits, RequestHead};
use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};
use crate::http::writer::ResponseWriter;

const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("HTTP parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
    #[error("timed out waiting for the rest of the request")]
    Timeout,
    #[error("connection closed mid-request")]
    UnexpectedEof,
}

impl ReadError {
    /// Error response owed to the client, if the connection can still
    /// carry one.
    pub fn response(&self) -> Option<Response> {
        match self {
            ReadError::Parse(ParseError::BodyTooLarge(_)) => {
                Some(Response::status_page(StatusCode::PayloadTooLarge))
            }
            ReadError::Parse(ParseError::HeadersTooLarge(_)) => {
                Some(Response::status_page(StatusCode::RequestHeaderFieldsTooLarge))
            }
            ReadError::Parse(_) => Some(Response::bad_request()),
            ReadError::Timeout => Some(Response::status_page(StatusCode::RequestTimeout)),
            ReadError::Io(_) | ReadError::UnexpectedEof => None,
        }
    }
}

/// One client byte stream plus the bytes read from it but not yet parsed.
///
/// Bytes past the end of a request stay buffered for the next one, so
/// pipelined requests and post-upgrade frames are not lost. A request that
/// arrives over several reads is parsed incrementally: the head once, and
/// the body from where the previous read left off.
pub struct Connection<S> {
    stream: S,
    buffer: BytesMut,
    limits: ParseLimits,
    read_timeout: Duration,
    /// Bytes already searched for the end of the head
    head_scanned: usize,
    pending: Option<PendingBody>,
}

/// A parsed head waiting for its body.
struct PendingBody {
    head: RequestHead,
    body_start: usize,
    decoder: BodyDecoder,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, limits: ParseLimits, read_timeout: Duration) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            limits,
            read_timeout,
            head_scanned: 0,
            pending: None,
        }
    }

    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Reads whatever the client sends next, without a deadline. Returns the
    /// number of bytes added; 0 means the client closed the stream.
    pub async fn fill_buf(&mut self) -> io::Result<usize> {
        self.buffer.reserve(READ_BUFFER_SIZE);
        self.stream.read_buf(&mut self.buffer).await
    }

    /// Reads one complete request.
    ///
    /// Returns `Ok(None)` when the client closed cleanly between requests.
    /// Every read is bounded by the read timeout.
    pub async fn read_request(&mut self) -> Result<Option<Request>, ReadError> {
        loop {
            if let Some(request) = self.try_parse()? {
                return Ok(Some(request));
            }

            self.buffer.reserve(READ_BUFFER_SIZE);
            let n = tokio::time::timeout(self.read_timeout, self.stream.read_buf(&mut self.buffer))
                .await
                .map_err(|_| ReadError::Timeout)??;

            if n == 0 {
                if self.buffer.is_empty() && self.pending.is_none() {
                    return Ok(None);
                }
                return Err(ReadError::UnexpectedEof);
            }
        }
    }

    /// Advances parsing over the buffered bytes, yielding the request once
    /// all of it is here.
    fn try_parse(&mut self) -> Result<Option<Request>, ParseError> {
        if self.pending.is_none() {
            if self.buffer.is_empty() {
                return Ok(None);
            }

            // Head is parsed only once its terminator is buffered
            if find_head_end(&self.buffer, self.head_scanned).is_none()
                && self.buffer.len() <= self.limits.max_header_size
            {
                self.head_scanned = self.buffer.len();
                return Ok(None);
            }

            let (head, body_start) = parse_head(&self.buffer, &self.limits)?;
            let decoder = BodyDecoder::for_head(&head, &self.limits)?;
            self.pending = Some(PendingBody {
                head,
                body_start,
                decoder,
            });
        }

        let Some(pending) = self.pending.as_mut() else {
            return Ok(None);
        };
        let Some((body, body_len)) = pending.decoder.decode(&self.buffer[pending.body_start..])? else {
            return Ok(None);
        };

        let consumed = pending.body_start + body_len;
        let head = match self.pending.take() {
            Some(pending) => pending.head,
            None => return Ok(None),
        };
        self.head_scanned = 0;
        self.buffer.advance(consumed);
        Ok(Some(head.into_request(body)?))
    }

    pub async fn write_response(&mut self, writer: &mut ResponseWriter) -> anyhow::Result<usize> {
        writer.write_to_stream(&mut self.stream).await
    }

    /// Gives up the stream and any unparsed bytes (used on upgrade).
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.stream, self.buffer)
    }
}
