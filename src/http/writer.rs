use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::request::{Headers, Method, Request};
use crate::http::response::{Body, Response, StatusCode};

const HTTP_VERSION: &str = "HTTP/1.1";

/// Terminating zero-size chunk of a chunked body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Frames one chunk: hex size, CRLF, bytes, CRLF.
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 12);
    buf.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Serializes the status line and headers, including the blank line.
pub fn serialize_head(status: StatusCode, headers: &Headers) -> Vec<u8> {
    let mut buf = Vec::new();

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        status.as_u16(),
        status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    // Headers
    for (k, v) in headers.iter() {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");

    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// No body bytes at all (HEAD, 1xx, 204, 304)
    Empty,
    /// Buffered body with a matching Content-Length
    Full,
    /// Streamed body with a declared Content-Length
    Length(usize),
    /// Streamed body, one chunk per handler write
    Chunked,
    /// Streamed body for an HTTP/1.0 client, delimited by closing the
    /// connection
    UntilClose,
}

/// What the request allows the response to be framed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange {
    /// Headers only (HEAD requests)
    pub head_only: bool,
    /// Connection stays open after the response
    pub keep_alive: bool,
    /// Client speaks HTTP/1.0 and cannot decode chunked framing
    pub http10: bool,
}

impl Exchange {
    /// Full response, connection kept open.
    pub const OPEN: Exchange = Exchange {
        head_only: false,
        keep_alive: true,
        http10: false,
    };

    /// Full response, connection closed afterwards.
    pub const CLOSING: Exchange = Exchange {
        head_only: false,
        keep_alive: false,
        http10: false,
    };

    pub fn for_request(request: &Request) -> Self {
        Self {
            head_only: request.method == Method::HEAD,
            keep_alive: request.keep_alive(),
            http10: request.version.eq_ignore_ascii_case("HTTP/1.0"),
        }
    }
}

/// Writes one response to the client, choosing the body framing.
pub struct ResponseWriter {
    head: Vec<u8>,
    body: Body,
    framing: Framing,
    keep_alive: bool,
}

impl ResponseWriter {
    /// Writer for a response on a connection that stays open.
    pub fn new(response: Response) -> Self {
        Self::for_exchange(response, Exchange::OPEN)
    }

    /// Writer for a response to a request.
    ///
    /// A response that cannot keep the connection open (not keep-alive, or
    /// a stream to an HTTP/1.0 client) advertises `Connection: close`.
    pub fn for_exchange(response: Response, exchange: Exchange) -> Self {
        let Response {
            status,
            mut headers,
            body,
        } = response;

        let mut keep_alive = exchange.keep_alive;

        let framing = if !status.allows_body() {
            if status != StatusCode::SwitchingProtocols {
                headers.remove("Content-Length");
            }
            headers.remove("Transfer-Encoding");
            Framing::Empty
        } else {
            match &body {
                Body::Full(bytes) => {
                    let declared = headers.get("Content-Length").map(str::to_string);
                    if declared.as_deref() != Some(bytes.len().to_string().as_str()) {
                        if let Some(declared) = declared {
                            tracing::warn!(
                                declared = %declared,
                                actual = bytes.len(),
                                "Content-Length does not match body, correcting"
                            );
                        }
                        headers.insert("Content-Length", bytes.len().to_string());
                    }
                    headers.remove("Transfer-Encoding");
                    Framing::Full
                }
                Body::Stream(_) => {
                    let declared = headers
                        .get("Content-Length")
                        .and_then(|v| v.trim().parse::<usize>().ok());
                    match declared {
                        Some(len) => {
                            headers.remove("Transfer-Encoding");
                            Framing::Length(len)
                        }
                        None if exchange.http10 => {
                            headers.remove("Content-Length");
                            headers.remove("Transfer-Encoding");
                            keep_alive = false;
                            Framing::UntilClose
                        }
                        None => {
                            headers.remove("Content-Length");
                            headers.insert("Transfer-Encoding", "chunked");
                            Framing::Chunked
                        }
                    }
                }
            }
        };

        if !keep_alive {
            headers.insert("Connection", "close");
        }

        let framing = if exchange.head_only { Framing::Empty } else { framing };

        Self {
            head: serialize_head(status, &headers),
            body,
            framing,
            keep_alive,
        }
    }

    /// Whether the connection may carry another request after this response.
    pub fn keeps_alive(&self) -> bool {
        self.keep_alive
    }

    /// Whether the body is sent with chunked framing.
    pub fn is_chunked(&self) -> bool {
        self.framing == Framing::Chunked
    }

    /// Writes head and body, returning the number of body bytes sent.
    ///
    /// Streamed bodies are flushed write by write so long-running streams
    /// reach the client as they are produced.
    pub async fn write_to_stream<S>(&mut self, stream: &mut S) -> anyhow::Result<usize>
    where
        S: AsyncWrite + Unpin,
    {
        write_fully(stream, &self.head).await?;

        let sent = match (&mut self.body, self.framing) {
            (_, Framing::Empty) => 0,
            (Body::Full(bytes), _) => {
                write_fully(stream, bytes).await?;
                bytes.len()
            }
            (Body::Stream(rx), Framing::Chunked) => {
                stream.flush().await?;
                let mut sent = 0;
                while let Some(data) = rx.recv().await {
                    write_fully(stream, &encode_chunk(&data)).await?;
                    stream.flush().await?;
                    sent += data.len();
                }
                write_fully(stream, LAST_CHUNK).await?;
                sent
            }
            (Body::Stream(rx), Framing::UntilClose) => {
                stream.flush().await?;
                let mut sent = 0;
                while let Some(data) = rx.recv().await {
                    write_fully(stream, &data).await?;
                    stream.flush().await?;
                    sent += data.len();
                }
                sent
            }
            (Body::Stream(rx), Framing::Length(len)) => {
                let mut sent = 0;
                while sent < len {
                    let Some(data) = rx.recv().await else {
                        anyhow::bail!("body stream ended after {} of {} bytes", sent, len);
                    };
                    let take = data.len().min(len - sent);
                    write_fully(stream, &data[..take]).await?;
                    stream.flush().await?;
                    sent += take;
                }
                sent
            }
            (Body::Stream(_), Framing::Full) => 0,
        };

        stream.flush().await?;
        Ok(sent)
    }
}

async fn write_fully<S>(stream: &mut S, buf: &[u8]) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < buf.len() {
        let n = stream.write(&buf[written..]).await?;

        if n == 0 {
            return Err(anyhow::anyhow!("connection closed while writing"));
        }

        written += n;
    }

    Ok(())
}
