use thiserror::Error;

use crate::http::multipart::{self, MultipartError};
use crate::http::request::{split_target, Headers, Method, Request};

/// Longest chunk-size line accepted before the framing is declared broken.
const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request line")]
    InvalidRequest,
    #[error("unknown request method")]
    InvalidMethod,
    #[error("unsupported HTTP version")]
    InvalidVersion,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("malformed chunked body")]
    InvalidChunk,
    #[error("unsupported transfer encoding")]
    UnsupportedTransferEncoding,
    #[error("request head exceeds {0} bytes")]
    HeadersTooLarge(usize),
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error("incomplete request")]
    Incomplete,
}

/// Size limits enforced while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    pub max_header_size: usize,
    pub max_body_size: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_header_size: 64 * 1024,
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// A decoded chunked body, chunk boundaries preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedBody {
    pub chunks: Vec<Vec<u8>>,
    /// Bytes of the input taken up by the framing, terminator and trailers.
    pub consumed: usize,
}

impl ChunkedBody {
    pub fn body(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

/// Request line and headers, parsed before the body has arrived.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub version: String,
    pub headers: Headers,
}

impl RequestHead {
    /// Attaches the decoded body, parsing multipart form data if declared.
    pub fn into_request(self, body: Vec<u8>) -> Result<Request, ParseError> {
        let multipart = match self.headers.get("Content-Type") {
            Some(ct) => match multipart::boundary_from_content_type(ct)? {
                Some(boundary) => Some(multipart::parse_multipart(&body, &boundary)?),
                None => None,
            },
            None => None,
        };

        Ok(Request {
            method: self.method,
            path: self.path,
            query: self.query,
            version: self.version,
            headers: self.headers,
            body,
            multipart,
            attributes: Default::default(),
        })
    }
}

/// Parses one request from the front of `buf` with default limits.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    parse_http_request_with_limits(buf, &ParseLimits::default())
}

/// Parses one request from the front of `buf`.
///
/// Returns the request and the number of bytes it occupied, or
/// [`ParseError::Incomplete`] when more input is needed.
pub fn parse_http_request_with_limits(
    buf: &[u8],
    limits: &ParseLimits,
) -> Result<(Request, usize), ParseError> {
    let (head, body_start) = parse_head(buf, limits)?;
    let mut decoder = BodyDecoder::for_head(&head, limits)?;

    match decoder.decode(&buf[body_start..])? {
        Some((body, body_len)) => Ok((head.into_request(body)?, body_start + body_len)),
        None => Err(ParseError::Incomplete),
    }
}

/// Parses the request line and headers from the front of `buf`.
///
/// Returns the head and the offset where the body starts.
pub fn parse_head(buf: &[u8], limits: &ParseLimits) -> Result<(RequestHead, usize), ParseError> {
    // Look for header/body separator
    let headers_end = match find_headers_end(buf) {
        Some(end) if end > limits.max_header_size => {
            return Err(ParseError::HeadersTooLarge(limits.max_header_size));
        }
        Some(end) => end,
        None if buf.len() > limits.max_header_size => {
            return Err(ParseError::HeadersTooLarge(limits.max_header_size));
        }
        None => return Err(ParseError::Incomplete),
    };

    let header_bytes = &buf[..headers_end];
    let body_start = headers_end + 4;

    let headers_str = std::str::from_utf8(header_bytes)
        .map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let target = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;

    if parts.next().is_some() {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;

    if !version.starts_with("HTTP/1.") {
        return Err(ParseError::InvalidVersion);
    }

    let (path, query) = parse_target(target)?;

    // Headers
    let mut headers = Headers::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line
            .split_once(':')
            .ok_or(ParseError::InvalidHeader)?;

        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(ParseError::InvalidHeader);
        }

        headers.append(key, value.trim());
    }

    let head = RequestHead {
        method,
        path,
        query,
        version: version.to_string(),
        headers,
    };
    Ok((head, body_start))
}

/// Body framing of a parsed head, fed the bytes after the head as they
/// arrive.
#[derive(Debug)]
pub enum BodyDecoder {
    Length(usize),
    Chunked(ChunkedDecoder),
}

impl BodyDecoder {
    /// Picks the framing; `Transfer-Encoding: chunked` wins over
    /// `Content-Length`.
    pub fn for_head(head: &RequestHead, limits: &ParseLimits) -> Result<Self, ParseError> {
        if head.headers.contains_key("Transfer-Encoding") {
            if !is_chunked(&head.headers) {
                return Err(ParseError::UnsupportedTransferEncoding);
            }
            return Ok(BodyDecoder::Chunked(ChunkedDecoder::new(limits.max_body_size)));
        }

        let content_length = content_length(&head.headers)?;
        if content_length > limits.max_body_size {
            return Err(ParseError::BodyTooLarge(limits.max_body_size));
        }
        Ok(BodyDecoder::Length(content_length))
    }

    /// Yields the body and the bytes it occupied once `buf` holds all of it.
    ///
    /// `buf` must start at the body and only grow between calls.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, ParseError> {
        match self {
            BodyDecoder::Length(len) => {
                if buf.len() < *len {
                    return Ok(None);
                }
                Ok(Some((buf[..*len].to_vec(), *len)))
            }
            BodyDecoder::Chunked(decoder) => match decoder.decode(buf)? {
                Some(consumed) => Ok(Some((decoder.take_chunks().concat(), consumed))),
                None => Ok(None),
            },
        }
    }
}

/// Resumable chunked-body decoder.
///
/// Each call picks up after the last complete chunk, so every chunk is
/// scanned and copied once however the input is split across reads.
#[derive(Debug)]
pub struct ChunkedDecoder {
    max_body_size: usize,
    /// Offset of the first byte not yet decoded
    pos: usize,
    total: usize,
    in_trailers: bool,
    chunks: Vec<Vec<u8>>,
}

impl ChunkedDecoder {
    pub fn new(max_body_size: usize) -> Self {
        Self {
            max_body_size,
            pos: 0,
            total: 0,
            in_trailers: false,
            chunks: Vec::new(),
        }
    }

    /// Decodes what `buf` holds. Returns the total bytes used once the
    /// terminator and trailers are complete, `None` while more is needed.
    ///
    /// `buf` must start at the body and only grow between calls.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<usize>, ParseError> {
        loop {
            let Some(line_end) = framing_line_len(&buf[self.pos..])? else {
                return Ok(None);
            };

            if self.in_trailers {
                // Trailers, terminated by an empty line
                self.pos += line_end + 2;
                if line_end == 0 {
                    return Ok(Some(self.pos));
                }
                continue;
            }

            let line = std::str::from_utf8(&buf[self.pos..self.pos + line_end])
                .map_err(|_| ParseError::InvalidChunk)?;
            let size_str = line.split(';').next().unwrap_or_default().trim();
            let size = usize::from_str_radix(size_str, 16).map_err(|_| ParseError::InvalidChunk)?;
            let data_start = self.pos + line_end + 2;

            if size == 0 {
                self.pos = data_start;
                self.in_trailers = true;
                continue;
            }

            let total = self.total.checked_add(size).ok_or(ParseError::InvalidChunk)?;
            if total > self.max_body_size {
                return Err(ParseError::BodyTooLarge(self.max_body_size));
            }

            let data_end = data_start.checked_add(size).ok_or(ParseError::InvalidChunk)?;
            if buf.len() < data_end + 2 {
                return Ok(None);
            }
            if &buf[data_end..data_end + 2] != b"\r\n" {
                return Err(ParseError::InvalidChunk);
            }

            self.chunks.push(buf[data_start..data_end].to_vec());
            self.total = total;
            self.pos = data_end + 2;
        }
    }

    pub fn take_chunks(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.chunks)
    }
}

/// Decodes a chunked body from the front of `buf`.
///
/// Chunk extensions are ignored and trailer lines are skipped. Returns
/// [`ParseError::Incomplete`] until the zero-size terminator and the blank
/// line after any trailers have arrived.
pub fn decode_chunked(buf: &[u8], max_body_size: usize) -> Result<ChunkedBody, ParseError> {
    let mut decoder = ChunkedDecoder::new(max_body_size);
    match decoder.decode(buf)? {
        Some(consumed) => Ok(ChunkedBody {
            chunks: decoder.take_chunks(),
            consumed,
        }),
        None => Err(ParseError::Incomplete),
    }
}

fn parse_target(target: &str) -> Result<(String, Option<String>), ParseError> {
    if target.starts_with('/') || target == "*" {
        return Ok(split_target(target));
    }

    // Absolute form, as sent to proxies
    let url = url::Url::parse(target).map_err(|_| ParseError::InvalidRequest)?;
    if url.cannot_be_a_base() {
        return Err(ParseError::InvalidRequest);
    }
    Ok((url.path().to_string(), url.query().map(str::to_string)))
}

fn is_chunked(headers: &Headers) -> bool {
    headers
        .get_all("Transfer-Encoding")
        .flat_map(|v| v.split(','))
        .last()
        .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &Headers) -> Result<usize, ParseError> {
    let mut values = headers.get_all("Content-Length").map(|v| {
        v.trim()
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidContentLength)
    });

    let first = match values.next() {
        Some(v) => v?,
        None => return Ok(0),
    };

    // Repeated headers are only tolerated when they agree
    for other in values {
        if other? != first {
            return Err(ParseError::InvalidContentLength);
        }
    }

    Ok(first)
}

/// Length of the framing line at the front of `buf`, `None` until its CRLF
/// arrives.
fn framing_line_len(buf: &[u8]) -> Result<Option<usize>, ParseError> {
    let window = &buf[..buf.len().min(MAX_CHUNK_LINE + 2)];
    match window.windows(2).position(|w| w == b"\r\n") {
        Some(end) if end > MAX_CHUNK_LINE => Err(ParseError::InvalidChunk),
        Some(end) => Ok(Some(end)),
        None if buf.len() > MAX_CHUNK_LINE => Err(ParseError::InvalidChunk),
        None => Ok(None),
    }
}

/// Offset of the blank line ending the head, searching from `from`.
pub fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    let from = from.min(buf.len()).saturating_sub(3);
    buf[from..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| from + pos)
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    find_head_end(buf, 0)
}
