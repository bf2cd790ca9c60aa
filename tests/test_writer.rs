use portico::http::parser::decode_chunked;
use portico::http::response::{Response, ResponseBuilder, StatusCode};
use portico::http::writer::{encode_chunk, Exchange, ResponseWriter, LAST_CHUNK};

/// Splits serialized output into the head (without the blank line) and body.
fn split(raw: &[u8]) -> (String, &[u8]) {
    let end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("head terminator");
    (String::from_utf8_lossy(&raw[..end]).into_owned(), &raw[end + 4..])
}

async fn write(mut writer: ResponseWriter) -> Vec<u8> {
    let mut out = Vec::new();
    writer.write_to_stream(&mut out).await.unwrap();
    out
}

#[tokio::test]
async fn test_full_body_written_with_length() {
    let out = write(ResponseWriter::new(Response::ok("hello"))).await;
    let (head, body) = split(&out);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Length: 5"));
    assert!(!head.contains("Connection: close"));
    assert_eq!(body, b"hello");
}

#[tokio::test]
async fn test_streamed_body_round_trips_through_chunked_decoder() {
    let first = vec![b'a'; 3000];
    let second = vec![b'b'; 17];

    let (response, body) = Response::streaming("application/octet-stream");
    body.send(first.clone()).await.unwrap();
    body.send(second.clone()).await.unwrap();
    drop(body);

    let writer = ResponseWriter::new(response);
    assert!(writer.is_chunked());
    let out = write(writer).await;
    let (head, payload) = split(&out);

    assert!(head.contains("Transfer-Encoding: chunked"));
    assert!(!head.contains("Content-Length"));
    assert!(payload.ends_with(LAST_CHUNK));

    let decoded = decode_chunked(payload, usize::MAX).unwrap();
    assert_eq!(decoded.chunks, vec![first, second]);
    assert_eq!(decoded.consumed, payload.len());
}

#[tokio::test]
async fn test_streamed_body_with_declared_length_is_not_chunked() {
    let (response, body) = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Length", "10")
        .stream();
    body.send("hello").await.unwrap();
    body.send("world").await.unwrap();
    drop(body);

    let writer = ResponseWriter::new(response);
    assert!(!writer.is_chunked());
    let out = write(writer).await;
    let (head, payload) = split(&out);

    assert!(head.contains("Content-Length: 10"));
    assert!(!head.contains("Transfer-Encoding"));
    assert_eq!(payload, b"helloworld");
}

#[tokio::test]
async fn test_streamed_body_shorter_than_declared_length_fails() {
    let (response, body) = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Length", "10")
        .stream();
    body.send("short").await.unwrap();
    drop(body);

    let mut out = Vec::new();
    let result = ResponseWriter::new(response).write_to_stream(&mut out).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_head_request_gets_headers_only() {
    let exchange = Exchange {
        head_only: true,
        ..Exchange::OPEN
    };
    let out = write(ResponseWriter::for_exchange(Response::ok("hello"), exchange)).await;
    let (head, body) = split(&out);

    assert!(head.contains("Content-Length: 5"));
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_closing_exchange_advertises_connection_close() {
    let out = write(ResponseWriter::for_exchange(Response::ok("bye"), Exchange::CLOSING)).await;
    let (head, _) = split(&out);

    assert!(head.contains("Connection: close"));
}

#[tokio::test]
async fn test_http10_stream_is_raw_and_closes() {
    let (response, body) = Response::streaming("text/plain");
    body.send("one").await.unwrap();
    body.send("two").await.unwrap();
    drop(body);

    let exchange = Exchange {
        http10: true,
        ..Exchange::OPEN
    };
    let writer = ResponseWriter::for_exchange(response, exchange);
    assert!(!writer.is_chunked());
    assert!(!writer.keeps_alive());

    let out = write(writer).await;
    let (head, payload) = split(&out);

    assert!(head.contains("Connection: close"));
    assert!(!head.contains("Transfer-Encoding"));
    assert!(!head.contains("Content-Length"));
    assert_eq!(payload, b"onetwo");
}

#[tokio::test]
async fn test_http10_stream_with_declared_length_keeps_alive() {
    let (response, body) = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Length", "3")
        .stream();
    body.send("abc").await.unwrap();
    drop(body);

    let exchange = Exchange {
        http10: true,
        ..Exchange::OPEN
    };
    let writer = ResponseWriter::for_exchange(response, exchange);
    assert!(writer.keeps_alive());

    let out = write(writer).await;
    let (head, payload) = split(&out);
    assert!(!head.contains("Connection: close"));
    assert_eq!(payload, b"abc");
}

#[tokio::test]
async fn test_wrong_content_length_is_corrected() {
    let mut response = Response::ok("four");
    response.headers.insert("Content-Length", "999");

    let out = write(ResponseWriter::new(response)).await;
    let (head, body) = split(&out);

    assert!(head.contains("Content-Length: 4"));
    assert_eq!(body, b"four");
}

#[tokio::test]
async fn test_no_content_has_no_body_framing() {
    let out = write(ResponseWriter::new(ResponseBuilder::new(StatusCode::NoContent).build())).await;
    let (head, body) = split(&out);

    assert!(head.starts_with("HTTP/1.1 204 No Content"));
    assert!(!head.contains("Content-Length"));
    assert!(!head.contains("Transfer-Encoding"));
    assert!(body.is_empty());
}

#[test]
fn test_encode_chunk_uses_hex_size() {
    let mut expected = b"1a\r\n".to_vec();
    expected.extend_from_slice(&[b'x'; 26]);
    expected.extend_from_slice(b"\r\n");

    assert_eq!(encode_chunk(&[b'x'; 26]), expected);
}
