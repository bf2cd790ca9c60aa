use portico::http::response::{Response, ResponseBuilder, StatusCode};

#[test]
fn test_status_codes_and_reasons() {
    let table = [
        (StatusCode::SwitchingProtocols, 101, "Switching Protocols"),
        (StatusCode::Ok, 200, "OK"),
        (StatusCode::NoContent, 204, "No Content"),
        (StatusCode::NotModified, 304, "Not Modified"),
        (StatusCode::BadRequest, 400, "Bad Request"),
        (StatusCode::RequestTimeout, 408, "Request Timeout"),
        (StatusCode::PayloadTooLarge, 413, "Payload Too Large"),
        (StatusCode::UpgradeRequired, 426, "Upgrade Required"),
        (StatusCode::RequestHeaderFieldsTooLarge, 431, "Request Header Fields Too Large"),
        (StatusCode::ServiceUnavailable, 503, "Service Unavailable"),
    ];

    for (status, code, reason) in table {
        assert_eq!(status.as_u16(), code);
        assert_eq!(status.reason_phrase(), reason);
    }
}

#[test]
fn test_status_code_bodyless_statuses() {
    assert!(!StatusCode::SwitchingProtocols.allows_body());
    assert!(!StatusCode::NoContent.allows_body());
    assert!(!StatusCode::NotModified.allows_body());
    assert!(StatusCode::UpgradeRequired.allows_body());
}

#[test]
fn test_builder_keeps_headers_in_insertion_order() {
    let response = ResponseBuilder::new(StatusCode::Created)
        .header("Content-Type", "application/json")
        .header("Cache-Control", "no-cache")
        .header("X-Frame-Options", "DENY")
        .body("{}")
        .build();

    let names: Vec<&str> = response.headers.iter().map(|(name, _)| name).collect();
    assert_eq!(
        names,
        ["Content-Type", "Cache-Control", "X-Frame-Options", "Content-Length"]
    );
    assert_eq!(response.header("content-length"), Some("2"));
    assert_eq!(response.body_bytes(), Some(&b"{}"[..]));
}

#[test]
fn test_builder_keeps_declared_content_length() {
    // The writer corrects it on the wire
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Length", "999")
        .body("test")
        .build();

    assert_eq!(response.header("Content-Length"), Some("999"));
}

#[test]
fn test_empty_and_bodyless_responses() {
    let empty = ResponseBuilder::new(StatusCode::Ok).build();
    assert_eq!(empty.body_bytes(), Some(&[][..]));
    assert_eq!(empty.header("Content-Length"), Some("0"));

    let no_content = ResponseBuilder::new(StatusCode::NoContent).build();
    assert!(no_content.header("Content-Length").is_none());
}

#[test]
fn test_status_page_helpers() {
    let pages = [
        (Response::bad_request(), "400 Bad Request"),
        (Response::not_found(), "404 Not Found"),
        (Response::internal_error(), "500 Internal Server Error"),
        (Response::service_unavailable(), "503 Service Unavailable"),
    ];

    for (response, body) in pages {
        assert_eq!(response.header("Content-Type"), Some("text/plain"));
        assert_eq!(response.body_bytes(), Some(body.as_bytes()));
    }

    let ok = Response::ok("hi");
    assert_eq!(ok.status, StatusCode::Ok);
    assert_eq!(ok.body_bytes(), Some(&b"hi"[..]));
}

#[tokio::test]
async fn test_response_streaming_body_sender() {
    let (mut response, body) = Response::streaming("text/event-stream");

    assert!(response.is_streaming());
    assert!(response.body_bytes().is_none());
    assert!(response.header("Content-Length").is_none());
    assert_eq!(response.header("Content-Type"), Some("text/event-stream"));

    body.send("data: 1\n\n").await.unwrap();
    body.send(Vec::new()).await.unwrap(); // ignored
    drop(body);

    let portico::http::response::Body::Stream(rx) = &mut response.body else {
        panic!("expected a streamed body");
    };
    assert_eq!(rx.recv().await.unwrap(), &b"data: 1\n\n"[..]);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_response_body_sender_reports_closed_receiver() {
    let (response, body) = Response::streaming("text/plain");
    drop(response);

    assert!(body.is_closed());
    assert!(body.send("late").await.is_err());
}
