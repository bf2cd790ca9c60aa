use portico::http::request::{Headers, Method, Request, RequestBuilder};

fn request(method: Method, target: &str, headers: &[(&str, &str)]) -> Request {
    let mut builder = RequestBuilder::new().method(method).path(target);
    for (key, value) in headers {
        builder = builder.header(*key, *value);
    }
    builder.build().unwrap()
}

#[test]
fn test_request_header_retrieval() {
    let req = request(
        Method::GET,
        "/",
        &[("Host", "example.com"), ("Content-Type", "application/json")],
    );

    assert_eq!(req.header("Host"), Some("example.com"));
    assert_eq!(req.header("Content-Type"), Some("application/json"));
    assert_eq!(req.header("Missing"), None);
}

#[test]
fn test_request_header_lookup_ignores_case() {
    let req = request(Method::GET, "/", &[("X-Request-Id", "abc")]);

    assert_eq!(req.header("x-request-id"), Some("abc"));
    assert_eq!(req.header("X-REQUEST-ID"), Some("abc"));
}

#[test]
fn test_request_content_length_parsing() {
    let req = request(Method::POST, "/api", &[("Content-Length", "42")]);

    assert_eq!(req.content_length(), 42);
}

#[test]
fn test_request_content_length_missing() {
    let req = request(Method::GET, "/", &[]);

    assert_eq!(req.content_length(), 0);
}

#[test]
fn test_request_content_length_invalid() {
    let req = request(Method::POST, "/api", &[("Content-Length", "not-a-number")]);

    assert_eq!(req.content_length(), 0);
}

#[test]
fn test_request_keep_alive_http11_default() {
    // HTTP/1.1 defaults to keep-alive
    let req = request(Method::GET, "/", &[]);

    assert!(req.keep_alive());
}

#[test]
fn test_request_keep_alive_explicit_header() {
    let req = request(Method::GET, "/", &[("Connection", "keep-alive")]);

    assert!(req.keep_alive());
}

#[test]
fn test_request_keep_alive_close() {
    let req = request(Method::GET, "/", &[("Connection", "close")]);

    assert!(!req.keep_alive());
}

#[test]
fn test_request_keep_alive_case_insensitive() {
    let req = request(Method::GET, "/", &[("Connection", "Keep-Alive")]);

    assert!(req.keep_alive());
}

#[test]
fn test_request_http10_defaults_to_close() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .path("/")
        .version("HTTP/1.0")
        .build()
        .unwrap();
    assert!(!req.keep_alive());

    let req = RequestBuilder::new()
        .method(Method::GET)
        .path("/")
        .version("HTTP/1.0")
        .header("Connection", "keep-alive")
        .build()
        .unwrap();
    assert!(req.keep_alive());
}

#[test]
fn test_request_method_equality() {
    assert_eq!(Method::GET, Method::GET);
    assert_ne!(Method::GET, Method::POST);
}

#[test]
fn test_request_method_from_string() {
    assert_eq!(Method::from_str("GET"), Some(Method::GET));
    assert_eq!(Method::from_str("POST"), Some(Method::POST));
    assert_eq!(Method::from_str("INVALID"), None);
    assert_eq!(Method::from_str("get"), None); // Case-sensitive
}

#[test]
fn test_request_with_body() {
    let body_content = b"test body content".to_vec();
    let req = RequestBuilder::new()
        .method(Method::POST)
        .path("/api")
        .body(body_content.clone())
        .build()
        .unwrap();

    assert_eq!(req.body, body_content);
}

#[test]
fn test_request_query_params_are_decoded() {
    let req = request(Method::GET, "/search?q=rust+lang&page=2&tag=a%26b", &[]);

    assert_eq!(req.path, "/search");
    assert_eq!(req.query.as_deref(), Some("q=rust+lang&page=2&tag=a%26b"));
    assert_eq!(req.query_param("q").as_deref(), Some("rust lang"));
    assert_eq!(req.query_param("tag").as_deref(), Some("a&b"));
    assert_eq!(req.query_param("missing"), None);
    assert_eq!(req.query_params().len(), 3);
    assert_eq!(req.target(), "/search?q=rust+lang&page=2&tag=a%26b");
}

#[test]
fn test_request_content_type_drops_parameters() {
    let req = request(
        Method::POST,
        "/upload",
        &[("Content-Type", "multipart/form-data; boundary=xyz")],
    );

    assert_eq!(req.content_type(), Some("multipart/form-data"));
}

#[test]
fn test_request_builder_requires_method() {
    assert!(RequestBuilder::new().path("/").build().is_err());
}

#[test]
fn test_headers_insert_replaces_all_values() {
    let mut headers = Headers::new();
    headers.append("Set-Cookie", "a=1");
    headers.append("Set-Cookie", "b=2");
    headers.append("Host", "example.com");
    assert_eq!(headers.get_all("set-cookie").count(), 2);

    headers.insert("set-cookie", "c=3");

    assert_eq!(headers.get_all("Set-Cookie").collect::<Vec<_>>(), vec!["c=3"]);
    assert_eq!(headers.len(), 2);
    assert_eq!(headers.remove("HOST").as_deref(), Some("example.com"));
    assert!(!headers.contains_key("Host"));
}

#[test]
fn test_headers_token_matching() {
    let mut headers = Headers::new();
    headers.append("Connection", "keep-alive, Upgrade");

    assert!(headers.has_token("connection", "upgrade"));
    assert!(headers.has_token("Connection", "keep-alive"));
    assert!(!headers.has_token("Connection", "close"));
}
