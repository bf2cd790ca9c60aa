use portico::http::multipart::{
    boundary_from_content_type, parse_multipart, MultipartError, MAX_BOUNDARY_LEN,
};

fn form(boundary: &str) -> Vec<u8> {
    format!(
        "preamble\r\n\
         --{b}\r\n\
         Content-Disposition: form-data; name=\"name\"\r\n\
         \r\n\
         Alice\r\n\
         --{b}\r\n\
         Content-Disposition: form-data; name=\"avatar\"; filename=\"a.png\"\r\n\
         Content-Type: image/png\r\n\
         \r\n\
         \x01\x02\x03\r\n\
         --{b}--\r\n",
        b = boundary
    )
    .into_bytes()
}

#[test]
fn test_boundary_at_maximum_length() {
    let boundary = "b".repeat(MAX_BOUNDARY_LEN);
    let content_type = format!("multipart/form-data; boundary={}", boundary);

    let parsed = boundary_from_content_type(&content_type).unwrap();
    assert_eq!(parsed.as_deref(), Some(boundary.as_str()));

    let form = parse_multipart(&form(&boundary), &boundary).unwrap();
    assert_eq!(form.len(), 2);
    assert_eq!(form.field("name"), Some("Alice"));
}

#[test]
fn test_boundary_over_maximum_rejected() {
    let boundary = "b".repeat(MAX_BOUNDARY_LEN + 1);
    let content_type = format!("multipart/form-data; boundary={}", boundary);

    assert_eq!(
        boundary_from_content_type(&content_type),
        Err(MultipartError::InvalidBoundary)
    );
}

#[test]
fn test_quoted_boundary() {
    let parsed = boundary_from_content_type("multipart/form-data; boundary=\"a b:c\"").unwrap();

    assert_eq!(parsed.as_deref(), Some("a b:c"));
}

#[test]
fn test_non_multipart_content_type() {
    assert_eq!(boundary_from_content_type("application/json").unwrap(), None);
    assert_eq!(
        boundary_from_content_type("multipart/form-data"),
        Err(MultipartError::InvalidBoundary)
    );
}

#[test]
fn test_file_part_metadata() {
    let form = parse_multipart(&form("XyZ"), "XyZ").unwrap();

    let file = form.file("avatar").expect("file part");
    assert_eq!(file.filename.as_deref(), Some("a.png"));
    assert_eq!(file.content_type.as_deref(), Some("image/png"));
    assert_eq!(file.data, vec![1, 2, 3]);
    assert_eq!(form.files().count(), 1);
    assert_eq!(form.fields().collect::<Vec<_>>(), vec![("name", "Alice")]);
    // A file part is not a text field
    assert_eq!(form.field("avatar"), None);
}

#[test]
fn test_missing_closing_boundary() {
    let body = b"--XyZ\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nvalue";

    assert_eq!(
        parse_multipart(body, "XyZ"),
        Err(MultipartError::MissingClosingBoundary)
    );
}

#[test]
fn test_missing_opening_boundary() {
    assert_eq!(
        parse_multipart(b"no delimiters here", "XyZ"),
        Err(MultipartError::MissingOpeningBoundary)
    );
}

#[test]
fn test_part_without_name() {
    let body = b"--XyZ\r\nContent-Disposition: form-data\r\n\r\nvalue\r\n--XyZ--";

    assert_eq!(parse_multipart(body, "XyZ"), Err(MultipartError::MissingName));
}
