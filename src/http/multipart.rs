//! `multipart/form-data` body parsing.
//!
//! A body is split on its declared boundary into parts, each carrying a
//! `Content-Disposition` with the field name and, for uploads, a filename.

use thiserror::Error;

use crate::http::request::Headers;

/// Longest boundary permitted by RFC 2046.
pub const MAX_BOUNDARY_LEN: usize = 70;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultipartError {
    #[error("missing or malformed multipart boundary")]
    InvalidBoundary,
    #[error("body does not start with the declared boundary")]
    MissingOpeningBoundary,
    #[error("body ends before the closing boundary")]
    MissingClosingBoundary,
    #[error("malformed part headers")]
    InvalidPartHeaders,
    #[error("part has no form field name")]
    MissingName,
}

/// One part of a form submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl Part {
    pub fn is_file(&self) -> bool {
        self.filename.is_some()
    }

    /// The part's content as text, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Parts of a `multipart/form-data` body, in the order they were sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Multipart {
    parts: Vec<Part>,
}

impl Multipart {
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Value of the first non-file field called `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.parts
            .iter()
            .find(|p| !p.is_file() && p.name == name)
            .and_then(Part::text)
    }

    /// First file part uploaded under `name`.
    pub fn file(&self, name: &str) -> Option<&Part> {
        self.parts.iter().find(|p| p.is_file() && p.name == name)
    }

    /// Every text field as `(name, value)` pairs.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parts
            .iter()
            .filter(|p| !p.is_file())
            .filter_map(|p| p.text().map(|t| (p.name.as_str(), t)))
    }

    pub fn files(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().filter(|p| p.is_file())
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Extracts the boundary parameter from a `Content-Type` value.
///
/// Returns `Ok(None)` when the content type is not `multipart/form-data`.
pub fn boundary_from_content_type(content_type: &str) -> Result<Option<String>, MultipartError> {
    let mut params = content_type.split(';');
    let media_type = params.next().unwrap_or_default().trim();

    if !media_type.eq_ignore_ascii_case("multipart/form-data") {
        return Ok(None);
    }

    let boundary = params
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .ok_or(MultipartError::InvalidBoundary)?;

    if boundary.is_empty() || boundary.len() > MAX_BOUNDARY_LEN {
        return Err(MultipartError::InvalidBoundary);
    }

    Ok(Some(boundary))
}

/// Splits `body` into parts delimited by `boundary`.
///
/// Anything before the first delimiter (the preamble) and after the closing
/// delimiter (the epilogue) is ignored.
pub fn parse_multipart(body: &[u8], boundary: &str) -> Result<Multipart, MultipartError> {
    if boundary.is_empty() || boundary.len() > MAX_BOUNDARY_LEN {
        return Err(MultipartError::InvalidBoundary);
    }

    let delimiter = format!("--{}", boundary).into_bytes();
    let separator = format!("\r\n--{}", boundary).into_bytes();

    let start = find(body, &delimiter).ok_or(MultipartError::MissingOpeningBoundary)?;
    let mut rest = &body[start + delimiter.len()..];
    let mut parts = Vec::new();

    loop {
        if rest.starts_with(b"--") {
            return Ok(Multipart { parts });
        }

        rest = rest
            .strip_prefix(b"\r\n")
            .ok_or(MultipartError::MissingClosingBoundary)?;

        let headers_end = find(rest, b"\r\n\r\n").ok_or(MultipartError::InvalidPartHeaders)?;
        let headers = parse_part_headers(&rest[..headers_end])?;
        let content = &rest[headers_end + 4..];

        let end = find(content, &separator).ok_or(MultipartError::MissingClosingBoundary)?;
        parts.push(build_part(&headers, content[..end].to_vec())?);

        rest = &content[end + separator.len()..];
    }
}

fn parse_part_headers(raw: &[u8]) -> Result<Headers, MultipartError> {
    let text = std::str::from_utf8(raw).map_err(|_| MultipartError::InvalidPartHeaders)?;
    let mut headers = Headers::new();

    for line in text.split("\r\n").filter(|l| !l.is_empty()) {
        let (key, value) = line
            .split_once(':')
            .ok_or(MultipartError::InvalidPartHeaders)?;
        headers.append(key.trim(), value.trim());
    }

    Ok(headers)
}

fn build_part(headers: &Headers, data: Vec<u8>) -> Result<Part, MultipartError> {
    let disposition = headers
        .get("Content-Disposition")
        .ok_or(MultipartError::MissingName)?;

    let mut name = None;
    let mut filename = None;

    for param in disposition.split(';').skip(1) {
        if let Some((key, value)) = param.split_once('=') {
            let value = value.trim().trim_matches('"').to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "name" => name = Some(value),
                "filename" => filename = Some(value),
                _ => {}
            }
        }
    }

    Ok(Part {
        name: name.ok_or(MultipartError::MissingName)?,
        filename,
        content_type: headers.get("Content-Type").map(str::to_string),
        data,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
