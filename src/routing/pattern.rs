//! URL patterns with servlet-style matching rules.
//!
//! | pattern    | kind      | matches                                   |
//! |------------|-----------|-------------------------------------------|
//! | `/json`    | exact     | `/json` only                              |
//! | `/json/*`  | prefix    | `/json`, `/json/a`, `/json/a/b`; not `/jsonx` |
//! | `/*`       | prefix    | everything                                |
//! | `*.json`   | extension | any path whose last segment ends in `.json` |
//! | `/`        | default   | everything, at the lowest precedence      |

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("empty URL pattern")]
    Empty,
    #[error("invalid URL pattern {0:?}: must start with '/' or '*.'")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UrlPattern {
    Exact(String),
    /// Stored without the trailing `/*`; empty for `/*`
    Prefix(String),
    /// Stored without the leading `*.`
    Extension(String),
    Default,
}

impl UrlPattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PatternError::Empty);
        }

        if let Some(ext) = raw.strip_prefix("*.") {
            if ext.is_empty() || ext.contains('/') {
                return Err(PatternError::Invalid(raw.to_string()));
            }
            return Ok(UrlPattern::Extension(ext.to_string()));
        }

        if !raw.starts_with('/') || (raw.contains('*') && !raw.ends_with("/*")) {
            return Err(PatternError::Invalid(raw.to_string()));
        }

        if raw == "/" {
            return Ok(UrlPattern::Default);
        }

        if let Some(prefix) = raw.strip_suffix("/*") {
            if prefix.contains('*') {
                return Err(PatternError::Invalid(raw.to_string()));
            }
            return Ok(UrlPattern::Prefix(prefix.to_string()));
        }

        Ok(UrlPattern::Exact(raw.to_string()))
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            UrlPattern::Exact(exact) => path == exact,
            UrlPattern::Prefix(prefix) => prefix_matches(prefix, path),
            UrlPattern::Extension(ext) => extension_of(path) == Some(ext.as_str()),
            UrlPattern::Default => true,
        }
    }
}

impl std::fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UrlPattern::Exact(path) => f.write_str(path),
            UrlPattern::Prefix(prefix) => write!(f, "{}/*", prefix),
            UrlPattern::Extension(ext) => write!(f, "*.{}", ext),
            UrlPattern::Default => f.write_str("/"),
        }
    }
}

/// The prefix must cover whole path segments.
pub(crate) fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Extension of the final path segment, without the dot.
pub(crate) fn extension_of(path: &str) -> Option<&str> {
    let segment = path.rsplit('/').next()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() && ext.is_empty() {
        return None;
    }
    Some(ext)
}
