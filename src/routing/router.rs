//! Handler and interceptor selection.
//!
//! Handler mappings resolve by precedence: exact path, then the longest
//! matching prefix, then extension, then the default `/` mapping.
//! Interceptors are not ranked: every interceptor whose pattern matches joins
//! the chain, in registration order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use crate::routing::handler::{Endpoint, Handler, Interceptor};
use crate::routing::pattern::{extension_of, prefix_matches, PatternError, UrlPattern};
use crate::ws::session::WsHandler;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("URL pattern {0} is already mapped to a handler")]
    Duplicate(String),
    #[error("no URL patterns given")]
    NoPatterns,
}

/// Collects mappings at startup; frozen into a [`Router`] by `build`.
#[derive(Default)]
pub struct RouterBuilder {
    context_path: String,
    handlers: Vec<(UrlPattern, Endpoint)>,
    seen: HashSet<UrlPattern>,
    interceptors: Vec<(UrlPattern, Arc<dyn Interceptor>)>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix stripped from request paths before matching.
    pub fn context_path(&mut self, context_path: impl Into<String>) -> &mut Self {
        self.context_path = context_path.into();
        self
    }

    pub fn handler(
        &mut self,
        patterns: &[&str],
        handler: Arc<dyn Handler>,
    ) -> Result<&mut Self, RouteError> {
        self.endpoint(patterns, Endpoint::Http(handler))
    }

    pub fn websocket(
        &mut self,
        patterns: &[&str],
        handler: Arc<dyn WsHandler>,
    ) -> Result<&mut Self, RouteError> {
        self.endpoint(patterns, Endpoint::WebSocket(handler))
    }

    /// Maps every pattern to `endpoint`. Nothing is registered if any
    /// pattern is invalid or already taken.
    pub fn endpoint(
        &mut self,
        patterns: &[&str],
        endpoint: Endpoint,
    ) -> Result<&mut Self, RouteError> {
        let parsed = parse_all(patterns)?;

        let mut batch = HashSet::new();
        for pattern in &parsed {
            if self.seen.contains(pattern) || !batch.insert(pattern.clone()) {
                return Err(RouteError::Duplicate(pattern.to_string()));
            }
        }

        for pattern in parsed {
            tracing::debug!(pattern = %pattern, endpoint = ?endpoint, "Handler mapped");
            self.seen.insert(pattern.clone());
            self.handlers.push((pattern, endpoint.clone()));
        }
        Ok(self)
    }

    pub fn interceptor(
        &mut self,
        interceptor: Arc<dyn Interceptor>,
        patterns: &[&str],
    ) -> Result<&mut Self, RouteError> {
        for pattern in parse_all(patterns)? {
            tracing::debug!(pattern = %pattern, "Interceptor mapped");
            self.interceptors.push((pattern, Arc::clone(&interceptor)));
        }
        Ok(self)
    }

    pub fn build(self) -> Router {
        let mut router = Router {
            context_path: self.context_path.trim_end_matches('/').to_string(),
            exact: HashMap::new(),
            prefixes: Vec::new(),
            extensions: HashMap::new(),
            default: None,
            interceptors: self.interceptors,
        };

        for (pattern, endpoint) in self.handlers {
            match pattern {
                UrlPattern::Exact(path) => {
                    router.exact.insert(path, endpoint);
                }
                UrlPattern::Prefix(prefix) => router.prefixes.push((prefix, endpoint)),
                UrlPattern::Extension(ext) => {
                    router.extensions.insert(ext, endpoint);
                }
                UrlPattern::Default => router.default = Some(endpoint),
            }
        }

        // Longest prefix first, so the first hit is the most specific
        router
            .prefixes
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));

        router
    }
}

fn parse_all(patterns: &[&str]) -> Result<Vec<UrlPattern>, RouteError> {
    if patterns.is_empty() {
        return Err(RouteError::NoPatterns);
    }
    patterns
        .iter()
        .map(|p| UrlPattern::parse(p).map_err(RouteError::from))
        .collect()
}

/// The handler chosen for a request and the interceptors that wrap it.
#[derive(Clone)]
pub struct Resolved {
    pub endpoint: Endpoint,
    pub pattern: UrlPattern,
    pub interceptors: Vec<Arc<dyn Interceptor>>,
}

/// Immutable mapping tables, shared by every dispatcher.
pub struct Router {
    context_path: String,
    exact: HashMap<String, Endpoint>,
    prefixes: Vec<(String, Endpoint)>,
    extensions: HashMap<String, Endpoint>,
    default: Option<Endpoint>,
    interceptors: Vec<(UrlPattern, Arc<dyn Interceptor>)>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn context_path(&self) -> &str {
        if self.context_path.is_empty() {
            "/"
        } else {
            &self.context_path
        }
    }

    /// The request path relative to the context path, or `None` when the
    /// request lies outside it.
    pub fn strip_context<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.context_path.is_empty() {
            return Some(path);
        }
        match path.strip_prefix(self.context_path.as_str()) {
            Some("") => Some("/"),
            Some(rest) if rest.starts_with('/') => Some(rest),
            _ => None,
        }
    }

    /// Resolves a full request path (context path included).
    pub fn resolve(&self, path: &str) -> Option<Resolved> {
        let path = self.strip_context(path)?;
        let (pattern, endpoint) = self.match_handler(path)?;

        Some(Resolved {
            endpoint: endpoint.clone(),
            pattern,
            interceptors: self.interceptors_for(path),
        })
    }

    /// Best handler mapping for a context-relative path.
    pub fn match_handler(&self, path: &str) -> Option<(UrlPattern, &Endpoint)> {
        if let Some(endpoint) = self.exact.get(path) {
            return Some((UrlPattern::Exact(path.to_string()), endpoint));
        }

        if let Some((prefix, endpoint)) = self
            .prefixes
            .iter()
            .find(|(prefix, _)| prefix_matches(prefix, path))
        {
            return Some((UrlPattern::Prefix(prefix.clone()), endpoint));
        }

        if let Some((ext, endpoint)) = extension_of(path)
            .and_then(|ext| self.extensions.get_key_value(ext))
        {
            return Some((UrlPattern::Extension(ext.clone()), endpoint));
        }

        self.default
            .as_ref()
            .map(|endpoint| (UrlPattern::Default, endpoint))
    }

    /// Interceptors matching a context-relative path, in registration order.
    pub fn interceptors_for(&self, path: &str) -> Vec<Arc<dyn Interceptor>> {
        self.interceptors
            .iter()
            .filter(|(pattern, _)| pattern.matches(path))
            .map(|(_, interceptor)| Arc::clone(interceptor))
            .collect()
    }

    pub fn handler_count(&self) -> usize {
        self.exact.len()
            + self.prefixes.len()
            + self.extensions.len()
            + usize::from(self.default.is_some())
    }

    pub fn interceptor_count(&self) -> usize {
        self.interceptors.len()
    }
}
