//! Route registry: maps `(method, path pattern)` to handlers.
//!
//! Patterns are `/`-separated segments, each either a literal or a `{name}`
//! capture matching exactly one non-empty path segment. Two patterns that only
//! differ in capture names (`/u/{id}` vs `/u/{uid}`) are the same route.
//! When several patterns match a path, the one with a literal at the earliest
//! differing position wins.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use serde::Serialize;

use super::handler::{RouteHandler, SharedHandler};

/// Errors from building or querying a [`RouteRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("route already registered: {method} {pattern}")]
    DuplicateRoute { method: Method, pattern: String },
    #[error("invalid route pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("no route for {method} {path}")]
    NotFound { method: Method, path: String },
}

// ---------------------------------------------------------------------------
// PathParams
// ---------------------------------------------------------------------------

/// Values captured by `{name}` segments, in pattern order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PathParams(Vec<(String, String)>);

impl PathParams {
    #[must_use]
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// RoutePattern
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed path pattern.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    raw: Arc<str>,
    segments: Vec<Segment>,
}

fn split_path(path: &str) -> Vec<&str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    }
}

impl RoutePattern {
    /// Parses `raw`.
    ///
    /// # Errors
    ///
    /// [`RouteError::InvalidPattern`] if the pattern does not start with `/`,
    /// has an empty segment, a malformed or repeated capture, or a stray brace.
    pub fn parse(raw: &str) -> Result<Self, RouteError> {
        let invalid = |reason: &str| RouteError::InvalidPattern {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };

        if !raw.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let mut segments = Vec::new();
        for part in split_path(raw) {
            if part.is_empty() {
                return Err(invalid("empty path segment"));
            }
            if let Some(inner) = part.strip_prefix('{') {
                let Some(name) = inner.strip_suffix('}') else {
                    return Err(invalid("unterminated capture"));
                };
                if name.is_empty() {
                    return Err(invalid("capture needs a name"));
                }
                if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(invalid("capture names are limited to [A-Za-z0-9_]"));
                }
                if segments
                    .iter()
                    .any(|s| matches!(s, Segment::Param(p) if p == name))
                {
                    return Err(invalid("capture name used twice"));
                }
                segments.push(Segment::Param(name.to_string()));
            } else if part.contains(['{', '}']) {
                return Err(invalid("braces are only allowed around a whole segment"));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Ok(Self {
            raw: Arc::from(raw),
            segments,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Capture names in order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Identity used for duplicate detection: captures collapse to `{}`.
    fn shape(&self) -> String {
        let mut shape = String::new();
        for segment in &self.segments {
            shape.push('/');
            match segment {
                Segment::Literal(lit) => shape.push_str(lit),
                Segment::Param(_) => shape.push_str("{}"),
            }
        }
        if shape.is_empty() {
            shape.push('/');
        }
        shape
    }

    fn matches(&self, parts: &[&str]) -> Option<PathParams> {
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = Vec::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Param(name) if !part.is_empty() => {
                    params.push((name.clone(), (*part).to_string()));
                }
                _ => return None,
            }
        }
        Some(PathParams(params))
    }

    /// Ranking key: `true` per literal segment, compared left to right.
    fn specificity(&self) -> Vec<bool> {
        self.segments
            .iter()
            .map(|s| matches!(s, Segment::Literal(_)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// RouteRegistry
// ---------------------------------------------------------------------------

struct RouteEntry {
    pattern: RoutePattern,
    handler: SharedHandler,
}

/// Result of a successful [`RouteRegistry::resolve`].
#[derive(Clone)]
pub struct ResolvedRoute {
    pub handler: SharedHandler,
    pub pattern: Arc<str>,
    pub params: PathParams,
}

impl std::fmt::Debug for ResolvedRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedRoute")
            .field("pattern", &self.pattern)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// One line of the route listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    pub method: String,
    pub pattern: String,
}

/// Maps `(method, pattern)` to handlers.
///
/// Built up before the host starts, then frozen behind an `Arc` and only read.
#[derive(Default)]
pub struct RouteRegistry {
    routes: HashMap<Method, Vec<RouteEntry>>,
}

impl RouteRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler.
    ///
    /// # Errors
    ///
    /// [`RouteError::DuplicateRoute`] if the key is taken (the existing route
    /// is kept), or [`RouteError::InvalidPattern`].
    pub fn register(
        &mut self,
        method: Method,
        pattern: &str,
        handler: impl RouteHandler,
    ) -> Result<(), RouteError> {
        self.register_shared(method, pattern, Arc::new(handler))
    }

    /// Like [`register`](Self::register) for an already shared handler.
    pub fn register_shared(
        &mut self,
        method: Method,
        pattern: &str,
        handler: SharedHandler,
    ) -> Result<(), RouteError> {
        let pattern = RoutePattern::parse(pattern)?;
        self.check_free(&method, &pattern)?;
        self.insert(method, pattern, handler);
        Ok(())
    }

    /// Registers every route of `group`, or none of them.
    ///
    /// # Errors
    ///
    /// The first invalid or duplicate route, either against routes already
    /// registered or within the group itself. The registry is unchanged.
    pub fn mount(&mut self, group: RouteGroup) -> Result<(), RouteError> {
        let mut staged: Vec<(Method, RoutePattern, SharedHandler)> =
            Vec::with_capacity(group.routes.len());
        for (method, pattern, handler) in group.routes {
            let full = join_prefix(&group.prefix, &pattern);
            let parsed = RoutePattern::parse(&full)?;
            self.check_free(&method, &parsed)?;
            if staged
                .iter()
                .any(|(m, p, _)| *m == method && p.shape() == parsed.shape())
            {
                return Err(RouteError::DuplicateRoute {
                    method,
                    pattern: full,
                });
            }
            staged.push((method, parsed, handler));
        }
        for (method, pattern, handler) in staged {
            self.insert(method, pattern, handler);
        }
        Ok(())
    }

    fn check_free(&self, method: &Method, pattern: &RoutePattern) -> Result<(), RouteError> {
        let shape = pattern.shape();
        let taken = self
            .routes
            .get(method)
            .is_some_and(|entries| entries.iter().any(|e| e.pattern.shape() == shape));
        if taken {
            return Err(RouteError::DuplicateRoute {
                method: method.clone(),
                pattern: pattern.as_str().to_string(),
            });
        }
        Ok(())
    }

    fn insert(&mut self, method: Method, pattern: RoutePattern, handler: SharedHandler) {
        self.routes
            .entry(method)
            .or_default()
            .push(RouteEntry { pattern, handler });
    }

    /// Finds the handler for a request path.
    ///
    /// # Errors
    ///
    /// [`RouteError::NotFound`] if no pattern registered for `method` matches.
    pub fn resolve(&self, method: &Method, path: &str) -> Result<ResolvedRoute, RouteError> {
        let parts = split_path(path);
        let mut best: Option<(&RouteEntry, PathParams)> = None;

        for entry in self.routes.get(method).into_iter().flatten() {
            let Some(params) = entry.pattern.matches(&parts) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((current, _)) => {
                    entry.pattern.specificity() > current.pattern.specificity()
                }
            };
            if better {
                best = Some((entry, params));
            }
        }

        best.map(|(entry, params)| ResolvedRoute {
            handler: Arc::clone(&entry.handler),
            pattern: Arc::clone(&entry.pattern.raw),
            params,
        })
        .ok_or_else(|| RouteError::NotFound {
            method: method.clone(),
            path: path.to_string(),
        })
    }

    /// All registered routes, sorted by pattern then method.
    #[must_use]
    pub fn routes(&self) -> Vec<RouteInfo> {
        let mut out: Vec<RouteInfo> = self
            .routes
            .iter()
            .flat_map(|(method, entries)| {
                entries.iter().map(move |e| RouteInfo {
                    method: method.to_string(),
                    pattern: e.pattern.as_str().to_string(),
                })
            })
            .collect();
        out.sort_by(|a, b| (&a.pattern, &a.method).cmp(&(&b.pattern, &b.method)));
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// RouteGroup
// ---------------------------------------------------------------------------

fn join_prefix(prefix: &str, pattern: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if pattern == "/" {
        if prefix.is_empty() {
            "/".to_string()
        } else {
            prefix.to_string()
        }
    } else {
        format!("{prefix}{pattern}")
    }
}

/// A set of routes mounted together under a common prefix.
pub struct RouteGroup {
    prefix: String,
    routes: Vec<(Method, String, SharedHandler)>,
}

impl RouteGroup {
    /// `prefix` is prepended verbatim to every pattern (e.g. `/api/notes`).
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            routes: Vec::new(),
        }
    }

    #[must_use]
    pub fn route(mut self, method: Method, pattern: &str, handler: impl RouteHandler) -> Self {
        self.routes
            .push((method, pattern.to_string(), Arc::new(handler)));
        self
    }

    #[must_use]
    pub fn get(self, pattern: &str, handler: impl RouteHandler) -> Self {
        self.route(Method::GET, pattern, handler)
    }

    #[must_use]
    pub fn post(self, pattern: &str, handler: impl RouteHandler) -> Self {
        self.route(Method::POST, pattern, handler)
    }

    #[must_use]
    pub fn put(self, pattern: &str, handler: impl RouteHandler) -> Self {
        self.route(Method::PUT, pattern, handler)
    }

    #[must_use]
    pub fn delete(self, pattern: &str, handler: impl RouteHandler) -> Self {
        self.route(Method::DELETE, pattern, handler)
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
