//! Endpoint patterns with path parameters.
//!
//! `/users/{id}` and `/users/:id` are equivalent. A pattern may carry a method
//! prefix (`GET /users/{id}`) and end in a catch-all (`/files/{*rest}`).
//! Patterns compile to an anchored regex once, at hook creation.

use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct EndpointPattern {
    raw: String,
    method: Option<String>,
    regex: Arc<Regex>,
    params: Vec<String>,
}

impl fmt::Debug for EndpointPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EndpointPattern").field(&self.raw).finish()
    }
}

impl PartialEq for EndpointPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

/// Split `"GET /path"` into method and path. A bare path has no method.
fn split_method(endpoint: &str) -> (Option<&str>, &str) {
    let trimmed = endpoint.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some((method, path)) if !method.starts_with('/') => (Some(method), path.trim()),
        _ => (None, trimmed),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parameter name of a segment: `{id}`, `:id`, or `{*rest}` (catch-all).
fn param_segment(segment: &str) -> Option<(&str, bool)> {
    let name = if let Some(inner) = segment
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
    {
        inner
    } else {
        segment.strip_prefix(':')?
    };
    match name.strip_prefix('*') {
        Some(rest) if is_identifier(rest) => Some((rest, true)),
        None if is_identifier(name) => Some((name, false)),
        _ => None,
    }
}

impl EndpointPattern {
    pub fn parse(pattern: &str) -> Result<Self, regex::Error> {
        let (method, path) = split_method(pattern);
        let mut expr = String::from("^");
        let mut params = Vec::new();

        for (index, segment) in path.split('/').enumerate() {
            if index > 0 {
                expr.push('/');
            }
            match param_segment(segment) {
                Some((name, true)) => {
                    expr.push_str(&format!("(?P<{name}>.*)"));
                    params.push(name.to_string());
                }
                Some((name, false)) => {
                    expr.push_str(&format!("(?P<{name}>[^/]+)"));
                    params.push(name.to_string());
                }
                None => expr.push_str(&regex::escape(segment)),
            }
        }
        expr.push('$');

        Ok(Self {
            raw: pattern.trim().to_string(),
            method: method.map(|m| m.to_ascii_uppercase()),
            regex: Arc::new(Regex::new(&expr)?),
            params,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn param_names(&self) -> &[String] {
        &self.params
    }

    fn path_of<'a>(&self, endpoint: &'a str) -> Option<&'a str> {
        let (method, path) = split_method(endpoint);
        if let Some(ref expected) = self.method {
            match method {
                Some(actual) if actual.eq_ignore_ascii_case(expected) => {}
                _ => return None,
            }
        }
        Some(path.split_once('?').map(|(p, _)| p).unwrap_or(path))
    }

    pub fn matches(&self, endpoint: &str) -> bool {
        self.path_of(endpoint)
            .map(|path| self.regex.is_match(path))
            .unwrap_or(false)
    }

    /// Percent-decoded path parameters, or `None` when the endpoint does not match.
    pub fn captures(&self, endpoint: &str) -> Option<HashMap<String, String>> {
        let path = self.path_of(endpoint)?;
        let caps = self.regex.captures(path)?;
        Some(
            self.params
                .iter()
                .filter_map(|name| {
                    let value = caps.name(name)?.as_str();
                    let decoded = urlencoding::decode(value)
                        .map(|v| v.into_owned())
                        .unwrap_or_else(|_| value.to_string());
                    Some((name.clone(), decoded))
                })
                .collect(),
        )
    }
}

/// Whether a matcher string should be read as an endpoint pattern.
pub(crate) fn looks_like_endpoint(pattern: &str) -> bool {
    let (_, path) = split_method(pattern);
    path.starts_with('/')
}
