use serde::Serialize;
use std::fmt;

/// Canonical identity of a read request
///
/// Two requests that differ only in query parameter order, empty parameters,
/// a trailing slash or method casing produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RouteKey {
    method: String,
    route: String,
    query: Vec<(String, String)>,
    user_id: Option<String>,
}

impl RouteKey {
    pub fn new(method: &str, path: &str, query: Option<&str>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            route: normalize_route(path),
            query: normalize_query(query.unwrap_or("")),
            user_id: None,
        }
    }

    /// Scope the key to one caller, for routes whose data differs per user
    pub fn scoped_to(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Whether this key's route is `prefix` or lies below it
    pub fn route_within(&self, prefix: &str) -> bool {
        let prefix = normalize_route(prefix);
        if prefix == "/" {
            return true;
        }
        match self.route.strip_prefix(prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, escape(&self.route))?;
        for (i, (name, value)) in self.query.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, escape(name), escape(value))?;
        }
        if let Some(user_id) = &self.user_id {
            write!(f, " @{}", escape(user_id))?;
        }
        Ok(())
    }
}

fn normalize_route(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Drop empty pairs, then sort by name; repeated names keep their order
fn normalize_query(query: &str) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .filter(|(name, _)| !name.is_empty())
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
}

/// Escape characters that carry structure in the rendered key
fn escape(input: &str) -> String {
    input
        .replace('%', "%25")
        .replace('?', "%3F")
        .replace('&', "%26")
        .replace('=', "%3D")
        .replace(' ', "%20")
        .replace('@', "%40")
}
