//! Route matching logic.
//!
//! # Responsibilities
//! - Match host header (exact match, case-insensitive, port ignored)
//! - Match path prefix (case-sensitive)
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Empty condition = always matches (wildcard)
//! - No regex to guarantee O(n) matching

/// The parts of a downstream request that routing looks at.
#[derive(Debug, Clone, Copy)]
pub struct RouteTarget<'a> {
    pub host: Option<&'a str>,
    pub path: &'a str,
}

impl<'a> RouteTarget<'a> {
    pub fn new(host: Option<&'a str>, path: &'a str) -> Self {
        Self { host, path }
    }
}

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the request matches this condition.
    fn matches(&self, target: &RouteTarget<'_>) -> bool;
}

/// Matches the Host header.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// The host is normalized to lowercase for case-insensitive matching.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_lowercase(),
        }
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, target: &RouteTarget<'_>) -> bool {
        target
            .host
            .map(strip_port)
            .is_some_and(|h| h.eq_ignore_ascii_case(&self.expected_host))
    }
}

fn strip_port(host: &str) -> &str {
    // [v6]:port keeps its brackets
    if host.starts_with('[') {
        return host.split_once(']').map_or(host, |(h, _)| &host[..h.len() + 1]);
    }
    host.split_once(':').map_or(host, |(h, _)| h)
}

/// Matches the request path prefix.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn len(&self) -> usize {
        self.prefix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty()
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, target: &RouteTarget<'_>) -> bool {
        target.path.starts_with(&self.prefix)
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, target: &RouteTarget<'_>) -> bool {
        self.matchers.iter().all(|m| m.matches(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_matcher() {
        let matcher = HostMatcher::new("example.com");

        assert!(matcher.matches(&RouteTarget::new(Some("example.com"), "/")));
        assert!(matcher.matches(&RouteTarget::new(Some("EXAMPLE.COM:8080"), "/")));
        assert!(!matcher.matches(&RouteTarget::new(Some("other.com"), "/")));
        assert!(!matcher.matches(&RouteTarget::new(None, "/")));

        let v6 = HostMatcher::new("[::1]");
        assert!(v6.matches(&RouteTarget::new(Some("[::1]:8080"), "/")));
    }

    #[test]
    fn test_path_matcher() {
        let matcher = PathPrefixMatcher::new("/api");
        assert!(matcher.matches(&RouteTarget::new(None, "/api/v1")));
        assert!(!matcher.matches(&RouteTarget::new(None, "/images")));
    }

    #[test]
    fn and_requires_every_condition() {
        let matcher = AndMatcher::new(vec![
            Box::new(HostMatcher::new("example.com")),
            Box::new(PathPrefixMatcher::new("/api")),
        ]);
        assert!(matcher.matches(&RouteTarget::new(Some("example.com"), "/api/x")));
        assert!(!matcher.matches(&RouteTarget::new(Some("example.com"), "/web")));
        assert!(!matcher.matches(&RouteTarget::new(Some("other.com"), "/api/x")));
        assert!(AndMatcher::new(Vec::new()).matches(&RouteTarget::new(None, "/")));
    }
}
