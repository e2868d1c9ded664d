//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Look up matching route for request
//! - Return matched route or explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction; a reload builds a new router
//! - O(n) scan in priority order (acceptable for typical route counts)
//! - Ties in priority go to the longer path prefix, then config order
//! - Explicit `None` rather than silent default

use crate::config::RouteConfig;
use crate::routing::matcher::{AndMatcher, HostMatcher, Matcher, PathPrefixMatcher, RouteTarget};

/// A compiled route.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub upstream: String,
    priority: u32,
    prefix_len: usize,
    matcher: AndMatcher,
}

impl Route {
    fn compile(config: &RouteConfig) -> Self {
        let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
        if let Some(host) = &config.host {
            matchers.push(Box::new(HostMatcher::new(host)));
        }
        let mut prefix_len = 0;
        if let Some(prefix) = &config.path_prefix {
            let prefix = PathPrefixMatcher::new(prefix.as_str());
            prefix_len = prefix.len();
            matchers.push(Box::new(prefix));
        }
        Self {
            name: config.name.clone(),
            upstream: config.upstream.clone(),
            priority: config.priority,
            prefix_len,
            matcher: AndMatcher::new(matchers),
        }
    }
}

#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn from_config(routes: &[RouteConfig]) -> Self {
        let mut routes: Vec<Route> = routes.iter().map(Route::compile).collect();
        // stable sort keeps config order among equals
        routes.sort_by(|a, b| b.priority.cmp(&a.priority).then(b.prefix_len.cmp(&a.prefix_len)));
        tracing::debug!(routes = routes.len(), "Routes compiled");
        Self { routes }
    }

    /// First matching route.
    pub fn route(&self, target: &RouteTarget<'_>) -> Option<&Route> {
        self.routes.iter().find(|r| r.matcher.matches(target))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
