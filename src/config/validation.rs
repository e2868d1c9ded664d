//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing upstreams)
//! - Validate value ranges (weights > 0, buffers > 0, timeouts > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;

use crate::config::schema::{ProxyConfig, RetryCondition, UpstreamConfig};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    if config.admin.enabled && config.admin.api_key.is_empty() {
        errors.push(ValidationError::new("admin.api_key", "must not be empty when the admin API is enabled"));
    }

    let mut names = HashSet::new();
    for (i, upstream) in config.upstreams.iter().enumerate() {
        if !names.insert(upstream.name.as_str()) {
            errors.push(ValidationError::new(
                format!("upstreams[{i}].name"),
                format!("duplicate upstream \"{}\"", upstream.name),
            ));
        }
        validate_upstream(i, upstream, &mut errors);
    }

    for (i, route) in config.routes.iter().enumerate() {
        if !names.contains(route.upstream.as_str()) {
            errors.push(ValidationError::new(
                format!("routes[{i}].upstream"),
                format!("unknown upstream \"{}\"", route.upstream),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_upstream(i: usize, upstream: &UpstreamConfig, errors: &mut Vec<ValidationError>) {
    let at = |field: &str| format!("upstreams[{i}].{field}");

    if upstream.servers.iter().all(|s| s.backup) {
        errors.push(ValidationError::new(at("servers"), "at least one primary server is required"));
    }
    for (j, server) in upstream.servers.iter().enumerate() {
        if server.weight == 0 {
            errors.push(ValidationError::new(at(&format!("servers[{j}].weight")), "must be greater than 0"));
        }
        if server.address.is_empty() {
            errors.push(ValidationError::new(at(&format!("servers[{j}].address")), "must not be empty"));
        }
    }

    let timeouts = &upstream.timeouts;
    for (name, value) in [
        ("timeouts.connect_ms", timeouts.connect_ms),
        ("timeouts.send_ms", timeouts.send_ms),
        ("timeouts.read_ms", timeouts.read_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(at(name), "must be greater than 0"));
        }
    }

    let buffering = &upstream.buffering;
    if buffering.buffer_size == 0 {
        errors.push(ValidationError::new(at("buffering.buffer_size"), "must be greater than 0"));
    }
    if buffering.buffers == 0 {
        errors.push(ValidationError::new(at("buffering.buffers"), "must be greater than 0"));
    }
    if buffering.header_buffer_size == 0 {
        errors.push(ValidationError::new(at("buffering.header_buffer_size"), "must be greater than 0"));
    }

    let retry_on = &upstream.retry.retry_on;
    if retry_on.contains(&RetryCondition::Off) && retry_on.len() > 1 {
        errors.push(ValidationError::new(
            at("retry.retry_on"),
            "\"off\" cannot be combined with other conditions",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{RouteConfig, ServerConfig};

    fn upstream(name: &str) -> UpstreamConfig {
        toml::from_str(&format!(
            "name = \"{name}\"\n[[servers]]\naddress = \"127.0.0.1:3000\"\n"
        ))
        .unwrap()
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn zero_weight_and_off_combination_rejected() {
        let mut config = ProxyConfig::default();
        let mut web = upstream("web");
        web.servers.push(ServerConfig::new("127.0.0.1:3001").weight(0));
        web.retry.retry_on = vec![RetryCondition::Off, RetryCondition::Error];
        config.upstreams.push(web);

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.field == "upstreams[0].servers[1].weight"));
    }

    #[test]
    fn duplicate_upstreams_and_dangling_routes() {
        let mut config = ProxyConfig::default();
        config.upstreams.push(upstream("web"));
        config.upstreams.push(upstream("web"));
        config.routes.push(RouteConfig {
            name: "r1".into(),
            host: None,
            path_prefix: Some("/".into()),
            upstream: "api".into(),
            priority: 0,
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
