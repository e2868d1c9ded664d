//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → upstream registry + route table built from it
//!
//! On reload signal:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → registry rebuilt and swapped atomically
//!     → new sessions observe new peers; running sessions finish on the old ones
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, BalanceMethod, BufferingConfig, KeepaliveConfig, ListenerConfig, LogFormat,
    ObservabilityConfig, ProxyConfig, RetryCondition, RetryConfig, RouteConfig, ServerConfig,
    TimeoutConfig, UpstreamConfig, UpstreamTlsConfig,
};
