//! # Configuration System
//!
//! TOML-based configuration for the daemon: parsing, defaults and
//! validation.
//!
//! ## Example Configuration
//!
//! ```toml
//! [daemon]
//! name = "limits-east-1"
//! grpc_listen = "0.0.0.0:1051"
//! http_listen = "0.0.0.0:1050"
//!
//! [cache]
//! capacity = 50000
//!
//! [[peers.static_members]]
//! grpc_address = "10.0.0.1:1051"
//! http_address = "10.0.0.1:1050"
//! ```

mod error;
mod loader;
mod types;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use types::{
    BehaviorConfig, CacheConfig, DaemonConfig, DaemonSection, LoggingConfig, PeersConfig,
};
