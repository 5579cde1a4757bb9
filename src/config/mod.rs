//! Configuration module for Tidepool
//!
//! Session settings are plain values that can be built in code or loaded from
//! the TOML file consumed by the `tidepool` binary.
//!
//! # Example
//!
//! ```no_run
//! use tidepool::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("crawl.toml")).unwrap();
//! println!("Crawler will run {} fetches at once", config.session.concurrency);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    Config, Interval, RequestConfig, RuleAction, RuleEntry, SeedEntry, Settings,
    DEFAULT_TIMEOUT_MS,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, load_headers};
pub use validation::validate_settings;
