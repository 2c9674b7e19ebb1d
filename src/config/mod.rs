//! Configuration module
//!
//! Provides engine-wide configuration loaded from TOML files, replacing all
//! hardcoded thresholds and batch caps with operator-tunable values.
//!
//! ## Loading Order
//!
//! 1. `MONAPPS_CONFIG` environment variable (path to TOML file)
//! 2. `monapps.toml` in the current working directory
//! 3. Built-in defaults (matching the original hardcoded values)
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! // In main():
//! config::init(Config::load());
//!
//! // Anywhere in the codebase:
//! let cap = config::get().batching.num_max_dsreadings_to_process;
//! ```

mod app_config;
pub mod defaults;

pub use app_config::*;

use std::sync::OnceLock;

/// Global engine configuration, initialized once at startup.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Initialize the global configuration.
///
/// Must be called exactly once before any calls to `get()`.
pub fn init(config: Config) {
    if CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once — ignoring");
    }
}

/// Get a reference to the global configuration.
///
/// Panics if `init()` has not been called. This is by design — a missing
/// config is a fatal startup error, not a recoverable condition.
pub fn get() -> &'static Config {
    CONFIG
        .get()
        .expect("config::get() called before config::init() — this is a startup bug")
}

/// Check whether the config has been initialized.
///
/// Useful for tests and optional config paths.
pub fn is_initialized() -> bool {
    CONFIG.get().is_some()
}
