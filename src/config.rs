//! Runtime configuration.
//!
//! A small set of knobs read by the runtime at well defined points. The
//! configuration is process-wide: load it once at startup from a JSON file
//! with [`load_from_file`] (keys use the dotted names below), or install it
//! programmatically with [`set`]. Every knob has a default, so running
//! without any configuration is fine.
//!
//! | key | effect |
//! |-----|--------|
//! | `fiber.stack_size` | default private fiber stack size in bytes |
//! | `tcp.connect.timeout` | default timeout for hooked `connect`, ms |
//! | `tcp_server.read_timeout` | receive timeout applied to accepted sockets, ms |

use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::Result;

const DEFAULT_STACK_SIZE: usize = 1024 * 1024;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SERVER_READ_TIMEOUT_MS: u64 = 120_000;

/// Process-wide runtime configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Default private stack size for new fibers, in bytes.
    #[serde(rename = "fiber.stack_size")]
    pub fiber_stack_size: usize,

    /// Default timeout for hooked `connect`, in milliseconds.
    #[serde(rename = "tcp.connect.timeout")]
    pub tcp_connect_timeout_ms: u64,

    /// Receive timeout applied to sockets accepted by [`crate::net::TcpListener`],
    /// in milliseconds.
    #[serde(rename = "tcp_server.read_timeout")]
    pub tcp_server_read_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            fiber_stack_size: DEFAULT_STACK_SIZE,
            tcp_connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            tcp_server_read_timeout_ms: DEFAULT_SERVER_READ_TIMEOUT_MS,
        }
    }
}

static CURRENT: Lazy<RwLock<Arc<Config>>> = Lazy::new(|| RwLock::new(Arc::new(Config::default())));

/// Get the current configuration.
#[inline]
pub fn get() -> Arc<Config> {
    CURRENT.read().unwrap().clone()
}

/// Install a configuration, replacing the current one.
///
/// Fibers, sockets and timers created before the call keep the values they
/// were built with.
pub fn set(config: Config) {
    *CURRENT.write().unwrap() = Arc::new(config);
}

/// Load the configuration from a JSON file and install it.
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let raw = fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&raw)?;
    set(config);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.fiber_stack_size, 1024 * 1024);
        assert_eq!(c.tcp_connect_timeout_ms, 5_000);
        assert_eq!(c.tcp_server_read_timeout_ms, 120_000);
    }

    #[test]
    fn parse_dotted_keys() {
        let c: Config = serde_json::from_str(
            r#"{ "fiber.stack_size": 262144, "tcp.connect.timeout": 1000 }"#,
        )
        .unwrap();
        assert_eq!(c.fiber_stack_size, 262_144);
        assert_eq!(c.tcp_connect_timeout_ms, 1_000);
        // unspecified keys fall back to defaults
        assert_eq!(c.tcp_server_read_timeout_ms, 120_000);
    }

    #[test]
    fn rejects_malformed() {
        assert!(serde_json::from_str::<Config>("{ not json }").is_err());
    }
}
