//! Broker configuration.
//!
//! Every knob maps to a command-line flag; there is no config file. The
//! struct is built once in `main` and read-only afterwards.

use std::net::SocketAddr;
use std::time::Duration;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 1883;

/// Default maximum concurrent client sessions.
pub const DEFAULT_MAX_CLIENTS: usize = 8;

/// Broker configuration, assembled from command-line flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP bind address.
    pub bind: SocketAddr,
    /// Maximum concurrent sessions; further accepts are closed immediately.
    pub max_clients: usize,
    /// Dump every received frame as hex.
    pub log_raw: bool,
    /// Render publish payloads as UTF-8 in log lines.
    pub log_payload: bool,
    /// Prefix log lines with a timestamp.
    pub timestamp: bool,
    /// Deliver a PUBLISH back to its publisher if the publisher subscribes
    /// to the topic.
    pub reflect: bool,
    /// Tear the session down on any malformed frame instead of skipping it.
    pub disconnect_on_error: bool,
    /// Artificial sleep before CONNACK, to exercise client connect timeouts.
    pub connect_delay: Duration,
    /// Suppress non-error log output.
    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_clients: DEFAULT_MAX_CLIENTS,
            log_raw: false,
            log_payload: false,
            timestamp: false,
            reflect: false,
            disconnect_on_error: false,
            connect_delay: Duration::ZERO,
            quiet: false,
        }
    }
}
