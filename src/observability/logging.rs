//! Structured logging setup and log-safe formatting helpers
//!
//! Two output formats are supported:
//! - `json`: one JSON object per event, for production log shipping
//! - `pretty`: multi-line human-readable output for development
//!
//! `RUST_LOG` overrides the configured level when set.
//!
//! Caller addresses are personal data. Anything that logs a caller IP goes
//! through [`redact_ip`], which keeps only the network part.

use anyhow::{Result, anyhow};
use std::net::IpAddr;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber
///
/// Fails if a subscriber is already installed or the format is unknown.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_thread_ids(true);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init()?;
        }
        "pretty" => {
            let pretty_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_names(true);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(pretty_layer)
                .try_init()?;
        }
        other => {
            return Err(anyhow!("Unsupported log format: {}. Use 'json' or 'pretty'", other));
        }
    }

    Ok(())
}

/// Reduce an address to its network part for logging
///
/// IPv4 keeps the first two octets (`192.168.x.x`); IPv6 keeps the first
/// two groups (`2001:db8:x:x:x:x:x:x`).
pub fn redact_ip(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, _, _] = v4.octets();
            format!("{}.{}.x.x", a, b)
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            format!("{:x}:{:x}:x:x:x:x:x:x", segments[0], segments[1])
        }
    }
}
