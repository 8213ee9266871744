//! Runtime configuration loading.
//!
//! TOML is the sole config source.  Raw `Option`-typed mirror structs
//! absorb whatever the file contains; validation produces the concrete
//! config types or fails with `invalid-configuration`.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:4040"
//! drain_timeout_secs = 30
//!
//! [reconnect]
//! max_attempts = 10          # omit for unlimited, 0 disables
//! initial_delay_ms = 500
//! max_delay_ms = 30000
//! multiplier = 2.0
//!
//! [stream]
//! ring_capacity = 100
//! replay_capacity = 100
//! checkpoint_max_age_secs = 300
//! provisional_grace_secs = 10
//! ```

use crate::client::ReconnectPolicy;
use crate::error::{RuntimeError, RuntimeResult};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Concrete config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub server: ServerSettings,
    pub reconnect: ReconnectPolicy,
    pub stream: StreamSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            server: ServerSettings::default(),
            reconnect: ReconnectPolicy::default(),
            stream: StreamSettings::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind: String,
    pub drain_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind: "127.0.0.1:0".to_owned(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Stream engine tuning shared by server and client.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Client-side resume cache of received frames, per stream.
    pub ring_capacity: usize,
    /// Server-side buffer of sent frames retained for resume, per stream.
    pub replay_capacity: usize,
    /// Checkpoints older than this are not resumed.
    pub checkpoint_max_age: Duration,
    /// Provisional subscriptions with no canonical rebind within this
    /// window are reaped.
    pub provisional_grace: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        StreamSettings {
            ring_capacity: 100,
            replay_capacity: 100,
            checkpoint_max_age: Duration::from_secs(300),
            provisional_grace: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    server: Option<RawServer>,
    reconnect: Option<RawReconnect>,
    stream: Option<RawStream>,
}

#[derive(Debug, Default, Deserialize)]
struct RawServer {
    bind: Option<String>,
    drain_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawReconnect {
    max_attempts: Option<u32>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStream {
    ring_capacity: Option<usize>,
    replay_capacity: Option<usize>,
    checkpoint_max_age_secs: Option<u64>,
    provisional_grace_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

pub fn load_config(path: &Path) -> RuntimeResult<RuntimeConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        RuntimeError::InvalidConfiguration(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_config(&text)
}

pub fn parse_config(text: &str) -> RuntimeResult<RuntimeConfig> {
    let raw: RawConfig = toml::from_str(text)
        .map_err(|e| RuntimeError::InvalidConfiguration(format!("TOML parse: {e}")))?;
    validate(raw)
}

fn validate(raw: RawConfig) -> RuntimeResult<RuntimeConfig> {
    let defaults = RuntimeConfig::default();

    let server = {
        let raw = raw.server.unwrap_or_default();
        let bind = raw.bind.unwrap_or(defaults.server.bind);
        if bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(RuntimeError::InvalidConfiguration(format!(
                "server.bind `{bind}` is not a socket address"
            )));
        }
        ServerSettings {
            bind,
            drain_timeout: raw
                .drain_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.server.drain_timeout),
        }
    };

    let reconnect = {
        let raw = raw.reconnect.unwrap_or_default();
        let policy = ReconnectPolicy {
            max_attempts: raw.max_attempts.map(Some).unwrap_or(defaults.reconnect.max_attempts),
            initial_delay: raw
                .initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect.initial_delay),
            max_delay: raw
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect.max_delay),
            multiplier: raw.multiplier.unwrap_or(defaults.reconnect.multiplier),
        };
        if policy.multiplier < 1.0 {
            return Err(RuntimeError::InvalidConfiguration(format!(
                "reconnect.multiplier {} must be >= 1.0",
                policy.multiplier
            )));
        }
        if policy.initial_delay > policy.max_delay {
            return Err(RuntimeError::InvalidConfiguration(
                "reconnect.initial_delay_ms exceeds max_delay_ms".to_owned(),
            ));
        }
        policy
    };

    let stream = {
        let raw = raw.stream.unwrap_or_default();
        let settings = StreamSettings {
            ring_capacity: raw.ring_capacity.unwrap_or(defaults.stream.ring_capacity),
            replay_capacity: raw
                .replay_capacity
                .unwrap_or(defaults.stream.replay_capacity),
            checkpoint_max_age: raw
                .checkpoint_max_age_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.stream.checkpoint_max_age),
            provisional_grace: raw
                .provisional_grace_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.stream.provisional_grace),
        };
        if settings.ring_capacity == 0 || settings.replay_capacity == 0 {
            return Err(RuntimeError::InvalidConfiguration(
                "stream capacities must be at least 1".to_owned(),
            ));
        }
        settings
    };

    Ok(RuntimeConfig {
        server,
        reconnect,
        stream,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:0");
        assert_eq!(config.stream.ring_capacity, 100);
        assert_eq!(config.stream.checkpoint_max_age, Duration::from_secs(300));
        assert_eq!(config.reconnect.max_attempts, None);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = parse_config(
            r#"
            [server]
            bind = "0.0.0.0:4040"
            drain_timeout_secs = 5

            [reconnect]
            max_attempts = 3
            initial_delay_ms = 100
            max_delay_ms = 1000
            multiplier = 1.5

            [stream]
            ring_capacity = 10
            replay_capacity = 20
            checkpoint_max_age_secs = 60
            provisional_grace_secs = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:4040");
        assert_eq!(config.server.drain_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect.max_attempts, Some(3));
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(100));
        assert_eq!(config.stream.ring_capacity, 10);
        assert_eq!(config.stream.replay_capacity, 20);
        assert_eq!(config.stream.provisional_grace, Duration::from_secs(2));
    }

    #[test]
    fn bad_values_fail_with_invalid_configuration() {
        for text in [
            "[server]\nbind = \"not-an-addr\"",
            "[reconnect]\nmultiplier = 0.5",
            "[reconnect]\ninitial_delay_ms = 5000\nmax_delay_ms = 100",
            "[stream]\nring_capacity = 0",
            "not toml at all [",
        ] {
            let err = parse_config(text).unwrap_err();
            assert!(
                matches!(err, RuntimeError::InvalidConfiguration(_)),
                "expected invalid-configuration for {text:?}"
            );
        }
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let config = parse_config("[server]\nbind = \"127.0.0.1:9\"\nfuture_knob = true").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:9");
    }
}
