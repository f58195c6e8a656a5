use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// transit-relay fan-out server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "transit-relay", version, about = "Soft-realtime fan-out relay for live fleet tracking")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "RELAY_PORT", default_value = "3000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "RELAY_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./relay.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "RELAY_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Minimum planar displacement between broadcast positions, in degrees
    #[arg(long, env = "RELAY_MOVEMENT_THRESHOLD_DEG", default_value = "0.0001")]
    pub movement_threshold_deg: f64,

    /// Maximum seconds between broadcasts for a live driver, even when stationary
    #[arg(long, env = "RELAY_HEARTBEAT_SECS", default_value = "15")]
    pub heartbeat_secs: u64,

    /// Location updates allowed per connection per minute
    #[arg(long, env = "RELAY_MAX_UPDATES_PER_MINUTE", default_value = "60")]
    pub max_updates_per_minute: u32,

    /// Seconds a disconnected driver is retained and eligible for reconnection
    #[arg(long, env = "RELAY_GRACE_PERIOD_SECS", default_value = "30")]
    pub grace_period_secs: u64,

    /// Seconds without an update before a record is eligible for reaping
    #[arg(long, env = "RELAY_STALE_TIMEOUT_SECS", default_value = "300")]
    pub stale_timeout_secs: u64,

    /// Seconds between reaper sweeps
    #[arg(long, env = "RELAY_CLEANUP_INTERVAL_SECS", default_value = "60")]
    pub cleanup_interval_secs: u64,

    /// Maximum drivers returned in a snapshot before truncation
    #[arg(long, env = "RELAY_MAX_SNAPSHOT_DRIVERS", default_value = "100")]
    pub max_snapshot_drivers: usize,

    /// Seconds between WebSocket keepalive pings
    #[arg(long, env = "RELAY_WS_PING_INTERVAL_SECS", default_value = "25")]
    pub ws_ping_interval_secs: u64,

    /// Seconds to wait for a pong before declaring the peer dead
    #[arg(long, env = "RELAY_WS_PONG_TIMEOUT_SECS", default_value = "60")]
    pub ws_pong_timeout_secs: u64,

    /// Milliseconds to let the shutdown notice drain before closing the listener
    #[arg(long, env = "RELAY_SHUTDOWN_SETTLE_MS", default_value = "500")]
    pub shutdown_settle_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            bind_address: "0.0.0.0".to_string(),
            config: "./relay.toml".to_string(),
            json_logs: false,
            generate_config: false,
            movement_threshold_deg: 0.0001,
            heartbeat_secs: 15,
            max_updates_per_minute: 60,
            grace_period_secs: 30,
            stale_timeout_secs: 300,
            cleanup_interval_secs: 60,
            max_snapshot_drivers: 100,
            ws_ping_interval_secs: 25,
            ws_pong_timeout_secs: 60,
            shutdown_settle_ms: 500,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (RELAY_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("RELAY_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# transit-relay Configuration
# Place this file at ./relay.toml or specify with --config <path>
# All settings can be overridden via environment variables (RELAY_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 3000)
# port = 3000

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Minimum displacement between broadcast positions, in degrees.
# 0.0001 deg is roughly 11 m at mid-latitudes; stationary GPS jitter
# below this is suppressed.
# movement_threshold_deg = 0.0001

# Maximum seconds between broadcasts for a live driver (forced heartbeat)
# heartbeat_secs = 15

# Location updates allowed per connection per minute
# max_updates_per_minute = 60

# Seconds a disconnected driver is retained for reconnection
# grace_period_secs = 30

# Seconds without updates before a record is eligible for reaping
# stale_timeout_secs = 300

# Seconds between reaper sweeps
# cleanup_interval_secs = 60

# Maximum drivers in a snapshot before truncation
# max_snapshot_drivers = 100
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.heartbeat_secs, 15);
        assert_eq!(cfg.max_updates_per_minute, 60);
        assert_eq!(cfg.grace_period_secs, 30);
        assert_eq!(cfg.stale_timeout_secs, 300);
        assert!((cfg.movement_threshold_deg - 0.0001).abs() < f64::EPSILON);
    }

    #[test]
    fn template_is_fully_commented() {
        let template = generate_config_template();
        // Every line is a comment or blank so the template is inert as-is.
        for line in template.lines() {
            let trimmed = line.trim();
            assert!(trimmed.is_empty() || trimmed.starts_with('#'), "live line: {line}");
        }
    }
}
