use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use hearth_admission::AdmissionConfig;

// Gateway node configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // Client-facing listener (WebSocket upgrades + operator API).
    pub bind: SocketAddr,
    // Prometheus scrape listener.
    pub metrics_bind: SocketAddr,
    // External store URL; absent means the in-memory store (single node).
    pub redis_url: Option<String>,
    // Store connection pool size.
    pub store_pool_size: usize,
    // Per-operation store deadline.
    pub store_op_timeout_ms: u64,
    // Admits allowed per source per rolling minute.
    pub connections_per_ip_per_minute: u32,
    // Admits allowed per wall second across all sources.
    pub global_connections_per_second: u32,
    // Hard ceiling on cluster-wide concurrent connections.
    pub max_global_connections: u64,
    // Whether this node runs the cluster tick (externally elected).
    pub tick_leader: bool,
    // Tick period in seconds.
    pub tick_interval_secs: u64,
    // Drain: wait this long for clients to leave before forcing completion.
    pub drain_force_complete_ms: u64,
    // Drain: exit regardless after this long.
    pub drain_hard_limit_ms: u64,
    // Per-client critical message queue depth.
    pub client_buffer: usize,
    // Close a socket that shows no inbound frame for this long.
    pub heartbeat_timeout_secs: u64,
    // Reconnect hint carried in shutdown warnings.
    pub reconnect_delay_ms: u64,
    // Trust X-Forwarded-For for the per-source limit key.
    pub trust_forwarded_for: bool,
}

const DEFAULT_CONFIG_PATH: &str = "/usr/local/hearth/config.yml";
const DEFAULT_BIND: &str = "0.0.0.0:4000";
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";
const DEFAULT_STORE_POOL_SIZE: usize = 10;
const DEFAULT_STORE_OP_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_TICK_INTERVAL_SECS: u64 = 5;
const DEFAULT_DRAIN_FORCE_COMPLETE_MS: u64 = 15_000;
const DEFAULT_DRAIN_HARD_LIMIT_MS: u64 = 30_000;
const DEFAULT_CLIENT_BUFFER: usize = 32;
const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;

#[derive(Debug, Deserialize)]
struct GatewayConfigOverride {
    bind: Option<String>,
    metrics_bind: Option<String>,
    redis_url: Option<String>,
    store_pool_size: Option<usize>,
    store_op_timeout_ms: Option<u64>,
    connections_per_ip_per_minute: Option<u32>,
    global_connections_per_second: Option<u32>,
    max_global_connections: Option<u64>,
    tick_leader: Option<bool>,
    tick_interval_secs: Option<u64>,
    drain_force_complete_ms: Option<u64>,
    drain_hard_limit_ms: Option<u64>,
    client_buffer: Option<usize>,
    heartbeat_timeout_secs: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    trust_forwarded_for: Option<bool>,
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes" | "TRUE" | "YES"))
        .unwrap_or(default)
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let bind = std::env::var("HEARTH_BIND")
            .unwrap_or_else(|_| DEFAULT_BIND.to_string())
            .parse()
            .with_context(|| "parse HEARTH_BIND")?;
        let metrics_bind = std::env::var("HEARTH_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse HEARTH_METRICS_BIND")?;
        let redis_url = std::env::var("REDIS_URL").ok().filter(|url| !url.is_empty());
        let store_pool_size = env_parsed("HEARTH_STORE_POOL_SIZE")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STORE_POOL_SIZE);
        let store_op_timeout_ms = env_parsed("HEARTH_STORE_OP_TIMEOUT_MS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STORE_OP_TIMEOUT_MS);
        let connections_per_ip_per_minute = env_parsed("CONNECTIONS_PER_IP_PER_MINUTE")
            .unwrap_or_else(|| AdmissionConfig::default().max_per_source_per_minute);
        let global_connections_per_second = env_parsed("GLOBAL_CONNECTIONS_PER_SECOND")
            .unwrap_or_else(|| AdmissionConfig::default().max_global_per_second);
        let max_global_connections = env_parsed("MAX_GLOBAL_CONNECTIONS")
            .unwrap_or_else(|| AdmissionConfig::default().max_global);
        let tick_leader = env_flag("HEARTH_TICK_LEADER", true);
        let tick_interval_secs = env_parsed("HEARTH_TICK_INTERVAL_SECS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_TICK_INTERVAL_SECS);
        let drain_force_complete_ms = env_parsed("HEARTH_DRAIN_FORCE_COMPLETE_MS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_DRAIN_FORCE_COMPLETE_MS);
        let drain_hard_limit_ms = env_parsed("HEARTH_DRAIN_HARD_LIMIT_MS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_DRAIN_HARD_LIMIT_MS);
        let client_buffer = env_parsed("HEARTH_CLIENT_BUFFER")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_CLIENT_BUFFER);
        let heartbeat_timeout_secs = env_parsed("HEARTH_HEARTBEAT_TIMEOUT_SECS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_SECS);
        let reconnect_delay_ms =
            env_parsed("HEARTH_RECONNECT_DELAY_MS").unwrap_or(DEFAULT_RECONNECT_DELAY_MS);
        let trust_forwarded_for = env_flag("HEARTH_TRUST_FORWARDED_FOR", false);

        Ok(Self {
            bind,
            metrics_bind,
            redis_url,
            store_pool_size,
            store_op_timeout_ms,
            connections_per_ip_per_minute,
            global_connections_per_second,
            max_global_connections,
            tick_leader,
            tick_interval_secs,
            drain_force_complete_ms,
            drain_hard_limit_ms,
            client_buffer,
            heartbeat_timeout_secs,
            reconnect_delay_ms,
            trust_forwarded_for,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = std::env::var("HEARTH_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if override_path.is_some() {
                    return Err(err).with_context(|| format!("read HEARTH_CONFIG: {config_path}"));
                }
                None
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read gateway config: {config_path}"));
            }
        };
        if let Some(contents) = contents {
            // YAML overrides allow ops-friendly config files.
            let override_cfg: GatewayConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse gateway config yaml")?;
            config.apply_override(override_cfg)?;
        }
        Ok(config)
    }

    fn apply_override(&mut self, override_cfg: GatewayConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.bind {
            self.bind = value.parse().with_context(|| "parse bind")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.redis_url {
            self.redis_url = Some(value);
        }
        if let Some(value) = override_cfg.store_pool_size.filter(|v| *v > 0) {
            self.store_pool_size = value;
        }
        if let Some(value) = override_cfg.store_op_timeout_ms.filter(|v| *v > 0) {
            self.store_op_timeout_ms = value;
        }
        if let Some(value) = override_cfg.connections_per_ip_per_minute {
            self.connections_per_ip_per_minute = value;
        }
        if let Some(value) = override_cfg.global_connections_per_second {
            self.global_connections_per_second = value;
        }
        if let Some(value) = override_cfg.max_global_connections {
            self.max_global_connections = value;
        }
        if let Some(value) = override_cfg.tick_leader {
            self.tick_leader = value;
        }
        if let Some(value) = override_cfg.tick_interval_secs.filter(|v| *v > 0) {
            self.tick_interval_secs = value;
        }
        if let Some(value) = override_cfg.drain_force_complete_ms.filter(|v| *v > 0) {
            self.drain_force_complete_ms = value;
        }
        if let Some(value) = override_cfg.drain_hard_limit_ms.filter(|v| *v > 0) {
            self.drain_hard_limit_ms = value;
        }
        if let Some(value) = override_cfg.client_buffer.filter(|v| *v > 0) {
            self.client_buffer = value;
        }
        if let Some(value) = override_cfg.heartbeat_timeout_secs.filter(|v| *v > 0) {
            self.heartbeat_timeout_secs = value;
        }
        if let Some(value) = override_cfg.reconnect_delay_ms {
            self.reconnect_delay_ms = value;
        }
        if let Some(value) = override_cfg.trust_forwarded_for {
            self.trust_forwarded_for = value;
        }
        Ok(())
    }

    pub fn admission(&self) -> AdmissionConfig {
        AdmissionConfig {
            max_per_source_per_minute: self.connections_per_ip_per_minute,
            max_global_per_second: self.global_connections_per_second,
            max_global: self.max_global_connections,
        }
    }

    pub fn store_op_timeout(&self) -> Duration {
        Duration::from_millis(self.store_op_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn drain_force_complete(&self) -> Duration {
        Duration::from_millis(self.drain_force_complete_ms)
    }

    pub fn drain_hard_limit(&self) -> Duration {
        Duration::from_millis(self.drain_hard_limit_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Defaults suitable for tests and embedding: loopback binds, in-memory
    /// store, fast drain.
    pub fn for_tests() -> Self {
        Self {
            bind: "127.0.0.1:0".parse().expect("loopback bind"),
            metrics_bind: "127.0.0.1:0".parse().expect("loopback bind"),
            redis_url: None,
            store_pool_size: 1,
            store_op_timeout_ms: DEFAULT_STORE_OP_TIMEOUT_MS,
            connections_per_ip_per_minute: AdmissionConfig::default().max_per_source_per_minute,
            global_connections_per_second: AdmissionConfig::default().max_global_per_second,
            max_global_connections: AdmissionConfig::default().max_global,
            tick_leader: true,
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            drain_force_complete_ms: 200,
            drain_hard_limit_ms: 2_000,
            client_buffer: DEFAULT_CLIENT_BUFFER,
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            trust_forwarded_for: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_override_replaces_selected_fields() {
        let mut config = GatewayConfig::for_tests();
        let override_cfg: GatewayConfigOverride = serde_yaml::from_str(
            "bind: 127.0.0.1:9000\nconnections_per_ip_per_minute: 5\ntick_leader: false\n",
        )
        .expect("parse yaml");
        config.apply_override(override_cfg).expect("apply");
        assert_eq!(config.bind, "127.0.0.1:9000".parse().expect("addr"));
        assert_eq!(config.connections_per_ip_per_minute, 5);
        assert!(!config.tick_leader);
        // Untouched fields keep their values.
        assert_eq!(config.reconnect_delay_ms, DEFAULT_RECONNECT_DELAY_MS);
    }

    #[test]
    fn zero_valued_overrides_are_ignored() {
        let mut config = GatewayConfig::for_tests();
        let override_cfg: GatewayConfigOverride =
            serde_yaml::from_str("store_pool_size: 0\nclient_buffer: 0\n").expect("parse yaml");
        config.apply_override(override_cfg).expect("apply");
        assert_eq!(config.store_pool_size, 1);
        assert_eq!(config.client_buffer, DEFAULT_CLIENT_BUFFER);
    }

    #[test]
    fn admission_config_mirrors_limits() {
        let mut config = GatewayConfig::for_tests();
        config.connections_per_ip_per_minute = 3;
        config.global_connections_per_second = 7;
        config.max_global_connections = 11;
        let admission = config.admission();
        assert_eq!(admission.max_per_source_per_minute, 3);
        assert_eq!(admission.max_global_per_second, 7);
        assert_eq!(admission.max_global, 11);
    }
}
