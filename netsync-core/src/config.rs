//! Server configuration surface: the fields a `ServerConfig`
//! carries regardless of whether they arrived from a TOML file, a CLI flag,
//! or a built-in default. `netsync-server` owns parsing the file and CLI
//! layers and merging them into this struct; this module owns the struct
//! itself and its defaults/validation, so `netsync-core` stays usable
//! without pulling in `clap` or `toml`.
//!
//! Grounded on the Python reference server's `config.py` field set and
//! defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_dealer_port() -> u16 { 5555 }
fn default_pub_port() -> u16 { 5556 }
fn default_discovery_port() -> u16 { 9999 }
fn default_server_name() -> String { "STYLY-NetSync-Server".to_string() }
fn default_true() -> bool { true }
fn default_base_broadcast_interval() -> f64 { 0.1 }
fn default_idle_broadcast_interval() -> f64 { 0.5 }
fn default_dirty_threshold() -> f64 { 0.05 }
fn default_client_timeout() -> f64 { 1.0 }
fn default_device_id_expiry_time() -> f64 { 300.0 }
fn default_empty_room_expiry() -> f64 { 86_400.0 }
fn default_device_id_cleanup_interval() -> f64 { 60.0 }
fn default_nv_flush_interval() -> f64 { 0.05 }
fn default_nv_monitor_threshold() -> u32 { 200 }
fn default_max_vars() -> usize { 100 }
fn default_max_var_name_length() -> usize { 64 }
fn default_max_var_value_length() -> usize { 1024 }
fn default_max_virtual_transforms() -> usize { 50 }
fn default_pub_queue_maxsize() -> usize { 10_000 }
fn default_delta_ring_size() -> usize { 10_000 }

/// Full configuration surface, deserializable straight from a TOML
/// `[server]` table. Every field has a spec-mandated default so a bare
/// `ServerConfig::default()` is already a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(default = "default_dealer_port")]
    pub dealer_port: u16,
    #[serde(default = "default_pub_port")]
    pub pub_port: u16,
    #[serde(default = "default_discovery_port")]
    pub server_discovery_port: u16,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_true")]
    pub enable_server_discovery: bool,
    #[serde(default)]
    pub allowed_app_ids: Vec<String>,
    #[serde(default = "default_base_broadcast_interval")]
    pub base_broadcast_interval: f64,
    #[serde(default = "default_idle_broadcast_interval")]
    pub idle_broadcast_interval: f64,
    #[serde(default = "default_dirty_threshold")]
    pub dirty_threshold: f64,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: f64,
    #[serde(default = "default_device_id_expiry_time")]
    pub device_id_expiry_time: f64,
    #[serde(default = "default_empty_room_expiry")]
    pub empty_room_expiry: f64,
    #[serde(default = "default_device_id_cleanup_interval")]
    pub device_id_cleanup_interval: f64,
    #[serde(default = "default_nv_flush_interval")]
    pub nv_flush_interval: f64,
    #[serde(default = "default_nv_monitor_threshold")]
    pub nv_monitor_threshold: u32,
    #[serde(default = "default_max_vars")]
    pub max_global_vars: usize,
    #[serde(default = "default_max_vars")]
    pub max_client_vars: usize,
    #[serde(default = "default_max_var_name_length")]
    pub max_var_name_length: usize,
    #[serde(default = "default_max_var_value_length")]
    pub max_var_value_length: usize,
    #[serde(default = "default_max_virtual_transforms")]
    pub max_virtual_transforms: usize,
    #[serde(default = "default_pub_queue_maxsize")]
    pub pub_queue_maxsize: usize,
    #[serde(default = "default_delta_ring_size")]
    pub delta_ring_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        // Deserializing an empty TOML table exercises exactly the same
        // per-field defaults a hand-written `Self { .. }` literal would, and
        // keeps the default list in one place.
        toml::from_str("").expect("empty table deserializes using field defaults")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero, got {value}")]
    NotPositive { field: &'static str, value: f64 },
    #[error("dirty_threshold ({dirty}) must not exceed idle_broadcast_interval ({idle})")]
    ThresholdOrdering { dirty: f64, idle: f64 },
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("base_broadcast_interval", self.base_broadcast_interval),
            ("idle_broadcast_interval", self.idle_broadcast_interval),
            ("dirty_threshold", self.dirty_threshold),
            ("client_timeout", self.client_timeout),
            ("nv_flush_interval", self.nv_flush_interval),
        ] {
            if value <= 0.0 {
                return Err(ConfigError::NotPositive { field, value });
            }
        }
        if self.dirty_threshold > self.idle_broadcast_interval {
            return Err(ConfigError::ThresholdOrdering {
                dirty: self.dirty_threshold,
                idle: self.idle_broadcast_interval,
            });
        }
        Ok(())
    }

    pub fn dirty_threshold_duration(&self) -> Duration { Duration::from_secs_f64(self.dirty_threshold) }
    pub fn idle_broadcast_interval_duration(&self) -> Duration { Duration::from_secs_f64(self.idle_broadcast_interval) }
    pub fn client_timeout_duration(&self) -> Duration { Duration::from_secs_f64(self.client_timeout) }
    pub fn device_id_expiry_duration(&self) -> Duration { Duration::from_secs_f64(self.device_id_expiry_time) }
    pub fn empty_room_expiry_duration(&self) -> Duration { Duration::from_secs_f64(self.empty_room_expiry) }
    pub fn device_id_cleanup_interval_duration(&self) -> Duration { Duration::from_secs_f64(self.device_id_cleanup_interval) }
    pub fn nv_flush_interval_duration(&self) -> Duration { Duration::from_secs_f64(self.nv_flush_interval) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let config = ServerConfig::default();
        assert_eq!(config.dealer_port, 5555);
        assert_eq!(config.pub_port, 5556);
        assert_eq!(config.server_discovery_port, 9999);
        assert_eq!(config.delta_ring_size, 10_000);
        assert!(config.allowed_app_ids.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_table_fills_in_remaining_defaults() {
        let config: ServerConfig = toml::from_str("dealer_port = 7000\nallowed_app_ids = [\"com.styly.prod\"]").unwrap();
        assert_eq!(config.dealer_port, 7000);
        assert_eq!(config.pub_port, 5556);
        assert_eq!(config.allowed_app_ids, vec!["com.styly.prod".to_string()]);
    }

    #[test]
    fn dirty_threshold_above_idle_interval_is_rejected() {
        let mut config = ServerConfig::default();
        config.dirty_threshold = 1.0;
        config.idle_broadcast_interval = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::ThresholdOrdering { .. })));
    }

    #[test]
    fn non_positive_interval_is_rejected() {
        let mut config = ServerConfig::default();
        config.nv_flush_interval = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::NotPositive { field: "nv_flush_interval", .. })));
    }
}
