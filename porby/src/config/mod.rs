//! Configuration tree. Built by the host, validated and moved into the
//! engine at start, immutable thereafter. Every struct derives serde so a
//! host can load the whole tree from JSON.


use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::event::LogLevel;

/// Flush intervals outside this range get a validation warning.
pub const FLUSH_INTERVAL_MIN: Duration = Duration::from_millis(16);
pub const FLUSH_INTERVAL_MAX: Duration = Duration::from_secs(5);

/// Body captures above this size get a validation warning.
pub const BODY_CAPTURE_WARN_BYTES: usize = 100 * 1024;

/// Estimated in-memory footprint of one buffered entry.
pub const ESTIMATED_BYTES_PER_ENTRY: u64 = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterConfig {
  /// Minimum level for categories without an explicit override.
  pub global_min_level: LogLevel,
  /// Per-category minimum, keyed by category id.
  pub category_levels: HashMap<String, LogLevel>,
  pub disabled_categories: HashSet<String>,
}

impl Default for FilterConfig {
  fn default() -> Self {
    Self {
      global_min_level: LogLevel::Debug,
      category_levels: HashMap::new(),
      disabled_categories: HashSet::new(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectorsConfig {
  pub network: bool,
  pub ui: bool,
  pub lifecycle: bool,
  pub performance: bool,
  pub crash: bool,
}

impl Default for CollectorsConfig {
  fn default() -> Self {
    Self {
      network: true,
      ui: true,
      lifecycle: true,
      performance: true,
      crash: true,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
  /// TCP port for the WebSocket listener. 0 asks the OS for an ephemeral one.
  pub port: u16,
  /// Instance name for the mDNS record; the device name when absent.
  pub service_name: Option<String>,
  pub anonymize_device_name: bool,
  pub advertise_app_name: bool,
  pub max_connections: usize,
  #[serde(with = "humantime_serde")]
  pub heartbeat_interval: Duration,
  pub requires_pairing: bool,
  /// Fixed PIN overriding random generation. Development use.
  pub fixed_pin: Option<String>,
  pub max_pin_attempts: u32,
  #[serde(with = "humantime_serde")]
  pub pin_cooldown: Duration,
}

impl Default for TransportConfig {
  fn default() -> Self {
    Self {
      port: 9394,
      service_name: None,
      anonymize_device_name: false,
      advertise_app_name: true,
      max_connections: 4,
      heartbeat_interval: Duration::from_secs(15),
      requires_pairing: true,
      fixed_pin: None,
      max_pin_attempts: 3,
      pin_cooldown: Duration::from_secs(30),
    }
  }
}

/// Data-at-rest class applied on file creation. A no-op on platforms
/// without file protection classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileProtection {
  Complete,
  CompleteUntilFirstUserAuthentication,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceConfig {
  pub enabled: bool,
  /// Rotation threshold per journal file, in bytes.
  pub max_file_size: u64,
  pub max_file_count: usize,
  #[serde(with = "humantime_serde")]
  pub max_retention: Duration,
  /// Replay and clear the journal when a viewer authenticates.
  pub flush_on_connect: bool,
  pub max_replay_entries: usize,
  pub file_protection: FileProtection,
  /// Overrides the platform application-support directory. Tests use this.
  pub directory_override: Option<PathBuf>,
}

impl Default for PersistenceConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      max_file_size: 512 * 1024,
      max_file_count: 5,
      max_retention: Duration::from_secs(24 * 60 * 60),
      flush_on_connect: true,
      max_replay_entries: 500,
      file_protection: FileProtection::CompleteUntilFirstUserAuthentication,
      directory_override: None,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrivacyConfig {
  pub redacted_headers: Vec<String>,
  pub redacted_metadata_keys: Vec<String>,
  pub redacted_query_params: Vec<String>,
  /// Body slice captured per request/response. 0 disables body capture.
  pub max_body_bytes: usize,
  pub placeholder: String,
}

impl Default for PrivacyConfig {
  fn default() -> Self {
    Self {
      redacted_headers: vec![
        "authorization".to_string(),
        "cookie".to_string(),
        "set-cookie".to_string(),
        "proxy-authorization".to_string(),
        "x-api-key".to_string(),
      ],
      redacted_metadata_keys: vec![
        "password".to_string(),
        "token".to_string(),
        "secret".to_string(),
        "accessToken".to_string(),
      ],
      redacted_query_params: vec![
        "token".to_string(),
        "key".to_string(),
        "api_key".to_string(),
        "access_token".to_string(),
        "password".to_string(),
      ],
      max_body_bytes: 16 * 1024,
      placeholder: "<redacted>".to_string(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackgroundPolicy {
  /// Keep collectors and timers running while backgrounded.
  Continue,
  /// Suspend the performance sampler while backgrounded.
  Pause,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsConfig {
  /// Main ring capacity.
  pub max_buffer_count: usize,
  /// Priority ring capacity.
  pub priority_buffer_count: usize,
  /// Estimated-usage hard cap for the buffer.
  pub max_buffer_bytes: u64,
  #[serde(with = "humantime_serde")]
  pub flush_interval: Duration,
  /// 0 disables rate limiting.
  pub max_logs_per_second: u32,
  #[serde(with = "humantime_serde")]
  pub performance_sample_interval: Duration,
  pub background_policy: BackgroundPolicy,
}

impl Default for LimitsConfig {
  fn default() -> Self {
    Self {
      max_buffer_count: 1000,
      priority_buffer_count: 100,
      max_buffer_bytes: 5 * 1024 * 1024,
      flush_interval: Duration::from_millis(250),
      max_logs_per_second: 100,
      performance_sample_interval: Duration::from_secs(5),
      background_policy: BackgroundPolicy::Continue,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
  pub enabled: bool,
  /// When set, `start` is a no-op outside debug builds.
  pub debug_builds_only: bool,
  pub filter: FilterConfig,
  pub collectors: CollectorsConfig,
  pub transport: TransportConfig,
  pub persistence: PersistenceConfig,
  pub privacy: PrivacyConfig,
  pub limits: LimitsConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      enabled: true,
      debug_builds_only: true,
      filter: FilterConfig::default(),
      collectors: CollectorsConfig::default(),
      transport: TransportConfig::default(),
      persistence: PersistenceConfig::default(),
      privacy: PrivacyConfig::default(),
      limits: LimitsConfig::default(),
    }
  }
}

impl Config {
  pub fn new() -> Self {
    Self::default()
  }

  /// Emits keyed non-fatal warnings for suspicious values. The SDK still
  /// runs with whatever was configured.
  pub fn validate(&self) {
    if self.transport.port != 0 && self.transport.port < 1024 {
      warn!(
        key = "transport.port",
        port = self.transport.port,
        "privileged port configured; binding may require elevated rights"
      );
    }
    if self.limits.flush_interval < FLUSH_INTERVAL_MIN
      || self.limits.flush_interval > FLUSH_INTERVAL_MAX
    {
      warn!(
        key = "limits.flushInterval",
        interval_ms = self.limits.flush_interval.as_millis() as u64,
        "flush interval outside the 16ms..5s range"
      );
    }
    if self.persistence.enabled && self.persistence.max_file_size == 0 {
      warn!(
        key = "persistence.maxFileSize",
        "persistence enabled with a zero max file size; every batch rotates"
      );
    }
    if !self.transport.requires_pairing {
      warn!(
        key = "transport.requiresPairing",
        "pairing disabled; any local-network peer can read logs"
      );
    }
    if self.privacy.max_body_bytes > BODY_CAPTURE_WARN_BYTES {
      warn!(
        key = "privacy.maxBodySize",
        bytes = self.privacy.max_body_bytes,
        "body capture above 100 KiB inflates memory and wire traffic"
      );
    }
  }
}
