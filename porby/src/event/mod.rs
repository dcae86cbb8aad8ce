//! # Entry Model
//!
//! Value types describing one log record: severity levels, categories,
//! structured metadata, domain-specific extras and the immutable
//! [`LogEntry`] itself. Everything here serializes with `serde` and is what
//! actually crosses the wire and lands in the journal.


use chrono::{DateTime, Utc};
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Wire protocol version advertised in the handshake and the mDNS record.
pub const PROTOCOL_VERSION: u32 = 1;

/// SDK version reported to peers.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Ordered severity with a stable numeric value for external mapping.
///
/// The numeric gaps (1, 5, 9, ...) leave room for host logging systems that
/// interleave their own levels.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Verbose = 1,
  Debug = 5,
  Info = 9,
  Warning = 13,
  Error = 17,
  Fatal = 21,
}

impl LogLevel {
  /// Stable numeric severity for external systems.
  #[inline]
  pub fn severity(self) -> u8 {
    self as u8
  }

  /// Entries at this level bypass the rate limiter and are mirrored into
  /// the priority ring.
  #[inline]
  pub fn is_priority(self) -> bool {
    matches!(self, LogLevel::Error | LogLevel::Fatal)
  }

  pub fn from_severity(severity: u8) -> Option<LogLevel> {
    match severity {
      1 => Some(LogLevel::Verbose),
      5 => Some(LogLevel::Debug),
      9 => Some(LogLevel::Info),
      13 => Some(LogLevel::Warning),
      17 => Some(LogLevel::Error),
      21 => Some(LogLevel::Fatal),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      LogLevel::Verbose => "verbose",
      LogLevel::Debug => "debug",
      LogLevel::Info => "info",
      LogLevel::Warning => "warning",
      LogLevel::Error => "error",
      LogLevel::Fatal => "fatal",
    }
  }
}

impl fmt::Display for LogLevel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A log category: an identifier plus an optional display glyph.
///
/// Equality and hashing consider the identifier only, so `Category::from("db")`
/// and a user-built `db` category with a glyph collapse to the same key in
/// per-category filter maps.
#[derive(Debug, Clone, Serialize)]
pub struct Category {
  pub id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub glyph: Option<String>,
}

impl Category {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      glyph: None,
    }
  }

  pub fn with_glyph(id: impl Into<String>, glyph: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      glyph: Some(glyph.into()),
    }
  }

  pub fn app() -> Self {
    Self::with_glyph("app", "\u{1F4F1}")
  }

  pub fn network() -> Self {
    Self::with_glyph("network", "\u{1F310}")
  }

  pub fn crash() -> Self {
    Self::with_glyph("crash", "\u{1F4A5}")
  }

  pub fn ui() -> Self {
    Self::with_glyph("ui", "\u{1F5BC}")
  }

  pub fn bluetooth() -> Self {
    Self::with_glyph("bluetooth", "\u{1F4E1}")
  }

  pub fn lifecycle() -> Self {
    Self::with_glyph("lifecycle", "\u{1F504}")
  }

  pub fn performance() -> Self {
    Self::with_glyph("performance", "\u{26A1}")
  }
}

impl From<&str> for Category {
  fn from(id: &str) -> Self {
    Category::new(id)
  }
}

impl From<String> for Category {
  fn from(id: String) -> Self {
    Category::new(id)
  }
}

impl PartialEq for Category {
  fn eq(&self, other: &Self) -> bool {
    self.id == other.id
  }
}

impl Eq for Category {}

impl Hash for Category {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.id.hash(state);
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.id)
  }
}

/// Accepts either a bare string (`"network"`) or the full object form.
impl<'de> Deserialize<'de> for Category {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    struct CategoryVisitor;

    impl<'de> Visitor<'de> for CategoryVisitor {
      type Value = Category;

      fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a category id string or a {id, glyph} object")
      }

      fn visit_str<E>(self, v: &str) -> Result<Category, E>
      where
        E: de::Error,
      {
        Ok(Category::new(v))
      }

      fn visit_map<M>(self, mut map: M) -> Result<Category, M::Error>
      where
        M: MapAccess<'de>,
      {
        let mut id: Option<String> = None;
        let mut glyph: Option<String> = None;
        while let Some(key) = map.next_key::<String>()? {
          match key.as_str() {
            "id" => id = Some(map.next_value()?),
            "glyph" => glyph = map.next_value()?,
            _ => {
              let _ignored: de::IgnoredAny = map.next_value()?;
            },
          }
        }
        let id = id.ok_or_else(|| de::Error::missing_field("id"))?;
        Ok(Category { id, glyph })
      }
    }

    deserializer.deserialize_any(CategoryVisitor)
  }
}

/// A single structured metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum MetadataValue {
  String(String),
  Int(i64),
  Double(f64),
  Bool(bool),
}

impl From<&str> for MetadataValue {
  fn from(v: &str) -> Self {
    MetadataValue::String(v.to_string())
  }
}

impl From<String> for MetadataValue {
  fn from(v: String) -> Self {
    MetadataValue::String(v)
  }
}

impl From<i64> for MetadataValue {
  fn from(v: i64) -> Self {
    MetadataValue::Int(v)
  }
}

impl From<f64> for MetadataValue {
  fn from(v: f64) -> Self {
    MetadataValue::Double(v)
  }
}

impl From<bool> for MetadataValue {
  fn from(v: bool) -> Self {
    MetadataValue::Bool(v)
  }
}

/// Key lookup is case-sensitive; redaction matches case-insensitively.
pub type Metadata = HashMap<String, MetadataValue>;

/// One resolved crash stack frame. Unparsable symbols carry only `symbol`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashFrame {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub index: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub module: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
  pub symbol: String,
}

impl CrashFrame {
  pub fn raw(symbol: impl Into<String>) -> Self {
    Self {
      index: None,
      module: None,
      address: None,
      symbol: symbol.into(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
  pub method: String,
  pub url: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status_code: Option<u16>,
  #[serde(default)]
  pub request_headers: HashMap<String, String>,
  #[serde(default)]
  pub response_headers: HashMap<String, String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub request_body: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub response_body: Option<String>,
  pub duration_ms: f64,
  pub bytes_sent: u64,
  pub bytes_received: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashInfo {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub signal: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub exception_type: Option<String>,
  pub reason: String,
  pub frames: Vec<CrashFrame>,
  pub thread: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiInfo {
  pub event_type: String,
  pub view_name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceInfo {
  pub cpu_percent: f64,
  pub memory_mb: f64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub fps: Option<f64>,
  pub disk_read_bytes: u64,
  pub disk_write_bytes: u64,
}

/// Domain-specific payload attached to an entry by a collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum LogExtra {
  Network(NetworkInfo),
  Crash(CrashInfo),
  Ui(UiInfo),
  Performance(PerformanceInfo),
}

/// A single immutable log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
  pub id: Uuid,
  pub timestamp: DateTime<Utc>,
  pub level: LogLevel,
  pub category: Category,
  pub message: String,
  pub file: String,
  pub function: String,
  pub line: u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub metadata: Option<Metadata>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub extra: Option<LogExtra>,
}

impl LogEntry {
  pub fn new(
    level: LogLevel,
    category: Category,
    message: impl Into<String>,
    file: impl Into<String>,
    function: impl Into<String>,
    line: u32,
  ) -> Self {
    Self {
      id: Uuid::new_v4(),
      timestamp: Utc::now(),
      level,
      category,
      message: message.into(),
      file: file.into(),
      function: function.into(),
      line,
      metadata: None,
      extra: None,
    }
  }

  pub fn with_metadata(mut self, metadata: Metadata) -> Self {
    self.metadata = Some(metadata);
    self
  }

  pub fn with_extra(mut self, extra: LogExtra) -> Self {
    self.extra = Some(extra);
    self
  }

  #[inline]
  pub fn is_priority(&self) -> bool {
    self.level.is_priority()
  }
}

impl fmt::Display for LogEntry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "[{}] [{}] {}: {}",
      self.timestamp.format("%H:%M:%S%.3f"),
      self.level,
      self.category,
      self.message
    )
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
  pub name: String,
  pub model: String,
  pub os_version: String,
}

impl DeviceInfo {
  /// Best-effort probe of the host machine.
  pub fn current() -> Self {
    Self {
      name: gethostname::gethostname().to_string_lossy().into_owned(),
      model: std::env::consts::ARCH.to_string(),
      os_version: std::env::consts::OS.to_string(),
    }
  }

  /// Replaces the user-visible name with a generic one.
  pub fn anonymized(mut self) -> Self {
    self.name = "Porby Device".to_string();
    self
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
  pub name: String,
  pub version: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub identifier: Option<String>,
}

impl AppInfo {
  /// Falls back to the process name when the host supplies nothing.
  pub fn current() -> Self {
    let name = std::env::current_exe()
      .ok()
      .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
      .unwrap_or_else(|| "unknown".to_string());
    Self {
      name,
      version: "0.0.0".to_string(),
      identifier: None,
    }
  }
}

/// First message sent to every accepted connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
  pub protocol_version: u32,
  pub sdk_version: String,
  pub device: DeviceInfo,
  pub app: AppInfo,
  pub pairing_required: bool,
  pub capabilities: Vec<String>,
}
