pub mod advertiser;
pub mod bridge;
pub mod buffer;
pub mod collectors;
pub mod config;
pub mod crash;
pub mod engine;
pub mod event;
pub mod journal;
pub mod monitor;
pub mod pairing;
pub mod redact;
pub mod server;
pub mod transport;
pub mod wire;

use std::sync::{Arc, OnceLock};

pub use crate::collectors::NetworkCapture;
pub use crate::config::Config;
pub use crate::engine::LogEngine;
pub use crate::event::{Category, LogEntry, LogLevel, Metadata, MetadataValue};
pub use crate::server::ConnectionState;

static GLOBAL_ENGINE: OnceLock<Arc<LogEngine>> = OnceLock::new();

/// Starts the process-wide engine. Calling it again is a no-op that hands
/// back the already-running instance.
pub fn start(config: Config) -> Arc<LogEngine> {
  Arc::clone(GLOBAL_ENGINE.get_or_init(|| LogEngine::start(config)))
}

/// The process-wide engine, if `start` has run.
pub fn engine() -> Option<Arc<LogEngine>> {
  GLOBAL_ENGINE.get().cloned()
}

/// Stops the process-wide engine. Idempotent; safe before `start`.
pub fn stop() {
  if let Some(engine) = GLOBAL_ENGINE.get() {
    engine.stop();
  }
}
