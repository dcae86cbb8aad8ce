#[cfg(test)]
mod __test__ {

  use std::sync::Arc;
  use std::time::{Duration, Instant};

  use tempfile::TempDir;
  use tracing_subscriber::layer::SubscriberExt;

  use crate::bridge::EngineLayer;
  use crate::config::Config;
  use crate::engine::LogEngine;
  use crate::event::MetadataValue;

  fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
      if predicate() {
        return true;
      }
      std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
  }

  #[test]
  fn test_tracing_events_forwarded_with_source() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.transport.port = 0;
    config.transport.requires_pairing = false;
    config.persistence.directory_override = Some(dir.path().to_path_buf());
    config.collectors.performance = false;
    config.collectors.crash = false;
    config.limits.flush_interval = Duration::from_secs(30);
    let engine = LogEngine::start(config);

    let layer = EngineLayer::new(Arc::downgrade(&engine));
    let subscriber = tracing_subscriber::registry().with(layer);
    tracing::subscriber::with_default(subscriber, || {
      tracing::info!(target: "host::checkout", attempt = 2i64, "payment retried");
    });

    assert!(wait_until(Duration::from_secs(5), || !engine.buffer.is_empty()));
    let batch = engine.buffer.drain();
    assert_eq!(batch.len(), 1);
    let entry = &batch[0];
    assert_eq!(entry.message, "payment retried");
    let metadata = entry.metadata.as_ref().unwrap();
    assert_eq!(
      metadata["_source"],
      MetadataValue::String("host::checkout".to_string())
    );
    assert_eq!(metadata["attempt"], MetadataValue::Int(2));

    engine.stop();
  }

  #[test]
  fn test_sdk_internal_events_not_forwarded() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.transport.port = 0;
    config.transport.requires_pairing = false;
    config.persistence.directory_override = Some(dir.path().to_path_buf());
    config.collectors.performance = false;
    config.collectors.crash = false;
    config.limits.flush_interval = Duration::from_secs(30);
    let engine = LogEngine::start(config);

    let layer = EngineLayer::new(Arc::downgrade(&engine));
    let subscriber = tracing_subscriber::registry().with(layer);
    tracing::subscriber::with_default(subscriber, || {
      tracing::info!(target: "porby::engine", "internal chatter");
    });

    std::thread::sleep(Duration::from_millis(100));
    assert!(engine.buffer.is_empty());

    engine.stop();
  }
}
