#[cfg(test)]
mod __test__ {

  use std::sync::Arc;
  use std::time::{Duration, Instant};

  use futures_util::StreamExt;
  use tempfile::TempDir;
  use tokio_tungstenite::connect_async;
  use tokio_tungstenite::tungstenite::Message as WsMessage;

  use crate::config::Config;
  use crate::event::{Category, LogEntry, LogLevel};
  use crate::transport::{Transport, TransportEvents};
  use crate::wire::{self, WireMessage};

  fn entry(message: &str) -> LogEntry {
    LogEntry::new(LogLevel::Info, Category::app(), message, "t.rs", "t", 1)
  }

  fn config_in(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.transport.port = 0;
    config.transport.requires_pairing = false;
    config.persistence.directory_override = Some(dir.path().to_path_buf());
    config
  }

  fn events() -> TransportEvents {
    TransportEvents {
      on_command: Arc::new(|_| {}),
      on_state: Arc::new(|_| {}),
    }
  }

  fn journal_file_count(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path()).map(|d| d.count()).unwrap_or(0)
  }

  fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
      if predicate() {
        return true;
      }
      std::thread::sleep(Duration::from_millis(25));
    }
    predicate()
  }

  #[test]
  fn test_send_without_viewer_falls_to_journal() {
    let dir = TempDir::new().unwrap();
    let transport = Transport::start(config_in(&dir), events()).unwrap();

    transport.send(vec![entry("offline-1"), entry("offline-2")]);

    assert!(
      wait_until(Duration::from_secs(5), || journal_file_count(&dir) > 0),
      "journal file expected"
    );
    transport.stop();
  }

  #[test]
  fn test_emergency_persist_writes_inline() {
    let dir = TempDir::new().unwrap();
    let transport = Transport::start(config_in(&dir), events()).unwrap();

    transport.emergency_persist(&[entry("dying")]);
    // inline write, no worker round-trip to wait for
    assert!(journal_file_count(&dir) > 0);
    transport.stop();
  }

  #[test]
  fn test_replay_on_connect_then_journal_cleared() {
    let dir = TempDir::new().unwrap();
    let transport = Transport::start(config_in(&dir), events()).unwrap();

    transport.send(vec![entry("queued-a"), entry("queued-b")]);
    assert!(wait_until(Duration::from_secs(5), || journal_file_count(&dir) > 0));

    let port = transport.port().unwrap();
    let client_runtime = tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .unwrap();

    let replayed = client_runtime.block_on(async {
      let (mut client, _) = connect_async(format!("ws://127.0.0.1:{}/", port))
        .await
        .unwrap();
      let mut replayed: Option<Vec<String>> = None;
      while replayed.is_none() {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
          .await
          .expect("timed out")
          .expect("stream ended")
          .expect("socket error");
        let bytes = match frame {
          WsMessage::Binary(data) => data.to_vec(),
          WsMessage::Text(text) => text.as_bytes().to_vec(),
          _ => continue,
        };
        match wire::decode(&bytes).unwrap() {
          WireMessage::LogReplay(entries) => {
            replayed = Some(entries.into_iter().map(|e| e.message).collect());
          },
          WireMessage::Handshake(_) | WireMessage::Ping => continue,
          other => panic!("unexpected message before replay: {:?}", other),
        }
      }
      replayed.unwrap()
    });

    assert_eq!(replayed.len(), 2);
    assert!(replayed.contains(&"queued-a".to_string()));

    assert!(
      wait_until(Duration::from_secs(5), || journal_file_count(&dir) == 0),
      "journal should be cleared after replay"
    );
    transport.stop();
  }

  #[test]
  fn test_stop_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let transport = Transport::start(config_in(&dir), events()).unwrap();
    transport.stop();
    transport.stop();
  }
}
