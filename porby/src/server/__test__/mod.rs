#[cfg(test)]
mod __test__ {

  use std::sync::{Arc, Mutex};
  use std::time::Duration;

  use futures_util::{SinkExt, StreamExt};
  use tokio::net::TcpStream;
  use tokio::sync::mpsc;
  use tokio::time::timeout;
  use tokio_tungstenite::tungstenite::Message as WsMessage;
  use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
  use uuid::Uuid;

  use crate::config::TransportConfig;
  use crate::event::{AppInfo, Category, DeviceInfo, Handshake, LogEntry, LogLevel};
  use crate::pairing::PairingManager;
  use crate::server::{ServerEvents, ServerSettings, WsServer};
  use crate::wire::{self, Command, PairingRequest, WireMessage};

  type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

  fn handshake() -> Handshake {
    Handshake {
      protocol_version: 1,
      sdk_version: "0.1.0".to_string(),
      device: DeviceInfo {
        name: "test".to_string(),
        model: "x86_64".to_string(),
        os_version: "linux".to_string(),
      },
      app: AppInfo {
        name: "test-app".to_string(),
        version: "1.0".to_string(),
        identifier: None,
      },
      pairing_required: false,
      capabilities: vec![],
    }
  }

  fn settings() -> ServerSettings {
    ServerSettings {
      port: 0,
      max_connections: 4,
      heartbeat_interval: Duration::ZERO,
    }
  }

  struct Harness {
    server: Arc<WsServer>,
    commands: mpsc::UnboundedReceiver<Command>,
    authenticated: mpsc::UnboundedReceiver<Uuid>,
  }

  async fn start_server(pairing: Option<PairingManager>, replay: Vec<LogEntry>) -> Harness {
    let (command_tx, commands) = mpsc::unbounded_channel();
    let (auth_tx, authenticated) = mpsc::unbounded_channel();
    let events = ServerEvents {
      on_viewer_authenticated: Box::new(move |server, id| {
        if !replay.is_empty() {
          server.send_replay(replay.clone(), id);
        }
        let _ = auth_tx.send(id);
      }),
      on_command: Box::new(move |cmd| {
        let _ = command_tx.send(cmd);
      }),
      on_state: Box::new(|_| {}),
    };
    let pairing = pairing.map(|manager| Arc::new(Mutex::new(manager)));
    let server = WsServer::start(settings(), pairing, handshake(), events)
      .await
      .unwrap();
    Harness {
      server,
      commands,
      authenticated,
    }
  }

  fn fixed_pin_manager(pin: &str) -> PairingManager {
    PairingManager::new(&TransportConfig {
      fixed_pin: Some(pin.to_string()),
      max_pin_attempts: 3,
      pin_cooldown: Duration::from_secs(30),
      ..Default::default()
    })
  }

  async fn connect(server: &WsServer) -> Client {
    let (client, _) = connect_async(format!("ws://127.0.0.1:{}/", server.port()))
      .await
      .unwrap();
    client
  }

  async fn next_message(client: &mut Client) -> WireMessage {
    loop {
      let frame = timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out")
        .expect("stream ended")
        .expect("socket error");
      match frame {
        WsMessage::Binary(data) => return wire::decode(&data).unwrap(),
        WsMessage::Text(text) => return wire::decode(text.as_bytes()).unwrap(),
        _ => continue,
      }
    }
  }

  async fn send_message(client: &mut Client, message: &WireMessage) {
    let bytes = wire::encode(message).unwrap();
    client.send(WsMessage::binary(bytes)).await.unwrap();
  }

  fn entry(message: &str) -> LogEntry {
    LogEntry::new(LogLevel::Info, Category::app(), message, "s.rs", "t", 1)
  }

  #[tokio::test]
  async fn test_handshake_sent_first() {
    let harness = start_server(None, vec![]).await;
    let mut client = connect(&harness.server).await;

    match next_message(&mut client).await {
      WireMessage::Handshake(h) => assert_eq!(h.sdk_version, "0.1.0"),
      other => panic!("expected handshake, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_no_pairing_counts_connection_as_viewer() {
    let mut harness = start_server(None, vec![]).await;
    assert!(!harness.server.has_authenticated_viewers());

    let mut client = connect(&harness.server).await;
    let _handshake = next_message(&mut client).await;
    timeout(Duration::from_secs(5), harness.authenticated.recv())
      .await
      .unwrap()
      .unwrap();
    assert!(harness.server.has_authenticated_viewers());
  }

  #[tokio::test]
  async fn test_pairing_happy_path_then_log_delivery() {
    let mut harness = start_server(Some(fixed_pin_manager("123456")), vec![]).await;
    let mut client = connect(&harness.server).await;
    let _handshake = next_message(&mut client).await;

    assert!(!harness.server.has_authenticated_viewers());

    send_message(
      &mut client,
      &WireMessage::PairingRequest(PairingRequest {
        code: "123456".to_string(),
      }),
    )
    .await;

    match next_message(&mut client).await {
      WireMessage::PairingResponse(r) => assert!(r.accepted),
      other => panic!("expected pairingResponse, got {:?}", other),
    }
    timeout(Duration::from_secs(5), harness.authenticated.recv())
      .await
      .unwrap()
      .unwrap();

    harness.server.send(vec![entry("hello viewer")]);
    match next_message(&mut client).await {
      WireMessage::Log(e) => assert_eq!(e.message, "hello viewer"),
      other => panic!("expected log, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_unauthenticated_peer_receives_no_logs() {
    let harness = start_server(Some(fixed_pin_manager("123456")), vec![]).await;
    let mut client = connect(&harness.server).await;
    let _handshake = next_message(&mut client).await;

    // broadcast while unauthenticated, then pair; the accepted response
    // must be the next frame, proving the batch was never queued for us
    harness.server.send(vec![entry("secret")]);
    send_message(
      &mut client,
      &WireMessage::PairingRequest(PairingRequest {
        code: "123456".to_string(),
      }),
    )
    .await;

    match next_message(&mut client).await {
      WireMessage::PairingResponse(r) => assert!(r.accepted),
      other => panic!("expected pairingResponse, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_wrong_pin_rejected_with_reason() {
    let harness = start_server(Some(fixed_pin_manager("123456")), vec![]).await;
    let mut client = connect(&harness.server).await;
    let _handshake = next_message(&mut client).await;

    send_message(
      &mut client,
      &WireMessage::PairingRequest(PairingRequest {
        code: "999999".to_string(),
      }),
    )
    .await;

    match next_message(&mut client).await {
      WireMessage::PairingResponse(r) => {
        assert!(!r.accepted);
        assert_eq!(r.reason.as_deref(), Some("Invalid code. 2 attempts remaining"));
      },
      other => panic!("expected pairingResponse, got {:?}", other),
    }
    assert!(!harness.server.has_authenticated_viewers());
  }

  #[tokio::test]
  async fn test_lockout_then_cooldown_message() {
    let harness = start_server(Some(fixed_pin_manager("123456")), vec![]).await;
    let mut client = connect(&harness.server).await;
    let _handshake = next_message(&mut client).await;

    let mut last_reason = String::new();
    for _ in 0..3 {
      send_message(
        &mut client,
        &WireMessage::PairingRequest(PairingRequest {
          code: "000000".to_string(),
        }),
      )
      .await;
      if let WireMessage::PairingResponse(r) = next_message(&mut client).await {
        last_reason = r.reason.unwrap_or_default();
      }
    }
    assert!(last_reason.contains("Too many failed attempts"), "{}", last_reason);

    send_message(
      &mut client,
      &WireMessage::PairingRequest(PairingRequest {
        code: "123456".to_string(),
      }),
    )
    .await;
    if let WireMessage::PairingResponse(r) = next_message(&mut client).await {
      assert!(!r.accepted);
      assert!(
        r.reason.unwrap_or_default().starts_with("Cooldown active"),
        "cooldown expected"
      );
    }
  }

  #[tokio::test]
  async fn test_ping_answered_with_pong() {
    let harness = start_server(None, vec![]).await;
    let mut client = connect(&harness.server).await;
    let _handshake = next_message(&mut client).await;

    send_message(&mut client, &WireMessage::Ping).await;
    loop {
      match next_message(&mut client).await {
        WireMessage::Pong => break,
        WireMessage::LogReplay(_) => continue,
        other => panic!("expected pong, got {:?}", other),
      }
    }
  }

  #[tokio::test]
  async fn test_replay_precedes_live_traffic() {
    let harness = start_server(None, vec![entry("replayed-1"), entry("replayed-2")]).await;
    let mut client = connect(&harness.server).await;
    let _handshake = next_message(&mut client).await;

    match next_message(&mut client).await {
      WireMessage::LogReplay(entries) => {
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "replayed-1");
      },
      other => panic!("expected logReplay, got {:?}", other),
    }

    harness.server.send(vec![entry("live")]);
    match next_message(&mut client).await {
      WireMessage::Log(e) => assert_eq!(e.message, "live"),
      other => panic!("expected log, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_commands_gated_by_authentication() {
    let mut harness = start_server(Some(fixed_pin_manager("123456")), vec![]).await;
    let mut client = connect(&harness.server).await;
    let _handshake = next_message(&mut client).await;

    send_message(
      &mut client,
      &WireMessage::Command(Command::ClearLogs),
    )
    .await;

    send_message(
      &mut client,
      &WireMessage::PairingRequest(PairingRequest {
        code: "123456".to_string(),
      }),
    )
    .await;
    let _accepted = next_message(&mut client).await;

    send_message(
      &mut client,
      &WireMessage::Command(Command::RequestPerformanceSnapshot),
    )
    .await;

    // only the post-pairing command arrives
    let first = timeout(Duration::from_secs(5), harness.commands.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(first, Command::RequestPerformanceSnapshot);
    assert!(harness.commands.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_unknown_message_type_cancels_connection() {
    let harness = start_server(None, vec![]).await;
    let mut client = connect(&harness.server).await;
    let _handshake = next_message(&mut client).await;

    client
      .send(WsMessage::binary(
        br#"{"type":"mystery","payload":{}}"#.to_vec(),
      ))
      .await
      .unwrap();

    // server drops the connection; the stream ends shortly after
    let ended = timeout(Duration::from_secs(5), async {
      loop {
        match client.next().await {
          None => break,
          Some(Err(_)) => break,
          Some(Ok(WsMessage::Close(_))) => break,
          Some(Ok(_)) => continue,
        }
      }
    })
    .await;
    assert!(ended.is_ok());
  }
}
