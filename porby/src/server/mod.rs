//! WebSocket server: accepts viewer connections, gates everything behind
//! pairing, broadcasts entry batches and delivers journal replays.
//!
//! One task accepts connections; each connection gets a forwarding channel
//! plus a receive loop, so writes from any thread reduce to a non-blocking
//! channel send. Per-connection failures cancel that connection only.

mod __test__;

use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{Handshake, LogEntry};
use crate::pairing::{PairingManager, PairingOutcome};
use crate::wire::{self, Command, WireMessage};

#[derive(Debug, Error)]
pub enum ServerError {
  #[error("invalid port {port}: {source}")]
  InvalidPort {
    port: u16,
    #[source]
    source: std::io::Error,
  },
}

/// Coarse connection state surfaced to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Waiting,
  ViewerConnected,
  ViewerDisconnected,
}

/// Callbacks out of the server context. All of them must be cheap or hand
/// off; they run on server tasks.
pub struct ServerEvents {
  /// Invoked once a peer is authorized, before it joins the broadcast set,
  /// so replay frames enqueue ahead of live traffic.
  pub on_viewer_authenticated: Box<dyn Fn(&WsServer, Uuid) + Send + Sync>,
  pub on_command: Box<dyn Fn(Command) + Send + Sync>,
  pub on_state: Box<dyn Fn(ConnectionState) + Send + Sync>,
}

#[derive(Debug, Clone, Copy)]
pub struct ServerSettings {
  pub port: u16,
  pub max_connections: usize,
  pub heartbeat_interval: std::time::Duration,
}

struct Peer {
  sender: mpsc::Sender<WsMessage>,
}

struct Shared {
  connections: Mutex<HashMap<Uuid, Peer>>,
  authenticated: Mutex<HashSet<Uuid>>,
  pairing: Option<Arc<Mutex<PairingManager>>>,
  handshake: Handshake,
  events: ServerEvents,
  max_connections: usize,
}

pub struct WsServer {
  shared: Arc<Shared>,
  port: u16,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsServer {
  /// Binds the listener and spawns the accept and heartbeat tasks. A bind
  /// failure on the configured port surfaces as `InvalidPort`.
  pub async fn start(
    settings: ServerSettings,
    pairing: Option<Arc<Mutex<PairingManager>>>,
    handshake: Handshake,
    events: ServerEvents,
  ) -> Result<Arc<WsServer>, ServerError> {
    let listener = TcpListener::bind(("0.0.0.0", settings.port))
      .await
      .map_err(|source| ServerError::InvalidPort {
        port: settings.port,
        source,
      })?;
    let port = listener
      .local_addr()
      .map_err(|source| ServerError::InvalidPort {
        port: settings.port,
        source,
      })?
      .port();

    let server = Arc::new(WsServer {
      shared: Arc::new(Shared {
        connections: Mutex::new(HashMap::new()),
        authenticated: Mutex::new(HashSet::new()),
        pairing,
        handshake,
        events,
        max_connections: settings.max_connections.max(1),
      }),
      port,
      tasks: Mutex::new(Vec::new()),
    });

    let accept_server = Arc::clone(&server);
    let accept_task = tokio::spawn(async move {
      loop {
        match listener.accept().await {
          Ok((stream, addr)) => {
            let open = accept_server.shared.connections.lock().unwrap().len();
            if open >= accept_server.shared.max_connections {
              warn!(%addr, open, "connection limit reached; refusing viewer");
              drop(stream);
              continue;
            }
            let conn_server = Arc::clone(&accept_server);
            tokio::spawn(async move {
              handle_connection(conn_server, stream).await;
            });
          },
          Err(err) => {
            warn!(error = %err, "accept failed");
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
          },
        }
      }
    });

    let mut tasks = vec![accept_task];
    if !settings.heartbeat_interval.is_zero() {
      let beat_server = Arc::clone(&server);
      tasks.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
          ticker.tick().await;
          beat_server.broadcast_to_all(&WireMessage::Ping);
        }
      }));
    }
    *server.tasks.lock().unwrap() = tasks;

    info!(port, "log server listening");
    Ok(server)
  }

  /// The bound port; differs from the configured one when that was 0.
  pub fn port(&self) -> u16 {
    self.port
  }

  /// With pairing, at least one authorized peer; without, any connection.
  pub fn has_authenticated_viewers(&self) -> bool {
    if self.shared.pairing.is_some() {
      !self.shared.authenticated.lock().unwrap().is_empty()
    } else {
      !self.shared.connections.lock().unwrap().is_empty()
    }
  }

  /// Delivers a drained batch to every authorized peer as `log`/`logBatch`.
  pub fn send(&self, entries: Vec<LogEntry>) {
    if entries.is_empty() {
      return;
    }
    let message = WireMessage::for_entries(entries);
    let frame = match encode_frame(&message) {
      Some(f) => f,
      None => return,
    };

    let targets: Vec<mpsc::Sender<WsMessage>> = {
      let connections = self.shared.connections.lock().unwrap();
      if self.shared.pairing.is_none() {
        connections.values().map(|p| p.sender.clone()).collect()
      } else {
        let authenticated = self.shared.authenticated.lock().unwrap();
        connections
          .iter()
          .filter(|(id, _)| authenticated.contains(*id))
          .map(|(_, p)| p.sender.clone())
          .collect()
      }
    };

    for sender in targets {
      let _ = sender.try_send(frame.clone());
    }
  }

  /// Delivers journaled entries to one peer only, as a `logReplay` frame.
  pub fn send_replay(&self, entries: Vec<LogEntry>, peer: Uuid) {
    if entries.is_empty() {
      return;
    }
    let frame = match encode_frame(&WireMessage::LogReplay(entries)) {
      Some(f) => f,
      None => return,
    };
    if let Some(sender) = self
      .shared
      .connections
      .lock()
      .unwrap()
      .get(&peer)
      .map(|p| p.sender.clone())
    {
      let _ = sender.try_send(frame);
    }
  }

  fn broadcast_to_all(&self, message: &WireMessage) {
    let frame = match encode_frame(message) {
      Some(f) => f,
      None => return,
    };
    let senders: Vec<mpsc::Sender<WsMessage>> = self
      .shared
      .connections
      .lock()
      .unwrap()
      .values()
      .map(|p| p.sender.clone())
      .collect();
    for sender in senders {
      let _ = sender.try_send(frame.clone());
    }
  }

  /// Cancels the accept/heartbeat tasks and asks every live connection to
  /// close; their read loops exit as the sockets shut down.
  pub fn stop(&self) {
    for task in self.tasks.lock().unwrap().drain(..) {
      task.abort();
    }
    let peers: Vec<mpsc::Sender<WsMessage>> = self
      .shared
      .connections
      .lock()
      .unwrap()
      .values()
      .map(|p| p.sender.clone())
      .collect();
    for sender in peers {
      let _ = sender.try_send(WsMessage::Close(None));
    }
    self.shared.connections.lock().unwrap().clear();
    self.shared.authenticated.lock().unwrap().clear();
  }

  /// Admits the peer to the broadcast set after the authenticated hook ran.
  fn mark_authenticated(&self, id: Uuid) -> bool {
    if !self.shared.connections.lock().unwrap().contains_key(&id) {
      return false;
    }
    self.shared.authenticated.lock().unwrap().insert(id);
    (self.shared.events.on_state)(ConnectionState::ViewerConnected);
    true
  }

  fn is_authenticated(&self, id: Uuid) -> bool {
    self.shared.authenticated.lock().unwrap().contains(&id)
  }

  async fn send_to(&self, id: Uuid, message: &WireMessage) {
    let frame = match encode_frame(message) {
      Some(f) => f,
      None => return,
    };
    let sender = self
      .shared
      .connections
      .lock()
      .unwrap()
      .get(&id)
      .map(|p| p.sender.clone());
    if let Some(sender) = sender {
      let _ = sender.send(frame).await;
    }
  }

  fn remove_connection(&self, id: Uuid) {
    let remaining = {
      let mut connections = self.shared.connections.lock().unwrap();
      connections.remove(&id);
      connections.len()
    };
    let was_authenticated = self.shared.authenticated.lock().unwrap().remove(&id);

    debug!(%id, remaining, "viewer disconnected");
    if was_authenticated {
      (self.shared.events.on_state)(ConnectionState::ViewerDisconnected);
    }
    if remaining == 0 {
      (self.shared.events.on_state)(ConnectionState::Waiting);
    }
  }
}

async fn handle_connection(server: Arc<WsServer>, stream: TcpStream) {
  let ws_stream = match accept_async(stream).await {
    Ok(ws) => ws,
    Err(err) => {
      warn!(error = %err, "websocket handshake failed");
      return;
    },
  };

  let id = Uuid::new_v4();
  let (mut ws_sender, mut ws_receiver) = ws_stream.split();
  let (sender, mut receiver) = mpsc::channel::<WsMessage>(64);

  server
    .shared
    .connections
    .lock()
    .unwrap()
    .insert(id, Peer { sender: sender.clone() });
  debug!(%id, "viewer connected");

  // forward queued frames to the socket
  let writer = tokio::spawn(async move {
    while let Some(frame) = receiver.recv().await {
      let closing = matches!(frame, WsMessage::Close(_));
      if ws_sender.send(frame).await.is_err() || closing {
        break;
      }
    }
  });

  // session is ready: the handshake goes out before anything else
  if let Some(frame) = encode_frame(&WireMessage::Handshake(server.shared.handshake.clone())) {
    let _ = sender.send(frame).await;
  }

  // without pairing, a ready session is immediately an authorized viewer
  if server.shared.pairing.is_none() {
    authorize_peer(&server, id).await;
  }

  while let Some(incoming) = ws_receiver.next().await {
    let bytes = match &incoming {
      Ok(WsMessage::Binary(data)) => data.to_vec(),
      Ok(WsMessage::Text(text)) => text.as_bytes().to_vec(),
      Ok(WsMessage::Close(_)) => break,
      Ok(_) => continue, // ws-level ping/pong handled by the stack
      Err(err) => {
        warn!(%id, error = %err, "receive failed; closing connection");
        break;
      },
    };

    let message = match wire::decode(&bytes) {
      Ok(m) => m,
      Err(err) => {
        warn!(%id, error = %err, "protocol error; closing connection");
        break;
      },
    };

    handle_message(&server, id, message).await;
  }

  writer.abort();
  server.remove_connection(id);
}

async fn handle_message(server: &Arc<WsServer>, id: Uuid, message: WireMessage) {
  match message {
    WireMessage::Ping => server.broadcast_to_all(&WireMessage::Pong),
    WireMessage::Command(command) => {
      let authorized = server.shared.pairing.is_none() || server.is_authenticated(id);
      if authorized {
        (server.shared.events.on_command)(command);
      } else {
        debug!(%id, "command from unauthenticated peer ignored");
      }
    },
    WireMessage::PairingRequest(request) => {
      let outcome = match &server.shared.pairing {
        None => PairingOutcome::Accepted,
        Some(manager) => manager.lock().unwrap().validate(&request.code),
      };
      match outcome {
        PairingOutcome::Accepted => {
          server.send_to(id, &WireMessage::pairing_accepted()).await;
          authorize_peer(server, id).await;
        },
        PairingOutcome::Rejected { reason } => {
          info!(%id, %reason, "pairing rejected");
          server.send_to(id, &WireMessage::pairing_rejected(reason)).await;
        },
      }
    },
    // server side ignores peer-bound traffic echoed back at it
    WireMessage::Handshake(_)
    | WireMessage::Log(_)
    | WireMessage::LogBatch(_)
    | WireMessage::LogReplay(_)
    | WireMessage::Pong
    | WireMessage::PairingResponse(_) => {},
  }
}

/// Runs the authenticated hook (journal replay) off the runtime, then admits
/// the peer to the broadcast set. Replay frames therefore sit in the peer's
/// queue before any live batch targets it.
async fn authorize_peer(server: &Arc<WsServer>, id: Uuid) {
  if server.is_authenticated(id) {
    return;
  }
  let hook_server = Arc::clone(server);
  let _ = tokio::task::spawn_blocking(move || {
    (hook_server.shared.events.on_viewer_authenticated)(&hook_server, id);
  })
  .await;

  server.mark_authenticated(id);
}

fn encode_frame(message: &WireMessage) -> Option<WsMessage> {
  match wire::encode(message) {
    Ok(bytes) => Some(WsMessage::binary(bytes)),
    Err(err) => {
      warn!(error = %err, "frame encode failed");
      None
    },
  }
}
