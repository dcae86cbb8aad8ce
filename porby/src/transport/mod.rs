//! Transport layer: owns the WebSocket server, the Bonjour advertiser, the
//! pairing manager, the persistence journal and the network path monitor,
//! and routes drained batches either to authorized viewers or to disk.

mod __test__;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{info, warn};
use uuid::Uuid;

use crate::advertiser::{AdvertiserError, BonjourAdvertiser};
use crate::config::Config;
use crate::event::{AppInfo, DeviceInfo, Handshake, LogEntry, PROTOCOL_VERSION, SDK_VERSION};
use crate::journal::{Journal, JournalError, PersistenceWorker};
use crate::monitor::{NetworkPathMonitor, PathEvent};
use crate::pairing::PairingManager;
use crate::server::{ConnectionState, ServerError, ServerEvents, ServerSettings, WsServer};
use crate::wire::Command;

/// How long a restart waits between tearing the listener down and binding
/// the new socket.
const RESTART_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("transport runtime failed: {0}")]
  Runtime(#[from] std::io::Error),
  #[error(transparent)]
  Server(#[from] ServerError),
  #[error(transparent)]
  Journal(#[from] JournalError),
  #[error(transparent)]
  Advertiser(#[from] AdvertiserError),
}

/// Callbacks the engine hands to the transport at start.
#[derive(Clone)]
pub struct TransportEvents {
  pub on_command: Arc<dyn Fn(Command) + Send + Sync>,
  pub on_state: Arc<dyn Fn(ConnectionState) + Send + Sync>,
}

pub struct Transport {
  runtime: Mutex<Option<Runtime>>,
  handle: Handle,
  config: Config,
  handshake: Handshake,
  events: TransportEvents,
  pairing: Option<Arc<Mutex<PairingManager>>>,
  journal: Option<Arc<Journal>>,
  persistence: Mutex<Option<PersistenceWorker>>,
  server: Mutex<Option<Arc<WsServer>>>,
  advertiser: Mutex<Option<BonjourAdvertiser>>,
  monitor: Mutex<Option<NetworkPathMonitor>>,
  is_restarting: AtomicBool,
}

impl Transport {
  pub fn start(config: Config, events: TransportEvents) -> Result<Arc<Self>, TransportError> {
    let runtime = Builder::new_multi_thread()
      .worker_threads(2)
      .thread_name("porby-transport")
      .enable_all()
      .build()?;
    let handle = runtime.handle().clone();

    let journal = if config.persistence.enabled {
      Some(Arc::new(Journal::new(config.persistence.clone())?))
    } else {
      None
    };
    let persistence = journal.as_ref().map(|j| PersistenceWorker::spawn(Arc::clone(j)));

    let pairing = if config.transport.requires_pairing {
      let manager = PairingManager::new(&config.transport);
      // the platform developer log is where the operator reads the PIN
      info!(pin = %manager.code(), "pairing PIN");
      Some(Arc::new(Mutex::new(manager)))
    } else {
      None
    };

    let mut device = DeviceInfo::current();
    if config.transport.anonymize_device_name {
      device = device.anonymized();
    }
    let app = AppInfo::current();
    let handshake = Handshake {
      protocol_version: PROTOCOL_VERSION,
      sdk_version: SDK_VERSION.to_string(),
      device,
      app,
      pairing_required: config.transport.requires_pairing,
      capabilities: vec!["logReplay".to_string(), "commands".to_string()],
    };

    let transport = Arc::new(Transport {
      runtime: Mutex::new(Some(runtime)),
      handle,
      config,
      handshake,
      events,
      pairing,
      journal,
      persistence: Mutex::new(persistence),
      server: Mutex::new(None),
      advertiser: Mutex::new(None),
      monitor: Mutex::new(None),
      is_restarting: AtomicBool::new(false),
    });

    Transport::start_listener(&transport)?;

    let weak: Weak<Transport> = Arc::downgrade(&transport);
    let monitor = NetworkPathMonitor::start(move |event| {
      if event == PathEvent::LocalNetworkAvailable {
        if let Some(transport) = weak.upgrade() {
          transport.restart_listener();
        }
      }
    });
    *transport.monitor.lock().unwrap() = Some(monitor);

    Ok(transport)
  }

  /// Binds the server and publishes the mDNS record against the bound port.
  fn start_listener(this: &Arc<Self>) -> Result<(), TransportError> {
    let settings = ServerSettings {
      port: this.config.transport.port,
      max_connections: this.config.transport.max_connections,
      heartbeat_interval: this.config.transport.heartbeat_interval,
    };

    let replay_transport = Arc::downgrade(this);
    let command_events = Arc::clone(&this.events.on_command);
    let state_events = Arc::clone(&this.events.on_state);
    let server_events = ServerEvents {
      on_viewer_authenticated: Box::new(move |server, peer| {
        if let Some(transport) = replay_transport.upgrade() {
          transport.replay_to(server, peer);
        }
      }),
      on_command: Box::new(move |command| (command_events)(command)),
      on_state: Box::new(move |state| (state_events)(state)),
    };

    let server = this.handle.block_on(WsServer::start(
      settings,
      this.pairing.clone(),
      this.handshake.clone(),
      server_events,
    ))?;

    match BonjourAdvertiser::start(
      &this.config.transport,
      &this.handshake.device,
      &this.handshake.app,
      server.port(),
    ) {
      Ok(advertiser) => *this.advertiser.lock().unwrap() = Some(advertiser),
      // discovery is best-effort; direct connections still work
      Err(err) => warn!(error = %err, "mdns advertisement unavailable"),
    }

    *this.server.lock().unwrap() = Some(server);
    Ok(())
  }

  /// Journal replay for a freshly authorized peer, then clear.
  fn replay_to(&self, server: &WsServer, peer: Uuid) {
    if !self.config.persistence.flush_on_connect {
      return;
    }
    let journal = match &self.journal {
      Some(j) => j,
      None => return,
    };
    let entries = journal.load_for_replay();
    if entries.is_empty() {
      return;
    }
    info!(count = entries.len(), %peer, "replaying journaled entries");
    server.send_replay(entries, peer);
    journal.clear_replayed_entries();
  }

  /// Live viewers get the batch; otherwise it goes to the journal.
  pub fn send(&self, batch: Vec<LogEntry>) {
    if batch.is_empty() {
      return;
    }
    let server = self.server.lock().unwrap().clone();
    match server {
      Some(server) if server.has_authenticated_viewers() => server.send(batch),
      _ => {
        if let Some(worker) = self.persistence.lock().unwrap().as_ref() {
          worker.save(batch);
        }
      },
    }
  }

  /// Crash-path write, inline on the calling thread.
  pub fn emergency_persist(&self, batch: &[LogEntry]) {
    if let Some(journal) = &self.journal {
      if let Err(err) = journal.emergency_save(batch) {
        warn!(error = %err, "emergency persist failed");
      }
    }
  }

  /// Best-effort delivery to whoever is connected right now.
  pub fn emergency_send(&self, batch: Vec<LogEntry>) {
    let server = self.server.lock().unwrap().clone();
    if let Some(server) = server {
      if server.has_authenticated_viewers() {
        server.send(batch);
      }
    }
  }

  pub fn has_viewers(&self) -> bool {
    self
      .server
      .lock()
      .unwrap()
      .as_ref()
      .map(|s| s.has_authenticated_viewers())
      .unwrap_or(false)
  }

  /// The bound listener port, once the server is up.
  pub fn port(&self) -> Option<u16> {
    self.server.lock().unwrap().as_ref().map(|s| s.port())
  }

  /// Asks the persistence worker to wipe the journal.
  pub fn clear_journal(&self) {
    if let Some(worker) = self.persistence.lock().unwrap().as_ref() {
      worker.clear();
    }
  }

  /// The underlying TCP listener may be bound to an interface that no
  /// longer exists; tear it down, wait, bind anew.
  fn restart_listener(self: Arc<Self>) {
    if self.is_restarting.swap(true, Ordering::SeqCst) {
      return;
    }
    thread::Builder::new()
      .name("porby-transport-restart".to_string())
      .spawn(move || {
        info!("restarting listener after network path change");
        if let Some(server) = self.server.lock().unwrap().take() {
          server.stop();
        }
        if let Some(advertiser) = self.advertiser.lock().unwrap().take() {
          advertiser.stop();
        }
        thread::sleep(RESTART_DELAY);
        if let Err(err) = Self::start_listener(&self) {
          warn!(error = %err, "listener restart failed");
        }
        self.is_restarting.store(false, Ordering::SeqCst);
      })
      .ok();
  }

  /// Stops the monitor, the server (withdrawing the service record), the
  /// persistence worker, and finally the runtime. Idempotent.
  pub fn stop(&self) {
    if let Some(monitor) = self.monitor.lock().unwrap().take() {
      monitor.stop();
    }
    if let Some(server) = self.server.lock().unwrap().take() {
      server.stop();
    }
    if let Some(advertiser) = self.advertiser.lock().unwrap().take() {
      advertiser.stop();
    }
    if let Some(mut worker) = self.persistence.lock().unwrap().take() {
      worker.shutdown();
    }
    if let Some(runtime) = self.runtime.lock().unwrap().take() {
      runtime.shutdown_timeout(Duration::from_secs(1));
    }
  }
}
