//! Network path monitor. Polls the interface table on its own thread and
//! reports transitions in local-network availability; the transport uses
//! the gained-connectivity edge to restart a listener whose socket may be
//! bound to a gone-away interface.

mod __test__;

use crossbeam_channel::{bounded, Sender};
use std::net::IpAddr;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Edges reported to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEvent {
  LocalNetworkAvailable,
  LocalNetworkLost,
}

pub struct NetworkPathMonitor {
  stop: Sender<()>,
  handle: Option<JoinHandle<()>>,
}

/// A usable local-network path: some non-loopback IPv4 interface is up.
pub fn local_network_available() -> bool {
  if_addrs::get_if_addrs()
    .map(|interfaces| {
      interfaces.iter().any(|iface| {
        !iface.is_loopback() && matches!(iface.ip(), IpAddr::V4(_))
      })
    })
    .unwrap_or(false)
}

impl NetworkPathMonitor {
  pub fn start<F>(on_event: F) -> Self
  where
    F: Fn(PathEvent) + Send + 'static,
  {
    let (stop, stop_rx) = bounded::<()>(1);
    let handle = thread::Builder::new()
      .name("porby-path-monitor".to_string())
      .spawn(move || {
        let mut available = local_network_available();
        debug!(available, "path monitor started");
        loop {
          // recv_timeout doubles as the poll tick and the stop signal
          match stop_rx.recv_timeout(POLL_INTERVAL) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {},
          }
          let now = local_network_available();
          if now != available {
            available = now;
            if now {
              info!("local network became available");
              on_event(PathEvent::LocalNetworkAvailable);
            } else {
              info!("local network lost; entries will fall back to the journal");
              on_event(PathEvent::LocalNetworkLost);
            }
          }
        }
      })
      .expect("spawn path monitor");

    Self {
      stop,
      handle: Some(handle),
    }
  }

  pub fn stop(mut self) {
    let _ = self.stop.try_send(());
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

impl Drop for NetworkPathMonitor {
  fn drop(&mut self) {
    let _ = self.stop.try_send(());
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}
