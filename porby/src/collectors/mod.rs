//! Automatic collectors. Each one turns a domain event into a [`LogEntry`]
//! and hands it to the engine through a weak sink, so collectors never own
//! their coordinator.
//!
//! There is no portable request swizzling or view swizzling; the network
//! collector consumes completion records from whatever HTTP-client wrapper
//! the host installs, and the UI/lifecycle collectors expose explicit
//! `on_*` entry points with the same outbound contract.


use crossbeam_channel::{bounded, Sender};
use std::collections::HashMap;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

use crate::event::{
  Category, LogEntry, LogExtra, LogLevel, NetworkInfo, PerformanceInfo, UiInfo,
};
use crate::redact::Redactor;

/// Weak handle back into the engine; a dead engine just swallows emissions.
#[derive(Clone)]
pub struct CollectorSink {
  engine: Weak<crate::engine::LogEngine>,
}

impl CollectorSink {
  pub fn new(engine: Weak<crate::engine::LogEngine>) -> Self {
    Self { engine }
  }

  pub fn emit(&self, entry: LogEntry) {
    if let Some(engine) = self.engine.upgrade() {
      engine.submit(entry);
    }
  }
}

/// One completed HTTP exchange as observed by the host's client wrapper.
#[derive(Debug, Clone, Default)]
pub struct NetworkCapture {
  pub method: String,
  pub url: String,
  pub status_code: Option<u16>,
  /// Transport-level failure, when the exchange never produced a status.
  pub error: Option<String>,
  pub request_headers: HashMap<String, String>,
  pub response_headers: HashMap<String, String>,
  pub request_body: Option<Vec<u8>>,
  pub response_body: Option<Vec<u8>>,
  pub duration: Duration,
  pub bytes_sent: u64,
  pub bytes_received: u64,
}

fn status_level(status: Option<u16>, errored: bool) -> LogLevel {
  match status {
    Some(code) if code >= 500 => LogLevel::Error,
    Some(code) if code >= 300 => LogLevel::Warning,
    Some(_) => LogLevel::Info,
    None if errored => LogLevel::Error,
    None => LogLevel::Info,
  }
}

fn capture_body(body: Option<Vec<u8>>, max_bytes: usize) -> Option<String> {
  if max_bytes == 0 {
    return None;
  }
  body.map(|bytes| {
    let slice = &bytes[..bytes.len().min(max_bytes)];
    String::from_utf8_lossy(slice).into_owned()
  })
}

/// Builds the Network-variant entry: status-derived level, redacted URL and
/// headers, bodies truncated to the configured capture size.
pub fn network_entry(capture: NetworkCapture, redactor: &Redactor, max_body_bytes: usize) -> LogEntry {
  let level = status_level(capture.status_code, capture.error.is_some());
  let url = redactor.redact_url(&capture.url);

  let message = match (capture.status_code, &capture.error) {
    (Some(code), _) => format!("{} {} -> {}", capture.method, url, code),
    (None, Some(error)) => format!("{} {} failed: {}", capture.method, url, error),
    (None, None) => format!("{} {}", capture.method, url),
  };

  let info = NetworkInfo {
    method: capture.method,
    url: url.clone(),
    status_code: capture.status_code,
    request_headers: redactor.redact_headers(&capture.request_headers),
    response_headers: redactor.redact_headers(&capture.response_headers),
    request_body: capture_body(capture.request_body, max_body_bytes),
    response_body: capture_body(capture.response_body, max_body_bytes),
    duration_ms: capture.duration.as_secs_f64() * 1000.0,
    bytes_sent: capture.bytes_sent,
    bytes_received: capture.bytes_received,
  };

  LogEntry::new(level, Category::network(), message, "", "", 0).with_extra(LogExtra::Network(info))
}

pub fn ui_entry(event_type: &str, view_name: &str, detail: Option<&str>) -> LogEntry {
  let message = match detail {
    Some(detail) => format!("{} {} ({})", event_type, view_name, detail),
    None => format!("{} {}", event_type, view_name),
  };
  LogEntry::new(LogLevel::Debug, Category::ui(), message, "", "", 0).with_extra(LogExtra::Ui(
    UiInfo {
      event_type: event_type.to_string(),
      view_name: view_name.to_string(),
      detail: detail.map(|d| d.to_string()),
    },
  ))
}

pub fn lifecycle_entry(event: &str) -> LogEntry {
  LogEntry::new(
    LogLevel::Info,
    Category::lifecycle(),
    event.to_string(),
    "",
    "",
    0,
  )
}

/// Periodic sampler for process cpu/memory/disk. FPS needs a display-linked
/// callback and has no portable source here, so it stays unset.
pub struct PerformanceCollector {
  stop: Sender<()>,
  handle: Option<JoinHandle<()>>,
}

impl PerformanceCollector {
  pub fn start(sink: CollectorSink, interval: Duration) -> Self {
    let (stop, stop_rx) = bounded::<()>(1);
    let handle = thread::Builder::new()
      .name("porby-performance".to_string())
      .spawn(move || {
        let mut sampler = Sampler::new();
        debug!("performance sampler started");
        loop {
          match stop_rx.recv_timeout(interval) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {},
          }
          sink.emit(sampler.sample());
        }
      })
      .expect("spawn performance sampler");
    Self {
      stop,
      handle: Some(handle),
    }
  }

  /// One-off sample for the `requestPerformanceSnapshot` command.
  pub fn sample_now() -> LogEntry {
    Sampler::new().sample()
  }

  pub fn stop(mut self) {
    let _ = self.stop.try_send(());
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

impl Drop for PerformanceCollector {
  fn drop(&mut self) {
    let _ = self.stop.try_send(());
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

struct Sampler {
  system: System,
  pid: Pid,
}

impl Sampler {
  fn new() -> Self {
    Self {
      system: System::new(),
      pid: Pid::from_u32(std::process::id()),
    }
  }

  fn sample(&mut self) -> LogEntry {
    self
      .system
      .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);

    let (cpu_percent, memory_mb, disk_read, disk_write) = match self.system.process(self.pid) {
      Some(process) => {
        let disk = process.disk_usage();
        (
          process.cpu_usage() as f64,
          process.memory() as f64 / (1024.0 * 1024.0),
          disk.read_bytes,
          disk.written_bytes,
        )
      },
      None => (0.0, 0.0, 0, 0),
    };

    let info = PerformanceInfo {
      cpu_percent,
      memory_mb,
      fps: None,
      disk_read_bytes: disk_read,
      disk_write_bytes: disk_write,
    };
    let message = format!("cpu {:.1}% mem {:.1} MB", cpu_percent, memory_mb);
    LogEntry::new(LogLevel::Verbose, Category::performance(), message, "", "", 0)
      .with_extra(LogExtra::Performance(info))
  }
}
