//! The engine: gatekeeping, rate limiting, memory-pressure response,
//! collector lifecycle, buffer ownership, timed flushing and the crash
//! path's synchronous emergency drain.
//!
//! Producers hand entries to a writer thread through a bounded channel and
//! return immediately; the flush timer drains the buffer into the transport
//! on its own thread. The only lock the crash path touches is the ring
//! buffer's.


use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::buffer::{DualRingBuffer, MIN_CAPACITY};
use crate::collectors::{
  lifecycle_entry, network_entry, ui_entry, CollectorSink, NetworkCapture, PerformanceCollector,
};
use crate::config::{Config, ESTIMATED_BYTES_PER_ENTRY};
use crate::event::{Category, LogEntry, LogLevel, Metadata, MetadataValue};
use crate::redact::Redactor;
use crate::server::ConnectionState;
use crate::transport::{Transport, TransportEvents};
use crate::wire::Command;

const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

enum EngineMessage {
  Entry(Box<LogEntry>),
  Shutdown,
}

/// Single-second tumbling window. Error/fatal entries never consult it.
struct RateLimiter {
  max_per_second: u32,
  window: Mutex<Window>,
}

struct Window {
  started: Instant,
  count: u32,
}

impl RateLimiter {
  fn new(max_per_second: u32) -> Self {
    Self {
      max_per_second,
      window: Mutex::new(Window {
        started: Instant::now(),
        count: 0,
      }),
    }
  }

  /// True when the current window has seen more than the allowed count.
  fn is_limited(&self) -> bool {
    if self.max_per_second == 0 {
      return false;
    }
    let mut window = self.window.lock().unwrap();
    let now = Instant::now();
    if now.duration_since(window.started) >= Duration::from_secs(1) {
      window.started = now;
      window.count = 1;
      return false;
    }
    window.count += 1;
    window.count > self.max_per_second
  }
}

/// Filter state the viewer can retune at runtime; seeded from the config.
struct FilterState {
  enabled: AtomicBool,
  global_min: AtomicU8,
  category_levels: Mutex<HashMap<String, LogLevel>>,
  disabled: Mutex<HashSet<String>>,
}

impl FilterState {
  fn from_config(config: &Config) -> Self {
    Self {
      enabled: AtomicBool::new(config.enabled),
      global_min: AtomicU8::new(config.filter.global_min_level.severity()),
      category_levels: Mutex::new(config.filter.category_levels.clone()),
      disabled: Mutex::new(config.filter.disabled_categories.clone()),
    }
  }

  fn allows(&self, level: LogLevel, category: &Category) -> bool {
    if !self.enabled.load(Ordering::Relaxed) {
      return false;
    }
    if self.disabled.lock().unwrap().contains(&category.id) {
      return false;
    }
    let min = self
      .category_levels
      .lock()
      .unwrap()
      .get(&category.id)
      .map(|l| l.severity())
      .unwrap_or_else(|| self.global_min.load(Ordering::Relaxed));
    level.severity() >= min
  }
}

type StateObserver = Box<dyn Fn(ConnectionState) + Send + Sync>;

pub struct LogEngine {
  state: AtomicU8,
  config: Config,
  filter: FilterState,
  rate_limiter: RateLimiter,
  redactor: Redactor,
  pub(crate) buffer: Arc<DualRingBuffer>,
  transport: Option<Arc<Transport>>,
  ingest_tx: Sender<EngineMessage>,
  writer: Mutex<Option<JoinHandle<()>>>,
  flush_stop: Sender<()>,
  flush: Mutex<Option<JoinHandle<()>>>,
  performance: Mutex<Option<PerformanceCollector>>,
  state_observer: Mutex<Option<StateObserver>>,
}

impl LogEngine {
  /// Validates the config, spins up the buffer, transport, flush timer and
  /// collectors, and returns the running engine. A config that is disabled
  /// (or debug-only in a release build) yields an inert engine that drops
  /// everything.
  pub fn start(config: Config) -> Arc<LogEngine> {
    config.validate();

    let eligible = config.enabled && (!config.debug_builds_only || cfg!(debug_assertions));
    if !eligible {
      info!("logging disabled by configuration; engine is inert");
      return Self::inert(config);
    }

    // transport callbacks outlive this scope, so they reach the engine
    // through a slot filled in once the engine exists
    let engine_slot: Arc<OnceLock<Weak<LogEngine>>> = Arc::new(OnceLock::new());
    let command_slot = Arc::clone(&engine_slot);
    let state_slot = Arc::clone(&engine_slot);
    let events = TransportEvents {
      on_command: Arc::new(move |command| {
        if let Some(engine) = command_slot.get().and_then(Weak::upgrade) {
          engine.handle_command(command);
        }
      }),
      on_state: Arc::new(move |state| {
        if let Some(engine) = state_slot.get().and_then(Weak::upgrade) {
          engine.notify_state(state);
        }
      }),
    };

    let transport = match Transport::start(config.clone(), events) {
      Ok(transport) => transport,
      Err(err) => {
        // the SDK must never take the host down with it
        error!(error = %err, "transport failed to start; engine is inert");
        return Self::inert(config);
      },
    };

    let buffer = Arc::new(DualRingBuffer::new(
      config.limits.max_buffer_count,
      config.limits.priority_buffer_count,
    ));

    let (ingest_tx, ingest_rx) = bounded::<EngineMessage>(1024);
    let (flush_stop, flush_stop_rx) = bounded::<()>(1);

    let engine = Arc::new(LogEngine {
      state: AtomicU8::new(STATE_RUNNING),
      filter: FilterState::from_config(&config),
      rate_limiter: RateLimiter::new(config.limits.max_logs_per_second),
      redactor: Redactor::new(&config.privacy),
      buffer: Arc::clone(&buffer),
      transport: Some(Arc::clone(&transport)),
      ingest_tx,
      writer: Mutex::new(None),
      flush_stop,
      flush: Mutex::new(None),
      performance: Mutex::new(None),
      state_observer: Mutex::new(None),
      config,
    });
    let _ = engine_slot.set(Arc::downgrade(&engine));

    // writer thread: the single-writer queue in front of the buffer
    let writer_buffer = Arc::clone(&buffer);
    let writer_engine = Arc::downgrade(&engine);
    let writer = thread::Builder::new()
      .name("porby-engine".to_string())
      .spawn(move || Self::writer_loop(ingest_rx, writer_buffer, writer_engine))
      .expect("spawn engine writer");
    *engine.writer.lock().unwrap() = Some(writer);

    // flush timer: periodic drain into the transport
    let flush_interval = engine
      .config
      .limits
      .flush_interval
      .max(Duration::from_millis(1));
    let flush_buffer = Arc::clone(&buffer);
    let flush_transport = Arc::clone(&transport);
    let flush = thread::Builder::new()
      .name("porby-flush".to_string())
      .spawn(move || loop {
        match flush_stop_rx.recv_timeout(flush_interval) {
          Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
          Err(crossbeam_channel::RecvTimeoutError::Timeout) => {},
        }
        let batch = flush_buffer.drain();
        if !batch.is_empty() {
          flush_transport.send(batch);
        }
      })
      .expect("spawn flush timer");
    *engine.flush.lock().unwrap() = Some(flush);

    if engine.config.collectors.performance {
      let sink = CollectorSink::new(Arc::downgrade(&engine));
      *engine.performance.lock().unwrap() = Some(PerformanceCollector::start(
        sink,
        engine.config.limits.performance_sample_interval,
      ));
    }
    if engine.config.collectors.crash {
      crate::crash::install(&engine);
    }

    info!(port = ?transport.port(), "log engine started");
    engine
  }

  fn inert(config: Config) -> Arc<LogEngine> {
    let (ingest_tx, _ingest_rx) = bounded::<EngineMessage>(1);
    let (flush_stop, _flush_stop_rx) = bounded::<()>(1);
    Arc::new(LogEngine {
      state: AtomicU8::new(STATE_STOPPED),
      filter: FilterState::from_config(&config),
      rate_limiter: RateLimiter::new(config.limits.max_logs_per_second),
      redactor: Redactor::new(&config.privacy),
      buffer: Arc::new(DualRingBuffer::new(1, 1)),
      transport: None,
      ingest_tx,
      writer: Mutex::new(None),
      flush_stop,
      flush: Mutex::new(None),
      performance: Mutex::new(None),
      state_observer: Mutex::new(None),
      config,
    })
  }

  fn writer_loop(
    receiver: Receiver<EngineMessage>,
    buffer: Arc<DualRingBuffer>,
    engine: Weak<LogEngine>,
  ) {
    while let Ok(message) = receiver.recv() {
      match message {
        EngineMessage::Entry(entry) => {
          buffer.append(*entry);
          if let Some(engine) = engine.upgrade() {
            engine.enforce_memory_cap();
          }
        },
        EngineMessage::Shutdown => break,
      }
    }
  }

  /// Estimated-usage hard cap: flush what we have and shrink the ring.
  fn enforce_memory_cap(&self) {
    let cap_bytes = self.config.limits.max_buffer_bytes;
    if cap_bytes == 0 || self.buffer.estimated_bytes() <= cap_bytes {
      return;
    }
    warn!(cap_bytes, "buffer over its memory cap; flushing and shrinking");
    let batch = self.buffer.drain();
    if let Some(transport) = &self.transport {
      transport.send(batch);
    }
    let target = (cap_bytes / ESTIMATED_BYTES_PER_ENTRY) as usize;
    self.buffer.reduce_max_size(target.max(MIN_CAPACITY));
  }

  pub fn is_running(&self) -> bool {
    self.state.load(Ordering::Acquire) == STATE_RUNNING
  }

  /// The gate every producer goes through before building an entry.
  pub fn should_log(&self, level: LogLevel, category: &Category) -> bool {
    self.is_running() && self.filter.allows(level, category)
  }

  /// Filter, rate-limit, redact metadata, and hand off to the writer
  /// thread. Never blocks; a full queue drops the entry.
  pub fn submit(&self, mut entry: LogEntry) {
    if !self.should_log(entry.level, &entry.category) {
      return;
    }
    if !entry.is_priority() && self.rate_limiter.is_limited() {
      return;
    }
    if let Some(metadata) = entry.metadata.take() {
      entry.metadata = Some(self.redactor.redact_metadata(&metadata));
    }
    let _ = self.ingest_tx.try_send(EngineMessage::Entry(Box::new(entry)));
  }

  /// Host-facing log call with an explicit source site.
  #[allow(clippy::too_many_arguments)]
  pub fn log(
    &self,
    level: LogLevel,
    category: Category,
    message: &str,
    metadata: Option<Metadata>,
    file: &str,
    function: &str,
    line: u32,
  ) {
    if !self.should_log(level, &category) {
      return;
    }
    let mut entry = LogEntry::new(level, category, message, file, function, line);
    if let Some(metadata) = metadata {
      entry = entry.with_metadata(metadata);
    }
    self.submit(entry);
  }

  /// Bridge for host logging systems; `source` lands under `_source`.
  #[allow(clippy::too_many_arguments)]
  pub fn forward(
    &self,
    level: LogLevel,
    category: Category,
    message: &str,
    metadata: Option<Metadata>,
    source: Option<&str>,
    file: &str,
    function: &str,
    line: u32,
  ) {
    let mut metadata = metadata.unwrap_or_default();
    if let Some(source) = source {
      metadata.insert("_source".to_string(), MetadataValue::from(source));
    }
    let metadata = if metadata.is_empty() {
      None
    } else {
      Some(metadata)
    };
    self.log(level, category, message, metadata, file, function, line);
  }

  /// Explicit UI navigation hook; the portable stand-in for view swizzling.
  pub fn on_view_event(&self, event_type: &str, view_name: &str, detail: Option<&str>) {
    if self.config.collectors.ui {
      self.submit(ui_entry(event_type, view_name, detail));
    }
  }

  pub fn on_lifecycle_event(&self, event: &str) {
    if self.config.collectors.lifecycle {
      self.submit(lifecycle_entry(event));
    }
  }

  /// Entry point for the host's HTTP-client wrapper.
  pub fn record_network(&self, capture: NetworkCapture) {
    if self.config.collectors.network {
      self.submit(network_entry(
        capture,
        &self.redactor,
        self.config.privacy.max_body_bytes,
      ));
    }
  }

  /// Crash-path ingestion: appends straight to the buffer (the writer
  /// thread may never run again) and drains synchronously.
  pub(crate) fn ingest_crash(&self, entry: LogEntry) {
    self.buffer.append(entry);
    self.emergency_flush();
  }

  /// Synchronous drain for the crash path: journal first, then a
  /// best-effort send. Touches only the buffer and journal locks.
  pub fn emergency_flush(&self) {
    let batch = self.buffer.drain();
    if batch.is_empty() {
      return;
    }
    if let Some(transport) = &self.transport {
      transport.emergency_persist(&batch);
      transport.emergency_send(batch);
    }
  }

  /// Host memory-warning hook: flush, then halve the ring (floor 50).
  pub fn on_memory_warning(&self) {
    warn!("memory warning; flushing buffer and halving capacity");
    let batch = self.buffer.drain();
    if let Some(transport) = &self.transport {
      transport.send(batch);
    }
    let half = self.buffer.max_main() / 2;
    self.buffer.reduce_max_size(half.max(MIN_CAPACITY));
  }

  /// Registers the host's connection-state observer.
  pub fn set_connection_observer<F>(&self, observer: F)
  where
    F: Fn(ConnectionState) + Send + Sync + 'static,
  {
    *self.state_observer.lock().unwrap() = Some(Box::new(observer));
  }

  fn notify_state(&self, state: ConnectionState) {
    if let Some(observer) = self.state_observer.lock().unwrap().as_ref() {
      observer(state);
    }
  }

  fn handle_command(&self, command: Command) {
    match command {
      Command::SetLogLevel { level } => {
        info!(%level, "viewer set global log level");
        self
          .filter
          .global_min
          .store(level.severity(), Ordering::Relaxed);
      },
      Command::SetCategoryLevel { category, level } => {
        self
          .filter
          .category_levels
          .lock()
          .unwrap()
          .insert(category, level);
      },
      Command::SetEnabled { enabled, category } => match category {
        Some(category) => {
          let mut disabled = self.filter.disabled.lock().unwrap();
          if enabled {
            disabled.remove(&category);
          } else {
            disabled.insert(category);
          }
        },
        None => self.filter.enabled.store(enabled, Ordering::Relaxed),
      },
      Command::ClearLogs => {
        let _ = self.buffer.drain();
        if let Some(transport) = &self.transport {
          transport.clear_journal();
        }
      },
      Command::RequestPerformanceSnapshot => {
        self.submit(PerformanceCollector::sample_now());
      },
    }
  }

  /// Collectors stop in reverse registration order, the timer is cancelled,
  /// the buffer drains one last time, then the transport goes down.
  /// Idempotent.
  pub fn stop(&self) {
    if self
      .state
      .compare_exchange(
        STATE_RUNNING,
        STATE_STOPPED,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_err()
    {
      return;
    }

    crate::crash::uninstall();
    if let Some(performance) = self.performance.lock().unwrap().take() {
      performance.stop();
    }

    let _ = self.flush_stop.try_send(());
    if let Some(handle) = self.flush.lock().unwrap().take() {
      let _ = handle.join();
    }

    let _ = self.ingest_tx.send(EngineMessage::Shutdown);
    if let Some(handle) = self.writer.lock().unwrap().take() {
      let _ = handle.join();
    }

    let batch = self.buffer.drain();
    if let Some(transport) = &self.transport {
      if !batch.is_empty() {
        transport.send(batch);
      }
      transport.stop();
    }
    info!("log engine stopped");
  }

  /// The bound listener port, mainly for tests and diagnostics.
  pub fn port(&self) -> Option<u16> {
    self.transport.as_ref().and_then(|t| t.port())
  }
}

impl Drop for LogEngine {
  fn drop(&mut self) {
    self.stop();
  }
}
