//! Crash capture: a chaining panic hook plus handlers for the fatal
//! signals. On fire the current stack is resolved into frames, a fatal
//! `crash` entry goes straight into the ring buffer, the buffer is drained
//! synchronously into the journal, and the default action is re-raised so
//! the OS still records a native crash report.
//!
//! The handlers keep only a weak engine reference and do their file I/O
//! through the journal's pre-allocated emergency buffer. The ring-buffer
//! mutex is the only lock the signal path acquires before writing.

mod __test__;

use signal_hook_registry::SigId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::error;

use crate::engine::LogEngine;
use crate::event::{Category, CrashFrame, CrashInfo, LogEntry, LogExtra, LogLevel};

/// Signals that indicate the process is dying.
const FATAL_SIGNALS: [libc::c_int; 6] = [
  libc::SIGABRT,
  libc::SIGBUS,
  libc::SIGFPE,
  libc::SIGILL,
  libc::SIGSEGV,
  libc::SIGTRAP,
];

const MAX_FRAMES: usize = 64;

static INSTALLED: AtomicBool = AtomicBool::new(false);
static HANDLING: AtomicBool = AtomicBool::new(false);
static ENGINE: Mutex<Option<Weak<LogEngine>>> = Mutex::new(None);
static SIGNAL_IDS: Mutex<Vec<SigId>> = Mutex::new(Vec::new());

fn signal_name(signal: libc::c_int) -> &'static str {
  match signal {
    libc::SIGABRT => "SIGABRT",
    libc::SIGBUS => "SIGBUS",
    libc::SIGFPE => "SIGFPE",
    libc::SIGILL => "SIGILL",
    libc::SIGSEGV => "SIGSEGV",
    libc::SIGTRAP => "SIGTRAP",
    _ => "UNKNOWN",
  }
}

/// Resolves the current stack. Frames whose symbols cannot be resolved
/// degrade to a single-field frame carrying the raw address.
fn capture_frames() -> Vec<CrashFrame> {
  let mut frames: Vec<CrashFrame> = Vec::with_capacity(MAX_FRAMES);
  let mut index: u32 = 0;
  backtrace::trace(|frame| {
    let address = format!("{:p}", frame.ip());
    let mut symbol_name: Option<String> = None;
    let mut module: Option<String> = None;
    backtrace::resolve_frame(frame, |symbol| {
      if symbol_name.is_none() {
        symbol_name = symbol.name().map(|name| name.to_string());
        module = symbol
          .filename()
          .and_then(|path| path.file_name())
          .map(|name| name.to_string_lossy().into_owned());
      }
    });
    frames.push(match symbol_name {
      Some(symbol) => CrashFrame {
        index: Some(index),
        module,
        address: Some(address),
        symbol,
      },
      None => CrashFrame::raw(address),
    });
    index += 1;
    (frames.len()) < MAX_FRAMES
  });
  frames
}

fn current_thread_name() -> String {
  std::thread::current()
    .name()
    .unwrap_or("unnamed")
    .to_string()
}

fn crash_entry(signal: Option<&str>, exception_type: Option<&str>, reason: String) -> LogEntry {
  let info = CrashInfo {
    signal: signal.map(|s| s.to_string()),
    exception_type: exception_type.map(|e| e.to_string()),
    reason: reason.clone(),
    frames: capture_frames(),
    thread: current_thread_name(),
  };
  LogEntry::new(LogLevel::Fatal, Category::crash(), reason, "", "", 0)
    .with_extra(LogExtra::Crash(info))
}

fn deliver(entry: LogEntry) {
  let engine = ENGINE.lock().ok().and_then(|slot| {
    slot.as_ref().and_then(Weak::upgrade)
  });
  if let Some(engine) = engine {
    engine.ingest_crash(entry);
  }
}

/// Installs the panic hook and the fatal-signal handlers. The previous
/// panic hook is preserved and chained after ours.
pub fn install(engine: &Arc<LogEngine>) {
  *ENGINE.lock().unwrap() = Some(Arc::downgrade(engine));
  if INSTALLED.swap(true, Ordering::SeqCst) {
    return;
  }

  let previous = std::panic::take_hook();
  std::panic::set_hook(Box::new(move |info| {
    if INSTALLED.load(Ordering::SeqCst) && !HANDLING.swap(true, Ordering::SeqCst) {
      let reason = match info.payload().downcast_ref::<&str>() {
        Some(message) => message.to_string(),
        None => match info.payload().downcast_ref::<String>() {
          Some(message) => message.clone(),
          None => "panic with non-string payload".to_string(),
        },
      };
      let reason = match info.location() {
        Some(location) => format!("{} at {}:{}", reason, location.file(), location.line()),
        None => reason,
      };
      deliver(crash_entry(None, Some("panic"), reason));
      HANDLING.store(false, Ordering::SeqCst);
    }
    previous(info);
  }));

  let mut ids = SIGNAL_IDS.lock().unwrap();
  for signal in FATAL_SIGNALS {
    // SIGSEGV/SIGFPE/SIGILL sit on signal-hook's forbidden list, so the
    // registration goes through the registry's unchecked entry point
    let registered = unsafe {
      signal_hook_registry::register_unchecked(signal, move |_info| {
        handle_fatal_signal(signal);
      })
    };
    match registered {
      Ok(id) => ids.push(id),
      Err(err) => error!(signal, error = %err, "failed to install crash handler"),
    }
  }
}

fn handle_fatal_signal(signal: libc::c_int) {
  if INSTALLED.load(Ordering::SeqCst) && !HANDLING.swap(true, Ordering::SeqCst) {
    let name = signal_name(signal);
    let reason = format!("Fatal signal {} ({})", name, signal);
    deliver(crash_entry(Some(name), None, reason));
    HANDLING.store(false, Ordering::SeqCst);
  }
  // restore the default action and re-raise so the OS writes its report
  let _ = signal_hook::low_level::emulate_default_handler(signal);
}

/// Drops the signal registrations and turns the panic hook into a
/// pass-through. Safe to call more than once.
pub fn uninstall() {
  if !INSTALLED.swap(false, Ordering::SeqCst) {
    return;
  }
  for id in SIGNAL_IDS.lock().unwrap().drain(..) {
    signal_hook_registry::unregister(id);
  }
  *ENGINE.lock().unwrap() = None;
}
