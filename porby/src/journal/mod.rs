//! Append-only rotated journal. One file per rotation window, named
//! `porby_<yyyyMMdd_HHmmss>.json`, each line holding one encoded batch
//! array. Saves normally run on a dedicated worker thread; the crash path
//! writes inline on the caller thread against the same state.
//!
//! The running size only advances on a successful append, so after a
//! partial-write failure it may lag the on-disk size until the next
//! rotation. Rotation still keys off the nominal size crossing.


use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{FileProtection, PersistenceConfig};
use crate::event::LogEntry;

/// Filename prefix for journal files.
pub const JOURNAL_PREFIX: &str = "porby";

const JOURNAL_EXTENSION: &str = "json";

/// Pre-allocated capacity for the emergency encode buffer.
const EMERGENCY_BUFFER_CAPACITY: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum JournalError {
  #[error("journal I/O failed: {0}")]
  Io(#[from] std::io::Error),
  #[error("journal encode failed: {0}")]
  Encode(#[from] serde_json::Error),
  #[error("no usable journal directory")]
  NoDirectory,
}

#[derive(Debug)]
struct JournalState {
  current_file: Option<PathBuf>,
  current_size: u64,
}

/// Rotated on-disk journal. Shared between the persistence worker and the
/// crash path; all state sits behind one mutex.
#[derive(Debug)]
pub struct Journal {
  directory: PathBuf,
  config: PersistenceConfig,
  state: Mutex<JournalState>,
  /// Reserved at construction so the crash path does not have to grow it.
  emergency_buffer: Mutex<Vec<u8>>,
}

fn default_directory() -> Option<PathBuf> {
  directories::ProjectDirs::from("", "", JOURNAL_PREFIX)
    .map(|dirs| dirs.data_dir().join("logs"))
}

fn is_journal_file(path: &Path) -> bool {
  let name = match path.file_name().and_then(|n| n.to_str()) {
    Some(n) => n,
    None => return false,
  };
  name.starts_with(JOURNAL_PREFIX)
    && path
      .extension()
      .map(|e| e == JOURNAL_EXTENSION)
      .unwrap_or(false)
}

impl Journal {
  pub fn new(config: PersistenceConfig) -> Result<Self, JournalError> {
    let directory = config
      .directory_override
      .clone()
      .or_else(default_directory)
      .ok_or(JournalError::NoDirectory)?;
    fs::create_dir_all(&directory)?;

    Ok(Self {
      directory,
      config,
      state: Mutex::new(JournalState {
        current_file: None,
        current_size: 0,
      }),
      emergency_buffer: Mutex::new(Vec::with_capacity(EMERGENCY_BUFFER_CAPACITY)),
    })
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  /// Appends one batch as a single newline-terminated frame, rotating first
  /// when the running size would cross the limit. Retention runs after
  /// every write.
  pub fn save(&self, batch: &[LogEntry]) -> Result<(), JournalError> {
    if batch.is_empty() {
      return Ok(());
    }
    let encoded = serde_json::to_vec(batch)?;
    self.append_frame(&encoded)?;
    self.run_retention();
    Ok(())
  }

  /// Crash-path save: encodes into the pre-allocated buffer and appends on
  /// the calling thread. Skips retention; the process is about to die.
  pub fn emergency_save(&self, batch: &[LogEntry]) -> Result<(), JournalError> {
    if batch.is_empty() {
      return Ok(());
    }
    let mut buffer = match self.emergency_buffer.lock() {
      Ok(b) => b,
      Err(poisoned) => poisoned.into_inner(),
    };
    buffer.clear();
    serde_json::to_writer(&mut *buffer, batch)?;
    self.append_frame(&buffer)
  }

  fn append_frame(&self, encoded: &[u8]) -> Result<(), JournalError> {
    let mut state = match self.state.lock() {
      Ok(s) => s,
      Err(poisoned) => poisoned.into_inner(),
    };

    let frame_len = encoded.len() as u64 + 1;
    if state.current_file.is_some() && state.current_size + frame_len > self.config.max_file_size {
      state.current_file = None;
      state.current_size = 0;
    }

    if state.current_file.is_none() {
      let name = format!(
        "{}_{}.{}",
        JOURNAL_PREFIX,
        Utc::now().format("%Y%m%d_%H%M%S"),
        JOURNAL_EXTENSION
      );
      let path = self.directory.join(name);
      state.current_file = Some(path);
      state.current_size = 0;
    }

    let path = state.current_file.clone().expect("file path set above");
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    apply_file_protection(&file, self.config.file_protection);
    file.write_all(encoded)?;
    file.write_all(b"\n")?;
    file.sync_data()?;

    // only advances on success; see the drift note in the module docs
    state.current_size += frame_len;
    Ok(())
  }

  /// All journal files, sorted by filename ascending (chronological).
  fn journal_files(&self) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = match fs::read_dir(&self.directory) {
      Ok(entries) => entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| is_journal_file(p))
        .collect(),
      Err(_) => Vec::new(),
    };
    files.sort();
    files
  }

  /// Newest-first bounded replay: walks files newest-first, lines within a
  /// file newest-first, each line decoded as a batch array and reversed,
  /// accumulating until the cap is reached. A line that fails to decode is
  /// skipped on its own.
  pub fn load_for_replay(&self) -> Vec<LogEntry> {
    let max = self.config.max_replay_entries;
    if max == 0 {
      return Vec::new();
    }

    let mut accumulated: Vec<LogEntry> = Vec::new();
    for path in self.journal_files().iter().rev() {
      let file = match File::open(path) {
        Ok(f) => f,
        Err(err) => {
          warn!(path = %path.display(), error = %err, "journal file unreadable; skipping");
          continue;
        },
      };
      let lines: Vec<String> = BufReader::new(file).lines().map_while(Result::ok).collect();
      for line in lines.iter().rev() {
        if line.is_empty() {
          continue;
        }
        let mut batch: Vec<LogEntry> = match serde_json::from_str(line) {
          Ok(b) => b,
          Err(err) => {
            warn!(path = %path.display(), error = %err, "corrupt journal line; skipping");
            continue;
          },
        };
        batch.reverse();
        accumulated.extend(batch);
        if accumulated.len() >= max {
          accumulated.truncate(max);
          return accumulated;
        }
      }
    }
    accumulated
  }

  /// Deletes every journal file and forgets the current-file state.
  pub fn clear_replayed_entries(&self) {
    for path in self.journal_files() {
      if let Err(err) = fs::remove_file(&path) {
        warn!(path = %path.display(), error = %err, "failed to delete replayed journal file");
      }
    }
    let mut state = match self.state.lock() {
      Ok(s) => s,
      Err(poisoned) => poisoned.into_inner(),
    };
    state.current_file = None;
    state.current_size = 0;
  }

  /// Age sweep first, then count: files older than the retention window go,
  /// and if more than `max_file_count` survive, the oldest excess goes too.
  fn run_retention(&self) {
    let files = self.journal_files();
    let now = SystemTime::now();

    let mut survivors: Vec<PathBuf> = Vec::with_capacity(files.len());
    for path in files {
      let expired = fs::metadata(&path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .map(|age| age > self.config.max_retention)
        .unwrap_or(false);
      if expired {
        debug!(path = %path.display(), "journal retention: deleting expired file");
        let _ = fs::remove_file(&path);
      } else {
        survivors.push(path);
      }
    }

    if survivors.len() > self.config.max_file_count {
      let excess = survivors.len() - self.config.max_file_count;
      for path in survivors.iter().take(excess) {
        debug!(path = %path.display(), "journal retention: deleting oldest excess file");
        let _ = fs::remove_file(path);
      }
    }
  }
}

/// Data-at-rest protection classes only exist on Apple platforms; this
/// build target has no equivalent, so the configured class is recorded and
/// otherwise a no-op.
fn apply_file_protection(_file: &File, _protection: FileProtection) {}

enum PersistenceOp {
  Save(Vec<LogEntry>),
  Clear,
  Shutdown,
}

/// Owner of the serialized persistence context: a dedicated worker thread
/// draining an op queue, the way the engine's writer thread drains its
/// message channel.
pub struct PersistenceWorker {
  sender: Sender<PersistenceOp>,
  handle: Option<JoinHandle<()>>,
}

impl PersistenceWorker {
  pub fn spawn(journal: Arc<Journal>) -> Self {
    let (sender, receiver) = crossbeam_channel::bounded::<PersistenceOp>(64);
    let handle = thread::Builder::new()
      .name("porby-persistence".to_string())
      .spawn(move || Self::worker_loop(receiver, journal))
      .expect("spawn persistence worker");
    Self {
      sender,
      handle: Some(handle),
    }
  }

  fn worker_loop(receiver: Receiver<PersistenceOp>, journal: Arc<Journal>) {
    while let Ok(op) = receiver.recv() {
      match op {
        PersistenceOp::Save(batch) => {
          if let Err(err) = journal.save(&batch) {
            warn!(error = %err, dropped = batch.len(), "journal save failed");
          }
        },
        PersistenceOp::Clear => journal.clear_replayed_entries(),
        PersistenceOp::Shutdown => break,
      }
    }
  }

  /// Queues a batch for persistence. Never blocks the caller; a full queue
  /// drops the batch.
  pub fn save(&self, batch: Vec<LogEntry>) {
    if let Err(err) = self.sender.try_send(PersistenceOp::Save(batch)) {
      warn!(error = %err, "persistence queue full; dropping batch");
    }
  }

  pub fn clear(&self) {
    let _ = self.sender.try_send(PersistenceOp::Clear);
  }

  pub fn shutdown(&mut self) {
    let _ = self.sender.send(PersistenceOp::Shutdown);
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

impl Drop for PersistenceWorker {
  fn drop(&mut self) {
    self.shutdown();
  }
}
