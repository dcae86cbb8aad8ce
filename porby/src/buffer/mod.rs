//! Bounded dual-ring memory store. One mutex guards both rings; append
//! never fails, it silently evicts the oldest entries instead.


use std::collections::VecDeque;
use std::sync::Mutex;

use crate::config::ESTIMATED_BYTES_PER_ENTRY;
use crate::event::LogEntry;

/// Floor for capacity reductions under memory pressure.
pub const MIN_CAPACITY: usize = 50;

#[derive(Debug)]
struct Rings {
  main: VecDeque<LogEntry>,
  priority: VecDeque<LogEntry>,
  max_main: usize,
  max_priority: usize,
}

impl Rings {
  fn push_bounded(ring: &mut VecDeque<LogEntry>, cap: usize, entry: LogEntry) {
    while ring.len() + 1 > cap {
      ring.pop_front();
    }
    ring.push_back(entry);
  }
}

#[derive(Debug)]
pub struct DualRingBuffer {
  rings: Mutex<Rings>,
}

impl DualRingBuffer {
  fn lock_rings(&self) -> std::sync::MutexGuard<'_, Rings> {
    match self.rings.lock() {
      Ok(guard) => guard,
      // the crash path still drains after a producer panicked mid-append
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  pub fn new(max_main: usize, max_priority: usize) -> Self {
    Self {
      rings: Mutex::new(Rings {
        main: VecDeque::with_capacity(max_main.min(1024)),
        priority: VecDeque::with_capacity(max_priority.min(256)),
        max_main: max_main.max(1),
        max_priority: max_priority.max(1),
      }),
    }
  }

  /// Appends to the main ring; error/fatal entries are mirrored into the
  /// priority ring so an overflow of chatter cannot evict them entirely.
  pub fn append(&self, entry: LogEntry) {
    let mut rings = self.lock_rings();
    if entry.is_priority() {
      let cap = rings.max_priority;
      let copy = entry.clone();
      Rings::push_bounded(&mut rings.priority, cap, copy);
    }
    let cap = rings.max_main;
    Rings::push_bounded(&mut rings.main, cap, entry);
  }

  /// Union of both rings, deduplicated by id (first occurrence wins), in
  /// non-decreasing timestamp order. Clears both rings.
  pub fn drain(&self) -> Vec<LogEntry> {
    let mut rings = self.lock_rings();
    let rings = &mut *rings;
    let mut batch: Vec<LogEntry> = Vec::with_capacity(rings.main.len() + rings.priority.len());
    let mut seen = std::collections::HashSet::with_capacity(batch.capacity());

    for entry in rings.main.drain(..).chain(rings.priority.drain(..)) {
      if seen.insert(entry.id) {
        batch.push(entry);
      }
    }

    batch.sort_by_key(|e| e.timestamp);
    batch
  }

  /// Lowers the main ring capacity and trims the oldest excess.
  pub fn reduce_max_size(&self, new_cap: usize) {
    let new_cap = new_cap.max(MIN_CAPACITY);
    let mut rings = self.lock_rings();
    if new_cap >= rings.max_main {
      return;
    }
    rings.max_main = new_cap;
    while rings.main.len() > new_cap {
      rings.main.pop_front();
    }
  }

  pub fn max_main(&self) -> usize {
    self.lock_rings().max_main
  }

  pub fn len(&self) -> usize {
    let rings = self.lock_rings();
    rings.main.len() + rings.priority.len()
  }

  pub fn is_empty(&self) -> bool {
    let rings = self.lock_rings();
    rings.main.is_empty() && rings.priority.is_empty()
  }

  /// Rough footprint at a fixed per-entry estimate; drives the hard cap.
  pub fn estimated_bytes(&self) -> u64 {
    self.len() as u64 * ESTIMATED_BYTES_PER_ENTRY
  }
}
