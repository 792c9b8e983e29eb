//! Bounded history ring
//!
//! Fixed-capacity FIFO used by the bus (event history) and every engine
//! (field history). The owner keeps the ring private and hands out copies;
//! nothing outside the owning component ever holds a reference into it.

use std::collections::VecDeque;

use serde::Serialize;

use crate::error::{Result, SyncError};

/// Capacity used when none is configured
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Counters describing a ring's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RingStats {
    /// Current number of entries
    pub len: usize,
    /// Maximum number of entries
    pub capacity: usize,
    /// Total entries ever pushed
    pub pushed: u64,
    /// Entries dropped to make room
    pub evicted: u64,
}

/// Bounded FIFO: length never exceeds capacity, oldest entries go first
#[derive(Debug, Clone)]
pub struct HistoryRing<T> {
    entries: VecDeque<T>,
    capacity: usize,
    pushed: u64,
    evicted: u64,
}

impl<T: Clone> HistoryRing<T> {
    /// Create a ring holding at most `capacity` entries
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SyncError::invalid("history capacity must be at least 1"));
        }
        Ok(Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            pushed: 0,
            evicted: 0,
        })
    }

    /// Append an entry, returning the evicted one if the ring was full
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() == self.capacity {
            self.evicted += 1;
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        self.pushed += 1;
        evicted
    }

    /// Copy of all entries, oldest first
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }

    /// Copy of the entries matching `predicate`, oldest first
    pub fn snapshot_where<P>(&self, mut predicate: P) -> Vec<T>
    where
        P: FnMut(&T) -> bool,
    {
        self.entries.iter().filter(|e| predicate(e)).cloned().collect()
    }

    /// Most recent entry
    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    /// Iterate oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            len: self.entries.len(),
            capacity: self.capacity,
            pushed: self.pushed,
            evicted: self.evicted,
        }
    }
}

impl<T: Clone> Default for HistoryRing<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: DEFAULT_HISTORY_CAPACITY,
            pushed: 0,
            evicted: 0,
        }
    }
}
