//! Influence hand-off to the external aggregator.
//!
//! The aggregator itself lives outside this crate. [`InfluenceSink`] is the
//! contract the bus pushes vetted influence into, and [`InfluenceBoard`] is a
//! bounded in-process sink the daemon uses so the detailed probe can report
//! what is currently in force.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::models::ChamberInfluence;

/// Receives influence that passed the bus gate
pub trait InfluenceSink: Send + Sync {
    fn accept(&self, influence: &ChamberInfluence);
}

/// Bounded buffer of recent influence, newest last
pub struct InfluenceBoard {
    entries: Mutex<VecDeque<ChamberInfluence>>,
    max_size: usize,
}

impl InfluenceBoard {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_size.min(1024))),
            max_size: max_size.max(1),
        }
    }

    /// Influence that has not expired at `now`
    pub fn active_at(&self, now: DateTime<Utc>) -> Vec<ChamberInfluence> {
        self.entries
            .lock()
            .iter()
            .filter(|i| !i.is_expired_at(now))
            .cloned()
            .collect()
    }

    /// Drop expired entries, returning how many were removed
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|i| !i.is_expired_at(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl InfluenceSink for InfluenceBoard {
    fn accept(&self, influence: &ChamberInfluence) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_size {
            entries.pop_front();
        }
        entries.push_back(influence.clone());
    }
}
