//! Ledger hand-off. Durable history belongs to an external immutable ledger;
//! the bus only copies each accepted event into whatever implements
//! [`EventLedger`].

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::events::PlatformEvent;

pub trait EventLedger: Send + Sync {
    fn append(&self, sequence: u64, event: &PlatformEvent) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub sequence: u64,
    pub event: PlatformEvent,
    pub recorded_at: DateTime<Utc>,
}

/// Process-lifetime ring buffer of recent events
pub struct MemoryLedger {
    entries: Mutex<VecDeque<LedgerEntry>>,
    max_size: usize,
}

impl MemoryLedger {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_size.min(10_000))),
            max_size: max_size.max(1),
        }
    }

    /// Most recent entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<LedgerEntry> {
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl EventLedger for MemoryLedger {
    fn append(&self, sequence: u64, event: &PlatformEvent) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_size {
            entries.pop_front();
        }
        entries.push_back(LedgerEntry {
            sequence,
            event: event.clone(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}
