// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, sampled ingestion queue with live capacity changes.
//!
//! Producers never block: a record that does not fit is dropped. A capacity
//! change never resizes in place. It allocates a new generation for further
//! admissions and parks the previous one in a retired list that the drain
//! worker empties, oldest first, before it touches the current generation.
//!
//! ```text
//!   admit ──► current generation ─────────────────────┐
//!                                                     v
//!             retired[0] ─► retired[1] ─► ... ─► drain_batch (single consumer)
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

use crate::config::QueueSettings;
use crate::constants;
use crate::record::LogRecord;

/// One buffer instance. Replaced, never resized.
#[derive(Debug)]
struct Generation {
    id: u64,
    capacity: usize,
    tx: mpsc::Sender<LogRecord>,
    rx: Mutex<mpsc::Receiver<LogRecord>>,
}

impl Generation {
    fn new(id: u64, capacity: usize) -> Self {
        let capacity = capacity.clamp(1, constants::MAX_QUEUE_CAPACITY);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            id,
            capacity,
            tx,
            rx: Mutex::new(rx),
        }
    }

    fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Moves up to `max` records into `batch`. Returns true when the
    /// generation ran dry before `max` was reached.
    fn drain_into(&self, batch: &mut Vec<LogRecord>, max: usize) -> bool {
        #[allow(clippy::expect_used)]
        let mut rx = self.rx.lock().expect("lock poisoned");
        let mut taken = 0;
        while taken < max {
            match rx.try_recv() {
                Ok(record) => {
                    batch.push(record);
                    taken += 1;
                }
                Err(_) => return true,
            }
        }
        false
    }
}

/// Outcome of one `admit` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdmitSummary {
    pub admitted: usize,
    pub sampled_out: usize,
    pub dropped_full: usize,
}

#[derive(Debug, Default)]
struct QueueStats {
    admitted: AtomicU64,
    sampled_out: AtomicU64,
    dropped_full: AtomicU64,
    drained: AtomicU64,
    write_failed: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub admitted: u64,
    pub sampled_out: u64,
    pub dropped_full: u64,
    pub drained: u64,
    /// Drained records that could not be persisted.
    pub write_failed: u64,
}

/// Owner of the current and retired queue generations.
#[derive(Debug)]
pub struct QueueManager {
    current: RwLock<Arc<Generation>>,
    retired: Mutex<VecDeque<Arc<Generation>>>,
    sample_percent: AtomicU8,
    drain_per_second: AtomicUsize,
    next_generation: AtomicU64,
    stats: QueueStats,
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

impl QueueManager {
    #[must_use]
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            current: RwLock::new(Arc::new(Generation::new(0, settings.capacity))),
            retired: Mutex::new(VecDeque::new()),
            sample_percent: AtomicU8::new(settings.sample_percent.min(100)),
            drain_per_second: AtomicUsize::new(settings.drain_per_second),
            next_generation: AtomicU64::new(1),
            stats: QueueStats::default(),
        }
    }

    fn current(&self) -> Arc<Generation> {
        #[allow(clippy::expect_used)]
        let current = self.current.read().expect("lock poisoned");
        Arc::clone(&current)
    }

    /// Offers every record to the queue without ever blocking.
    ///
    /// Records carrying a security-policy id skip sampling. The rest are kept
    /// with probability `sample_percent / 100`. Whatever does not fit into the
    /// current generation is dropped and counted.
    pub fn admit(&self, records: Vec<LogRecord>) -> AdmitSummary {
        // Pin the generation for the whole batch so a concurrent swap cannot
        // split it across two buffers.
        let generation = self.current();
        let percent = self.sample_percent.load(Ordering::Relaxed);
        let mut summary = AdmitSummary::default();

        for record in records {
            if !record.has_security_policy() && !sampled_in(percent) {
                summary.sampled_out += 1;
                continue;
            }
            match generation.tx.try_send(record) {
                Ok(()) => summary.admitted += 1,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                    summary.dropped_full += 1;
                }
            }
        }

        self.stats
            .admitted
            .fetch_add(summary.admitted as u64, Ordering::Relaxed);
        self.stats
            .sampled_out
            .fetch_add(summary.sampled_out as u64, Ordering::Relaxed);
        self.stats
            .dropped_full
            .fetch_add(summary.dropped_full as u64, Ordering::Relaxed);
        if summary.dropped_full > 0 {
            debug!(
                "ACCESS_LOG_QUEUE | queue full, dropped {} records",
                summary.dropped_full
            );
        }
        summary
    }

    /// Takes up to `max` records, retired generations first.
    ///
    /// Only the drain worker calls this. Reads never wait: a batch holds
    /// whatever was ready at call time.
    pub fn drain_batch(&self, max: usize) -> Vec<LogRecord> {
        let mut batch = Vec::new();
        if max == 0 {
            return batch;
        }

        {
            #[allow(clippy::expect_used)]
            let mut retired = self.retired.lock().expect("lock poisoned");
            while batch.len() < max {
                let Some(generation) = retired.front() else {
                    break;
                };
                // A producer still holding the old generation may add to it,
                // so only forget it once nobody else references it.
                let unreferenced = Arc::strong_count(generation) == 1;
                let remaining = max - batch.len();
                let ran_dry = generation.drain_into(&mut batch, remaining);
                if !ran_dry {
                    break;
                }
                if !unreferenced {
                    break;
                }
                debug!(
                    "ACCESS_LOG_QUEUE | retired generation {} fully drained",
                    generation.id
                );
                retired.pop_front();
            }
        }

        if batch.len() < max {
            let current = self.current();
            let remaining = max - batch.len();
            current.drain_into(&mut batch, remaining);
        }

        self.stats
            .drained
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch
    }

    /// Applies new settings. Returns true when the capacity changed and a new
    /// generation replaced the current one.
    pub fn reconfigure(&self, settings: QueueSettings) -> bool {
        self.sample_percent
            .store(settings.sample_percent.min(100), Ordering::Relaxed);
        self.drain_per_second
            .store(settings.drain_per_second, Ordering::Relaxed);

        let capacity = settings.capacity.clamp(1, constants::MAX_QUEUE_CAPACITY);
        if self.current().capacity == capacity {
            return false;
        }

        let id = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let replacement = Arc::new(Generation::new(id, capacity));
        let previous = {
            #[allow(clippy::expect_used)]
            let mut current = self.current.write().expect("lock poisoned");
            std::mem::replace(&mut *current, replacement)
        };
        info!(
            "ACCESS_LOG_QUEUE | queue capacity changed {} -> {}, \
             retiring generation {} with {} pending records",
            previous.capacity,
            capacity,
            previous.id,
            previous.pending()
        );
        #[allow(clippy::expect_used)]
        self.retired
            .lock()
            .expect("lock poisoned")
            .push_back(previous);
        true
    }

    #[must_use]
    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            capacity: self.current().capacity,
            sample_percent: self.sample_percent.load(Ordering::Relaxed),
            drain_per_second: self.drain_per_second.load(Ordering::Relaxed),
        }
    }

    /// Records per drain tick, 0 = unlimited.
    #[must_use]
    pub fn drain_per_second(&self) -> usize {
        self.drain_per_second.load(Ordering::Relaxed)
    }

    /// Records waiting across every generation.
    #[must_use]
    pub fn pending(&self) -> usize {
        #[allow(clippy::expect_used)]
        let retired: usize = self
            .retired
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|generation| generation.pending())
            .sum();
        retired + self.current().pending()
    }

    #[must_use]
    pub fn retired_generations(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.retired.lock().expect("lock poisoned").len()
    }

    /// Counts drained records lost to persistence errors.
    pub fn record_write_failures(&self, count: usize) {
        self.stats
            .write_failed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stats(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            admitted: self.stats.admitted.load(Ordering::Relaxed),
            sampled_out: self.stats.sampled_out.load(Ordering::Relaxed),
            dropped_full: self.stats.dropped_full.load(Ordering::Relaxed),
            drained: self.stats.drained.load(Ordering::Relaxed),
            write_failed: self.stats.write_failed.load(Ordering::Relaxed),
        }
    }
}

fn sampled_in(percent: u8) -> bool {
    if percent == 0 {
        return false;
    }
    percent >= 100 || fastrand::u8(1..=100) <= percent
}
