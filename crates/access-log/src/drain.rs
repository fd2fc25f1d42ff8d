// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic transfer of queued records into shard storage.
//!
//! The worker is the only consumer of the queue. Delivery past the queue is
//! at most once: a record whose write fails is logged, counted and dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::partition::PartitionManager;
use crate::queue::QueueManager;
use crate::registry::ShardRegistry;

/// Counters of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub drained: usize,
    pub written: usize,
    pub failed: usize,
}

pub struct DrainWorker {
    queue: Arc<QueueManager>,
    registry: Arc<ShardRegistry>,
    partitions: Arc<PartitionManager>,
    interval: Duration,
    ceiling: usize,
}

impl DrainWorker {
    pub fn new(
        queue: Arc<QueueManager>,
        registry: Arc<ShardRegistry>,
        partitions: Arc<PartitionManager>,
        interval: Duration,
        ceiling: usize,
    ) -> Self {
        Self {
            queue,
            registry,
            partitions,
            interval,
            ceiling,
        }
    }

    /// Records taken per pass: the configured rate, or the ceiling when the
    /// rate is unlimited.
    fn batch_limit(&self) -> usize {
        match self.queue.drain_per_second() {
            0 => self.ceiling,
            rate => rate.min(self.ceiling),
        }
    }

    /// Drains one batch and writes every record to its shard.
    pub async fn drain_once(&self) -> DrainReport {
        let batch = self.queue.drain_batch(self.batch_limit());
        let mut report = DrainReport {
            drained: batch.len(),
            ..Default::default()
        };

        for record in batch {
            let shard = self.registry.shard_for_write(record.node_id);
            let request_id = record.request_id.clone();
            match self.partitions.insert(&shard, record).await {
                Ok(()) => report.written += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(
                        "ACCESS_LOG_DRAIN | failed to write {request_id} to shard {}: {e}",
                        shard.id
                    );
                }
            }
        }

        if report.failed > 0 {
            self.queue.record_write_failures(report.failed);
        }
        report
    }

    /// Drains on every tick until cancelled, then runs one last pass.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let report = self.drain_once().await;
                    info!(
                        "ACCESS_LOG_DRAIN | stopping, final pass wrote {} of {} records",
                        report.written, report.drained
                    );
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.drain_once().await;
                    if report.drained > 0 {
                        debug!(
                            "ACCESS_LOG_DRAIN | drained {}, written {}, failed {}",
                            report.drained, report.written, report.failed
                        );
                    }
                }
            }
        }
    }
}
