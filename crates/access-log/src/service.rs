// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wiring of the access-log pipeline.
//!
//! [`AccessLogService::start`] spawns the two scheduled tasks (settings
//! watcher, drain worker). They share nothing but the queue and the
//! partition manager, and both stop on the same cancellation token.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{AgentConfig, QueueSettings};
use crate::constants;
use crate::drain::DrainWorker;
use crate::errors::SearchError;
use crate::partition::PartitionManager;
use crate::query::scope::{NodeDirectory, ServerOwnership};
use crate::query::{QueryEngine, SearchPage, SearchRequest};
use crate::queue::{AdmitSummary, QueueManager, QueueStatsSnapshot};
use crate::record::LogRecord;
use crate::registry::ShardRegistry;
use crate::storage::AccessLogRow;
use crate::watcher::{QueueConfigWatcher, SettingsChangeSignal, SettingsSource};

/// Timing knobs of the pipeline.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Queue settings used until the first settings blob is applied.
    pub initial_queue: QueueSettings,
    pub settings_poll_interval: Duration,
    pub drain_interval: Duration,
    pub drain_ceiling: usize,
    pub shard_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            initial_queue: QueueSettings::default(),
            settings_poll_interval: constants::DEFAULT_SETTINGS_POLL_INTERVAL,
            drain_interval: constants::DEFAULT_DRAIN_INTERVAL,
            drain_ceiling: constants::DEFAULT_DRAIN_CEILING,
            shard_timeout: constants::DEFAULT_SHARD_TIMEOUT,
        }
    }
}

impl From<&AgentConfig> for ServiceOptions {
    fn from(config: &AgentConfig) -> Self {
        Self {
            initial_queue: QueueSettings::default(),
            settings_poll_interval: config.settings_poll_interval,
            drain_interval: config.drain_interval,
            drain_ceiling: config.drain_ceiling,
            shard_timeout: config.shard_timeout,
        }
    }
}

/// Collaborators resolving search scopes.
pub struct ScopeResolvers {
    pub ownership: Arc<dyn ServerOwnership>,
    pub nodes: Arc<dyn NodeDirectory>,
}

pub struct AccessLogService {
    queue: Arc<QueueManager>,
    registry: Arc<ShardRegistry>,
    engine: QueryEngine,
    settings_signal: SettingsChangeSignal,
    cancel: CancellationToken,
    watcher_task: JoinHandle<()>,
    drain_task: JoinHandle<()>,
}

impl AccessLogService {
    /// Spawns the settings watcher and the drain worker on the current runtime.
    pub fn start(
        options: ServiceOptions,
        registry: Arc<ShardRegistry>,
        settings: Arc<dyn SettingsSource>,
        resolvers: ScopeResolvers,
    ) -> Self {
        let queue = Arc::new(QueueManager::new(options.initial_queue));
        let partitions = Arc::new(PartitionManager::new());
        let cancel = CancellationToken::new();

        let (watcher, settings_signal) =
            QueueConfigWatcher::new(settings, Arc::clone(&queue), options.settings_poll_interval);
        let watcher_task = tokio::spawn(watcher.run(cancel.child_token()));

        let drain = DrainWorker::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&partitions),
            options.drain_interval,
            options.drain_ceiling,
        );
        let drain_task = tokio::spawn(drain.run(cancel.child_token()));

        let engine = QueryEngine::new(
            Arc::clone(&registry),
            partitions,
            resolvers.ownership,
            resolvers.nodes,
            options.shard_timeout,
        );

        info!(
            "ACCESS_LOG | pipeline started with {} shards",
            registry.list_shards().len()
        );
        Self {
            queue,
            registry,
            engine,
            settings_signal,
            cancel,
            watcher_task,
            drain_task,
        }
    }

    /// Offers a batch reported by an edge node. Never blocks.
    pub fn enqueue(&self, records: Vec<LogRecord>) -> AdmitSummary {
        self.queue.admit(records)
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchPage, SearchError> {
        self.engine.search(request).await
    }

    pub async fn find_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<AccessLogRow>, SearchError> {
        self.engine.find_by_request_id(request_id).await
    }

    /// Asks the watcher to re-read the settings now.
    pub fn notify_settings_changed(&self) {
        self.settings_signal.notify();
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn queue_stats(&self) -> QueueStatsSnapshot {
        self.queue.stats()
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    /// Stops both tasks. The drain worker flushes what is queued first.
    pub async fn shutdown(self) {
        debug!("ACCESS_LOG | shutting down pipeline");
        self.cancel.cancel();
        if let Err(e) = self.watcher_task.await {
            error!("ACCESS_LOG | settings watcher task failed: {e}");
        }
        if let Err(e) = self.drain_task.await {
            error!("ACCESS_LOG | drain task failed: {e}");
        }
        let stats = self.queue.stats();
        info!(
            "ACCESS_LOG | pipeline stopped: admitted {}, sampled out {}, dropped {}, \
             drained {}, write failures {}",
            stats.admitted, stats.sampled_out, stats.dropped_full, stats.drained, stats.write_failed
        );
    }
}
