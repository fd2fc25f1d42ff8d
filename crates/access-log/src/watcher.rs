// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Queue settings refresh.
//!
//! The watcher re-reads the settings blob on a timer and whenever the
//! settings service signals a change. A blob identical, byte for byte, to the
//! last applied one is ignored so an idle poll never replaces the queue.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::QueueSettings;
use crate::errors::SettingsError;
use crate::queue::QueueManager;

/// Where the queue settings blob comes from.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    /// `Ok(None)` when no settings have been stored yet.
    async fn read_queue_settings(&self) -> Result<Option<Vec<u8>>, SettingsError>;
}

/// Settings blob kept in a file, re-read on every call.
#[derive(Debug, Clone)]
pub struct FileSettingsSource {
    path: PathBuf,
}

impl FileSettingsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SettingsSource for FileSettingsSource {
    async fn read_queue_settings(&self) -> Result<Option<Vec<u8>>, SettingsError> {
        match tokio::fs::read(&self.path).await {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SettingsError::Read(format!(
                "{}: {e}",
                self.path.display()
            ))),
        }
    }
}

/// Settings blob held in memory and replaced through [`StaticSettingsSource::set`].
#[derive(Debug, Default)]
pub struct StaticSettingsSource {
    blob: Mutex<Option<Vec<u8>>>,
}

impl StaticSettingsSource {
    pub fn new(blob: Option<Vec<u8>>) -> Self {
        Self {
            blob: Mutex::new(blob),
        }
    }

    pub fn set(&self, blob: impl Into<Vec<u8>>) {
        #[allow(clippy::expect_used)]
        let mut current = self.blob.lock().expect("lock poisoned");
        *current = Some(blob.into());
    }
}

#[async_trait]
impl SettingsSource for StaticSettingsSource {
    async fn read_queue_settings(&self) -> Result<Option<Vec<u8>>, SettingsError> {
        #[allow(clippy::expect_used)]
        let blob = self.blob.lock().expect("lock poisoned");
        Ok(blob.clone())
    }
}

/// Wakes the watcher early. Notifications sent before it wakes collapse into
/// a single refresh.
#[derive(Debug, Clone)]
pub struct SettingsChangeSignal {
    tx: mpsc::Sender<()>,
}

impl SettingsChangeSignal {
    pub fn notify(&self) {
        // Full means a refresh is already pending.
        let _ = self.tx.try_send(());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// No blob stored, the queue keeps its settings.
    Missing,
    /// Same bytes as the last applied blob.
    Unchanged,
    Applied { queue_replaced: bool },
}

pub struct QueueConfigWatcher {
    source: Arc<dyn SettingsSource>,
    queue: Arc<QueueManager>,
    interval: Duration,
    changes: mpsc::Receiver<()>,
    last_blob: Option<Vec<u8>>,
}

impl QueueConfigWatcher {
    pub fn new(
        source: Arc<dyn SettingsSource>,
        queue: Arc<QueueManager>,
        interval: Duration,
    ) -> (Self, SettingsChangeSignal) {
        let (tx, changes) = mpsc::channel(1);
        let watcher = Self {
            source,
            queue,
            interval,
            changes,
            last_blob: None,
        };
        (watcher, SettingsChangeSignal { tx })
    }

    /// Reads the blob once and applies it when it changed.
    pub async fn refresh(&mut self) -> Result<RefreshOutcome, SettingsError> {
        let Some(blob) = self.source.read_queue_settings().await? else {
            return Ok(RefreshOutcome::Missing);
        };
        if self.last_blob.as_deref() == Some(blob.as_slice()) {
            return Ok(RefreshOutcome::Unchanged);
        }

        let settings = QueueSettings::from_json(&blob)?;
        let queue_replaced = self.queue.reconfigure(settings);
        self.last_blob = Some(blob);
        info!(
            "ACCESS_LOG_QUEUE | applied settings: capacity {}, sample {}%, drain {}/s",
            settings.capacity, settings.sample_percent, settings.drain_per_second
        );
        Ok(RefreshOutcome::Applied { queue_replaced })
    }

    async fn refresh_logged(&mut self) {
        match self.refresh().await {
            Ok(outcome) => debug!("ACCESS_LOG_QUEUE | settings refresh: {outcome:?}"),
            Err(e) => error!("ACCESS_LOG_QUEUE | settings refresh failed: {e}"),
        }
    }

    /// Refreshes at startup, on every tick and on every change signal until
    /// cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("ACCESS_LOG_QUEUE | settings watcher stopped");
                    break;
                }
                _ = ticker.tick() => self.refresh_logged().await,
                Some(()) = self.changes.recv() => self.refresh_logged().await,
            }
        }
    }
}
