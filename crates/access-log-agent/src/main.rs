// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use access_log::{
    config::AgentConfig,
    intake::LogIntake,
    logger,
    query::scope::{StaticNodeDirectory, StaticOwnership},
    registry::{Shard, ShardRegistry, FALLBACK_SHARD_ID},
    service::{AccessLogService, ScopeResolvers, ServiceOptions},
    storage::open_shard_store,
    watcher::{FileSettingsSource, SettingsSource, StaticSettingsSource},
};

#[tokio::main]
pub async fn main() {
    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("access-log-agent: {e}");
            return;
        }
    };

    if let Err(e) = logger::init(&config.log_level) {
        eprintln!("access-log-agent: {e}");
        return;
    }
    debug!("Logging subsystem enabled");

    let storage_dir = config.storage_dir.as_deref();
    if let Some(dir) = storage_dir {
        info!("storing shards under {}", dir.display());
    }
    let fallback = match open_shard_store(storage_dir, FALLBACK_SHARD_ID) {
        Ok(store) => store,
        Err(e) => {
            error!("couldn't open fallback shard: {e}");
            return;
        }
    };
    let registry = Arc::new(ShardRegistry::new(fallback));
    if config.shard_count > 0 {
        let mut shards = Vec::with_capacity(config.shard_count);
        for id in 1..=config.shard_count as i64 {
            match open_shard_store(storage_dir, id) {
                Ok(store) => shards.push(Shard::new(id, store)),
                Err(e) => {
                    error!("couldn't open shard {id}: {e}");
                    return;
                }
            }
        }
        registry.replace(shards);
    }

    let settings: Arc<dyn SettingsSource> = match &config.settings_path {
        Some(path) => {
            info!("reading queue settings from {}", path.display());
            Arc::new(FileSettingsSource::new(path.clone()))
        }
        None => Arc::new(StaticSettingsSource::default()),
    };

    let service = AccessLogService::start(
        ServiceOptions::from(&config),
        registry,
        settings,
        ScopeResolvers {
            ownership: Arc::new(StaticOwnership::default()),
            nodes: Arc::new(StaticNodeDirectory::default()),
        },
    );

    let cancel_token = CancellationToken::new();
    let intake = match LogIntake::bind(
        &config.intake_host,
        config.intake_port,
        Arc::clone(service.queue()),
        cancel_token.clone(),
    )
    .await
    {
        Ok(intake) => intake,
        Err(e) => {
            error!(
                "couldn't bind intake to {}:{}: {e}",
                config.intake_host, config.intake_port
            );
            service.shutdown().await;
            return;
        }
    };
    info!(
        "access-log intake listening on {}:{}",
        config.intake_host, config.intake_port
    );
    let intake_task = tokio::spawn(intake.spin());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }
    info!("shutting down access-log agent");

    cancel_token.cancel();
    if let Err(e) = intake_task.await {
        error!("intake task failed: {e}");
    }
    service.shutdown().await;
}
