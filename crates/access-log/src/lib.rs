// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Access-log subsystem of the edge control plane.
//!
//! Edge nodes push per-request log records into a bounded, sampled
//! [`queue::QueueManager`]. A [`drain::DrainWorker`] moves them, at a configured
//! rate, into day-partitioned tables spread over independent storage shards
//! ([`registry::ShardRegistry`], [`partition::PartitionManager`]). The
//! [`query::QueryEngine`] fans searches out over every shard and merges the
//! pages by request id.
//!
//! ```text
//!  edge nodes ──► intake ──► QueueManager ──► DrainWorker ──► PartitionManager ──► shard/day table
//!                               ▲                                                       │
//!        settings ──► QueueConfigWatcher                     QueryEngine ◄── fan-out ───┘
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod constants;
pub mod drain;
pub mod errors;
pub mod intake;
pub mod logger;
pub mod partition;
pub mod query;
pub mod queue;
pub mod record;
pub mod registry;
pub mod service;
pub mod storage;
pub mod watcher;
