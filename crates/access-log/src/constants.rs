// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Queue capacity applied when the settings blob carries `maxLength <= 0`.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100_000;

/// Largest capacity a queue generation may be given. Bigger `maxLength`
/// values are clamped to it.
pub const MAX_QUEUE_CAPACITY: usize = 10_000_000;

/// Capacity of the very first queue generation, before settings are read.
pub const INITIAL_QUEUE_CAPACITY: usize = 10_000;

/// Drain rate used until settings are read.
pub const INITIAL_DRAIN_PER_SECOND: usize = 10_000;

/// Upper bound of records drained in one tick when `countPerSecond` is 0.
pub const DEFAULT_DRAIN_CEILING: usize = 1_000_000;

pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_SETTINGS_POLL_INTERVAL: Duration = Duration::from_secs(60);

pub const DEFAULT_SHARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Hard cap on the rows a single search page may return.
pub const MAX_PAGE_SIZE: usize = 1_000;

/// Prefix of every day partition table.
pub const PARTITION_TABLE_PREFIX: &str = "edgeHTTPAccessLogs_";

/// Minimum count of leading digits a request id needs to locate its day.
pub const MIN_REQUEST_ID_DIGITS: usize = 11;

/// Keywords with at least this many digits are also tried as request ids.
pub const KEYWORD_REQUEST_ID_DIGITS: usize = 20;

pub const DEFAULT_INTAKE_HOST: &str = "0.0.0.0";

pub const DEFAULT_INTAKE_PORT: u16 = 8140;

/// Largest datagram the intake reads in one receive.
pub const INTAKE_BUFFER_SIZE: usize = 65_507;
