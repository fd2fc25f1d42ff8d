// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log record model, day buckets and request-id helpers.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::MIN_REQUEST_ID_DIGITS;
use crate::errors::ValidationError;

/// One client request event reported by an edge node.
///
/// Only the fields the subsystem filters on are typed; everything else the
/// node reports is carried in `extra` and survives the round trip through the
/// serialized payload column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Time-prefixed, lexically sortable and process-wide unique id.
    pub request_id: String,
    #[serde(default)]
    pub node_id: i64,
    #[serde(default)]
    pub server_id: i64,
    #[serde(default)]
    pub status: u16,
    /// Event time in epoch seconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub host: String,
    #[serde(default, rename = "requestURI")]
    pub request_uri: String,
    #[serde(default)]
    pub request_method: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub firewall_policy_id: i64,
    #[serde(default)]
    pub firewall_rule_group_id: i64,
    #[serde(default)]
    pub firewall_rule_set_id: i64,
    #[serde(default)]
    pub firewall_rule_id: i64,
    /// Stored in its own column, never inside the payload.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_body: Vec<u8>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LogRecord {
    /// Records tagged by a security policy bypass sampling.
    pub fn has_security_policy(&self) -> bool {
        self.firewall_policy_id > 0
    }

    pub fn day(&self) -> Day {
        Day::from_timestamp(self.timestamp)
    }
}

/// A calendar day bucket in `YYYYMMDD` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Day(String);

impl Day {
    pub fn parse(day: &str) -> Result<Self, ValidationError> {
        if day.len() != 8 || !day.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::InvalidDay(day.to_string()));
        }
        Ok(Self(day.to_string()))
    }

    /// Day (UTC) containing the given epoch second.
    pub fn from_timestamp(seconds: i64) -> Self {
        let time = DateTime::<Utc>::from_timestamp(seconds, 0).unwrap_or_default();
        Self(time.format("%Y%m%d").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the day buckets a request id may live in.
///
/// Ids start with their creation time. Edge nodes emit either an epoch-second
/// prefix (`1705312800...`) or a calendar prefix (`20240115...`); both
/// readings are returned when they are plausible, epoch first.
pub fn request_id_days(request_id: &str) -> Result<Vec<Day>, ValidationError> {
    let leading_digits = request_id.bytes().take_while(u8::is_ascii_digit).count();
    if leading_digits < MIN_REQUEST_ID_DIGITS {
        return Err(ValidationError::InvalidRequestId(request_id.to_string()));
    }

    let mut days = Vec::with_capacity(2);
    if let Ok(seconds) = request_id[..10].parse::<i64>() {
        days.push(Day::from_timestamp(seconds));
    }
    if let Ok(date) = NaiveDate::parse_from_str(&request_id[..8], "%Y%m%d") {
        if (2000..2100).contains(&date.year()) {
            let day = Day(request_id[..8].to_string());
            if !days.contains(&day) {
                days.push(day);
            }
        }
    }
    Ok(days)
}
