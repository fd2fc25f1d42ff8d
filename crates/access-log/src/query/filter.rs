// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Search requests and their validation.
//!
//! Everything a caller can get wrong is checked here, before the engine
//! touches a shard. The parsed [`SearchFilters`] are then turned into one
//! [`crate::query::plan::QueryPlan`] per partition by the builder.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;

use crate::constants::KEYWORD_REQUEST_ID_DIGITS;
use crate::errors::ValidationError;
use crate::record::Day;

#[allow(clippy::expect_used)]
mod patterns {
    use super::*;

    lazy_static! {
        pub(super) static ref STATUS_KEYWORD: Regex =
            Regex::new(r"^\d{3}$").expect("failed creating regex");
        pub(super) static ref STATUS_RANGE_KEYWORD: Regex =
            Regex::new(r"^(\d{3})-(\d{3})$").expect("failed creating regex");
        pub(super) static ref REQUEST_ID_KEYWORD: Regex =
            Regex::new(&format!(r"^\d{{{KEYWORD_REQUEST_ID_DIGITS},}}\s*\.?$"))
                .expect("failed creating regex");
        pub(super) static ref HOST_PATTERN_FORBIDDEN: Regex =
            Regex::new(r"[^a-zA-Z0-9\-.%]").expect("failed creating regex");
    }
}

use patterns::{HOST_PATTERN_FORBIDDEN, REQUEST_ID_KEYWORD, STATUS_KEYWORD, STATUS_RANGE_KEYWORD};

const HTTP_METHODS: [&str; 9] = [
    "GET", "POST", "HEAD", "CONNECT", "PUT", "TRACE", "OPTIONS", "DELETE", "PATCH",
];

/// Paging direction relative to the cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    /// Older records: `requestId < cursor`, newest first.
    #[default]
    Forward,
    /// Newer records: `requestId > cursor`.
    Backward,
}

/// A paginated search over one day of access logs.
///
/// Zero ids and empty strings mean "no filter".
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    /// `YYYYMMDD`
    pub day: String,
    /// Exclusive request-id bound, empty for the first page.
    pub cursor: String,
    pub page_size: usize,
    pub direction: Direction,
    pub cluster_id: i64,
    pub node_id: i64,
    pub server_id: i64,
    /// Account scope, resolved to the servers the user owns.
    pub user_id: i64,
    /// Only responses with status >= 400.
    pub has_error: bool,
    pub firewall_policy_id: i64,
    pub firewall_rule_group_id: i64,
    pub firewall_rule_set_id: i64,
    pub has_firewall_policy: bool,
    pub keyword: String,
    /// Exact address, or `from,to` / `from-to` IPv4 range.
    pub ip: String,
    /// Exact host, or a `*` glob.
    pub domain: String,
    /// Per-shard deadline, defaults to the engine's.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressFilter {
    Exact(String),
    /// Inclusive 32-bit bounds.
    Range(u32, u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostFilter {
    Exact(String),
    /// `LIKE` pattern, `*` already turned into `%`.
    Pattern(String),
}

/// Free-text keyword, classified once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordFilter {
    /// Keyword with any `ip:` prefix removed.
    pub text: String,
    /// Address selector used on partitions with an indexed address column:
    /// set when the keyword is a bare IP or carries the `ip:` prefix. An
    /// `ip:` range with a malformed bound leaves it unset, so the stripped
    /// text is matched as a plain keyword instead.
    pub address: Option<AddressFilter>,
    pub method: bool,
    pub status: Option<(u16, u16)>,
    pub request_id: Option<String>,
}

/// Validated filters of a [`SearchRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilters {
    pub day: Day,
    pub has_error: bool,
    pub firewall_policy_id: i64,
    pub firewall_rule_group_id: i64,
    pub firewall_rule_set_id: i64,
    pub has_firewall_policy: bool,
    pub address: Option<AddressFilter>,
    pub host: Option<HostFilter>,
    pub keyword: Option<KeywordFilter>,
}

impl SearchFilters {
    pub fn parse(request: &SearchRequest) -> Result<Self, ValidationError> {
        let day = Day::parse(&request.day)?;
        let address = match request.ip.trim() {
            "" => None,
            ip => Some(parse_address_filter(ip)?),
        };
        let host = match request.domain.trim() {
            "" => None,
            domain => Some(parse_host_filter(domain)),
        };
        let keyword = match request.keyword.trim() {
            "" => None,
            keyword => Some(parse_keyword(keyword)),
        };

        Ok(Self {
            day,
            has_error: request.has_error,
            firewall_policy_id: request.firewall_policy_id,
            firewall_rule_group_id: request.firewall_rule_group_id,
            firewall_rule_set_id: request.firewall_rule_set_id,
            has_firewall_policy: request.has_firewall_policy,
            address,
            host,
            keyword,
        })
    }
}

pub fn ipv4_to_u32(addr: &str) -> Option<u32> {
    addr.trim().parse::<Ipv4Addr>().ok().map(u32::from)
}

fn parse_range(from: &str, to: &str, original: &str) -> Result<AddressFilter, ValidationError> {
    let invalid = || ValidationError::InvalidAddress(original.to_string());
    let from = ipv4_to_u32(from).ok_or_else(invalid)?;
    let to = ipv4_to_u32(to).ok_or_else(invalid)?;
    Ok(AddressFilter::Range(from.min(to), from.max(to)))
}

/// Parses `a`, `a,b` or `a-b`.
pub fn parse_address_filter(ip: &str) -> Result<AddressFilter, ValidationError> {
    match ip.split_once([',', '-']) {
        Some((from, to)) => parse_range(from, to, ip),
        None => Ok(AddressFilter::Exact(ip.to_string())),
    }
}

/// Exact hosts pass through; globs are reduced to `[a-zA-Z0-9-.%]`.
pub fn parse_host_filter(domain: &str) -> HostFilter {
    if domain.contains('*') {
        let pattern = domain.replace('*', "%");
        HostFilter::Pattern(HOST_PATTERN_FORBIDDEN.replace_all(&pattern, "").into_owned())
    } else {
        HostFilter::Exact(domain.to_string())
    }
}

/// Classifies a free-text keyword. Never fails: keywords that look like
/// something structured but are not still match as text.
pub fn parse_keyword(keyword: &str) -> KeywordFilter {
    let (text, address) = if keyword.parse::<IpAddr>().is_ok() {
        (keyword, Some(AddressFilter::Exact(keyword.to_string())))
    } else if let Some(rest) = keyword.strip_prefix("ip:").filter(|rest| !rest.is_empty()) {
        let address = match rest.split_once(',') {
            Some((from, to)) if !to.is_empty() => parse_range(from, to, keyword).ok(),
            Some((from, _)) => Some(AddressFilter::Exact(from.to_string())),
            None => Some(AddressFilter::Exact(rest.to_string())),
        };
        (rest, address)
    } else {
        (keyword, None)
    };

    let status = if STATUS_KEYWORD.is_match(text) {
        text.parse::<u16>().ok().map(|status| (status, status))
    } else {
        STATUS_RANGE_KEYWORD.captures(text).and_then(|caps| {
            let from = caps.get(1)?.as_str().parse::<u16>().ok()?;
            let to = caps.get(2)?.as_str().parse::<u16>().ok()?;
            Some((from, to))
        })
    };

    let request_id = REQUEST_ID_KEYWORD
        .is_match(text)
        .then(|| text.trim_end_matches(['.', ' ']).to_string());

    KeywordFilter {
        text: text.to_string(),
        address,
        method: HTTP_METHODS.contains(&text),
        status,
        request_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_bad_day() {
        let request = SearchRequest {
            day: "2024011".to_string(),
            ..Default::default()
        };
        assert_eq!(
            SearchFilters::parse(&request),
            Err(ValidationError::InvalidDay("2024011".to_string()))
        );
    }

    #[test]
    fn test_address_filter_forms() {
        assert_eq!(
            parse_address_filter("10.0.0.1"),
            Ok(AddressFilter::Exact("10.0.0.1".to_string()))
        );
        assert_eq!(
            parse_address_filter("10.0.0.1,10.0.0.9"),
            Ok(AddressFilter::Range(0x0A00_0001, 0x0A00_0009))
        );
        assert_eq!(
            parse_address_filter("10.0.0.9-10.0.0.1"),
            Ok(AddressFilter::Range(0x0A00_0001, 0x0A00_0009))
        );
        assert!(parse_address_filter("10.0.0.1-nope").is_err());
    }

    #[test]
    fn test_host_filter_sanitizes_globs() {
        assert_eq!(
            parse_host_filter("www.example.com"),
            HostFilter::Exact("www.example.com".to_string())
        );
        assert_eq!(
            parse_host_filter("*.example.com"),
            HostFilter::Pattern("%.example.com".to_string())
        );
        assert_eq!(
            parse_host_filter("*.ex'ample;--.com"),
            HostFilter::Pattern("%.example--.com".to_string())
        );
    }

    #[test]
    fn test_keyword_plain_text() {
        let keyword = parse_keyword("/login");
        assert_eq!(keyword.text, "/login");
        assert_eq!(keyword.address, None);
        assert!(!keyword.method);
        assert_eq!(keyword.status, None);
        assert_eq!(keyword.request_id, None);
    }

    #[test]
    fn test_keyword_classification() {
        assert!(parse_keyword("DELETE").method);
        assert!(!parse_keyword("delete").method);
        assert_eq!(parse_keyword("404").status, Some((404, 404)));
        assert_eq!(parse_keyword("500-504").status, Some((500, 504)));
        assert_eq!(parse_keyword("4040").status, None);
        assert_eq!(
            parse_keyword("17053128000000000001 .").request_id,
            Some("17053128000000000001".to_string())
        );
        assert_eq!(parse_keyword("1705312800000").request_id, None);
    }

    #[test]
    fn test_keyword_addresses() {
        let keyword = parse_keyword("192.168.0.1");
        assert_eq!(
            keyword.address,
            Some(AddressFilter::Exact("192.168.0.1".to_string()))
        );

        let keyword = parse_keyword("ip:192.168.0.1,192.168.0.20");
        assert_eq!(keyword.text, "192.168.0.1,192.168.0.20");
        assert_eq!(
            keyword.address,
            Some(AddressFilter::Range(0xC0A8_0001, 0xC0A8_0014))
        );

        let keyword = parse_keyword("ip:10.1.1.1,");
        assert_eq!(
            keyword.address,
            Some(AddressFilter::Exact("10.1.1.1".to_string()))
        );

        let keyword = parse_keyword("ip:1.1.1.1,bogus");
        assert_eq!(keyword.text, "1.1.1.1,bogus");
        assert_eq!(keyword.address, None);
    }

    #[test]
    fn test_malformed_ip_keyword_does_not_reject_search() {
        let request = SearchRequest {
            day: "20240115".to_string(),
            keyword: "ip:10.0.0.1,10.0.0".to_string(),
            ..Default::default()
        };
        let filters = SearchFilters::parse(&request).unwrap();
        let keyword = filters.keyword.unwrap();
        assert_eq!(keyword.text, "10.0.0.1,10.0.0");
        assert_eq!(keyword.address, None);
    }
}
