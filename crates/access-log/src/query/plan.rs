// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backend-neutral description of one partition scan.

/// Payload fields reachable through content extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentField {
    RemoteAddr,
    Host,
    RequestUri,
    UserAgent,
    RequestMethod,
}

impl ContentField {
    /// Key of the field inside the JSON payload.
    pub fn json_key(self) -> &'static str {
        match self {
            ContentField::RemoteAddr => "remoteAddr",
            ContentField::Host => "host",
            ContentField::RequestUri => "requestURI",
            ContentField::UserAgent => "userAgent",
            ContentField::RequestMethod => "requestMethod",
        }
    }
}

/// Fields a free-text keyword is matched against with a substring test.
pub const KEYWORD_FIELDS: [ContentField; 4] = [
    ContentField::RemoteAddr,
    ContentField::RequestUri,
    ContentField::Host,
    ContentField::UserAgent,
];

/// Alternatives of a free-text keyword search; a row matches if any holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordMatch {
    /// Substring matched against [`KEYWORD_FIELDS`] and exactly against tags.
    pub text: String,
    /// Keyword is an HTTP method and also matches `requestMethod` exactly.
    pub method: bool,
    /// Inclusive status range from a `NNN` or `NNN-NNN` keyword.
    pub status: Option<(u16, u16)>,
    /// Keyword looks like a request id.
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    NodeIn(Vec<i64>),
    ServerIn(Vec<i64>),
    StatusAtLeast(u16),
    FirewallPolicy(i64),
    FirewallRuleGroup(i64),
    FirewallRuleSet(i64),
    AnyFirewallPolicy,
    /// Indexed `remoteAddr` column equality.
    RemoteAddr(String),
    /// Indexed `remoteAddr` column, compared as 32-bit integers (inclusive).
    RemoteAddrBetween(u32, u32),
    /// Indexed `domain` column equality.
    Domain(String),
    /// `domain LIKE pattern`, `%` being the only wildcard.
    DomainLike(String),
    ContentEquals(ContentField, String),
    ContentLike(ContentField, String),
    /// Payload `remoteAddr` compared as 32-bit integers (inclusive).
    ContentAddrBetween(u32, u32),
    Keyword(KeywordMatch),
    RequestId(String),
    /// `requestId < cursor`
    RequestIdBefore(String),
    /// `requestId > cursor`
    RequestIdAfter(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Conjunction of predicates, ordered by request id and bounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub predicates: Vec<Predicate>,
    pub order: SortOrder,
    pub limit: usize,
}

impl QueryPlan {
    pub fn new(order: SortOrder, limit: usize) -> Self {
        Self {
            predicates: Vec::new(),
            order,
            limit,
        }
    }

    pub fn push(&mut self, predicate: Predicate) -> &mut Self {
        self.predicates.push(predicate);
        self
    }

    /// Plan locating a single request id.
    pub fn request_id(request_id: &str) -> Self {
        let mut plan = Self::new(SortOrder::Descending, 1);
        plan.push(Predicate::RequestId(request_id.to_string()));
        plan
    }
}
