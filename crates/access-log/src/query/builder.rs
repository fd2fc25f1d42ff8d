// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Composes the [`QueryPlan`] for one partition.
//!
//! The same filters produce different plans depending on the partition's
//! optional columns: indexed `remoteAddr` / `domain` predicates when the
//! columns exist, payload extraction otherwise.

use crate::query::filter::{AddressFilter, Direction, HostFilter, SearchFilters};
use crate::query::plan::{ContentField, KeywordMatch, Predicate, QueryPlan, SortOrder};
use crate::query::scope::Scope;
use crate::storage::PartitionInfo;

fn address_predicate(address: &AddressFilter, indexed: bool) -> Predicate {
    match (address, indexed) {
        (AddressFilter::Exact(ip), true) => Predicate::RemoteAddr(ip.clone()),
        (AddressFilter::Range(from, to), true) => Predicate::RemoteAddrBetween(*from, *to),
        (AddressFilter::Exact(ip), false) => {
            Predicate::ContentEquals(ContentField::RemoteAddr, ip.clone())
        }
        (AddressFilter::Range(from, to), false) => Predicate::ContentAddrBetween(*from, *to),
    }
}

fn host_predicate(host: &HostFilter, indexed: bool) -> Predicate {
    match (host, indexed) {
        (HostFilter::Exact(domain), true) => Predicate::Domain(domain.clone()),
        (HostFilter::Pattern(pattern), true) => Predicate::DomainLike(pattern.clone()),
        (HostFilter::Exact(domain), false) => {
            Predicate::ContentEquals(ContentField::Host, domain.clone())
        }
        (HostFilter::Pattern(pattern), false) => {
            Predicate::ContentLike(ContentField::Host, pattern.clone())
        }
    }
}

pub fn build_plan(
    filters: &SearchFilters,
    scope: &Scope,
    partition: &PartitionInfo,
    cursor: &str,
    direction: Direction,
    limit: usize,
) -> QueryPlan {
    let order = match direction {
        Direction::Forward => SortOrder::Descending,
        Direction::Backward => SortOrder::Ascending,
    };
    let mut plan = QueryPlan::new(order, limit);

    if let Some(node_ids) = &scope.node_ids {
        plan.push(Predicate::NodeIn(node_ids.clone()));
    }
    if let Some(server_ids) = &scope.server_ids {
        plan.push(Predicate::ServerIn(server_ids.clone()));
    }
    if filters.has_error {
        plan.push(Predicate::StatusAtLeast(400));
    }
    if filters.firewall_policy_id > 0 {
        plan.push(Predicate::FirewallPolicy(filters.firewall_policy_id));
    }
    if filters.firewall_rule_group_id > 0 {
        plan.push(Predicate::FirewallRuleGroup(filters.firewall_rule_group_id));
    }
    if filters.firewall_rule_set_id > 0 {
        plan.push(Predicate::FirewallRuleSet(filters.firewall_rule_set_id));
    }
    if filters.has_firewall_policy {
        plan.push(Predicate::AnyFirewallPolicy);
    }
    if let Some(address) = &filters.address {
        plan.push(address_predicate(address, partition.has_remote_addr));
    }
    if let Some(host) = &filters.host {
        plan.push(host_predicate(host, partition.has_domain));
    }
    if let Some(keyword) = &filters.keyword {
        match (&keyword.address, partition.has_remote_addr) {
            (Some(address), true) => {
                plan.push(address_predicate(address, true));
            }
            _ => {
                plan.push(Predicate::Keyword(KeywordMatch {
                    text: keyword.text.clone(),
                    method: keyword.method,
                    status: keyword.status,
                    request_id: keyword.request_id.clone(),
                }));
            }
        }
    }

    if !cursor.is_empty() {
        plan.push(match direction {
            Direction::Forward => Predicate::RequestIdBefore(cursor.to_string()),
            Direction::Backward => Predicate::RequestIdAfter(cursor.to_string()),
        });
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::filter::SearchRequest;
    use crate::record::Day;

    fn partition(indexed: bool) -> PartitionInfo {
        PartitionInfo::new(Day::parse("20240115").unwrap(), indexed, indexed)
    }

    fn filters(request: SearchRequest) -> SearchFilters {
        SearchFilters::parse(&SearchRequest {
            day: "20240115".to_string(),
            ..request
        })
        .unwrap()
    }

    fn predicates(filters: &SearchFilters, indexed: bool) -> Vec<Predicate> {
        build_plan(filters, &Scope::default(), &partition(indexed), "", Direction::Forward, 10)
            .predicates
    }

    #[test]
    fn test_minimal_plan() {
        let plan = build_plan(
            &filters(SearchRequest::default()),
            &Scope::default(),
            &partition(true),
            "",
            Direction::Forward,
            50,
        );
        assert_eq!(plan, QueryPlan::new(SortOrder::Descending, 50));
    }

    #[test]
    fn test_cursor_direction() {
        let filters = filters(SearchRequest::default());
        let plan = build_plan(
            &filters,
            &Scope::default(),
            &partition(true),
            "0005",
            Direction::Backward,
            10,
        );
        assert_eq!(plan.order, SortOrder::Ascending);
        assert_eq!(
            plan.predicates,
            vec![Predicate::RequestIdAfter("0005".to_string())]
        );
    }

    #[test]
    fn test_structured_filters_and_scope() {
        let filters = filters(SearchRequest {
            has_error: true,
            firewall_policy_id: 3,
            firewall_rule_group_id: 4,
            firewall_rule_set_id: 5,
            has_firewall_policy: true,
            ..Default::default()
        });
        let scope = Scope {
            node_ids: Some(vec![1, 2]),
            server_ids: Some(vec![9]),
        };
        let plan = build_plan(&filters, &scope, &partition(true), "", Direction::Forward, 10);
        assert_eq!(
            plan.predicates,
            vec![
                Predicate::NodeIn(vec![1, 2]),
                Predicate::ServerIn(vec![9]),
                Predicate::StatusAtLeast(400),
                Predicate::FirewallPolicy(3),
                Predicate::FirewallRuleGroup(4),
                Predicate::FirewallRuleSet(5),
                Predicate::AnyFirewallPolicy,
            ]
        );
    }

    #[test]
    fn test_address_and_host_follow_partition_columns() {
        let filters = filters(SearchRequest {
            ip: "10.0.0.1-10.0.0.3".to_string(),
            domain: "*.example.com".to_string(),
            ..Default::default()
        });

        assert_eq!(
            predicates(&filters, true),
            vec![
                Predicate::RemoteAddrBetween(0x0A00_0001, 0x0A00_0003),
                Predicate::DomainLike("%.example.com".to_string()),
            ]
        );

        assert_eq!(
            predicates(&filters, false),
            vec![
                Predicate::ContentAddrBetween(0x0A00_0001, 0x0A00_0003),
                Predicate::ContentLike(ContentField::Host, "%.example.com".to_string()),
            ]
        );
    }

    #[test]
    fn test_ip_keyword_uses_index_only_when_available() {
        let filters = filters(SearchRequest {
            keyword: "10.0.0.7".to_string(),
            ..Default::default()
        });

        assert_eq!(
            predicates(&filters, true),
            vec![Predicate::RemoteAddr("10.0.0.7".to_string())]
        );
        assert!(matches!(
            &predicates(&filters, false)[..],
            [Predicate::Keyword(KeywordMatch { text, .. })] if text == "10.0.0.7"
        ));
    }

    #[test]
    fn test_ip_keyword_range() {
        let filters = filters(SearchRequest {
            keyword: "ip:10.0.0.9,10.0.0.1".to_string(),
            ..Default::default()
        });
        assert_eq!(
            predicates(&filters, true),
            vec![Predicate::RemoteAddrBetween(0x0A00_0001, 0x0A00_0009)]
        );
        assert!(matches!(
            &predicates(&filters, false)[..],
            [Predicate::Keyword(KeywordMatch { text, .. })] if text == "10.0.0.9,10.0.0.1"
        ));
    }

    #[test]
    fn test_malformed_ip_keyword_range_falls_back_to_text() {
        let filters = filters(SearchRequest {
            keyword: "ip:10.0.0.1,bogus".to_string(),
            ..Default::default()
        });
        for indexed in [true, false] {
            assert!(matches!(
                &predicates(&filters, indexed)[..],
                [Predicate::Keyword(KeywordMatch { text, .. })] if text == "10.0.0.1,bogus"
            ));
        }
    }
}
