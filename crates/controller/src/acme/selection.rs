//! Choosing a solver rule for an authorization.
//!
//! Rules with a selector are tried first, in declared order; rules without
//! one are defaults, tried afterwards in declared order. The first rule that
//! matches the identifier and whose challenge type the authorization offers
//! wins. Wildcard identifiers can only be solved with dns-01.

use std::collections::BTreeMap;

use crate::api::{ChallengeType, SolverRule, SolverSelector};

use super::client::AuthorizationDetails;

/// Challenge type a rule solves.
pub fn rule_type(rule: &SolverRule) -> Option<ChallengeType> {
    if rule.dns01.is_some() {
        Some(ChallengeType::Dns01)
    } else if rule.http01.is_some() {
        Some(ChallengeType::Http01)
    } else {
        None
    }
}

fn selector_matches(selector: &SolverSelector, identifier: &str, labels: &BTreeMap<String, String>) -> bool {
    let labels_match = selector
        .match_labels
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v));

    let names_match = selector.dns_names.is_empty()
        || selector
            .dns_names
            .iter()
            .any(|n| n.eq_ignore_ascii_case(identifier));

    let zones_match = selector.dns_zones.is_empty()
        || selector.dns_zones.iter().any(|zone| {
            let zone = zone.trim_end_matches('.').to_ascii_lowercase();
            let name = identifier.to_ascii_lowercase();
            name == zone || name.ends_with(&format!(".{zone}"))
        });

    labels_match && names_match && zones_match
}

/// Pick the rule for `authorization`, given the labels of the request the
/// order was made for. `None` when no rule can solve it.
pub fn select_solver<'a>(
    rules: &'a [SolverRule],
    authorization: &AuthorizationDetails,
    labels: &BTreeMap<String, String>,
) -> Option<(&'a SolverRule, ChallengeType)> {
    let selected = rules.iter().filter(|r| r.selector.is_some());
    let defaults = rules.iter().filter(|r| r.selector.is_none());

    selected.chain(defaults).find_map(|rule| {
        let challenge_type = rule_type(rule)?;
        if authorization.wildcard && challenge_type != ChallengeType::Dns01 {
            return None;
        }
        if let Some(selector) = &rule.selector {
            if !selector_matches(selector, &authorization.identifier, labels) {
                return None;
            }
        }
        authorization.challenge(challenge_type)?;
        Some((rule, challenge_type))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::client::{AuthorizationState, ChallengeDetails};
    use crate::api::{ChallengeState, Dns01SolverConfig, Http01SolverConfig};

    fn authz(identifier: &str, wildcard: bool, offered: &[ChallengeType]) -> AuthorizationDetails {
        AuthorizationDetails {
            url: format!("https://acme.test/authz/{identifier}"),
            identifier: identifier.to_string(),
            wildcard,
            status: AuthorizationState::Pending,
            challenges: offered
                .iter()
                .map(|t| ChallengeDetails {
                    challenge_type: *t,
                    url: format!("https://acme.test/chall/{identifier}/{t}"),
                    token: "tok".to_string(),
                    status: ChallengeState::Pending,
                    key_authorization: "tok.thumb".to_string(),
                    error: None,
                })
                .collect(),
        }
    }

    fn http01() -> SolverRule {
        SolverRule {
            http01: Some(Http01SolverConfig::default()),
            ..Default::default()
        }
    }

    fn dns01(selector: Option<SolverSelector>) -> SolverRule {
        SolverRule {
            selector,
            dns01: Some(Dns01SolverConfig {
                provider: "memory".to_string(),
            }),
            ..Default::default()
        }
    }

    const BOTH: &[ChallengeType] = &[ChallengeType::Http01, ChallengeType::Dns01];

    #[test]
    fn test_selector_rules_win_over_defaults() {
        let zone = SolverSelector {
            dns_zones: vec!["internal.example.com".to_string()],
            ..Default::default()
        };
        let rules = vec![http01(), dns01(Some(zone))];
        let labels = BTreeMap::new();

        let (rule, kind) = select_solver(&rules, &authz("api.internal.example.com", false, BOTH), &labels).unwrap();
        assert_eq!(kind, ChallengeType::Dns01);
        assert_eq!(rule, &rules[1]);

        let (_, kind) = select_solver(&rules, &authz("www.example.com", false, BOTH), &labels).unwrap();
        assert_eq!(kind, ChallengeType::Http01);
    }

    #[test]
    fn test_wildcard_requires_dns01() {
        let rules = vec![http01()];
        let labels = BTreeMap::new();
        assert!(select_solver(&rules, &authz("example.com", true, &[ChallengeType::Dns01]), &labels).is_none());

        let rules = vec![http01(), dns01(None)];
        let (_, kind) = select_solver(&rules, &authz("example.com", true, &[ChallengeType::Dns01]), &labels).unwrap();
        assert_eq!(kind, ChallengeType::Dns01);
    }

    #[test]
    fn test_unoffered_type_is_skipped() {
        let rules = vec![dns01(None), http01()];
        let (_, kind) = select_solver(
            &rules,
            &authz("example.com", false, &[ChallengeType::Http01]),
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(kind, ChallengeType::Http01);
    }

    #[test]
    fn test_match_labels() {
        let selector = SolverSelector {
            match_labels: [("team".to_string(), "edge".to_string())].into_iter().collect(),
            ..Default::default()
        };
        let rules = vec![dns01(Some(selector))];
        let mut labels = BTreeMap::new();
        assert!(select_solver(&rules, &authz("example.com", false, BOTH), &labels).is_none());

        labels.insert("team".to_string(), "edge".to_string());
        assert!(select_solver(&rules, &authz("example.com", false, BOTH), &labels).is_some());
    }

    #[test]
    fn test_selection_is_deterministic() {
        let rules = vec![dns01(None), http01()];
        let target = authz("example.com", false, BOTH);
        let first = select_solver(&rules, &target, &BTreeMap::new()).map(|(r, t)| (r.clone(), t));
        for _ in 0..10 {
            let again = select_solver(&rules, &target, &BTreeMap::new()).map(|(r, t)| (r.clone(), t));
            assert_eq!(first, again);
        }
    }
}
