//! Offline scenario validation, collecting all errors.

use std::collections::{HashMap, HashSet};

use petgraph::algo::has_path_connecting;
use petgraph::graph::{NodeIndex, UnGraph};
use thiserror::Error;

use super::{ScenarioSpec, Step};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("duplicate entity name `{0}`")]
    DuplicateName(String),

    #[error("duplicate entity id byte {0}")]
    DuplicateId(u8),

    #[error("entity `{name}`: threshold {threshold} exceeds total shares {total}")]
    ThresholdUnreachable {
        name: String,
        threshold: u64,
        total: u64,
    },

    #[error("entity `{0}` has no validators")]
    NoValidators(String),

    #[error("step {index}: unknown entity `{name}`")]
    UnknownEntity { index: usize, name: String },

    #[error("step {index}: unknown token {token}")]
    UnknownToken { index: usize, token: u64 },

    #[error("step {index}: no account path between `{from}` and `{to}`")]
    Unroutable {
        index: usize,
        from: String,
        to: String,
    },

    #[error("step {index}: bad amount: {reason}")]
    BadAmount { index: usize, reason: String },
}

/// Validate a scenario, collecting every error rather than stopping at the
/// first.
pub fn check(spec: &ScenarioSpec) -> Result<(), Vec<ScenarioError>> {
    let mut errors = Vec::new();

    let mut names = HashSet::new();
    let mut ids = HashSet::new();
    for e in &spec.entities {
        if !names.insert(e.name.clone()) {
            errors.push(ScenarioError::DuplicateName(e.name.clone()));
        }
        if !ids.insert(e.id_byte) {
            errors.push(ScenarioError::DuplicateId(e.id_byte));
        }
        if e.validators.is_empty() {
            errors.push(ScenarioError::NoValidators(e.name.clone()));
        }
        let total: u64 = e
            .validators
            .iter()
            .map(|v| e.shares.get(v).copied().unwrap_or(1))
            .sum();
        if e.threshold > total {
            errors.push(ScenarioError::ThresholdUnreachable {
                name: e.name.clone(),
                threshold: e.threshold,
                total,
            });
        }
    }

    let tokens: HashSet<u64> = spec.tokens.iter().map(|t| t.id).collect();

    // Account topology builds up as open_account steps execute; payments must
    // stay within the connected component at their point in the script.
    let mut graph: UnGraph<(), ()> = UnGraph::new_undirected();
    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
    for e in &spec.entities {
        nodes.insert(e.name.clone(), graph.add_node(()));
    }

    let known = |n: &str| names.contains(n);

    for (index, step) in spec.steps.iter().enumerate() {
        let mut require_entity = |n: &str, errors: &mut Vec<ScenarioError>| {
            if !known(n) {
                errors.push(ScenarioError::UnknownEntity {
                    index,
                    name: n.to_string(),
                });
                false
            } else {
                true
            }
        };
        let mut require_token = |t: u64, errors: &mut Vec<ScenarioError>| {
            if !tokens.contains(&t) {
                errors.push(ScenarioError::UnknownToken { index, token: t });
            }
        };
        let mut require_amount = |a: &str, errors: &mut Vec<ScenarioError>| {
            if let Err(e) = super::parse_amount(a) {
                errors.push(ScenarioError::BadAmount {
                    index,
                    reason: e.to_string(),
                });
            }
        };

        match step {
            Step::Fund { entity, token, amount } => {
                require_entity(entity, &mut errors);
                require_token(*token, &mut errors);
                require_amount(amount, &mut errors);
            }
            Step::OpenAccount { from, to } => {
                let ok = require_entity(from, &mut errors) & require_entity(to, &mut errors);
                if ok {
                    graph.add_edge(nodes[from], nodes[to], ());
                }
            }
            Step::ExtendCredit { from, to, token, amount }
            | Step::DepositCollateral { from, to, token, amount } => {
                require_entity(from, &mut errors);
                require_entity(to, &mut errors);
                require_token(*token, &mut errors);
                require_amount(amount, &mut errors);
            }
            Step::Pay { from, to, token, amount, route } => {
                let mut ok = require_entity(from, &mut errors) & require_entity(to, &mut errors);
                for hop in route {
                    ok &= require_entity(hop, &mut errors);
                }
                require_token(*token, &mut errors);
                require_amount(amount, &mut errors);
                if ok && !has_path_connecting(&graph, nodes[from], nodes[to], None) {
                    errors.push(ScenarioError::Unroutable {
                        index,
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
            }
            Step::SetRebalancePolicy {
                entity,
                token,
                soft_limit,
                hard_limit,
                max_acceptable_fee,
            } => {
                require_entity(entity, &mut errors);
                require_token(*token, &mut errors);
                require_amount(soft_limit, &mut errors);
                require_amount(hard_limit, &mut errors);
                require_amount(max_acceptable_fee, &mut errors);
            }
            Step::SetHubConfig { entity, base_fee, .. } => {
                require_entity(entity, &mut errors);
                require_amount(base_fee, &mut errors);
            }
            Step::InitOrderbook { entity, pairs } => {
                require_entity(entity, &mut errors);
                for (a, b) in pairs {
                    require_token(*a, &mut errors);
                    require_token(*b, &mut errors);
                }
            }
            Step::PlaceOffer {
                entity,
                hub,
                give_token,
                give_amount,
                want_token,
                want_amount,
                ..
            } => {
                require_entity(entity, &mut errors);
                require_entity(hub, &mut errors);
                require_token(*give_token, &mut errors);
                require_token(*want_token, &mut errors);
                require_amount(give_amount, &mut errors);
                require_amount(want_amount, &mut errors);
            }
            Step::DisputeStart { from, to } | Step::DisputeFinalize { from, to } => {
                require_entity(from, &mut errors);
                require_entity(to, &mut errors);
            }
            Step::Broadcast { entity } => {
                require_entity(entity, &mut errors);
            }
            Step::AdvanceTime { .. } | Step::Mine { .. } | Step::Converge => {}
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{EntitySpec, TokenSpec};
    use std::collections::BTreeMap;

    fn base_spec() -> ScenarioSpec {
        ScenarioSpec {
            name: "t".into(),
            description: None,
            runtime_seed: 1,
            dispute_timeout_blocks: 10,
            tokens: vec![TokenSpec {
                id: 1,
                symbol: "USDC".into(),
                decimals: 18,
            }],
            entities: vec![
                EntitySpec {
                    name: "alice".into(),
                    id_byte: 1,
                    validators: vec!["s1".into()],
                    threshold: 1,
                    shares: BTreeMap::new(),
                },
                EntitySpec {
                    name: "hub".into(),
                    id_byte: 2,
                    validators: vec!["h1".into()],
                    threshold: 1,
                    shares: BTreeMap::new(),
                },
            ],
            steps: vec![],
        }
    }

    #[test]
    fn valid_spec_passes() {
        let mut spec = base_spec();
        spec.steps = vec![
            Step::OpenAccount {
                from: "alice".into(),
                to: "hub".into(),
            },
            Step::Pay {
                from: "alice".into(),
                to: "hub".into(),
                token: 1,
                amount: "1000".into(),
                route: vec![],
            },
        ];
        assert!(check(&spec).is_ok());
    }

    #[test]
    fn unroutable_payment_is_flagged() {
        let mut spec = base_spec();
        spec.steps = vec![Step::Pay {
            from: "alice".into(),
            to: "hub".into(),
            token: 1,
            amount: "5".into(),
            route: vec![],
        }];
        let errors = check(&spec).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ScenarioError::Unroutable { .. })));
    }

    #[test]
    fn threshold_above_shares_is_flagged() {
        let mut spec = base_spec();
        spec.entities[0].threshold = 5;
        let errors = check(&spec).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ScenarioError::ThresholdUnreachable { .. })));
    }
}
