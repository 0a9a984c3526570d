//! Scenario harness.
//!
//! A scenario drives the deterministic core end to end: replica imports,
//! reserve funding through a simulated jurisdiction, scripted entity inputs,
//! logical-time advancement, and deterministic mining. The runner is the
//! programmatic face (integration tests build networks with it directly);
//! JSON scenario files reach the same runner through [`run_spec`].

pub mod validate;

use std::collections::BTreeMap;

use alloy::primitives::{B256, I256, U256};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use gavel::providers::SimJurisdiction;
use gavel::types::hanko::ValidatorSet;

use crate::errors::EngineError;
use crate::model::account::AccountMachine;
use crate::model::entity::{
    BatchStatus, ConsensusMode, EntityInput, EntityState, EntityTx, ValidatorConfig,
};
use crate::model::ids::{EntityId, TokenId};
use crate::runtime::{self, apply_runtime_input, create_empty_env, RuntimeEnv, RuntimeInput, RuntimeTx};

/// Default jurisdiction name for scenarios.
pub const SCENARIO_JURISDICTION: &str = "simnet";

/// Bounded settle loop: bilateral handshakes plus 2-of-3 consensus round
/// trips finish well under this.
const MAX_SETTLE_TICKS: usize = 24;
const MAX_CONVERGE_ROUNDS: usize = 16;

// ── Scenario file format ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TokenSpec {
    pub id: TokenId,
    pub symbol: String,
    #[serde(default = "default_decimals")]
    pub decimals: u8,
}

fn default_decimals() -> u8 {
    18
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EntitySpec {
    pub name: String,
    /// Single byte expanded to the 32-byte id; fixes left/right ordering.
    pub id_byte: u8,
    pub validators: Vec<String>,
    pub threshold: u64,
    /// Defaults to one share per validator.
    #[serde(default)]
    pub shares: BTreeMap<String, u64>,
}

/// One scripted action. Amounts are decimal strings in token base units.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Fund {
        entity: String,
        token: TokenId,
        amount: String,
    },
    OpenAccount {
        from: String,
        to: String,
    },
    ExtendCredit {
        from: String,
        to: String,
        token: TokenId,
        amount: String,
    },
    Pay {
        from: String,
        to: String,
        token: TokenId,
        amount: String,
        #[serde(default)]
        route: Vec<String>,
    },
    DepositCollateral {
        from: String,
        to: String,
        token: TokenId,
        amount: String,
    },
    SetRebalancePolicy {
        entity: String,
        token: TokenId,
        soft_limit: String,
        hard_limit: String,
        max_acceptable_fee: String,
    },
    SetHubConfig {
        entity: String,
        fee_ppm: u64,
        base_fee: String,
        scan_interval_ms: u64,
    },
    InitOrderbook {
        entity: String,
        pairs: Vec<(TokenId, TokenId)>,
    },
    PlaceOffer {
        entity: String,
        hub: String,
        give_token: TokenId,
        give_amount: String,
        want_token: TokenId,
        want_amount: String,
        #[serde(default)]
        min_fill_ratio: u16,
    },
    DisputeStart {
        from: String,
        to: String,
    },
    DisputeFinalize {
        from: String,
        to: String,
    },
    Broadcast {
        entity: String,
    },
    AdvanceTime {
        ms: u64,
    },
    Mine {
        blocks: u64,
    },
    /// Run handshakes, batch submissions, and event ingestion to quiescence.
    Converge,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ScenarioSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub runtime_seed: u64,
    #[serde(default = "default_dispute_timeout")]
    pub dispute_timeout_blocks: u64,
    pub tokens: Vec<TokenSpec>,
    pub entities: Vec<EntitySpec>,
    pub steps: Vec<Step>,
}

fn default_dispute_timeout() -> u64 {
    10
}

pub fn parse_amount(s: &str) -> Result<U256, EngineError> {
    U256::from_str_radix(s.trim(), 10)
        .map_err(|e| EngineError::Encoding(format!("bad amount `{s}`: {e}")))
}

// ── Runner ──────────────────────────────────────────────────────────

pub struct ScenarioRunner {
    pub env: RuntimeEnv,
    pub chain: SimJurisdiction,
    names: BTreeMap<String, EntityId>,
    configs: BTreeMap<EntityId, ValidatorConfig>,
}

impl ScenarioRunner {
    pub fn new(runtime_seed: u64, dispute_timeout_blocks: u64) -> Self {
        let mut env = create_empty_env(runtime_seed, SCENARIO_JURISDICTION);
        env.scenario_mode = true;
        Self {
            env,
            chain: SimJurisdiction::new(dispute_timeout_blocks),
            names: BTreeMap::new(),
            configs: BTreeMap::new(),
        }
    }

    pub fn entity(&self, name: &str) -> EntityId {
        self.names[name]
    }

    pub fn validator_set(&self, name: &str) -> ValidatorSet {
        self.configs[&self.entity(name)].to_validator_set()
    }

    /// Import one replica per validator and register the set with the
    /// jurisdiction.
    pub fn add_entity(
        &mut self,
        name: &str,
        id_byte: u8,
        validators: &[&str],
        threshold: u64,
        shares: &[(&str, u64)],
    ) -> EntityId {
        let entity_id = B256::from([id_byte; 32]);
        let seed = self.env.runtime_seed;

        let mut share_map = BTreeMap::new();
        for v in validators {
            share_map.insert(v.to_string(), 1u64);
        }
        for (v, s) in shares {
            share_map.insert(v.to_string(), *s);
        }
        let mut addresses = BTreeMap::new();
        for v in validators {
            addresses.insert(
                v.to_string(),
                RuntimeEnv::derived_address(seed, entity_id, v),
            );
        }
        let config = ValidatorConfig {
            mode: ConsensusMode::ProposerBased,
            threshold,
            validators: validators.iter().map(|v| v.to_string()).collect(),
            shares: share_map,
            addresses,
        };

        let mut txs = Vec::new();
        for v in validators {
            txs.push(RuntimeTx::ImportReplica {
                entity_id,
                signer_id: v.to_string(),
                config: config.clone(),
            });
        }
        self.tick_with(RuntimeInput {
            runtime_txs: txs,
            entity_inputs: Vec::new(),
        });

        self.chain
            .register_validator_set(entity_id, config.to_validator_set());
        self.names.insert(name.to_string(), entity_id);
        self.configs.insert(entity_id, config);
        entity_id
    }

    /// Take a replica offline: its inputs route into the void, like a dead
    /// validator.
    pub fn take_offline(&mut self, name: &str, signer: &str) {
        let entity_id = self.entity(name);
        self.tick_with(RuntimeInput {
            runtime_txs: vec![RuntimeTx::RemoveReplica {
                entity_id,
                signer_id: signer.to_string(),
            }],
            entity_inputs: Vec::new(),
        });
    }

    fn proposer_of(&self, entity: EntityId) -> String {
        self.configs[&entity].proposer().clone()
    }

    /// Submit a tx to the entity's proposer (the normal client path).
    pub fn submit(&mut self, name: &str, tx: EntityTx) {
        let entity = self.entity(name);
        let proposer = self.proposer_of(entity);
        self.env
            .enqueue(entity, &proposer, EntityInput::AddTx { tx });
    }

    pub fn tick(&mut self) {
        let _ = runtime::process(&mut self.env);
    }

    fn tick_with(&mut self, input: RuntimeInput) {
        let _ = apply_runtime_input(&mut self.env, input);
    }

    pub fn advance_time(&mut self, ms: u64) {
        let to_ms = self.env.timestamp + ms;
        self.env
            .runtime_input
            .runtime_txs
            .push(RuntimeTx::AdvanceTime { to_ms });
        self.tick();
    }

    /// Advance the chain and let every entity observe the new head.
    pub fn mine(&mut self, blocks: u64) {
        let head = self.chain.mine_sync(blocks);
        let entities: Vec<EntityId> = self.configs.keys().copied().collect();
        for entity in entities {
            let proposer = self.proposer_of(entity);
            self.env.enqueue(
                entity,
                &proposer,
                EntityInput::AddTx {
                    tx: EntityTx::ObserveJBlock { block: head },
                },
            );
        }
        self.settle();
    }

    /// Mint reserves on the chain and ingest the resulting event.
    pub fn fund(&mut self, name: &str, token: TokenId, amount: U256) {
        let entity = self.entity(name);
        self.chain.fund_reserves_sync(entity, token, amount);
        self.pump_chain();
        self.settle();
    }

    /// Tick until replica traffic quiesces.
    pub fn settle(&mut self) -> usize {
        runtime::settle(&mut self.env, MAX_SETTLE_TICKS).unwrap_or(0)
    }

    /// Drain flushed batches into the jurisdiction and ingest new finalized
    /// events back into the entities. Returns true when anything moved.
    pub fn pump_chain(&mut self) -> bool {
        let mut moved = false;

        // Submit every flushed batch.
        let j = self.env.active_jurisdiction.clone();
        let queued: Vec<_> = {
            let jr = self.env.jurisdictions.get_mut(&j).unwrap();
            std::mem::take(&mut jr.mempool)
        };
        for q in queued {
            moved = true;
            let (status, tx_hash) =
                match self.chain.submit_batch_sync(q.entity, &q.batch, &q.hanko) {
                    Ok(receipt) => (BatchStatus::Confirmed, Some(receipt.tx_hash)),
                    Err(e) => {
                        self.env
                            .log("jurisdiction", format!("batch rejected: {e}"));
                        (BatchStatus::Rejected, None)
                    }
                };
            let proposer = self.proposer_of(q.entity);
            self.env.enqueue(
                q.entity,
                &proposer,
                EntityInput::AddTx {
                    tx: EntityTx::JBatchAck {
                        nonce: q.nonce,
                        status,
                        tx_hash,
                    },
                },
            );
        }

        // Ingest finalized events, in chain order, to every hosted entity.
        let cursor = self.env.jurisdictions[&j].cursor;
        let records = self.chain.poll_events_sync(cursor);
        if let Some(last) = records.last() {
            self.env.jurisdictions.get_mut(&j).unwrap().cursor = last.cursor();
        }
        let entities: Vec<EntityId> = self.configs.keys().copied().collect();
        for record in records {
            moved = true;
            for entity in &entities {
                let proposer = self.proposer_of(*entity);
                self.env.enqueue(
                    *entity,
                    &proposer,
                    EntityInput::AddTx {
                        tx: EntityTx::JEventClaim {
                            record: record.clone(),
                        },
                    },
                );
            }
        }

        if moved {
            self.settle();
        }
        moved
    }

    /// Settle, pump, repeat until nothing moves.
    pub fn converge(&mut self) {
        self.settle();
        for _ in 0..MAX_CONVERGE_ROUNDS {
            if !self.pump_chain() {
                break;
            }
        }
    }

    // ── State inspection (proposer replica's view) ──────────────────

    pub fn state_of(&self, name: &str) -> &EntityState {
        let entity = self.entity(name);
        let proposer = self.proposer_of(entity);
        &self
            .env
            .replica(entity, &proposer)
            .expect("proposer replica present")
            .state
    }

    pub fn account_of<'a>(&'a self, name: &str, counterparty: &str) -> &'a AccountMachine {
        let cp = self.entity(counterparty);
        self.state_of(name)
            .account(cp)
            .expect("account machine present")
    }

    /// Total delta of an edge token from the left perspective, read from
    /// `viewer`'s copy.
    pub fn offdelta(&self, viewer: &str, counterparty: &str, token: TokenId) -> I256 {
        self.account_of(viewer, counterparty)
            .delta(token)
            .map(|d| d.offdelta)
            .unwrap_or(I256::ZERO)
    }

    pub fn collateral(&self, viewer: &str, counterparty: &str, token: TokenId) -> U256 {
        self.account_of(viewer, counterparty)
            .delta(token)
            .map(|d| d.collateral)
            .unwrap_or_default()
    }

    pub fn reserve(&self, name: &str, token: TokenId) -> U256 {
        self.state_of(name).reserve(token)
    }
}

// ── Spec execution ──────────────────────────────────────────────────

/// Execute a parsed scenario file. Returns the runner for inspection.
pub fn run_spec(spec: &ScenarioSpec, strict: bool) -> Result<ScenarioRunner, EngineError> {
    validate::check(spec).map_err(|errors| {
        EngineError::Fatal(format!(
            "scenario invalid: {}",
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        ))
    })?;

    let mut runner = ScenarioRunner::new(spec.runtime_seed, spec.dispute_timeout_blocks);
    runner.env.strict_scenario = strict;
    for e in &spec.entities {
        let validators: Vec<&str> = e.validators.iter().map(String::as_str).collect();
        let shares: Vec<(&str, u64)> =
            e.shares.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        runner.add_entity(&e.name, e.id_byte, &validators, e.threshold, &shares);
    }

    for step in &spec.steps {
        apply_step(&mut runner, step)?;
    }
    runner.converge();
    Ok(runner)
}

fn apply_step(runner: &mut ScenarioRunner, step: &Step) -> Result<(), EngineError> {
    match step {
        Step::Fund {
            entity,
            token,
            amount,
        } => {
            let amount = parse_amount(amount)?;
            runner.fund(entity, *token, amount);
        }
        Step::OpenAccount { from, to } => {
            let cp = runner.entity(to);
            let set = runner.validator_set(to);
            runner.submit(
                from,
                EntityTx::OpenAccount {
                    counterparty: cp,
                    counterparty_validators: Some(set),
                },
            );
            runner.settle();
        }
        Step::ExtendCredit {
            from,
            to,
            token,
            amount,
        } => {
            let cp = runner.entity(to);
            let amount = parse_amount(amount)?;
            runner.submit(
                from,
                EntityTx::ExtendCredit {
                    counterparty: cp,
                    token_id: *token,
                    amount,
                },
            );
            runner.settle();
        }
        Step::Pay {
            from,
            to,
            token,
            amount,
            route,
        } => {
            let target = runner.entity(to);
            let hops: Vec<EntityId> = route.iter().map(|r| runner.entity(r)).collect();
            let amount = parse_amount(amount)?;
            runner.submit(
                from,
                EntityTx::DirectPayment {
                    to: target,
                    token_id: *token,
                    amount,
                    route: hops,
                },
            );
            runner.settle();
        }
        Step::DepositCollateral {
            from,
            to,
            token,
            amount,
        } => {
            let cp = runner.entity(to);
            let amount = parse_amount(amount)?;
            runner.submit(
                from,
                EntityTx::DepositCollateral {
                    counterparty: cp,
                    token_id: *token,
                    amount,
                },
            );
            runner.settle();
        }
        Step::SetRebalancePolicy {
            entity,
            token,
            soft_limit,
            hard_limit,
            max_acceptable_fee,
        } => {
            let tx = EntityTx::SetRebalancePolicy {
                token_id: *token,
                soft_limit: parse_amount(soft_limit)?,
                hard_limit: parse_amount(hard_limit)?,
                max_acceptable_fee: parse_amount(max_acceptable_fee)?,
            };
            runner.submit(entity, tx);
            runner.settle();
        }
        Step::SetHubConfig {
            entity,
            fee_ppm,
            base_fee,
            scan_interval_ms,
        } => {
            let tx = EntityTx::SetHubConfig {
                fee_ppm: *fee_ppm,
                base_fee: parse_amount(base_fee)?,
                scan_interval_ms: *scan_interval_ms,
            };
            runner.submit(entity, tx);
            runner.settle();
        }
        Step::InitOrderbook { entity, pairs } => {
            runner.submit(entity, EntityTx::InitOrderbookExt { pairs: pairs.clone() });
            runner.settle();
        }
        Step::PlaceOffer {
            entity,
            hub,
            give_token,
            give_amount,
            want_token,
            want_amount,
            min_fill_ratio,
        } => {
            let hub_id = runner.entity(hub);
            let tx = EntityTx::PlaceSwapOffer {
                hub: hub_id,
                give_token: *give_token,
                give_amount: parse_amount(give_amount)?,
                want_token: *want_token,
                want_amount: parse_amount(want_amount)?,
                min_fill_ratio: *min_fill_ratio,
            };
            runner.submit(entity, tx);
            runner.settle();
        }
        Step::DisputeStart { from, to } => {
            let cp = runner.entity(to);
            runner.submit(from, EntityTx::DisputeStart { counterparty: cp });
            runner.settle();
        }
        Step::DisputeFinalize { from, to } => {
            let cp = runner.entity(to);
            runner.submit(from, EntityTx::DisputeFinalize { counterparty: cp });
            runner.settle();
        }
        Step::Broadcast { entity } => {
            runner.submit(entity, EntityTx::JBroadcast);
            runner.converge();
        }
        Step::AdvanceTime { ms } => runner.advance_time(*ms),
        Step::Mine { blocks } => runner.mine(*blocks),
        Step::Converge => runner.converge(),
    }
    Ok(())
}
