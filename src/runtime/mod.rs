//! Runtime scheduler.
//!
//! Single-threaded, tick-driven. One tick drains the pending inputs, routes
//! them to replicas in deterministic key order, collects the outputs, and
//! appends exactly one frame to history. `apply_runtime_input` is a pure
//! function of `(env, input)`: two runs from the same seed over the same
//! external inputs produce byte-identical histories, and replaying a recorded
//! history from an empty env reproduces the final state.

pub mod gossip;

use std::collections::BTreeMap;
use std::path::Path;

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use gavel::signers::signer::{HankoSigner, LocalSigner};
use gavel::types::events::EventCursor;

use crate::entity::{EntityReplica, QueuedBatch, ReplicaOutput};
use crate::errors::EngineError;
use crate::hash;
use crate::model::entity::{EntityInput, ValidatorConfig};
use crate::model::ids::{replica_key, EntityId, SignerId};
use gossip::{Envelope, Gossip, InProcessGossip};

/// An entity input addressed to one replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedInput {
    pub entity_id: EntityId,
    pub signer_id: SignerId,
    pub input: EntityInput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeTx {
    ImportReplica {
        entity_id: EntityId,
        signer_id: SignerId,
        config: ValidatorConfig,
    },
    RemoveReplica {
        entity_id: EntityId,
        signer_id: SignerId,
    },
    /// Advance the logical clock. Scenario drivers pin time; the live driver
    /// feeds wall clock through the same door so replay stays exact.
    AdvanceTime { to_ms: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInput {
    pub runtime_txs: Vec<RuntimeTx>,
    pub entity_inputs: Vec<RoutedInput>,
}

impl RuntimeInput {
    pub fn is_empty(&self) -> bool {
        self.runtime_txs.is_empty() && self.entity_inputs.is_empty()
    }
}

/// One tick's record: the external inputs consumed and what committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeFrame {
    pub height: u64,
    pub timestamp: u64,
    pub runtime_txs: Vec<RuntimeTx>,
    pub entity_inputs: Vec<RoutedInput>,
    /// Replica keys whose entity height advanced this tick, with the new
    /// height.
    pub committed_frames: Vec<(String, u64)>,
    pub emitted_outputs: usize,
}

/// Replica-level log entry (admission rejections, isolation, handler notes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameLog {
    pub height: u64,
    pub replica: String,
    pub message: String,
}

/// Jurisdiction-side view held by the runtime: the event cursor and the
/// handoff mempool of flushed batches. The chain itself lives behind the
/// adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JReplica {
    pub name: String,
    pub cursor: EventCursor,
    pub mempool: Vec<QueuedBatch>,
}

#[derive(Serialize, Deserialize)]
pub struct RuntimeEnv {
    pub replicas: BTreeMap<String, EntityReplica>,
    pub jurisdictions: BTreeMap<String, JReplica>,
    pub active_jurisdiction: String,
    pub height: u64,
    pub timestamp: u64,
    pub runtime_seed: u64,
    pub history: Vec<RuntimeFrame>,
    pub frame_logs: Vec<FrameLog>,
    /// Internally routed inputs awaiting the next tick.
    pub network_inbox: Vec<RoutedInput>,
    /// Buffer external producers fill between ticks; drained by `process`.
    pub runtime_input: RuntimeInput,
    pub scenario_mode: bool,
    /// Abort the tick on any fatal handler error (test scenarios).
    pub strict_scenario: bool,
    #[serde(skip)]
    signers: BTreeMap<String, LocalSigner>,
    #[serde(skip)]
    gossip: InProcessGossip,
    #[serde(skip)]
    gossip_nonce: u64,
}

/// Fresh env with a seeded signer registry and an attached jurisdiction name.
pub fn create_empty_env(runtime_seed: u64, jurisdiction: &str) -> RuntimeEnv {
    let mut jurisdictions = BTreeMap::new();
    jurisdictions.insert(
        jurisdiction.to_string(),
        JReplica {
            name: jurisdiction.to_string(),
            cursor: EventCursor::default(),
            mempool: Vec::new(),
        },
    );
    RuntimeEnv {
        replicas: BTreeMap::new(),
        jurisdictions,
        active_jurisdiction: jurisdiction.to_string(),
        height: 0,
        timestamp: 0,
        runtime_seed,
        history: Vec::new(),
        frame_logs: Vec::new(),
        network_inbox: Vec::new(),
        runtime_input: RuntimeInput::default(),
        scenario_mode: true,
        strict_scenario: false,
        signers: BTreeMap::new(),
        gossip: InProcessGossip::new(),
        gossip_nonce: 0,
    }
}

impl RuntimeEnv {
    /// The deterministic scenario address for a signer of an entity.
    pub fn derived_address(seed: u64, entity: EntityId, signer: &str) -> Address {
        LocalSigner::from_seed(seed, entity, signer).address()
    }

    pub fn replica(&self, entity: EntityId, signer: &str) -> Option<&EntityReplica> {
        self.replicas.get(&replica_key(entity, signer))
    }

    pub fn replica_mut(&mut self, entity: EntityId, signer: &str) -> Option<&mut EntityReplica> {
        self.replicas.get_mut(&replica_key(entity, signer))
    }

    /// Queue an external input for the next `process` call.
    pub fn enqueue(&mut self, entity_id: EntityId, signer_id: &str, input: EntityInput) {
        self.runtime_input.entity_inputs.push(RoutedInput {
            entity_id,
            signer_id: signer_id.to_string(),
            input,
        });
    }

    /// Hash over the full history, for determinism checks.
    pub fn history_hash(&self) -> Result<B256, EngineError> {
        hash::digest(&self.history)
    }

    pub fn log(&mut self, replica: &str, message: String) {
        self.frame_logs.push(FrameLog {
            height: self.height,
            replica: replica.to_string(),
            message,
        });
    }

    /// Persist the env as JSON (gossip queue and signer keys are derived
    /// state and are rebuilt on load).
    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Encoding(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| EngineError::Fatal(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let json =
            std::fs::read_to_string(path).map_err(|e| EngineError::Fatal(e.to_string()))?;
        let mut env: RuntimeEnv =
            serde_json::from_str(&json).map_err(|e| EngineError::Encoding(e.to_string()))?;
        env.rebuild_signers();
        Ok(env)
    }

    /// Re-derive scenario signers after deserialization.
    pub fn rebuild_signers(&mut self) {
        let seed = self.runtime_seed;
        let keys: Vec<(String, EntityId, String)> = self
            .replicas
            .values()
            .map(|r| {
                (
                    replica_key(r.entity_id, &r.signer_id),
                    r.entity_id,
                    r.signer_id.clone(),
                )
            })
            .collect();
        for (key, entity, signer) in keys {
            let local = LocalSigner::from_seed(seed, entity, &signer);
            self.gossip.register(signer.clone(), local.address());
            self.signers.insert(key, local);
        }
    }

    fn apply_runtime_tx(&mut self, tx: &RuntimeTx) {
        match tx {
            RuntimeTx::ImportReplica {
                entity_id,
                signer_id,
                config,
            } => {
                let key = replica_key(*entity_id, signer_id);
                if self.replicas.contains_key(&key) {
                    self.log(&key, "replica already imported; ignoring".into());
                    return;
                }
                let local = LocalSigner::from_seed(self.runtime_seed, *entity_id, signer_id);
                self.gossip.register(signer_id.clone(), local.address());
                self.signers.insert(key.clone(), local);
                self.replicas.insert(
                    key,
                    EntityReplica::new(*entity_id, signer_id.clone(), config.clone()),
                );
            }
            RuntimeTx::RemoveReplica {
                entity_id,
                signer_id,
            } => {
                let key = replica_key(*entity_id, signer_id);
                if self.replicas.remove(&key).is_none() {
                    self.log(&key, "remove of unknown replica; ignoring".into());
                }
                self.signers.remove(&key);
            }
            RuntimeTx::AdvanceTime { to_ms } => {
                self.timestamp = self.timestamp.max(*to_ms);
            }
        }
    }

    fn route_outputs(
        &mut self,
        from_key: &str,
        outputs: Vec<ReplicaOutput>,
        emitted: &mut usize,
    ) {
        let from_entity = self
            .replicas
            .get(from_key)
            .map(|r| (r.entity_id, r.signer_id.clone()));
        for output in outputs {
            match output {
                ReplicaOutput::ToReplica { signer, input } => {
                    let Some((entity, _)) = &from_entity else { continue };
                    *emitted += 1;
                    self.deliver(*entity, &signer, input, from_key);
                }
                ReplicaOutput::ToEntity { entity, input } => {
                    *emitted += 1;
                    let targets: Vec<(EntityId, SignerId)> = self
                        .replicas
                        .values()
                        .filter(|r| r.entity_id == entity)
                        .map(|r| (r.entity_id, r.signer_id.clone()))
                        .collect();
                    if targets.is_empty() {
                        self.send_remote(entity, "", input, from_key);
                    } else {
                        for (e, s) in targets {
                            self.network_inbox.push(RoutedInput {
                                entity_id: e,
                                signer_id: s,
                                input: input.clone(),
                            });
                        }
                    }
                }
                ReplicaOutput::JSubmit(queued) => {
                    let j = self.active_jurisdiction.clone();
                    if let Some(jr) = self.jurisdictions.get_mut(&j) {
                        jr.mempool.push(queued);
                    }
                }
                ReplicaOutput::Log(message) => self.log(from_key, message),
            }
        }
    }

    fn deliver(&mut self, entity: EntityId, signer: &str, input: EntityInput, from: &str) {
        if self.replicas.contains_key(&replica_key(entity, signer)) {
            self.network_inbox.push(RoutedInput {
                entity_id: entity,
                signer_id: signer.to_string(),
                input,
            });
        } else {
            self.send_remote(entity, signer, input, from);
        }
    }

    /// Hand an envelope to gossip for a signer not hosted in this process. An
    /// empty `to` means "any replica of the entity".
    fn send_remote(&mut self, entity: EntityId, to: &str, input: EntityInput, from_key: &str) {
        let Some(signer) = self.signers.get(from_key).cloned() else {
            self.log(from_key, "no signer for remote send; dropped".into());
            return;
        };
        self.gossip_nonce += 1;
        let nonce = self.gossip_nonce;
        let from = signer.signer_id().to_string();
        let digest = match Envelope::signing_digest(&from, to, entity, &input, nonce) {
            Ok(d) => d,
            Err(e) => {
                self.log(from_key, format!("envelope digest failed: {e}"));
                return;
            }
        };
        match signer.sign_digest(digest) {
            Ok(signature) => self.gossip.send(Envelope {
                from,
                to: to.to_string(),
                entity_id: entity,
                payload: input,
                nonce,
                signature,
            }),
            Err(e) => self.log(from_key, format!("envelope signing failed: {e}")),
        }
    }
}

/// Advance the network one tick. Pure in `(env, input)`: all effects are in
/// the returned env mutation, one frame is appended to history.
pub fn apply_runtime_input(
    env: &mut RuntimeEnv,
    input: RuntimeInput,
) -> Result<(), EngineError> {
    env.height += 1;

    for tx in &input.runtime_txs {
        env.apply_runtime_tx(tx);
    }

    // Assemble per-replica inboxes: carried-over internal traffic first, then
    // this tick's external inputs, preserving arrival order.
    let mut inboxes: BTreeMap<String, Vec<EntityInput>> = BTreeMap::new();
    let carried = std::mem::take(&mut env.network_inbox);
    for routed in carried.into_iter().chain(input.entity_inputs.iter().cloned()) {
        inboxes
            .entry(replica_key(routed.entity_id, &routed.signer_id))
            .or_default()
            .push(routed.input);
    }

    let heights_before: BTreeMap<String, u64> = env
        .replicas
        .iter()
        .map(|(k, r)| (k.clone(), r.state.height))
        .collect();

    let mut emitted = 0usize;
    let keys: Vec<String> = env.replicas.keys().cloned().collect();
    for key in keys {
        let inbox = inboxes.remove(&key).unwrap_or_default();
        let Some(signer) = env.signers.get(&key).cloned() else {
            env.log(&key, "replica has no signer; inputs dropped".into());
            continue;
        };

        let mut isolated = false;
        for item in inbox {
            if isolated {
                break;
            }
            let result = {
                let replica = env.replicas.get_mut(&key).unwrap();
                if replica.errored.is_some() {
                    break;
                }
                replica.handle_input(item, &signer, env.timestamp)
            };
            match result {
                Ok(outputs) => env.route_outputs(&key, outputs, &mut emitted),
                Err(e) => match severity(&e) {
                    Severity::Rejection => env.log(&key, format!("input rejected: {e}")),
                    Severity::Fatal => {
                        if env.strict_scenario {
                            return Err(e);
                        }
                        env.log(&key, format!("replica isolated: {e}"));
                        env.replicas.get_mut(&key).unwrap().errored = Some(e.to_string());
                        isolated = true;
                    }
                },
            }
        }
        if isolated {
            continue;
        }

        let end_result = {
            let replica = env.replicas.get_mut(&key).unwrap();
            if replica.errored.is_some() {
                Ok(Vec::new())
            } else {
                replica.end_tick(&signer, env.timestamp)
            }
        };
        match end_result {
            Ok(outputs) => env.route_outputs(&key, outputs, &mut emitted),
            Err(e) => match severity(&e) {
                Severity::Rejection => env.log(&key, format!("proposal failed: {e}")),
                Severity::Fatal => {
                    if env.strict_scenario {
                        return Err(e);
                    }
                    env.log(&key, format!("replica isolated: {e}"));
                    env.replicas.get_mut(&key).unwrap().errored = Some(e.to_string());
                }
            },
        }
    }

    // Drain gossip loopback into next tick's inbox (in-process only; remote
    // transports deliver into their own runtime). A targeted envelope whose
    // signer is not hosted here is dropped, like a dead peer.
    for envelope in env.gossip.drain() {
        let targets: Vec<(EntityId, SignerId)> = env
            .replicas
            .values()
            .filter(|r| {
                r.entity_id == envelope.entity_id
                    && (envelope.to.is_empty() || r.signer_id == envelope.to)
            })
            .map(|r| (r.entity_id, r.signer_id.clone()))
            .collect();
        for (e, s) in targets {
            env.network_inbox.push(RoutedInput {
                entity_id: e,
                signer_id: s,
                input: envelope.payload.clone(),
            });
        }
    }

    let committed_frames: Vec<(String, u64)> = env
        .replicas
        .iter()
        .filter_map(|(k, r)| {
            let before = heights_before.get(k).copied().unwrap_or(0);
            (r.state.height > before).then(|| (k.clone(), r.state.height))
        })
        .collect();

    env.history.push(RuntimeFrame {
        height: env.height,
        timestamp: env.timestamp,
        runtime_txs: input.runtime_txs,
        entity_inputs: input.entity_inputs,
        committed_frames,
        emitted_outputs: emitted,
    });
    Ok(())
}

/// One tick consuming the buffered external inputs plus anything already in
/// the network inbox.
pub fn process(env: &mut RuntimeEnv) -> Result<(), EngineError> {
    let input = std::mem::take(&mut env.runtime_input);
    apply_runtime_input(env, input)
}

/// Tick until no internal traffic remains (bounded; consensus handshakes
/// settle in a handful of ticks).
pub fn settle(env: &mut RuntimeEnv, max_ticks: usize) -> Result<usize, EngineError> {
    let mut ticks = 0;
    while ticks < max_ticks {
        if env.network_inbox.is_empty() && env.runtime_input.is_empty() {
            // One more pass lets proposers flush mempools filled externally.
            let had_mempool = env.replicas.values().any(|r| !r.mempool.is_empty());
            if !had_mempool {
                break;
            }
        }
        process(env)?;
        ticks += 1;
    }
    Ok(ticks)
}

enum Severity {
    /// Surfaces in the frame log; no state change beyond the rejection.
    Rejection,
    /// Isolates the replica (or aborts the tick in strict scenarios).
    Fatal,
}

fn severity(e: &EngineError) -> Severity {
    match e {
        EngineError::Admission(_)
        | EngineError::Invariant(_)
        | EngineError::DisputeGate { .. }
        | EngineError::ConsensusMismatch(_) => Severity::Rejection,
        EngineError::Adapter(_)
        | EngineError::Encoding(_)
        | EngineError::Signer(_)
        | EngineError::Fatal(_) => Severity::Fatal,
    }
}

/// Replay a recorded history against a fresh env. The result must equal the
/// env that produced the history.
pub fn replay(
    seed: u64,
    jurisdiction: &str,
    history: &[RuntimeFrame],
) -> Result<RuntimeEnv, EngineError> {
    let mut env = create_empty_env(seed, jurisdiction);
    for frame in history {
        apply_runtime_input(
            &mut env,
            RuntimeInput {
                runtime_txs: frame.runtime_txs.clone(),
                entity_inputs: frame.entity_inputs.clone(),
            },
        )?;
    }
    Ok(env)
}
