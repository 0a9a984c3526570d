//! Entity consensus replica.
//!
//! Proposer-based BFT: the first validator batches admitted txs into frames;
//! validators re-derive each frame and precommit-sign both the frame hash and
//! every hanko payload the frame's application produces (account proof
//! headers, workspace digests, batch digests). At threshold weight the
//! proposer assembles the hankos, applies the frame, and broadcasts the
//! commit so every replica lands on identical state.

pub mod handlers;

use std::collections::BTreeMap;

use alloy::primitives::{Signature, B256};

use gavel::signers::signer::{HankoSigner, LocalSigner};
use gavel::types::hanko::Hanko;

use crate::account::HankoCtx;
use crate::errors::{AdmissionError, EngineError};
use crate::hash;
use crate::model::account::AccountInput;
use crate::model::entity::{EntityFrame, EntityInput, EntityState, EntityTx, ValidatorConfig};
use crate::model::ids::{is_left, EntityId, SignerId};

pub use handlers::{apply_entity_tx, ApplyCtx, QueuedBatch};

/// What a replica hands back to the runtime after processing an input.
#[derive(Debug)]
pub enum ReplicaOutput {
    /// Consensus message to a sibling replica of the same entity.
    ToReplica {
        signer: SignerId,
        input: EntityInput,
    },
    /// Bilateral message to a peer entity (fanned out to its replicas).
    ToEntity {
        entity: EntityId,
        input: EntityInput,
    },
    /// Flushed batch for the jurisdiction mempool.
    JSubmit(QueuedBatch),
    Log(String),
}

#[derive(Debug, Clone)]
pub struct PendingProposal {
    pub frame: EntityFrame,
    pub frame_hash: B256,
    pub sign_requests: Vec<B256>,
    pub frame_sigs: Vec<(SignerId, Signature)>,
    pub payload_sigs: BTreeMap<SignerId, Vec<Signature>>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EntityReplica {
    pub entity_id: EntityId,
    pub signer_id: SignerId,
    pub state: EntityState,
    pub mempool: Vec<EntityTx>,
    #[serde(skip)]
    pub proposal: Option<PendingProposal>,
    /// Set when a fatal handler error isolated this replica.
    pub errored: Option<String>,
}

impl EntityReplica {
    pub fn new(entity_id: EntityId, signer_id: SignerId, config: ValidatorConfig) -> Self {
        Self {
            entity_id,
            signer_id,
            state: EntityState::new(entity_id, config),
            mempool: Vec::new(),
            proposal: None,
            errored: None,
        }
    }

    pub fn is_proposer(&self) -> bool {
        self.state.validator_config.proposer() == &self.signer_id
    }

    fn config(&self) -> &ValidatorConfig {
        &self.state.validator_config
    }

    fn verify_member_sig(
        &self,
        signer: &str,
        digest: B256,
        sig: &Signature,
    ) -> Result<(), EngineError> {
        let addr = self
            .config()
            .addresses
            .get(signer)
            .ok_or_else(|| EngineError::ConsensusMismatch(format!("unknown signer {signer}")))?;
        let recovered = sig
            .recover_address_from_prehash(&digest)
            .map_err(|e| EngineError::ConsensusMismatch(e.to_string()))?;
        if recovered != *addr {
            return Err(EngineError::ConsensusMismatch(format!(
                "signature of {signer} does not recover"
            )));
        }
        Ok(())
    }

    /// Admit an external input. Consensus messages advance the state machine;
    /// everything else funnels into the proposer's mempool.
    pub fn handle_input(
        &mut self,
        input: EntityInput,
        key: &LocalSigner,
        now: u64,
    ) -> Result<Vec<ReplicaOutput>, EngineError> {
        match input {
            EntityInput::AddTx { tx } => {
                if self.is_proposer() {
                    self.admit_tx(tx)?;
                    Ok(Vec::new())
                } else {
                    Ok(vec![ReplicaOutput::ToReplica {
                        signer: self.config().proposer().clone(),
                        input: EntityInput::AddTx { tx },
                    }])
                }
            }

            EntityInput::AccountMessage { from, input } => {
                if !self.is_proposer() {
                    // The proposer receives its own copy of every fan-out.
                    return Ok(Vec::new());
                }
                let tx = EntityTx::HandleAccountInput { from, input };
                self.admit_tx(tx)?;
                Ok(Vec::new())
            }

            EntityInput::Propose {
                frame,
                frame_hash,
                sign_requests,
                proposer,
                signature,
            } => self.on_propose(frame, frame_hash, sign_requests, proposer, signature, key),

            EntityInput::Precommit {
                height,
                frame_hash,
                signer,
                frame_sig,
                payload_sigs,
            } => self.on_precommit(height, frame_hash, signer, frame_sig, payload_sigs, now),

            EntityInput::Commit {
                frame,
                frame_hash,
                frame_hanko,
                payload_hankos,
            } => self.on_commit(frame, frame_hash, frame_hanko, payload_hankos),
        }
    }

    /// Mempool admission: cheap local predicate checks against current state.
    /// A rejected tx surfaces as an error, never a silent drop.
    fn admit_tx(&mut self, tx: EntityTx) -> Result<(), EngineError> {
        // Strict dispute gate: a disputed edge accepts only the dispute path.
        if let Some(cp) = business_counterparty(&tx) {
            if let Some(machine) = self.state.accounts.get(&cp) {
                if machine.status == crate::model::account::AccountStatus::Disputed {
                    return Err(EngineError::DisputeGate {
                        counterparty: format!("{cp}"),
                    });
                }
            }
        }
        self.mempool.push(tx);
        Ok(())
    }

    /// Validator receiving a proposal: re-derive, sign, reply.
    fn on_propose(
        &mut self,
        frame: EntityFrame,
        frame_hash: B256,
        sign_requests: Vec<B256>,
        proposer: SignerId,
        signature: Signature,
        key: &LocalSigner,
    ) -> Result<Vec<ReplicaOutput>, EngineError> {
        if proposer != *self.config().proposer() {
            return Err(AdmissionError::WrongProposer.into());
        }
        if frame.height != self.state.height + 1 {
            return Err(AdmissionError::Stale(format!(
                "proposal at height {} (local {})",
                frame.height, self.state.height
            ))
            .into());
        }
        if frame.prev_hash != self.state.last_frame_hash {
            return Err(EngineError::ConsensusMismatch("parent hash mismatch".into()));
        }
        if hash::digest(&frame)? != frame_hash {
            return Err(EngineError::ConsensusMismatch("frame hash mismatch".into()));
        }
        self.verify_member_sig(&proposer, frame_hash, &signature)?;

        // Re-derive the frame on a scratch copy; the sign requests must come
        // out identical or the proposer and we disagree about state.
        let mut scratch = self.state.clone();
        let mut derived_requests = Vec::new();
        let mut logs = Vec::new();
        {
            let mut hk = HankoCtx::Collect(&mut derived_requests);
            apply_frame(&mut scratch, &frame, &mut hk, &mut logs)?;
        }
        if derived_requests != sign_requests {
            return Err(EngineError::ConsensusMismatch(
                "sign requests differ from re-derived frame".into(),
            ));
        }

        let frame_sig = key
            .sign_digest(frame_hash)
            .map_err(|e| EngineError::Signer(e.to_string()))?;
        let mut payload_sigs = Vec::with_capacity(sign_requests.len());
        for digest in &sign_requests {
            payload_sigs.push(
                key.sign_digest(*digest)
                    .map_err(|e| EngineError::Signer(e.to_string()))?,
            );
        }

        Ok(vec![ReplicaOutput::ToReplica {
            signer: proposer,
            input: EntityInput::Precommit {
                height: frame.height,
                frame_hash,
                signer: self.signer_id.clone(),
                frame_sig,
                payload_sigs,
            },
        }])
    }

    /// Proposer collecting precommits; commits at threshold weight.
    fn on_precommit(
        &mut self,
        height: u64,
        frame_hash: B256,
        signer: SignerId,
        frame_sig: Signature,
        payload_sigs: Vec<Signature>,
        now: u64,
    ) -> Result<Vec<ReplicaOutput>, EngineError> {
        let Some(proposal) = self.proposal.as_mut() else {
            return Ok(Vec::new());
        };
        if proposal.frame.height != height || proposal.frame_hash != frame_hash {
            return Ok(Vec::new());
        }
        if proposal.frame_sigs.iter().any(|(s, _)| *s == signer) {
            return Ok(Vec::new());
        }
        if payload_sigs.len() != proposal.sign_requests.len() {
            return Err(EngineError::ConsensusMismatch(
                "payload signature count mismatch".into(),
            ));
        }
        let requests = proposal.sign_requests.clone();
        self.verify_member_sig(&signer, frame_hash, &frame_sig)?;
        for (digest, sig) in requests.iter().zip(payload_sigs.iter()) {
            self.verify_member_sig(&signer, *digest, sig)?;
        }

        let proposal = self.proposal.as_mut().unwrap();
        proposal.frame_sigs.push((signer.clone(), frame_sig));
        proposal.payload_sigs.insert(signer, payload_sigs);

        let weight: u64 = proposal
            .frame_sigs
            .iter()
            .map(|(s, _)| self.state.validator_config.share_of(s))
            .sum();
        if weight < self.state.validator_config.threshold {
            return Ok(Vec::new());
        }

        let _ = now;
        self.commit_own_proposal()
    }

    /// Assemble hankos from the collected precommits and apply the frame.
    fn commit_own_proposal(&mut self) -> Result<Vec<ReplicaOutput>, EngineError> {
        let Some(proposal) = self.proposal.take() else {
            return Ok(Vec::new());
        };

        let mut frame_hanko = Hanko::new();
        for (s, sig) in &proposal.frame_sigs {
            frame_hanko.push(s.clone(), *sig);
        }
        let mut payload_hankos: Vec<(B256, Hanko)> = Vec::new();
        for (i, digest) in proposal.sign_requests.iter().enumerate() {
            let mut hanko = Hanko::new();
            for (s, sigs) in &proposal.payload_sigs {
                hanko.push(s.clone(), sigs[i]);
            }
            payload_hankos.push((*digest, hanko));
        }

        let mut outputs = self.apply_committed(
            &proposal.frame,
            proposal.frame_hash,
            &payload_hankos,
            true,
        )?;

        for validator in self.state.validator_config.validators.clone() {
            if validator != self.signer_id {
                outputs.push(ReplicaOutput::ToReplica {
                    signer: validator,
                    input: EntityInput::Commit {
                        frame: proposal.frame.clone(),
                        frame_hash: proposal.frame_hash,
                        frame_hanko: frame_hanko.clone(),
                        payload_hankos: payload_hankos.clone(),
                    },
                });
            }
        }
        Ok(outputs)
    }

    /// Validator applying a committed frame.
    fn on_commit(
        &mut self,
        frame: EntityFrame,
        frame_hash: B256,
        frame_hanko: Hanko,
        payload_hankos: Vec<(B256, Hanko)>,
    ) -> Result<Vec<ReplicaOutput>, EngineError> {
        if frame.height != self.state.height + 1 {
            // Replays of frames we already hold are dropped silently.
            return Ok(Vec::new());
        }
        if hash::digest(&frame)? != frame_hash {
            return Err(EngineError::ConsensusMismatch("commit hash mismatch".into()));
        }
        let set = self.state.validator_config.to_validator_set();
        if !frame_hanko.verify(frame_hash, &set) {
            return Err(EngineError::ConsensusMismatch(
                "commit hanko below threshold".into(),
            ));
        }
        // Only the proposer emits cross-entity traffic; validators converge
        // state silently.
        let outputs = self.apply_committed(&frame, frame_hash, &payload_hankos, false)?;
        Ok(outputs
            .into_iter()
            .filter(|o| matches!(o, ReplicaOutput::Log(_)))
            .collect())
    }

    fn apply_committed(
        &mut self,
        frame: &EntityFrame,
        frame_hash: B256,
        payload_hankos: &[(B256, Hanko)],
        emit: bool,
    ) -> Result<Vec<ReplicaOutput>, EngineError> {
        let hanko_map: BTreeMap<B256, Hanko> = payload_hankos.iter().cloned().collect();
        let mut logs = Vec::new();
        let (peer_msgs, j_submits) = {
            let mut hk = HankoCtx::Provide(&hanko_map);
            apply_frame(&mut self.state, frame, &mut hk, &mut logs)?
        };
        self.state.height = frame.height;
        self.state.last_frame_hash = frame_hash;

        let mut outputs: Vec<ReplicaOutput> = logs.into_iter().map(ReplicaOutput::Log).collect();
        if emit {
            for (entity, input) in peer_msgs {
                outputs.push(ReplicaOutput::ToEntity {
                    entity,
                    input: EntityInput::AccountMessage {
                        from: self.entity_id,
                        input,
                    },
                });
            }
            for queued in j_submits {
                outputs.push(ReplicaOutput::JSubmit(queued));
            }
        }
        Ok(outputs)
    }

    /// End-of-tick duties for the proposer: fire the hub crontab when due and
    /// turn the mempool into the next frame.
    pub fn end_tick(
        &mut self,
        key: &LocalSigner,
        now: u64,
    ) -> Result<Vec<ReplicaOutput>, EngineError> {
        if !self.is_proposer() {
            return Ok(Vec::new());
        }

        if let Some(cfg) = self.state.hub_config {
            let due = now >= self.state.hub_last_scan + cfg.scan_interval_ms;
            let has_requests = self
                .state
                .accounts
                .values()
                .any(|m| m.requested_rebalance.values().any(|a| !a.is_zero()));
            if due && has_requests {
                self.mempool.push(EntityTx::HubRebalanceScan);
            }
        }

        if self.mempool.is_empty() || self.proposal.is_some() {
            return Ok(Vec::new());
        }

        let candidates = std::mem::take(&mut self.mempool);
        let mut outputs = Vec::new();

        // Build the frame: apply candidates one at a time on a scratch copy,
        // dropping the ones that no longer pass. What survives is what every
        // replica will re-derive.
        let mut scratch = self.state.clone();
        scratch.timestamp = now;
        let mut kept: Vec<EntityTx> = Vec::new();
        for tx in candidates {
            let mut attempt = scratch.clone();
            let mut requests = Vec::new();
            let mut logs = Vec::new();
            let mut hk = HankoCtx::Collect(&mut requests);
            let mut peer_msgs = Vec::new();
            let mut j_submits = Vec::new();
            let mut ctx = ApplyCtx {
                now,
                hanko_ctx: &mut hk,
                peer_msgs: &mut peer_msgs,
                j_submits: &mut j_submits,
                logs: &mut logs,
            };
            match apply_entity_tx(&mut attempt, &tx, &mut ctx) {
                Ok(()) => {
                    scratch = attempt;
                    kept.push(tx);
                }
                Err(e) => outputs.push(ReplicaOutput::Log(format!("tx dropped: {e}"))),
            }
        }
        if kept.is_empty() {
            return Ok(outputs);
        }

        let frame = EntityFrame {
            height: self.state.height + 1,
            timestamp: now,
            prev_hash: self.state.last_frame_hash,
            txs: kept,
        };
        let frame_hash = hash::digest(&frame)?;

        // Full dry run from the real state to fix the sign-request list.
        let mut dry = self.state.clone();
        let mut sign_requests = Vec::new();
        let mut dry_logs = Vec::new();
        {
            let mut hk = HankoCtx::Collect(&mut sign_requests);
            apply_frame(&mut dry, &frame, &mut hk, &mut dry_logs)?;
        }

        let frame_sig = key
            .sign_digest(frame_hash)
            .map_err(|e| EngineError::Signer(e.to_string()))?;
        let mut own_payload_sigs = Vec::with_capacity(sign_requests.len());
        for digest in &sign_requests {
            own_payload_sigs.push(
                key.sign_digest(*digest)
                    .map_err(|e| EngineError::Signer(e.to_string()))?,
            );
        }

        self.proposal = Some(PendingProposal {
            frame: frame.clone(),
            frame_hash,
            sign_requests: sign_requests.clone(),
            frame_sigs: vec![(self.signer_id.clone(), frame_sig)],
            payload_sigs: BTreeMap::from([(self.signer_id.clone(), own_payload_sigs)]),
        });

        let own_share = self.state.validator_config.share_of(&self.signer_id);
        if own_share >= self.state.validator_config.threshold {
            outputs.extend(self.commit_own_proposal()?);
        } else {
            for validator in self.state.validator_config.validators.clone() {
                if validator != self.signer_id {
                    outputs.push(ReplicaOutput::ToReplica {
                        signer: validator,
                        input: EntityInput::Propose {
                            frame: frame.clone(),
                            frame_hash,
                            sign_requests: sign_requests.clone(),
                            proposer: self.signer_id.clone(),
                            signature: frame_sig,
                        },
                    });
                }
            }
        }
        Ok(outputs)
    }
}

/// Apply one frame's txs and emit the resulting account proposals.
fn apply_frame(
    state: &mut EntityState,
    frame: &EntityFrame,
    hk: &mut HankoCtx<'_>,
    logs: &mut Vec<String>,
) -> Result<(Vec<(EntityId, AccountInput)>, Vec<QueuedBatch>), EngineError> {
    state.timestamp = frame.timestamp;
    let mut peer_msgs = Vec::new();
    let mut j_submits = Vec::new();
    {
        let mut ctx = ApplyCtx {
            now: frame.timestamp,
            hanko_ctx: hk,
            peer_msgs: &mut peer_msgs,
            j_submits: &mut j_submits,
            logs,
        };
        for tx in &frame.txs {
            apply_entity_tx(state, tx, &mut ctx)?;
        }
    }

    // Any edge with queued bilateral work proposes its next frame now.
    let me = state.entity_id;
    let counterparties: Vec<EntityId> = state.accounts.keys().copied().collect();
    for cp in counterparties {
        let me_is_left = is_left(me, cp);
        let machine = state.accounts.get_mut(&cp).unwrap();
        match crate::account::maybe_propose(machine, me_is_left, hk) {
            Ok(Some(proposal)) => peer_msgs.push((cp, proposal)),
            Ok(None) => {}
            Err(e) => logs.push(format!("edge {cp}: proposal deferred: {e}")),
        }
    }

    Ok((peer_msgs, j_submits))
}

/// The counterparty a business tx targets, for the dispute gate. Dispute-path
/// and non-edge txs return `None` and pass the gate.
fn business_counterparty(tx: &EntityTx) -> Option<EntityId> {
    match tx {
        EntityTx::ExtendCredit { counterparty, .. }
        | EntityTx::SetCreditLimit { counterparty, .. }
        | EntityTx::SettlePropose { counterparty, .. }
        | EntityTx::SettleUpdate { counterparty, .. }
        | EntityTx::SettleApprove { counterparty }
        | EntityTx::SettleReject { counterparty }
        | EntityTx::SettleExecute { counterparty }
        | EntityTx::DepositCollateral { counterparty, .. }
        | EntityTx::SendRebalanceQuote { counterparty, .. }
        | EntityTx::AcceptRebalanceQuote { counterparty, .. } => Some(*counterparty),
        EntityTx::DirectPayment { to, .. } => Some(*to),
        EntityTx::PlaceSwapOffer { hub, .. } | EntityTx::CancelSwapOffer { hub, .. } => Some(*hub),
        EntityTx::HandleAccountInput { from, .. } => Some(*from),
        _ => None,
    }
}
