//! Bilateral frame protocol.
//!
//! Two-party consensus on an edge: the side with queued txs proposes a frame,
//! the counterparty re-derives it from its own state, counter-signs, and both
//! commit. Exactly one pending frame per side; when both sides propose
//! concurrently the lower entity id wins and the higher side requeues.

pub mod apply;

use std::collections::BTreeMap;

use alloy::primitives::B256;

use gavel::types::hanko::Hanko;

use crate::errors::{AdmissionError, EngineError};
use crate::model::account::{
    AccountFrame, AccountInput, AccountMachine, AccountStatus, AccountTx, PendingAccountFrame,
};

pub use apply::{apply_tx, TxEffect};

/// Hanko provisioning for the two-phase entity apply: the dry run collects
/// the digests that will need signatures; the commit run looks the finished
/// hankos up. Both phases must walk identical code paths.
pub enum HankoCtx<'a> {
    Collect(&'a mut Vec<B256>),
    Provide(&'a BTreeMap<B256, Hanko>),
}

impl HankoCtx<'_> {
    pub fn hanko_for(&mut self, digest: B256) -> Hanko {
        match self {
            HankoCtx::Collect(requests) => {
                requests.push(digest);
                Hanko::new()
            }
            HankoCtx::Provide(map) => map.get(&digest).cloned().unwrap_or_default(),
        }
    }
}

/// Outcome of handling one wire input on an edge.
#[derive(Debug, Default)]
pub struct InputOutcome {
    /// Replies to send back to the counterparty.
    pub replies: Vec<AccountInput>,
    /// Side effects of txs that committed while handling the input.
    pub effects: Vec<TxEffect>,
    /// True when a frame committed (either direction).
    pub committed: bool,
}

/// Drop mempool entries that duplicate already-committed bilateral claims.
fn purge_committed_claims(machine: &mut AccountMachine) {
    let chain: Vec<(u64, u32)> = machine
        .j_event_chain
        .iter()
        .map(|r| (r.block_number, r.log_index))
        .collect();
    machine.mempool.retain(|tx| match tx {
        AccountTx::JEventClaim { record, .. } => {
            !chain.contains(&(record.block_number, record.log_index))
        }
        _ => true,
    });
}

/// Apply a list of txs to a machine, bumping the height and refreshing the
/// proof header. Used tentatively (on a clone) and at commit.
fn apply_frame_txs(
    machine: &mut AccountMachine,
    txs: &[AccountTx],
    viewer_is_left: bool,
) -> Result<Vec<TxEffect>, EngineError> {
    let mut effects = Vec::new();
    for tx in txs {
        apply_tx(machine, tx, viewer_is_left, &mut effects)?;
    }
    machine.current_height += 1;
    machine.verify_invariants()?;
    machine.proof_header = machine.next_proof_header()?;
    Ok(effects)
}

/// Build and send the next frame when this side has work queued and no frame
/// in flight. Returns the PROPOSE to route to the counterparty.
pub fn maybe_propose(
    machine: &mut AccountMachine,
    viewer_is_left: bool,
    hanko_ctx: &mut HankoCtx<'_>,
) -> Result<Option<AccountInput>, EngineError> {
    purge_committed_claims(machine);
    if machine.status != AccountStatus::Active
        || machine.mempool.is_empty()
        || machine.pending_frame.is_some()
    {
        return Ok(None);
    }

    let candidates: Vec<AccountTx> = std::mem::take(&mut machine.mempool);
    let prev_state_hash = machine.state_hash()?;
    let frame_id = machine.current_height + 1;

    // Keep only txs that still apply on top of each other; a queued tx that
    // went stale (capacity consumed, workspace gone) is dropped, its payment
    // hold released, never proposed.
    let mut scratch = machine.clone();
    let mut txs: Vec<AccountTx> = Vec::new();
    for tx in candidates {
        let mut attempt = scratch.clone();
        let mut discard = Vec::new();
        match apply_tx(&mut attempt, &tx, viewer_is_left, &mut discard)
            .and_then(|()| Ok(attempt.verify_invariants()?))
        {
            Ok(()) => {
                scratch = attempt;
                txs.push(tx);
            }
            Err(_) => {
                if let AccountTx::DirectTransfer {
                    token_id,
                    amount,
                    from_left,
                    ..
                } = &tx
                {
                    let delta = machine.delta_mut(*token_id);
                    let hold = if *from_left {
                        &mut delta.left_hold
                    } else {
                        &mut delta.right_hold
                    };
                    *hold = hold.saturating_sub(*amount);
                }
            }
        }
    }
    if txs.is_empty() {
        return Ok(None);
    }

    let mut post = machine.clone();
    if let Err(e) = apply_frame_txs(&mut post, &txs, viewer_is_left) {
        machine.mempool = txs;
        return Err(e);
    }
    let post_state_hash = post.state_hash()?;
    let post_proof = post.proof_header;

    let our_hanko = hanko_ctx.hanko_for(machine.proof_digest(&post_proof)?);

    machine.pending_frame = Some(PendingAccountFrame {
        frame_id,
        prev_state_hash,
        txs: txs.clone(),
        post_state_hash,
        post_proof,
        our_hanko: our_hanko.clone(),
    });

    Ok(Some(AccountInput::Propose {
        frame_id,
        prev_state_hash,
        txs,
        post_state_hash,
        post_proof,
        proposer_hanko: our_hanko,
    }))
}

/// Handle one wire input from the counterparty.
pub fn handle_input(
    machine: &mut AccountMachine,
    viewer_is_left: bool,
    input: AccountInput,
    hanko_ctx: &mut HankoCtx<'_>,
) -> Result<InputOutcome, EngineError> {
    let mut outcome = InputOutcome::default();

    if machine.status == AccountStatus::Disputed {
        // Frozen: nothing bilateral is accepted until the dispute resolves.
        return Ok(outcome);
    }

    match input {
        AccountInput::Propose {
            frame_id,
            prev_state_hash,
            txs,
            post_state_hash,
            post_proof,
            proposer_hanko,
        } => {
            // Duplicate of the frame we already committed: replay the ACK.
            if frame_id == machine.current_height {
                if let Some((acked_id, acked_hash, acked_hanko)) = machine.last_ack.clone() {
                    if acked_id == frame_id {
                        outcome.replies.push(AccountInput::Ack {
                            frame_id,
                            state_hash: acked_hash,
                            hanko: acked_hanko,
                        });
                    }
                }
                return Ok(outcome);
            }

            if machine.pending_frame.is_some() {
                if viewer_is_left {
                    // Lower id wins: our frame stands; the peer's proposal is
                    // deferred until our pending frame resolves.
                    machine.pending_account_input = Some(AccountInput::Propose {
                        frame_id,
                        prev_state_hash,
                        txs,
                        post_state_hash,
                        post_proof,
                        proposer_hanko,
                    });
                    return Ok(outcome);
                }
                // Higher id yields: requeue our txs in front and adopt the
                // counterparty's frame.
                let pending = machine.pending_frame.take().unwrap();
                let mut requeued = pending.txs;
                requeued.extend(std::mem::take(&mut machine.mempool));
                machine.mempool = requeued;
            }

            if frame_id != machine.current_height + 1 {
                outcome.replies.push(AccountInput::Reject {
                    frame_id,
                    reason: format!(
                        "expected frame {} got {}",
                        machine.current_height + 1,
                        frame_id
                    ),
                });
                return Ok(outcome);
            }
            if prev_state_hash != machine.state_hash()? {
                outcome.replies.push(AccountInput::Reject {
                    frame_id,
                    reason: "previous state hash mismatch".into(),
                });
                return Ok(outcome);
            }

            // Re-derive the frame on our own state.
            let mut post = machine.clone();
            let effects = match apply_frame_txs(&mut post, &txs, viewer_is_left) {
                Ok(e) => e,
                Err(err) => {
                    outcome.replies.push(AccountInput::Reject {
                        frame_id,
                        reason: err.to_string(),
                    });
                    return Ok(outcome);
                }
            };
            let derived_hash = post.state_hash()?;
            if derived_hash != post_state_hash || post.proof_header != post_proof {
                outcome.replies.push(AccountInput::Reject {
                    frame_id,
                    reason: "re-derived frame differs".into(),
                });
                return Ok(outcome);
            }

            // Verify the proposer's threshold signature when we know their
            // validator set.
            let proof_digest = machine.proof_digest(&post_proof)?;
            if let Some(set) = &machine.counterparty_validators {
                if !proposer_hanko.verify(proof_digest, set) {
                    outcome.replies.push(AccountInput::Reject {
                        frame_id,
                        reason: "proposer hanko below threshold".into(),
                    });
                    return Ok(outcome);
                }
            }

            // Commit on our side.
            let our_hanko = hanko_ctx.hanko_for(proof_digest);
            let (left_hanko, right_hanko) = if viewer_is_left {
                (our_hanko.clone(), proposer_hanko.clone())
            } else {
                (proposer_hanko.clone(), our_hanko.clone())
            };
            *machine = post;
            machine.counterparty_dispute_proof_hanko = Some(proposer_hanko);
            machine.push_frame(AccountFrame {
                frame_id,
                prev_state_hash,
                txs,
                state_hash: derived_hash,
                proof_header: post_proof,
                left_hanko,
                right_hanko,
            });
            machine.last_ack = Some((frame_id, derived_hash, our_hanko.clone()));
            purge_committed_claims(machine);
            outcome.effects = effects;
            outcome.committed = true;
            outcome.replies.push(AccountInput::Ack {
                frame_id,
                state_hash: derived_hash,
                hanko: our_hanko,
            });
        }

        AccountInput::Ack {
            frame_id,
            state_hash,
            hanko,
        } => {
            let Some(pending) = machine.pending_frame.clone() else {
                return Ok(outcome);
            };
            if pending.frame_id != frame_id || pending.post_state_hash != state_hash {
                return Ok(outcome);
            }

            let proof_digest = machine.proof_digest(&pending.post_proof)?;
            if let Some(set) = &machine.counterparty_validators {
                if !hanko.verify(proof_digest, set) {
                    return Err(EngineError::ConsensusMismatch(
                        "counterparty ACK hanko below threshold".into(),
                    ));
                }
            }

            let prev_state_hash = machine.state_hash()?;
            let effects = apply_frame_txs(machine, &pending.txs, viewer_is_left)?;
            debug_assert_eq!(machine.state_hash()?, pending.post_state_hash);

            let (left_hanko, right_hanko) = if viewer_is_left {
                (pending.our_hanko.clone(), hanko.clone())
            } else {
                (hanko.clone(), pending.our_hanko.clone())
            };
            machine.counterparty_dispute_proof_hanko = Some(hanko);
            machine.push_frame(AccountFrame {
                frame_id,
                prev_state_hash,
                txs: pending.txs.clone(),
                state_hash: pending.post_state_hash,
                proof_header: pending.post_proof,
                left_hanko,
                right_hanko,
            });
            machine.pending_frame = None;
            outcome.effects = effects;
            outcome.committed = true;

            // A proposal deferred behind our pending frame replays now.
            if let Some(deferred) = machine.pending_account_input.take() {
                let deferred_outcome =
                    handle_input(machine, viewer_is_left, deferred, hanko_ctx)?;
                outcome.replies.extend(deferred_outcome.replies);
                outcome.effects.extend(deferred_outcome.effects);
                outcome.committed |= deferred_outcome.committed;
            }
        }

        AccountInput::Reject { frame_id, reason: _ } => {
            if let Some(pending) = machine.pending_frame.clone() {
                if pending.frame_id == frame_id {
                    let mut requeued = pending.txs;
                    requeued.extend(std::mem::take(&mut machine.mempool));
                    machine.mempool = requeued;
                    machine.pending_frame = None;
                }
            }
        }
    }

    Ok(outcome)
}

/// Unilateral freeze at dispute start: clears the in-flight handshake in the
/// same tick; queued txs stay parked in the mempool until the edge reopens.
pub fn freeze_for_dispute(machine: &mut AccountMachine) {
    if let Some(pending) = machine.pending_frame.take() {
        let mut requeued = pending.txs;
        requeued.extend(std::mem::take(&mut machine.mempool));
        machine.mempool = requeued;
    }
    machine.pending_account_input = None;
    machine.status = AccountStatus::Disputed;
}

/// Admission gate for queueing new bilateral work on an edge.
pub fn check_active(machine: &AccountMachine) -> Result<(), EngineError> {
    match machine.status {
        AccountStatus::Active => Ok(()),
        AccountStatus::Disputed => Err(EngineError::DisputeGate {
            counterparty: format!("{}", machine.right_entity),
        }),
        AccountStatus::Closed => Err(AdmissionError::Other("account closed".into()).into()),
    }
}
