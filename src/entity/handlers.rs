//! Entity-tx handlers.
//!
//! Each handler is a pure function of `(state, tx)`: it mutates the entity
//! state, queues bilateral txs on account machines, and records cross-entity
//! messages and jurisdiction submissions in the apply context. Dispatch is a
//! single match; every replica of the entity runs the same handlers in the
//! same order and lands on the same state.

use alloy::primitives::{B256, U256};

use gavel::types::batch::{DisputeFinalizeOp, DisputeStartOp, ReserveToCollateralOp, SettlementOp};
use gavel::types::events::{JEvent, JEventRecord};

use crate::account::{self, apply::TxEffect, HankoCtx};
use crate::errors::{AdmissionError, EngineError};
use crate::hash;
use crate::model::account::{AccountInput, AccountMachine, AccountStatus, AccountTx, DisputeRecord};
use crate::model::entity::{BatchRecord, BatchStatus, EntityState, EntityTx, HubConfig, RebalancePolicy};
use crate::model::ids::{is_left, EntityId, TokenId};
use crate::model::offer::SwapOffer;
use crate::model::workspace::{counterparty_non_negative, SettlementWorkspace};
use crate::orderbook::{MatchFill, Orderbook};

/// A flushed jurisdiction batch awaiting driver submission.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QueuedBatch {
    pub entity: EntityId,
    pub nonce: u64,
    pub batch: gavel::types::batch::JBatch,
    pub hanko: Vec<u8>,
}

/// Mutable context threaded through one frame's application.
pub struct ApplyCtx<'a, 'b> {
    pub now: u64,
    pub hanko_ctx: &'a mut HankoCtx<'b>,
    /// Bilateral messages to peer entities, emitted by the proposer.
    pub peer_msgs: &'a mut Vec<(EntityId, AccountInput)>,
    /// Batches flushed to the jurisdiction mempool.
    pub j_submits: &'a mut Vec<QueuedBatch>,
    pub logs: &'a mut Vec<String>,
}

fn machine_mut<'s>(
    state: &'s mut EntityState,
    counterparty: EntityId,
) -> Result<&'s mut AccountMachine, EngineError> {
    if state.accounts.contains_key(&counterparty) {
        Ok(state.accounts.get_mut(&counterparty).unwrap())
    } else {
        Err(AdmissionError::UnknownAccount {
            counterparty: format!("{counterparty}"),
        }
        .into())
    }
}

fn queue_on_edge(
    state: &mut EntityState,
    counterparty: EntityId,
    tx: AccountTx,
) -> Result<(), EngineError> {
    let machine = machine_mut(state, counterparty)?;
    account::check_active(machine)?;
    machine.mempool.push(tx);
    Ok(())
}

/// Queue an outbound transfer, reserving the amount as a payment hold.
fn queue_transfer(
    state: &mut EntityState,
    counterparty: EntityId,
    token_id: TokenId,
    amount: U256,
    route: Vec<EntityId>,
    payment_id: B256,
) -> Result<(), EngineError> {
    let me = state.entity_id;
    let machine = machine_mut(state, counterparty)?;
    account::check_active(machine)?;
    let me_is_left = machine.viewer_is_left(me);
    {
        let delta = machine.delta_mut(token_id);
        let capacity = delta.derive(me_is_left).out_capacity;
        if capacity < amount {
            return Err(AdmissionError::InsufficientCapacity {
                counterparty: format!("{counterparty}"),
                have: capacity.to_string(),
                need: amount.to_string(),
            }
            .into());
        }
        if me_is_left {
            delta.left_hold += amount;
        } else {
            delta.right_hold += amount;
        }
    }
    machine.mempool.push(AccountTx::DirectTransfer {
        token_id,
        amount,
        from_left: me_is_left,
        route,
        payment_id,
    });
    Ok(())
}

/// One-hub relay heuristic when the caller gave no explicit route: pick the
/// first direct counterparty (in id order) with enough outbound capacity.
/// Multi-hop discovery beyond that is routing policy, not protocol.
fn resolve_first_hop(
    state: &EntityState,
    to: EntityId,
    token_id: TokenId,
    amount: U256,
    route: &[EntityId],
) -> Result<(EntityId, Vec<EntityId>), EngineError> {
    if let Some(first) = route.first() {
        let mut rest: Vec<EntityId> = route[1..].to_vec();
        rest.push(to);
        return Ok((*first, rest));
    }
    if state.accounts.contains_key(&to) {
        return Ok((to, Vec::new()));
    }
    let me = state.entity_id;
    for (cp, machine) in &state.accounts {
        if machine.status != AccountStatus::Active {
            continue;
        }
        let me_is_left = is_left(me, *cp);
        if let Some(delta) = machine.delta(token_id) {
            if delta.derive(me_is_left).out_capacity >= amount {
                return Ok((*cp, vec![to]));
            }
        }
    }
    Err(AdmissionError::NoRoute {
        target: format!("{to}"),
    }
    .into())
}

pub fn apply_entity_tx(
    state: &mut EntityState,
    tx: &EntityTx,
    ctx: &mut ApplyCtx<'_, '_>,
) -> Result<(), EngineError> {
    let me = state.entity_id;
    match tx {
        EntityTx::OpenAccount {
            counterparty,
            counterparty_validators,
        } => {
            if state.accounts.contains_key(counterparty) {
                return Err(AdmissionError::AccountExists {
                    counterparty: format!("{counterparty}"),
                }
                .into());
            }
            let mut machine = AccountMachine::new(me, *counterparty);
            machine.counterparty_validators = counterparty_validators.clone();
            state.accounts.insert(*counterparty, machine);
        }

        EntityTx::ExtendCredit {
            counterparty,
            token_id,
            amount,
        } => {
            let from_left = is_left(me, *counterparty);
            queue_on_edge(
                state,
                *counterparty,
                AccountTx::ExtendCredit {
                    token_id: *token_id,
                    amount: *amount,
                    from_left,
                },
            )?;
        }

        EntityTx::SetCreditLimit {
            counterparty,
            token_id,
            limit,
        } => {
            let from_left = is_left(me, *counterparty);
            queue_on_edge(
                state,
                *counterparty,
                AccountTx::SetCreditLimit {
                    token_id: *token_id,
                    limit: *limit,
                    from_left,
                },
            )?;
        }

        EntityTx::DirectPayment {
            to,
            token_id,
            amount,
            route,
        } => {
            let (hop, wire_route) = resolve_first_hop(state, *to, *token_id, *amount, route)?;
            let payment_id = hash::digest(&(me, state.payment_seq, *token_id, *amount))?;
            state.payment_seq += 1;
            queue_transfer(state, hop, *token_id, *amount, wire_route, payment_id)?;
        }

        EntityTx::SettlePropose { counterparty, ops } => {
            let from_left = is_left(me, *counterparty);
            let machine = machine_mut(state, *counterparty)?;
            account::check_active(machine)?;
            if machine.settlement_workspace.is_some() {
                return Err(AdmissionError::WorkspaceExists {
                    counterparty: format!("{counterparty}"),
                }
                .into());
            }
            let ws = SettlementWorkspace::propose(ops.clone(), from_left);
            let digest = ws.digest(
                machine.left_entity,
                machine.right_entity,
                machine.on_chain_settlement_nonce + 1,
            )?;
            let hanko = ctx.hanko_ctx.hanko_for(digest);
            machine.mempool.push(AccountTx::SettlePropose {
                ops: ops.clone(),
                from_left,
                hanko,
            });
        }

        EntityTx::SettleUpdate { counterparty, ops } => {
            let from_left = is_left(me, *counterparty);
            let machine = machine_mut(state, *counterparty)?;
            account::check_active(machine)?;
            let current = machine.settlement_workspace.clone().ok_or(
                AdmissionError::WorkspaceMissing {
                    counterparty: format!("{counterparty}"),
                },
            )?;
            let mut next = current;
            next.update(ops.clone(), from_left);
            let digest = next.digest(
                machine.left_entity,
                machine.right_entity,
                machine.on_chain_settlement_nonce + 1,
            )?;
            let hanko = ctx.hanko_ctx.hanko_for(digest);
            machine.mempool.push(AccountTx::SettleUpdate {
                ops: ops.clone(),
                from_left,
                hanko,
            });
        }

        EntityTx::SettleApprove { counterparty } => {
            let from_left = is_left(me, *counterparty);
            let machine = machine_mut(state, *counterparty)?;
            account::check_active(machine)?;
            let ws = machine.settlement_workspace.clone().ok_or(
                AdmissionError::WorkspaceMissing {
                    counterparty: format!("{counterparty}"),
                },
            )?;
            let digest = ws.digest(
                machine.left_entity,
                machine.right_entity,
                machine.on_chain_settlement_nonce + 1,
            )?;
            let hanko = ctx.hanko_ctx.hanko_for(digest);
            machine
                .mempool
                .push(AccountTx::SettleApprove { from_left, hanko });
        }

        EntityTx::SettleReject { counterparty } => {
            let from_left = is_left(me, *counterparty);
            queue_on_edge(state, *counterparty, AccountTx::SettleReject { from_left })?;
        }

        EntityTx::SettleExecute { counterparty } => {
            let from_left = is_left(me, *counterparty);
            queue_on_edge(state, *counterparty, AccountTx::SettleExecute { from_left })?;
        }

        EntityTx::SetRebalancePolicy {
            token_id,
            soft_limit,
            hard_limit,
            max_acceptable_fee,
        } => {
            state.rebalance_policies.insert(
                *token_id,
                RebalancePolicy {
                    soft_limit: *soft_limit,
                    hard_limit: *hard_limit,
                    max_acceptable_fee: *max_acceptable_fee,
                },
            );
            // Exposure accrued before the policy existed triggers right away.
            let counterparties: Vec<EntityId> = state.accounts.keys().copied().collect();
            for cp in counterparties {
                check_rebalance_trigger(state, cp);
            }
        }

        EntityTx::SetHubConfig {
            fee_ppm,
            base_fee,
            scan_interval_ms,
        } => {
            state.hub_config = Some(HubConfig {
                fee_ppm: *fee_ppm,
                base_fee: *base_fee,
                scan_interval_ms: *scan_interval_ms,
            });
            state.hub_last_scan = ctx.now;
        }

        EntityTx::DepositCollateral {
            counterparty,
            token_id,
            amount,
        } => {
            machine_mut(state, *counterparty)?;
            let available = state.reserve_available(*token_id);
            if available < *amount {
                return Err(AdmissionError::InsufficientReserve {
                    token_id: *token_id,
                    have: available.to_string(),
                    need: amount.to_string(),
                }
                .into());
            }
            state
                .j_batch
                .building
                .reserve_to_collateral
                .push(ReserveToCollateralOp {
                    counterparty: *counterparty,
                    token_id: *token_id,
                    amount: *amount,
                });
        }

        EntityTx::SendRebalanceQuote {
            counterparty,
            token_id,
            amount,
            fee,
        } => {
            let from_left = is_left(me, *counterparty);
            queue_on_edge(
                state,
                *counterparty,
                AccountTx::RebalanceQuote {
                    token_id: *token_id,
                    amount: *amount,
                    fee: *fee,
                    from_left,
                },
            )?;
        }

        EntityTx::AcceptRebalanceQuote {
            counterparty,
            token_id,
            amount,
            fee,
        } => {
            let from_left = is_left(me, *counterparty);
            if let Some(policy) = state.rebalance_policies.get(token_id) {
                if *fee > policy.max_acceptable_fee {
                    return Err(AdmissionError::Other(format!(
                        "quoted fee {fee} above acceptable {}",
                        policy.max_acceptable_fee
                    ))
                    .into());
                }
            }
            queue_on_edge(
                state,
                *counterparty,
                AccountTx::AcceptRebalanceQuote {
                    token_id: *token_id,
                    amount: *amount,
                    fee: *fee,
                    from_left,
                },
            )?;
        }

        EntityTx::InitOrderbookExt { pairs } => {
            state.orderbook = Some(Orderbook::new(pairs));
        }

        EntityTx::PlaceSwapOffer {
            hub,
            give_token,
            give_amount,
            want_token,
            want_amount,
            min_fill_ratio,
        } => {
            let machine = machine_mut(state, *hub)?;
            account::check_active(machine)?;
            let me_is_left = machine.viewer_is_left(me);
            let offer_id = machine.offer_seq * 2 + if me_is_left { 0 } else { 1 };
            machine.offer_seq += 1;
            let offer = SwapOffer {
                offer_id,
                owner: me,
                give_token: *give_token,
                give_amount: *give_amount,
                want_token: *want_token,
                want_amount: *want_amount,
                min_fill_ratio: *min_fill_ratio,
                quantized_give: U256::ZERO,
                quantized_want: U256::ZERO,
            }
            .quantize()
            .ok_or(AdmissionError::OfferBelowLot)?;
            let capacity = machine
                .delta_mut(*give_token)
                .derive(me_is_left)
                .out_capacity;
            if capacity < offer.quantized_give {
                return Err(AdmissionError::InsufficientCapacity {
                    counterparty: format!("{hub}"),
                    have: capacity.to_string(),
                    need: offer.quantized_give.to_string(),
                }
                .into());
            }
            machine.mempool.push(AccountTx::PlaceSwapOffer {
                offer,
                from_left: me_is_left,
            });
        }

        EntityTx::CancelSwapOffer { hub, offer_id } => {
            let from_left = is_left(me, *hub);
            let machine = machine_mut(state, *hub)?;
            account::check_active(machine)?;
            let offer = machine
                .swap_offers
                .get(offer_id)
                .ok_or(AdmissionError::OfferMissing { offer_id: *offer_id })?;
            if offer.owner != me {
                return Err(AdmissionError::OfferNotOwned { offer_id: *offer_id }.into());
            }
            machine.mempool.push(AccountTx::CancelSwapOffer {
                offer_id: *offer_id,
                from_left,
            });
        }

        EntityTx::DisputeStart { counterparty } => {
            let j_block = state.j_block;
            let machine = machine_mut(state, *counterparty)?;
            account::check_active(machine)?;
            let Some(hanko) = machine.counterparty_dispute_proof_hanko.clone() else {
                return Err(AdmissionError::Other(
                    "no counter-signed proof to dispute with".into(),
                )
                .into());
            };
            let proof = machine.proof_header;
            let token_ids: Vec<TokenId> =
                machine.revealed_deltas().iter().map(|r| r.token_id).collect();
            let challenger_is_left = machine.viewer_is_left(me);
            account::freeze_for_dispute(machine);
            machine.active_dispute = Some(DisputeRecord {
                started_block: j_block,
                timeout_block: 0,
                challenger_is_left,
                proof_nonce: proof.nonce,
                finalized: false,
            });
            let encoded = hanko
                .encode()
                .map_err(|e| EngineError::Encoding(e.to_string()))?;
            state.j_batch.building.dispute_starts.push(DisputeStartOp {
                counterparty: *counterparty,
                proof,
                token_ids,
                counterparty_hanko: encoded,
            });
        }

        EntityTx::DisputeFinalize { counterparty } => {
            let j_block = state.j_block;
            let machine = machine_mut(state, *counterparty)?;
            let Some(dispute) = &machine.active_dispute else {
                return Err(AdmissionError::DisputeMissing {
                    counterparty: format!("{counterparty}"),
                }
                .into());
            };
            if dispute.timeout_block == 0 || j_block < dispute.timeout_block {
                return Err(AdmissionError::DisputeNotTimedOut {
                    block: j_block,
                    timeout: dispute.timeout_block,
                }
                .into());
            }
            let revealed = machine.revealed_deltas();
            state
                .j_batch
                .building
                .dispute_finalizes
                .push(DisputeFinalizeOp {
                    counterparty: *counterparty,
                    revealed,
                });
        }

        EntityTx::ReopenDisputed { counterparty } => {
            let machine = machine_mut(state, *counterparty)?;
            if machine.status != AccountStatus::Disputed {
                return Err(AdmissionError::DisputeMissing {
                    counterparty: format!("{counterparty}"),
                }
                .into());
            }
            let finalized = machine
                .active_dispute
                .as_ref()
                .map(|d| d.finalized)
                .unwrap_or(false);
            if !finalized {
                return Err(AdmissionError::DisputeNotFinalized {
                    counterparty: format!("{counterparty}"),
                }
                .into());
            }
            machine.active_dispute = None;
            machine.status = AccountStatus::Active;
        }

        EntityTx::JBroadcast => {
            if state.j_batch.pending_broadcast {
                return Err(AdmissionError::BroadcastPending.into());
            }
            if state.j_batch.building.is_empty() {
                return Err(AdmissionError::EmptyBatch.into());
            }
            let mut batch = std::mem::take(&mut state.j_batch.building);
            batch.nonce = state.j_nonce_confirmed + 1;
            let digest = batch
                .digest()
                .map_err(|e| EngineError::Encoding(e.to_string()))?;
            let hanko = ctx.hanko_ctx.hanko_for(digest);
            let encoded = hanko
                .encode()
                .map_err(|e| EngineError::Encoding(e.to_string()))?;
            state.batch_history.push(BatchRecord {
                nonce: batch.nonce,
                op_count: batch.op_count(),
                status: BatchStatus::Pending,
                tx_hash: None,
            });
            state.j_batch.in_flight = Some(batch.clone());
            state.j_batch.pending_broadcast = true;
            ctx.j_submits.push(QueuedBatch {
                entity: me,
                nonce: batch.nonce,
                batch,
                hanko: encoded,
            });
        }

        EntityTx::JBatchAck {
            nonce,
            status,
            tx_hash,
        } => {
            if let Some(record) = state
                .batch_history
                .iter_mut()
                .rev()
                .find(|r| r.nonce == *nonce)
            {
                record.status = *status;
                record.tx_hash = *tx_hash;
            }
            match status {
                BatchStatus::Confirmed => {
                    state.j_nonce_confirmed = state.j_nonce_confirmed.max(*nonce);
                    state.j_batch.in_flight = None;
                    state.j_batch.pending_broadcast = false;
                }
                BatchStatus::Rejected => {
                    // The batch content survives for retry with the same nonce.
                    if let Some(mut stale) = state.j_batch.in_flight.take() {
                        let building = std::mem::take(&mut state.j_batch.building);
                        stale.settlements.extend(building.settlements);
                        stale
                            .reserve_to_collateral
                            .extend(building.reserve_to_collateral);
                        stale
                            .collateral_to_reserve
                            .extend(building.collateral_to_reserve);
                        stale.dispute_starts.extend(building.dispute_starts);
                        stale.dispute_finalizes.extend(building.dispute_finalizes);
                        stale.nonce = 0;
                        state.j_batch.building = stale;
                    }
                    state.j_batch.pending_broadcast = false;
                }
                BatchStatus::Pending => {}
            }
        }

        EntityTx::JEventClaim { record } => {
            apply_j_event(state, record, ctx)?;
        }

        EntityTx::ObserveJBlock { block } => {
            state.j_block = state.j_block.max(*block);
        }

        EntityTx::MintReserves { token_id, amount } => {
            let entry = state.reserves.entry(*token_id).or_default();
            *entry += *amount;
        }

        EntityTx::HandleAccountInput { from, input } => {
            let me_is_left = is_left(me, *from);
            if !state.accounts.contains_key(from) {
                state.accounts.insert(*from, AccountMachine::new(me, *from));
            }
            let machine = state.accounts.get_mut(from).unwrap();
            let outcome = account::handle_input(machine, me_is_left, input.clone(), ctx.hanko_ctx)?;
            for reply in outcome.replies {
                ctx.peer_msgs.push((*from, reply));
            }
            if outcome.committed {
                process_effects(state, *from, outcome.effects, ctx)?;
                check_rebalance_trigger(state, *from);
            }
        }

        EntityTx::HubRebalanceScan => {
            hub_rebalance_scan(state, ctx)?;
        }
    }
    Ok(())
}

/// Hub crontab body: fund every edge with an outstanding collateral request,
/// bounded by available reserve, directly from reserve to collateral. No
/// C->R, no workspace churn on this path.
fn hub_rebalance_scan(state: &mut EntityState, ctx: &mut ApplyCtx<'_, '_>) -> Result<(), EngineError> {
    state.hub_last_scan = ctx.now;
    let counterparties: Vec<EntityId> = state.accounts.keys().copied().collect();
    for cp in counterparties {
        let requests: Vec<(TokenId, U256)> = {
            let machine = state.accounts.get(&cp).unwrap();
            if machine.status != AccountStatus::Active {
                continue;
            }
            machine
                .requested_rebalance
                .iter()
                .map(|(t, a)| (*t, *a))
                .collect()
        };
        for (token_id, amount) in requests {
            if amount.is_zero() {
                continue;
            }
            let already_queued = state
                .j_batch
                .building
                .reserve_to_collateral
                .iter()
                .chain(
                    state
                        .j_batch
                        .in_flight
                        .iter()
                        .flat_map(|b| b.reserve_to_collateral.iter()),
                )
                .any(|op| op.counterparty == cp && op.token_id == token_id);
            if already_queued {
                continue;
            }
            let available = state.reserve_available(token_id);
            if available < amount {
                ctx.logs.push(format!(
                    "rebalance: reserve short for {cp} token {token_id} (have {available}, need {amount})"
                ));
                continue;
            }
            state
                .j_batch
                .building
                .reserve_to_collateral
                .push(ReserveToCollateralOp {
                    counterparty: cp,
                    token_id,
                    amount,
                });
            ctx.logs
                .push(format!("rebalance: queued r2c {amount} for {cp} token {token_id}"));
        }
    }
    Ok(())
}

/// Spoke-side trigger: after a commit on an edge, ask the counterparty for
/// collateral when our unsecured exposure exceeds the published soft limit.
fn check_rebalance_trigger(state: &mut EntityState, counterparty: EntityId) {
    let me = state.entity_id;
    let policies = state.rebalance_policies.clone();
    let Some(machine) = state.accounts.get_mut(&counterparty) else {
        return;
    };
    if machine.status != AccountStatus::Active {
        return;
    }
    let me_is_left = machine.viewer_is_left(me);
    for (token_id, policy) in policies {
        let exposure = match machine.delta(token_id) {
            Some(delta) => delta.unsecured_claim(me_is_left),
            None => continue,
        };
        if exposure <= policy.soft_limit {
            continue;
        }
        if machine
            .requested_rebalance
            .get(&token_id)
            .is_some_and(|a| !a.is_zero())
        {
            continue;
        }
        let already_queued = machine.mempool.iter().chain(
            machine.pending_frame.iter().flat_map(|p| p.txs.iter()),
        ).any(|tx| {
            matches!(tx, AccountTx::RequestCollateral { token_id: t, .. } if *t == token_id)
        });
        if already_queued {
            continue;
        }
        let amount = exposure.min(policy.hard_limit);
        machine.mempool.push(AccountTx::RequestCollateral {
            token_id,
            amount,
            from_left: me_is_left,
        });
    }
}

/// Ingest one finalized chain event. Entity-scoped effects apply here;
/// edge-scoped effects go through the bilateral claim feed unless the edge is
/// frozen by a dispute, in which case they apply directly (the chain is the
/// arbiter both sides read).
fn apply_j_event(
    state: &mut EntityState,
    record: &JEventRecord,
    ctx: &mut ApplyCtx<'_, '_>,
) -> Result<(), EngineError> {
    let key = (record.block_number, record.log_index);
    if state.seen_j_events.contains(&key) {
        return Ok(());
    }
    state.seen_j_events.insert(key);
    state.j_block = state.j_block.max(record.block_number);
    let me = state.entity_id;

    match &record.event {
        JEvent::ReserveUpdated {
            entity,
            token_id,
            new_amount,
        } => {
            if *entity == me {
                state.reserves.insert(*token_id, *new_amount);
            }
        }

        JEvent::CollateralUpdated { left, right, .. }
        | JEvent::SettlementProcessed { left, right, .. } => {
            let Some(cp) = peer_of(me, *left, *right) else {
                return Ok(());
            };
            let me_is_left = me == *left;
            if let Some(machine) = state.accounts.get_mut(&cp) {
                if machine.status == AccountStatus::Disputed {
                    // Frozen edge: no bilateral frames; nothing to apply here,
                    // the dispute events carry the authoritative outcome.
                    ctx.logs
                        .push(format!("deferring settlement event on disputed edge {cp}"));
                } else {
                    machine.mempool.push(AccountTx::JEventClaim {
                        record: record.clone(),
                        from_left: me_is_left,
                    });
                }
            }
        }

        JEvent::DisputeStarted {
            left,
            right,
            dispute_timeout_block,
            challenger_is_left,
            ..
        } => {
            let Some(cp) = peer_of(me, *left, *right) else {
                return Ok(());
            };
            if let Some(machine) = state.accounts.get_mut(&cp) {
                if machine.status != AccountStatus::Disputed {
                    account::freeze_for_dispute(machine);
                }
                let proof_nonce = machine.proof_header.nonce;
                let dispute = machine.active_dispute.get_or_insert(DisputeRecord {
                    started_block: record.block_number,
                    timeout_block: 0,
                    challenger_is_left: *challenger_is_left,
                    proof_nonce,
                    finalized: false,
                });
                dispute.timeout_block = *dispute_timeout_block;
                dispute.challenger_is_left = *challenger_is_left;
            }
        }

        JEvent::DisputeFinalized {
            left,
            right,
            token_id,
            final_ondelta,
            ..
        } => {
            let Some(cp) = peer_of(me, *left, *right) else {
                return Ok(());
            };
            if let Some(machine) = state.accounts.get_mut(&cp) {
                {
                    let delta = machine.delta_mut(*token_id);
                    delta.ondelta = *final_ondelta;
                    delta.offdelta = alloy::primitives::I256::ZERO;
                    delta.collateral = U256::ZERO;
                    delta.collateral_hold = U256::ZERO;
                }
                if let Some(dispute) = machine.active_dispute.as_mut() {
                    if !dispute.finalized {
                        dispute.finalized = true;
                        machine.on_chain_settlement_nonce = dispute.proof_nonce;
                    }
                }
                // The edge reopens once the chain has spoken; the proof
                // header restarts above the settled nonce.
                machine.status = AccountStatus::Active;
                machine.active_dispute = None;
                machine.proof_header = machine.next_proof_header()?;
                ctx.logs.push(format!(
                    "dispute finalized on edge {cp}, token {token_id}"
                ));
            }
        }
    }
    Ok(())
}

fn peer_of(me: EntityId, left: EntityId, right: EntityId) -> Option<EntityId> {
    if me == left {
        Some(right)
    } else if me == right {
        Some(left)
    } else {
        None
    }
}

/// Interpret the side effects of a committed bilateral frame from this
/// entity's perspective.
fn process_effects(
    state: &mut EntityState,
    counterparty: EntityId,
    effects: Vec<TxEffect>,
    ctx: &mut ApplyCtx<'_, '_>,
) -> Result<(), EngineError> {
    let me = state.entity_id;
    for effect in effects {
        match effect {
            TxEffect::PaymentArrived {
                token_id,
                amount,
                route,
                payment_id,
                recipient_is_left,
            } => {
                let me_is_left = is_left(me, counterparty);
                if recipient_is_left != me_is_left {
                    continue;
                }
                if route.is_empty() {
                    ctx.logs
                        .push(format!("payment {payment_id} received: {amount} of token {token_id}"));
                    continue;
                }
                // Forward the next leg, net of our fee.
                let fee = state
                    .hub_config
                    .map(|c| c.fee_for(amount))
                    .unwrap_or_default();
                if fee >= amount {
                    ctx.logs
                        .push(format!("payment {payment_id} dropped: fee exceeds amount"));
                    continue;
                }
                let next = route[0];
                let rest = route[1..].to_vec();
                let forward = amount - fee;
                if let Err(e) =
                    queue_transfer(state, next, token_id, forward, rest, payment_id)
                {
                    ctx.logs
                        .push(format!("payment {payment_id} forwarding failed: {e}"));
                }
            }

            TxEffect::OfferPlaced {
                offer,
                placer_is_left,
            } => {
                let me_is_left = is_left(me, counterparty);
                if placer_is_left == me_is_left {
                    continue; // our own placement; the hub side runs the book
                }
                if state.orderbook.is_none() {
                    continue;
                }
                let placed = {
                    let book = state.orderbook.as_mut().unwrap();
                    book.place(&offer)
                };
                match placed {
                    Ok(fills) => {
                        for fill in fills {
                            queue_fill(state, &fill, ctx)?;
                        }
                    }
                    Err(e) => ctx
                        .logs
                        .push(format!("offer {} not booked: {e}", offer.offer_id)),
                }
            }

            TxEffect::OfferCancelled {
                offer_id,
                give_token,
                want_token,
                owner,
            } => {
                if owner == me {
                    continue;
                }
                if let Some(book) = state.orderbook.as_mut() {
                    book.cancel(owner, give_token, want_token, offer_id);
                }
            }

            TxEffect::WorkspaceChanged { modified_by_left } => {
                let me_is_left = is_left(me, counterparty);
                if modified_by_left == me_is_left {
                    continue;
                }
                let machine = state.accounts.get_mut(&counterparty).unwrap();
                let Some(ws) = machine.settlement_workspace.clone() else {
                    continue;
                };
                let diffs = ws.compile();
                if counterparty_non_negative(&diffs, me_is_left) {
                    let digest = ws.digest(
                        machine.left_entity,
                        machine.right_entity,
                        machine.on_chain_settlement_nonce + 1,
                    )?;
                    let hanko = ctx.hanko_ctx.hanko_for(digest);
                    machine.mempool.push(AccountTx::SettleApprove {
                        from_left: me_is_left,
                        hanko,
                    });
                }
            }

            TxEffect::WorkspaceExecuted {
                executor_is_left,
                diffs,
                left_hanko,
                right_hanko,
                consumes_nonce: _,
            } => {
                let me_is_left = is_left(me, counterparty);
                if executor_is_left != me_is_left {
                    continue;
                }
                let (left, right) = crate::model::ids::ordered_pair(me, counterparty);
                let left_bytes = left_hanko
                    .encode()
                    .map_err(|e| EngineError::Encoding(e.to_string()))?;
                let right_bytes = right_hanko
                    .encode()
                    .map_err(|e| EngineError::Encoding(e.to_string()))?;
                state.j_batch.building.settlements.push(SettlementOp {
                    left,
                    right,
                    diffs,
                    left_hanko: left_bytes,
                    right_hanko: right_bytes,
                });
            }

            TxEffect::QuoteAccepted {
                token_id,
                amount,
                acceptor_is_left,
            } => {
                let me_is_left = is_left(me, counterparty);
                if acceptor_is_left == me_is_left {
                    continue; // we accepted; the hub funds
                }
                let available = state.reserve_available(token_id);
                if available < amount {
                    ctx.logs.push(format!(
                        "quote funding short on reserve for {counterparty}: have {available}, need {amount}"
                    ));
                    continue;
                }
                state
                    .j_batch
                    .building
                    .reserve_to_collateral
                    .push(ReserveToCollateralOp {
                        counterparty,
                        token_id,
                        amount,
                    });
            }
        }
    }
    Ok(())
}

/// Turn one book fill into bilateral txs on the maker and taker edges. The
/// hub is the counterparty on both; base and quote legs transfer through it.
fn queue_fill(
    state: &mut EntityState,
    fill: &MatchFill,
    ctx: &mut ApplyCtx<'_, '_>,
) -> Result<(), EngineError> {
    let me = state.entity_id;
    // Which way does base flow? The ask owner gives base. The taker placed
    // the incoming offer; fills record base seller via maker/taker roles and
    // token orientation: the side whose offer gives base sells it.
    for (party, offer_id, sells_base) in [
        (fill.maker, fill.maker_offer_id, maker_sells_base(state, fill)),
        (fill.taker, fill.taker_offer_id, !maker_sells_base(state, fill)),
    ] {
        let machine = state
            .accounts
            .get_mut(&party)
            .ok_or(AdmissionError::UnknownAccount {
                counterparty: format!("{party}"),
            })?;
        let party_is_left = machine.viewer_is_left(party);
        let hub_is_left = !party_is_left;
        let (give_filled, want_filled) = if sells_base {
            (fill.base_amount, fill.quote_amount)
        } else {
            (fill.quote_amount, fill.base_amount)
        };
        machine.mempool.push(AccountTx::FillSwapOffer {
            offer_id,
            give_filled,
            want_filled,
        });
        // Party pays its give leg to the hub; the hub pays the want leg out.
        let (pay_token, pay_amount, recv_token, recv_amount) = if sells_base {
            (fill.base_token, fill.base_amount, fill.quote_token, fill.quote_amount)
        } else {
            (fill.quote_token, fill.quote_amount, fill.base_token, fill.base_amount)
        };
        let payment_id = hash::digest(&(me, party, offer_id, fill.base_amount))?;
        machine.mempool.push(AccountTx::DirectTransfer {
            token_id: pay_token,
            amount: pay_amount,
            from_left: party_is_left,
            route: Vec::new(),
            payment_id,
        });
        machine.mempool.push(AccountTx::DirectTransfer {
            token_id: recv_token,
            amount: recv_amount,
            from_left: hub_is_left,
            route: Vec::new(),
            payment_id,
        });
        ctx.logs.push(format!(
            "fill: {party} {} {} base for {} quote",
            if sells_base { "sold" } else { "bought" },
            fill.base_amount,
            fill.quote_amount
        ));
    }
    Ok(())
}

fn maker_sells_base(state: &EntityState, fill: &MatchFill) -> bool {
    // The maker rested before the taker crossed; the maker's offer gives base
    // exactly when the maker sits on the ask side, which is recorded by the
    // maker's resting offer on its edge.
    state
        .accounts
        .get(&fill.maker)
        .and_then(|m| m.swap_offers.get(&fill.maker_offer_id))
        .map(|o| o.give_token == fill.base_token)
        .unwrap_or(true)
}
