//! Account-tx application.
//!
//! `apply_tx` is the single transition function both sides run for every tx
//! in a frame; it must produce identical state on the two copies of the
//! machine. Side-dependent reactions (forwarding a payment, inserting an
//! offer into the hub book, enqueueing an executed settlement) are returned
//! as [`TxEffect`]s and interpreted by the owning entity after commit.

use alloy::primitives::{B256, I256, U256};

use gavel::types::batch::SettlementDiff;
use gavel::types::events::JEvent;
use gavel::types::hanko::Hanko;

use crate::errors::{AdmissionError, EngineError};
use crate::model::account::{AccountMachine, AccountTx};
use crate::model::ids::{EntityId, TokenId};
use crate::model::offer::{lot_size, SwapOffer};
use crate::model::workspace::{SettlementWorkspace, WorkspaceOp, WorkspaceStatus};

/// Side-dependent follow-ups produced by committed txs.
#[derive(Debug, Clone, PartialEq)]
pub enum TxEffect {
    /// A transfer landed with hops remaining; the receiving side forwards.
    PaymentArrived {
        token_id: TokenId,
        amount: U256,
        route: Vec<EntityId>,
        payment_id: B256,
        recipient_is_left: bool,
    },
    /// An offer was placed; the hub side runs matching.
    OfferPlaced { offer: SwapOffer, placer_is_left: bool },
    /// An offer was cancelled; the hub side removes it from the book.
    OfferCancelled {
        offer_id: u64,
        give_token: TokenId,
        want_token: TokenId,
        owner: EntityId,
    },
    /// A workspace was proposed or updated; the counterparty side decides
    /// whether the compiled diff auto-approves.
    WorkspaceChanged { modified_by_left: bool },
    /// A fully signed workspace was executed; the executor side enqueues the
    /// compiled diffs into its jurisdiction batch.
    WorkspaceExecuted {
        executor_is_left: bool,
        diffs: Vec<SettlementDiff>,
        left_hanko: Hanko,
        right_hanko: Hanko,
        consumes_nonce: u64,
    },
    /// A rebalance quote was accepted; the quoting (hub) side funds the edge.
    QuoteAccepted {
        token_id: TokenId,
        amount: U256,
        acceptor_is_left: bool,
    },
}

fn hold_of(machine: &mut AccountMachine, token_id: TokenId, left: bool) -> &mut U256 {
    let delta = machine.delta_mut(token_id);
    if left { &mut delta.left_hold } else { &mut delta.right_hold }
}

fn release_hold(machine: &mut AccountMachine, token_id: TokenId, left: bool, amount: U256) {
    let hold = hold_of(machine, token_id, left);
    *hold = hold.saturating_sub(amount);
}

/// Edge-capacity reservations for workspace ops. Only C->R withdrawals touch
/// the edge: the leaving collateral is pinned in `collateral_hold` and the
/// withdrawer's claim in its settle hold, so payments cannot double-spend
/// either while the settlement is in flight. R2C/R2R spend entity reserves,
/// which are earmarked at the entity layer, not here.
fn workspace_holds(machine: &mut AccountMachine, ops: &[WorkspaceOp], release: bool) {
    for op in ops {
        if let WorkspaceOp::C2r {
            token_id,
            amount,
            to_left,
        } = *op
        {
            let delta = machine.delta_mut(token_id);
            let settle_hold = if to_left {
                &mut delta.left_settle_hold
            } else {
                &mut delta.right_settle_hold
            };
            if release {
                *settle_hold = settle_hold.saturating_sub(amount);
                delta.collateral_hold = delta.collateral_hold.saturating_sub(amount);
            } else {
                *settle_hold += amount;
                delta.collateral_hold += amount;
            }
        }
    }
}

fn signed(v: U256) -> I256 {
    I256::try_from(v).unwrap_or(I256::MAX)
}

/// Apply one committed tx. `viewer_is_left` selects local-only bookkeeping
/// (payment hold release on the sender's copy); every hashed field mutates
/// identically on both sides.
pub fn apply_tx(
    machine: &mut AccountMachine,
    tx: &AccountTx,
    viewer_is_left: bool,
    effects: &mut Vec<TxEffect>,
) -> Result<(), EngineError> {
    match tx {
        AccountTx::DirectTransfer {
            token_id,
            amount,
            from_left,
            route,
            payment_id,
        } => {
            // Whatever the sender reserved for this transfer is spent now.
            // Symmetric on both copies; a copy that never added the hold
            // saturates at zero.
            release_hold(machine, *token_id, *from_left, *amount);
            let delta = machine.delta_mut(*token_id);
            let capacity = delta.derive(*from_left).out_capacity;
            if capacity < *amount {
                return Err(AdmissionError::InsufficientCapacity {
                    counterparty: String::new(),
                    have: capacity.to_string(),
                    need: amount.to_string(),
                }
                .into());
            }
            if *from_left {
                delta.offdelta -= signed(*amount);
            } else {
                delta.offdelta += signed(*amount);
            }
            if viewer_is_left != *from_left {
                effects.push(TxEffect::PaymentArrived {
                    token_id: *token_id,
                    amount: *amount,
                    route: route.clone(),
                    payment_id: *payment_id,
                    recipient_is_left: !*from_left,
                });
            }
        }

        AccountTx::ExtendCredit {
            token_id,
            amount,
            from_left,
        } => {
            let delta = machine.delta_mut(*token_id);
            if *from_left {
                delta.left_credit_limit += *amount;
            } else {
                delta.right_credit_limit += *amount;
            }
        }

        AccountTx::SetCreditLimit {
            token_id,
            limit,
            from_left,
        } => {
            let delta = machine.delta_mut(*token_id);
            if *from_left {
                delta.left_credit_limit = *limit;
            } else {
                delta.right_credit_limit = *limit;
            }
        }

        AccountTx::SettlePropose {
            ops,
            from_left,
            hanko,
        } => {
            if machine.settlement_workspace.is_some() {
                return Err(AdmissionError::WorkspaceExists {
                    counterparty: String::new(),
                }
                .into());
            }
            let mut ws = SettlementWorkspace::propose(ops.clone(), *from_left);
            ws.attach_hanko(*from_left, hanko.clone());
            workspace_holds(machine, ops, false);
            machine.settlement_workspace = Some(ws);
            effects.push(TxEffect::WorkspaceChanged {
                modified_by_left: *from_left,
            });
        }

        AccountTx::SettleUpdate {
            ops,
            from_left,
            hanko,
        } => {
            let ws = machine
                .settlement_workspace
                .clone()
                .ok_or(AdmissionError::WorkspaceMissing {
                    counterparty: String::new(),
                })?;
            if ws.last_modified_by_left == *from_left {
                return Err(AdmissionError::WorkspaceWrongTurn.into());
            }
            if ws.status == WorkspaceStatus::Submitted {
                return Err(AdmissionError::WorkspaceNotReady("already submitted".into()).into());
            }
            workspace_holds(machine, &ws.ops, true);
            workspace_holds(machine, ops, false);
            let mut ws = ws;
            ws.update(ops.clone(), *from_left);
            ws.attach_hanko(*from_left, hanko.clone());
            machine.settlement_workspace = Some(ws);
            effects.push(TxEffect::WorkspaceChanged {
                modified_by_left: *from_left,
            });
        }

        AccountTx::SettleApprove { from_left, hanko } => {
            let ws = machine
                .settlement_workspace
                .as_mut()
                .ok_or(AdmissionError::WorkspaceMissing {
                    counterparty: String::new(),
                })?;
            if ws.last_modified_by_left == *from_left {
                return Err(AdmissionError::WorkspaceWrongTurn.into());
            }
            ws.attach_hanko(*from_left, hanko.clone());
        }

        AccountTx::SettleReject { from_left } => {
            let ws = machine
                .settlement_workspace
                .clone()
                .ok_or(AdmissionError::WorkspaceMissing {
                    counterparty: String::new(),
                })?;
            if ws.last_modified_by_left == *from_left {
                return Err(AdmissionError::WorkspaceWrongTurn.into());
            }
            workspace_holds(machine, &ws.ops, true);
            machine.settlement_workspace = None;
        }

        AccountTx::SettleExecute { from_left } => {
            let ws = machine
                .settlement_workspace
                .clone()
                .ok_or(AdmissionError::WorkspaceMissing {
                    counterparty: String::new(),
                })?;
            if !ws.both_signed() {
                return Err(
                    AdmissionError::WorkspaceNotReady("both hankos required".into()).into(),
                );
            }
            let diffs = ws.compile();
            for d in &diffs {
                if !d.conserves() {
                    return Err(crate::errors::InvariantError::ConservationViolated {
                        token_id: d.token_id,
                    }
                    .into());
                }
            }
            // C->R holds stay pinned until the settlement lands on-chain;
            // the processed-settlement claim releases them.
            let consumes_nonce = machine.on_chain_settlement_nonce + 1;
            machine.pending_settlement_comp =
                Some((consumes_nonce, ws.offdelta_compensation()));
            machine.settlement_workspace = None;
            effects.push(TxEffect::WorkspaceExecuted {
                executor_is_left: *from_left,
                diffs,
                left_hanko: ws.left_hanko.clone().unwrap_or_default(),
                right_hanko: ws.right_hanko.clone().unwrap_or_default(),
                consumes_nonce,
            });
        }

        AccountTx::PlaceSwapOffer { offer, from_left } => {
            if machine.swap_offers.contains_key(&offer.offer_id) {
                return Err(AdmissionError::Other(format!(
                    "duplicate offer id {}",
                    offer.offer_id
                ))
                .into());
            }
            let give_hold = offer.quantized_give;
            {
                let delta = machine.delta_mut(offer.give_token);
                let capacity = delta.derive(*from_left).out_capacity;
                if capacity < give_hold {
                    return Err(AdmissionError::InsufficientCapacity {
                        counterparty: String::new(),
                        have: capacity.to_string(),
                        need: give_hold.to_string(),
                    }
                    .into());
                }
            }
            *hold_of(machine, offer.give_token, *from_left) += give_hold;
            machine.swap_offers.insert(offer.offer_id, offer.clone());
            effects.push(TxEffect::OfferPlaced {
                offer: offer.clone(),
                placer_is_left: *from_left,
            });
        }

        AccountTx::FillSwapOffer {
            offer_id,
            give_filled,
            want_filled,
        } => {
            let offer = machine
                .swap_offers
                .get_mut(offer_id)
                .ok_or(AdmissionError::OfferMissing { offer_id: *offer_id })?;
            offer.give_amount = offer.give_amount.saturating_sub(*give_filled);
            offer.want_amount = offer.want_amount.saturating_sub(*want_filled);
            let give_token = offer.give_token;
            let leftover = offer.give_amount;
            let offer_owner = offer.owner;
            let exhausted =
                offer.give_amount < lot_size() || offer.want_amount < lot_size();
            let placer_is_left = machine.viewer_is_left(offer_owner);
            if exhausted {
                // The filled portion's hold is spent by the fill's transfer
                // leg; an exhausted offer frees its sub-lot remainder here.
                machine.swap_offers.remove(offer_id);
                release_hold(machine, give_token, placer_is_left, leftover);
            }
        }

        AccountTx::CancelSwapOffer { offer_id, from_left } => {
            let offer = machine
                .swap_offers
                .get(offer_id)
                .cloned()
                .ok_or(AdmissionError::OfferMissing { offer_id: *offer_id })?;
            if machine.viewer_is_left(offer.owner) != *from_left {
                return Err(AdmissionError::OfferNotOwned { offer_id: *offer_id }.into());
            }
            machine.swap_offers.remove(offer_id);
            release_hold(machine, offer.give_token, *from_left, offer.give_amount);
            effects.push(TxEffect::OfferCancelled {
                offer_id: *offer_id,
                give_token: offer.give_token,
                want_token: offer.want_token,
                owner: offer.owner,
            });
        }

        AccountTx::RequestCollateral {
            token_id,
            amount,
            from_left: _,
        } => {
            let current = machine
                .requested_rebalance
                .get(token_id)
                .copied()
                .unwrap_or_default();
            if !current.is_zero() {
                return Err(AdmissionError::Stale(format!(
                    "collateral request for token {token_id} already pending"
                ))
                .into());
            }
            machine.requested_rebalance.insert(*token_id, *amount);
        }

        AccountTx::RebalanceQuote { .. } => {
            // Informational: the quote only binds once accepted.
        }

        AccountTx::AcceptRebalanceQuote {
            token_id,
            amount,
            fee,
            from_left,
        } => {
            machine
                .requested_rebalance
                .entry(*token_id)
                .and_modify(|a| *a = (*a).max(*amount))
                .or_insert(*amount);
            machine.accepted_quote_fee = Some((*token_id, *fee, *from_left));
            effects.push(TxEffect::QuoteAccepted {
                token_id: *token_id,
                amount: *amount,
                acceptor_is_left: *from_left,
            });
        }

        AccountTx::JEventClaim { record, from_left } => {
            apply_j_event_claim(machine, record, *from_left);
        }
    }
    Ok(())
}

/// Bilateral ingestion of an edge-scoped chain event. This is where
/// chain-driven delta changes enter the hashed state, in lockstep on both
/// copies. Idempotent per `(block_number, log_index)`.
fn apply_j_event_claim(
    machine: &mut AccountMachine,
    record: &gavel::types::events::JEventRecord,
    from_left: bool,
) {
    let position_known = machine
        .j_event_chain
        .iter()
        .any(|r| r.block_number == record.block_number && r.log_index == record.log_index);

    if from_left {
        machine.left_j_observations += 1;
    } else {
        machine.right_j_observations += 1;
    }
    if position_known {
        return;
    }
    machine.j_event_chain.push(record.clone());
    machine.last_finalized_j_height = machine.last_finalized_j_height.max(record.block_number);

    match &record.event {
        JEvent::CollateralUpdated {
            token_id,
            new_collateral,
            new_ondelta,
            ..
        } => {
            let funded = {
                let delta = machine.delta_mut(*token_id);
                let funded = new_collateral.saturating_sub(delta.collateral);
                delta.collateral = *new_collateral;
                delta.ondelta = *new_ondelta;
                funded
            };
            // Fresh collateral counts against the pending request; nothing
            // else ever increases it.
            if let Some(req) = machine.requested_rebalance.get_mut(token_id) {
                *req = req.saturating_sub(funded);
                let fulfilled = req.is_zero();
                if fulfilled {
                    machine.requested_rebalance.remove(token_id);
                    if let Some((quote_token, fee, acceptor_is_left)) =
                        machine.accepted_quote_fee
                    {
                        if quote_token == *token_id && !fee.is_zero() {
                            // Fees only shift on fulfilment: the accepting
                            // side pays the quoting side.
                            let delta = machine.delta_mut(*token_id);
                            if acceptor_is_left {
                                delta.offdelta -= signed(fee);
                            } else {
                                delta.offdelta += signed(fee);
                            }
                        }
                        machine.accepted_quote_fee = None;
                    }
                }
            }
        }
        JEvent::SettlementProcessed { nonce, .. } => {
            machine.on_chain_settlement_nonce = *nonce;
            if let Some((expected, comp)) = machine.pending_settlement_comp.clone() {
                if expected == *nonce {
                    for (token_id, shift) in comp {
                        let delta = machine.delta_mut(token_id);
                        delta.offdelta -= shift;
                    }
                    machine.pending_settlement_comp = None;
                }
            }
            for delta in machine.deltas.values_mut() {
                delta.left_settle_hold = U256::ZERO;
                delta.right_settle_hold = U256::ZERO;
                delta.collateral_hold = U256::ZERO;
            }
        }
        // Reserve updates are entity-level; dispute events travel the
        // unilateral path and never appear as bilateral claims.
        _ => {}
    }
}
