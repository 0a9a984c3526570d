//! `run` subcommand: drive a scenario topology against a live jurisdiction.
//!
//! The deterministic core still advances one tick at a time; this loop feeds
//! it wall-clock time, ships flushed batches through the batch submitter, and
//! turns confirmed chain events back into runtime inputs. State persists
//! between runs so a restart resumes from where it stopped.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use anyhow::Context;

use gavel::providers::{BatchConfig, BatchSubmitter, Jurisdiction, LiveJurisdiction, SubmitOutcome};
use gavel::providers::batcher::PendingBatch;

use crate::model::entity::{BatchStatus, EntityInput, EntityTx};
use crate::runtime::{self, RuntimeEnv, RuntimeTx};
use crate::scenario::{ScenarioSpec, SCENARIO_JURISDICTION};

pub struct LiveConfig {
    pub rpc_url: String,
    pub depository: String,
    pub wallet_key: String,
    pub tick_ms: u64,
    pub state_file: PathBuf,
}

pub fn run(spec: &ScenarioSpec, config: &LiveConfig) -> anyhow::Result<()> {
    println!("=== rcpan run ===");
    println!("Scenario: {} ({} entities)", spec.name, spec.entities.len());
    println!("RPC:      {}", config.rpc_url);
    println!("State:    {}", config.state_file.display());
    println!();

    let depository = Address::from_str(&config.depository).context("bad depository address")?;
    let wallet_key = B256::from_str(&config.wallet_key).context("bad wallet key")?;

    let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    rt.block_on(run_async(spec, config, depository, wallet_key))
}

async fn run_async(
    spec: &ScenarioSpec,
    config: &LiveConfig,
    depository: Address,
    wallet_key: B256,
) -> anyhow::Result<()> {
    let chain = LiveJurisdiction::connect(&config.rpc_url, depository, wallet_key)?;
    let submitter = BatchSubmitter::new(BatchConfig::default());

    let mut env = if config.state_file.exists() {
        println!("Resuming from saved state.");
        RuntimeEnv::load(&config.state_file)?
    } else {
        bootstrap(spec)
    };
    env.scenario_mode = false;

    loop {
        tokio::time::sleep(Duration::from_millis(config.tick_ms)).await;
        let now = chrono::Utc::now();

        env.runtime_input.runtime_txs.push(RuntimeTx::AdvanceTime {
            to_ms: now.timestamp_millis() as u64,
        });
        runtime::process(&mut env)?;

        // Ship flushed batches.
        let j = env.active_jurisdiction.clone();
        let queued: Vec<_> = {
            let jr = env.jurisdictions.get_mut(&j).unwrap();
            std::mem::take(&mut jr.mempool)
        };
        for q in queued {
            let pending = PendingBatch::new(q.entity, q.batch.clone(), q.hanko.clone());
            let (status, tx_hash) = match submitter.submit(&chain, &pending).await {
                SubmitOutcome::Confirmed(receipt) => {
                    println!(
                        "[{}] batch {} confirmed in block {}",
                        now.format("%H:%M:%S"),
                        q.nonce,
                        receipt.block_number
                    );
                    (BatchStatus::Confirmed, Some(receipt.tx_hash))
                }
                SubmitOutcome::Rejected {
                    reason,
                    retry_eligible,
                } => {
                    eprintln!(
                        "[{}] batch {} rejected ({reason}); retry eligible: {retry_eligible}",
                        now.format("%H:%M:%S"),
                        q.nonce
                    );
                    (BatchStatus::Rejected, None)
                }
            };
            let proposer = proposer_of(&env, q.entity);
            if let Some(signer) = proposer {
                env.enqueue(
                    q.entity,
                    &signer,
                    EntityInput::AddTx {
                        tx: EntityTx::JBatchAck {
                            nonce: q.nonce,
                            status,
                            tx_hash,
                        },
                    },
                );
            }
        }

        // Sync the observed chain head, then ingest finalized events.
        if let Ok(head) = chain.block_number().await {
            let entities: Vec<_> = env
                .replicas
                .values()
                .map(|r| r.entity_id)
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect();
            for entity in entities {
                if let Some(signer) = proposer_of(&env, entity) {
                    env.enqueue(
                        entity,
                        &signer,
                        EntityInput::AddTx {
                            tx: EntityTx::ObserveJBlock { block: head },
                        },
                    );
                }
            }
        }
        let cursor = env.jurisdictions[&j].cursor;
        match chain.poll_events(cursor).await {
            Ok(records) => {
                if let Some(last) = records.last() {
                    env.jurisdictions.get_mut(&j).unwrap().cursor = last.cursor();
                }
                let entities: Vec<_> = env
                    .replicas
                    .values()
                    .map(|r| r.entity_id)
                    .collect::<std::collections::BTreeSet<_>>()
                    .into_iter()
                    .collect();
                for record in records {
                    for entity in &entities {
                        if let Some(signer) = proposer_of(&env, *entity) {
                            env.enqueue(
                                *entity,
                                &signer,
                                EntityInput::AddTx {
                                    tx: EntityTx::JEventClaim {
                                        record: record.clone(),
                                    },
                                },
                            );
                        }
                    }
                }
            }
            Err(e) => eprintln!("[{}] event poll failed: {e}", now.format("%H:%M:%S")),
        }

        env.save(&config.state_file)?;
    }
}

fn proposer_of(env: &RuntimeEnv, entity: alloy::primitives::B256) -> Option<String> {
    env.replicas
        .values()
        .find(|r| r.entity_id == entity)
        .map(|r| r.state.validator_config.proposer().clone())
}

fn bootstrap(spec: &ScenarioSpec) -> RuntimeEnv {
    let mut env = runtime::create_empty_env(spec.runtime_seed, SCENARIO_JURISDICTION);
    let mut txs = Vec::new();
    for e in &spec.entities {
        let entity_id = B256::from([e.id_byte; 32]);
        let mut shares = std::collections::BTreeMap::new();
        let mut addresses = std::collections::BTreeMap::new();
        for v in &e.validators {
            shares.insert(v.clone(), e.shares.get(v).copied().unwrap_or(1));
            addresses.insert(
                v.clone(),
                RuntimeEnv::derived_address(spec.runtime_seed, entity_id, v),
            );
        }
        let config = crate::model::entity::ValidatorConfig {
            mode: crate::model::entity::ConsensusMode::ProposerBased,
            threshold: e.threshold,
            validators: e.validators.clone(),
            shares,
            addresses,
        };
        for v in &e.validators {
            txs.push(RuntimeTx::ImportReplica {
                entity_id,
                signer_id: v.clone(),
                config: config.clone(),
            });
        }
    }
    env.runtime_input.runtime_txs = txs;
    let _ = runtime::process(&mut env);
    env
}
