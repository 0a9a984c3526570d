use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rcpan", version, about = "Reserve-credit provable account network")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the JSON schema for scenario files.
    Schema,

    /// Validate a scenario file offline.
    Validate {
        /// Path to the scenario JSON.
        file: PathBuf,
    },

    /// Run a scenario against the simulated jurisdiction.
    Scenario {
        /// Path to the scenario JSON.
        file: PathBuf,

        /// Write the final env snapshot here.
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Abort on any fatal replica error instead of isolating it.
        #[arg(long)]
        strict: bool,
    },

    /// Build and run a small built-in network, printing what happens.
    Demo,

    /// Drive a scenario topology against a live jurisdiction.
    Run {
        /// Scenario JSON providing the entity topology.
        file: PathBuf,

        /// HTTP RPC endpoint of the jurisdiction chain.
        #[arg(long)]
        rpc_url: String,

        /// Deployed Depository contract address.
        #[arg(long)]
        depository: String,

        /// Hex-encoded 32-byte key for transaction signing.
        #[arg(long, env = "RCPAN_WALLET_KEY")]
        wallet_key: String,

        /// Milliseconds between ticks.
        #[arg(long, default_value_t = 1000)]
        tick_ms: u64,

        /// Where runtime state persists between runs.
        #[arg(long, default_value = "rcpan-state.json")]
        state_file: PathBuf,
    },
}
