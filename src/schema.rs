//! `schema` subcommand: print the scenario JSON schema.

use schemars::schema_for;

use crate::scenario::ScenarioSpec;

pub fn run() -> anyhow::Result<()> {
    let schema = schema_for!(ScenarioSpec);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
