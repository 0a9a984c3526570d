use clap::Parser;

mod cli;

fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    match args.command {
        cli::Command::Schema => rcpan::schema::run(),
        cli::Command::Validate { file } => {
            let spec = load_spec(&file)?;
            match rcpan::scenario::validate::check(&spec) {
                Ok(()) => {
                    println!(
                        "Scenario '{}' is valid. {} entities, {} steps.",
                        spec.name,
                        spec.entities.len(),
                        spec.steps.len()
                    );
                    Ok(())
                }
                Err(errors) => {
                    eprintln!("Validation failed with {} error(s):", errors.len());
                    for (i, e) in errors.iter().enumerate() {
                        eprintln!("  {}. {}", i + 1, e);
                    }
                    std::process::exit(1);
                }
            }
        }
        cli::Command::Scenario {
            file,
            snapshot,
            strict,
        } => {
            let spec = load_spec(&file)?;
            let runner = rcpan::scenario::run_spec(&spec, strict)?;
            println!(
                "Scenario '{}' complete: {} ticks, {} log entries.",
                spec.name,
                runner.env.height,
                runner.env.frame_logs.len()
            );
            for log in &runner.env.frame_logs {
                println!("  [{}] {}: {}", log.height, log.replica, log.message);
            }
            println!("history hash: {}", runner.env.history_hash()?);
            if let Some(path) = snapshot {
                runner.env.save(&path)?;
                println!("snapshot written to {}", path.display());
            }
            Ok(())
        }
        cli::Command::Demo => rcpan::demo::run(),
        cli::Command::Run {
            file,
            rpc_url,
            depository,
            wallet_key,
            tick_ms,
            state_file,
        } => {
            let spec = load_spec(&file)?;
            rcpan::live::run(
                &spec,
                &rcpan::live::LiveConfig {
                    rpc_url,
                    depository,
                    wallet_key,
                    tick_ms,
                    state_file,
                },
            )
        }
    }
}

fn load_spec(path: &std::path::Path) -> anyhow::Result<rcpan::scenario::ScenarioSpec> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}
