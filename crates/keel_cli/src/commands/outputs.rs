//! Outputs command - Print the outputs of an applied environment.

use anyhow::Result;
use clap::Args;

use keel_backend::SimulatedBackend;
use keel_core::{HandleRegistry, OutputProjector};

use super::EnvArgs;

#[derive(Args)]
pub struct OutputsArgs {
    #[command(flatten)]
    env: EnvArgs,

    /// Print outputs as JSON
    #[arg(long)]
    json: bool,
}

pub async fn execute(args: OutputsArgs) -> Result<()> {
    let spec = args.env.spec()?;
    let config = args.env.engine_config()?;
    let registry = HandleRegistry::open(&config.state_dir, spec.environment_id())?;

    if registry.live_count() == 0 {
        anyhow::bail!("environment {} has no live resources", spec.environment_id());
    }

    let backend = SimulatedBackend::new();
    let outputs = OutputProjector::standard()
        .resolve(&registry, &backend)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outputs)?);
    } else {
        for (name, value) in outputs.iter() {
            println!("{} = {}", name, value);
        }
    }
    Ok(())
}
