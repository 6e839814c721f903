//! Plan command - Show the provisioning plan.

use anyhow::Result;
use clap::Args;
use tracing::info;

use super::EnvArgs;

#[derive(Args)]
pub struct PlanArgs {
    #[command(flatten)]
    env: EnvArgs,

    /// Print the plan as JSON
    #[arg(long)]
    json: bool,
}

pub async fn execute(args: PlanArgs) -> Result<()> {
    let spec = args.env.spec()?;
    info!("Planning environment: {}", spec.environment_id());

    let engine = args.env.provisioner(args.env.engine_config()?)?;
    let prepared = engine.prepare(&spec)?;

    if args.json {
        println!("{}", prepared.plan.to_json()?);
        return Ok(());
    }

    println!("{}", prepared.plan.render());
    for (i, wave) in prepared.plan.waves().iter().enumerate() {
        let ids: Vec<&str> = wave.iter().map(|s| s.id.as_str()).collect();
        println!("   wave {}: {}", i, ids.join(", "));
    }
    if !prepared.matrix.warnings.is_empty() {
        println!();
        for warning in &prepared.matrix.warnings {
            println!("⚠️  {}", warning.message);
        }
    }
    Ok(())
}
