//! Apply command - Provision an environment.

use anyhow::Result;
use clap::Args;
use tracing::info;

use super::{cancel_on_interrupt, EnvArgs};

#[derive(Args)]
pub struct ApplyArgs {
    #[command(flatten)]
    env: EnvArgs,

    /// Dispatch the steps of one wave together
    #[arg(long)]
    concurrent: bool,

    /// Per-call timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Attempts per step, including the first
    #[arg(long)]
    max_attempts: Option<u32>,
}

pub async fn execute(args: ApplyArgs) -> Result<()> {
    let spec = args.env.spec()?;
    info!("Applying environment: {}", spec.environment_id());

    let mut config = args.env.engine_config()?;
    if args.concurrent {
        config.concurrent_waves = true;
    }
    if let Some(ms) = args.timeout_ms {
        config.backend.timeout_ms = ms;
    }
    if let Some(attempts) = args.max_attempts {
        config.backend.retry.max_attempts = attempts.max(1);
    }

    let engine = args.env.provisioner(config)?;
    let report = engine.apply(&spec, &cancel_on_interrupt()).await?;

    println!("{}", report.render());
    match report.to_error() {
        Some(e) => {
            println!("\n🧹 Run `keel destroy` with the same environment to remove what was created.");
            Err(e.into())
        }
        None => {
            println!("\n✅ Environment {} is ready", report.environment);
            Ok(())
        }
    }
}
