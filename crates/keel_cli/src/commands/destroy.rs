//! Destroy command - Tear an environment down.

use anyhow::Result;
use clap::Args;
use tracing::info;

use super::{cancel_on_interrupt, EnvArgs};

#[derive(Args)]
pub struct DestroyArgs {
    #[command(flatten)]
    env: EnvArgs,
}

pub async fn execute(args: DestroyArgs) -> Result<()> {
    let spec = args.env.spec()?;
    info!("Destroying environment: {}", spec.environment_id());

    let engine = args.env.provisioner(args.env.engine_config()?)?;
    let report = engine.destroy(&spec, &cancel_on_interrupt()).await?;

    println!("{}", report.render());
    match report.to_error() {
        Some(e) => Err(e.into()),
        None => {
            println!("\n✅ Environment {} destroyed", report.environment);
            Ok(())
        }
    }
}
