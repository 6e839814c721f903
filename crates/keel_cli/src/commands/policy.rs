//! Policy command - Show the composed access matrix.

use anyhow::Result;
use clap::Args;
use tracing::info;

use keel_spec::build_descriptors;

use super::EnvArgs;

#[derive(Args)]
pub struct PolicyArgs {
    #[command(flatten)]
    env: EnvArgs,

    /// Print the matrix as JSON
    #[arg(long)]
    json: bool,
}

pub async fn execute(args: PolicyArgs) -> Result<()> {
    let spec = args.env.spec()?;
    info!("Composing access matrix for {}", spec.environment_id());

    let descriptors = build_descriptors(&spec)?;
    let composer = args.env.composer()?;

    let matrix = match composer.compose(&descriptors) {
        Ok(matrix) => matrix,
        Err(e) => {
            println!("🔒 Policy check failed:");
            for violation in e.violations() {
                println!("   ❌ [{}] {}", violation.rule_id, violation.message);
            }
            return Err(keel_core::CoreError::from(e).into());
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&matrix)?);
    } else {
        println!("{}", matrix.report());
    }
    Ok(())
}
