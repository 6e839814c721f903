//! CLI command definitions.
//!
//! Every subcommand takes the same environment selection: either a spec
//! file or the three required parameters as flags.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use keel_backend::SimulatedBackend;
use keel_core::{EngineConfig, Provisioner};
use keel_policy::{PolicyComposer, RuleSet};
use keel_spec::{EnvironmentSpec, SpecReader};

pub mod apply;
pub mod destroy;
pub mod outputs;
pub mod plan;
pub mod policy;

/// keel - multi-tier environment provisioning
#[derive(Parser)]
#[command(name = "keel")]
#[command(version, about = "keel - multi-tier environment provisioning")]
#[command(long_about = r#"
keel turns a small environment spec into a network, access boundaries, an
object store, a managed database, an identity role and a compute instance,
created in dependency order and torn down in reverse.

COMMANDS:
  plan     → Show the ordered provisioning plan
  policy   → Show the composed access matrix and policy findings
  apply    → Provision the environment
  destroy  → Tear the environment down
  outputs  → Print the published outputs of an environment

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments
  3 - Validation or policy failure
  4 - Provisioning failure
  5 - Indeterminate state, manual reconciliation required
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the provisioning plan
    Plan(plan::PlanArgs),

    /// Show the access matrix
    Policy(policy::PolicyArgs),

    /// Provision an environment
    Apply(apply::ApplyArgs),

    /// Tear an environment down
    Destroy(destroy::DestroyArgs),

    /// Print environment outputs
    Outputs(outputs::OutputsArgs),
}

/// Which environment to act on.
#[derive(Args, Debug, Clone)]
pub struct EnvArgs {
    /// Environment spec file (YAML, TOML or JSON)
    #[arg(short = 'f', long, conflicts_with_all = ["topology", "keypair", "prefix"])]
    pub env_file: Option<PathBuf>,

    /// Topology mode: isolated or egress
    #[arg(short, long)]
    pub topology: Option<String>,

    /// Name of the SSH key pair for the compute instance
    #[arg(short, long)]
    pub keypair: Option<String>,

    /// Naming prefix, also the environment identifier
    #[arg(short, long)]
    pub prefix: Option<String>,

    /// Policy rule set (YAML) replacing the standard rules
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Engine configuration (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// State directory, overrides the engine configuration
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

impl EnvArgs {
    pub fn spec(&self) -> Result<EnvironmentSpec> {
        if let Some(path) = &self.env_file {
            return Ok(SpecReader::read_environment(path)?);
        }
        match (&self.topology, &self.keypair, &self.prefix) {
            (Some(topology), Some(keypair), Some(prefix)) => {
                Ok(EnvironmentSpec::new(topology, keypair, prefix))
            }
            _ => anyhow::bail!(
                "invalid arguments: pass --env-file or all of --topology, --keypair and --prefix"
            ),
        }
    }

    pub fn composer(&self) -> Result<PolicyComposer> {
        let Some(path) = &self.rules else {
            return Ok(PolicyComposer::new());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading rule set {}", path.display()))?;
        Ok(PolicyComposer::with_rules(RuleSet::from_yaml(&content)?))
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        Ok(config)
    }

    /// Engine over the in-memory simulated backend.
    pub fn provisioner(&self, config: EngineConfig) -> Result<Provisioner> {
        Ok(Provisioner::new(Arc::new(SimulatedBackend::new()))
            .with_config(config)
            .with_composer(self.composer()?))
    }
}

/// Token cancelled on Ctrl-C. The step in flight finishes first.
pub fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step");
            child.cancel();
        }
    });
    token
}
