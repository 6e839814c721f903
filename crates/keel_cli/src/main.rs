//! keel CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments
//! - 3: Validation or policy failure
//! - 4: Provisioning failure
//! - 5: Indeterminate state, manual reconciliation required

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keel_core::CoreError;
use keel_spec::SpecError;

mod commands;

use commands::{Cli, Commands};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const VALIDATION_FAILURE: u8 = 3;
    pub const PROVISIONING_FAILURE: u8 = 4;
    pub const RECONCILIATION_REQUIRED: u8 = 5;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "keel=debug,warn" } else { "keel=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let log_result = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();

    if log_result.is_err() {
        // Logging already initialized, continue
    }

    let result = match cli.command {
        Commands::Plan(args) => commands::plan::execute(args).await,
        Commands::Policy(args) => commands::policy::execute(args).await,
        Commands::Apply(args) => commands::apply::execute(args).await,
        Commands::Destroy(args) => commands::destroy::execute(args).await,
        Commands::Outputs(args) => commands::outputs::execute(args).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("❌ Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    if let Some(spec) = e.downcast_ref::<SpecError>() {
        return match spec {
            SpecError::NotFound(_) | SpecError::UnsupportedFormat(_) => ExitCodes::INVALID_ARGS,
            _ => ExitCodes::VALIDATION_FAILURE,
        };
    }

    match e.downcast_ref::<CoreError>() {
        Some(core) if core.requires_reconciliation() => ExitCodes::RECONCILIATION_REQUIRED,
        Some(core) if core.is_pre_execution() => ExitCodes::VALIDATION_FAILURE,
        Some(CoreError::Spec(_)) => ExitCodes::VALIDATION_FAILURE,
        Some(CoreError::Config(_)) => ExitCodes::INVALID_ARGS,
        Some(
            CoreError::ResourceCreationFailed { .. }
            | CoreError::BackendUnavailable { .. }
            | CoreError::UnresolvedOutput { .. }
            | CoreError::TeardownFailed { .. }
            | CoreError::Cancelled(_),
        ) => ExitCodes::PROVISIONING_FAILURE,
        None if e.to_string().starts_with("invalid arguments") => ExitCodes::INVALID_ARGS,
        _ => ExitCodes::GENERAL_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let busy = anyhow::Error::from(CoreError::EnvironmentBusy("dev".into()));
        assert_eq!(categorize_error(&busy), ExitCodes::VALIDATION_FAILURE);

        let lost = anyhow::Error::from(CoreError::IndeterminateState {
            resource: "database".into(),
            message: "timed out".into(),
        });
        assert_eq!(categorize_error(&lost), ExitCodes::RECONCILIATION_REQUIRED);

        let unavailable = anyhow::Error::from(CoreError::BackendUnavailable {
            resource: "database".into(),
            attempts: 3,
            message: "503".into(),
        });
        assert_eq!(categorize_error(&unavailable), ExitCodes::PROVISIONING_FAILURE);

        let missing = anyhow::Error::from(SpecError::NotFound("dev.yaml".into()));
        assert_eq!(categorize_error(&missing), ExitCodes::INVALID_ARGS);

        assert_eq!(
            categorize_error(&anyhow::anyhow!("something else")),
            ExitCodes::GENERAL_ERROR
        );
    }
}
