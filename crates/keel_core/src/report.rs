//! Run reports.
//!
//! Every apply or destroy produces a report, successful or not. A failed
//! run names the failing step, the failure class and the attempts made, and
//! lists exactly which steps completed so the remainder can be torn down.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use keel_backend::TargetKind;
use keel_spec::ResourceId;

use crate::error::{CoreError, CoreResult};
use crate::outputs::OutputSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Apply,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    /// Never attempted because an earlier step failed or the run stopped.
    NotStarted,
    /// Nothing to do, e.g. teardown of a resource that was never created.
    Skipped,
    Retained,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: ResourceId,
    pub kind: TargetKind,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl StepRecord {
    pub fn pending(id: ResourceId, kind: TargetKind) -> Self {
        Self {
            id,
            kind,
            status: StepStatus::NotStarted,
            attempts: 0,
            provider_id: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ResourceCreationFailed,
    BackendUnavailable,
    IndeterminateState,
    UnresolvedOutput,
    UntrackedResource,
    Cancelled,
    TeardownFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub step: ResourceId,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

impl FailureRecord {
    /// Classify an execution error. Pre-execution errors are never turned
    /// into failure records.
    pub fn from_error(error: &CoreError, attempts: u32) -> Option<Self> {
        let (step, kind) = match error {
            CoreError::ResourceCreationFailed { resource, .. } => {
                (resource, FailureKind::ResourceCreationFailed)
            }
            CoreError::BackendUnavailable { resource, .. } => {
                (resource, FailureKind::BackendUnavailable)
            }
            CoreError::IndeterminateState { resource, .. } => {
                (resource, FailureKind::IndeterminateState)
            }
            CoreError::UnresolvedOutput { resource, .. } => {
                (resource, FailureKind::UnresolvedOutput)
            }
            CoreError::UntrackedResource { resource, .. } => {
                (resource, FailureKind::UntrackedResource)
            }
            CoreError::Cancelled(resource) => (resource, FailureKind::Cancelled),
            CoreError::TeardownFailed { resource, .. } => (resource, FailureKind::TeardownFailed),
            _ => return None,
        };
        Some(Self {
            step: step.clone(),
            kind,
            message: error.to_string(),
            attempts,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub environment: String,
    pub operation: Operation,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepRecord>,
    pub failure: Option<FailureRecord>,
    #[serde(default)]
    pub outputs: OutputSet,
}

impl RunReport {
    pub fn new(environment: impl Into<String>, operation: Operation) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            environment: environment.into(),
            operation,
            started_at: Utc::now(),
            completed_at: None,
            steps: Vec::new(),
            failure: None,
            outputs: OutputSet::default(),
        }
    }

    pub fn step_mut(&mut self, id: &ResourceId) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| &s.id == id)
    }

    pub fn step(&self, id: &ResourceId) -> Option<&StepRecord> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn fail(&mut self, failure: FailureRecord) {
        self.failure = Some(failure);
    }

    pub fn finish(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn completed_steps(&self) -> Vec<&ResourceId> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| &s.id)
            .collect()
    }

    pub fn failed_step(&self) -> Option<&ResourceId> {
        self.failure.as_ref().map(|f| &f.step)
    }

    /// The failure as an error, for callers that want `?` semantics.
    pub fn to_error(&self) -> Option<CoreError> {
        let failure = self.failure.as_ref()?;
        let resource = failure.step.clone();
        let message = failure.message.clone();
        Some(match failure.kind {
            FailureKind::ResourceCreationFailed => CoreError::ResourceCreationFailed { resource, message },
            FailureKind::BackendUnavailable => CoreError::BackendUnavailable {
                resource,
                attempts: failure.attempts,
                message,
            },
            FailureKind::IndeterminateState => CoreError::IndeterminateState { resource, message },
            FailureKind::UnresolvedOutput => CoreError::UnresolvedOutput {
                name: String::new(),
                resource,
                reason: message,
            },
            FailureKind::UntrackedResource => CoreError::UntrackedResource {
                resource,
                provider_id: String::new(),
                message,
            },
            FailureKind::Cancelled => CoreError::Cancelled(resource),
            FailureKind::TeardownFailed => CoreError::TeardownFailed { resource, message },
        })
    }

    pub fn report_path(dir: &Path, run_id: &Uuid) -> PathBuf {
        dir.join("runs").join(format!("{}.json", run_id))
    }

    /// Save the report under `dir/runs/`.
    pub fn save(&self, dir: &Path) -> CoreResult<PathBuf> {
        let path = Self::report_path(dir, &self.run_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        debug!("Saved run report to {:?}", path);
        Ok(path)
    }

    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Generate a human-readable report.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let operation = match self.operation {
            Operation::Apply => "Apply",
            Operation::Destroy => "Destroy",
        };
        let _ = writeln!(out, "{} {} (run {})\n", operation, self.environment, self.run_id);

        for step in &self.steps {
            let marker = match step.status {
                StepStatus::Completed => "✅",
                StepStatus::Failed => "❌",
                StepStatus::NotStarted => "⏸️",
                StepStatus::Skipped => "⏭️",
                StepStatus::Retained => "📌",
            };
            let _ = write!(out, "  {} {} ({})", marker, step.id, step.kind);
            if let Some(provider_id) = &step.provider_id {
                let _ = write!(out, " -> {}", provider_id);
            }
            if step.attempts > 1 {
                let _ = write!(out, " [{} attempts]", step.attempts);
            }
            out.push('\n');
        }

        if !self.outputs.is_empty() {
            out.push_str("\nOutputs:\n");
            for (name, value) in self.outputs.iter() {
                let _ = writeln!(out, "  {} = {}", name, value);
            }
        }

        match &self.failure {
            Some(failure) => {
                let _ = write!(
                    out,
                    "\nFailed at {} ({:?}) after {} attempt(s): {}",
                    failure.step, failure.kind, failure.attempts, failure.message
                );
            }
            None => {
                let _ = write!(out, "\nSummary: {} step(s) completed", self.completed_steps().len());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_spec::ResourceKind;

    #[test]
    fn test_failure_classification() {
        let err = CoreError::BackendUnavailable {
            resource: "database".into(),
            attempts: 3,
            message: "timed out".into(),
        };
        let failure = FailureRecord::from_error(&err, 3).unwrap();
        assert_eq!(failure.kind, FailureKind::BackendUnavailable);
        assert_eq!(failure.step.as_str(), "database");

        assert!(FailureRecord::from_error(&CoreError::InvalidSpecification("x".into()), 0).is_none());
    }

    #[test]
    fn test_report_roundtrip_and_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = RunReport::new("dev", Operation::Apply);
        report.steps.push(StepRecord::pending(
            "bucket".into(),
            TargetKind::Resource(ResourceKind::ObjectStore),
        ));
        report.fail(FailureRecord {
            step: "bucket".into(),
            kind: FailureKind::IndeterminateState,
            message: "lost response".into(),
            attempts: 1,
        });
        report.finish();

        let path = report.save(dir.path()).unwrap();
        let loaded = RunReport::load(&path).unwrap();
        assert_eq!(loaded, report);
        assert!(!loaded.succeeded());
        assert!(loaded.to_error().is_some_and(|e| e.requires_reconciliation()));
        assert!(loaded.render().contains("Failed at bucket"));
    }
}
