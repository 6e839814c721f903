//! Provisioning plans.
//!
//! A plan is a linear order of steps that respects every dependency edge.
//! Ties between ready steps are broken by declaration order, so the same
//! descriptor set always yields the same plan.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::debug;

use keel_backend::TargetKind;
use keel_policy::AccessMatrix;
use keel_spec::{DescriptorSet, ResourceDescriptor, ResourceId, ResourceKind, Rule};

use crate::error::{CoreError, CoreResult};
use crate::graph::{DeferredRule, DependencyGraph};

/// What a step does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    Create { descriptor: ResourceDescriptor },
    /// Attach a deferred peer rule to an existing boundary.
    AttachRule {
        boundary: ResourceId,
        rule_index: usize,
        rule: Rule,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: ResourceId,
    /// Longest dependency chain below this step. Steps of one level share
    /// a wave.
    pub level: usize,
    pub depends_on: BTreeSet<ResourceId>,
    pub action: StepAction,
    /// Resolved access rules, filled in by [`Planner::annotate`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access: Vec<Rule>,
}

impl PlanStep {
    pub fn kind(&self) -> TargetKind {
        match &self.action {
            StepAction::Create { descriptor } => TargetKind::Resource(descriptor.kind()),
            StepAction::AttachRule { .. } => TargetKind::RuleAttachment,
        }
    }

    pub fn descriptor(&self) -> Option<&ResourceDescriptor> {
        match &self.action {
            StepAction::Create { descriptor } => Some(descriptor),
            StepAction::AttachRule { .. } => None,
        }
    }

    pub fn is_attachment(&self) -> bool {
        matches!(self.action, StepAction::AttachRule { .. })
    }
}

/// Ordered steps of one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningPlan {
    pub environment: String,
    pub steps: Vec<PlanStep>,
}

impl ProvisioningPlan {
    pub fn creation_order(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter()
    }

    /// Exact reverse of the creation order.
    pub fn teardown_order(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().rev()
    }

    /// Steps grouped by level. Every step's dependencies sit in an earlier
    /// wave.
    pub fn waves(&self) -> Vec<Vec<&PlanStep>> {
        let mut waves: BTreeMap<usize, Vec<&PlanStep>> = BTreeMap::new();
        for step in &self.steps {
            waves.entry(step.level).or_default().push(step);
        }
        waves.into_values().collect()
    }

    pub fn step(&self, id: &ResourceId) -> Option<&PlanStep> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn position(&self, id: &ResourceId) -> Option<usize> {
        self.steps.iter().position(|s| &s.id == id)
    }

    pub fn ids(&self) -> Vec<&ResourceId> {
        self.steps.iter().map(|s| &s.id).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(content: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Human-readable listing.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Plan for {} ({} steps)", self.environment, self.steps.len());
        for (i, step) in self.steps.iter().enumerate() {
            let deps = if step.depends_on.is_empty() {
                String::new()
            } else {
                format!(
                    " <- {}",
                    step.depends_on
                        .iter()
                        .map(ResourceId::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };
            let _ = writeln!(
                out,
                "  {:>2}. [wave {}] {} ({}){}",
                i + 1,
                step.level,
                step.id,
                step.kind(),
                deps
            );
        }
        out
    }
}

/// Turns a dependency graph into a plan.
pub struct Planner;

impl Planner {
    pub fn plan(graph: &DependencyGraph, set: &DescriptorSet) -> CoreResult<ProvisioningPlan> {
        let nodes = graph.nodes();
        let mut pending: Vec<usize> = (0..nodes.len()).map(|i| graph.successors(i).len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, _) in nodes.iter().enumerate() {
            for dep in graph.successors(i) {
                dependents[dep].push(i);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut levels: BTreeMap<ResourceId, usize> = BTreeMap::new();
        let mut steps = Vec::with_capacity(nodes.len() + graph.deferred().len());
        let mut waiting: Vec<&DeferredRule> = graph.deferred().iter().collect();

        while let Some(Reverse(node)) = ready.pop() {
            let id = &nodes[node];
            let descriptor = set.get(id).ok_or_else(|| {
                CoreError::InvalidSpecification(format!("{} is not in the descriptor set", id))
            })?;
            let depends_on = graph.dependencies_of(id);
            let level = depends_on
                .iter()
                .filter_map(|d| levels.get(d))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            levels.insert(id.clone(), level);
            steps.push(PlanStep {
                id: id.clone(),
                level,
                depends_on,
                action: StepAction::Create {
                    descriptor: descriptor.clone(),
                },
                access: Vec::new(),
            });

            // Deferred rules go right after the later of their two boundaries.
            let (now, later): (Vec<_>, Vec<_>) = waiting.into_iter().partition(|rule| {
                levels.contains_key(&rule.boundary) && levels.contains_key(&rule.peer)
            });
            waiting = later;
            for rule in now {
                let level = levels[&rule.boundary].max(levels[&rule.peer]) + 1;
                steps.push(PlanStep {
                    id: ResourceId::rule_of(&rule.boundary, rule.index),
                    level,
                    depends_on: [rule.boundary.clone(), rule.peer.clone()].into_iter().collect(),
                    action: StepAction::AttachRule {
                        boundary: rule.boundary.clone(),
                        rule_index: rule.index,
                        rule: rule.rule.clone(),
                    },
                    access: Vec::new(),
                });
            }

            for &dependent in &dependents[node] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if levels.len() != nodes.len() {
            return Err(CoreError::InvalidState(format!(
                "only {} of {} resources could be ordered",
                levels.len(),
                nodes.len()
            )));
        }

        debug!("Planned {} steps for {}", steps.len(), set.environment);
        Ok(ProvisioningPlan {
            environment: set.environment.clone(),
            steps,
        })
    }

    /// Attach the composed access rules to boundary and attachment steps.
    pub fn annotate(mut plan: ProvisioningPlan, matrix: &AccessMatrix) -> ProvisioningPlan {
        for step in &mut plan.steps {
            step.access = match &step.action {
                StepAction::Create { descriptor }
                    if descriptor.kind() == ResourceKind::AccessBoundary =>
                {
                    matrix.inline_rules(&step.id)
                }
                StepAction::Create { .. } => Vec::new(),
                StepAction::AttachRule {
                    boundary,
                    rule_index,
                    rule,
                } => vec![matrix
                    .entry_for_rule(boundary, *rule_index)
                    .map(|e| e.to_rule())
                    .unwrap_or_else(|| rule.clone())],
            };
        }
        plan
    }
}
