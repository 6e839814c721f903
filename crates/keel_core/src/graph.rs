//! Dependency graph over descriptor identities.
//!
//! Edges point from a dependent to its dependency and are derived only from
//! references held in descriptor fields. Deferred peer rules contribute no
//! edge; they are recorded separately and become their own plan steps.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use keel_spec::{DescriptorSet, ResourceId, ResourceKind, ResourceSpec, Rule};

use crate::error::{CoreError, CoreResult};

/// Why one descriptor depends on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Placement in a network space.
    Network,
    /// Bound access boundary.
    Boundary,
    /// Inline rule whose peer is another boundary.
    PeerRule,
    /// Instance assumes a role.
    RoleBinding,
    /// Role is granted access to a resource.
    Grant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: ResourceId,
    pub to: ResourceId,
    pub kind: EdgeKind,
}

/// A peer rule attached after both of its boundaries exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredRule {
    pub boundary: ResourceId,
    pub index: usize,
    pub peer: ResourceId,
    pub rule: Rule,
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Nodes in declaration order.
    nodes: Vec<ResourceId>,
    index: HashMap<ResourceId, usize>,
    edges: Vec<Edge>,
    deferred: Vec<DeferredRule>,
}

impl DependencyGraph {
    /// Walk every descriptor and wire its references.
    ///
    /// Fails on references to unknown or wrongly-typed descriptors and on
    /// any cycle among inline references.
    pub fn build(set: &DescriptorSet) -> CoreResult<Self> {
        let nodes: Vec<ResourceId> = set.iter().map(|d| d.id.clone()).collect();
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut graph = Self {
            nodes,
            index,
            edges: Vec::new(),
            deferred: Vec::new(),
        };

        for descriptor in set.iter() {
            let from = &descriptor.id;
            match &descriptor.spec {
                ResourceSpec::NetworkSpace(_) | ResourceSpec::ObjectStore(_) => {}
                ResourceSpec::AccessBoundary(boundary) => {
                    graph.link(set, from, &boundary.network, ResourceKind::NetworkSpace, EdgeKind::Network)?;
                    for (i, rule) in boundary.rules.iter().enumerate() {
                        let Some(peer) = rule.peer.boundary() else {
                            continue;
                        };
                        expect_kind(set, from, peer, ResourceKind::AccessBoundary)?;
                        if rule.is_deferred() {
                            graph.deferred.push(DeferredRule {
                                boundary: from.clone(),
                                index: i,
                                peer: peer.clone(),
                                rule: rule.clone(),
                            });
                        } else {
                            graph.link(set, from, peer, ResourceKind::AccessBoundary, EdgeKind::PeerRule)?;
                        }
                    }
                }
                ResourceSpec::ManagedDatabase(db) => {
                    graph.link(set, from, &db.network, ResourceKind::NetworkSpace, EdgeKind::Network)?;
                    graph.link(set, from, &db.boundary, ResourceKind::AccessBoundary, EdgeKind::Boundary)?;
                }
                ResourceSpec::IdentityRole(role) => {
                    for target in role.grants.iter().filter_map(|p| p.target()) {
                        let kind = set.get(target).map(|d| d.kind()).ok_or_else(|| {
                            dangling(from, target)
                        })?;
                        if !matches!(kind, ResourceKind::ObjectStore | ResourceKind::ManagedDatabase) {
                            return Err(CoreError::InvalidSpecification(format!(
                                "{} grants access to {} which is a {}",
                                from, target, kind
                            )));
                        }
                        graph.push_edge(from, target, EdgeKind::Grant);
                    }
                }
                ResourceSpec::ComputeInstance(instance) => {
                    graph.link(set, from, &instance.network, ResourceKind::NetworkSpace, EdgeKind::Network)?;
                    graph.link(set, from, &instance.boundary, ResourceKind::AccessBoundary, EdgeKind::Boundary)?;
                    graph.link(set, from, &instance.role, ResourceKind::IdentityRole, EdgeKind::RoleBinding)?;
                }
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            return Err(CoreError::CyclicDependency { cycle });
        }

        debug!(
            "Built dependency graph: {} nodes, {} edges, {} deferred rule(s)",
            graph.nodes.len(),
            graph.edges.len(),
            graph.deferred.len()
        );
        Ok(graph)
    }

    fn link(
        &mut self,
        set: &DescriptorSet,
        from: &ResourceId,
        to: &ResourceId,
        kind: ResourceKind,
        edge: EdgeKind,
    ) -> CoreResult<()> {
        expect_kind(set, from, to, kind)?;
        self.push_edge(from, to, edge);
        Ok(())
    }

    fn push_edge(&mut self, from: &ResourceId, to: &ResourceId, kind: EdgeKind) {
        if self.edges.iter().any(|e| &e.from == from && &e.to == to) {
            return;
        }
        self.edges.push(Edge {
            from: from.clone(),
            to: to.clone(),
            kind,
        });
    }

    pub fn nodes(&self) -> &[ResourceId] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn deferred(&self) -> &[DeferredRule] {
        &self.deferred
    }

    /// Declaration index of a node.
    pub fn position(&self, id: &ResourceId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Direct dependencies of `id`.
    pub fn dependencies_of(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        self.edges
            .iter()
            .filter(|e| &e.from == id)
            .map(|e| e.to.clone())
            .collect()
    }

    /// Direct dependents of `id`.
    pub fn dependents_of(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        self.edges
            .iter()
            .filter(|e| &e.to == id)
            .map(|e| e.from.clone())
            .collect()
    }

    pub fn has_edge(&self, from: &ResourceId, to: &ResourceId) -> bool {
        self.edges.iter().any(|e| &e.from == from && &e.to == to)
    }

    /// Dependencies of a node as declaration indices, ascending.
    pub(crate) fn successors(&self, node: usize) -> Vec<usize> {
        let from = &self.nodes[node];
        let mut out: Vec<usize> = self
            .edges
            .iter()
            .filter(|e| &e.from == from)
            .filter_map(|e| self.position(&e.to))
            .collect();
        out.sort_unstable();
        out
    }

    /// First cycle found by a depth-first walk in declaration order, as a
    /// path that starts and ends on the same node.
    fn find_cycle(&self) -> Option<Vec<ResourceId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        let mut marks = vec![Mark::New; self.nodes.len()];
        let mut path: Vec<usize> = Vec::new();

        for root in 0..self.nodes.len() {
            if marks[root] != Mark::New {
                continue;
            }
            // Explicit stack of (node, next successor slot).
            let mut stack: Vec<(usize, Vec<usize>, usize)> = vec![(root, self.successors(root), 0)];
            marks[root] = Mark::Active;
            path.push(root);

            while let Some((node, succ, slot)) = stack.last_mut() {
                if *slot < succ.len() {
                    let next = succ[*slot];
                    *slot += 1;
                    match marks[next] {
                        Mark::New => {
                            marks[next] = Mark::Active;
                            path.push(next);
                            let succ = self.successors(next);
                            stack.push((next, succ, 0));
                        }
                        Mark::Active => {
                            let start = path.iter().position(|n| *n == next).unwrap_or(0);
                            let mut cycle: Vec<ResourceId> =
                                path[start..].iter().map(|n| self.nodes[*n].clone()).collect();
                            cycle.push(self.nodes[next].clone());
                            return Some(cycle);
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[*node] = Mark::Done;
                    path.pop();
                    stack.pop();
                }
            }
        }
        None
    }
}

fn dangling(from: &ResourceId, to: &ResourceId) -> CoreError {
    CoreError::InvalidSpecification(format!("{} references unknown resource {}", from, to))
}

fn expect_kind(
    set: &DescriptorSet,
    from: &ResourceId,
    to: &ResourceId,
    kind: ResourceKind,
) -> CoreResult<()> {
    let descriptor = set.get(to).ok_or_else(|| dangling(from, to))?;
    if descriptor.kind() != kind {
        return Err(CoreError::InvalidSpecification(format!(
            "{} expects {} to be a {}, found {}",
            from,
            to,
            kind,
            descriptor.kind()
        )));
    }
    Ok(())
}
