//! The build graph: requirement and unit nodes, their explicit and inferred
//! edges, and dependency closures.

use crate::infer::InferredDependencies;
use crate::partition::{self, ResolveViolation};
use crate::registry::RequirementRegistry;
use crate::units::Unit;
use crate::CoreError;
use reslock_schema::types::{Address, ResolveName};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Requirement,
    Unit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub address: Address,
    pub family: Address,
    pub kind: NodeKind,
    pub resolve: ResolveName,
    pub explicit: BTreeSet<Address>,
    /// Targets of `!` edges; never followed and never inferred.
    pub excluded: BTreeSet<Address>,
    pub inferred: BTreeSet<Address>,
}

impl GraphNode {
    /// Explicit and inferred edges, minus exclusions.
    pub fn dependencies(&self) -> impl Iterator<Item = &Address> {
        self.explicit
            .union(&self.inferred)
            .filter(|a| !self.excluded.contains(*a))
    }
}

/// The nodes and roots a task needs, all in one resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closure {
    pub resolve: ResolveName,
    pub roots: Vec<Address>,
    pub requirements: Vec<Address>,
    pub units: Vec<Address>,
}

#[derive(Debug)]
pub struct BuildGraph {
    registry: Arc<RequirementRegistry>,
    nodes: BTreeMap<Address, GraphNode>,
    families: BTreeMap<Address, Vec<Address>>,
    units: BTreeMap<Address, Unit>,
}

impl BuildGraph {
    /// Build the graph and reject it if any explicit edge crosses resolves.
    pub fn construct(registry: Arc<RequirementRegistry>, units: Vec<Unit>) -> Result<Self, CoreError> {
        let graph = Self::construct_unchecked(registry, units)?;
        let violations = partition::validate(&graph);
        if !violations.is_empty() {
            return Err(CoreError::CrossResolve(violations));
        }
        Ok(graph)
    }

    /// Build the graph, resolving every written edge, without resolve validation.
    pub fn construct_unchecked(
        registry: Arc<RequirementRegistry>,
        units: Vec<Unit>,
    ) -> Result<Self, CoreError> {
        let mut nodes = BTreeMap::new();
        let mut families: BTreeMap<Address, Vec<Address>> = BTreeMap::new();
        let mut raw_edges: Vec<(Address, Vec<String>)> = Vec::new();

        for req in registry.iter() {
            nodes.insert(
                req.address.clone(),
                new_node(&req.address, &req.family, NodeKind::Requirement, &req.resolve),
            );
            families
                .entry(req.family.clone())
                .or_default()
                .push(req.address.clone());
            raw_edges.push((req.address.clone(), req.dependencies.clone()));
        }
        let mut unit_map = BTreeMap::new();
        for unit in units {
            if nodes.contains_key(&unit.address) {
                return Err(CoreError::DuplicateAddress(unit.address.to_string()));
            }
            nodes.insert(
                unit.address.clone(),
                new_node(&unit.address, &unit.family, NodeKind::Unit, &unit.resolve),
            );
            families
                .entry(unit.family.clone())
                .or_default()
                .push(unit.address.clone());
            raw_edges.push((unit.address.clone(), unit.dependencies.clone()));
            unit_map.insert(unit.address.clone(), unit);
        }

        let mut graph = Self {
            registry,
            nodes,
            families,
            units: unit_map,
        };
        for (from, deps) in raw_edges {
            let resolve = graph.nodes[&from].resolve.clone();
            let mut explicit = BTreeSet::new();
            let mut excluded = BTreeSet::new();
            for dep in deps {
                let dep = dep.trim();
                let (target, is_exclusion) = match dep.strip_prefix('!') {
                    Some(t) => (t.trim(), true),
                    None => (dep, false),
                };
                let resolved = graph.bind(target, &resolve).ok_or_else(|| {
                    CoreError::UnknownDependency {
                        from: from.to_string(),
                        to: target.to_owned(),
                    }
                })?;
                if is_exclusion {
                    excluded.insert(resolved);
                } else {
                    explicit.insert(resolved);
                }
            }
            if let Some(node) = graph.nodes.get_mut(&from) {
                node.explicit = explicit;
                node.excluded = excluded;
            }
        }
        Ok(graph)
    }

    /// Bind a written edge target: an exact address, or a family resolved to
    /// its copy in `resolve`, else to the family's first copy.
    fn bind(&self, target: &str, resolve: &str) -> Option<Address> {
        if self.nodes.contains_key(target) {
            return Some(Address::new(target));
        }
        let copies = self.families.get(target)?;
        copies
            .iter()
            .find(|c| self.nodes[*c].resolve.as_str() == resolve)
            .or_else(|| copies.first())
            .cloned()
    }

    /// Record a unit's inferred edges. Inferred targets must exist and share the unit's resolve.
    pub fn add_inferred(
        &mut self,
        unit: &Address,
        inferred: &InferredDependencies,
    ) -> Result<(), CoreError> {
        let node = self
            .nodes
            .get(unit)
            .ok_or_else(|| CoreError::UnknownAddress(unit.to_string()))?;
        let mut violations = Vec::new();
        for target in inferred.requirements.iter().chain(&inferred.first_party) {
            let Some(to) = self.nodes.get(target) else {
                return Err(CoreError::UnknownDependency {
                    from: unit.to_string(),
                    to: target.to_string(),
                });
            };
            if to.resolve != node.resolve {
                violations.push(ResolveViolation::CrossResolveEdge {
                    from: node.address.clone(),
                    from_resolve: node.resolve.clone(),
                    to: to.address.clone(),
                    to_resolve: to.resolve.clone(),
                });
            }
        }
        if !violations.is_empty() {
            return Err(CoreError::CrossResolve(violations));
        }
        if let Some(node) = self.nodes.get_mut(unit) {
            node.inferred.extend(
                inferred
                    .requirements
                    .iter()
                    .chain(&inferred.first_party)
                    .cloned(),
            );
        }
        Ok(())
    }

    /// Every edge as `(from, to)` node pairs.
    pub fn edges(&self) -> impl Iterator<Item = (&GraphNode, &GraphNode)> {
        self.nodes.values().flat_map(move |from| {
            from.dependencies()
                .filter_map(move |to| self.nodes.get(to).map(|to| (from, to)))
        })
    }

    pub fn registry(&self) -> &Arc<RequirementRegistry> {
        &self.registry
    }

    pub fn node(&self, address: &str) -> Option<&GraphNode> {
        self.nodes.get(address)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn unit(&self, address: &str) -> Option<&Unit> {
        self.units.get(address)
    }

    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    /// Find a node by exact address, or by a family that has a single copy.
    pub fn lookup(&self, address: &str) -> Result<&GraphNode, CoreError> {
        let address = address.trim();
        if let Some(node) = self.nodes.get(address) {
            return Ok(node);
        }
        match self.families.get(address).map(Vec::as_slice) {
            Some([only]) => Ok(&self.nodes[only]),
            Some(copies) => Err(CoreError::AmbiguousAddress {
                address: address.to_owned(),
                candidates: copies.iter().map(ToString::to_string).collect(),
            }),
            None => Err(CoreError::UnknownAddress(address.to_owned())),
        }
    }

    /// Transitive dependencies of `roots`, which must share one resolve.
    pub fn closure<S: AsRef<str>>(&self, roots: &[S]) -> Result<Closure, CoreError> {
        let mut root_nodes = Vec::new();
        for root in roots {
            root_nodes.push(self.lookup(root.as_ref())?);
        }
        let Some(first) = root_nodes.first() else {
            return Err(CoreError::EmptyClosure);
        };
        let resolves: BTreeSet<&str> = root_nodes.iter().map(|n| n.resolve.as_str()).collect();
        if resolves.len() > 1 {
            return Err(CoreError::MixedResolves {
                resolves: resolves.into_iter().map(str::to_owned).collect(),
            });
        }

        let mut seen: BTreeSet<&Address> = BTreeSet::new();
        let mut stack: Vec<&GraphNode> = root_nodes.clone();
        while let Some(node) = stack.pop() {
            if !seen.insert(&node.address) {
                continue;
            }
            for dep in node.dependencies() {
                if let Some(next) = self.nodes.get(dep) {
                    stack.push(next);
                }
            }
        }

        let mut requirements = Vec::new();
        let mut units = Vec::new();
        for address in seen {
            match self.nodes[address].kind {
                NodeKind::Requirement => requirements.push(address.clone()),
                NodeKind::Unit => units.push(address.clone()),
            }
        }
        Ok(Closure {
            resolve: first.resolve.clone(),
            roots: root_nodes.iter().map(|n| n.address.clone()).collect(),
            requirements,
            units,
        })
    }
}

fn new_node(address: &Address, family: &Address, kind: NodeKind, resolve: &ResolveName) -> GraphNode {
    GraphNode {
        address: address.clone(),
        family: family.clone(),
        kind,
        resolve: resolve.clone(),
        explicit: BTreeSet::new(),
        excluded: BTreeSet::new(),
        inferred: BTreeSet::new(),
    }
}
