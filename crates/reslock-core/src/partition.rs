//! Assigning declarations to resolves, expanding parametrized declarations
//! into per-resolve copies, and validating that no edge crosses resolves.

use crate::graph::BuildGraph;
use crate::CoreError;
use reslock_schema::config::{ConfigError, ResolveField};
use reslock_schema::normalize::NormalizedConfig;
use reslock_schema::types::{Address, ResolveName};
use std::fmt;

/// Separates a family address from the resolve parameter of a copy.
pub const PARAMETRIZE_SEPARATOR: &str = "@resolve=";

/// One node produced by expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedNode {
    pub address: Address,
    pub family: Address,
    pub resolve: ResolveName,
}

pub fn parametrized_address(family: &str, resolve: &str) -> Address {
    Address::new(format!("{family}{PARAMETRIZE_SEPARATOR}{resolve}"))
}

/// The unparametrized part of an address.
pub fn family_of(address: &str) -> &str {
    address
        .split_once(PARAMETRIZE_SEPARATOR)
        .map_or(address, |(family, _)| family)
}

/// Resolve named by a single-valued resolve field, or the default.
pub fn assign(resolve: Option<&str>, config: &NormalizedConfig) -> Result<ResolveName, ConfigError> {
    match resolve.map(str::trim) {
        None => Ok(config.default_resolve.clone()),
        Some(name) => config
            .resolve(name)
            .map(|r| r.name.clone())
            .ok_or_else(|| ConfigError::UnknownResolve {
                name: name.to_owned(),
                context: "resolve assignment".to_owned(),
            }),
    }
}

/// Expand one declaration into its resolve-scoped nodes.
///
/// A single resolve keeps the family address; `parametrize` produces one copy
/// per listed resolve, addressed `<family>@resolve=<name>`, in listed order.
pub fn expand(
    family: &Address,
    field: Option<&ResolveField>,
    config: &NormalizedConfig,
) -> Result<Vec<ExpandedNode>, CoreError> {
    if family.is_empty() {
        return Err(ConfigError::EmptyAddress.into());
    }
    match field {
        None => Ok(vec![ExpandedNode {
            address: family.clone(),
            family: family.clone(),
            resolve: assign(None, config)?,
        }]),
        Some(ResolveField::Single(name)) => Ok(vec![ExpandedNode {
            address: family.clone(),
            family: family.clone(),
            resolve: assign(Some(name), config)?,
        }]),
        Some(ResolveField::Parametrize { parametrize }) => {
            if parametrize.is_empty() {
                return Err(ConfigError::EmptyParametrize(family.to_string()).into());
            }
            let mut nodes: Vec<ExpandedNode> = Vec::with_capacity(parametrize.len());
            for name in parametrize {
                let resolve = assign(Some(name), config)?;
                if nodes.iter().any(|n| n.resolve == resolve) {
                    continue;
                }
                nodes.push(ExpandedNode {
                    address: parametrized_address(family, &resolve),
                    family: family.clone(),
                    resolve,
                });
            }
            Ok(nodes)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveViolation {
    CrossResolveEdge {
        from: Address,
        from_resolve: ResolveName,
        to: Address,
        to_resolve: ResolveName,
    },
}

impl fmt::Display for ResolveViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveViolation::CrossResolveEdge {
                from,
                from_resolve,
                to,
                to_resolve,
            } => write!(
                f,
                "{from} uses resolve '{from_resolve}' but depends on {to}, which uses resolve '{to_resolve}'"
            ),
        }
    }
}

/// One violation per edge whose endpoints sit in different resolves.
pub fn validate(graph: &BuildGraph) -> Vec<ResolveViolation> {
    let mut violations = Vec::new();
    for (from, to) in graph.edges() {
        if from.resolve != to.resolve {
            violations.push(ResolveViolation::CrossResolveEdge {
                from: from.address.clone(),
                from_resolve: from.resolve.clone(),
                to: to.address.clone(),
                to_resolve: to.resolve.clone(),
            });
        }
    }
    violations
}
