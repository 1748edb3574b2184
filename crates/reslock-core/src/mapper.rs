//! Resolve-scoped mapping from importable modules to the requirements that
//! provide them.

use crate::registry::{Requirement, RequirementRegistry};
use reslock_schema::default_mapping::DefaultModuleMapping;
use reslock_schema::requirement::{
    is_type_stub_distribution, module_from_distribution, strip_type_stub_affix,
};
use reslock_schema::types::{Address, ModuleName, ResolveName};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvidedModules {
    pub modules: Vec<ModuleName>,
    pub type_stub_modules: Vec<ModuleName>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleOwner {
    /// One implementation, one stub distribution, or one of each.
    Owned(Vec<Address>),
    /// Several implementations or several stub distributions.
    Ambiguous(Vec<Address>),
    Unowned,
}

#[derive(Debug, Default)]
struct ResolveModules {
    implementations: BTreeMap<String, BTreeSet<Address>>,
    type_stubs: BTreeMap<String, BTreeSet<Address>>,
}

/// Built once from the registry; never mutated afterwards.
#[derive(Debug)]
pub struct ModuleMapper {
    defaults: Arc<DefaultModuleMapping>,
    by_resolve: BTreeMap<ResolveName, ResolveModules>,
}

impl ModuleMapper {
    pub fn new(registry: &RequirementRegistry, defaults: Arc<DefaultModuleMapping>) -> Self {
        let mut mapper = Self {
            defaults,
            by_resolve: BTreeMap::new(),
        };
        for req in registry.iter() {
            let provided = mapper.modules_for(req);
            let entry = mapper.by_resolve.entry(req.resolve.clone()).or_default();
            for module in provided.modules {
                entry
                    .implementations
                    .entry(module.into_inner())
                    .or_default()
                    .insert(req.address.clone());
            }
            for module in provided.type_stub_modules {
                entry
                    .type_stubs
                    .entry(module.into_inner())
                    .or_default()
                    .insert(req.address.clone());
            }
        }
        mapper
    }

    /// Modules a requirement provides: explicit, then curated, then its normalized name.
    pub fn modules_for(&self, req: &Requirement) -> ProvidedModules {
        if let Some(modules) = &req.modules {
            return ProvidedModules {
                modules: modules.clone(),
                type_stub_modules: Vec::new(),
            };
        }
        if let Some(stubs) = &req.type_stub_modules {
            return ProvidedModules {
                modules: Vec::new(),
                type_stub_modules: stubs.clone(),
            };
        }
        if let Some(stubs) = self.defaults.type_stub_modules_for(&req.name) {
            return ProvidedModules {
                modules: Vec::new(),
                type_stub_modules: stubs.to_vec(),
            };
        }
        if is_type_stub_distribution(&req.name) {
            let stripped = strip_type_stub_affix(&req.name);
            return ProvidedModules {
                modules: Vec::new(),
                type_stub_modules: self.default_or_fallback(&stripped),
            };
        }
        ProvidedModules {
            modules: self.default_or_fallback(&req.name),
            type_stub_modules: Vec::new(),
        }
    }

    fn default_or_fallback(&self, distribution: &str) -> Vec<ModuleName> {
        self.defaults.modules_for(distribution).map_or_else(
            || vec![ModuleName::new(module_from_distribution(distribution))],
            <[ModuleName]>::to_vec,
        )
    }

    /// Owners of `module` in `resolve`, trying the full name then each parent.
    pub fn requirement_for(&self, module: &ModuleName, resolve: &str) -> ModuleOwner {
        let Some(modules) = self.by_resolve.get(resolve) else {
            return ModuleOwner::Unowned;
        };
        for prefix in module.prefixes() {
            let implementations = modules.implementations.get(prefix);
            let stubs = modules.type_stubs.get(prefix);
            if implementations.is_none() && stubs.is_none() {
                continue;
            }
            let implementations = implementations.map_or(0, BTreeSet::len);
            let stub_count = stubs.map_or(0, BTreeSet::len);
            let all: Vec<Address> = modules
                .implementations
                .get(prefix)
                .into_iter()
                .chain(stubs)
                .flatten()
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            return if implementations > 1 || stub_count > 1 {
                ModuleOwner::Ambiguous(all)
            } else {
                ModuleOwner::Owned(all)
            };
        }
        ModuleOwner::Unowned
    }

    /// Modules with more than one implementation or stub owner in `resolve`.
    pub fn ambiguous_modules(&self, resolve: &str) -> Vec<(ModuleName, Vec<Address>)> {
        let Some(modules) = self.by_resolve.get(resolve) else {
            return Vec::new();
        };
        let mut names: BTreeSet<&String> = BTreeSet::new();
        for (name, owners) in modules.implementations.iter().chain(&modules.type_stubs) {
            if owners.len() > 1 {
                names.insert(name);
            }
        }
        names
            .into_iter()
            .filter_map(|name| {
                let module = ModuleName::new(name.as_str());
                match self.requirement_for(&module, resolve) {
                    ModuleOwner::Ambiguous(owners) => Some((module, owners)),
                    _ => None,
                }
            })
            .collect()
    }
}
