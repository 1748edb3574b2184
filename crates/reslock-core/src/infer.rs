//! Inferring a unit's requirement edges from its imports.
//!
//! Inference is pure: it reads the unit, the registry and the module mapper,
//! all immutable, and is safe to run from any number of threads.

use crate::imports::ParsedImport;
use crate::mapper::{ModuleMapper, ModuleOwner};
use crate::partition::family_of;
use crate::registry::RequirementRegistry;
use crate::units::Unit;
use reslock_schema::config::{AmbiguityBehavior, UnownedDependencyBehavior};
use reslock_schema::default_mapping::is_stdlib_module;
use reslock_schema::normalize::InferencePolicy;
use reslock_schema::types::{Address, Fingerprint, ModuleName, ResolveName};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    AmbiguousModuleOwner {
        unit: Address,
        resolve: ResolveName,
        module: ModuleName,
        line: usize,
        candidates: Vec<Address>,
        severity: Severity,
    },
    UnownedImport {
        unit: Address,
        resolve: ResolveName,
        module: ModuleName,
        line: usize,
        severity: Severity,
    },
}

impl Diagnostic {
    pub fn severity(&self) -> Severity {
        match self {
            Diagnostic::AmbiguousModuleOwner { severity, .. }
            | Diagnostic::UnownedImport { severity, .. } => *severity,
        }
    }

    pub fn unit(&self) -> &Address {
        match self {
            Diagnostic::AmbiguousModuleOwner { unit, .. }
            | Diagnostic::UnownedImport { unit, .. } => unit,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::AmbiguousModuleOwner {
                unit,
                resolve,
                module,
                line,
                candidates,
                ..
            } => {
                let list: Vec<&str> = candidates.iter().map(Address::as_str).collect();
                write!(
                    f,
                    "{unit}:{line}: module '{module}' is provided by several requirements in resolve '{resolve}': {}; \
                     add one of them to the unit's dependencies, or exclude the others with '!'",
                    list.join(", ")
                )
            }
            Diagnostic::UnownedImport {
                unit,
                resolve,
                module,
                line,
                ..
            } => write!(
                f,
                "{unit}:{line}: no requirement in resolve '{resolve}' provides module '{module}'; \
                 declare a requirement for it, or mark the import with '# reslock: no-infer-dep'"
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferredDependencies {
    pub requirements: BTreeSet<Address>,
    /// First-party units in the same resolve that provide imported modules.
    pub first_party: BTreeSet<Address>,
    pub diagnostics: Vec<Diagnostic>,
}

impl InferredDependencies {
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity() == Severity::Error)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }
}

/// The unit's explicit edges, split into inclusions and `!` exclusions.
struct ExplicitEdges<'a> {
    included: Vec<&'a str>,
    excluded: Vec<&'a str>,
}

impl<'a> ExplicitEdges<'a> {
    fn of(unit: &'a Unit) -> Self {
        let mut included = Vec::new();
        let mut excluded = Vec::new();
        for dep in &unit.dependencies {
            match dep.trim().strip_prefix('!') {
                Some(target) => excluded.push(target.trim()),
                None => included.push(dep.trim()),
            }
        }
        Self { included, excluded }
    }

    fn includes(&self, address: &str) -> bool {
        self.included.iter().any(|d| names(d, address))
    }

    fn excludes(&self, address: &str) -> bool {
        self.excluded.iter().any(|d| names(d, address))
    }
}

/// Whether a written edge target refers to `address` or to its family.
fn names(written: &str, address: &str) -> bool {
    written == address || written == family_of(address)
}

pub struct InferenceEngine {
    mapper: Arc<ModuleMapper>,
    policy: InferencePolicy,
    first_party: BTreeMap<ResolveName, BTreeMap<String, BTreeSet<Address>>>,
    registry_fingerprint: Fingerprint,
}

impl InferenceEngine {
    pub fn new(
        registry: &RequirementRegistry,
        mapper: Arc<ModuleMapper>,
        units: &[Unit],
        policy: InferencePolicy,
    ) -> Self {
        let mut first_party: BTreeMap<ResolveName, BTreeMap<String, BTreeSet<Address>>> =
            BTreeMap::new();
        for unit in units {
            if let Some(module) = &unit.module {
                first_party
                    .entry(unit.resolve.clone())
                    .or_default()
                    .entry(module.to_string())
                    .or_default()
                    .insert(unit.address.clone());
            }
        }
        Self {
            mapper,
            policy,
            first_party,
            registry_fingerprint: registry.fingerprint().clone(),
        }
    }

    pub fn registry_fingerprint(&self) -> &Fingerprint {
        &self.registry_fingerprint
    }

    fn is_ignored(&self, module: &ModuleName) -> bool {
        is_stdlib_module(module.top_level())
            || module
                .prefixes()
                .any(|p| self.policy.ignored_modules.contains(p))
    }

    fn first_party_owners(&self, module: &ModuleName, resolve: &str) -> Option<&BTreeSet<Address>> {
        let modules = self.first_party.get(resolve)?;
        module.prefixes().find_map(|p| modules.get(p))
    }

    /// Infer requirement and first-party edges for `unit`, within its resolve.
    pub fn infer(&self, unit: &Unit) -> InferredDependencies {
        let explicit = ExplicitEdges::of(unit);
        let mut out = InferredDependencies::default();

        for import in &merge_imports(&unit.imports) {
            let module = &import.module;
            if self.is_ignored(module) {
                continue;
            }
            match self.mapper.requirement_for(module, &unit.resolve) {
                ModuleOwner::Owned(owners) => {
                    out.requirements
                        .extend(owners.into_iter().filter(|a| !explicit.excludes(a)));
                }
                ModuleOwner::Ambiguous(candidates) => {
                    if let Some(choice) = disambiguate(&explicit, &candidates) {
                        out.requirements.extend(choice);
                        continue;
                    }
                    let severity = match self.policy.ambiguity_behavior {
                        AmbiguityBehavior::Error if !import.weak => Severity::Error,
                        _ => Severity::Warning,
                    };
                    out.diagnostics.push(Diagnostic::AmbiguousModuleOwner {
                        unit: unit.address.clone(),
                        resolve: unit.resolve.clone(),
                        module: module.clone(),
                        line: import.line,
                        candidates,
                        severity,
                    });
                }
                ModuleOwner::Unowned => {
                    if let Some(owners) = self.first_party_owners(module, &unit.resolve) {
                        out.first_party.extend(
                            owners
                                .iter()
                                .filter(|a| **a != unit.address && !explicit.excludes(a))
                                .cloned(),
                        );
                        continue;
                    }
                    if import.weak {
                        continue;
                    }
                    let severity = match self.policy.unowned_dependency_behavior {
                        UnownedDependencyBehavior::Ignore => continue,
                        UnownedDependencyBehavior::Warning => Severity::Warning,
                        UnownedDependencyBehavior::Error => Severity::Error,
                    };
                    out.diagnostics.push(Diagnostic::UnownedImport {
                        unit: unit.address.clone(),
                        resolve: unit.resolve.clone(),
                        module: module.clone(),
                        line: import.line,
                        severity,
                    });
                }
            }
        }
        for diagnostic in &out.diagnostics {
            match diagnostic.severity() {
                Severity::Error => tracing::debug!("{diagnostic}"),
                Severity::Warning => tracing::warn!("{diagnostic}"),
            }
        }
        out
    }
}

/// One entry per module, in first-seen order. A module is weak only when every
/// import of it is weak; otherwise it is reported at its first strong import.
fn merge_imports(imports: &[ParsedImport]) -> Vec<ParsedImport> {
    let mut merged: Vec<ParsedImport> = Vec::with_capacity(imports.len());
    let mut index: HashMap<&ModuleName, usize> = HashMap::new();
    for import in imports {
        match index.get(&import.module) {
            Some(&i) => {
                let entry = &mut merged[i];
                if entry.weak && !import.weak {
                    entry.weak = false;
                    entry.line = import.line;
                }
            }
            None => {
                index.insert(&import.module, merged.len());
                merged.push(import.clone());
            }
        }
    }
    merged
}

/// `Some(choice)` when the explicit edges settle an ambiguity; `choice` is
/// empty when every candidate is excluded.
fn disambiguate(explicit: &ExplicitEdges<'_>, candidates: &[Address]) -> Option<Vec<Address>> {
    let included: Vec<&Address> = candidates
        .iter()
        .filter(|c| explicit.includes(c))
        .collect();
    if included.len() == 1 {
        return Some(vec![included[0].clone()]);
    }
    let remaining: Vec<&Address> = candidates
        .iter()
        .filter(|c| !explicit.excludes(c))
        .collect();
    match remaining.len() {
        0 => Some(Vec::new()),
        1 => Some(vec![remaining[0].clone()]),
        _ => None,
    }
}

type CacheKey = (Address, Fingerprint, Fingerprint);

/// Memoized inference keyed by unit address, unit fingerprint and registry fingerprint.
#[derive(Debug, Default)]
pub struct InferenceCache {
    entries: Mutex<HashMap<CacheKey, Arc<InferredDependencies>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_infer(&self, engine: &InferenceEngine, unit: &Unit) -> Arc<InferredDependencies> {
        let key = (
            unit.address.clone(),
            unit.fingerprint(),
            engine.registry_fingerprint().clone(),
        );
        if let Some(hit) = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let inferred = Arc::new(engine.infer(unit));
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(key).or_insert(inferred))
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imports::{ImportParser, PythonImportScanner};
    use crate::registry::Requirement;
    use reslock_schema::default_mapping::DefaultModuleMapping;

    fn policy() -> InferencePolicy {
        InferencePolicy {
            unowned_dependency_behavior: UnownedDependencyBehavior::Warning,
            ambiguity_behavior: AmbiguityBehavior::Warning,
            ignored_modules: BTreeSet::new(),
        }
    }

    fn engine(reqs: Vec<Requirement>, units: &[Unit], policy: InferencePolicy) -> InferenceEngine {
        let registry = RequirementRegistry::from_requirements(reqs).unwrap();
        let mapper = Arc::new(ModuleMapper::new(
            &registry,
            Arc::new(DefaultModuleMapping::builtin()),
        ));
        InferenceEngine::new(&registry, mapper, units, policy)
    }

    fn addrs(list: &[&str]) -> BTreeSet<Address> {
        list.iter().map(|a| Address::new(*a)).collect()
    }

    fn crypto_reqs() -> Vec<Requirement> {
        vec![
            Requirement::new("pycrypto", &[], "a"),
            Requirement::new("pycryptodome", &[], "a"),
        ]
    }

    #[test]
    fn owned_imports_become_edges() {
        let unit = Unit::new("app.py", "web", &["flask", "os", "yaml.loader"]);
        let e = engine(
            vec![
                Requirement::new("flask", &[">=2"], "web"),
                Requirement::new("PyYAML", &[], "web"),
            ],
            &[],
            policy(),
        );
        let inferred = e.infer(&unit);
        assert_eq!(inferred.requirements, addrs(&["req:flask", "req:PyYAML"]));
        assert!(inferred.diagnostics.is_empty());
    }

    #[test]
    fn ambiguity_without_disambiguation_is_diagnosed() {
        let unit = Unit::new("app.py", "a", &["Crypto.Cipher"]);
        let inferred = engine(crypto_reqs(), &[], policy()).infer(&unit);
        assert!(inferred.requirements.is_empty());
        assert_eq!(inferred.diagnostics.len(), 1);
        assert!(matches!(
            &inferred.diagnostics[0],
            Diagnostic::AmbiguousModuleOwner { severity: Severity::Warning, candidates, .. }
                if candidates.len() == 2
        ));
    }

    #[test]
    fn explicit_inclusion_disambiguates() {
        let unit = Unit::new("app.py", "a", &["Crypto"]).with_dependencies(&["req:pycryptodome"]);
        let inferred = engine(crypto_reqs(), &[], policy()).infer(&unit);
        assert_eq!(inferred.requirements, addrs(&["req:pycryptodome"]));
        assert!(inferred.diagnostics.is_empty());
    }

    #[test]
    fn exclusion_disambiguates() {
        let unit = Unit::new("app.py", "a", &["Crypto"]).with_dependencies(&["!req:pycrypto"]);
        let inferred = engine(crypto_reqs(), &[], policy()).infer(&unit);
        assert_eq!(inferred.requirements, addrs(&["req:pycryptodome"]));
        assert!(inferred.diagnostics.is_empty());
    }

    #[test]
    fn ambiguity_error_policy_spares_weak_imports() {
        let strict = InferencePolicy {
            ambiguity_behavior: AmbiguityBehavior::Error,
            ..policy()
        };
        let e = engine(crypto_reqs(), &[], strict);
        assert!(e.infer(&Unit::new("app.py", "a", &["Crypto"])).has_errors());

        let mut weak = Unit::new("app.py", "a", &["Crypto"]);
        weak.imports[0].weak = true;
        let inferred = e.infer(&weak);
        assert!(!inferred.has_errors());
        assert_eq!(inferred.diagnostics.len(), 1);

        // Nothing imports the ambiguous module, so nothing fails.
        assert!(!e.infer(&Unit::new("other.py", "a", &["json"])).has_errors());
    }

    #[test]
    fn unowned_import_policies() {
        let unit = Unit::new("app.py", "a", &["numpy", "sys", "conftest.helpers"]);
        let warn = engine(Vec::new(), &[], policy()).infer(&unit);
        assert_eq!(warn.diagnostics.len(), 2);
        assert!(!warn.has_errors());

        let strict = InferencePolicy {
            unowned_dependency_behavior: UnownedDependencyBehavior::Error,
            ignored_modules: ["conftest".to_owned()].into_iter().collect(),
            ..policy()
        };
        let errors = engine(Vec::new(), &[], strict).infer(&unit);
        assert_eq!(errors.diagnostics.len(), 1);
        assert!(errors.has_errors());
        assert!(errors.diagnostics[0].to_string().contains("numpy"));

        let ignore = InferencePolicy {
            unowned_dependency_behavior: UnownedDependencyBehavior::Ignore,
            ..policy()
        };
        assert!(engine(Vec::new(), &[], ignore).infer(&unit).diagnostics.is_empty());
    }

    #[test]
    fn weak_unowned_imports_are_silent() {
        let mut unit = Unit::new("app.py", "a", &["ujson"]);
        unit.imports[0].weak = true;
        let strict = InferencePolicy {
            unowned_dependency_behavior: UnownedDependencyBehavior::Error,
            ..policy()
        };
        assert!(engine(Vec::new(), &[], strict).infer(&unit).diagnostics.is_empty());
    }

    #[test]
    fn strong_import_after_weak_one_is_reported() {
        let mut unit = Unit::new("app.py", "a", &[]);
        unit.imports = PythonImportScanner.parse(
            "try:\n    import ujson\nexcept ImportError:\n    pass\n\nimport ujson\n",
        );
        assert_eq!(unit.imports.len(), 2);
        let strict = InferencePolicy {
            unowned_dependency_behavior: UnownedDependencyBehavior::Error,
            ..policy()
        };
        let inferred = engine(Vec::new(), &[], strict).infer(&unit);
        assert!(inferred.has_errors());
        assert_eq!(inferred.diagnostics.len(), 1);
        assert!(matches!(
            &inferred.diagnostics[0],
            Diagnostic::UnownedImport { line: 6, .. }
        ));

        let strict_ambiguity = InferencePolicy {
            ambiguity_behavior: AmbiguityBehavior::Error,
            ..policy()
        };
        let mut crypto = Unit::new("app.py", "a", &[]);
        crypto.imports = PythonImportScanner.parse(
            "try:\n    import Crypto\nexcept ImportError:\n    Crypto = None\nimport Crypto\n",
        );
        assert!(engine(crypto_reqs(), &[], strict_ambiguity)
            .infer(&crypto)
            .has_errors());
    }

    #[test]
    fn first_party_modules_are_owned_in_the_same_resolve() {
        let util_a = Unit::new("src/util.py@resolve=a", "a", &[]).with_module("app.util");
        let util_b = Unit::new("src/util.py@resolve=b", "b", &[]).with_module("app.util");
        let main = Unit::new("src/main.py", "a", &["app.util.strings"]);
        let units = vec![util_a, util_b, main.clone()];
        let inferred = engine(Vec::new(), &units, policy()).infer(&main);
        assert_eq!(inferred.first_party, addrs(&["src/util.py@resolve=a"]));
        assert!(inferred.diagnostics.is_empty());
    }

    #[test]
    fn excluded_owner_is_not_inferred() {
        let unit = Unit::new("app.py", "web", &["flask"]).with_dependencies(&["!req:flask"]);
        let inferred = engine(vec![Requirement::new("flask", &[], "web")], &[], policy())
            .infer(&unit);
        assert!(inferred.requirements.is_empty());
    }

    #[test]
    fn cache_memoizes_until_inputs_change() {
        let e = engine(vec![Requirement::new("flask", &[], "web")], &[], policy());
        let cache = InferenceCache::new();
        let unit = Unit::new("app.py", "web", &["flask"]);
        let first = cache.get_or_infer(&e, &unit);
        let second = cache.get_or_infer(&e, &unit);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!((cache.hits(), cache.misses()), (1, 1));

        let changed = Unit::new("app.py", "web", &["flask", "requests"]);
        let third = cache.get_or_infer(&e, &changed);
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(cache.misses(), 2);
    }
}
