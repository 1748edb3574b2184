//! The requirement registry: every third-party requirement the project
//! declares, expanded into one entry per resolve.
//!
//! Built once from configuration (explicit `[[requirement]]` declarations and
//! `[[requirements_file]]` manifests) and read-only afterwards.

use crate::partition;
use crate::CoreError;
use reslock_schema::config::RequirementDecl;
use reslock_schema::fingerprint::requirements_fingerprint;
use reslock_schema::normalize::{NormalizedConfig, ResolveConfig};
use reslock_schema::requirement::{canonicalize_name, PipRequirement, RequirementSource};
use reslock_schema::types::{Address, Fingerprint, ModuleName, ResolveName};
use std::collections::BTreeMap;
use std::path::Path;

pub const REQUIREMENT_ADDRESS_PREFIX: &str = "req:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub address: Address,
    /// Unparametrized address shared by every copy of one declaration.
    pub family: Address,
    pub name: String,
    pub specifiers: Vec<String>,
    pub extras: Vec<String>,
    pub markers: Option<String>,
    pub modules: Option<Vec<ModuleName>>,
    pub type_stub_modules: Option<Vec<ModuleName>>,
    pub resolve: ResolveName,
    /// Declared edges to other requirements, as written.
    pub dependencies: Vec<String>,
    pub source: Option<RequirementSource>,
}

impl Requirement {
    /// A requirement with no modules, markers or edges; mostly useful in tests.
    pub fn new(name: &str, specifiers: &[&str], resolve: &str) -> Self {
        let family = Address::new(format!("{REQUIREMENT_ADDRESS_PREFIX}{name}"));
        Self {
            address: family.clone(),
            family,
            name: name.to_owned(),
            specifiers: specifiers.iter().map(|s| (*s).to_owned()).collect(),
            extras: Vec::new(),
            markers: None,
            modules: None,
            type_stub_modules: None,
            resolve: ResolveName::new(resolve),
            dependencies: Vec::new(),
            source: None,
        }
    }

    pub fn with_modules(mut self, modules: &[&str]) -> Self {
        self.modules = Some(modules.iter().map(|m| ModuleName::new(*m)).collect());
        self
    }

    pub fn with_type_stub_modules(mut self, modules: &[&str]) -> Self {
        self.type_stub_modules = Some(modules.iter().map(|m| ModuleName::new(*m)).collect());
        self
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = Address::new(address);
        self.family = Address::new(partition::family_of(address));
        self
    }

    pub fn canonical_name(&self) -> String {
        canonicalize_name(&self.name)
    }

    pub fn to_pip(&self) -> PipRequirement {
        PipRequirement {
            name: self.name.clone(),
            extras: self.extras.clone(),
            specifiers: self.specifiers.clone(),
            markers: self.markers.clone(),
            source: self.source.clone(),
        }
    }

    /// The requirement as handed to the solver, e.g. `flask[async]>=2.0 ; python_version >= "3.8"`.
    pub fn requirement_string(&self) -> String {
        self.to_pip().to_string()
    }

    fn from_decl(decl: &RequirementDecl, address: Address, family: Address, resolve: ResolveName) -> Self {
        let modules = |list: &Option<Vec<String>>| {
            list.as_ref()
                .map(|mods| mods.iter().map(|m| ModuleName::new(m.trim())).collect())
        };
        Self {
            address,
            family,
            name: decl.name.trim().to_owned(),
            specifiers: decl.specifiers.clone(),
            extras: decl.extras.clone(),
            markers: decl.markers.clone(),
            modules: modules(&decl.modules),
            type_stub_modules: modules(&decl.type_stub_modules),
            resolve,
            dependencies: decl.dependencies.clone(),
            source: decl.source.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequirementRegistry {
    requirements: BTreeMap<Address, Requirement>,
    fingerprint: Fingerprint,
}

impl RequirementRegistry {
    /// Load explicit declarations and requirements files relative to `root`.
    pub fn load(config: &NormalizedConfig, root: &Path) -> Result<Self, CoreError> {
        let mut decls = config.requirements.clone();
        for file in &config.requirements_files {
            let path = root.join(&file.path);
            let content = std::fs::read_to_string(&path).map_err(|e| {
                CoreError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to read requirements file {}: {e}", path.display()),
                ))
            })?;
            let generated = file.generate(&content)?;
            tracing::debug!(
                "generated {} requirements from {}",
                generated.len(),
                file.path
            );
            decls.extend(generated);
        }
        Self::from_declarations(config, &decls)
    }

    pub fn from_declarations(
        config: &NormalizedConfig,
        decls: &[RequirementDecl],
    ) -> Result<Self, CoreError> {
        let mut requirements = Vec::new();
        for decl in decls {
            config.validate_requirement(decl)?;
            let family = Address::new(format!(
                "{REQUIREMENT_ADDRESS_PREFIX}{}",
                decl.target_name().trim()
            ));
            for node in partition::expand(&family, decl.resolve.as_ref(), config)? {
                requirements.push(Requirement::from_decl(
                    decl,
                    node.address,
                    node.family,
                    node.resolve,
                ));
            }
        }
        Self::from_requirements(requirements)
    }

    pub fn from_requirements(requirements: Vec<Requirement>) -> Result<Self, CoreError> {
        let mut by_address = BTreeMap::new();
        let mut names: BTreeMap<(ResolveName, String), Address> = BTreeMap::new();
        for req in requirements {
            let key = (req.resolve.clone(), req.canonical_name());
            if let Some(first) = names.get(&key) {
                return Err(CoreError::DuplicateRequirement {
                    resolve: req.resolve.to_string(),
                    name: req.name.clone(),
                    first: first.to_string(),
                    second: req.address.to_string(),
                });
            }
            names.insert(key, req.address.clone());
            if by_address.contains_key(&req.address) {
                return Err(CoreError::DuplicateAddress(req.address.to_string()));
            }
            by_address.insert(req.address.clone(), req);
        }
        let fingerprint = registry_fingerprint(&by_address);
        Ok(Self {
            requirements: by_address,
            fingerprint,
        })
    }

    pub fn get(&self, address: &str) -> Option<&Requirement> {
        self.requirements.get(address)
    }

    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.values()
    }

    pub fn in_resolve<'a>(&'a self, resolve: &'a str) -> impl Iterator<Item = &'a Requirement> {
        self.requirements
            .values()
            .filter(move |r| r.resolve.as_str() == resolve)
    }

    /// Sorted requirement strings of one resolve's subset.
    pub fn requirement_strings(&self, resolve: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .in_resolve(resolve)
            .map(Requirement::requirement_string)
            .collect();
        out.sort();
        out
    }

    /// Fingerprint a lockfile for `resolve` must carry to be fresh.
    pub fn subset_fingerprint(&self, resolve: &ResolveConfig) -> Fingerprint {
        requirements_fingerprint(
            &self.requirement_strings(&resolve.name),
            &resolve.interpreter_constraints,
        )
    }

    /// Changes whenever any requirement, its modules or its edges change.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

fn registry_fingerprint(requirements: &BTreeMap<Address, Requirement>) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    let join = |mods: &Option<Vec<ModuleName>>| {
        mods.as_ref().map_or_else(
            || "-".to_owned(),
            |m| m.iter().map(ModuleName::as_str).collect::<Vec<_>>().join(","),
        )
    };
    for req in requirements.values() {
        hasher.update(
            format!(
                "{}|{}|{}|{}|{}|{}\n",
                req.address,
                req.resolve,
                req.requirement_string(),
                join(&req.modules),
                join(&req.type_stub_modules),
                req.dependencies.join(",")
            )
            .as_bytes(),
        );
    }
    Fingerprint::new(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reslock_schema::config::parse_config_str;

    const CONFIG: &str = r#"
config_version = 1
default_resolve = "a"

[resolves.a]
lockfile = "a.lock"
[resolves.b]
lockfile = "b.lock"

[[requirement]]
name = "requests"
specifiers = [">=2.0"]

[[requirement]]
name = "flask"
resolve = "b"

[[requirement]]
name = "six"
resolve = { parametrize = ["a", "b"] }
"#;

    fn load(content: &str) -> (NormalizedConfig, RequirementRegistry) {
        let config = parse_config_str(content).unwrap().normalize().unwrap();
        let registry = RequirementRegistry::load(&config, Path::new(".")).unwrap();
        (config, registry)
    }

    #[test]
    fn expands_and_partitions_declarations() {
        let (_, registry) = load(CONFIG);
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.get("req:requests").unwrap().resolve, "a");
        assert_eq!(registry.get("req:flask").unwrap().resolve, "b");
        let six_a = registry.get("req:six@resolve=a").unwrap();
        assert_eq!(six_a.family, "req:six");
        assert_eq!(six_a.resolve, "a");
        assert!(registry.get("req:six@resolve=b").is_some());
        assert_eq!(
            registry.requirement_strings("a"),
            vec!["requests>=2.0", "six"]
        );
        assert_eq!(registry.requirement_strings("b"), vec!["flask", "six"]);
    }

    #[test]
    fn specifier_change_only_moves_its_resolve() {
        let (config, before) = load(CONFIG);
        let (_, after) = load(&CONFIG.replace(">=2.0", ">=2.1"));
        let a = config.resolve("a").unwrap();
        let b = config.resolve("b").unwrap();
        assert_ne!(before.subset_fingerprint(a), after.subset_fingerprint(a));
        assert_eq!(before.subset_fingerprint(b), after.subset_fingerprint(b));
        assert_ne!(before.fingerprint(), after.fingerprint());
    }

    #[test]
    fn duplicate_name_in_one_resolve_is_rejected() {
        let err = RequirementRegistry::from_requirements(vec![
            Requirement::new("Django", &[], "a"),
            Requirement::new("django", &[">=4"], "a").with_address("req:django-4"),
        ])
        .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateRequirement { .. }));
        assert!(err.to_string().contains("req:django-4"));
    }

    #[test]
    fn same_name_in_different_resolves_is_allowed() {
        let registry = RequirementRegistry::from_requirements(vec![
            Requirement::new("protobuf", &["==3.20"], "a").with_address("req:protobuf-a"),
            Requirement::new("protobuf", &["==4.21"], "b").with_address("req:protobuf-b"),
        ])
        .unwrap();
        assert_eq!(registry.in_resolve("a").count(), 1);
        assert_eq!(registry.in_resolve("b").count(), 1);
    }

    #[test]
    fn loads_requirements_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("requirements.txt"),
            "# pinned\nPyYAML==6.0  # yaml\nattrs>=22\n",
        )
        .unwrap();
        let config = parse_config_str(
            r#"
config_version = 1
[[requirements_file]]
path = "requirements.txt"
module_mapping = { pyyaml = ["yaml"] }
"#,
        )
        .unwrap()
        .normalize()
        .unwrap();
        let registry = RequirementRegistry::load(&config, dir.path()).unwrap();
        let yaml = registry.get("req:PyYAML").unwrap();
        assert_eq!(yaml.resolve, "python-default");
        assert_eq!(yaml.modules.as_deref(), Some(&[ModuleName::new("yaml")][..]));
        assert!(registry.get("req:attrs").is_some());
    }

    #[test]
    fn missing_requirements_file_names_path() {
        let config = parse_config_str(
            "config_version = 1\n[[requirements_file]]\npath = \"nope.txt\"\n",
        )
        .unwrap()
        .normalize()
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = RequirementRegistry::load(&config, dir.path()).unwrap_err();
        assert!(err.to_string().contains("nope.txt"));
    }
}
