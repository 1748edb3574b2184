use crate::config::{
    AmbiguityBehavior, ConfigError, ConfigV1, InstallerSection, InvalidLockfileBehavior,
    RequirementDecl, RequirementsFileDecl, ResolveField, ResolveSection, SolverSection,
    UnitDecl, UnownedDependencyBehavior, DEFAULT_LOCKFILE_PATH, DEFAULT_RESOLVE_NAME,
};
use crate::default_mapping::DefaultModuleMapping;
use crate::marker::{default_target_environments, Marker, TargetEnvironment};
use crate::requirement::{parse_specifier, validate_name};
use crate::types::ResolveName;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// A declared resolve after defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveConfig {
    pub name: ResolveName,
    /// Lockfile path relative to the configuration root.
    pub lockfile: PathBuf,
    pub is_default: bool,
    /// Sorted and deduplicated; falls back to the global constraints.
    pub interpreter_constraints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferencePolicy {
    pub unowned_dependency_behavior: UnownedDependencyBehavior,
    pub ambiguity_behavior: AmbiguityBehavior,
    pub ignored_modules: BTreeSet<String>,
}

/// Validated configuration with all defaults resolved.
///
/// Resolve references in requirement, requirements-file and unit declarations
/// are known to exist; declarations are otherwise kept as written so that
/// the partitioner can expand them.
#[derive(Debug, Clone)]
pub struct NormalizedConfig {
    pub default_resolve: ResolveName,
    pub resolves: BTreeMap<ResolveName, ResolveConfig>,
    pub target_environments: Vec<TargetEnvironment>,
    pub solver: SolverSection,
    pub installer: InstallerSection,
    pub inference: InferencePolicy,
    pub invalid_lockfile_behavior: InvalidLockfileBehavior,
    pub module_mapping: DefaultModuleMapping,
    pub requirements: Vec<RequirementDecl>,
    pub requirements_files: Vec<RequirementsFileDecl>,
    pub units: Vec<UnitDecl>,
}

impl ConfigV1 {
    /// Validate the configuration and resolve defaults.
    pub fn normalize(&self) -> Result<NormalizedConfig, ConfigError> {
        if self.config_version != 1 {
            return Err(ConfigError::UnsupportedVersion(self.config_version));
        }
        if self.solver.attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }

        let global_constraints = normalize_string_list(&self.interpreter_constraints);
        let declared: BTreeMap<String, ResolveSection> = if self.resolves.is_empty() {
            BTreeMap::from([(
                DEFAULT_RESOLVE_NAME.to_owned(),
                ResolveSection {
                    lockfile: DEFAULT_LOCKFILE_PATH.to_owned(),
                    interpreter_constraints: None,
                },
            )])
        } else {
            self.resolves.clone()
        };

        let default_name = self.default_resolve.trim();
        if !declared.contains_key(default_name) {
            return Err(ConfigError::UnknownDefaultResolve(default_name.to_owned()));
        }

        let mut resolves = BTreeMap::new();
        let mut lockfile_owners: BTreeMap<PathBuf, String> = BTreeMap::new();
        for (name, section) in &declared {
            if !is_valid_resolve_name(name) {
                return Err(ConfigError::InvalidResolveName(name.clone()));
            }
            let lockfile = PathBuf::from(section.lockfile.trim());
            if let Some(first) = lockfile_owners.insert(lockfile.clone(), name.clone()) {
                return Err(ConfigError::SharedLockfile {
                    path: section.lockfile.clone(),
                    first,
                    second: name.clone(),
                });
            }
            let interpreter_constraints = match &section.interpreter_constraints {
                Some(ics) => normalize_string_list(ics),
                None => global_constraints.clone(),
            };
            resolves.insert(
                ResolveName::new(name.as_str()),
                ResolveConfig {
                    name: ResolveName::new(name.as_str()),
                    lockfile,
                    is_default: name == default_name,
                    interpreter_constraints,
                },
            );
        }

        let normalized = NormalizedConfig {
            default_resolve: ResolveName::new(default_name),
            resolves,
            target_environments: if self.target_environments.is_empty() {
                default_target_environments()
            } else {
                self.target_environments.clone()
            },
            solver: self.solver.clone(),
            installer: self.installer.clone(),
            inference: InferencePolicy {
                unowned_dependency_behavior: self.inference.unowned_dependency_behavior,
                ambiguity_behavior: self.inference.ambiguity_behavior,
                ignored_modules: normalize_string_list(&self.inference.ignored_modules)
                    .into_iter()
                    .collect(),
            },
            invalid_lockfile_behavior: self.invalid_lockfile_behavior,
            module_mapping: DefaultModuleMapping::builtin()
                .with_overrides(&self.module_mapping, &self.type_stubs_module_mapping),
            requirements: self.requirements.clone(),
            requirements_files: self.requirements_files.clone(),
            units: self.units.clone(),
        };

        for decl in &normalized.requirements {
            normalized.validate_requirement(decl)?;
        }
        for file in &normalized.requirements_files {
            normalized.check_resolve_field(
                file.resolve.as_ref(),
                &format!("requirements file '{}'", file.path),
            )?;
        }
        for unit in &normalized.units {
            if unit.address.trim().is_empty() {
                return Err(ConfigError::EmptyAddress);
            }
            normalized
                .check_resolve_field(unit.resolve.as_ref(), &format!("unit '{}'", unit.address))?;
        }

        Ok(normalized)
    }
}

impl NormalizedConfig {
    pub fn default_resolve(&self) -> &ResolveConfig {
        // normalize() guarantees the default exists.
        &self.resolves[&self.default_resolve]
    }

    pub fn resolve(&self, name: &str) -> Option<&ResolveConfig> {
        self.resolves.get(name)
    }

    /// Check a requirement declaration, including ones generated from requirements files.
    pub fn validate_requirement(&self, decl: &RequirementDecl) -> Result<(), ConfigError> {
        if decl.modules.is_some() && decl.type_stub_modules.is_some() {
            return Err(ConfigError::ModulesAndStubs(decl.name.clone()));
        }
        validate_name(&decl.name)?;
        for spec in &decl.specifiers {
            parse_specifier(spec)?;
        }
        if let Some(markers) = &decl.markers {
            Marker::parse(markers)?;
        }
        self.check_resolve_field(
            decl.resolve.as_ref(),
            &format!("requirement '{}'", decl.target_name()),
        )
    }

    pub fn check_resolve_field(
        &self,
        field: Option<&ResolveField>,
        context: &str,
    ) -> Result<(), ConfigError> {
        let Some(field) = field else {
            return Ok(());
        };
        let names = field.names();
        if names.is_empty() {
            return Err(ConfigError::EmptyParametrize(context.to_owned()));
        }
        for name in names {
            if !self.resolves.contains_key(name.trim()) {
                return Err(ConfigError::UnknownResolve {
                    name: name.to_owned(),
                    context: context.to_owned(),
                });
            }
        }
        Ok(())
    }
}

fn is_valid_resolve_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub(crate) fn normalize_string_list(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = values
        .iter()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use crate::config::parse_config_str;
    use crate::config::ConfigError;

    #[test]
    fn defaults_to_single_python_default_resolve() {
        let normalized = parse_config_str("config_version = 1\n")
            .unwrap()
            .normalize()
            .unwrap();
        assert_eq!(normalized.resolves.len(), 1);
        let default = normalized.default_resolve();
        assert_eq!(default.name, "python-default");
        assert!(default.is_default);
        assert_eq!(
            default.lockfile.to_str(),
            Some("3rdparty/python/default.lock")
        );
        assert_eq!(normalized.target_environments.len(), 2);
    }

    #[test]
    fn resolve_constraints_fall_back_to_global() {
        let normalized = parse_config_str(
            r#"
config_version = 1
default_resolve = "a"
interpreter_constraints = ["CPython>=3.8", " CPython>=3.8 "]
[resolves.a]
lockfile = "a.lock"
[resolves.b]
lockfile = "b.lock"
interpreter_constraints = ["CPython==3.11.*"]
"#,
        )
        .unwrap()
        .normalize()
        .unwrap();
        assert_eq!(
            normalized.resolve("a").unwrap().interpreter_constraints,
            vec!["CPython>=3.8"]
        );
        assert_eq!(
            normalized.resolve("b").unwrap().interpreter_constraints,
            vec!["CPython==3.11.*"]
        );
        assert!(!normalized.resolve("b").unwrap().is_default);
    }

    #[test]
    fn rejects_missing_default_resolve() {
        let err = parse_config_str(
            r#"
config_version = 1
default_resolve = "nope"
[resolves.a]
lockfile = "a.lock"
"#,
        )
        .unwrap()
        .normalize()
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDefaultResolve(_)));
    }

    #[test]
    fn rejects_unknown_resolve_reference() {
        let err = parse_config_str(
            r#"
config_version = 1
[[requirement]]
name = "flask"
resolve = { parametrize = ["python-default", "web"] }
"#,
        )
        .unwrap()
        .normalize()
        .unwrap_err();
        match err {
            ConfigError::UnknownResolve { name, context } => {
                assert_eq!(name, "web");
                assert!(context.contains("flask"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_empty_parametrize() {
        let err = parse_config_str(
            r#"
config_version = 1
[[unit]]
address = "src/a.py"
resolve = { parametrize = [] }
"#,
        )
        .unwrap()
        .normalize()
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyParametrize(_)));
    }

    #[test]
    fn rejects_modules_and_stub_modules_together() {
        let err = parse_config_str(
            r#"
config_version = 1
[[requirement]]
name = "foo"
modules = ["foo"]
type_stub_modules = ["foo"]
"#,
        )
        .unwrap()
        .normalize()
        .unwrap_err();
        assert!(matches!(err, ConfigError::ModulesAndStubs(_)));
    }

    #[test]
    fn rejects_shared_lockfile() {
        let err = parse_config_str(
            r#"
config_version = 1
default_resolve = "a"
[resolves.a]
lockfile = "same.lock"
[resolves.b]
lockfile = "same.lock"
"#,
        )
        .unwrap()
        .normalize()
        .unwrap_err();
        assert!(matches!(err, ConfigError::SharedLockfile { .. }));
    }

    #[test]
    fn rejects_bad_specifier_and_marker() {
        let bad_spec = parse_config_str(
            r#"
config_version = 1
[[requirement]]
name = "foo"
specifiers = ["banana"]
"#,
        )
        .unwrap()
        .normalize();
        assert!(matches!(bad_spec, Err(ConfigError::Requirement(_))));

        let bad_marker = parse_config_str(
            r#"
config_version = 1
[[requirement]]
name = "foo"
markers = "python_version <"
"#,
        )
        .unwrap()
        .normalize();
        assert!(matches!(bad_marker, Err(ConfigError::Marker(_))));
    }

    #[test]
    fn rejects_version_and_attempts() {
        let err = parse_config_str("config_version = 2\n")
            .unwrap()
            .normalize()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(2)));

        let err = parse_config_str("config_version = 1\n[solver]\nattempts = 0\n")
            .unwrap()
            .normalize()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroAttempts));
    }

    #[test]
    fn rejects_invalid_resolve_name() {
        let err = parse_config_str(
            r#"
config_version = 1
default_resolve = "has space"
[resolves."has space"]
lockfile = "x.lock"
"#,
        )
        .unwrap()
        .normalize()
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidResolveName(_)));
    }
}
