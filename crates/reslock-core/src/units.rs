use crate::imports::{ImportParser, ParsedImport};
use crate::partition;
use crate::CoreError;
use reslock_schema::config::UnitDecl;
use reslock_schema::normalize::NormalizedConfig;
use reslock_schema::types::{Address, Fingerprint, ModuleName, ResolveName};
use std::path::Path;

/// A first-party compilation unit after resolve expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub address: Address,
    pub family: Address,
    pub resolve: ResolveName,
    /// Module this unit provides to other first-party code.
    pub module: Option<ModuleName>,
    pub imports: Vec<ParsedImport>,
    /// Declared edges as written; `!` prefixes mark exclusions.
    pub dependencies: Vec<String>,
}

impl Unit {
    pub fn new(address: &str, resolve: &str, imports: &[&str]) -> Self {
        Self {
            address: Address::new(address),
            family: Address::new(partition::family_of(address)),
            resolve: ResolveName::new(resolve),
            module: None,
            imports: imports
                .iter()
                .enumerate()
                .map(|(idx, m)| ParsedImport {
                    module: ModuleName::new(*m),
                    line: idx + 1,
                    weak: false,
                })
                .collect(),
            dependencies: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| (*d).to_owned()).collect();
        self
    }

    #[must_use]
    pub fn with_module(mut self, module: &str) -> Self {
        self.module = Some(ModuleName::new(module));
        self
    }

    /// Changes whenever anything inference reads from the unit changes.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(format!("unit:{}\nresolve:{}\n", self.address, self.resolve).as_bytes());
        if let Some(module) = &self.module {
            hasher.update(format!("module:{module}\n").as_bytes());
        }
        for import in &self.imports {
            hasher.update(
                format!("import:{}:{}:{}\n", import.module, import.line, import.weak).as_bytes(),
            );
        }
        for dep in &self.dependencies {
            hasher.update(format!("dep:{dep}\n").as_bytes());
        }
        Fingerprint::new(hasher.finalize().to_hex().to_string())
    }
}

/// Expand unit declarations and extract their imports.
///
/// A unit with `imports` uses them verbatim as strong imports; otherwise its
/// `source` file (relative to `root`) is scanned with `parser`.
pub fn load_units(
    config: &NormalizedConfig,
    root: &Path,
    parser: &dyn ImportParser,
) -> Result<Vec<Unit>, CoreError> {
    let mut units = Vec::new();
    for decl in &config.units {
        let imports = unit_imports(decl, root, parser)?;
        let module = decl
            .module
            .as_deref()
            .map(|m| ModuleName::new(m.trim()))
            .or_else(|| decl.source.as_deref().and_then(module_from_source));
        let family = Address::new(decl.address.trim());
        for node in partition::expand(&family, decl.resolve.as_ref(), config)? {
            units.push(Unit {
                address: node.address,
                family: node.family,
                resolve: node.resolve,
                module: module.clone(),
                imports: imports.clone(),
                dependencies: decl.dependencies.clone(),
            });
        }
    }
    Ok(units)
}

fn unit_imports(
    decl: &UnitDecl,
    root: &Path,
    parser: &dyn ImportParser,
) -> Result<Vec<ParsedImport>, CoreError> {
    if let Some(imports) = &decl.imports {
        return Ok(imports
            .iter()
            .enumerate()
            .map(|(idx, m)| ParsedImport {
                module: ModuleName::new(m.trim()),
                line: idx + 1,
                weak: false,
            })
            .collect());
    }
    let Some(source) = &decl.source else {
        return Ok(Vec::new());
    };
    let path = root.join(source);
    let content = std::fs::read_to_string(&path).map_err(|e| {
        CoreError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read source of unit {}: {}: {e}", decl.address, path.display()),
        ))
    })?;
    Ok(parser.parse(&content))
}

/// `src/app/util.py` provides `app.util`; `pkg/__init__.py` provides `pkg`.
pub fn module_from_source(source: &str) -> Option<ModuleName> {
    let path = source.trim().trim_start_matches("./");
    let stem = path.strip_suffix(".pyi").or_else(|| path.strip_suffix(".py"))?;
    let stem = stem.strip_prefix("src/").unwrap_or(stem);
    let mut parts: Vec<&str> = stem.split('/').filter(|p| !p.is_empty()).collect();
    if parts.last() == Some(&"__init__") {
        parts.pop();
    }
    if parts.is_empty() {
        return None;
    }
    Some(ModuleName::new(parts.join(".")))
}
