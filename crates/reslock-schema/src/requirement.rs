use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid requirement '{input}': {reason}")]
pub struct RequirementError {
    pub input: String,
    pub reason: String,
}

impl RequirementError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Explicit location a requirement is fetched from instead of the package index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequirementSource {
    Vcs {
        git: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rev: Option<String>,
    },
    Path {
        path: String,
    },
}

impl RequirementSource {
    fn to_url(&self) -> String {
        match self {
            RequirementSource::Vcs { git, rev: Some(rev) } => format!("git+{git}@{rev}"),
            RequirementSource::Vcs { git, rev: None } => format!("git+{git}"),
            RequirementSource::Path { path } => format!("file://{path}"),
        }
    }
}

const SPECIFIER_OPERATORS: &[&str] = &["===", "==", "!=", "<=", ">=", "~=", "<", ">"];

/// A single parsed requirement string: `name[extras] specifiers @ url ; markers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipRequirement {
    pub name: String,
    #[serde(default)]
    pub extras: Vec<String>,
    #[serde(default)]
    pub specifiers: Vec<String>,
    #[serde(default)]
    pub markers: Option<String>,
    #[serde(default)]
    pub source: Option<RequirementSource>,
}

impl PipRequirement {
    pub fn parse(input: &str) -> Result<Self, RequirementError> {
        let line = input.trim();
        let name_end = line
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .unwrap_or(line.len());
        let name = &line[..name_end];
        if name.is_empty() {
            return Err(RequirementError::new(input, "missing project name"));
        }

        let (body, markers) = match line[name_end..].split_once(';') {
            Some((body, markers)) => (body.trim(), Some(markers.trim())),
            None => (line[name_end..].trim(), None),
        };
        let markers = markers.filter(|m| !m.is_empty()).map(str::to_owned);

        let mut rest = body;
        let mut extras = Vec::new();
        if let Some(after) = rest.strip_prefix('[') {
            let Some((inner, tail)) = after.split_once(']') else {
                return Err(RequirementError::new(input, "unterminated extras"));
            };
            extras = inner
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_owned)
                .collect();
            rest = tail.trim();
        }

        if let Some(url) = rest.strip_prefix('@') {
            let source = parse_direct_url(input, url.trim())?;
            return Ok(Self {
                name: name.to_owned(),
                extras,
                specifiers: Vec::new(),
                markers,
                source: Some(source),
            });
        }

        let rest = rest
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .unwrap_or(rest);
        let mut specifiers = Vec::new();
        for raw in rest.split(',') {
            if raw.trim().is_empty() {
                continue;
            }
            let spec = parse_specifier(raw).map_err(|e| RequirementError::new(input, e.reason))?;
            specifiers.push(spec);
        }

        Ok(Self {
            name: name.to_owned(),
            extras,
            specifiers,
            markers,
            source: None,
        })
    }

    /// The exact version pinned by a single `==` specifier, if any.
    pub fn pinned_version(&self) -> Option<&str> {
        match self.specifiers.as_slice() {
            [only] => only.strip_prefix("==").filter(|v| !v.contains('*')),
            _ => None,
        }
    }
}

impl fmt::Display for PipRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        if let Some(source) = &self.source {
            write!(f, " @ {}", source.to_url())?;
        } else {
            f.write_str(&self.specifiers.join(","))?;
        }
        if let Some(markers) = &self.markers {
            // A direct URL needs whitespace before ';' or it is read as part of the URL.
            write!(f, " ; {markers}")?;
        }
        Ok(())
    }
}

/// Validate one version specifier such as `>= 2.0`, returning it without whitespace.
pub fn parse_specifier(input: &str) -> Result<String, RequirementError> {
    let spec: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let Some(op) = SPECIFIER_OPERATORS.iter().find(|op| spec.starts_with(**op)) else {
        return Err(RequirementError::new(
            input,
            format!("'{spec}' is not a version specifier"),
        ));
    };
    if spec.len() == op.len() {
        return Err(RequirementError::new(input, "missing version after operator"));
    }
    Ok(spec)
}

/// Validate a bare project name.
pub fn validate_name(input: &str) -> Result<(), RequirementError> {
    let name = input.trim();
    if name.is_empty() {
        return Err(RequirementError::new(input, "missing project name"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(RequirementError::new(input, "invalid character in project name"));
    }
    Ok(())
}

fn parse_direct_url(input: &str, url: &str) -> Result<RequirementSource, RequirementError> {
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(RequirementSource::Path {
            path: path.to_owned(),
        });
    }
    let Some(vcs) = url.strip_prefix("git+") else {
        return Err(RequirementError::new(
            input,
            format!("unsupported direct reference '{url}', expected git+ or file://"),
        ));
    };
    // The revision follows the last '@' that appears after the final path separator.
    let last_slash = vcs.rfind('/').unwrap_or(0);
    match vcs[last_slash..].rfind('@') {
        Some(rel) => {
            let at = last_slash + rel;
            Ok(RequirementSource::Vcs {
                git: vcs[..at].to_owned(),
                rev: Some(vcs[at + 1..].to_owned()),
            })
        }
        None => Ok(RequirementSource::Vcs {
            git: vcs.to_owned(),
            rev: None,
        }),
    }
}

/// Canonicalize a distribution name per PEP 503: lowercase, runs of `-_.` become `-`.
pub fn canonicalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                out.push('-');
            }
            in_separator = true;
        } else {
            out.push(c.to_ascii_lowercase());
            in_separator = false;
        }
    }
    out
}

const STUB_PREFIXES: &[&str] = &["types-", "stubs-"];
const STUB_SUFFIXES: &[&str] = &["-types", "-stubs"];

/// Whether a distribution name follows one of the type-stub naming conventions.
pub fn is_type_stub_distribution(name: &str) -> bool {
    let canonical = canonicalize_name(name);
    STUB_PREFIXES.iter().any(|p| canonical.starts_with(p))
        || STUB_SUFFIXES.iter().any(|s| canonical.ends_with(s))
}

/// Strip a `types-`/`stubs-` prefix or `-types`/`-stubs` suffix from a canonical name.
pub fn strip_type_stub_affix(name: &str) -> String {
    let canonical = canonicalize_name(name);
    for prefix in STUB_PREFIXES {
        if let Some(stripped) = canonical.strip_prefix(prefix) {
            return stripped.to_owned();
        }
    }
    for suffix in STUB_SUFFIXES {
        if let Some(stripped) = canonical.strip_suffix(suffix) {
            return stripped.to_owned();
        }
    }
    canonical
}

/// Derive the default module for a distribution: lowercase with `-` replaced by `_`.
pub fn module_from_distribution(name: &str) -> String {
    name.trim().to_lowercase().replace('-', "_")
}
