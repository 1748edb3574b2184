//! Lockfile model and its two on-disk serializations.
//!
//! Both formats carry the same metadata header, embedded as JSON between
//! comment-prefixed delimiter lines:
//!
//! - *structured*: `//` comments, then a JSON document with the pinned packages;
//! - *flat*: `#` comments, then one `name==version ; markers` line per package
//!   with `--hash=` continuations and a `# requires:` line for dependency edges.
//!
//! The format of an existing file is sniffed from its content, never its name.
//! A structured body may also be a pex-native lock (`locked_resolves`), which
//! is what the default solver program writes.

use crate::fingerprint::content_fingerprint;
use crate::requirement::{canonicalize_name, PipRequirement};
use crate::types::{Fingerprint, ResolveName};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const LOCKFILE_FORMAT_VERSION: u32 = 1;

const BEGIN_METADATA: &str = "--- BEGIN RESLOCK LOCKFILE METADATA: DO NOT EDIT OR REMOVE ---";
const END_METADATA: &str = "--- END RESLOCK LOCKFILE METADATA ---";
const REQUIRES_PREFIX: &str = "# requires:";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lockfile I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lockfile JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("lockfile has no metadata header")]
    MissingMetadata,
    #[error("lockfile metadata header is not terminated")]
    UnterminatedMetadata,
    #[error("lockfile metadata header is invalid: {0}")]
    InvalidMetadata(String),
    #[error("lockfile package '{name}' is invalid: {reason}")]
    InvalidPackage { name: String, reason: String },
    #[error("unsupported lockfile version {found}, expected at most {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("lockfile line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },
    #[error("lockfile header is for resolve '{header}' but the body is for '{body}'")]
    ResolveMismatch { header: String, body: String },
    #[error(
        "lockfile for resolve '{resolve}' is stale ({detail}); expected requirements fingerprint {expected}, found {found}. Run 'reslock generate-lockfiles --resolve={resolve}' to regenerate it."
    )]
    Stale {
        resolve: String,
        expected: String,
        found: String,
        detail: String,
    },
    #[error("package '{name}' is not pinned in the lockfile for resolve '{resolve}'")]
    MissingPackage { resolve: String, name: String },
}

/// Header recorded at the top of every lockfile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockfileMetadata {
    pub version: u32,
    pub resolve: ResolveName,
    pub requirements_fingerprint: Fingerprint,
    pub generated_with_requirements: Vec<String>,
    pub interpreter_constraints: Vec<String>,
    pub backend: String,
}

/// One fully pinned package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinnedPackage {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markers: Option<String>,
    #[serde(default)]
    pub hashes: Vec<String>,
    /// Canonical names of the packages this one declares as requirements.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PinnedPackage {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_owned(),
            version: version.to_owned(),
            markers: None,
            hashes: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn canonical_name(&self) -> String {
        canonicalize_name(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockfileFormat {
    Structured,
    Flat,
}

impl LockfileFormat {
    /// Sniff the format from the first meaningful line of content.
    pub fn detect(content: &str) -> Self {
        let first = content.lines().map(str::trim).find(|l| !l.is_empty());
        match first {
            Some(line) if line.starts_with("//") || line.starts_with('{') => {
                LockfileFormat::Structured
            }
            _ => LockfileFormat::Flat,
        }
    }
}

impl fmt::Display for LockfileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockfileFormat::Structured => f.write_str("structured"),
            LockfileFormat::Flat => f.write_str("flat"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StructuredBody {
    resolve: ResolveName,
    packages: Vec<PinnedPackage>,
}

/// Packages parsed from a lockfile together with its header, when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLockfile {
    pub format: LockfileFormat,
    pub metadata: Option<LockfileMetadata>,
    pub packages: Vec<PinnedPackage>,
}

/// The solved, pinned package set of one resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockfileEntry {
    pub metadata: LockfileMetadata,
    /// Sorted by canonical name.
    pub packages: Vec<PinnedPackage>,
}

impl LockfileEntry {
    pub fn new(metadata: LockfileMetadata, mut packages: Vec<PinnedPackage>) -> Self {
        for pkg in &mut packages {
            pkg.markers = pkg
                .markers
                .take()
                .map(|m| m.trim().to_owned())
                .filter(|m| !m.is_empty());
            pkg.dependencies = pkg
                .dependencies
                .iter()
                .map(|d| canonicalize_name(d))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
        }
        packages.sort_by_key(PinnedPackage::canonical_name);
        Self { metadata, packages }
    }

    pub fn resolve(&self) -> &ResolveName {
        &self.metadata.resolve
    }

    /// Content fingerprint over the header and every pinned record; independent
    /// of the serialization format.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut canonical = String::new();
        canonical.push_str(&format!(
            "resolve:{}\nreqs:{}\n",
            self.metadata.resolve, self.metadata.requirements_fingerprint
        ));
        for pkg in &self.packages {
            canonical.push_str(&format!(
                "pkg:{}=={};{};{};{}\n",
                pkg.canonical_name(),
                pkg.version,
                pkg.markers.as_deref().unwrap_or(""),
                pkg.hashes.join(","),
                pkg.dependencies.join(",")
            ));
        }
        content_fingerprint(canonical.as_bytes())
    }

    pub fn package(&self, name: &str) -> Option<&PinnedPackage> {
        let canonical = canonicalize_name(name);
        self.packages
            .iter()
            .find(|p| p.canonical_name() == canonical)
    }

    /// The packages reachable from `roots` along declared dependency edges.
    ///
    /// Returned in lockfile order. A root missing from the lockfile is an error;
    /// a missing transitive target is skipped, since the solver validated the
    /// edge against the resolve's target environments.
    pub fn subset<I, S>(&self, roots: I) -> Result<Vec<&PinnedPackage>, LockError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let index: BTreeMap<String, &PinnedPackage> = self
            .packages
            .iter()
            .map(|p| (p.canonical_name(), p))
            .collect();
        let mut seen = BTreeSet::new();
        let mut stack = Vec::new();
        for root in roots {
            let root = root.as_ref();
            let canonical = canonicalize_name(root);
            if !index.contains_key(&canonical) {
                return Err(LockError::MissingPackage {
                    resolve: self.metadata.resolve.to_string(),
                    name: root.to_owned(),
                });
            }
            stack.push(canonical);
        }
        while let Some(name) = stack.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(pkg) = index.get(&name) {
                stack.extend(pkg.dependencies.iter().cloned());
            }
        }
        Ok(self
            .packages
            .iter()
            .filter(|p| seen.contains(&p.canonical_name()))
            .collect())
    }

    /// Check the header against the current requirement subset fingerprint.
    pub fn verify_fresh(
        &self,
        expected: &Fingerprint,
        current_requirements: &[String],
    ) -> Result<(), LockError> {
        if &self.metadata.requirements_fingerprint == expected {
            return Ok(());
        }
        Err(LockError::Stale {
            resolve: self.metadata.resolve.to_string(),
            expected: expected.short().to_owned(),
            found: self.metadata.requirements_fingerprint.short().to_owned(),
            detail: describe_drift(
                &self.metadata.generated_with_requirements,
                current_requirements,
            ),
        })
    }

    pub fn render(&self, format: LockfileFormat) -> Result<String, LockError> {
        match format {
            LockfileFormat::Structured => self.render_structured(),
            LockfileFormat::Flat => self.render_flat(),
        }
    }

    fn render_header(&self, comment: &str) -> Result<String, LockError> {
        let mut out = String::new();
        out.push_str(&format!(
            "{comment} This lockfile was autogenerated by reslock. To regenerate, run:\n"
        ));
        out.push_str(&format!("{comment}\n"));
        out.push_str(&format!(
            "{comment}    reslock generate-lockfiles --resolve={}\n",
            self.metadata.resolve
        ));
        out.push_str(&format!("{comment}\n"));
        out.push_str(&format!("{comment} {BEGIN_METADATA}\n"));
        for line in serde_json::to_string_pretty(&self.metadata)?.lines() {
            out.push_str(&format!("{comment} {line}\n"));
        }
        out.push_str(&format!("{comment} {END_METADATA}\n"));
        Ok(out)
    }

    fn render_structured(&self) -> Result<String, LockError> {
        let mut out = self.render_header("//")?;
        let body = StructuredBody {
            resolve: self.metadata.resolve.clone(),
            packages: self.packages.clone(),
        };
        out.push_str(&serde_json::to_string_pretty(&body)?);
        out.push('\n');
        Ok(out)
    }

    fn render_flat(&self) -> Result<String, LockError> {
        let mut out = self.render_header("#")?;
        out.push('\n');
        for pkg in &self.packages {
            out.push_str(&format!("{}=={}", pkg.name, pkg.version));
            if let Some(markers) = &pkg.markers {
                out.push_str(&format!(" ; {markers}"));
            }
            for hash in &pkg.hashes {
                out.push_str(&format!(" \\\n    --hash={hash}"));
            }
            out.push('\n');
            if !pkg.dependencies.is_empty() {
                out.push_str(&format!(
                    "    {REQUIRES_PREFIX} {}\n",
                    pkg.dependencies.join(", ")
                ));
            }
        }
        Ok(out)
    }

    /// Parse a lockfile that must carry a metadata header.
    pub fn parse(content: &str) -> Result<Self, LockError> {
        let parsed = parse_lockfile(content)?;
        let metadata = parsed.metadata.ok_or(LockError::MissingMetadata)?;
        Ok(Self::new(metadata, parsed.packages))
    }

    pub fn write_to_file(
        &self,
        path: impl AsRef<Path>,
        format: LockfileFormat,
    ) -> Result<(), LockError> {
        let path = path.as_ref();
        let content = self.render(format)?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| LockError::Io(e.error))?;
        if let Ok(f) = fs::File::open(dir) {
            let _ = f.sync_all();
        }
        Ok(())
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }
}

/// Parse either format; the metadata header is optional.
pub fn parse_lockfile(content: &str) -> Result<ParsedLockfile, LockError> {
    let format = LockfileFormat::detect(content);
    let (metadata, body_start) = match format {
        LockfileFormat::Structured => extract_header(content, "//")?,
        LockfileFormat::Flat => extract_header(content, "#")?,
    };
    if let Some(meta) = &metadata {
        if meta.version > LOCKFILE_FORMAT_VERSION {
            return Err(LockError::UnsupportedVersion {
                found: meta.version,
                supported: LOCKFILE_FORMAT_VERSION,
            });
        }
    }
    let body: Vec<&str> = content.lines().skip(body_start).collect();
    let packages = match format {
        LockfileFormat::Structured => {
            let text: String = body
                .iter()
                .filter(|l| !l.trim_start().starts_with("//"))
                .copied()
                .collect::<Vec<_>>()
                .join("\n");
            let value: serde_json::Value = serde_json::from_str(&text)?;
            if value.get("locked_resolves").is_some() {
                let pex: PexLock = serde_json::from_value(value)?;
                pex.into_packages()?
            } else {
                let parsed: StructuredBody = serde_json::from_value(value)?;
                if let Some(meta) = &metadata {
                    if meta.resolve != parsed.resolve {
                        return Err(LockError::ResolveMismatch {
                            header: meta.resolve.to_string(),
                            body: parsed.resolve.into_inner(),
                        });
                    }
                }
                parsed.packages
            }
        }
        LockfileFormat::Flat => parse_flat_body(&body, body_start)?,
    };
    Ok(ParsedLockfile {
        format,
        metadata,
        packages,
    })
}

/// Locate the delimited metadata block. Returns the header and the index of the
/// first line after it (0 when there is no header).
fn extract_header(
    content: &str,
    comment: &str,
) -> Result<(Option<LockfileMetadata>, usize), LockError> {
    let lines: Vec<&str> = content.lines().collect();
    let uncomment = |line: &str| -> Option<String> {
        line.trim()
            .strip_prefix(comment)
            .map(|rest| rest.strip_prefix(' ').unwrap_or(rest).to_owned())
    };
    let Some(begin) = lines
        .iter()
        .position(|l| uncomment(l).is_some_and(|u| u.trim() == BEGIN_METADATA))
    else {
        return Ok((None, 0));
    };
    let mut json = String::new();
    for (offset, line) in lines[begin + 1..].iter().enumerate() {
        let Some(text) = uncomment(line) else {
            return Err(LockError::UnterminatedMetadata);
        };
        if text.trim() == END_METADATA {
            let metadata: LockfileMetadata = serde_json::from_str(&json)?;
            if !metadata.requirements_fingerprint.is_well_formed() {
                return Err(LockError::InvalidMetadata(format!(
                    "requirements_fingerprint '{}' is not a 64-character hex digest",
                    metadata.requirements_fingerprint
                )));
            }
            return Ok((Some(metadata), begin + offset + 2));
        }
        json.push_str(&text);
        json.push('\n');
    }
    Err(LockError::UnterminatedMetadata)
}

/// Lock document written by pex (`pex3 lock create`).
#[derive(Debug, Deserialize)]
struct PexLock {
    locked_resolves: Vec<PexLockedResolve>,
}

#[derive(Debug, Deserialize)]
struct PexLockedResolve {
    #[serde(default)]
    locked_requirements: Vec<PexLockedRequirement>,
}

#[derive(Debug, Deserialize)]
struct PexLockedRequirement {
    project_name: String,
    version: String,
    #[serde(default)]
    artifacts: Vec<PexArtifact>,
    #[serde(default)]
    requires_dists: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PexArtifact {
    algorithm: String,
    hash: String,
}

impl PexLock {
    /// Merge every locked resolve into one package list.
    ///
    /// Extra-gated dependencies are dropped, other marker-gated ones are kept
    /// only when locked, and unconditional ones are always kept.
    fn into_packages(self) -> Result<Vec<PinnedPackage>, LockError> {
        let locked: BTreeSet<String> = self
            .locked_resolves
            .iter()
            .flat_map(|r| &r.locked_requirements)
            .map(|req| canonicalize_name(&req.project_name))
            .collect();
        let mut merged: BTreeMap<String, PinnedPackage> = BTreeMap::new();
        for req in self
            .locked_resolves
            .into_iter()
            .flat_map(|r| r.locked_requirements)
        {
            let mut dependencies = Vec::new();
            for dist in &req.requires_dists {
                let dep = PipRequirement::parse(dist).map_err(|e| LockError::InvalidPackage {
                    name: req.project_name.clone(),
                    reason: e.to_string(),
                })?;
                let canonical = canonicalize_name(&dep.name);
                let keep = match dep.markers.as_deref() {
                    None => true,
                    Some(m) if m.contains("extra") => false,
                    Some(_) => locked.contains(&canonical),
                };
                if keep {
                    dependencies.push(canonical);
                }
            }
            let hashes = req
                .artifacts
                .iter()
                .map(|a| format!("{}:{}", a.algorithm, a.hash));
            let pkg = merged
                .entry(canonicalize_name(&req.project_name))
                .or_insert_with(|| PinnedPackage::new(&req.project_name, &req.version));
            for hash in hashes {
                if !pkg.hashes.contains(&hash) {
                    pkg.hashes.push(hash);
                }
            }
            pkg.dependencies.extend(dependencies);
        }
        Ok(merged
            .into_values()
            .map(|mut pkg| {
                pkg.dependencies.sort();
                pkg.dependencies.dedup();
                pkg
            })
            .collect())
    }
}

fn parse_flat_body(lines: &[&str], first_line: usize) -> Result<Vec<PinnedPackage>, LockError> {
    let mut packages: Vec<PinnedPackage> = Vec::new();
    let mut logical = String::new();
    let mut logical_start = 0;
    for (idx, raw) in lines.iter().enumerate() {
        let line_no = first_line + idx + 1;
        let trimmed = raw.trim();
        if logical.is_empty() {
            if let Some(rest) = trimmed.strip_prefix(REQUIRES_PREFIX) {
                let Some(last) = packages.last_mut() else {
                    return Err(LockError::InvalidLine {
                        line: line_no,
                        reason: "'# requires:' before any package".to_owned(),
                    });
                };
                last.dependencies.extend(
                    rest.split(',')
                        .map(str::trim)
                        .filter(|d| !d.is_empty())
                        .map(canonicalize_name),
                );
                continue;
            }
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            logical_start = line_no;
        }
        if let Some(cont) = trimmed.strip_suffix('\\') {
            logical.push_str(cont);
            logical.push(' ');
            continue;
        }
        logical.push_str(trimmed);
        let full = std::mem::take(&mut logical);
        packages.push(parse_flat_package(&full, logical_start)?);
    }
    if !logical.is_empty() {
        packages.push(parse_flat_package(&logical, logical_start)?);
    }
    Ok(packages)
}

fn parse_flat_package(line: &str, line_no: usize) -> Result<PinnedPackage, LockError> {
    let invalid = |reason: String| LockError::InvalidLine {
        line: line_no,
        reason,
    };
    let (req_part, hash_part) = match line.find("--hash=") {
        Some(idx) => (&line[..idx], &line[idx..]),
        None => (line, ""),
    };
    let req = PipRequirement::parse(req_part).map_err(|e| invalid(e.to_string()))?;
    let version = req
        .pinned_version()
        .ok_or_else(|| invalid(format!("'{}' is not pinned with ==", req_part.trim())))?
        .to_owned();
    let mut hashes = Vec::new();
    for token in hash_part.split_whitespace() {
        let hash = token
            .strip_prefix("--hash=")
            .ok_or_else(|| invalid(format!("unexpected option '{token}'")))?;
        hashes.push(hash.to_owned());
    }
    Ok(PinnedPackage {
        name: req.name,
        version,
        markers: req.markers,
        hashes,
        dependencies: Vec::new(),
    })
}

fn describe_drift(locked: &[String], current: &[String]) -> String {
    let locked: BTreeSet<&str> = locked.iter().map(|s| s.trim()).collect();
    let current: BTreeSet<&str> = current.iter().map(|s| s.trim()).collect();
    let added: Vec<&str> = current.difference(&locked).copied().collect();
    let removed: Vec<&str> = locked.difference(&current).copied().collect();
    match (added.is_empty(), removed.is_empty()) {
        (true, true) => "interpreter constraints changed".to_owned(),
        (false, true) => format!("added: {}", added.join(", ")),
        (true, false) => format!("removed: {}", removed.join(", ")),
        (false, false) => format!(
            "added: {}; removed: {}",
            added.join(", "),
            removed.join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::requirements_fingerprint;

    fn sample_entry() -> LockfileEntry {
        let reqs = vec!["requests>=2".to_owned(), "six".to_owned()];
        let metadata = LockfileMetadata {
            version: LOCKFILE_FORMAT_VERSION,
            resolve: ResolveName::new("web"),
            requirements_fingerprint: requirements_fingerprint(&reqs, &[]),
            generated_with_requirements: reqs,
            interpreter_constraints: vec!["CPython>=3.8".to_owned()],
            backend: "mock".to_owned(),
        };
        let mut requests = PinnedPackage::new("requests", "2.31.0");
        requests.hashes = vec!["sha256:aaa".to_owned(), "sha256:bbb".to_owned()];
        requests.dependencies = vec!["idna".to_owned(), "Certifi".to_owned()];
        let mut idna = PinnedPackage::new("idna", "3.4");
        idna.markers = Some("python_version >= \"3.5\"".to_owned());
        let certifi = PinnedPackage::new("certifi", "2023.7.22");
        let six = PinnedPackage::new("six", "1.16.0");
        LockfileEntry::new(metadata, vec![six, requests, idna, certifi])
    }

    #[test]
    fn packages_sorted_and_edges_canonical() {
        let entry = sample_entry();
        let names: Vec<&str> = entry.packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["certifi", "idna", "requests", "six"]);
        assert_eq!(
            entry.package("Requests").unwrap().dependencies,
            vec!["certifi", "idna"]
        );
    }

    #[test]
    fn structured_roundtrip_is_lossless() {
        let entry = sample_entry();
        let text = entry.render(LockfileFormat::Structured).unwrap();
        assert!(text.starts_with("// This lockfile was autogenerated by reslock."));
        assert_eq!(LockfileFormat::detect(&text), LockfileFormat::Structured);
        assert_eq!(LockfileEntry::parse(&text).unwrap(), entry);
    }

    #[test]
    fn flat_roundtrip_is_lossless() {
        let entry = sample_entry();
        let text = entry.render(LockfileFormat::Flat).unwrap();
        assert!(text.contains("requests==2.31.0 \\\n    --hash=sha256:aaa"));
        assert!(text.contains("# requires: certifi, idna"));
        assert_eq!(LockfileFormat::detect(&text), LockfileFormat::Flat);
        assert_eq!(LockfileEntry::parse(&text).unwrap(), entry);
    }

    #[test]
    fn fingerprint_is_format_independent() {
        let entry = sample_entry();
        let flat = LockfileEntry::parse(&entry.render(LockfileFormat::Flat).unwrap()).unwrap();
        let structured =
            LockfileEntry::parse(&entry.render(LockfileFormat::Structured).unwrap()).unwrap();
        assert_eq!(flat.fingerprint(), structured.fingerprint());
    }

    #[test]
    fn parses_headerless_flat_solver_output() {
        let content = "\
certifi==2023.7.22 \\
    --hash=sha256:111
idna==3.4 ; python_version >= \"3.5\" --hash=sha256:222
requests==2.31.0
    # requires: certifi, idna
";
        let parsed = parse_lockfile(content).unwrap();
        assert!(parsed.metadata.is_none());
        assert_eq!(parsed.format, LockfileFormat::Flat);
        assert_eq!(parsed.packages.len(), 3);
        assert_eq!(parsed.packages[0].hashes, vec!["sha256:111"]);
        assert_eq!(parsed.packages[1].markers.as_deref(), Some("python_version >= \"3.5\""));
        assert_eq!(parsed.packages[2].dependencies, vec!["certifi", "idna"]);
        assert!(matches!(
            LockfileEntry::parse(content),
            Err(LockError::MissingMetadata)
        ));
    }

    #[test]
    fn parses_headerless_structured_solver_output() {
        let content = r#"{"resolve": "web", "packages": [{"name": "six", "version": "1.16.0"}]}"#;
        let parsed = parse_lockfile(content).unwrap();
        assert_eq!(parsed.format, LockfileFormat::Structured);
        assert_eq!(parsed.packages, vec![PinnedPackage::new("six", "1.16.0")]);
    }

    #[test]
    fn rejects_malformed_header_fingerprint() {
        let entry = sample_entry();
        let text = entry
            .render(LockfileFormat::Flat)
            .unwrap()
            .replace(entry.metadata.requirements_fingerprint.as_str(), "aéééééééééééé");
        assert!(matches!(
            LockfileEntry::parse(&text),
            Err(LockError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn stale_check_on_non_ascii_fingerprint_does_not_panic() {
        let mut entry = sample_entry();
        entry.metadata.requirements_fingerprint = Fingerprint::new("aéééééééééééé");
        let err = entry
            .verify_fresh(&Fingerprint::new("0".repeat(64)), &[])
            .unwrap_err();
        let expected = format!("a{}", "é".repeat(11));
        assert!(matches!(err, LockError::Stale { ref found, .. } if *found == expected));
    }

    #[test]
    fn parses_pex_native_lock() {
        let content = r#"{
  "allow_builds": true,
  "locked_resolves": [
    {
      "platform_tag": null,
      "locked_requirements": [
        {
          "project_name": "Requests",
          "version": "2.31.0",
          "artifacts": [
            {"algorithm": "sha256", "hash": "aaa", "url": "https://files.example/requests.whl"}
          ],
          "requires_dists": [
            "charset-normalizer<4,>=2",
            "idna<4,>=2.5",
            "PySocks!=1.5.7,>=1.5.6; extra == \"socks\"",
            "importlib-metadata; python_version < \"3.8\""
          ],
          "requires_python": ">=3.7"
        },
        {"project_name": "idna", "version": "3.4", "artifacts": [], "requires_dists": []},
        {"project_name": "charset_normalizer", "version": "3.3.2"}
      ]
    },
    {
      "locked_requirements": [
        {
          "project_name": "requests",
          "version": "2.31.0",
          "artifacts": [{"algorithm": "sha256", "hash": "bbb"}],
          "requires_dists": ["idna<4,>=2.5"]
        }
      ]
    }
  ],
  "requirements": ["requests"],
  "resolver_version": "pip-2020-resolver"
}"#;
        let parsed = parse_lockfile(content).unwrap();
        assert_eq!(parsed.format, LockfileFormat::Structured);
        assert!(parsed.metadata.is_none());
        let names: Vec<&str> = parsed.packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["charset_normalizer", "idna", "Requests"]);
        let requests = &parsed.packages[2];
        assert_eq!(requests.version, "2.31.0");
        assert_eq!(requests.hashes, vec!["sha256:aaa", "sha256:bbb"]);
        assert_eq!(requests.dependencies, vec!["charset-normalizer", "idna"]);

        let entry = sample_entry();
        let header = entry.render_header("//").unwrap();
        let with_header = LockfileEntry::parse(&format!("{header}{content}")).unwrap();
        assert_eq!(with_header.metadata, entry.metadata);
        assert_eq!(with_header.package("requests").unwrap().hashes.len(), 2);
    }

    #[test]
    fn markers_agree_across_formats() {
        let mut entry = sample_entry();
        for pkg in &mut entry.packages {
            match pkg.name.as_str() {
                "six" => pkg.markers = Some(String::new()),
                "certifi" => pkg.markers = Some("  sys_platform == \"linux\"  ".to_owned()),
                _ => {}
            }
        }
        let entry = LockfileEntry::new(entry.metadata, entry.packages);
        assert_eq!(entry.package("six").unwrap().markers, None);
        assert_eq!(
            entry.package("certifi").unwrap().markers.as_deref(),
            Some("sys_platform == \"linux\"")
        );
        for format in [LockfileFormat::Flat, LockfileFormat::Structured] {
            let back = LockfileEntry::parse(&entry.render(format).unwrap()).unwrap();
            assert_eq!(back, entry, "{format}");
        }
    }

    #[test]
    fn rejects_unpinned_flat_line() {
        let err = parse_lockfile("requests>=2\n").unwrap_err();
        assert!(matches!(err, LockError::InvalidLine { line: 1, .. }));
    }

    #[test]
    fn rejects_unterminated_header() {
        let content = format!("# {BEGIN_METADATA}\n# {{\"version\": 1}}\nsix==1.0\n");
        assert!(matches!(
            parse_lockfile(&content),
            Err(LockError::UnterminatedMetadata)
        ));
    }

    #[test]
    fn rejects_future_version() {
        let mut entry = sample_entry();
        entry.metadata.version = LOCKFILE_FORMAT_VERSION + 1;
        let text = entry.render(LockfileFormat::Flat).unwrap();
        assert!(matches!(
            LockfileEntry::parse(&text),
            Err(LockError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn rejects_resolve_mismatch() {
        let entry = sample_entry();
        let text = entry
            .render(LockfileFormat::Structured)
            .unwrap()
            .replace(
                "\"resolve\": \"web\",\n  \"packages\"",
                "\"resolve\": \"data\",\n  \"packages\"",
            );
        assert!(matches!(
            LockfileEntry::parse(&text),
            Err(LockError::ResolveMismatch { .. })
        ));
    }

    #[test]
    fn subset_follows_dependency_edges() {
        let entry = sample_entry();
        let subset: Vec<&str> = entry
            .subset(["requests"])
            .unwrap()
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(subset, vec!["certifi", "idna", "requests"]);

        let only_six: Vec<&str> = entry
            .subset(["SIX"])
            .unwrap()
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(only_six, vec!["six"]);

        assert!(matches!(
            entry.subset(["flask"]),
            Err(LockError::MissingPackage { .. })
        ));
    }

    #[test]
    fn staleness_reports_drift() {
        let entry = sample_entry();
        let current = vec!["requests>=2".to_owned(), "six".to_owned()];
        assert!(entry
            .verify_fresh(&requirements_fingerprint(&current, &[]), &current)
            .is_ok());

        let changed = vec!["requests>=3".to_owned(), "six".to_owned()];
        let err = entry
            .verify_fresh(&requirements_fingerprint(&changed, &[]), &changed)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("resolve 'web' is stale"), "{msg}");
        assert!(msg.contains("added: requests>=3; removed: requests>=2"), "{msg}");
        assert!(msg.contains("--resolve=web"), "{msg}");
    }

    #[test]
    fn write_and_read_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("3rdparty/python/web.lock");
        let entry = sample_entry();
        entry.write_to_file(&path, LockfileFormat::Flat).unwrap();
        assert_eq!(LockfileEntry::read_from_file(&path).unwrap(), entry);

        entry.write_to_file(&path, LockfileFormat::Structured).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(LockfileFormat::detect(&content), LockfileFormat::Structured);
        // No temp files left behind.
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }
}
