//! Deterministic blake3 fingerprints for requirement subsets, lockfiles, and
//! install closures.
//!
//! Every hash input is tagged and sorted so that declaration order never
//! changes the result.

use crate::types::Fingerprint;

/// Fingerprint of a resolve's requirement subset.
///
/// Covers the requirement strings (sorted, deduplicated) and the resolve's
/// interpreter constraints. Changing any specifier of any requirement in the
/// subset changes the fingerprint.
pub fn requirements_fingerprint(
    requirement_strings: &[String],
    interpreter_constraints: &[String],
) -> Fingerprint {
    let mut reqs: Vec<&str> = requirement_strings.iter().map(|s| s.trim()).collect();
    reqs.sort_unstable();
    reqs.dedup();
    let mut ics: Vec<&str> = interpreter_constraints.iter().map(|s| s.trim()).collect();
    ics.sort_unstable();
    ics.dedup();

    let mut hasher = blake3::Hasher::new();
    for req in reqs {
        hasher.update(format!("req:{req}\n").as_bytes());
    }
    for ic in ics {
        hasher.update(format!("ic:{ic}\n").as_bytes());
    }
    Fingerprint::new(hasher.finalize().to_hex().to_string())
}

/// Fingerprint of an install closure within a lockfile.
pub fn closure_fingerprint(
    package_names: &[String],
    environment_constraints: &[String],
    lockfile: &Fingerprint,
) -> Fingerprint {
    let mut names: Vec<&str> = package_names.iter().map(String::as_str).collect();
    names.sort_unstable();
    names.dedup();
    let mut constraints: Vec<&str> = environment_constraints.iter().map(String::as_str).collect();
    constraints.sort_unstable();
    constraints.dedup();

    let mut hasher = blake3::Hasher::new();
    for name in names {
        hasher.update(format!("pkg:{name}\n").as_bytes());
    }
    for c in constraints {
        hasher.update(format!("env:{c}\n").as_bytes());
    }
    hasher.update(format!("lock:{lockfile}\n").as_bytes());
    Fingerprint::new(hasher.finalize().to_hex().to_string())
}

pub fn content_fingerprint(bytes: &[u8]) -> Fingerprint {
    Fingerprint::new(blake3::hash(bytes).to_hex().to_string())
}
