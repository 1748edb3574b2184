use super::{json_pretty, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use reslock_core::Engine;

pub fn run(engine: &Engine, resolves: &[String], json: bool) -> Result<u8, String> {
    let count = if resolves.is_empty() {
        engine.config().resolves.len()
    } else {
        resolves.len()
    };
    let pb = if json {
        None
    } else {
        Some(spinner(&format!("generating lockfiles for {count} resolve(s)...")))
    };
    let results = match engine.generate_lockfiles(resolves) {
        Ok(results) => results,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "lockfile generation failed");
            }
            return Err(e.to_string());
        }
    };

    let failures: Vec<String> = results
        .iter()
        .filter_map(|(_, r)| r.as_ref().err().map(ToString::to_string))
        .collect();
    if let Some(ref pb) = pb {
        if failures.is_empty() {
            spin_ok(pb, &format!("generated {} lockfile(s)", results.len()));
        } else {
            spin_fail(
                pb,
                &format!("{} of {} resolve(s) failed", failures.len(), results.len()),
            );
        }
    }

    if json {
        let payload: Vec<serde_json::Value> = results
            .iter()
            .map(|(name, r)| match r {
                Ok(outcome) => serde_json::json!({
                    "resolve": name,
                    "status": "ok",
                    "path": outcome.path,
                    "format": outcome.format.to_string(),
                    "packages": outcome.entry.packages.len(),
                    "attempts": outcome.attempts,
                    "fingerprint": outcome.entry.metadata.requirements_fingerprint,
                }),
                Err(e) => serde_json::json!({
                    "resolve": name,
                    "status": "failed",
                    "error": e.to_string(),
                }),
            })
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else {
        for (name, r) in &results {
            if let Ok(outcome) = r {
                println!(
                    "{name}: {} package(s) -> {}",
                    outcome.entry.packages.len(),
                    outcome.path.display()
                );
            }
        }
    }

    if failures.is_empty() {
        Ok(EXIT_SUCCESS)
    } else {
        Err(failures.join("\n"))
    }
}
