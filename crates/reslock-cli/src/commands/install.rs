use super::{json_pretty, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use reslock_core::Engine;

pub fn run(engine: &Engine, roots: &[String], dry_run: bool, json: bool) -> Result<u8, String> {
    if dry_run {
        let plan = engine.plan(roots).map_err(|e| e.to_string())?;
        if json {
            let payload = serde_json::json!({
                "resolve": plan.resolve,
                "fingerprint": plan.fingerprint,
                "packages": plan.pins(),
                "constraints": plan.constraints,
                "closure": plan.closure,
            });
            println!("{}", json_pretty(&payload)?);
        } else {
            println!("environment {} (resolve '{}')", plan.fingerprint.short(), plan.resolve);
            for pin in plan.pins() {
                println!("  {pin}");
            }
        }
        return Ok(EXIT_SUCCESS);
    }

    let pb = if json {
        None
    } else {
        Some(spinner("installing environment..."))
    };
    let env = match engine.install(roots) {
        Ok(env) => {
            if let Some(ref pb) = pb {
                spin_ok(
                    pb,
                    &format!(
                        "environment {} ready ({} package(s))",
                        env.fingerprint.short(),
                        env.packages.len()
                    ),
                );
            }
            env
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "install failed");
            }
            return Err(e.to_string());
        }
    };
    if json {
        let payload = serde_json::json!({
            "fingerprint": env.fingerprint,
            "kind": env.kind,
            "resolve": env.resolve,
            "path": env.path,
            "packages": env.packages,
            "created_at": env.created_at,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("{}", env.path.display());
    }
    Ok(EXIT_SUCCESS)
}
