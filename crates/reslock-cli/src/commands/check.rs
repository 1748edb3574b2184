use super::{colorize_severity, colorize_status, json_pretty, EXIT_SUCCESS, EXIT_VALIDATION_ERROR};
use reslock_core::Engine;
use reslock_schema::types::Address;

pub fn run(engine: &Engine, json: bool) -> Result<u8, String> {
    let report = engine.check().map_err(|e| e.to_string())?;
    let code = if report.is_ok() {
        EXIT_SUCCESS
    } else {
        EXIT_VALIDATION_ERROR
    };
    if json {
        let payload = serde_json::json!({
            "ok": report.is_ok(),
            "errors": report.error_count(),
            "warnings": report.warning_count(),
            "report": report,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(code);
    }

    for r in &report.resolves {
        println!("lockfile {}: {}", r.name, colorize_status(&r.status));
        if r.status != "fresh" && report.lockfiles_required {
            println!("  run `reslock generate-lockfiles --resolve={}`", r.name);
        }
    }
    for d in &report.diagnostics {
        println!("{}: {d}", colorize_severity(&d.severity().to_string()));
    }
    for m in &report.ambiguous_modules {
        let candidates: Vec<&str> = m.candidates.iter().map(Address::as_str).collect();
        println!(
            "{}: module '{}' is provided by several requirements in resolve '{}': {}",
            colorize_severity("warning"),
            m.module,
            m.resolve,
            candidates.join(", ")
        );
    }
    println!(
        "check: {} error(s), {} warning(s)",
        report.error_count(),
        report.warning_count()
    );
    Ok(code)
}
