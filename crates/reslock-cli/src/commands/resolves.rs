use super::{colorize_status, json_pretty, EXIT_SUCCESS};
use reslock_core::Engine;

pub fn run(engine: &Engine, json: bool) -> Result<u8, String> {
    let reports = engine.resolves().map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&reports)?);
        return Ok(EXIT_SUCCESS);
    }
    println!(
        "{:<20} {:<8} {:<8} {:<5} {:<14} LOCKFILE",
        "RESOLVE", "DEFAULT", "STATUS", "REQS", "FINGERPRINT"
    );
    for r in &reports {
        let short = &r.fingerprint[..r.fingerprint.len().min(12)];
        // Escape codes would break `{:<8}`, so pad by hand.
        let status = format!(
            "{}{}",
            colorize_status(&r.status),
            " ".repeat(8usize.saturating_sub(r.status.len()))
        );
        println!(
            "{:<20} {:<8} {} {:<5} {:<14} {}",
            r.name.as_str(),
            if r.is_default { "yes" } else { "" },
            status,
            r.requirements,
            short,
            r.lockfile.display()
        );
    }
    Ok(EXIT_SUCCESS)
}
