pub mod check;
pub mod dependencies;
pub mod generate_lockfiles;
pub mod install;
pub mod resolves;

use indicatif::{ProgressBar, ProgressStyle};
use reslock_core::CoreError;
use std::path::Path;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_VALIDATION_ERROR: u8 = 4;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Exit code for an error message, chosen by its prefix.
pub fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("config error:") {
        EXIT_CONFIG_ERROR
    } else if msg.starts_with("store error:") {
        EXIT_STORE_ERROR
    } else if msg.starts_with("validation error:") {
        EXIT_VALIDATION_ERROR
    } else {
        EXIT_FAILURE
    }
}

/// Config errors name the file they came from.
pub fn load_error(config: &Path, err: &CoreError) -> String {
    match err {
        CoreError::Config(inner) => format!("config error: {}: {inner}", config.display()),
        other => other.to_string(),
    }
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "fresh" => Style::new().green().apply_to(status).to_string(),
        "stale" => Style::new().yellow().bold().apply_to(status).to_string(),
        "missing" => Style::new().red().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

pub fn colorize_severity(severity: &str) -> String {
    use console::Style;
    match severity {
        "error" => Style::new().red().bold().apply_to(severity).to_string(),
        "warning" => Style::new().yellow().apply_to(severity).to_string(),
        other => other.to_owned(),
    }
}
