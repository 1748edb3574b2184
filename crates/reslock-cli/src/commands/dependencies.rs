use super::{colorize_severity, json_pretty, EXIT_SUCCESS};
use reslock_core::Engine;
use reslock_schema::types::Address;

fn print_list(label: &str, addresses: &[Address]) {
    if addresses.is_empty() {
        return;
    }
    println!("{label}:");
    for a in addresses {
        println!("  {a}");
    }
}

pub fn run(engine: &Engine, address: &str, json: bool) -> Result<u8, String> {
    let report = engine.dependencies(address).map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&report)?);
        return Ok(EXIT_SUCCESS);
    }
    println!("{} (resolve '{}')", report.address, report.resolve);
    print_list("explicit", &report.explicit);
    print_list("inferred", &report.inferred);
    print_list("excluded", &report.excluded);
    for d in &report.diagnostics {
        println!("{}: {d}", colorize_severity(&d.severity().to_string()));
    }
    Ok(EXIT_SUCCESS)
}
