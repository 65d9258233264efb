//! `switchyard config`: inspect and validate configuration files.

use switchyard_core::models::Domain;
use switchyard_core::SwitchyardConfig;

/// Print the effective configuration as YAML.
pub fn show(config: &SwitchyardConfig) -> Result<(), String> {
    let yaml = config.to_yaml().map_err(|e| e.to_string())?;
    print!("{}", yaml);
    Ok(())
}

/// Parse and validate a config file, then summarize the pools it defines.
pub fn validate(path: &str) -> Result<SwitchyardConfig, String> {
    let config = SwitchyardConfig::from_file(path).map_err(|e| format!("{}: {}", path, e))?;

    println!("✅ {} is valid", path);
    println!("   load balancing: {}", config.load_balancing.as_str());
    println!(
        "   circuit breaker: {} failures, {}s recovery",
        config.circuit_breaker.failure_threshold, config.circuit_breaker.recovery_timeout_secs
    );
    for domain in Domain::PIPELINE {
        for &slave_type in domain.slave_types() {
            let pool = config.pool(domain, slave_type);
            println!(
                "   {:<30} initial {:>2}, max {:>3}",
                SwitchyardConfig::pool_key(domain, slave_type),
                pool.initial_size,
                pool.max_size
            );
        }
    }
    Ok(config)
}
