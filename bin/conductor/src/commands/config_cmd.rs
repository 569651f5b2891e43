use std::path::Path;

use conductor_core::Config;

use super::{config_file, load_config};

/// Show the effective configuration as pretty-printed JSON.
pub async fn show(override_path: Option<&Path>) -> anyhow::Result<()> {
    let path = config_file(override_path);
    let config = load_config(override_path)?;

    println!();
    println!("📋 Current Configuration");
    println!(
        "  File: {} {}",
        path.display(),
        if path.exists() { "" } else { "(not found, using defaults)" }
    );
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

pub async fn init(override_path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let path = config_file(override_path);
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite",
            path.display()
        );
    }
    Config::default().save(&path)?;
    println!("✓ Wrote default configuration to {}", path.display());
    Ok(())
}

pub fn path(override_path: Option<&Path>) {
    println!("{}", config_file(override_path).display());
}
