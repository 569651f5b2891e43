pub mod config_cmd;
pub mod demo;
pub mod health;

use std::path::{Path, PathBuf};

use conductor_core::{Config, Paths};

/// Resolve the config file: the `--config` override or the default location.
pub fn config_file(override_path: Option<&Path>) -> PathBuf {
    match override_path {
        Some(p) => p.to_path_buf(),
        None => Paths::new().config_file(),
    }
}

pub fn load_config(override_path: Option<&Path>) -> anyhow::Result<Config> {
    match override_path {
        Some(path) if path.exists() => Ok(Config::load(path)?),
        Some(path) => anyhow::bail!("config file not found: {}", path.display()),
        None => Ok(Config::load_or_default(&Paths::new())?),
    }
}
