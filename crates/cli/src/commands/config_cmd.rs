//! `thinkloop config` subcommands.

use std::path::Path;
use thinkloop_config::{AppConfig, ConfigError};

/// Load `path` the way the runtime does: file (or defaults), then
/// environment overrides, then validation.
pub fn load(path: &Path) -> Result<AppConfig, ConfigError> {
    let mut config = AppConfig::load_from(path)?;
    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

pub fn show(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", config.to_toml()?);
    Ok(())
}

pub fn init(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if AppConfig::write_default(path)? {
        println!("Wrote default config to {}", path.display());
    } else {
        println!("Config already exists at {}, left untouched", path.display());
    }
    Ok(())
}

pub fn path(path: &Path) {
    println!("{}", path.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_load_round_trips_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        init(&path).unwrap();
        assert!(path.exists());

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn init_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[thinking]\nmax_steps = 3\n").unwrap();

        init(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "[thinking]\nmax_steps = 3\n");
    }

    #[test]
    fn load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[thinking]\nmax_steps = 0\n").unwrap();

        assert!(AppConfig::load_from(&path).is_err());
    }
}
