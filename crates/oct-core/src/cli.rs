//! Shared CLI helpers for workspace tools.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{Error, Result};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the `verbose` flag.
pub fn setup_cli_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logger: {e}")))?;

    Ok(())
}

pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config {}: {e}", path.display())))
}

/// Write a config next to the run outputs so the run can be reproduced
pub fn save_toml_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExperimentConfig;

    #[test]
    fn test_config_round_trip_through_file() {
        let dir = std::env::temp_dir().join(format!("oct-core-cli-{}", std::process::id()));
        let path = dir.join("config.toml");

        let mut config = ExperimentConfig::default();
        config.name = "roundtrip".to_string();
        config.train.epochs = 3;

        save_toml_config(&config, &path).unwrap();
        let loaded: ExperimentConfig = load_toml_config(&path).unwrap();

        assert_eq!(loaded.name, "roundtrip");
        assert_eq!(loaded.train.epochs, 3);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_config_is_config_error() {
        let result: Result<ExperimentConfig> = load_toml_config(Path::new("/nonexistent/oct.toml"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
