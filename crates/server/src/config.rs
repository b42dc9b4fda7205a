use std::path::Path;

use anyhow::{Context, Result};
use wavecast_protocol::WavecastConfig;

/// Load configuration from a TOML file. A missing file is not an error:
/// defaults apply and a warning is logged.
pub fn load_config(path: &Path) -> Result<WavecastConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file {} not found, using defaults",
            path.display()
        );
        return Ok(WavecastConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: WavecastConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;

    tracing::info!("Loaded configuration from {}", path.display());
    Ok(config)
}
