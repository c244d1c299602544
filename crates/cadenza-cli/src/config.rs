use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use cadenza_engine::{EngineConfig, GraphConfig};
use serde::{Deserialize, Serialize};

/// Settings for the headless driver, read from an optional JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub engine: EngineConfig,
    pub graph: GraphConfig,
    /// Audio tracks in the demo session.
    pub tracks: usize,
    /// Latency of the lookahead insert on the first track, in frames.
    pub latency: u32,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            graph: GraphConfig::default(),
            tracks: 4,
            latency: 0,
        }
    }
}

impl CliConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                serde_json::from_str::<CliConfig>(&raw)
                    .with_context(|| format!("{} is not a valid config file", path.display()))?
            }
            None => CliConfig::default(),
        };
        Ok(Self {
            graph: config.graph.with_env_overrides(),
            ..config
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{ "tracks": 2, "engine": {{ "block_size": 256 }} }}"#).expect("write");

        let config = CliConfig::load(Some(file.path())).expect("valid config");
        assert_eq!(config.tracks, 2);
        assert_eq!(config.engine.block_size, 256);
        assert_eq!(config.engine.sample_rate, 48_000);
        assert_eq!(config.graph.control_ring_capacity, 128);
    }

    #[test]
    fn malformed_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "tracks = 2").expect("write");
        let err = CliConfig::load(Some(file.path())).expect_err("not json");
        assert!(err.to_string().contains("not a valid config file"));
    }
}
