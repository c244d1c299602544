use serde::{Deserialize, Serialize};

/// Environment variable that forces the number of graph worker threads.
pub const DSP_THREADS_ENV: &str = "CADENZA_DSP_THREADS";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Explicit worker count. `None` derives it from the core count.
    pub workers: Option<usize>,
    /// Capacity of the router's control port change ring.
    pub control_ring_capacity: usize,
    pub thread_name_prefix: String,
    /// Elide ports that carry no connections and no structural role.
    pub drop_unnecessary_ports: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            workers: None,
            control_ring_capacity: 128,
            thread_name_prefix: "cadenza-dsp".into(),
            drop_unnecessary_ports: true,
        }
    }
}

impl GraphConfig {
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var(DSP_THREADS_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(workers) => self.workers = Some(workers),
                Err(err) => {
                    tracing::warn!(value = %raw, ?err, "ignoring invalid {DSP_THREADS_ENV}")
                }
            }
        }
        self
    }

    /// Number of OS worker threads spawned next to the graph main thread.
    pub fn resolved_workers(&self) -> usize {
        self.workers
            .unwrap_or_else(|| num_cpus::get().saturating_sub(2))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub block_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_workers_win_over_core_count() {
        let config = GraphConfig {
            workers: Some(3),
            ..GraphConfig::default()
        };
        assert_eq!(config.resolved_workers(), 3);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: GraphConfig =
            serde_json::from_str(r#"{ "workers": 0 }"#).expect("valid config");
        assert_eq!(config.workers, Some(0));
        assert_eq!(config.control_ring_capacity, 128);
        assert!(config.drop_unnecessary_ports);

        let engine: EngineConfig = serde_json::from_str("{}").expect("valid config");
        assert_eq!(engine, EngineConfig::default());
    }
}
