use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use substrate_core::EngineConfig;

/// `substrate.toml`: engine tuning plus serve-loop limits.
///
/// ```toml
/// tenants = ["alice", "bob"]
/// persist_timeout_ms = 2000
///
/// [engine.workspace]
/// capacity = 100
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub engine: EngineConfig,
    /// Tenants started eagerly by `serve`. Others start on first request.
    pub tenants: Vec<String>,
    /// Upper bound on one store commit before the tick is abandoned.
    pub persist_timeout_ms: u64,
    /// Per-tenant request queue depth.
    pub queue_capacity: usize,
    /// Requests folded into one commit when they arrive together.
    pub max_group: usize,
    /// Keep this many ticks of journaled deltas; `None` keeps everything.
    pub journal_ticks: Option<u64>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            tenants: Vec::new(),
            persist_timeout_ms: 2000,
            queue_capacity: 256,
            max_group: 64,
            journal_ticks: None,
        }
    }
}

impl ServeConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                toml::from_str::<Self>(&text)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid engine config: {e}"))?;
        if self.persist_timeout_ms == 0 {
            bail!("persist_timeout_ms must be positive");
        }
        if self.queue_capacity == 0 || self.max_group == 0 {
            bail!("queue_capacity and max_group must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = ServeConfig::load(None).unwrap();
        assert_eq!(config.persist_timeout_ms, 2000);
        assert!(config.tenants.is_empty());
    }

    #[test]
    fn test_partial_toml() {
        let config: ServeConfig = toml::from_str(
            r#"
            tenants = ["alice"]
            journal_ticks = 500

            [engine]
            lifecycle_every_ticks = 3

            [engine.workspace]
            capacity = 40
            "#,
        )
        .unwrap();
        assert_eq!(config.tenants, vec!["alice"]);
        assert_eq!(config.journal_ticks, Some(500));
        assert_eq!(config.engine.lifecycle_every_ticks, 3);
        assert_eq!(config.engine.workspace.capacity, 40);
        assert_eq!(config.queue_capacity, 256);
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let config = ServeConfig {
            persist_timeout_ms: 0,
            ..ServeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
