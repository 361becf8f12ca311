use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use evcat_collectors::SourceConfig;
use serde::Deserialize;
use tokio::fs;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://./data/evcat.db";
pub const DEFAULT_RETENTION_DAYS: u32 = 90;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        let mut seen = std::collections::HashSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                anyhow::bail!("duplicate source_id {} in registry", source.source_id);
            }
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Enabled sources, in registry order.
    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub workspace_root: PathBuf,
    pub reports_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub run_timeout: Option<Duration>,
    pub persist_concurrency: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub sweep_cron: String,
    pub retention_days: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparseable values fall back
    /// to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            workspace_root: lookup("EVCAT_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            reports_dir: lookup("EVCAT_REPORTS_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            user_agent: lookup("EVCAT_USER_AGENT")
                .unwrap_or_else(|| "evcat-bot/0.1".to_string()),
            http_timeout_secs: parsed("EVCAT_HTTP_TIMEOUT_SECS").unwrap_or(20),
            run_timeout: parsed("EVCAT_RUN_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            persist_concurrency: parsed("EVCAT_PERSIST_CONCURRENCY")
                .map(|n| n.max(1) as usize)
                .unwrap_or(8),
            scheduler_enabled: lookup("EVCAT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: lookup("EVCAT_SYNC_CRON").unwrap_or_else(|| "0 0 */6 * * *".to_string()),
            sweep_cron: lookup("EVCAT_SWEEP_CRON").unwrap_or_else(|| "0 0 2 * * *".to_string()),
            retention_days: parsed("EVCAT_RETENTION_DAYS")
                .and_then(|d| u32::try_from(d).ok())
                .unwrap_or(DEFAULT_RETENTION_DAYS),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}
