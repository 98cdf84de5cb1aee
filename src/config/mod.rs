use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::fs;

use crate::auth::{AuthCommandProcessor, BackendAuthConfig, FrontendAuthConfig};
use crate::cluster::ClusterModeConfig;
use crate::limit::ConnectLimitConfig;
use crate::task::DEFAULT_TASK_QUEUE_CAPACITY;
use crate::upstream::HostAndPort;

fn default_task_queue_capacity() -> usize {
    DEFAULT_TASK_QUEUE_CAPACITY
}

fn default_timeout_ms() -> u64 {
    1_000
}

fn default_multi_db() -> bool {
    true
}

fn default_sessions_per_node() -> usize {
    crate::backend::pool::DEFAULT_SLOTS_PER_NODE
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Frontend password or user table. Absent disables authentication.
    #[serde(default)]
    pub auth: Option<FrontendAuthConfig>,
    #[serde(default = "default_task_queue_capacity")]
    pub task_queue_capacity: usize,
    #[serde(default)]
    pub connect_limit: ConnectLimitConfig,
    #[serde(default)]
    pub cluster_mode: Option<ClusterModeConfig>,
    pub upstream: UpstreamConfig,
}

/// Sentinel-managed upstream deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Sentinel endpoints, `host:port`. One listener pair runs per entry.
    pub sentinels: Vec<String>,
    pub master_name: String,
    #[serde(default)]
    pub sentinel_auth: Option<BackendAuthConfig>,
    #[serde(default)]
    pub backend_auth: Option<BackendAuthConfig>,
    #[serde(default)]
    pub read_from_slave: bool,
    /// Connect and query timeout for sentinel and upstream connections.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_multi_db")]
    pub multi_db: bool,
    #[serde(default = "default_sessions_per_node")]
    pub sessions_per_node: usize,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sentinel_addrs(&self) -> Result<Vec<HostAndPort>> {
        self.sentinels
            .iter()
            .map(|addr| HostAndPort::parse(addr))
            .collect()
    }

    pub fn ensure_valid(&self) -> Result<()> {
        if self.sentinels.is_empty() {
            bail!("upstream must declare at least one sentinel");
        }
        let mut seen = HashSet::new();
        for addr in &self.sentinels {
            HostAndPort::parse(addr)
                .with_context(|| format!("invalid sentinel address {}", addr))?;
            if !seen.insert(addr.to_lowercase()) {
                bail!("duplicate sentinel address detected: {}", addr);
            }
        }
        if self.master_name.trim().is_empty() {
            bail!("upstream master_name must not be empty");
        }
        if self.timeout_ms == 0 {
            bail!("upstream timeout_ms must be positive");
        }
        if self.sessions_per_node == 0 {
            bail!("upstream sessions_per_node must be positive");
        }
        Ok(())
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let cfg: ProxyConfig = toml::from_str(raw).context("failed to parse config")?;
        cfg.ensure_valid()?;
        Ok(cfg)
    }

    /// Ensure configuration correctness.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.task_queue_capacity == 0 {
            bail!("task_queue_capacity must be positive");
        }
        self.upstream.ensure_valid()?;
        if let Some(cluster) = &self.cluster_mode {
            cluster.ensure_valid().context("invalid cluster_mode")?;
        }
        AuthCommandProcessor::from_config(self.auth.clone()).context("invalid auth")?;
        let mut tenants = HashSet::new();
        for limit in &self.connect_limit.tenants {
            if !tenants.insert((limit.bid, limit.bgroup.as_str())) {
                bail!(
                    "duplicate connect limit for tenant {}|{}",
                    limit.bid,
                    limit.bgroup
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
task_queue_capacity = 256

[auth]
password = "secret"

[[auth.users]]
username = "tenant-a"
password = "a-pass"
tenant = { bid = 7, bgroup = "orders" }

[connect_limit]
default_threshold = 100

[[connect_limit.tenants]]
bid = 7
bgroup = "orders"
threshold = 2

[upstream]
sentinels = ["127.0.0.1:26379", "127.0.0.2:26379"]
master_name = "mymaster"
sentinel_auth = "sentinel-pass"
backend_auth = { username = "proxy", password = "backend-pass" }
read_from_slave = true
"#;

    #[test]
    fn parses_full_config() {
        let cfg = ProxyConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.task_queue_capacity, 256);
        assert_eq!(cfg.connect_limit.default_threshold, Some(100));
        assert_eq!(cfg.connect_limit.tenants[0].threshold, 2);
        assert!(cfg.cluster_mode.is_none());
        assert!(cfg.upstream.read_from_slave);
        assert_eq!(cfg.upstream.timeout(), Duration::from_millis(1_000));
        assert_eq!(cfg.upstream.sentinel_addrs().unwrap().len(), 2);
        assert!(matches!(
            cfg.upstream.backend_auth,
            Some(BackendAuthConfig::Credential { .. })
        ));
        assert!(AuthCommandProcessor::from_config(cfg.auth)
            .unwrap()
            .is_password_required());
    }

    #[test]
    fn applies_defaults() {
        let cfg = ProxyConfig::parse(
            r#"
[upstream]
sentinels = ["127.0.0.1:26379"]
master_name = "mymaster"
"#,
        )
        .unwrap();
        assert_eq!(cfg.task_queue_capacity, DEFAULT_TASK_QUEUE_CAPACITY);
        assert!(cfg.auth.is_none());
        assert!(cfg.upstream.multi_db);
        assert!(!cfg.upstream.read_from_slave);
        assert!(cfg.connect_limit.default_threshold.is_none());
    }

    #[test]
    fn rejects_invalid_configs() {
        let no_sentinel = r#"
[upstream]
sentinels = []
master_name = "mymaster"
"#;
        assert!(ProxyConfig::parse(no_sentinel).is_err());

        let duplicate = r#"
[upstream]
sentinels = ["127.0.0.1:26379", "127.0.0.1:26379"]
master_name = "mymaster"
"#;
        assert!(ProxyConfig::parse(duplicate).is_err());

        let bad_addr = r#"
[upstream]
sentinels = ["sentinel"]
master_name = "mymaster"
"#;
        assert!(ProxyConfig::parse(bad_addr).is_err());

        let empty_queue = r#"
task_queue_capacity = 0
[upstream]
sentinels = ["127.0.0.1:26379"]
master_name = "mymaster"
"#;
        assert!(ProxyConfig::parse(empty_queue).is_err());
    }

    #[tokio::test]
    async fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("transponder-{}.toml", std::process::id()));
        fs::write(&path, SAMPLE).await.unwrap();
        let cfg = ProxyConfig::load(&path).await.unwrap();
        assert_eq!(cfg.upstream.master_name, "mymaster");
        fs::remove_file(&path).await.unwrap();

        let err = ProxyConfig::load("/nonexistent/transponder.toml")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
