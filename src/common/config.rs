//! Configuration for minigrid services

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service name (used in logs and policy reports)
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub partition: PartitionConfig,

    #[serde(default)]
    pub guardian: GuardianConfig,

    #[serde(default)]
    pub quorum: QuorumConfig,

    #[serde(default)]
    pub balancer: BalancerConfig,
}

fn default_service_name() -> String {
    "DistributedCache".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
            partition: PartitionConfig::default(),
            guardian: GuardianConfig::default(),
            quorum: QuorumConfig::default(),
            balancer: BalancerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `minigrid.toml` (if present) and `MINIGRID_*`
    /// environment variables, e.g. `MINIGRID_PARTITION__PARTITION_COUNT=509`.
    pub fn load() -> Result<Self> {
        Self::load_from("minigrid")
    }

    /// Load configuration from a base file name (extension optional) plus the
    /// environment
    pub fn load_from(base: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(base).required(false))
            .add_source(
                config::Environment::with_prefix("MINIGRID")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;
        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from an explicit file only
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .build()?;
        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.partition.validate()?;
        self.guardian.validate()?;
        self.quorum.validate()
    }
}

/// Partition ownership and distribution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Number of partitions, fixed for the service lifetime
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,

    /// Backups kept for every partition
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,

    /// Maximum primary transfers pending handoff at once
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Periodic distribution analysis interval
    #[serde(default = "default_distribution_interval")]
    pub distribution_interval_ms: u64,

    /// Attempts to re-plan after an optimistic conflict
    #[serde(default = "default_apply_retries")]
    pub apply_retries: usize,

    /// Initial backoff between re-plan attempts
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_partition_count() -> u32 {
    257
}
fn default_backup_count() -> usize {
    1
}
fn default_max_in_flight() -> usize {
    8
}
fn default_distribution_interval() -> u64 {
    1_000
}
fn default_apply_retries() -> usize {
    5
}
fn default_retry_backoff() -> u64 {
    10
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            partition_count: default_partition_count(),
            backup_count: default_backup_count(),
            max_in_flight: default_max_in_flight(),
            distribution_interval_ms: default_distribution_interval(),
            apply_retries: default_apply_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl PartitionConfig {
    fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(Error::InvalidConfig("partition_count must be > 0".into()));
        }
        if self.max_in_flight == 0 {
            return Err(Error::InvalidConfig("max_in_flight must be > 0".into()));
        }
        if self.apply_retries == 0 {
            return Err(Error::InvalidConfig("apply_retries must be > 0".into()));
        }
        Ok(())
    }
}

/// What the default failure policy does when a service is declared failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicyMode {
    /// Stop the failed service (fail-stop)
    StopService,
    /// Only log the failure
    Logging,
}

/// Liveness guardian settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Hard timeout applied to the service's own coordination loop
    #[serde(default = "default_guardian_timeout")]
    pub timeout_ms: u64,

    /// Fraction of the timeout after which recovery is attempted
    #[serde(default = "default_recover_fraction")]
    pub recover_fraction: f32,

    /// Upper bound between two scans
    #[serde(default = "default_scan_interval")]
    pub scan_interval_ms: u64,

    /// Registration limit
    #[serde(default = "default_max_guardables")]
    pub max_guardables: usize,

    #[serde(default = "default_failure_mode")]
    pub failure_policy: FailurePolicyMode,
}

fn default_true() -> bool {
    true
}
fn default_guardian_timeout() -> u64 {
    305_000
}
fn default_recover_fraction() -> f32 {
    0.8
}
fn default_scan_interval() -> u64 {
    1_000
}
fn default_max_guardables() -> usize {
    4_096
}
fn default_failure_mode() -> FailurePolicyMode {
    FailurePolicyMode::StopService
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_guardian_timeout(),
            recover_fraction: default_recover_fraction(),
            scan_interval_ms: default_scan_interval(),
            max_guardables: default_max_guardables(),
            failure_policy: default_failure_mode(),
        }
    }
}

impl GuardianConfig {
    fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::InvalidConfig("guardian timeout must be > 0".into()));
        }
        if !(self.recover_fraction > 0.0 && self.recover_fraction <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "recover_fraction must be in (0, 1], got {}",
                self.recover_fraction
            )));
        }
        if self.scan_interval_ms == 0 {
            return Err(Error::InvalidConfig("scan_interval_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Quorum thresholds; zero disables a rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuorumConfig {
    #[serde(default)]
    pub distribution_quorum: usize,
    #[serde(default)]
    pub restore_quorum: usize,
    #[serde(default)]
    pub recover_quorum: usize,
    /// Fraction of the last known ownership size required for recovery;
    /// 0 means the 2/3 default
    #[serde(default)]
    pub recover_threshold_factor: f32,
    #[serde(default)]
    pub read_quorum: usize,
    #[serde(default)]
    pub write_quorum: usize,
    /// Minimum storage members before new members may join
    #[serde(default)]
    pub join_quorum: usize,
    /// Minimum proxy members before client connections are accepted
    #[serde(default)]
    pub connect_quorum: usize,
    /// Cluster-level thresholds by role (`*`, `sites:<role>`, `machines:<role>`)
    #[serde(default)]
    pub timeout_survivor_quorum: BTreeMap<String, usize>,
}

impl QuorumConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.recover_threshold_factor) {
            return Err(Error::InvalidConfig(format!(
                "recover_threshold_factor must be in [0, 1], got {}",
                self.recover_threshold_factor
            )));
        }
        Ok(())
    }
}

/// Ordering used by the load balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadOrder {
    Natural,
    ConnectionCount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    #[serde(default = "default_load_order")]
    pub order: LoadOrder,
}

fn default_load_order() -> LoadOrder {
    LoadOrder::Natural
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            order: default_load_order(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.partition.partition_count, 257);
        assert_eq!(cfg.guardian.failure_policy, FailurePolicyMode::StopService);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
service_name = "Orders"

[partition]
partition_count = 31
backup_count = 2

[guardian]
timeout_ms = 1000
recover_fraction = 0.5
failure_policy = "logging"

[quorum]
distribution_quorum = 3

[quorum.timeout_survivor_quorum]
"*" = 2
"#
        )
        .unwrap();

        let cfg = Config::from_file(file.path()).unwrap();
        assert_eq!(cfg.service_name, "Orders");
        assert_eq!(cfg.partition.partition_count, 31);
        assert_eq!(cfg.partition.backup_count, 2);
        assert_eq!(cfg.partition.max_in_flight, 8);
        assert_eq!(cfg.guardian.failure_policy, FailurePolicyMode::Logging);
        assert_eq!(cfg.quorum.distribution_quorum, 3);
        assert_eq!(cfg.quorum.timeout_survivor_quorum.get("*"), Some(&2));
    }

    #[test]
    fn test_invalid_fraction_rejected() {
        let mut cfg = Config::default();
        cfg.guardian.recover_fraction = 1.5;
        assert!(cfg.validate().is_err());

        cfg.guardian.recover_fraction = 0.0;
        assert!(cfg.validate().is_err());
    }
}
