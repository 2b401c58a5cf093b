//! 配置管理模块
//! 支持从环境变量和配置文件加载配置

use std::{path::Path, str::FromStr};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::{amount_serde, Amount};

/// 应用配置结构体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default = "default_networks")]
    pub networks: Vec<NetworkConfig>,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

/// 交易存储后端
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseBackend {
    Redis,
    Memory,
}

/// 单笔交易处理租约
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    pub backend: LeaseBackend,
    pub ttl_secs: u64,
}

/// 管理接口鉴权
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub jwt_secret: String,
}

/// 跨链桥引擎参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    // 手续费
    pub base_rate_bps: u32,
    pub express_rate_bps: u32,
    #[serde(with = "amount_serde")]
    pub min_fee: Amount,

    // 限额
    #[serde(with = "amount_serde")]
    pub min_limit: Amount,
    #[serde(with = "amount_serde")]
    pub max_limit: Amount,
    #[serde(with = "amount_serde")]
    pub daily_limit: Amount,
    /// 0 表示不启用全局日限额
    #[serde(with = "amount_serde")]
    pub global_daily_limit: Amount,

    // 重试
    pub max_retry_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: u64,
    pub max_delay_ms: u64,
    pub adapter_timeout_secs: u64,
    pub reorg_tolerance: u64,

    // 共识
    pub quorum_count: usize,
    pub consensus_threshold_percent: u32,
    #[serde(with = "amount_serde")]
    pub min_active_stake: Amount,
    pub reputation_baseline: i64,
    pub reputation_floor: i64,
    pub slash_reputation_penalty: i64,

    // 对账调度
    pub stuck_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub processing_concurrency: usize,
    pub validator_liveness_secs: u64,
    pub retention_days: u64,
    pub stats_bucket_secs: u64,
    pub stats_lookback_buckets: u32,

    /// 预计耗时中签名收集的开销
    pub attestation_overhead_secs: u64,
}

/// 单条网络配置（可选字段在注册表加载时校验）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct NetworkConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub required_confirmations: Option<u64>,
    pub fee_basis_points: Option<u32>,
    pub rpc_endpoint: Option<String>,
    pub block_time_secs: Option<u64>,
    pub address_format: Option<String>,
}

fn default_true() -> bool {
    true
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8090".into()),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://postgres@localhost:5432/ironbridge".into()),
            max_connections: env_or("DB_MAX_CONNS", 16),
            min_connections: env_or("DB_MIN_CONNS", 2),
            acquire_timeout_secs: env_or("DB_ACQ_TIMEOUT_SECS", 5),
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", 300),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into()),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".into()),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let backend = match std::env::var("STORAGE_BACKEND").as_deref() {
            Ok("memory") => StorageBackend::Memory,
            _ => StorageBackend::Postgres,
        };
        Self { backend }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        let backend = match std::env::var("LEASE_BACKEND").as_deref() {
            Ok("redis") => LeaseBackend::Redis,
            _ => LeaseBackend::Memory,
        };
        Self {
            backend,
            ttl_secs: env_or("LEASE_TTL_SECS", 60),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            jwt_secret: std::env::var("ADMIN_JWT_SECRET").unwrap_or_else(|_| {
                "default-admin-secret-please-change-in-production-32".to_string()
            }),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_rate_bps: env_or("BRIDGE_BASE_RATE_BPS", 50),
            express_rate_bps: env_or("BRIDGE_EXPRESS_RATE_BPS", 50),
            min_fee: env_or("BRIDGE_MIN_FEE", 1_000),
            min_limit: env_or("BRIDGE_MIN_LIMIT", 10_000),
            max_limit: env_or("BRIDGE_MAX_LIMIT", 1_000_000_000_000),
            daily_limit: env_or("BRIDGE_DAILY_LIMIT", 10_000_000_000_000),
            global_daily_limit: env_or("BRIDGE_GLOBAL_DAILY_LIMIT", 0),
            max_retry_attempts: env_or("BRIDGE_MAX_RETRY_ATTEMPTS", 5),
            initial_delay_ms: env_or("BRIDGE_INITIAL_DELAY_MS", 1_000),
            backoff_multiplier: env_or("BRIDGE_BACKOFF_MULTIPLIER", 2),
            max_delay_ms: env_or("BRIDGE_MAX_DELAY_MS", 60_000),
            adapter_timeout_secs: env_or("BRIDGE_ADAPTER_TIMEOUT_SECS", 10),
            reorg_tolerance: env_or("BRIDGE_REORG_TOLERANCE", 2),
            quorum_count: env_or("BRIDGE_QUORUM_COUNT", 2),
            consensus_threshold_percent: env_or("BRIDGE_CONSENSUS_THRESHOLD_PERCENT", 67),
            min_active_stake: env_or("BRIDGE_MIN_ACTIVE_STAKE", 1),
            reputation_baseline: env_or("BRIDGE_REPUTATION_BASELINE", 100),
            reputation_floor: env_or("BRIDGE_REPUTATION_FLOOR", 50),
            slash_reputation_penalty: env_or("BRIDGE_SLASH_REPUTATION_PENALTY", 20),
            stuck_timeout_secs: env_or("BRIDGE_STUCK_TIMEOUT_SECS", 900),
            reconcile_interval_secs: env_or("BRIDGE_RECONCILE_INTERVAL_SECS", 60),
            poll_interval_secs: env_or("BRIDGE_POLL_INTERVAL_SECS", 5),
            processing_concurrency: env_or("BRIDGE_PROCESSING_CONCURRENCY", 16),
            validator_liveness_secs: env_or("BRIDGE_VALIDATOR_LIVENESS_SECS", 86_400),
            retention_days: env_or("BRIDGE_RETENTION_DAYS", 90),
            stats_bucket_secs: env_or("BRIDGE_STATS_BUCKET_SECS", 3_600),
            stats_lookback_buckets: env_or("BRIDGE_STATS_LOOKBACK_BUCKETS", 24),
            attestation_overhead_secs: env_or("BRIDGE_ATTESTATION_OVERHEAD_SECS", 120),
        }
    }
}

/// 默认网络（relayer 地址可通过环境变量覆盖）
pub fn default_networks() -> Vec<NetworkConfig> {
    let network = |id: &str, confirmations: u64, bps: u32, rpc_env: &str, rpc: &str, block: u64, format: &str| {
        NetworkConfig {
            id: id.to_string(),
            enabled: true,
            required_confirmations: Some(confirmations),
            fee_basis_points: Some(bps),
            rpc_endpoint: Some(std::env::var(rpc_env).unwrap_or_else(|_| rpc.to_string())),
            block_time_secs: Some(block),
            address_format: Some(format.to_string()),
        }
    };

    vec![
        network("solana", 32, 25, "SOLANA_RELAYER_URL", "http://localhost:9101", 1, "solana"),
        network("ethereum", 12, 100, "ETH_RELAYER_URL", "http://localhost:9102", 12, "evm"),
        network("bsc", 15, 50, "BSC_RELAYER_URL", "http://localhost:9103", 3, "evm"),
        network("bitcoin", 6, 150, "BTC_RELAYER_URL", "http://localhost:9104", 600, "bitcoin"),
        network("ton", 10, 40, "TON_RELAYER_URL", "http://localhost:9105", 5, "ton"),
    ]
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
            lease: LeaseConfig::default(),
            admin: AdminConfig::default(),
            bridge: BridgeConfig::default(),
            networks: default_networks(),
        })
    }

    /// 从配置文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// 从环境变量和配置文件合并加载（配置文件优先级更高）
    pub fn from_env_and_file<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        match path {
            Some(path) if path.as_ref().exists() => Self::from_file(path),
            _ => Self::from_env(),
        }
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        if self.storage.backend == StorageBackend::Postgres
            && !self.database.url.starts_with("postgres://")
            && !self.database.url.starts_with("postgresql://")
        {
            anyhow::bail!("DATABASE_URL must start with postgres:// or postgresql://");
        }

        if self.admin.jwt_secret.len() < 32 {
            anyhow::bail!("ADMIN_JWT_SECRET must be at least 32 characters");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("LOG_LEVEL must be one of: {:?}", valid_levels);
        }

        if self.logging.format != "json" && self.logging.format != "text" {
            anyhow::bail!("LOG_FORMAT must be 'json' or 'text'");
        }

        self.bridge.validate()?;

        // 一轮处理最多串行 4 次适配器调用，租约必须覆盖整轮
        let pass_budget = self
            .bridge
            .adapter_timeout_secs
            .saturating_mul(MAX_ADAPTER_CALLS_PER_PASS);
        if self.lease.ttl_secs > MAX_WINDOW_SECS {
            anyhow::bail!("lease.ttl_secs must not exceed {MAX_WINDOW_SECS}");
        }
        if self.lease.ttl_secs <= pass_budget {
            anyhow::bail!(
                "lease.ttl_secs ({}) must exceed {} x bridge.adapter_timeout_secs ({})",
                self.lease.ttl_secs,
                MAX_ADAPTER_CALLS_PER_PASS,
                self.bridge.adapter_timeout_secs
            );
        }

        let mut seen = std::collections::HashSet::new();
        for network in &self.networks {
            if network.id.trim().is_empty() {
                anyhow::bail!("network id must not be empty");
            }
            if !seen.insert(network.id.as_str()) {
                anyhow::bail!("duplicate network id '{}'", network.id);
            }
        }

        Ok(())
    }
}

/// 一轮处理中串行的适配器调用上限（提交锁定、确认、提交释放、释放确认）
pub const MAX_ADAPTER_CALLS_PER_PASS: u64 = 4;

// 时间窗口类配置的上限：10 年
const MAX_WINDOW_SECS: u64 = 10 * 365 * 86_400;
const MAX_RETENTION_DAYS: u64 = 10 * 365;

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_rate_bps > 10_000 || self.express_rate_bps > 10_000 {
            anyhow::bail!("fee rates must be within 0..=10000 basis points");
        }
        if self.min_limit == 0 || self.min_limit > self.max_limit {
            anyhow::bail!("min_limit must be positive and not exceed max_limit");
        }
        if self.daily_limit < self.min_limit {
            anyhow::bail!("daily_limit must allow at least one minimum transfer");
        }
        if !(1..=100).contains(&self.consensus_threshold_percent) {
            anyhow::bail!("consensus_threshold_percent must be within 1..=100");
        }
        if self.quorum_count == 0 {
            anyhow::bail!("quorum_count must be at least 1");
        }
        if self.backoff_multiplier == 0 {
            anyhow::bail!("backoff_multiplier must be at least 1");
        }
        if self.max_delay_ms < self.initial_delay_ms {
            anyhow::bail!("max_delay_ms must not be below initial_delay_ms");
        }
        if self.adapter_timeout_secs == 0 {
            anyhow::bail!("adapter_timeout_secs must be positive");
        }
        if self.stats_bucket_secs == 0 || self.processing_concurrency == 0 {
            anyhow::bail!("stats_bucket_secs and processing_concurrency must be positive");
        }
        if self.reputation_floor > self.reputation_baseline {
            anyhow::bail!("reputation_floor must not exceed reputation_baseline");
        }
        if self.stuck_timeout_secs == 0 || self.stuck_timeout_secs > MAX_WINDOW_SECS {
            anyhow::bail!("stuck_timeout_secs must be within 1..={MAX_WINDOW_SECS}");
        }
        if self.validator_liveness_secs == 0 || self.validator_liveness_secs > MAX_WINDOW_SECS {
            anyhow::bail!("validator_liveness_secs must be within 1..={MAX_WINDOW_SECS}");
        }
        if self.retention_days == 0 || self.retention_days > MAX_RETENTION_DAYS {
            anyhow::bail!("retention_days must be within 1..={MAX_RETENTION_DAYS}");
        }
        if self
            .stats_bucket_secs
            .saturating_mul(u64::from(self.stats_lookback_buckets))
            > MAX_WINDOW_SECS
        {
            anyhow::bail!(
                "stats_bucket_secs x stats_lookback_buckets must not exceed {MAX_WINDOW_SECS}"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_env_defaults_are_valid() {
        let mut config = Config::from_env().unwrap();
        config.storage.backend = StorageBackend::Memory;
        config.logging.level = "info".into();
        config.logging.format = "text".into();
        config.admin.jwt_secret = "x".repeat(32);
        config.bridge = BridgeConfig::default();
        config.bridge.min_limit = 10_000;
        config.bridge.max_limit = 1_000_000_000;
        config.bridge.daily_limit = 10_000_000_000;
        config.bridge.consensus_threshold_percent = 67;
        config.bridge.quorum_count = 2;
        config.bridge.backoff_multiplier = 2;
        config.bridge.initial_delay_ms = 100;
        config.bridge.max_delay_ms = 1_000;
        config.bridge.adapter_timeout_secs = 10;
        config.lease.ttl_secs = 60;
        assert!(config.validate().is_ok());
        assert!(config.networks.iter().any(|n| n.id == "ethereum"));
    }

    #[test]
    fn test_from_file_overrides_bridge_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[storage]
backend = "memory"

[lease]
backend = "memory"
ttl_secs = 30

[admin]
jwt_secret = "0123456789abcdef0123456789abcdef"

[bridge]
base_rate_bps = 75
daily_limit = "340282366920938463463374607431768211455"
consensus_threshold_percent = 80

[[networks]]
id = "solana"
required_confirmations = 32
fee_basis_points = 25
rpc_endpoint = "http://relayer:9101"
block_time_secs = 1
address_format = "solana"

[[networks]]
id = "legacy"
enabled = false
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.lease.ttl_secs, 30);
        assert_eq!(config.bridge.base_rate_bps, 75);
        assert_eq!(config.bridge.daily_limit, u128::MAX);
        assert_eq!(config.bridge.consensus_threshold_percent, 80);
        assert_eq!(config.networks.len(), 2);
        assert!(!config.networks[1].enabled);
        assert_eq!(config.networks[1].required_confirmations, None);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut bridge = BridgeConfig::default();
        bridge.min_limit = 1;
        bridge.max_limit = 10;
        bridge.daily_limit = 100;
        bridge.initial_delay_ms = 1;
        bridge.max_delay_ms = 10;
        bridge.consensus_threshold_percent = 0;
        assert!(bridge.validate().is_err());

        bridge.consensus_threshold_percent = 101;
        assert!(bridge.validate().is_err());
    }

    fn valid_bridge() -> BridgeConfig {
        let mut bridge = BridgeConfig::default();
        bridge.min_limit = 1;
        bridge.max_limit = 10;
        bridge.daily_limit = 100;
        bridge.initial_delay_ms = 1;
        bridge.max_delay_ms = 10;
        bridge.consensus_threshold_percent = 67;
        bridge.quorum_count = 2;
        bridge.backoff_multiplier = 2;
        bridge.adapter_timeout_secs = 10;
        bridge.stuck_timeout_secs = 900;
        bridge.validator_liveness_secs = 86_400;
        bridge.retention_days = 90;
        bridge.stats_bucket_secs = 3_600;
        bridge.stats_lookback_buckets = 24;
        bridge.processing_concurrency = 4;
        bridge.reputation_baseline = 100;
        bridge.reputation_floor = 50;
        bridge
    }

    #[test]
    fn test_validate_rejects_out_of_range_windows() {
        assert!(valid_bridge().validate().is_ok());

        let mut bridge = valid_bridge();
        bridge.retention_days = u64::MAX;
        assert!(bridge.validate().is_err());

        let mut bridge = valid_bridge();
        bridge.validator_liveness_secs = u64::MAX;
        assert!(bridge.validate().is_err());

        let mut bridge = valid_bridge();
        bridge.stuck_timeout_secs = 0;
        assert!(bridge.validate().is_err());

        let mut bridge = valid_bridge();
        bridge.stats_lookback_buckets = u32::MAX;
        assert!(bridge.validate().is_err());
    }

    #[test]
    fn test_validate_requires_lease_to_outlive_adapter_calls() {
        let mut config = Config::from_env().unwrap();
        config.storage.backend = StorageBackend::Memory;
        config.logging.level = "info".into();
        config.logging.format = "text".into();
        config.admin.jwt_secret = "x".repeat(32);
        config.bridge = valid_bridge();

        config.bridge.adapter_timeout_secs = 5;
        config.lease.ttl_secs = 1;
        assert!(config.validate().is_err());

        // 恰好等于 4 倍仍不够
        config.lease.ttl_secs = 20;
        assert!(config.validate().is_err());

        config.lease.ttl_secs = 21;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_limits() {
        let mut bridge = BridgeConfig::default();
        bridge.min_limit = 100;
        bridge.max_limit = 10;
        assert!(bridge.validate().is_err());
    }
}
