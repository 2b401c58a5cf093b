use std::{sync::Arc, time::Duration};

use anyhow::Context;

use crate::{
    config::{Config, LeaseBackend, StorageBackend},
    infrastructure::{
        db::{self, PgPool},
        event_bus::{EventBus, InMemoryEventBus, LoggingEventHandler},
        lease::{InMemoryLeaseManager, LeaseManager, RedisLeaseManager},
    },
    repository::{
        InMemoryStatsRepository, InMemoryTransactionStore, InMemoryValidatorRepository,
        PgStatsRepository, PgTransactionStore, PgValidatorRepository, StatsRepository,
        TransactionStore, ValidatorRepository,
    },
    service::{
        AmountBounds, BridgeStateMachine, ChainAdapterRegistry, ConsensusManager,
        ConsensusSettings, Ed25519AttestationVerifier, EmergencyStop, EngineSettings,
        FeeCalculator, FeeSchedule, NetworkRegistry, ReconciliationScheduler,
        ReconciliationSettings, RequestValidator, RetryConfig, VolumeLedger, VolumeLimits,
    },
    utils::{time_utils::duration_secs, Clock},
};

/// 存储、租约与事件总线的具体实现
pub struct Backends {
    pub store: Arc<dyn TransactionStore>,
    pub validators: Arc<dyn ValidatorRepository>,
    pub stats: Arc<dyn StatsRepository>,
    pub leases: Arc<dyn LeaseManager>,
    pub events: Arc<dyn EventBus>,
    pub pool: Option<PgPool>,
}

impl Backends {
    /// 单进程内存实现（需在 tokio 运行时内调用）
    pub fn in_memory(clock: Arc<dyn Clock>, lease_ttl_secs: u64) -> Self {
        Self {
            store: Arc::new(InMemoryTransactionStore::new()),
            validators: Arc::new(InMemoryValidatorRepository::new()),
            stats: Arc::new(InMemoryStatsRepository::new()),
            leases: Arc::new(InMemoryLeaseManager::new(
                duration_secs(lease_ttl_secs),
                clock,
            )),
            events: Arc::new(InMemoryEventBus::new(None)),
            pool: None,
        }
    }

    /// 按配置选择 Postgres / Redis 或内存实现
    pub async fn from_config(config: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let mut backends = Self::in_memory(clock, config.lease.ttl_secs);

        if config.storage.backend == StorageBackend::Postgres {
            let pool = db::init_pool(&config.database).await?;
            tracing::info!("Database connected");
            backends.store = Arc::new(PgTransactionStore::new(pool.clone()));
            backends.validators = Arc::new(PgValidatorRepository::new(pool.clone()));
            backends.stats = Arc::new(PgStatsRepository::new(pool.clone()));
            backends.events = Arc::new(InMemoryEventBus::new(Some(pool.clone())));
            backends.pool = Some(pool);
        }

        if config.lease.backend == LeaseBackend::Redis {
            let leases = RedisLeaseManager::new(&config.redis.url, config.lease.ttl_secs)
                .await
                .context("Failed to connect lease manager to Redis")?;
            tracing::info!("Redis lease manager connected");
            backends.leases = Arc::new(leases);
        }

        Ok(backends)
    }
}

/// 应用状态
/// 包含所有共享资源
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<NetworkRegistry>,
    pub store: Arc<dyn TransactionStore>,
    pub stats: Arc<dyn StatsRepository>,
    pub events: Arc<dyn EventBus>,
    pub request_validator: Arc<RequestValidator>,
    pub consensus: Arc<ConsensusManager>,
    pub engine: Arc<BridgeStateMachine>,
    pub scheduler: Arc<ReconciliationScheduler>,
    pub emergency_stop: EmergencyStop,
    pub volume: Arc<VolumeLedger>,
    pub clock: Arc<dyn Clock>,
    pub pool: Option<PgPool>,
}

impl AppState {
    /// 组装所有组件；网络配置不完整时启动失败
    pub async fn build(
        config: Config,
        backends: Backends,
        adapters: ChainAdapterRegistry,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let bridge = &config.bridge;
        let registry = Arc::new(
            NetworkRegistry::from_configs(&config.networks).context("Invalid network configuration")?,
        );

        let fees = FeeCalculator::new(
            FeeSchedule {
                base_rate_bps: bridge.base_rate_bps,
                express_rate_bps: bridge.express_rate_bps,
                min_fee: bridge.min_fee,
            },
            bridge.attestation_overhead_secs,
        );

        // 重建24小时额度窗口
        let volume = Arc::new(VolumeLedger::new(VolumeLimits {
            daily_limit: bridge.daily_limit,
            global_daily_limit: bridge.global_daily_limit,
        }));
        let now = clock.now();
        let recent = backends
            .store
            .list_created_since(now - chrono::Duration::hours(24))
            .await
            .context("Failed to load recent transfers")?;
        volume.rebuild(&recent, now);

        let emergency_stop = EmergencyStop::new();
        let consensus = Arc::new(ConsensusManager::new(
            backends.validators.clone(),
            backends.store.clone(),
            Arc::new(Ed25519AttestationVerifier),
            clock.clone(),
            ConsensusSettings {
                quorum_count: bridge.quorum_count,
                threshold_percent: bridge.consensus_threshold_percent,
                min_active_stake: bridge.min_active_stake,
                reputation_baseline: bridge.reputation_baseline,
                reputation_floor: bridge.reputation_floor,
                slash_reputation_penalty: bridge.slash_reputation_penalty,
            },
        ));

        let retry = RetryConfig::from(bridge);
        let engine = Arc::new(BridgeStateMachine::new(
            backends.store.clone(),
            registry.clone(),
            adapters.clone(),
            consensus.clone(),
            backends.leases.clone(),
            backends.events.clone(),
            volume.clone(),
            emergency_stop.clone(),
            clock.clone(),
            EngineSettings {
                retry,
                adapter_timeout: Duration::from_secs(bridge.adapter_timeout_secs),
                reorg_tolerance: bridge.reorg_tolerance,
                processing_concurrency: bridge.processing_concurrency,
            },
        ));

        let request_validator = Arc::new(RequestValidator::new(
            registry.clone(),
            adapters,
            fees,
            volume.clone(),
            emergency_stop.clone(),
            backends.store.clone(),
            backends.events.clone(),
            clock.clone(),
            AmountBounds {
                min_limit: bridge.min_limit,
                max_limit: bridge.max_limit,
            },
        ));

        let scheduler = Arc::new(ReconciliationScheduler::new(
            engine.clone(),
            backends.store.clone(),
            backends.stats.clone(),
            consensus.clone(),
            clock.clone(),
            retry,
            ReconciliationSettings {
                stuck_timeout_secs: bridge.stuck_timeout_secs,
                stats_bucket_secs: bridge.stats_bucket_secs,
                stats_lookback_buckets: bridge.stats_lookback_buckets,
                validator_liveness_secs: bridge.validator_liveness_secs,
                retention_days: bridge.retention_days,
            },
        ));

        backends.events.subscribe(Arc::new(LoggingEventHandler)).await;

        Ok(Self {
            config: Arc::new(config),
            registry,
            store: backends.store,
            stats: backends.stats,
            events: backends.events,
            request_validator,
            consensus,
            engine,
            scheduler,
            emergency_stop,
            volume,
            clock,
            pool: backends.pool,
        })
    }

    /// 全内存组装（测试与本地运行）
    pub async fn in_memory(
        config: Config,
        adapters: ChainAdapterRegistry,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let backends = Backends::in_memory(clock.clone(), config.lease.ttl_secs);
        Self::build(config, backends, adapters, clock).await
    }
}
