//! 测试辅助模块
//! 记录调用次数的链适配器、手动时钟与全内存组装的应用状态

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::SigningKey;
use ironbridge::{
    app_state::{AppState, Backends},
    config::{BridgeConfig, Config, LeaseBackend, NetworkConfig, StorageBackend},
    domain::{AdapterError, AddressFormat, Amount, BridgeTransaction, TransferRequest},
    infrastructure::{
        event_bus::InMemoryEventBus,
        jwt::{self, AdminClaims},
        lease::InMemoryLeaseManager,
    },
    repository::{StatsRepository, TransactionStore, ValidatorRepository},
    service::{consensus_manager::sign_attestation, AttestationOutcome, ChainAdapter, ChainAdapterRegistry},
    utils::{Clock, ManualClock},
};
use uuid::Uuid;

pub const ADMIN_SECRET: &str = "integration-test-admin-secret-0123456789";
pub const DEST_ADDRESS: &str = "0x52908400098527886e0f7030069857d2e4169ee7";

// ============ 链适配器替身 ============

/// 记录每类调用次数，可注入失败、延迟与确认数
pub struct RecordingChainAdapter {
    network: String,
    format: AddressFormat,
    pub lock_calls: AtomicUsize,
    pub release_calls: AtomicUsize,
    pub confirmation_polls: AtomicUsize,
    confirmations: AtomicU64,
    release_confirmations: AtomicU64,
    lock_failures: AtomicU32,
    reject_locks: AtomicBool,
    lock_delay_ms: AtomicU64,
    poll_delay_ms: AtomicU64,
    // 每次调用把手动时钟推进一段，模拟链上耗时
    latency: Mutex<Option<(Arc<ManualClock>, chrono::Duration)>>,
}

impl RecordingChainAdapter {
    pub fn new(network: &str, format: AddressFormat) -> Self {
        Self {
            network: network.to_string(),
            format,
            lock_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
            confirmation_polls: AtomicUsize::new(0),
            confirmations: AtomicU64::new(0),
            release_confirmations: AtomicU64::new(0),
            lock_failures: AtomicU32::new(0),
            reject_locks: AtomicBool::new(false),
            lock_delay_ms: AtomicU64::new(0),
            poll_delay_ms: AtomicU64::new(0),
            latency: Mutex::new(None),
        }
    }

    pub fn set_confirmations(&self, n: u64) {
        self.confirmations.store(n, Ordering::SeqCst);
    }

    pub fn set_release_confirmations(&self, n: u64) {
        self.release_confirmations.store(n, Ordering::SeqCst);
    }

    /// 接下来 n 次 submit_lock 返回 RPC 错误
    pub fn fail_next_locks(&self, n: u32) {
        self.lock_failures.store(n, Ordering::SeqCst);
    }

    pub fn reject_locks(&self, reject: bool) {
        self.reject_locks.store(reject, Ordering::SeqCst);
    }

    pub fn set_lock_delay(&self, delay: Duration) {
        self.lock_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// get_confirmations 内真实等待，给并发 worker 留出窗口
    pub fn set_poll_delay(&self, delay: Duration) {
        self.poll_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn simulate_latency(&self, clock: Arc<ManualClock>, per_call: chrono::Duration) {
        *self.latency.lock().unwrap() = Some((clock, per_call));
    }

    fn elapse(&self) {
        if let Some((clock, per_call)) = self.latency.lock().unwrap().as_ref() {
            clock.advance(*per_call);
        }
    }

    pub fn locks(&self) -> usize {
        self.lock_calls.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainAdapter for RecordingChainAdapter {
    fn network(&self) -> &str {
        &self.network
    }

    async fn submit_lock(&self, tx: &BridgeTransaction) -> Result<String, AdapterError> {
        self.lock_calls.fetch_add(1, Ordering::SeqCst);
        self.elapse();

        let delay = self.lock_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self
            .lock_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AdapterError::Rpc("relayer unavailable".into()));
        }
        if self.reject_locks.load(Ordering::SeqCst) {
            return Err(AdapterError::Rejected("insufficient balance".into()));
        }
        Ok(format!("{}-lock-{}", self.network, tx.id))
    }

    async fn get_confirmations(&self, _source_tx_ref: &str) -> Result<u64, AdapterError> {
        self.confirmation_polls.fetch_add(1, Ordering::SeqCst);
        self.elapse();

        let delay = self.poll_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(self.confirmations.load(Ordering::SeqCst))
    }

    async fn submit_release(&self, tx: &BridgeTransaction) -> Result<String, AdapterError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.elapse();
        Ok(format!("{}-release-{}", self.network, tx.id))
    }

    async fn get_release_confirmations(&self, _dest_tx_ref: &str) -> Result<u64, AdapterError> {
        Ok(self.release_confirmations.load(Ordering::SeqCst))
    }

    fn is_valid_address(&self, address: &str) -> bool {
        self.format.validate(address)
    }
}

// ============ 配置 ============

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
}

fn network(id: &str, confirmations: u64, bps: u32, block: u64, format: &str, enabled: bool) -> NetworkConfig {
    NetworkConfig {
        id: id.to_string(),
        enabled,
        required_confirmations: Some(confirmations),
        fee_basis_points: Some(bps),
        rpc_endpoint: Some(format!("http://localhost:9100/{id}")),
        block_time_secs: Some(block),
        address_format: Some(format.to_string()),
    }
}

/// 与环境变量无关的确定性配置
pub fn test_config() -> Config {
    let mut config = Config::from_env().unwrap();
    config.storage.backend = StorageBackend::Memory;
    config.lease.backend = LeaseBackend::Memory;
    config.lease.ttl_secs = 60;
    config.admin.jwt_secret = ADMIN_SECRET.to_string();
    config.bridge = BridgeConfig {
        base_rate_bps: 50,
        express_rate_bps: 50,
        min_fee: 1_000,
        min_limit: 10_000,
        max_limit: 1_000_000_000,
        daily_limit: 10_000_000,
        global_daily_limit: 0,
        max_retry_attempts: 3,
        initial_delay_ms: 1_000,
        backoff_multiplier: 2,
        max_delay_ms: 60_000,
        adapter_timeout_secs: 5,
        reorg_tolerance: 2,
        quorum_count: 2,
        consensus_threshold_percent: 67,
        min_active_stake: 1,
        reputation_baseline: 100,
        reputation_floor: 50,
        slash_reputation_penalty: 20,
        stuck_timeout_secs: 900,
        reconcile_interval_secs: 60,
        poll_interval_secs: 5,
        processing_concurrency: 8,
        validator_liveness_secs: 86_400,
        retention_days: 90,
        stats_bucket_secs: 3_600,
        stats_lookback_buckets: 24,
        attestation_overhead_secs: 120,
    };
    config.networks = vec![
        network("solana", 32, 25, 1, "solana", true),
        network("ethereum", 12, 100, 12, "evm", true),
        network("bsc", 15, 50, 3, "evm", false),
    ];
    config
}

pub fn source_address(seed: u8) -> String {
    bs58::encode([seed; 32]).into_string()
}

pub fn request(amount: Amount) -> TransferRequest {
    request_from(&source_address(7), amount)
}

pub fn request_from(source: &str, amount: Amount) -> TransferRequest {
    TransferRequest {
        source_network: "solana".into(),
        dest_network: "ethereum".into(),
        source_address: source.to_string(),
        dest_address: DEST_ADDRESS.into(),
        amount,
        express: false,
    }
}

pub fn admin_token() -> String {
    jwt::issue_token(ADMIN_SECRET, &AdminClaims::new("ops@bridge", "admin", 3_600)).unwrap()
}

pub fn viewer_token() -> String {
    jwt::issue_token(ADMIN_SECRET, &AdminClaims::new("viewer@bridge", "viewer", 3_600)).unwrap()
}

// ============ 验证者 ============

pub struct TestValidator {
    pub key: SigningKey,
    pub address: String,
    pub stake: Amount,
}

impl TestValidator {
    pub fn new(seed: u8, stake: Amount) -> Self {
        let key = SigningKey::from_bytes(&[seed; 32]);
        let address = hex::encode(key.verifying_key().to_bytes());
        Self { key, address, stake }
    }

    pub fn sign(&self, tx: &BridgeTransaction) -> String {
        sign_attestation(&self.key, tx)
    }
}

// ============ 测试装配 ============

/// 共享的持久化部分，模拟重启时保留
#[derive(Clone)]
pub struct Persisted {
    pub store: Arc<dyn TransactionStore>,
    pub validators: Arc<dyn ValidatorRepository>,
    pub stats: Arc<dyn StatsRepository>,
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub clock: Arc<ManualClock>,
    pub solana: Arc<RecordingChainAdapter>,
    pub ethereum: Arc<RecordingChainAdapter>,
    pub persisted: Persisted,
    pub config: Config,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let solana = Arc::new(RecordingChainAdapter::new("solana", AddressFormat::Solana));
        let ethereum = Arc::new(RecordingChainAdapter::new("ethereum", AddressFormat::Evm));

        let backends = Backends::in_memory(clock.clone(), config.lease.ttl_secs);
        let persisted = Persisted {
            store: backends.store.clone(),
            validators: backends.validators.clone(),
            stats: backends.stats.clone(),
        };
        Self::assemble(config, backends, persisted, clock, solana, ethereum).await
    }

    async fn assemble(
        config: Config,
        backends: Backends,
        persisted: Persisted,
        clock: Arc<ManualClock>,
        solana: Arc<RecordingChainAdapter>,
        ethereum: Arc<RecordingChainAdapter>,
    ) -> Self {
        let adapters = ChainAdapterRegistry::new()
            .with(solana.clone())
            .with(ethereum.clone());
        let state = AppState::build(config.clone(), backends, adapters, clock.clone())
            .await
            .unwrap();

        Self {
            state: Arc::new(state),
            clock,
            solana,
            ethereum,
            persisted,
            config,
        }
    }

    /// 模拟进程重启：存储保留，租约、事件总线与内存状态全部重建
    pub async fn restart(&self) -> Self {
        let clock: Arc<dyn Clock> = self.clock.clone();
        let backends = Backends {
            store: self.persisted.store.clone(),
            validators: self.persisted.validators.clone(),
            stats: self.persisted.stats.clone(),
            leases: Arc::new(InMemoryLeaseManager::new(
                chrono::Duration::seconds(self.config.lease.ttl_secs as i64),
                clock,
            )),
            events: Arc::new(InMemoryEventBus::new(None)),
            pool: None,
        };
        Self::assemble(
            self.config.clone(),
            backends,
            self.persisted.clone(),
            self.clock.clone(),
            self.solana.clone(),
            self.ethereum.clone(),
        )
        .await
    }

    pub async fn admit(&self, amount: Amount) -> BridgeTransaction {
        self.state.request_validator.admit(request(amount)).await.unwrap()
    }

    pub async fn get(&self, id: Uuid) -> BridgeTransaction {
        self.state.store.get(id).await.unwrap().unwrap()
    }

    pub async fn register(&self, stakes: &[Amount]) -> Vec<TestValidator> {
        let mut validators = Vec::with_capacity(stakes.len());
        for (i, stake) in stakes.iter().enumerate() {
            let validator = TestValidator::new(i as u8 + 1, *stake);
            self.state
                .consensus
                .register_validator(&validator.address, "ethereum", validator.stake)
                .await
                .unwrap();
            validators.push(validator);
        }
        validators
    }

    pub async fn attest(&self, id: Uuid, validator: &TestValidator) -> AttestationOutcome {
        let tx = self.get(id).await;
        self.state
            .consensus
            .submit_attestation(id, &validator.address, &validator.sign(&tx))
            .await
            .unwrap()
    }

    /// 源链确认充足后推进到 attesting
    pub async fn drive_to_attesting(&self, id: Uuid) -> BridgeTransaction {
        self.solana.set_confirmations(32);
        self.state.engine.process(id).await.unwrap();
        self.get(id).await
    }
}
