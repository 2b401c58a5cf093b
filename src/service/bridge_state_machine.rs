//! 跨链桥状态机（处理引擎）
//! pending → locking → locked → attesting → releasing → completed，任一非终态可进入 failed
//!
//! - 每笔交易处理前先取租约，拿不到直接跳过；每次适配器调用前续租，续租失败放弃本轮
//! - 不可撤回的提交（锁定、释放）前先 CAS 认领记录，确认期间没有其他写入
//! - 所有写入走存储 CAS；状态只从存储中的持久化状态恢复，已完成的步骤不会重做
//! - 适配器调用带超时，超时与 RPC 错误计入 retryCount 并指数退避

use std::{future::Future, sync::Arc, time::Instant};

use chrono::Duration;
use futures::{stream, StreamExt};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    domain::{AdapterError, BridgeError, BridgeTransaction, TransferStatus},
    infrastructure::{
        event_bus::{BridgeEvent, EventBus},
        lease::{Lease, LeaseManager},
    },
    metrics,
    repository::TransactionStore,
    service::{
        chain_adapter::{ChainAdapter, ChainAdapterRegistry},
        consensus_manager::ConsensusManager,
        emergency_stop::{EmergencyStop, PauseMode},
        network_registry::NetworkRegistry,
        transaction_retry::RetryConfig,
        volume_ledger::VolumeLedger,
    },
    utils::Clock,
};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub retry: RetryConfig,
    pub adapter_timeout: std::time::Duration,
    pub reorg_tolerance: u64,
    pub processing_concurrency: usize,
}

/// 处理触发来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessTrigger {
    /// 常规轮询，遵守退避
    Poll,
    /// 对账发现卡住：计一次重试后立即重新处理
    Stuck(String),
    /// 重试已耗尽，直接失败
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// 租约被其他 worker 持有
    Skipped,
    /// 退避未到期、暂停中或写入竞争失败，本轮不处理
    Deferred,
    Processed {
        from: TransferStatus,
        to: TransferStatus,
    },
}

pub struct BridgeStateMachine {
    store: Arc<dyn TransactionStore>,
    registry: Arc<NetworkRegistry>,
    adapters: ChainAdapterRegistry,
    consensus: Arc<ConsensusManager>,
    leases: Arc<dyn LeaseManager>,
    events: Arc<dyn EventBus>,
    volume: Arc<VolumeLedger>,
    emergency_stop: EmergencyStop,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl BridgeStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TransactionStore>,
        registry: Arc<NetworkRegistry>,
        adapters: ChainAdapterRegistry,
        consensus: Arc<ConsensusManager>,
        leases: Arc<dyn LeaseManager>,
        events: Arc<dyn EventBus>,
        volume: Arc<VolumeLedger>,
        emergency_stop: EmergencyStop,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            registry,
            adapters,
            consensus,
            leases,
            events,
            volume,
            emergency_stop,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn process(&self, transaction_id: Uuid) -> Result<ProcessOutcome, BridgeError> {
        self.process_with(transaction_id, ProcessTrigger::Poll).await
    }

    /// 在租约保护下推进一笔交易，尽可能多走几步
    pub async fn process_with(
        &self,
        transaction_id: Uuid,
        trigger: ProcessTrigger,
    ) -> Result<ProcessOutcome, BridgeError> {
        let Some(lease) = self.leases.try_acquire(transaction_id).await? else {
            metrics::inc_lease_skip();
            tracing::debug!(transaction_id = %transaction_id, "Lease held elsewhere, skipping");
            return Ok(ProcessOutcome::Skipped);
        };

        let result = self.process_leased(&lease, trigger).await;

        if let Err(e) = self.leases.release(lease).await {
            tracing::warn!(transaction_id = %transaction_id, error = %e, "Failed to release lease");
        }

        match result {
            Err(BridgeError::Conflict(reason)) => {
                tracing::debug!(transaction_id = %transaction_id, reason = %reason, "Concurrent update, deferring");
                Ok(ProcessOutcome::Deferred)
            }
            other => other,
        }
    }

    async fn process_leased(
        &self,
        lease: &Lease,
        trigger: ProcessTrigger,
    ) -> Result<ProcessOutcome, BridgeError> {
        let transaction_id = lease.transaction_id;
        let mut tx = self
            .store
            .get(transaction_id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("transaction {transaction_id}")))?;
        let from = tx.status;
        if tx.is_terminal() {
            return Ok(ProcessOutcome::Processed { from, to: from });
        }

        match self.emergency_stop.mode() {
            Some(PauseMode::Abort) => {
                self.fail(&mut tx, "aborted by emergency stop".into()).await?;
                return Ok(ProcessOutcome::Processed { from, to: tx.status });
            }
            Some(PauseMode::Halt) if tx.status == TransferStatus::Pending => {
                self.fail(&mut tx, "halted by emergency stop before lock".into())
                    .await?;
                return Ok(ProcessOutcome::Processed { from, to: tx.status });
            }
            Some(PauseMode::Halt) => return Ok(ProcessOutcome::Deferred),
            None => {}
        }

        match trigger {
            ProcessTrigger::Exhausted => {
                let reason = tx
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "retry attempts exhausted".into());
                self.fail(&mut tx, reason).await?;
                return Ok(ProcessOutcome::Processed { from, to: tx.status });
            }
            ProcessTrigger::Stuck(reason) => {
                if !self.record_retry(&mut tx, reason).await? {
                    return Ok(ProcessOutcome::Processed { from, to: tx.status });
                }
            }
            ProcessTrigger::Poll => {
                if !self.is_due(&tx) {
                    return Ok(ProcessOutcome::Deferred);
                }
            }
        }

        match self.advance(&mut tx, lease).await {
            Ok(()) => {}
            Err(e @ BridgeError::Conflict(_)) => return Err(e),
            Err(e) if e.is_transient() => {
                self.record_retry(&mut tx, e.to_string()).await?;
            }
            Err(e) => {
                self.fail(&mut tx, e.to_string()).await?;
            }
        }

        Ok(ProcessOutcome::Processed { from, to: tx.status })
    }

    /// 上次失败后的退避是否已到期
    fn is_due(&self, tx: &BridgeTransaction) -> bool {
        if tx.retry_count == 0 {
            return true;
        }
        let delay = self.settings.retry.delay_after(tx.retry_count);
        let delay = Duration::from_std(delay).unwrap_or_else(|_| Duration::days(365));
        self.clock.now() >= tx.updated_at + delay
    }

    /// 按当前状态逐步推进，直到需要等待外部进展
    async fn advance(&self, tx: &mut BridgeTransaction, lease: &Lease) -> Result<(), BridgeError> {
        loop {
            let progressed = match tx.status {
                TransferStatus::Pending => self.start_lock(tx).await?,
                TransferStatus::Locking => self.submit_lock(tx, lease).await?,
                TransferStatus::Locked => self.poll_source_confirmations(tx, lease).await?,
                TransferStatus::Attesting => self.advance_attesting(tx).await?,
                TransferStatus::Releasing => self.drive_release(tx, lease).await?,
                TransferStatus::Completed | TransferStatus::Failed => false,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    /// pending → locking：先持久化再提交，保证取消与锁定互斥
    async fn start_lock(&self, tx: &mut BridgeTransaction) -> Result<bool, BridgeError> {
        self.commit(tx, "lock submission started", |next| {
            next.status = TransferStatus::Locking;
        })
        .await?;
        Ok(true)
    }

    async fn submit_lock(
        &self,
        tx: &mut BridgeTransaction,
        lease: &Lease,
    ) -> Result<bool, BridgeError> {
        let adapter = self.adapter(&tx.source_network)?;
        self.claim(tx, lease, "lock submission claimed").await?;
        let source_tx_ref = self
            .call_adapter(lease, &tx.source_network, "submit_lock", adapter.submit_lock(tx))
            .await?;

        let detail = format!("lock observed: {source_tx_ref}");
        self.commit(tx, &detail, |next| {
            next.source_tx_ref = Some(source_tx_ref);
            next.status = TransferStatus::Locked;
        })
        .await?;
        Ok(true)
    }

    async fn poll_source_confirmations(
        &self,
        tx: &mut BridgeTransaction,
        lease: &Lease,
    ) -> Result<bool, BridgeError> {
        let source_tx_ref = tx
            .source_tx_ref
            .clone()
            .ok_or_else(|| BridgeError::Terminal("locked transfer has no source reference".into()))?;
        let required = self.registry.get(&tx.source_network)?.required_confirmations;
        let adapter = self.adapter(&tx.source_network)?;
        let observed = self
            .call_adapter(
                lease,
                &tx.source_network,
                "get_confirmations",
                adapter.get_confirmations(&source_tx_ref),
            )
            .await?;

        if observed.saturating_add(self.settings.reorg_tolerance) < tx.confirmations {
            return Err(BridgeError::Reorg(format!(
                "confirmations for {source_tx_ref} regressed from {} to {observed}",
                tx.confirmations
            )));
        }

        // 容忍范围内的回退不降低已记录的确认数
        let confirmations = tx.confirmations.max(observed);
        if confirmations >= required {
            let detail = format!("{confirmations}/{required} confirmations, collecting attestations");
            self.commit(tx, &detail, |next| {
                next.confirmations = confirmations;
                next.status = TransferStatus::Attesting;
            })
            .await?;
            return Ok(true);
        }

        if confirmations > tx.confirmations {
            self.commit(tx, "confirmations increased", |next| {
                next.confirmations = confirmations;
            })
            .await?;
        }
        Ok(false)
    }

    /// attesting → releasing：在该交易的签名锁内判定法定人数
    pub async fn advance_attesting(&self, tx: &mut BridgeTransaction) -> Result<bool, BridgeError> {
        let lock = self.consensus.lock_for(tx.id);
        let _guard = lock.lock().await;

        // 签名是并发写入的，以存储为准
        *tx = self
            .store
            .get(tx.id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("transaction {}", tx.id)))?;
        if tx.status != TransferStatus::Attesting {
            return Ok(false);
        }

        let quorum = self.consensus.quorum_status(tx).await?;
        if quorum.reached {
            let detail = format!(
                "quorum reached: stake {}/{} from {} validators",
                quorum.attested_stake, quorum.total_active_stake, quorum.attester_count
            );
            self.commit(tx, &detail, |next| {
                next.status = TransferStatus::Releasing;
            })
            .await?;
            return Ok(true);
        }

        self.consensus.ensure_quorum_reachable().await?;
        Ok(false)
    }

    async fn drive_release(
        &self,
        tx: &mut BridgeTransaction,
        lease: &Lease,
    ) -> Result<bool, BridgeError> {
        let adapter = self.adapter(&tx.dest_network)?;

        let dest_tx_ref = match tx.dest_tx_ref.clone() {
            Some(existing) => existing,
            None => {
                self.claim(tx, lease, "release submission claimed").await?;
                let submitted = self
                    .call_adapter(
                        lease,
                        &tx.dest_network,
                        "submit_release",
                        adapter.submit_release(tx),
                    )
                    .await?;
                // 先记下引用，重启后只轮询不重复提交
                let recorded = submitted.clone();
                self.commit(tx, "release submitted", |next| {
                    next.dest_tx_ref = Some(recorded);
                })
                .await?;
                submitted
            }
        };

        let required = self.registry.get(&tx.dest_network)?.required_confirmations;
        let confirmations = self
            .call_adapter(
                lease,
                &tx.dest_network,
                "get_release_confirmations",
                adapter.get_release_confirmations(&dest_tx_ref),
            )
            .await?;
        if confirmations < required {
            return Ok(false);
        }

        let now = self.clock.now();
        let detail = format!("release confirmed: {dest_tx_ref}");
        self.commit(tx, &detail, |next| {
            next.status = TransferStatus::Completed;
            next.completed_at = Some(now);
        })
        .await?;

        if let Err(e) = self.consensus.record_completion(tx).await {
            tracing::error!(transaction_id = %tx.id, error = %e, "Failed to record validator completion");
        }
        self.consensus.forget(tx.id);
        Ok(true)
    }

    /// 记一次重试；超过上限则失败。返回交易是否仍可继续处理
    async fn record_retry(
        &self,
        tx: &mut BridgeTransaction,
        error: String,
    ) -> Result<bool, BridgeError> {
        let retry_count = tx.retry_count.saturating_add(1);
        metrics::inc_retry();

        if self.settings.retry.is_exhausted(retry_count) {
            let reason = format!("retries exhausted after {retry_count} attempts: {error}");
            self.commit(tx, &reason, |next| next.retry_count = retry_count)
                .await?;
            self.fail(tx, reason).await?;
            return Ok(false);
        }

        let message = error.clone();
        self.commit(tx, "retry scheduled", |next| {
            next.retry_count = retry_count;
            next.last_error = Some(message);
        })
        .await?;

        tracing::warn!(
            transaction_id = %tx.id,
            status = %tx.status,
            retry_count,
            next_retry_in_ms = self.settings.retry.delay_after(retry_count).as_millis() as u64,
            error = %error,
            "Transient failure, will retry"
        );
        Ok(true)
    }

    /// 进入 failed 并退回预留额度
    async fn fail(&self, tx: &mut BridgeTransaction, reason: String) -> Result<(), BridgeError> {
        let detail = reason.clone();
        self.commit(tx, &detail, |next| {
            next.status = TransferStatus::Failed;
            next.last_error = Some(reason);
        })
        .await?;

        self.volume.release(&tx.source_address, tx.id);
        self.consensus.forget(tx.id);
        Ok(())
    }

    /// 用户取消：只允许 pending
    pub async fn cancel(&self, transaction_id: Uuid) -> Result<BridgeTransaction, BridgeError> {
        let mut tx = self
            .store
            .get(transaction_id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("transaction {transaction_id}")))?;

        if tx.status != TransferStatus::Pending {
            return Err(BridgeError::Conflict(format!(
                "transaction {transaction_id} is {}, only pending transfers can be cancelled",
                tx.status
            )));
        }

        self.fail(&mut tx, "cancelled by user".into()).await?;
        Ok(tx)
    }

    /// 在副本上应用修改后 CAS 写入；成功才替换调用方持有的记录
    async fn commit<F>(
        &self,
        tx: &mut BridgeTransaction,
        detail: &str,
        update: F,
    ) -> Result<(), BridgeError>
    where
        F: FnOnce(&mut BridgeTransaction),
    {
        let from = tx.status;
        let mut next = tx.clone();
        update(&mut next);
        next.updated_at = self.clock.now();

        let advanced = next.status != from && next.status != TransferStatus::Failed;
        if advanced {
            next.retry_count = 0;
            next.last_error = None;
        }

        if !self.store.compare_and_swap(&mut next, from).await? {
            return Err(BridgeError::Conflict(format!(
                "transaction {} changed concurrently",
                tx.id
            )));
        }
        *tx = next;

        if tx.status != from {
            self.on_transition(tx, from, detail).await;
        }
        Ok(())
    }

    async fn on_transition(&self, tx: &BridgeTransaction, from: TransferStatus, detail: &str) {
        metrics::inc_transition(tx.status.as_str());
        if tx.status == TransferStatus::Failed {
            tracing::warn!(
                transaction_id = %tx.id,
                from = %from,
                to = %tx.status,
                detail = %detail,
                "Bridge transfer failed"
            );
        } else {
            tracing::info!(
                transaction_id = %tx.id,
                from = %from,
                to = %tx.status,
                detail = %detail,
                "Bridge transfer transitioned"
            );
        }

        let event = BridgeEvent {
            transaction_id: tx.id,
            status: tx.status,
            timestamp: tx.updated_at,
            detail: detail.to_string(),
        };
        if let Err(e) = self.events.publish(event).await {
            tracing::error!(transaction_id = %tx.id, error = ?e, "Failed to publish transition event");
        }
    }

    fn adapter(&self, network: &str) -> Result<Arc<dyn ChainAdapter>, BridgeError> {
        self.adapters
            .get(network)
            .ok_or_else(|| BridgeError::Terminal(format!("no chain adapter registered for {network}")))
    }

    /// 续租；租约已被接管或续租出错都按写入竞争处理，本轮放弃
    async fn ensure_lease(&self, lease: &Lease, operation: &str) -> Result<(), BridgeError> {
        match self.leases.renew(lease).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                metrics::inc_lease_lost();
                tracing::warn!(
                    transaction_id = %lease.transaction_id,
                    operation,
                    "Lease lost before adapter call, abandoning pass"
                );
                Err(BridgeError::Conflict(format!(
                    "lease on transaction {} lost before {operation}",
                    lease.transaction_id
                )))
            }
            Err(e) => Err(BridgeError::Conflict(format!(
                "lease renewal failed before {operation}: {e}"
            ))),
        }
    }

    /// 不改字段的 CAS 写入：版本号自增，持有的记录过期则本轮放弃
    async fn claim(
        &self,
        tx: &mut BridgeTransaction,
        lease: &Lease,
        detail: &str,
    ) -> Result<(), BridgeError> {
        self.ensure_lease(lease, detail).await?;
        self.commit(tx, detail, |_| {}).await
    }

    /// 适配器调用统一续租、加超时、计时和错误归类
    async fn call_adapter<T, F>(
        &self,
        lease: &Lease,
        network: &str,
        operation: &'static str,
        call: F,
    ) -> Result<T, BridgeError>
    where
        F: Future<Output = Result<T, AdapterError>>,
    {
        self.ensure_lease(lease, operation).await?;

        let started = Instant::now();
        let timeout = self.settings.adapter_timeout;
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(timeout.as_millis() as u64)),
        };
        metrics::observe_adapter_call(started.elapsed().as_millis(), result.is_ok());

        result.map_err(|e| {
            tracing::warn!(network = %network, operation, error = %e, "Chain adapter call failed");
            BridgeError::from(e)
        })
    }

    /// 推进所有到期的非终态交易（加急优先），返回实际处理的数量
    pub async fn poll_in_flight(&self) -> Result<usize, BridgeError> {
        let pending = self.store.list_non_terminal().await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let concurrency = self.settings.processing_concurrency.max(1);
        let outcomes: Vec<(Uuid, Result<ProcessOutcome, BridgeError>)> = stream::iter(pending)
            .map(|tx| async move { (tx.id, self.process(tx.id).await) })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut processed = 0;
        for (transaction_id, outcome) in outcomes {
            match outcome {
                Ok(ProcessOutcome::Processed { .. }) => processed += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(transaction_id = %transaction_id, error = %e, "Processing failed");
                }
            }
        }
        Ok(processed)
    }

    /// 轮询循环，直到 shutdown 变为 true
    pub async fn run(self: Arc<Self>, poll_interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = poll_interval.as_millis() as u64, "Bridge poll loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_in_flight().await {
                        tracing::error!(error = %e, "Poll cycle failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Bridge poll loop stopped");
    }
}
