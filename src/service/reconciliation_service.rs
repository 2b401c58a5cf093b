//! 对账调度
//! 固定间隔执行：卡住交易重新驱动、重试耗尽交易置为失败、按网络按时间桶重算统计、
//! 停用长期不活跃的验证者、归档过期终态记录

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::{
    domain::{Amount, BridgeError, BridgeTransaction, TransferStatus},
    metrics,
    repository::{NetworkStats, StatsRepository, TransactionStore},
    service::{
        bridge_state_machine::{BridgeStateMachine, ProcessOutcome, ProcessTrigger},
        consensus_manager::ConsensusManager,
        transaction_retry::RetryConfig,
    },
    utils::{
        time_utils::{duration_secs, format_duration, saturating_before},
        Clock,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationSettings {
    pub stuck_timeout_secs: u64,
    pub stats_bucket_secs: u64,
    pub stats_lookback_buckets: u32,
    pub validator_liveness_secs: u64,
    pub retention_days: u64,
}

/// 单次对账结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub stuck_retried: usize,
    pub failed: usize,
    pub buckets_written: usize,
    pub validators_expired: usize,
    pub archived: u64,
}

pub struct ReconciliationScheduler {
    engine: Arc<BridgeStateMachine>,
    store: Arc<dyn TransactionStore>,
    stats: Arc<dyn StatsRepository>,
    consensus: Arc<ConsensusManager>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    settings: ReconciliationSettings,
}

impl ReconciliationScheduler {
    pub fn new(
        engine: Arc<BridgeStateMachine>,
        store: Arc<dyn TransactionStore>,
        stats: Arc<dyn StatsRepository>,
        consensus: Arc<ConsensusManager>,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
        settings: ReconciliationSettings,
    ) -> Self {
        Self {
            engine,
            store,
            stats,
            consensus,
            clock,
            retry,
            settings,
        }
    }

    /// 执行一轮对账；各步骤互相独立，单步失败只记日志
    pub async fn run_once(&self) -> Result<ReconciliationReport, BridgeError> {
        let now = self.clock.now();
        let mut report = ReconciliationReport::default();

        let (retried, failed) = self.sweep_stuck(now).await?;
        report.stuck_retried = retried;
        report.failed = failed;

        match self.recompute_stats(now).await {
            Ok(written) => report.buckets_written = written,
            Err(e) => tracing::error!(error = %e, "Failed to recompute network statistics"),
        }

        match self.expire_idle_validators(now).await {
            Ok(expired) => report.validators_expired = expired,
            Err(e) => tracing::error!(error = %e, "Failed to expire inactive validators"),
        }

        let retention = duration_secs(self.settings.retention_days.saturating_mul(86_400));
        let cutoff = saturating_before(now, retention);
        match self.store.archive_terminal_before(cutoff).await {
            Ok(archived) => report.archived = archived,
            Err(e) => tracing::error!(error = %e, "Failed to archive terminal transfers"),
        }

        metrics::inc_reconcile_run();
        tracing::info!(
            stuck_retried = report.stuck_retried,
            failed = report.failed,
            buckets_written = report.buckets_written,
            validators_expired = report.validators_expired,
            archived = report.archived,
            "Reconciliation run completed"
        );
        Ok(report)
    }

    /// 返回 (重新驱动数, 置为失败数)
    async fn sweep_stuck(&self, now: DateTime<Utc>) -> Result<(usize, usize), BridgeError> {
        let stuck_after = duration_secs(self.settings.stuck_timeout_secs);
        let mut retried = 0;
        let mut failed = 0;

        for tx in self.store.list_non_terminal().await? {
            let trigger = if self.retry.is_exhausted(tx.retry_count) {
                ProcessTrigger::Exhausted
            } else if now - tx.updated_at > stuck_after {
                let idle_secs = (now - tx.updated_at).num_seconds().max(0) as u64;
                ProcessTrigger::Stuck(format!(
                    "stuck in {} for {}",
                    tx.status,
                    format_duration(idle_secs)
                ))
            } else {
                continue;
            };

            let stuck = matches!(trigger, ProcessTrigger::Stuck(_));
            match self.engine.process_with(tx.id, trigger).await {
                Ok(ProcessOutcome::Processed { to, .. }) => {
                    if to == TransferStatus::Failed {
                        failed += 1;
                    } else if stuck {
                        retried += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(transaction_id = %tx.id, error = %e, "Failed to reconcile transfer");
                }
            }
        }
        Ok((retried, failed))
    }

    /// 活跃窗口内没有任何需要签名的交易时不判定验证者失联
    async fn expire_idle_validators(&self, now: DateTime<Utc>) -> Result<usize, BridgeError> {
        let liveness = duration_secs(self.settings.validator_liveness_secs);
        let since = saturating_before(now, liveness);

        let recent = self.store.list_created_since(since).await?;
        let mut had_work = recent.iter().any(needed_attestation);
        if !had_work {
            had_work = self
                .store
                .list_non_terminal()
                .await?
                .iter()
                .any(|tx| tx.status == TransferStatus::Attesting);
        }
        if !had_work {
            tracing::debug!("No attestation work in liveness window, skipping validator expiry");
            return Ok(0);
        }

        Ok(self.consensus.expire_inactive(now, liveness).await?.len())
    }

    /// 重算回看窗口内每个源网络每个时间桶的统计
    async fn recompute_stats(&self, now: DateTime<Utc>) -> Result<usize, BridgeError> {
        let bucket_secs = i64::try_from(self.settings.stats_bucket_secs.max(1)).unwrap_or(i64::MAX);
        let current = bucket_start(now, bucket_secs);
        let lookback = self
            .settings
            .stats_bucket_secs
            .max(1)
            .saturating_mul(u64::from(self.settings.stats_lookback_buckets));
        let since = saturating_before(current, duration_secs(lookback));

        let transactions = self.store.list_created_since(since).await?;
        let buckets = aggregate(&transactions, bucket_secs, now);
        for stats in buckets.values() {
            self.stats.upsert_bucket(stats).await?;
        }
        Ok(buckets.len())
    }

    /// 对账循环，直到 shutdown 变为 true
    pub async fn run(self: Arc<Self>, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = interval.as_secs(), "Reconciliation scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "Reconciliation run failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Reconciliation scheduler stopped");
    }
}

/// 进入过签名阶段的交易
fn needed_attestation(tx: &BridgeTransaction) -> bool {
    !tx.attestations.is_empty()
        || matches!(
            tx.status,
            TransferStatus::Attesting | TransferStatus::Releasing | TransferStatus::Completed
        )
}

fn bucket_start(at: DateTime<Utc>, bucket_secs: i64) -> DateTime<Utc> {
    let ts = at.timestamp();
    let floored = ts - ts.rem_euclid(bucket_secs);
    Utc.timestamp_opt(floored, 0).single().unwrap_or(at)
}

fn aggregate(
    transactions: &[BridgeTransaction],
    bucket_secs: i64,
    now: DateTime<Utc>,
) -> BTreeMap<(String, DateTime<Utc>), NetworkStats> {
    let mut buckets: BTreeMap<(String, DateTime<Utc>), NetworkStats> = BTreeMap::new();

    for tx in transactions {
        let start = bucket_start(tx.created_at, bucket_secs);
        let entry = buckets
            .entry((tx.source_network.clone(), start))
            .or_insert_with(|| NetworkStats {
                network: tx.source_network.clone(),
                bucket_start: start,
                transfer_count: 0,
                volume: 0,
                completed_count: 0,
                failed_count: 0,
                success_rate_bps: 0,
                updated_at: now,
            });

        entry.transfer_count += 1;
        entry.volume = entry.volume.saturating_add(tx.amount);
        match tx.status {
            TransferStatus::Completed => entry.completed_count += 1,
            TransferStatus::Failed => entry.failed_count += 1,
            _ => {}
        }
    }

    for stats in buckets.values_mut() {
        let settled = stats.completed_count + stats.failed_count;
        if settled > 0 {
            stats.success_rate_bps = (Amount::from(stats.completed_count) * 10_000
                / Amount::from(settled)) as u32;
        }
    }
    buckets
}
