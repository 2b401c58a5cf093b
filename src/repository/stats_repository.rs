// 按网络、按时间桶的滚动统计

use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use utoipa::ToSchema;

use crate::domain::{amount_serde, Amount, BridgeError};

/// 单个网络单个时间桶的聚合
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub network: String,
    pub bucket_start: DateTime<Utc>,
    pub transfer_count: u64,
    #[serde(with = "amount_serde")]
    #[schema(value_type = String)]
    pub volume: Amount,
    pub completed_count: u64,
    pub failed_count: u64,
    /// 已完成 / (已完成 + 失败)，单位基点；无终态记录时为 0
    pub success_rate_bps: u32,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait StatsRepository: Send + Sync {
    async fn upsert_bucket(&self, stats: &NetworkStats) -> Result<(), BridgeError>;

    /// bucket_start >= since 的记录，按网络、时间排序
    async fn list(&self, since: DateTime<Utc>) -> Result<Vec<NetworkStats>, BridgeError>;
}

// ============ 内存实现 ============

#[derive(Default)]
pub struct InMemoryStatsRepository {
    buckets: RwLock<BTreeMap<(String, DateTime<Utc>), NetworkStats>>,
}

impl InMemoryStatsRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatsRepository for InMemoryStatsRepository {
    async fn upsert_bucket(&self, stats: &NetworkStats) -> Result<(), BridgeError> {
        self.buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((stats.network.clone(), stats.bucket_start), stats.clone());
        Ok(())
    }

    async fn list(&self, since: DateTime<Utc>) -> Result<Vec<NetworkStats>, BridgeError> {
        Ok(self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.bucket_start >= since)
            .cloned()
            .collect())
    }
}

// ============ PostgreSQL 实现 ============

#[derive(Debug, sqlx::FromRow)]
struct StatsRow {
    network: String,
    bucket_start: DateTime<Utc>,
    transfer_count: i64,
    volume: String,
    completed_count: i64,
    failed_count: i64,
    success_rate_bps: i32,
    updated_at: DateTime<Utc>,
}

pub struct PgStatsRepository {
    pool: PgPool,
}

impl PgStatsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatsRepository for PgStatsRepository {
    async fn upsert_bucket(&self, stats: &NetworkStats) -> Result<(), BridgeError> {
        sqlx::query(
            r#"
            INSERT INTO bridge_network_stats (
                network, bucket_start, transfer_count, volume,
                completed_count, failed_count, success_rate_bps, updated_at
            ) VALUES ($1, $2, $3, $4::NUMERIC, $5, $6, $7, $8)
            ON CONFLICT (network, bucket_start) DO UPDATE SET
                transfer_count = EXCLUDED.transfer_count,
                volume = EXCLUDED.volume,
                completed_count = EXCLUDED.completed_count,
                failed_count = EXCLUDED.failed_count,
                success_rate_bps = EXCLUDED.success_rate_bps,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&stats.network)
        .bind(stats.bucket_start)
        .bind(stats.transfer_count as i64)
        .bind(stats.volume.to_string())
        .bind(stats.completed_count as i64)
        .bind(stats.failed_count as i64)
        .bind(stats.success_rate_bps as i32)
        .bind(stats.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, since: DateTime<Utc>) -> Result<Vec<NetworkStats>, BridgeError> {
        let rows = sqlx::query_as::<_, StatsRow>(
            "SELECT network, bucket_start, transfer_count, volume::TEXT AS volume,
                    completed_count, failed_count, success_rate_bps, updated_at
             FROM bridge_network_stats
             WHERE bucket_start >= $1
             ORDER BY network, bucket_start",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let volume = row.volume.parse().map_err(|_| {
                    BridgeError::Storage(format!("corrupt volume value '{}'", row.volume))
                })?;
                Ok(NetworkStats {
                    network: row.network,
                    bucket_start: row.bucket_start,
                    transfer_count: row.transfer_count.max(0) as u64,
                    volume,
                    completed_count: row.completed_count.max(0) as u64,
                    failed_count: row.failed_count.max(0) as u64,
                    success_rate_bps: row.success_rate_bps.max(0) as u32,
                    updated_at: row.updated_at,
                })
            })
            .collect()
    }
}
