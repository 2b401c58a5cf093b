// 跨链转账存储：状态的唯一事实来源
// 所有状态写入走 compare_and_swap，避免主处理路径与对账调度互相覆盖

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use crate::domain::{Amount, Attestation, BridgeError, BridgeTransaction, TransferStatus};

/// 准入时在存储层复核的滚动额度：统计 created_at > since 且未失败的记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeCap {
    pub daily_limit: Amount,
    /// 0 表示不限制
    pub global_daily_limit: Amount,
    pub since: DateTime<Utc>,
}

impl VolumeCap {
    fn check(
        &self,
        tx: &BridgeTransaction,
        address_total: Amount,
        global_total: Amount,
    ) -> Result<(), BridgeError> {
        if address_total.saturating_add(tx.amount) > self.daily_limit {
            return Err(BridgeError::RateLimit(format!(
                "daily limit {} exceeded for {}: window {address_total} + amount {}",
                self.daily_limit, tx.source_address, tx.amount
            )));
        }
        if self.global_daily_limit > 0
            && global_total.saturating_add(tx.amount) > self.global_daily_limit
        {
            return Err(BridgeError::RateLimit(format!(
                "global daily limit {} exceeded: window {global_total} + amount {}",
                self.global_daily_limit, tx.amount
            )));
        }
        Ok(())
    }
}

// ============ Repository Trait ============

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// 新建记录；id 已存在时返回 Conflict
    async fn insert(&self, tx: &BridgeTransaction) -> Result<(), BridgeError>;

    /// 与 insert 相同，但在同一临界区内先按已持久化记录复核滚动额度。
    /// 多个进程共享同一存储时，额度以此为准
    async fn insert_within_cap(
        &self,
        tx: &BridgeTransaction,
        cap: &VolumeCap,
    ) -> Result<(), BridgeError>;

    /// 按 id 查询（包括已归档记录）
    async fn get(&self, id: Uuid) -> Result<Option<BridgeTransaction>, BridgeError>;

    /// 当存储中的 status == expected 且写入版本号与 tx.revision 一致时写入 tx 的可变字段。
    /// 终态记录永不修改。成功时 tx.revision 自增；竞争失败返回 Ok(false)
    async fn compare_and_swap(
        &self,
        tx: &mut BridgeTransaction,
        expected: TransferStatus,
    ) -> Result<bool, BridgeError>;

    /// 所有未到终态的记录（加急优先，其次按创建时间）
    async fn list_non_terminal(&self) -> Result<Vec<BridgeTransaction>, BridgeError>;

    async fn list_created_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<BridgeTransaction>, BridgeError>;

    /// 把 updated_at 早于 cutoff 的终态记录移入归档，返回数量
    async fn archive_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, BridgeError>;
}

/// 状态只能按状态机前进；同状态写入用于记录确认数/引用/重试信息
fn check_transition(expected: TransferStatus, next: TransferStatus) -> Result<(), BridgeError> {
    if expected == next || expected.can_transition_to(next) {
        Ok(())
    } else {
        Err(BridgeError::Conflict(format!(
            "illegal transition {expected} -> {next}"
        )))
    }
}

fn sort_for_processing(txs: &mut [BridgeTransaction]) {
    txs.sort_by(|a, b| {
        b.express
            .cmp(&a.express)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

// ============ 内存实现 ============

#[derive(Default)]
pub struct InMemoryTransactionStore {
    live: RwLock<HashMap<Uuid, BridgeTransaction>>,
    archived: RwLock<HashMap<Uuid, BridgeTransaction>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, tx: &BridgeTransaction) -> Result<(), BridgeError> {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        if live.contains_key(&tx.id) {
            return Err(BridgeError::Conflict(format!("transaction {} already exists", tx.id)));
        }
        live.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn insert_within_cap(
        &self,
        tx: &BridgeTransaction,
        cap: &VolumeCap,
    ) -> Result<(), BridgeError> {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        if live.contains_key(&tx.id) {
            return Err(BridgeError::Conflict(format!("transaction {} already exists", tx.id)));
        }

        let mut address_total: Amount = 0;
        let mut global_total: Amount = 0;
        for existing in live.values() {
            if existing.status == TransferStatus::Failed || existing.created_at <= cap.since {
                continue;
            }
            global_total = global_total.saturating_add(existing.amount);
            if existing.source_address == tx.source_address {
                address_total = address_total.saturating_add(existing.amount);
            }
        }
        cap.check(tx, address_total, global_total)?;

        live.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<BridgeTransaction>, BridgeError> {
        if let Some(tx) = self
            .live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            return Ok(Some(tx.clone()));
        }
        Ok(self
            .archived
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }

    async fn compare_and_swap(
        &self,
        tx: &mut BridgeTransaction,
        expected: TransferStatus,
    ) -> Result<bool, BridgeError> {
        check_transition(expected, tx.status)?;

        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        let Some(stored) = live.get_mut(&tx.id) else {
            return Err(BridgeError::NotFound(format!("transaction {}", tx.id)));
        };

        if stored.status.is_terminal()
            || stored.status != expected
            || stored.revision != tx.revision
        {
            return Ok(false);
        }

        // 不可变字段（金额、手续费、地址、网络、创建时间）保持存储中的值
        stored.status = tx.status;
        stored.source_tx_ref = tx.source_tx_ref.clone();
        stored.dest_tx_ref = tx.dest_tx_ref.clone();
        stored.confirmations = tx.confirmations;
        stored.attestations = tx.attestations.clone();
        stored.retry_count = tx.retry_count;
        stored.updated_at = tx.updated_at;
        stored.completed_at = tx.completed_at;
        stored.last_error = tx.last_error.clone();
        stored.revision += 1;

        tx.revision = stored.revision;
        Ok(true)
    }

    async fn list_non_terminal(&self) -> Result<Vec<BridgeTransaction>, BridgeError> {
        let mut txs: Vec<BridgeTransaction> = self
            .live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|tx| !tx.is_terminal())
            .cloned()
            .collect();
        sort_for_processing(&mut txs);
        Ok(txs)
    }

    async fn list_created_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<BridgeTransaction>, BridgeError> {
        let mut txs: Vec<BridgeTransaction> = self
            .live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|tx| tx.created_at >= since)
            .cloned()
            .collect();
        txs.sort_by_key(|tx| tx.created_at);
        Ok(txs)
    }

    async fn archive_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, BridgeError> {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<Uuid> = live
            .values()
            .filter(|tx| tx.is_terminal() && tx.updated_at < cutoff)
            .map(|tx| tx.id)
            .collect();

        let mut archived = self.archived.write().unwrap_or_else(PoisonError::into_inner);
        for id in &expired {
            if let Some(tx) = live.remove(id) {
                archived.insert(*id, tx);
            }
        }
        Ok(expired.len() as u64)
    }
}

// ============ PostgreSQL 实现 ============

const SELECT_COLUMNS: &str = "id, source_network, dest_network, source_address, dest_address, \
     amount::TEXT AS amount, fee_amount::TEXT AS fee_amount, express, status, \
     source_tx_ref, dest_tx_ref, confirmations, attestations, retry_count, \
     created_at, updated_at, completed_at, last_error, revision";

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    source_network: String,
    dest_network: String,
    source_address: String,
    dest_address: String,
    amount: String,
    fee_amount: String,
    express: bool,
    status: String,
    source_tx_ref: Option<String>,
    dest_tx_ref: Option<String>,
    confirmations: i64,
    attestations: Json<Vec<Attestation>>,
    retry_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    revision: i64,
}

fn parse_amount(column: &str, raw: &str) -> Result<Amount, BridgeError> {
    raw.parse::<Amount>()
        .map_err(|_| BridgeError::Storage(format!("corrupt {column} value '{raw}'")))
}

impl TryFrom<TransactionRow> for BridgeTransaction {
    type Error = BridgeError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            source_network: row.source_network,
            dest_network: row.dest_network,
            source_address: row.source_address,
            dest_address: row.dest_address,
            amount: parse_amount("amount", &row.amount)?,
            fee_amount: parse_amount("fee_amount", &row.fee_amount)?,
            express: row.express,
            status: row.status.parse().map_err(BridgeError::Storage)?,
            source_tx_ref: row.source_tx_ref,
            dest_tx_ref: row.dest_tx_ref,
            confirmations: row.confirmations.max(0) as u64,
            attestations: row.attestations.0,
            retry_count: row.retry_count.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            last_error: row.last_error,
            revision: row.revision.max(0) as u64,
        })
    }
}

fn rows_into(rows: Vec<TransactionRow>) -> Result<Vec<BridgeTransaction>, BridgeError> {
    rows.into_iter().map(BridgeTransaction::try_from).collect()
}

async fn insert_row<'e, E>(executor: E, tx: &BridgeTransaction) -> Result<(), BridgeError>
where
    E: sqlx::PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO bridge_transactions (
            id, source_network, dest_network, source_address, dest_address,
            amount, fee_amount, express, status, source_tx_ref, dest_tx_ref,
            confirmations, attestations, retry_count,
            created_at, updated_at, completed_at, last_error, revision
        ) VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, $7::NUMERIC, $8, $9, $10, $11,
                  $12, $13, $14, $15, $16, $17, $18, $19)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(tx.id)
    .bind(&tx.source_network)
    .bind(&tx.dest_network)
    .bind(&tx.source_address)
    .bind(&tx.dest_address)
    .bind(tx.amount.to_string())
    .bind(tx.fee_amount.to_string())
    .bind(tx.express)
    .bind(tx.status.as_str())
    .bind(&tx.source_tx_ref)
    .bind(&tx.dest_tx_ref)
    .bind(tx.confirmations as i64)
    .bind(Json(&tx.attestations))
    .bind(tx.retry_count as i32)
    .bind(tx.created_at)
    .bind(tx.updated_at)
    .bind(tx.completed_at)
    .bind(&tx.last_error)
    .bind(tx.revision as i64)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(BridgeError::Conflict(format!("transaction {} already exists", tx.id)));
    }
    Ok(())
}

// 全局额度的 advisory lock 键
const GLOBAL_VOLUME_LOCK_KEY: i64 = 0x6272_6964_6765;

pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn insert(&self, tx: &BridgeTransaction) -> Result<(), BridgeError> {
        insert_row(&self.pool, tx).await
    }

    async fn insert_within_cap(
        &self,
        tx: &BridgeTransaction,
        cap: &VolumeCap,
    ) -> Result<(), BridgeError> {
        let mut db_tx = self.pool.begin().await?;

        // 同一源地址的准入串行化；全局额度的锁总是后取，避免死锁
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&tx.source_address)
            .execute(&mut *db_tx)
            .await?;
        if cap.global_daily_limit > 0 {
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(GLOBAL_VOLUME_LOCK_KEY)
                .execute(&mut *db_tx)
                .await?;
        }

        let address_total: String = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)::TEXT FROM bridge_transactions
            WHERE source_address = $1 AND status <> 'failed' AND created_at > $2
            "#,
        )
        .bind(&tx.source_address)
        .bind(cap.since)
        .fetch_one(&mut *db_tx)
        .await?;

        let global_total = if cap.global_daily_limit > 0 {
            let total: String = sqlx::query_scalar(
                r#"
                SELECT COALESCE(SUM(amount), 0)::TEXT FROM bridge_transactions
                WHERE status <> 'failed' AND created_at > $1
                "#,
            )
            .bind(cap.since)
            .fetch_one(&mut *db_tx)
            .await?;
            parse_amount("window volume", &total)?
        } else {
            0
        };

        cap.check(tx, parse_amount("window volume", &address_total)?, global_total)?;
        insert_row(&mut *db_tx, tx).await?;
        db_tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<BridgeTransaction>, BridgeError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM bridge_transactions WHERE id = $1
             UNION ALL
             SELECT {SELECT_COLUMNS} FROM bridge_transactions_archive WHERE id = $1
             LIMIT 1"
        );
        let row = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(BridgeTransaction::try_from).transpose()
    }

    async fn compare_and_swap(
        &self,
        tx: &mut BridgeTransaction,
        expected: TransferStatus,
    ) -> Result<bool, BridgeError> {
        check_transition(expected, tx.status)?;

        let result = sqlx::query(
            r#"
            UPDATE bridge_transactions
            SET status = $2, source_tx_ref = $3, dest_tx_ref = $4, confirmations = $5,
                attestations = $6, retry_count = $7, updated_at = $8, completed_at = $9,
                last_error = $10, revision = revision + 1
            WHERE id = $1 AND status = $11 AND revision = $12
              AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(tx.id)
        .bind(tx.status.as_str())
        .bind(&tx.source_tx_ref)
        .bind(&tx.dest_tx_ref)
        .bind(tx.confirmations as i64)
        .bind(Json(&tx.attestations))
        .bind(tx.retry_count as i32)
        .bind(tx.updated_at)
        .bind(tx.completed_at)
        .bind(&tx.last_error)
        .bind(expected.as_str())
        .bind(tx.revision as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            tx.revision += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn list_non_terminal(&self) -> Result<Vec<BridgeTransaction>, BridgeError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM bridge_transactions
             WHERE status NOT IN ('completed', 'failed')
             ORDER BY express DESC, created_at ASC"
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows_into(rows)
    }

    async fn list_created_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<BridgeTransaction>, BridgeError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM bridge_transactions
             WHERE created_at >= $1
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows_into(rows)
    }

    async fn archive_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, BridgeError> {
        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM bridge_transactions
                WHERE status IN ('completed', 'failed') AND updated_at < $1
                RETURNING *
            )
            INSERT INTO bridge_transactions_archive SELECT * FROM moved
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
