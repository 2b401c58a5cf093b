// 验证者注册表存储（需跨重启保留）

use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::domain::{BridgeError, Validator};

#[async_trait]
pub trait ValidatorRepository: Send + Sync {
    async fn upsert(&self, validator: &Validator) -> Result<(), BridgeError>;
    async fn get(&self, address: &str) -> Result<Option<Validator>, BridgeError>;
    async fn list(&self) -> Result<Vec<Validator>, BridgeError>;
}

// ============ 内存实现 ============

#[derive(Default)]
pub struct InMemoryValidatorRepository {
    validators: RwLock<BTreeMap<String, Validator>>,
}

impl InMemoryValidatorRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ValidatorRepository for InMemoryValidatorRepository {
    async fn upsert(&self, validator: &Validator) -> Result<(), BridgeError> {
        self.validators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(validator.address.clone(), validator.clone());
        Ok(())
    }

    async fn get(&self, address: &str) -> Result<Option<Validator>, BridgeError> {
        Ok(self
            .validators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Validator>, BridgeError> {
        Ok(self
            .validators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }
}

// ============ PostgreSQL 实现 ============

#[derive(Debug, sqlx::FromRow)]
struct ValidatorRow {
    address: String,
    network: String,
    stake: String,
    active: bool,
    reputation: i64,
    total_attestations: i64,
    successful_attestations: i64,
    last_seen_at: DateTime<Utc>,
}

impl TryFrom<ValidatorRow> for Validator {
    type Error = BridgeError;

    fn try_from(row: ValidatorRow) -> Result<Self, Self::Error> {
        let stake = row
            .stake
            .parse()
            .map_err(|_| BridgeError::Storage(format!("corrupt stake value '{}'", row.stake)))?;
        Ok(Self {
            address: row.address,
            network: row.network,
            stake,
            active: row.active,
            reputation: row.reputation,
            total_attestations: row.total_attestations.max(0) as u64,
            successful_attestations: row.successful_attestations.max(0) as u64,
            last_seen_at: row.last_seen_at,
        })
    }
}

const SELECT_COLUMNS: &str = "address, network, stake::TEXT AS stake, active, reputation, \
     total_attestations, successful_attestations, last_seen_at";

pub struct PgValidatorRepository {
    pool: PgPool,
}

impl PgValidatorRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ValidatorRepository for PgValidatorRepository {
    async fn upsert(&self, validator: &Validator) -> Result<(), BridgeError> {
        sqlx::query(
            r#"
            INSERT INTO bridge_validators (
                address, network, stake, active, reputation,
                total_attestations, successful_attestations, last_seen_at
            ) VALUES ($1, $2, $3::NUMERIC, $4, $5, $6, $7, $8)
            ON CONFLICT (address) DO UPDATE SET
                network = EXCLUDED.network,
                stake = EXCLUDED.stake,
                active = EXCLUDED.active,
                reputation = EXCLUDED.reputation,
                total_attestations = EXCLUDED.total_attestations,
                successful_attestations = EXCLUDED.successful_attestations,
                last_seen_at = EXCLUDED.last_seen_at
            "#,
        )
        .bind(&validator.address)
        .bind(&validator.network)
        .bind(validator.stake.to_string())
        .bind(validator.active)
        .bind(validator.reputation)
        .bind(validator.total_attestations as i64)
        .bind(validator.successful_attestations as i64)
        .bind(validator.last_seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, address: &str) -> Result<Option<Validator>, BridgeError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM bridge_validators WHERE address = $1");
        sqlx::query_as::<_, ValidatorRow>(&sql)
            .bind(address)
            .fetch_optional(&self.pool)
            .await?
            .map(Validator::try_from)
            .transpose()
    }

    async fn list(&self) -> Result<Vec<Validator>, BridgeError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM bridge_validators ORDER BY address");
        sqlx::query_as::<_, ValidatorRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Validator::try_from)
            .collect()
    }
}
