//! 验证者共识管理
//! 按质押权重判定法定人数：参与验证者数 >= quorumCount 且其质押 >= 阈值% × 活跃总质押
//! 同一交易的签名写入由每笔交易一把锁串行化，不同交易之间互不阻塞

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    domain::{amount_serde, Amount, Attestation, BridgeError, BridgeTransaction, TransferStatus, Validator},
    metrics,
    repository::{TransactionStore, ValidatorRepository},
    utils::{time_utils::saturating_before, Clock},
};

const ATTESTATION_DOMAIN: &str = "ironbridge-attestation:v1";

// 与其他写入者竞争 CAS 时的重读次数
const CAS_ATTEMPTS: usize = 5;

// ============ 签名 ============

/// 验证者签名的消息摘要
pub fn attestation_message(tx: &BridgeTransaction) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(ATTESTATION_DOMAIN.as_bytes());
    for field in [
        tx.id.to_string(),
        tx.source_tx_ref.clone().unwrap_or_default(),
        tx.dest_network.clone(),
        tx.dest_address.clone(),
        tx.amount.to_string(),
    ] {
        hasher.update(b"|");
        hasher.update(field.as_bytes());
    }
    hasher.finalize().into()
}

/// 验证者地址（hex 或 base58）解码为 ed25519 公钥
pub fn decode_public_key(address: &str) -> Option<VerifyingKey> {
    let bytes = if address.len() == 64 && address.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(address).ok()?
    } else {
        bs58::decode(address).into_vec().ok()?
    };
    let key: [u8; 32] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&key).ok()
}

/// 验证者侧签名（运维工具与测试使用）
pub fn sign_attestation(signing_key: &SigningKey, tx: &BridgeTransaction) -> String {
    hex::encode(signing_key.sign(&attestation_message(tx)).to_bytes())
}

pub trait AttestationVerifier: Send + Sync {
    fn verify(&self, validator: &Validator, tx: &BridgeTransaction, signature: &str) -> bool;

    /// 注册时检查地址能否作为公钥
    fn is_valid_key(&self, address: &str) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519AttestationVerifier;

impl AttestationVerifier for Ed25519AttestationVerifier {
    fn verify(&self, validator: &Validator, tx: &BridgeTransaction, signature: &str) -> bool {
        let Some(key) = decode_public_key(&validator.address) else {
            return false;
        };
        let Ok(raw) = hex::decode(signature.trim_start_matches("0x")) else {
            return false;
        };
        let Ok(raw): Result<[u8; 64], _> = raw.try_into() else {
            return false;
        };
        key.verify_strict(&attestation_message(tx), &Signature::from_bytes(&raw))
            .is_ok()
    }

    fn is_valid_key(&self, address: &str) -> bool {
        decode_public_key(address).is_some()
    }
}

// ============ 结果类型 ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuorumStatus {
    #[serde(with = "amount_serde")]
    #[schema(value_type = String)]
    pub attested_stake: Amount,
    #[serde(with = "amount_serde")]
    #[schema(value_type = String)]
    pub total_active_stake: Amount,
    pub attester_count: usize,
    pub reached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum RejectionReason {
    UnknownValidator,
    InactiveValidator,
    DuplicateAttestation,
    NotAttesting { status: TransferStatus },
    InvalidSignature,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownValidator => f.write_str("validator is not registered"),
            Self::InactiveValidator => f.write_str("validator is not active"),
            Self::DuplicateAttestation => f.write_str("validator already attested this transaction"),
            Self::NotAttesting { status } => {
                write!(f, "transaction is {status}, not attesting")
            }
            Self::InvalidSignature => f.write_str("signature does not verify"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestationOutcome {
    Accepted(QuorumStatus),
    Rejected(RejectionReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusSettings {
    pub quorum_count: usize,
    pub threshold_percent: u32,
    pub min_active_stake: Amount,
    pub reputation_baseline: i64,
    pub reputation_floor: i64,
    pub slash_reputation_penalty: i64,
}

/// 质押加权法定人数判定；已签名但随后被停用的验证者仍按当前质押计入
pub fn evaluate_quorum(
    attestations: &[Attestation],
    validators: &[Validator],
    quorum_count: usize,
    threshold_percent: u32,
) -> QuorumStatus {
    let by_address: HashMap<&str, &Validator> =
        validators.iter().map(|v| (v.address.as_str(), v)).collect();

    let total_active_stake: Amount = validators
        .iter()
        .filter(|v| v.active)
        .map(|v| v.stake)
        .fold(0, Amount::saturating_add);

    // 只统计能解析到已注册验证者的签名
    let attesters: Vec<&Validator> = attestations
        .iter()
        .filter_map(|a| by_address.get(a.validator_id.as_str()).copied())
        .collect();
    let attested_stake: Amount = attesters
        .iter()
        .map(|v| v.stake)
        .fold(0, Amount::saturating_add);

    let attester_count = attesters.len();
    let reached = attester_count >= quorum_count
        && total_active_stake > 0
        && attested_stake.saturating_mul(100)
            >= total_active_stake.saturating_mul(Amount::from(threshold_percent));

    QuorumStatus {
        attested_stake,
        total_active_stake,
        attester_count,
        reached,
    }
}

// ============ 共识管理器 ============

pub struct ConsensusManager {
    validators: Arc<dyn ValidatorRepository>,
    store: Arc<dyn TransactionStore>,
    verifier: Arc<dyn AttestationVerifier>,
    clock: Arc<dyn Clock>,
    settings: ConsensusSettings,
    tx_locks: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    // 验证者记录的读改写
    validator_writes: Mutex<()>,
}

impl ConsensusManager {
    pub fn new(
        validators: Arc<dyn ValidatorRepository>,
        store: Arc<dyn TransactionStore>,
        verifier: Arc<dyn AttestationVerifier>,
        clock: Arc<dyn Clock>,
        settings: ConsensusSettings,
    ) -> Self {
        Self {
            validators,
            store,
            verifier,
            clock,
            settings,
            tx_locks: StdMutex::new(HashMap::new()),
            validator_writes: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> ConsensusSettings {
        self.settings
    }

    /// 每笔交易的签名锁
    pub(crate) fn lock_for(&self, transaction_id: Uuid) -> Arc<Mutex<()>> {
        self.tx_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(transaction_id)
            .or_default()
            .clone()
    }

    /// 交易到达终态后释放签名锁
    pub(crate) fn forget(&self, transaction_id: Uuid) {
        self.tx_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&transaction_id);
    }

    pub async fn register_validator(
        &self,
        address: &str,
        network: &str,
        stake: Amount,
    ) -> Result<Validator, BridgeError> {
        if !self.verifier.is_valid_key(address) {
            return Err(BridgeError::Validation(format!(
                "validator address '{address}' is not a valid ed25519 public key"
            )));
        }

        let _guard = self.validator_writes.lock().await;
        if self.validators.get(address).await?.is_some() {
            return Err(BridgeError::Conflict(format!(
                "validator '{address}' is already registered"
            )));
        }

        let validator = Validator::new(
            address,
            network,
            stake,
            self.settings.reputation_baseline,
            self.clock.now(),
        );
        self.validators.upsert(&validator).await?;
        tracing::info!(validator_id = %address, network = %network, stake = %stake, "Validator registered");
        Ok(validator)
    }

    pub async fn list_validators(&self) -> Result<Vec<Validator>, BridgeError> {
        self.validators.list().await
    }

    pub async fn submit_attestation(
        &self,
        transaction_id: Uuid,
        validator_id: &str,
        signature: &str,
    ) -> Result<AttestationOutcome, BridgeError> {
        let outcome = self
            .try_submit_attestation(transaction_id, validator_id, signature)
            .await?;

        match &outcome {
            AttestationOutcome::Accepted(quorum) => {
                metrics::inc_attestation(true);
                tracing::info!(
                    transaction_id = %transaction_id,
                    validator_id = %validator_id,
                    attested_stake = %quorum.attested_stake,
                    total_active_stake = %quorum.total_active_stake,
                    quorum_reached = quorum.reached,
                    "Attestation accepted"
                );
            }
            AttestationOutcome::Rejected(reason) => {
                metrics::inc_attestation(false);
                tracing::warn!(
                    transaction_id = %transaction_id,
                    validator_id = %validator_id,
                    reason = %reason,
                    "Attestation rejected"
                );
            }
        }
        Ok(outcome)
    }

    async fn try_submit_attestation(
        &self,
        transaction_id: Uuid,
        validator_id: &str,
        signature: &str,
    ) -> Result<AttestationOutcome, BridgeError> {
        let Some(validator) = self.validators.get(validator_id).await? else {
            return Ok(AttestationOutcome::Rejected(RejectionReason::UnknownValidator));
        };
        if !validator.active {
            return Ok(AttestationOutcome::Rejected(RejectionReason::InactiveValidator));
        }

        let lock = self.lock_for(transaction_id);
        let _guard = lock.lock().await;

        for _ in 0..CAS_ATTEMPTS {
            let mut tx = self
                .store
                .get(transaction_id)
                .await?
                .ok_or_else(|| BridgeError::NotFound(format!("transaction {transaction_id}")))?;

            if tx.status != TransferStatus::Attesting {
                return Ok(AttestationOutcome::Rejected(RejectionReason::NotAttesting {
                    status: tx.status,
                }));
            }
            if tx.has_attestation_from(validator_id) {
                return Ok(AttestationOutcome::Rejected(
                    RejectionReason::DuplicateAttestation,
                ));
            }
            if !self.verifier.verify(&validator, &tx, signature) {
                return Ok(AttestationOutcome::Rejected(RejectionReason::InvalidSignature));
            }

            let now = self.clock.now();
            tx.attestations.push(Attestation {
                validator_id: validator_id.to_string(),
                signature: signature.to_string(),
                timestamp: now,
            });
            tx.updated_at = now;

            if self
                .store
                .compare_and_swap(&mut tx, TransferStatus::Attesting)
                .await?
            {
                self.touch_validator(validator_id, now).await?;
                let quorum = self.quorum_status(&tx).await?;
                return Ok(AttestationOutcome::Accepted(quorum));
            }
        }

        Err(BridgeError::Conflict(format!(
            "attestation for {transaction_id} lost {CAS_ATTEMPTS} consecutive write races"
        )))
    }

    async fn touch_validator(&self, address: &str, now: DateTime<Utc>) -> Result<(), BridgeError> {
        let _guard = self.validator_writes.lock().await;
        if let Some(mut validator) = self.validators.get(address).await? {
            validator.total_attestations += 1;
            validator.last_seen_at = now;
            self.validators.upsert(&validator).await?;
        }
        Ok(())
    }

    pub async fn quorum_status(&self, tx: &BridgeTransaction) -> Result<QuorumStatus, BridgeError> {
        let validators = self.validators.list().await?;
        Ok(evaluate_quorum(
            &tx.attestations,
            &validators,
            self.settings.quorum_count,
            self.settings.threshold_percent,
        ))
    }

    pub async fn has_quorum(&self, transaction_id: Uuid) -> Result<bool, BridgeError> {
        let tx = self
            .store
            .get(transaction_id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("transaction {transaction_id}")))?;
        Ok(self.quorum_status(&tx).await?.reached)
    }

    /// 活跃验证者数量或质押不足时，任何交易都无法达到法定人数
    pub async fn ensure_quorum_reachable(&self) -> Result<(), BridgeError> {
        let validators = self.validators.list().await?;
        let active: Vec<&Validator> = validators.iter().filter(|v| v.active).collect();
        let active_stake: Amount = active
            .iter()
            .map(|v| v.stake)
            .fold(0, Amount::saturating_add);

        if active.len() < self.settings.quorum_count {
            return Err(BridgeError::Consensus(format!(
                "{} active validators, quorum requires {}",
                active.len(),
                self.settings.quorum_count
            )));
        }
        if active_stake == 0 || active_stake < self.settings.min_active_stake {
            return Err(BridgeError::Consensus(format!(
                "active stake {active_stake} below minimum {}",
                self.settings.min_active_stake
            )));
        }
        Ok(())
    }

    /// 罚没：扣减质押与信誉，信誉低于下限即停用；已提交的签名不受影响
    pub async fn slash(
        &self,
        address: &str,
        amount: Amount,
        reason: &str,
    ) -> Result<Validator, BridgeError> {
        let _guard = self.validator_writes.lock().await;
        let mut validator = self
            .validators
            .get(address)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("validator '{address}'")))?;

        validator.stake = validator.stake.saturating_sub(amount);
        validator.reputation = validator
            .reputation
            .saturating_sub(self.settings.slash_reputation_penalty);
        let deactivated = validator.active && validator.reputation < self.settings.reputation_floor;
        if deactivated {
            validator.active = false;
        }
        self.validators.upsert(&validator).await?;
        metrics::inc_slash();

        tracing::warn!(
            validator_id = %address,
            amount = %amount,
            reason = %reason,
            stake = %validator.stake,
            reputation = validator.reputation,
            deactivated,
            "Validator slashed"
        );
        Ok(validator)
    }

    /// 交易完成后为每个签名者累加成功次数
    pub async fn record_completion(&self, tx: &BridgeTransaction) -> Result<(), BridgeError> {
        let _guard = self.validator_writes.lock().await;
        for attestation in &tx.attestations {
            if let Some(mut validator) = self.validators.get(&attestation.validator_id).await? {
                validator.successful_attestations += 1;
                self.validators.upsert(&validator).await?;
            }
        }
        Ok(())
    }

    /// 停用在活跃窗口内没有任何签名的验证者（交由运维复核，不自动罚没）。
    /// 最久未签名、质押最小的先停用；停用后活跃数量或质押会低于法定要求的保持活跃
    pub async fn expire_inactive(
        &self,
        now: DateTime<Utc>,
        liveness: Duration,
    ) -> Result<Vec<String>, BridgeError> {
        let _guard = self.validator_writes.lock().await;
        let cutoff = saturating_before(now, liveness);
        let validators = self.validators.list().await?;

        let mut remaining_count = validators.iter().filter(|v| v.active).count();
        let mut remaining_stake: Amount = validators
            .iter()
            .filter(|v| v.active)
            .map(|v| v.stake)
            .fold(0, Amount::saturating_add);
        let stake_floor = self.settings.min_active_stake.max(1);

        let mut idle: Vec<Validator> = validators
            .into_iter()
            .filter(|v| v.active && v.last_seen_at < cutoff)
            .collect();
        idle.sort_by(|a, b| {
            a.last_seen_at
                .cmp(&b.last_seen_at)
                .then_with(|| a.stake.cmp(&b.stake))
        });

        let mut expired = Vec::new();
        for mut validator in idle {
            let keeps_quorum = remaining_count > self.settings.quorum_count
                && remaining_stake.saturating_sub(validator.stake) >= stake_floor;
            if !keeps_quorum {
                tracing::warn!(
                    validator_id = %validator.address,
                    last_seen_at = %validator.last_seen_at,
                    active_validators = remaining_count,
                    active_stake = %remaining_stake,
                    "Idle validator kept active to preserve quorum, flagged for operator review"
                );
                continue;
            }

            validator.active = false;
            self.validators.upsert(&validator).await?;
            remaining_count -= 1;
            remaining_stake = remaining_stake.saturating_sub(validator.stake);
            tracing::warn!(
                validator_id = %validator.address,
                last_seen_at = %validator.last_seen_at,
                "Validator deactivated for inactivity, flagged for operator review"
            );
            expired.push(validator.address);
        }
        Ok(expired)
    }

    /// 运维复核后重新启用；信誉已低于下限（被罚没停用）的不能直接恢复
    pub async fn reactivate(&self, address: &str) -> Result<Validator, BridgeError> {
        let _guard = self.validator_writes.lock().await;
        let mut validator = self
            .validators
            .get(address)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("validator {address}")))?;

        if validator.reputation < self.settings.reputation_floor {
            return Err(BridgeError::Conflict(format!(
                "validator '{address}' reputation {} is below floor {}",
                validator.reputation, self.settings.reputation_floor
            )));
        }

        validator.active = true;
        validator.last_seen_at = self.clock.now();
        self.validators.upsert(&validator).await?;
        tracing::info!(
            validator_id = %address,
            stake = %validator.stake,
            reputation = validator.reputation,
            "Validator reactivated"
        );
        Ok(validator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(address: &str, stake: Amount, active: bool) -> Validator {
        let mut v = Validator::new(address, "solana", stake, 100, Utc::now());
        v.active = active;
        v
    }

    fn attestation(address: &str) -> Attestation {
        Attestation {
            validator_id: address.into(),
            signature: String::new(),
            timestamp: Utc::now(),
        }
    }

    fn pool() -> Vec<Validator> {
        vec![
            validator("a", 40, true),
            validator("b", 30, true),
            validator("c", 20, true),
            validator("d", 10, true),
        ]
    }

    #[test]
    fn test_stake_weighted_threshold() {
        let validators = pool();

        let sixty = evaluate_quorum(&[attestation("a"), attestation("c")], &validators, 2, 67);
        assert_eq!(sixty.attested_stake, 60);
        assert!(!sixty.reached);

        let seventy = evaluate_quorum(&[attestation("a"), attestation("b")], &validators, 2, 67);
        assert!(seventy.reached);

        // 低质押验证者数量再多也不够
        let small = evaluate_quorum(
            &[attestation("b"), attestation("c"), attestation("d")],
            &validators,
            2,
            67,
        );
        assert_eq!(small.attested_stake, 60);
        assert!(!small.reached);
    }

    #[test]
    fn test_quorum_count_still_required() {
        let validators = pool();
        let whales = [validator("a", 90, true), validator("b", 10, true)];
        let whale_only = evaluate_quorum(&[attestation("a")], &whales, 2, 67);
        assert!(!whale_only.reached);
        assert!(evaluate_quorum(&[attestation("a")], &validators, 1, 40).reached);
    }

    #[test]
    fn test_unknown_attester_not_counted_towards_quorum() {
        let validators = [validator("a", 90, true), validator("b", 10, true)];
        let status = evaluate_quorum(
            &[attestation("a"), attestation("ghost")],
            &validators,
            2,
            67,
        );
        assert_eq!(status.attested_stake, 90);
        assert_eq!(status.attester_count, 1);
        assert!(!status.reached);
    }

    #[test]
    fn test_deactivated_attester_still_counts() {
        let mut validators = pool();
        validators[0].active = false;
        // 活跃总质押 60；a(40) + c(20) = 60
        let status = evaluate_quorum(&[attestation("a"), attestation("c")], &validators, 2, 67);
        assert_eq!(status.total_active_stake, 60);
        assert!(status.reached);
    }

    #[test]
    fn test_no_active_stake_never_reaches() {
        let validators = vec![validator("a", 40, false)];
        assert!(!evaluate_quorum(&[attestation("a")], &validators, 1, 1).reached);
    }

    #[test]
    fn test_signature_round_trip() {
        use crate::domain::TransferRequest;

        let key = SigningKey::from_bytes(&[7u8; 32]);
        let address = hex::encode(key.verifying_key().to_bytes());
        let mut tx = BridgeTransaction::admit(
            TransferRequest {
                source_network: "solana".into(),
                dest_network: "ethereum".into(),
                source_address: "11111111111111111111111111111111".into(),
                dest_address: "0x52908400098527886e0f7030069857d2e4169ee7".into(),
                amount: 1_000_000,
                express: false,
            },
            15_000,
            Utc::now(),
        );
        tx.source_tx_ref = Some("lock-1".into());

        let v = validator(&address, 10, true);
        let signature = sign_attestation(&key, &tx);
        let verifier = Ed25519AttestationVerifier;
        assert!(verifier.verify(&v, &tx, &signature));

        // 改动金额后签名失效
        let mut tampered = tx.clone();
        tampered.amount += 1;
        assert!(!verifier.verify(&v, &tampered, &signature));

        // base58 地址同样可用
        let b58 = bs58::encode(key.verifying_key().to_bytes()).into_string();
        assert!(verifier.verify(&validator(&b58, 10, true), &tx, &signature));
        assert!(!verifier.verify(&v, &tx, "zz"));
        assert!(!verifier.is_valid_key("not-a-key"));
    }
}
