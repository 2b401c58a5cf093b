//! 验证者共识：质押加权法定人数、签名拒绝原因、罚没

mod common;

use common::{Harness, TestValidator};
use ironbridge::{
    domain::{BridgeError, TransferStatus},
    service::{AttestationOutcome, RejectionReason},
};

async fn attesting_transfer(h: &Harness) -> uuid::Uuid {
    let tx = h.admit(1_000_000).await;
    let tx = h.drive_to_attesting(tx.id).await;
    assert_eq!(tx.status, TransferStatus::Attesting);
    tx.id
}

#[tokio::test]
async fn test_quorum_requires_stake_threshold_in_any_order() {
    // 下标对应质押 [40, 30, 20, 10]；每组最后一个签名恰好跨过 67%
    let orders: [&[usize]; 4] = [&[0, 1], &[3, 2, 1, 0], &[0, 2, 3], &[2, 3, 1, 0]];

    for order in orders {
        let h = Harness::new().await;
        let validators = h.register(&[40, 30, 20, 10]).await;
        let id = attesting_transfer(&h).await;
        h.ethereum.set_release_confirmations(0);

        let (last, before) = order.split_last().unwrap();
        for i in before {
            let outcome = h.attest(id, &validators[*i]).await;
            assert!(matches!(outcome, AttestationOutcome::Accepted(q) if !q.reached));

            h.state.engine.process(id).await.unwrap();
            assert_eq!(h.get(id).await.status, TransferStatus::Attesting);
            assert!(!h.state.consensus.has_quorum(id).await.unwrap());
        }

        let outcome = h.attest(id, &validators[*last]).await;
        assert!(matches!(outcome, AttestationOutcome::Accepted(q) if q.reached));
        assert!(h.state.consensus.has_quorum(id).await.unwrap());

        h.state.engine.process(id).await.unwrap();
        assert_eq!(h.get(id).await.status, TransferStatus::Releasing);
    }
}

#[tokio::test]
async fn test_sixty_percent_stake_does_not_release() {
    let h = Harness::new().await;
    let validators = h.register(&[40, 30, 20, 10]).await;
    let id = attesting_transfer(&h).await;

    h.attest(id, &validators[0]).await;
    let outcome = h.attest(id, &validators[2]).await;
    match outcome {
        AttestationOutcome::Accepted(q) => {
            assert_eq!(q.attested_stake, 60);
            assert_eq!(q.total_active_stake, 100);
            assert_eq!(q.attester_count, 2);
            assert!(!q.reached);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    h.state.engine.process(id).await.unwrap();
    assert_eq!(h.get(id).await.status, TransferStatus::Attesting);
    assert_eq!(h.ethereum.releases(), 0);
}

#[tokio::test]
async fn test_attestation_rejections() {
    let h = Harness::new().await;
    let validators = h.register(&[40, 30, 20, 10]).await;

    // 交易尚未进入 attesting
    let pending = h.admit(1_000_000).await;
    assert_eq!(
        h.attest(pending.id, &validators[0]).await,
        AttestationOutcome::Rejected(RejectionReason::NotAttesting {
            status: TransferStatus::Pending
        })
    );

    let id = attesting_transfer(&h).await;

    let stranger = TestValidator::new(99, 50);
    assert_eq!(
        h.attest(id, &stranger).await,
        AttestationOutcome::Rejected(RejectionReason::UnknownValidator)
    );

    // 用别人的私钥签名
    let tx = h.get(id).await;
    let forged = validators[1].sign(&tx);
    let outcome = h
        .state
        .consensus
        .submit_attestation(id, &validators[0].address, &forged)
        .await
        .unwrap();
    assert_eq!(outcome, AttestationOutcome::Rejected(RejectionReason::InvalidSignature));

    assert!(matches!(h.attest(id, &validators[0]).await, AttestationOutcome::Accepted(_)));
    assert_eq!(
        h.attest(id, &validators[0]).await,
        AttestationOutcome::Rejected(RejectionReason::DuplicateAttestation)
    );

    assert_eq!(h.get(id).await.attestations.len(), 1);
}

#[tokio::test]
async fn test_unknown_transaction_is_not_found() {
    let h = Harness::new().await;
    let validators = h.register(&[40]).await;

    let err = h
        .state
        .consensus
        .submit_attestation(uuid::Uuid::new_v4(), &validators[0].address, "00")
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::NotFound(_)));
}

#[tokio::test]
async fn test_slashed_validator_keeps_prior_attestation_but_cannot_attest_new() {
    let h = Harness::new().await;
    let validators = h.register(&[40, 30, 20, 10]).await;
    let first = attesting_transfer(&h).await;

    h.attest(first, &validators[0]).await;

    // 每次罚没扣 20 信誉，低于 50 即停用
    for _ in 0..3 {
        h.state
            .consensus
            .slash(&validators[0].address, 0, "double signing")
            .await
            .unwrap();
    }
    let slashed = h
        .state
        .consensus
        .list_validators()
        .await
        .unwrap()
        .into_iter()
        .find(|v| v.address == validators[0].address)
        .unwrap();
    assert!(!slashed.active);
    assert_eq!(slashed.reputation, 40);

    // 已有签名仍计入：40 + 30 >= 67% of 60
    let outcome = h.attest(first, &validators[1]).await;
    assert!(matches!(outcome, AttestationOutcome::Accepted(q) if q.reached && q.attested_stake == 70));

    let second = h.admit(1_000_000).await;
    h.state.engine.process(second.id).await.unwrap();
    assert_eq!(
        h.attest(second.id, &validators[0]).await,
        AttestationOutcome::Rejected(RejectionReason::InactiveValidator)
    );
}

#[tokio::test]
async fn test_slash_reduces_stake_and_reputation() {
    let h = Harness::new().await;
    let validators = h.register(&[40, 30]).await;

    let slashed = h
        .state
        .consensus
        .slash(&validators[1].address, 50, "offline during release")
        .await
        .unwrap();
    assert_eq!(slashed.stake, 0);
    assert_eq!(slashed.reputation, 80);
    assert!(slashed.active);

    let err = h
        .state
        .consensus
        .slash("unknown-validator", 1, "n/a")
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::NotFound(_)));
}

#[tokio::test]
async fn test_register_validator_checks_key_and_duplicates() {
    let h = Harness::new().await;
    let validators = h.register(&[40]).await;

    let err = h
        .state
        .consensus
        .register_validator(&validators[0].address, "ethereum", 10)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Conflict(_)));

    let err = h
        .state
        .consensus
        .register_validator("not-a-public-key", "ethereum", 10)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Validation(_)));

    // base58 编码的公钥同样可用
    let key = TestValidator::new(42, 5).key.verifying_key();
    let base58 = bs58::encode(key.to_bytes()).into_string();
    let registered = h
        .state
        .consensus
        .register_validator(&base58, "solana", 5)
        .await
        .unwrap();
    assert!(registered.active);
    assert_eq!(registered.reputation, 100);
}
