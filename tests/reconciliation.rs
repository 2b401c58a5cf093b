//! 对账调度：卡住交易、重试耗尽、统计重算、验证者过期与重新启用、归档

mod common;

use chrono::Duration;
use common::Harness;
use ironbridge::{
    domain::{BridgeError, TransferStatus},
    utils::Clock,
};
use uuid::Uuid;

/// 走完整条成功路径
async fn complete_transfer(h: &Harness) -> Uuid {
    let validators = h.register(&[40, 30]).await;
    h.ethereum.set_release_confirmations(12);

    let tx = h.admit(1_000_000).await;
    h.drive_to_attesting(tx.id).await;
    for v in &validators {
        h.attest(tx.id, v).await;
    }
    h.state.engine.process(tx.id).await.unwrap();

    let tx = h.get(tx.id).await;
    assert_eq!(tx.status, TransferStatus::Completed);
    tx.id
}

/// 源链确认卡在 10/32
async fn locked_at_ten(h: &Harness) -> Uuid {
    h.solana.set_confirmations(10);
    let tx = h.admit(1_000_000).await;
    h.state.engine.process(tx.id).await.unwrap();

    let tx = h.get(tx.id).await;
    assert_eq!(tx.status, TransferStatus::Locked);
    assert_eq!(tx.confirmations, 10);
    tx.id
}

#[tokio::test]
async fn test_fresh_transfers_are_left_alone() {
    let h = Harness::new().await;
    let id = locked_at_ten(&h).await;

    h.clock.advance(Duration::minutes(5));
    let report = h.state.scheduler.run_once().await.unwrap();
    assert_eq!(report.stuck_retried, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(h.get(id).await.retry_count, 0);
}

#[tokio::test]
async fn test_stuck_transfer_is_retried_and_repolled() {
    let h = Harness::new().await;
    let id = locked_at_ten(&h).await;
    let polls_before = h.solana.confirmation_polls.load(std::sync::atomic::Ordering::SeqCst);

    h.clock.advance(Duration::minutes(16));
    let report = h.state.scheduler.run_once().await.unwrap();
    assert_eq!(report.stuck_retried, 1);
    assert_eq!(report.failed, 0);

    let tx = h.get(id).await;
    assert_eq!(tx.status, TransferStatus::Locked);
    assert_eq!(tx.retry_count, 1);
    assert!(tx.last_error.as_deref().unwrap().starts_with("stuck in locked"));
    assert!(h.solana.confirmation_polls.load(std::sync::atomic::Ordering::SeqCst) > polls_before);
}

#[tokio::test]
async fn test_stuck_transfer_fails_once_retries_exhausted() {
    let h = Harness::new().await;
    let id = locked_at_ten(&h).await;

    for _ in 0..3 {
        h.clock.advance(Duration::minutes(16));
        let report = h.state.scheduler.run_once().await.unwrap();
        assert_eq!(report.stuck_retried, 1);
    }
    assert_eq!(h.get(id).await.retry_count, 3);

    h.clock.advance(Duration::minutes(16));
    let report = h.state.scheduler.run_once().await.unwrap();
    assert_eq!(report.failed, 1);

    let tx = h.get(id).await;
    assert_eq!(tx.status, TransferStatus::Failed);
    assert!(tx.last_error.unwrap().starts_with("retries exhausted after 4 attempts"));
}

#[tokio::test]
async fn test_stuck_transfer_resumes_when_chain_catches_up() {
    let h = Harness::new().await;
    let id = locked_at_ten(&h).await;

    h.solana.set_confirmations(32);
    h.clock.advance(Duration::minutes(16));
    h.state.scheduler.run_once().await.unwrap();

    // 进入 attesting 后没有任何验证者，法定人数不可达
    let tx = h.get(id).await;
    assert_eq!(tx.status, TransferStatus::Failed);
    assert!(tx.last_error.unwrap().starts_with("consensus unreachable"));
}

#[tokio::test]
async fn test_stats_recomputed_per_network() {
    let h = Harness::new().await;
    complete_transfer(&h).await;

    h.solana.reject_locks(true);
    let failed = h.admit(2_000_000).await;
    h.state.engine.process(failed.id).await.unwrap();
    assert_eq!(h.get(failed.id).await.status, TransferStatus::Failed);

    let report = h.state.scheduler.run_once().await.unwrap();
    assert_eq!(report.buckets_written, 1);

    let stats = h
        .state
        .stats
        .list(h.clock.now() - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(stats.len(), 1);
    let solana = &stats[0];
    assert_eq!(solana.network, "solana");
    assert_eq!(solana.transfer_count, 2);
    assert_eq!(solana.volume, 3_000_000);
    assert_eq!(solana.completed_count, 1);
    assert_eq!(solana.failed_count, 1);
    assert_eq!(solana.success_rate_bps, 5_000);
}

#[tokio::test]
async fn test_quiet_bridge_keeps_validators_active() {
    let h = Harness::new().await;
    h.register(&[40, 30, 20, 10]).await;

    // 一整天没有任何转账，不能据此判定验证者失联
    h.clock.advance(Duration::hours(25));
    let report = h.state.scheduler.run_once().await.unwrap();
    assert_eq!(report.validators_expired, 0);
    let validators = h.state.consensus.list_validators().await.unwrap();
    assert!(validators.iter().all(|v| v.active));

    let tx = h.admit(1_000_000).await;
    let tx = h.drive_to_attesting(tx.id).await;
    assert_eq!(tx.status, TransferStatus::Attesting);
}

#[tokio::test]
async fn test_idle_expiry_never_breaks_quorum() {
    let h = Harness::new().await;
    let validators = h.register(&[40, 30, 20, 10]).await;

    h.clock.advance(Duration::hours(24));
    let tx = h.admit(1_000_000).await;
    h.drive_to_attesting(tx.id).await;

    // 有签名工作但无人签名；只停用到仍满足法定人数为止，小质押先停
    h.clock.advance(Duration::hours(2));
    let report = h.state.scheduler.run_once().await.unwrap();
    assert_eq!(report.validators_expired, 2);

    let stored = h.state.consensus.list_validators().await.unwrap();
    let active = |v: &common::TestValidator| {
        stored.iter().find(|s| s.address == v.address).unwrap().active
    };
    assert!(active(&validators[0]));
    assert!(active(&validators[1]));
    assert!(!active(&validators[2]));
    assert!(!active(&validators[3]));
    // 停用不等于罚没
    assert!(stored.iter().all(|v| v.reputation == 100));

    h.attest(tx.id, &validators[0]).await;
    h.attest(tx.id, &validators[1]).await;
    h.clock.advance(Duration::seconds(5));
    h.state.engine.process(tx.id).await.unwrap();
    assert_eq!(h.get(tx.id).await.status, TransferStatus::Releasing);

    // 剩余两位仍然空闲也不会再被停用
    h.clock.advance(Duration::days(2));
    let report = h.state.scheduler.run_once().await.unwrap();
    assert_eq!(report.validators_expired, 0);
}

#[tokio::test]
async fn test_expired_validator_can_be_reactivated() {
    let h = Harness::new().await;
    let validators = h.register(&[40, 30, 20, 10]).await;

    h.clock.advance(Duration::hours(24));
    let tx = h.admit(1_000_000).await;
    h.drive_to_attesting(tx.id).await;
    h.clock.advance(Duration::hours(2));
    h.state.scheduler.run_once().await.unwrap();

    let smallest = &validators[3];
    let revived = h.state.consensus.reactivate(&smallest.address).await.unwrap();
    assert!(revived.active);
    assert_eq!(revived.last_seen_at, h.clock.now());

    // 重新启用后立即可以签名
    assert!(matches!(
        h.attest(tx.id, smallest).await,
        ironbridge::service::AttestationOutcome::Accepted(_)
    ));

    // 刚启用的不会在下一轮被马上停用
    h.state.scheduler.run_once().await.unwrap();
    let stored = h.state.consensus.list_validators().await.unwrap();
    assert!(stored.iter().find(|v| v.address == smallest.address).unwrap().active);

    let err = h.state.consensus.reactivate("unknown").await.unwrap_err();
    assert!(matches!(err, BridgeError::NotFound(_)));
}

#[tokio::test]
async fn test_slashed_validator_cannot_be_reactivated() {
    let h = Harness::new().await;
    let validators = h.register(&[40, 30, 20]).await;
    let target = &validators[2];

    for _ in 0..3 {
        h.state
            .consensus
            .slash(&target.address, 1, "double signing")
            .await
            .unwrap();
    }
    let slashed = h.state.consensus.list_validators().await.unwrap();
    assert!(!slashed.iter().find(|v| v.address == target.address).unwrap().active);

    let err = h.state.consensus.reactivate(&target.address).await.unwrap_err();
    assert!(matches!(err, BridgeError::Conflict(_)));
}

#[tokio::test]
async fn test_old_terminal_records_are_archived_but_readable() {
    let h = Harness::new().await;
    let id = complete_transfer(&h).await;

    h.clock.advance(Duration::days(30));
    let report = h.state.scheduler.run_once().await.unwrap();
    assert_eq!(report.archived, 0);

    h.clock.advance(Duration::days(61));
    let report = h.state.scheduler.run_once().await.unwrap();
    assert_eq!(report.archived, 1);

    let tx = h.get(id).await;
    assert_eq!(tx.status, TransferStatus::Completed);

    let report = h.state.scheduler.run_once().await.unwrap();
    assert_eq!(report.archived, 0);
}
