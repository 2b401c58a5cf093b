//! 单笔交易处理租约
//! 每笔交易同一时刻最多一个 worker 处理；获取租约不阻塞，拿不到就跳过本轮
//! - InMemoryLeaseManager：单进程部署
//! - RedisLeaseManager：多进程部署（SET NX PX + Lua 校验拥有者后释放）

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::{aio::ConnectionManager, Client};
use uuid::Uuid;

use crate::{domain::BridgeError, utils::Clock};

/// 已持有的租约，释放时需出示 token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub transaction_id: Uuid,
    token: String,
}

impl Lease {
    fn new(transaction_id: Uuid) -> Self {
        Self {
            transaction_id,
            token: Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// 非阻塞获取；已被占用返回 None
    async fn try_acquire(&self, transaction_id: Uuid) -> Result<Option<Lease>, BridgeError>;

    /// 续期到 now + ttl；租约已被他人接管时返回 false
    async fn renew(&self, lease: &Lease) -> Result<bool, BridgeError>;

    /// 释放（只有拥有者能释放）
    async fn release(&self, lease: Lease) -> Result<(), BridgeError>;
}

// ============ 内存实现 ============

pub struct InMemoryLeaseManager {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    held: Mutex<HashMap<Uuid, (String, DateTime<Utc>)>>,
}

impl InMemoryLeaseManager {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            held: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LeaseManager for InMemoryLeaseManager {
    async fn try_acquire(&self, transaction_id: Uuid) -> Result<Option<Lease>, BridgeError> {
        let now = self.clock.now();
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);

        // 过期租约视为已释放（持有者崩溃）
        if let Some((_, expires_at)) = held.get(&transaction_id) {
            if *expires_at > now {
                return Ok(None);
            }
            tracing::warn!(transaction_id = %transaction_id, "Reclaiming expired lease");
        }

        let lease = Lease::new(transaction_id);
        held.insert(transaction_id, (lease.token.clone(), now + self.ttl));
        Ok(Some(lease))
    }

    async fn renew(&self, lease: &Lease) -> Result<bool, BridgeError> {
        let now = self.clock.now();
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match held.get_mut(&lease.transaction_id) {
            Some((token, expires_at)) if *token == lease.token => {
                *expires_at = now + self.ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, lease: Lease) -> Result<(), BridgeError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match held.get(&lease.transaction_id) {
            Some((token, _)) if *token == lease.token => {
                held.remove(&lease.transaction_id);
            }
            _ => tracing::warn!(
                transaction_id = %lease.transaction_id,
                "Lease not owned by caller (may have expired)"
            ),
        }
        Ok(())
    }
}

// ============ Redis 实现 ============

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

const RENEW_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("PEXPIRE", KEYS[1], ARGV[2])
    else
        return 0
    end
"#;

#[derive(Clone)]
pub struct RedisLeaseManager {
    conn: ConnectionManager,
    ttl_ms: u64,
    prefix: String,
}

impl RedisLeaseManager {
    /// - `redis_url`: redis://host:port
    pub async fn new(redis_url: &str, ttl_secs: u64) -> Result<Self, BridgeError> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            ttl_ms: ttl_secs.saturating_mul(1000),
            prefix: "ironbridge:lease".into(),
        })
    }

    fn key(&self, transaction_id: Uuid) -> String {
        format!("{}:{}", self.prefix, transaction_id)
    }
}

#[async_trait]
impl LeaseManager for RedisLeaseManager {
    async fn try_acquire(&self, transaction_id: Uuid) -> Result<Option<Lease>, BridgeError> {
        let lease = Lease::new(transaction_id);
        let mut conn = self.conn.clone();

        // SET key token NX PX ttl
        let result: Option<String> = redis::cmd("SET")
            .arg(self.key(transaction_id))
            .arg(&lease.token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(result.map(|_| lease))
    }

    async fn renew(&self, lease: &Lease) -> Result<bool, BridgeError> {
        let mut conn = self.conn.clone();
        let renewed: i32 = redis::Script::new(RENEW_SCRIPT)
            .key(self.key(lease.transaction_id))
            .arg(&lease.token)
            .arg(self.ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, lease: Lease) -> Result<(), BridgeError> {
        let mut conn = self.conn.clone();
        let released: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.key(lease.transaction_id))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;

        if released != 1 {
            tracing::warn!(
                transaction_id = %lease.transaction_id,
                "Lease not owned by current instance (may have expired)"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;

    fn manager(clock: Arc<ManualClock>) -> InMemoryLeaseManager {
        InMemoryLeaseManager::new(Duration::seconds(30), clock)
    }

    #[tokio::test]
    async fn test_second_acquire_is_skipped() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let leases = manager(clock);
        let id = Uuid::new_v4();

        let first = leases.try_acquire(id).await.unwrap();
        assert!(first.is_some());
        assert!(leases.try_acquire(id).await.unwrap().is_none());

        // 其他交易不受影响
        assert!(leases.try_acquire(Uuid::new_v4()).await.unwrap().is_some());

        leases.release(first.unwrap()).await.unwrap();
        assert!(leases.try_acquire(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let leases = manager(clock.clone());
        let id = Uuid::new_v4();

        let stale = leases.try_acquire(id).await.unwrap().unwrap();
        clock.advance(Duration::seconds(31));
        let fresh = leases.try_acquire(id).await.unwrap().unwrap();

        // 旧持有者释放不影响新持有者
        leases.release(stale).await.unwrap();
        assert!(leases.try_acquire(id).await.unwrap().is_none());
        leases.release(fresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_extends_only_for_owner() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let leases = manager(clock.clone());
        let id = Uuid::new_v4();

        let lease = leases.try_acquire(id).await.unwrap().unwrap();
        clock.advance(Duration::seconds(20));
        assert!(leases.renew(&lease).await.unwrap());

        // 续期后从续期时刻重新计时
        clock.advance(Duration::seconds(20));
        assert!(leases.try_acquire(id).await.unwrap().is_none());

        // 过期被接管后，旧持有者无法续期
        clock.advance(Duration::seconds(11));
        let taken = leases.try_acquire(id).await.unwrap().unwrap();
        assert!(!leases.renew(&lease).await.unwrap());
        assert!(leases.renew(&taken).await.unwrap());

        leases.release(taken).await.unwrap();
        assert!(!leases.renew(&lease).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // 需要Redis实例
    async fn test_redis_lease() {
        let url = std::env::var("TEST_REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let leases = RedisLeaseManager::new(&url, 5).await.unwrap();
        let id = Uuid::new_v4();

        let lease = leases.try_acquire(id).await.unwrap().unwrap();
        assert!(leases.try_acquire(id).await.unwrap().is_none());
        assert!(leases.renew(&lease).await.unwrap());
        leases.release(lease).await.unwrap();
        assert!(leases.try_acquire(id).await.unwrap().is_some());
    }
}
