//! 转账额度账本
//! 每个源地址滚动24小时累计额度；准入时即预留，失败时释放
//! 本账本只覆盖当前进程，跨进程的上限由存储层在写入时复核

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::{
    domain::{Amount, BridgeError, BridgeTransaction, TransferStatus},
    repository::VolumeCap,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeLimits {
    /// 单地址24小时上限
    pub daily_limit: Amount,
    /// 全部地址24小时上限，0 表示不限制
    pub global_daily_limit: Amount,
}

#[derive(Debug, Clone)]
struct Reservation {
    transaction_id: Uuid,
    amount: Amount,
    at: DateTime<Utc>,
}

#[derive(Default)]
struct LedgerState {
    per_address: HashMap<String, VecDeque<Reservation>>,
}

impl LedgerState {
    /// 丢弃窗口外的预留
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        self.per_address.retain(|_, entries| {
            while entries.front().is_some_and(|r| r.at <= cutoff) {
                entries.pop_front();
            }
            !entries.is_empty()
        });
    }

    fn address_total(&self, address: &str) -> Amount {
        self.per_address
            .get(address)
            .map(|entries| entries.iter().map(|r| r.amount).sum())
            .unwrap_or(0)
    }

    fn global_total(&self) -> Amount {
        self.per_address
            .values()
            .flat_map(|entries| entries.iter())
            .map(|r| r.amount)
            .sum()
    }
}

pub struct VolumeLedger {
    limits: VolumeLimits,
    window: Duration,
    state: Mutex<LedgerState>,
}

impl VolumeLedger {
    pub fn new(limits: VolumeLimits) -> Self {
        Self {
            limits,
            window: Duration::hours(24),
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn limits(&self) -> VolumeLimits {
        self.limits
    }

    /// 交给存储层复核的同一窗口与上限
    pub fn cap_at(&self, now: DateTime<Utc>) -> VolumeCap {
        VolumeCap {
            daily_limit: self.limits.daily_limit,
            global_daily_limit: self.limits.global_daily_limit,
            since: now - self.window,
        }
    }

    /// 地址当前窗口内已预留额度
    pub fn current_window(&self, address: &str, now: DateTime<Utc>) -> Amount {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.prune(now - self.window);
        state.address_total(address)
    }

    pub fn global_window(&self, now: DateTime<Utc>) -> Amount {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.prune(now - self.window);
        state.global_total()
    }

    /// 检查并预留在同一把锁内完成，并发请求不会共同越过上限。返回预留后的地址窗口额度
    pub fn try_reserve(
        &self,
        address: &str,
        transaction_id: Uuid,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Result<Amount, BridgeError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.prune(now - self.window);

        let current = state.address_total(address);
        let projected = current.checked_add(amount).unwrap_or(Amount::MAX);
        if projected > self.limits.daily_limit {
            return Err(BridgeError::RateLimit(format!(
                "daily limit {} exceeded for {address}: window {current} + amount {amount}",
                self.limits.daily_limit
            )));
        }

        if self.limits.global_daily_limit > 0 {
            let global = state.global_total();
            if global.checked_add(amount).unwrap_or(Amount::MAX) > self.limits.global_daily_limit {
                return Err(BridgeError::RateLimit(format!(
                    "global daily limit {} exceeded: window {global} + amount {amount}",
                    self.limits.global_daily_limit
                )));
            }
        }

        state
            .per_address
            .entry(address.to_string())
            .or_default()
            .push_back(Reservation {
                transaction_id,
                amount,
                at: now,
            });
        Ok(projected)
    }

    /// 交易失败或插入失败时退回预留，返回是否找到
    pub fn release(&self, address: &str, transaction_id: Uuid) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = state.per_address.get_mut(address) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|r| r.transaction_id != transaction_id);
        let released = entries.len() != before;
        if entries.is_empty() {
            state.per_address.remove(address);
        }
        released
    }

    /// 启动时从存储重建窗口（失败的交易不计入）
    pub fn rebuild(&self, transactions: &[BridgeTransaction], now: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.per_address.clear();

        let cutoff = now - self.window;
        let mut restored: Vec<&BridgeTransaction> = transactions
            .iter()
            .filter(|tx| tx.status != TransferStatus::Failed && tx.created_at > cutoff)
            .collect();
        restored.sort_by_key(|tx| tx.created_at);

        for tx in &restored {
            state
                .per_address
                .entry(tx.source_address.clone())
                .or_default()
                .push_back(Reservation {
                    transaction_id: tx.id,
                    amount: tx.amount,
                    at: tx.created_at,
                });
        }
        tracing::info!(restored = restored.len(), "Volume ledger rebuilt from store");
    }
}
