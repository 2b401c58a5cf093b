// Event Bus
// 每次状态转换发布一条事件，后台任务分发给订阅者，可选持久化到 bridge_events

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::{mpsc, RwLock};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::domain::TransferStatus;

// 无数据库时保留的最近事件数
const HISTORY_CAPACITY: usize = 1_000;

// ============ 事件类型定义 ============

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BridgeEvent {
    pub transaction_id: Uuid,
    pub status: TransferStatus,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event: BridgeEvent,
    pub published_at: DateTime<Utc>,
}

// ============ Event Handler Trait ============

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &BridgeEvent) -> Result<()>;

    /// 只接收关心的状态
    fn accepts(&self, _status: TransferStatus) -> bool {
        true
    }
}

// ============ Event Bus 接口 ============

#[async_trait]
pub trait EventBus: Send + Sync {
    /// 发布事件
    async fn publish(&self, event: BridgeEvent) -> Result<()>;

    /// 订阅事件
    async fn subscribe(&self, handler: Arc<dyn EventHandler>);

    /// 获取事件历史（新的在前）
    async fn history(&self, limit: i64, offset: i64) -> Result<Vec<EventEnvelope>>;
}

// ============ 内存 Event Bus 实现（支持持久化） ============

pub struct InMemoryEventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
    pool: Option<PgPool>,
    sender: mpsc::UnboundedSender<EventEnvelope>,
    recent: Mutex<VecDeque<EventEnvelope>>,
}

impl InMemoryEventBus {
    /// 需在 tokio 运行时内创建（启动分发任务）
    pub fn new(pool: Option<PgPool>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<EventEnvelope>();
        let handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>> = Arc::new(RwLock::new(Vec::new()));

        let handlers_clone = handlers.clone();

        // 后台任务：处理事件分发
        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                let handlers_read = handlers_clone.read().await;

                for handler in handlers_read.iter() {
                    if !handler.accepts(envelope.event.status) {
                        continue;
                    }
                    if let Err(e) = handler.handle(&envelope.event).await {
                        tracing::error!(
                            error = ?e,
                            event_id = %envelope.event_id,
                            transaction_id = %envelope.event.transaction_id,
                            "Event handler error"
                        );
                    }
                }
            }
        });

        Self {
            handlers,
            pool,
            sender,
            recent: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    /// 持久化事件到数据库
    async fn persist_event(&self, envelope: &EventEnvelope) -> Result<()> {
        if let Some(pool) = &self.pool {
            sqlx::query(
                "INSERT INTO bridge_events (id, transaction_id, status, detail, occurred_at, published_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(envelope.event_id)
            .bind(envelope.event.transaction_id)
            .bind(envelope.event.status.as_str())
            .bind(&envelope.event.detail)
            .bind(envelope.event.timestamp)
            .bind(envelope.published_at)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    fn remember(&self, envelope: EventEnvelope) {
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == HISTORY_CAPACITY {
            recent.pop_back();
        }
        recent.push_front(envelope);
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: BridgeEvent) -> Result<()> {
        let envelope = EventEnvelope {
            event_id: Uuid::new_v4(),
            event,
            published_at: Utc::now(),
        };

        self.persist_event(&envelope).await?;
        self.remember(envelope.clone());

        // 发送到处理队列
        self.sender
            .send(envelope)
            .map_err(|e| anyhow::anyhow!("Failed to send event: {}", e))?;

        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    async fn history(&self, limit: i64, offset: i64) -> Result<Vec<EventEnvelope>> {
        if let Some(pool) = &self.pool {
            let rows = sqlx::query_as::<_, (Uuid, Uuid, String, String, DateTime<Utc>, DateTime<Utc>)>(
                "SELECT id, transaction_id, status, detail, occurred_at, published_at
                 FROM bridge_events
                 ORDER BY published_at DESC
                 LIMIT $1 OFFSET $2",
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?;

            let mut envelopes = Vec::with_capacity(rows.len());
            for (id, transaction_id, status, detail, occurred_at, published_at) in rows {
                let status = status
                    .parse::<TransferStatus>()
                    .map_err(|e| anyhow::anyhow!(e))?;
                envelopes.push(EventEnvelope {
                    event_id: id,
                    event: BridgeEvent {
                        transaction_id,
                        status,
                        timestamp: occurred_at,
                        detail,
                    },
                    published_at,
                });
            }
            return Ok(envelopes);
        }

        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(recent
            .iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

// ============ 内置事件处理器 ============

/// 把每个状态事件写入结构化日志
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle(&self, event: &BridgeEvent) -> Result<()> {
        if event.status == TransferStatus::Failed {
            tracing::warn!(
                transaction_id = %event.transaction_id,
                status = %event.status,
                detail = %event.detail,
                "Bridge transfer failed"
            );
        } else {
            tracing::info!(
                transaction_id = %event.transaction_id,
                status = %event.status,
                detail = %event.detail,
                "Bridge transfer status changed"
            );
        }
        Ok(())
    }
}
