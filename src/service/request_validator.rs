//! 转账准入
//! 校验顺序：网络 → 金额 → 地址 → 紧急暂停 → 日限额；额度预留与记录写入之间失败会退回预留

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    domain::{amount_serde, Amount, BridgeError, BridgeTransaction, NetworkDescriptor, TransferRequest},
    infrastructure::event_bus::{BridgeEvent, EventBus},
    metrics,
    repository::TransactionStore,
    service::{
        chain_adapter::ChainAdapterRegistry, emergency_stop::EmergencyStop,
        fee_calculator::FeeCalculator, network_registry::NetworkRegistry,
        volume_ledger::VolumeLedger,
    },
    utils::Clock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountBounds {
    pub min_limit: Amount,
    pub max_limit: Amount,
}

/// 手续费报价
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeeQuote {
    #[serde(with = "amount_serde")]
    #[schema(value_type = String)]
    pub fee: Amount,
    pub estimated_time_secs: u64,
}

pub struct RequestValidator {
    registry: Arc<NetworkRegistry>,
    adapters: ChainAdapterRegistry,
    fees: FeeCalculator,
    volume: Arc<VolumeLedger>,
    emergency_stop: EmergencyStop,
    store: Arc<dyn TransactionStore>,
    events: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    bounds: AmountBounds,
}

impl RequestValidator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<NetworkRegistry>,
        adapters: ChainAdapterRegistry,
        fees: FeeCalculator,
        volume: Arc<VolumeLedger>,
        emergency_stop: EmergencyStop,
        store: Arc<dyn TransactionStore>,
        events: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        bounds: AmountBounds,
    ) -> Self {
        Self {
            registry,
            adapters,
            fees,
            volume,
            emergency_stop,
            store,
            events,
            clock,
            bounds,
        }
    }

    /// 校验并写入 pending 记录
    pub async fn admit(&self, request: TransferRequest) -> Result<BridgeTransaction, BridgeError> {
        match self.try_admit(request).await {
            Ok(tx) => {
                metrics::inc_admitted();
                metrics::inc_transition(tx.status.as_str());
                tracing::info!(
                    transaction_id = %tx.id,
                    source_network = %tx.source_network,
                    dest_network = %tx.dest_network,
                    amount = %tx.amount,
                    fee = %tx.fee_amount,
                    express = tx.express,
                    "Bridge transfer admitted"
                );
                Ok(tx)
            }
            Err(e) => {
                metrics::inc_rejected(e.kind());
                tracing::warn!(error = %e, "Bridge transfer rejected");
                Err(e)
            }
        }
    }

    async fn try_admit(&self, request: TransferRequest) -> Result<BridgeTransaction, BridgeError> {
        let (source, dest) = self.networks(&request.source_network, &request.dest_network)?;
        let fee = self.check_amount(&source, &dest, request.amount, request.express)?;
        self.check_addresses(&source, &dest, &request)?;

        if let Some(mode) = self.emergency_stop.mode() {
            return Err(BridgeError::Validation(format!(
                "bridge is paused ({mode:?}), new transfers are not accepted"
            )));
        }

        let now = self.clock.now();
        let tx = BridgeTransaction::admit(request, fee, now);
        self.volume
            .try_reserve(&tx.source_address, tx.id, tx.amount, now)?;

        // 进程内预留挡住本进程的并发请求，存储层复核挡住其他进程已写入的额度
        let cap = self.volume.cap_at(now);
        if let Err(e) = self.store.insert_within_cap(&tx, &cap).await {
            self.volume.release(&tx.source_address, tx.id);
            return Err(e);
        }

        // 记录已落库，事件发布失败不影响准入结果
        let event = BridgeEvent {
            transaction_id: tx.id,
            status: tx.status,
            timestamp: now,
            detail: "transfer admitted".into(),
        };
        if let Err(e) = self.events.publish(event).await {
            tracing::error!(transaction_id = %tx.id, error = ?e, "Failed to publish admission event");
        }

        Ok(tx)
    }

    /// 报价：与准入使用同一套网络和金额校验，不占用额度
    pub fn quote(
        &self,
        source_network: &str,
        dest_network: &str,
        amount: Amount,
        express: bool,
    ) -> Result<FeeQuote, BridgeError> {
        let (source, dest) = self.networks(source_network, dest_network)?;
        let fee = self.check_amount(&source, &dest, amount, express)?;
        Ok(FeeQuote {
            fee,
            estimated_time_secs: self.fees.estimate_time_secs(&source, &dest, express),
        })
    }

    pub fn estimate_time_secs(&self, tx: &BridgeTransaction) -> u64 {
        match (
            self.registry.get(&tx.source_network),
            self.registry.get(&tx.dest_network),
        ) {
            (Ok(source), Ok(dest)) => self.fees.estimate_time_secs(&source, &dest, tx.express),
            _ => 0,
        }
    }

    fn networks(
        &self,
        source_network: &str,
        dest_network: &str,
    ) -> Result<(NetworkDescriptor, NetworkDescriptor), BridgeError> {
        if source_network == dest_network {
            return Err(BridgeError::Validation(
                "source and destination networks must differ".into(),
            ));
        }
        Ok((
            self.enabled_network(source_network)?,
            self.enabled_network(dest_network)?,
        ))
    }

    fn enabled_network(&self, id: &str) -> Result<NetworkDescriptor, BridgeError> {
        let descriptor = self
            .registry
            .get(id)
            .map_err(|_| BridgeError::Validation(format!("unknown network '{id}'")))?;
        if !descriptor.enabled {
            return Err(BridgeError::Validation(format!("network '{id}' is disabled")));
        }
        Ok(descriptor)
    }

    fn check_amount(
        &self,
        source: &NetworkDescriptor,
        dest: &NetworkDescriptor,
        amount: Amount,
        express: bool,
    ) -> Result<Amount, BridgeError> {
        if amount < self.bounds.min_limit || amount > self.bounds.max_limit {
            return Err(BridgeError::Validation(format!(
                "amount {amount} outside allowed range [{}, {}]",
                self.bounds.min_limit, self.bounds.max_limit
            )));
        }

        let fee = self.fees.compute_fee(source, dest, amount, express)?;
        if fee >= amount {
            return Err(BridgeError::Validation(format!(
                "fee {fee} would consume the whole amount {amount}"
            )));
        }
        Ok(fee)
    }

    fn check_addresses(
        &self,
        source: &NetworkDescriptor,
        dest: &NetworkDescriptor,
        request: &TransferRequest,
    ) -> Result<(), BridgeError> {
        for (descriptor, address, role) in [
            (source, &request.source_address, "source"),
            (dest, &request.dest_address, "destination"),
        ] {
            let adapter_accepts = self
                .adapters
                .get(&descriptor.id)
                .map_or(true, |adapter| adapter.is_valid_address(address));
            if !descriptor.validate_address(address) || !adapter_accepts {
                return Err(BridgeError::Validation(format!(
                    "invalid {role} address for {}",
                    descriptor.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{
        config::default_networks,
        infrastructure::event_bus::InMemoryEventBus,
        repository::InMemoryTransactionStore,
        service::{
            emergency_stop::PauseMode, fee_calculator::FeeSchedule, volume_ledger::VolumeLimits,
        },
        utils::ManualClock,
    };

    const SOL_ADDRESS: &str = "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK";
    const ETH_ADDRESS: &str = "0x52908400098527886e0f7030069857d2e4169ee7";

    fn validator(daily_limit: Amount) -> (RequestValidator, Arc<InMemoryTransactionStore>, EmergencyStop) {
        let store = Arc::new(InMemoryTransactionStore::new());
        let stop = EmergencyStop::new();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let validator = RequestValidator::new(
            Arc::new(NetworkRegistry::from_configs(&default_networks()).unwrap()),
            ChainAdapterRegistry::new(),
            FeeCalculator::new(
                FeeSchedule {
                    base_rate_bps: 50,
                    express_rate_bps: 50,
                    min_fee: 0,
                },
                120,
            ),
            Arc::new(VolumeLedger::new(VolumeLimits {
                daily_limit,
                global_daily_limit: 0,
            })),
            stop.clone(),
            store.clone(),
            Arc::new(InMemoryEventBus::new(None)),
            clock,
            AmountBounds {
                min_limit: 100,
                max_limit: 1_000_000_000,
            },
        );
        (validator, store, stop)
    }

    fn request(amount: Amount) -> TransferRequest {
        TransferRequest {
            source_network: "solana".into(),
            dest_network: "ethereum".into(),
            source_address: SOL_ADDRESS.into(),
            dest_address: ETH_ADDRESS.into(),
            amount,
            express: false,
        }
    }

    #[tokio::test]
    async fn test_admit_computes_fee_and_persists() {
        let (validator, store, _) = validator(10_000_000);
        let tx = validator.admit(request(1_000_000)).await.unwrap();
        assert_eq!(tx.fee_amount, 15_000);
        assert_eq!(store.get(tx.id).await.unwrap().unwrap(), tx);
    }

    #[tokio::test]
    async fn test_validation_failures() {
        let (validator, _, _) = validator(10_000_000);

        let mut same = request(1_000_000);
        same.dest_network = "solana".into();
        assert!(matches!(validator.admit(same).await, Err(BridgeError::Validation(_))));

        let mut unknown = request(1_000_000);
        unknown.dest_network = "dogecoin".into();
        assert!(matches!(validator.admit(unknown).await, Err(BridgeError::Validation(_))));

        assert!(matches!(validator.admit(request(99)).await, Err(BridgeError::Validation(_))));

        let mut bad_address = request(1_000_000);
        bad_address.dest_address = SOL_ADDRESS.into();
        let err = validator.admit(bad_address).await.unwrap_err();
        assert!(err.to_string().contains("destination address"));
    }

    #[tokio::test]
    async fn test_daily_limit_scenario() {
        let (validator, _, _) = validator(10_000_000);
        validator.admit(request(9_500_000)).await.unwrap();
        assert!(matches!(
            validator.admit(request(600_000)).await,
            Err(BridgeError::RateLimit(_))
        ));
        validator.admit(request(400_000)).await.unwrap();
    }

    #[tokio::test]
    async fn test_paused_bridge_rejects() {
        let (validator, _, stop) = validator(10_000_000);
        stop.engage(PauseMode::Halt);
        assert!(matches!(
            validator.admit(request(1_000_000)).await,
            Err(BridgeError::Validation(_))
        ));
        stop.release();
        assert!(validator.admit(request(1_000_000)).await.is_ok());
    }

    #[tokio::test]
    async fn test_quote_matches_admission() {
        let (validator, _, _) = validator(10_000_000);
        let quote = validator.quote("solana", "ethereum", 1_000_000, true).unwrap();
        assert_eq!(quote.fee, 20_000);
        assert_eq!(quote.estimated_time_secs, 32 + 60 + 144);
    }
}
