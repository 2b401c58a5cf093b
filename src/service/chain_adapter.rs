//! 链适配器
//! 每条链一个实现，负责提交锁定/释放交易和查询确认数；所有调用需可按引用安全重试

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::domain::{AdapterError, AddressFormat, BridgeTransaction, NetworkDescriptor};

#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn network(&self) -> &str;

    /// 在源链锁定资产，按交易 id 幂等
    async fn submit_lock(&self, tx: &BridgeTransaction) -> Result<String, AdapterError>;

    async fn get_confirmations(&self, source_tx_ref: &str) -> Result<u64, AdapterError>;

    /// 在目标链释放/铸造，按交易 id 幂等
    async fn submit_release(&self, tx: &BridgeTransaction) -> Result<String, AdapterError>;

    async fn get_release_confirmations(&self, dest_tx_ref: &str) -> Result<u64, AdapterError>;

    fn is_valid_address(&self, address: &str) -> bool;
}

/// 网络 id → 适配器
#[derive(Default, Clone)]
pub struct ChainAdapterRegistry {
    adapters: HashMap<String, Arc<dyn ChainAdapter>>,
}

impl ChainAdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(adapter.network().to_string(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ChainAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// 为每个启用网络创建 relayer 适配器
    pub fn json_rpc(descriptors: &[NetworkDescriptor], timeout: Duration) -> Result<Self, AdapterError> {
        let mut registry = Self::new();
        for descriptor in descriptors.iter().filter(|d| d.enabled) {
            registry.register(Arc::new(JsonRpcChainAdapter::new(descriptor, timeout)?));
        }
        Ok(registry)
    }

    pub fn get(&self, network: &str) -> Option<Arc<dyn ChainAdapter>> {
        self.adapters.get(network).cloned()
    }

    pub fn networks(&self) -> Vec<String> {
        let mut networks: Vec<String> = self.adapters.keys().cloned().collect();
        networks.sort();
        networks
    }
}

// ============ JSON-RPC relayer 适配器 ============

// 调用方参数错误，重试无意义
const REJECTED_RPC_CODES: [i64; 4] = [-32600, -32601, -32602, 3];

/// 通过 JSON-RPC 调用每条链的 relayer 服务
pub struct JsonRpcChainAdapter {
    network: String,
    endpoint: String,
    address_format: AddressFormat,
    client: reqwest::Client,
    timeout: Duration,
}

impl JsonRpcChainAdapter {
    pub fn new(descriptor: &NetworkDescriptor, timeout: Duration) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::Rpc(format!("failed to build http client: {e}")))?;

        Ok(Self {
            network: descriptor.id.clone(),
            endpoint: descriptor.rpc_endpoint.clone(),
            address_format: descriptor.address_format,
            client,
            timeout,
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdapterError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    AdapterError::Rpc(format!("{method} request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AdapterError::Rejected(format!("{method} returned HTTP {status}")));
        }
        if !status.is_success() {
            return Err(AdapterError::Rpc(format!("{method} returned HTTP {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Rpc(format!("{method} returned invalid JSON: {e}")))?;

        parse_rpc_response(method, body)
    }

    fn transfer_params(tx: &BridgeTransaction) -> Value {
        json!({
            "transferId": tx.id.to_string(),
            "sourceNetwork": tx.source_network,
            "destNetwork": tx.dest_network,
            "sourceAddress": tx.source_address,
            "destAddress": tx.dest_address,
            "amount": tx.amount.to_string(),
            "netAmount": tx.net_amount().to_string(),
            "sourceTxRef": tx.source_tx_ref,
        })
    }
}

fn parse_rpc_response(method: &str, body: Value) -> Result<Value, AdapterError> {
    if let Some(error) = body.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        let detail = format!("{method} error {code}: {message}");
        return Err(if REJECTED_RPC_CODES.contains(&code) {
            AdapterError::Rejected(detail)
        } else {
            AdapterError::Rpc(detail)
        });
    }

    body.get("result")
        .cloned()
        .ok_or_else(|| AdapterError::Rpc(format!("{method} response has no result")))
}

/// 交易引用：字符串或 {"txRef": "..."}
fn parse_tx_ref(method: &str, result: &Value) -> Result<String, AdapterError> {
    result
        .as_str()
        .or_else(|| result.get("txRef").and_then(Value::as_str))
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AdapterError::Rpc(format!("{method} returned no transaction reference")))
}

/// 确认数：整数或 0x 十六进制字符串
fn parse_count(method: &str, result: &Value) -> Result<u64, AdapterError> {
    if let Some(n) = result.as_u64() {
        return Ok(n);
    }
    if let Some(text) = result.as_str() {
        let parsed = match text.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => text.parse().ok(),
        };
        if let Some(n) = parsed {
            return Ok(n);
        }
    }
    Err(AdapterError::Rpc(format!("{method} returned invalid count {result}")))
}

#[async_trait]
impl ChainAdapter for JsonRpcChainAdapter {
    fn network(&self) -> &str {
        &self.network
    }

    async fn submit_lock(&self, tx: &BridgeTransaction) -> Result<String, AdapterError> {
        let method = "bridge_submitLock";
        let result = self.call(method, json!([Self::transfer_params(tx)])).await?;
        parse_tx_ref(method, &result)
    }

    async fn get_confirmations(&self, source_tx_ref: &str) -> Result<u64, AdapterError> {
        let method = "bridge_getConfirmations";
        let result = self.call(method, json!([source_tx_ref])).await?;
        parse_count(method, &result)
    }

    async fn submit_release(&self, tx: &BridgeTransaction) -> Result<String, AdapterError> {
        let method = "bridge_submitRelease";
        let result = self.call(method, json!([Self::transfer_params(tx)])).await?;
        parse_tx_ref(method, &result)
    }

    async fn get_release_confirmations(&self, dest_tx_ref: &str) -> Result<u64, AdapterError> {
        let method = "bridge_getReleaseConfirmations";
        let result = self.call(method, json!([dest_tx_ref])).await?;
        parse_count(method, &result)
    }

    fn is_valid_address(&self, address: &str) -> bool {
        self.address_format.validate(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_classification() {
        let rejected = parse_rpc_response(
            "bridge_submitLock",
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32602, "message": "bad amount"}}),
        );
        assert!(matches!(rejected, Err(AdapterError::Rejected(_))));

        let transient = parse_rpc_response(
            "bridge_submitLock",
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "node syncing"}}),
        );
        assert!(matches!(transient, Err(AdapterError::Rpc(_))));
    }

    #[test]
    fn test_parse_tx_ref_forms() {
        assert_eq!(parse_tx_ref("m", &json!("0xabc")).unwrap(), "0xabc");
        assert_eq!(parse_tx_ref("m", &json!({"txRef": "sig1"})).unwrap(), "sig1");
        assert!(parse_tx_ref("m", &json!("")).is_err());
        assert!(parse_tx_ref("m", &json!(null)).is_err());
    }

    #[test]
    fn test_parse_count_forms() {
        assert_eq!(parse_count("m", &json!(12)).unwrap(), 12);
        assert_eq!(parse_count("m", &json!("0x1f")).unwrap(), 31);
        assert_eq!(parse_count("m", &json!("7")).unwrap(), 7);
        assert!(parse_count("m", &json!("seven")).is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let descriptor = NetworkDescriptor {
            id: "ethereum".into(),
            enabled: true,
            required_confirmations: 12,
            fee_basis_points: 100,
            rpc_endpoint: "http://localhost:9102".into(),
            block_time_secs: 12,
            address_format: AddressFormat::Evm,
        };
        let adapter = JsonRpcChainAdapter::new(&descriptor, Duration::from_secs(5)).unwrap();
        assert!(adapter.is_valid_address("0x52908400098527886e0f7030069857d2e4169ee7"));

        let registry = ChainAdapterRegistry::new().with(Arc::new(adapter));
        assert!(registry.get("ethereum").is_some());
        assert!(registry.get("solana").is_none());
        assert_eq!(registry.networks(), vec!["ethereum".to_string()]);
    }
}
