//! 网络注册表
//! 读多写少；重载时先完整校验再整体替换快照，读者不会看到半更新的状态

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use crate::{
    config::NetworkConfig,
    domain::{AddressFormat, BridgeError, NetworkDescriptor},
};

type Snapshot = Arc<HashMap<String, NetworkDescriptor>>;

pub struct NetworkRegistry {
    current: RwLock<Snapshot>,
}

impl NetworkRegistry {
    /// 启动加载；任一启用网络缺少必填字段即失败
    pub fn from_configs(configs: &[NetworkConfig]) -> Result<Self, BridgeError> {
        let snapshot = Self::build(configs)?;
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    pub fn from_descriptors(descriptors: Vec<NetworkDescriptor>) -> Self {
        let map = descriptors
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        Self {
            current: RwLock::new(Arc::new(map)),
        }
    }

    /// 校验全部配置后一次性生成快照
    pub fn build(configs: &[NetworkConfig]) -> Result<HashMap<String, NetworkDescriptor>, BridgeError> {
        let mut networks = HashMap::with_capacity(configs.len());
        for config in configs {
            let descriptor = Self::descriptor(config)?;
            if networks.insert(descriptor.id.clone(), descriptor).is_some() {
                return Err(BridgeError::Validation(format!(
                    "duplicate network id '{}'",
                    config.id
                )));
            }
        }
        Ok(networks)
    }

    fn descriptor(config: &NetworkConfig) -> Result<NetworkDescriptor, BridgeError> {
        let id = config.id.trim();
        if id.is_empty() {
            return Err(BridgeError::Validation("network id must not be empty".into()));
        }

        let missing = |field: &str| {
            BridgeError::Validation(format!("enabled network '{id}' is missing '{field}'"))
        };

        // 已禁用的网络允许字段不全（仅占位）
        if !config.enabled {
            let address_format = match config.address_format.as_deref() {
                Some(raw) => raw.parse().map_err(BridgeError::Validation)?,
                None => AddressFormat::Evm,
            };
            return Ok(NetworkDescriptor {
                id: id.to_string(),
                enabled: false,
                required_confirmations: config.required_confirmations.unwrap_or(0),
                fee_basis_points: config.fee_basis_points.unwrap_or(0),
                rpc_endpoint: config.rpc_endpoint.clone().unwrap_or_default(),
                block_time_secs: config.block_time_secs.unwrap_or(0),
                address_format,
            });
        }

        let required_confirmations = config
            .required_confirmations
            .ok_or_else(|| missing("required_confirmations"))?;
        if required_confirmations == 0 {
            return Err(BridgeError::Validation(format!(
                "network '{id}' must require at least one confirmation"
            )));
        }

        let fee_basis_points = config
            .fee_basis_points
            .ok_or_else(|| missing("fee_basis_points"))?;
        if fee_basis_points > 10_000 {
            return Err(BridgeError::Validation(format!(
                "network '{id}' fee_basis_points exceeds 10000"
            )));
        }

        let rpc_endpoint = config
            .rpc_endpoint
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| missing("rpc_endpoint"))?;

        let block_time_secs = config
            .block_time_secs
            .ok_or_else(|| missing("block_time_secs"))?;

        let address_format = config
            .address_format
            .as_deref()
            .ok_or_else(|| missing("address_format"))?
            .parse::<AddressFormat>()
            .map_err(BridgeError::Validation)?;

        Ok(NetworkDescriptor {
            id: id.to_string(),
            enabled: true,
            required_confirmations,
            fee_basis_points,
            rpc_endpoint,
            block_time_secs,
            address_format,
        })
    }

    fn snapshot(&self) -> Snapshot {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 原子替换；校验失败时保持旧快照
    pub fn reload(&self, configs: &[NetworkConfig]) -> Result<(), BridgeError> {
        let next = Arc::new(Self::build(configs)?);
        let enabled = next.values().filter(|d| d.enabled).count();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
        tracing::info!(networks = configs.len(), enabled, "Network registry reloaded");
        Ok(())
    }

    pub fn get(&self, network_id: &str) -> Result<NetworkDescriptor, BridgeError> {
        self.snapshot()
            .get(network_id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("network '{network_id}'")))
    }

    pub fn is_enabled(&self, network_id: &str) -> bool {
        self.snapshot()
            .get(network_id)
            .map(|d| d.enabled)
            .unwrap_or(false)
    }

    /// 按 id 排序
    pub fn list_enabled(&self) -> Vec<NetworkDescriptor> {
        let mut enabled: Vec<NetworkDescriptor> = self
            .snapshot()
            .values()
            .filter(|d| d.enabled)
            .cloned()
            .collect();
        enabled.sort_by(|a, b| a.id.cmp(&b.id));
        enabled
    }
}
