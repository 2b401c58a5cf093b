//! Domain 模块
//!
//! 跨链桥核心领域模型

pub mod bridge_transaction;
pub mod chain_config;
pub mod error;
pub mod transaction_status;
pub mod validator;

pub use bridge_transaction::{amount_serde, Amount, Attestation, BridgeTransaction, TransferRequest};
pub use chain_config::{AddressFormat, NetworkDescriptor};
pub use error::{AdapterError, BridgeError};
pub use transaction_status::TransferStatus;
pub use validator::Validator;
