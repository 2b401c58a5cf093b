pub mod bridge_state_machine; // 处理引擎
pub mod chain_adapter;
pub mod consensus_manager;
pub mod emergency_stop;
pub mod fee_calculator;
pub mod network_registry;
pub mod reconciliation_service;
pub mod request_validator; // 准入校验
pub mod transaction_retry;
pub mod volume_ledger;

pub use bridge_state_machine::{BridgeStateMachine, EngineSettings, ProcessOutcome, ProcessTrigger};
pub use chain_adapter::{ChainAdapter, ChainAdapterRegistry, JsonRpcChainAdapter};
pub use consensus_manager::{
    AttestationOutcome, AttestationVerifier, ConsensusManager, ConsensusSettings,
    Ed25519AttestationVerifier, QuorumStatus, RejectionReason,
};
pub use emergency_stop::{EmergencyStop, PauseMode};
pub use fee_calculator::{FeeCalculator, FeeSchedule};
pub use network_registry::NetworkRegistry;
pub use reconciliation_service::{ReconciliationReport, ReconciliationScheduler, ReconciliationSettings};
pub use request_validator::{AmountBounds, FeeQuote, RequestValidator};
pub use transaction_retry::RetryConfig;
pub use volume_ledger::{VolumeLedger, VolumeLimits};
