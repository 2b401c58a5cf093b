//! IronBridge - 跨链桥编排服务
//!
//! 准入校验、状态机推进、验证者共识与对账调度

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod metrics;
pub mod repository;
pub mod service;
pub mod utils;

// 重新导出常用类型
pub use app_state::AppState;
pub use error::{AppError, AppErrorCode};

pub mod prelude {
    pub use crate::{
        app_state::{AppState, Backends},
        domain::{Amount, BridgeError, BridgeTransaction, TransferRequest, TransferStatus},
        error::{AppError, AppErrorCode},
        service::{BridgeStateMachine, ChainAdapter, ChainAdapterRegistry},
    };
}
