//! 紧急暂停开关
//! halt：拒绝准入，在途交易原地停住（pending 直接失败）
//! abort：拒绝准入，所有非终态交易在下次处理时失败

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PauseMode {
    Halt,
    Abort,
}

const RUNNING: u8 = 0;
const HALTED: u8 = 1;
const ABORTING: u8 = 2;

#[derive(Debug, Clone, Default)]
pub struct EmergencyStop {
    state: Arc<AtomicU8>,
}

impl EmergencyStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self, mode: PauseMode) {
        let next = match mode {
            PauseMode::Halt => HALTED,
            PauseMode::Abort => ABORTING,
        };
        self.state.store(next, Ordering::SeqCst);
    }

    /// 返回之前是否处于暂停
    pub fn release(&self) -> bool {
        self.state.swap(RUNNING, Ordering::SeqCst) != RUNNING
    }

    pub fn is_engaged(&self) -> bool {
        self.mode().is_some()
    }

    pub fn mode(&self) -> Option<PauseMode> {
        match self.state.load(Ordering::SeqCst) {
            HALTED => Some(PauseMode::Halt),
            ABORTING => Some(PauseMode::Abort),
            _ => None,
        }
    }
}
