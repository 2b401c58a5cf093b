pub mod db;
pub mod event_bus;
pub mod jwt;
pub mod lease; // 单笔交易处理租约
pub mod logging;
