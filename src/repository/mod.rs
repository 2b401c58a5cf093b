pub mod stats_repository;
pub mod transaction_store;
pub mod validator_repository;

pub use stats_repository::{InMemoryStatsRepository, NetworkStats, PgStatsRepository, StatsRepository};
pub use transaction_store::{
    InMemoryTransactionStore, PgTransactionStore, TransactionStore, VolumeCap,
};
pub use validator_repository::{
    InMemoryValidatorRepository, PgValidatorRepository, ValidatorRepository,
};
