//! 仅执行数据库迁移

use anyhow::{Context, Result};
use ironbridge::{
    config::Config,
    infrastructure::{db, logging},
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = Config::from_env_and_file(config_path.as_deref())?;
    logging::init_logging(&config.logging)?;

    let pool = db::init_pool(&config.database)
        .await
        .context("Failed to connect to Postgres for migrations")?;
    db::run_migrations(&pool).await?;

    tracing::info!("Migrations finished");
    Ok(())
}
