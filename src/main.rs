//! Dev only：加载配置、启动引擎并跑一轮维护

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wharf::{UploadManager, WharfConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = WharfConfig::load("wharf.toml")?;
    let manager = UploadManager::new(config).await?;

    let tasks = manager.all_tasks().await;
    let removed = manager.cleanup_expired_tasks().await?;
    info!(tasks = tasks.len(), removed, "maintenance pass finished");

    manager.shutdown().await;
    Ok(())
}
