use clap::Parser;
use flashdash::app;
use flashdash::config::{Config, StorageKind};
use flashdash::projects::ProjectStore;
use flashdash::storage::{MemoryStore, ObjectStore};
use log::{info, warn};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = Config::parse();

    let store: Arc<dyn ObjectStore> = match config.storage {
        StorageKind::S3 => s3_store(&config).await,
        StorageKind::Memory => {
            warn!("projects are kept in memory and lost on restart");
            Arc::new(MemoryStore::new())
        }
    };
    let projects = ProjectStore::new(store).with_expiry_days(config.expiry_days);

    // Start the web application
    app::run(config, projects).await?;

    Ok(())
}

#[cfg(feature = "s3")]
async fn s3_store(config: &Config) -> Arc<dyn ObjectStore> {
    info!("storing projects in s3://{} ({})", config.bucket, config.region);
    Arc::new(flashdash::storage::S3Store::connect(&config.region, &config.bucket).await)
}

#[cfg(not(feature = "s3"))]
async fn s3_store(_config: &Config) -> Arc<dyn ObjectStore> {
    warn!("built without s3 support, keeping projects in memory");
    Arc::new(MemoryStore::new())
}
