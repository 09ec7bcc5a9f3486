use anyhow::{bail, Result};
use log::info;
use std::sync::Arc;

use config::MinerConfig;
use services::mining_service::MiningService;
use services::twitch_gql_service::TwitchGqlService;

mod config;
mod error;
mod models;
mod services;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = MinerConfig::load()?;
    if config.auth_token.is_empty() {
        let path = confy::get_configuration_file_path("dropwatch", None)?;
        bail!(
            "no auth token configured; set auth_token in {}",
            path.display()
        );
    }

    let platform = Arc::new(TwitchGqlService::new(&config));
    let (service, handle) = MiningService::new(platform, config);
    let miner = tokio::spawn(service.run());

    handle.start().await?;
    info!("dropwatch running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.stop().await?;
    handle.shutdown().await?;
    let _ = miner.await;
    Ok(())
}
