//! CARP daemon binary

use anyhow::Context;
use carpd::Config;
use common::logging::{LogFormat, init_with};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional explicit path: carpd [config.yaml]
    let path = std::env::args_os().nth(1).map(PathBuf::from);

    // Logging is not up yet, so configuration errors go to stderr
    let config = Config::load_from(path.as_deref()).context("loading configuration")?;

    let level = config.logging.level.as_deref().unwrap_or("info");
    let format = config
        .logging
        .format
        .as_deref()
        .map(LogFormat::from_name)
        .unwrap_or_default();
    init_with(level, format);

    tracing::info!(
        routers = config.virtual_routers.len(),
        "CARP daemon starting"
    );

    carpd::daemon::run(config).await.context("running daemon")?;

    tracing::info!("CARP daemon stopped");
    Ok(())
}
