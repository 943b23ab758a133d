use anyhow::Result;

use gitmproxy::{logging, run, settings::Settings};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logger()?;
    tracing::info!("starting gitmproxy cache proxy");
    let settings = Settings::from_env()?;
    run(settings).await
}
