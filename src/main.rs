mod agent;
mod checkpoint;
mod config;
mod errors;
mod gateway;
mod providers;
mod sandbox;
mod session;
mod utils;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,bollard=warn,hyper=warn".parse().unwrap());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = config::Settings::from_env()?;
    gateway::serve(settings).await
}
