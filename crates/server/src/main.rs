mod api;
mod cli;
mod ops;
mod router;
mod serve;
mod state;
mod stress;

use clap::Parser;

fn load_config() -> courier_core::Config {
    courier_core::config::load_dotenv();
    courier_core::Config::from_env()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = load_config();
    let cli = cli::Cli::parse();
    config.validate()?;

    cli::dispatch(config, cli).await
}
