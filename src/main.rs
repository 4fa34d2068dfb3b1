mod auth;
mod bus;
mod guess;
mod message;
mod presence;
#[cfg(test)]
mod scenarios;
mod scoring;
mod server;
mod store;
mod words;
mod world;

use server::{CliOpts, Config, GameServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let opts: CliOpts = argh::from_env();
    let config = Config::from_env(&opts)?;

    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&config.log_level)
        .init();

    let server = GameServer::connect(config).await?;

    log::info!(
        "🚀 running scrawl server on port {} ({})...",
        server.config().port,
        server.config().app_env
    );
    server.listen().await?;

    Ok(())
}
