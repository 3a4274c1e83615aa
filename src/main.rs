use clap::Parser;
use tracing_subscriber::EnvFilter;

mod auth;
mod cli;
mod config;
mod credits;
mod db;
mod email;
mod error;
mod ledger;
mod models;
mod notify;
mod payments;
mod quota;
mod routes;
mod server;
mod state;
mod store;
mod trace;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();
    let settings = config::Settings::from_env()?;

    match cli.command {
        cli::Command::Serve { host, port } => server::serve(settings, &host, port).await,
        cli::Command::Migrate => {
            let pool = db::connect(&settings.database_url).await?;
            db::migrate(&pool).await?;
            tracing::info!("schema up to date");
            Ok(())
        }
    }
}
