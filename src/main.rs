use std::path::PathBuf;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;

use chatrelay::config::RelayConfig;
use chatrelay::server::config_routes;
use chatrelay::util::{env_bind_addr, init_tracing, AppState};

#[derive(Debug, Parser)]
#[command(
    name = "chatrelay",
    version,
    about = "OpenAI-compatible relay for a framed streaming chat provider"
)]
struct Args {
    /// YAML or JSON config file
    #[arg(long, env = "CHATRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (defaults to BIND_ADDR or 0.0.0.0:8090)
    #[arg(long)]
    bind: Option<String>,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = RelayConfig::load(args.config.as_deref())?;
    let bind = args.bind.unwrap_or_else(env_bind_addr);
    tracing::info!(
        "Relaying to {} (models: {})",
        config.provider.base_url,
        config.models.join(",")
    );

    let state = AppState::from_config(config);
    tracing::info!("Listening on {}", bind);

    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(web::Data::new(state.clone()))
            .configure(config_routes)
    })
    .bind(&bind)
    .with_context(|| format!("binding {bind}"))?
    .run()
    .await
    .context("running HTTP server")
}
