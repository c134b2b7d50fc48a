mod cli;
mod platform;

use clap::Parser;
use deck_logging::{deck_info, parse_level};
use jobdeck_engine::EngineHandle;

use cli::{Cli, Cmd};
use platform::config::{AppConfig, BACKEND_URL_VAR};
use platform::{app, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    let level = parse_level(cli.log_level.as_deref().unwrap_or(&config.log_level));
    logging::initialize(config.log_destination, level);

    let backend_url = std::env::var(BACKEND_URL_VAR).ok();
    config.apply_overrides(backend_url.as_deref(), cli.demo)?;

    let engine = EngineHandle::connect(config.engine);
    deck_info!("Session started ({:?} backend)", engine.mode());

    let outcome = match cli.cmd {
        Cmd::Run(args) => app::run_job(&engine, args).await,
        Cmd::BulkReply(args) => app::bulk_reply(&engine, args).await,
        Cmd::Vm(args) => app::vm(&engine, args.cmd).await,
    };
    engine.shutdown();
    outcome
}
