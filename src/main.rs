use anyhow::{Context, Result};
use log::info;

use sinamics_monitor::cli::{build_cli, handle_subcommands};
use sinamics_monitor::{Config, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let level = if matches.get_flag("verbose") { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();

    info!("🖥️  Sinamics monitor v{}", VERSION);

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => {
            info!("⚙️  Loading configuration from {}", path);
            Config::from_file(path).with_context(|| format!("loading configuration from {}", path))?
        }
        None => Config::default(),
    };
    config.apply_overrides(&matches).context("invalid command-line override")?;

    handle_subcommands(&matches, config).await
}
