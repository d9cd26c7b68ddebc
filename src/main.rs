// Entrypoint for the CLI application.
// - Installs logging on stderr so it does not interleave with the menu.
// - Reads the configuration from the environment and starts the UI loop.

use cloudbox_cli::{config::Config, ui::main_menu};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env()?;
    main_menu(config).await
}
