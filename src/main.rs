use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use window_counter::cli::{Cli, Command};
use window_counter::config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut app_config = config::load_config(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        app_config.logging.level = level;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::CheckConfig => {
            let counter = app_config.counter_config();
            println!("Configuration is valid.");
            println!("  Listen:           {}", app_config.server.listen);
            println!("  Data file:        {}", app_config.storage.data_file.display());
            println!("  Window:           {:?}", counter.window);
            println!("  Persist interval: {:?}", counter.persist_interval);
            println!("  Concurrency:      {}", counter.concurrency);
            println!("  Queue capacity:   {}", counter.queue_capacity);
            println!("  Processing delay: {:?}", counter.processing_delay);
            println!("  Request timeout:  {:?}", app_config.request_timeout());
            println!(
                "  Logging:          {} ({})",
                app_config.logging.level, app_config.logging.format
            );
            Ok(())
        }
        Command::Serve => {
            window_counter::logging::setup_logging(
                &app_config.logging.level,
                app_config.logging.format,
            );
            info!(
                version = env!("CARGO_PKG_VERSION"),
                listen = %app_config.server.listen,
                data_file = %app_config.storage.data_file.display(),
                "Starting window-counter"
            );

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(window_counter::server::run(app_config))
        }
    }
}
