use clap::Parser;
use tracing_subscriber::EnvFilter;
use warden::cli::{self, Cli, Commands};
use warden::config::AppConfig;
use warden::error::Result;
use warden::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config_dir)?;

    match cli.command {
        Commands::Run => {
            let _log_guard = init_logging(&config);
            let mut supervisor = Supervisor::new(config)?;
            supervisor.run().await?;
        }
        Commands::Status { tail } => {
            init_logging_simple();
            if let Err(e) = cli::show_status(&config, tail).await {
                eprintln!("\x1b[31m✗ {:#}\x1b[0m", e);
                std::process::exit(1);
            }
        }
        Commands::Stop { force } => {
            init_logging_simple();
            if let Err(e) = cli::stop_supervisor(&config, force).await {
                eprintln!("\x1b[31m✗ {:#}\x1b[0m", e);
                std::process::exit(1);
            }
        }
        Commands::Beat => {
            init_logging_simple();
            if let Err(e) = cli::write_beat(&config).await {
                eprintln!("\x1b[31m✗ {:#}\x1b[0m", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn init_logging(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warden=debug", config.logging.level)));

    if let Some(ref log_dir) = config.logging.log_dir {
        let appender = tracing_appender::rolling::daily(log_dir, "warden.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true);
        if config.logging.json {
            builder.json().init();
        } else {
            builder.init();
        }
        return Some(guard);
    }

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    None
}

fn init_logging_simple() {
    // Minimal logging for CLI commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
