use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use hadrian_sso::{
    AppState, build_app,
    config::SsoServiceConfig,
    db::DbPool,
    jobs, observability,
};

#[derive(Parser, Debug)]
#[command(name = "hadrian-sso", version, about = "SSO federation service")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the config file
    #[arg(short, long, global = true, default_value = "hadrian-sso.toml")]
    config: PathBuf,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the server (default)
    Serve,
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match SsoServiceConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            // Tracing is configured by the file we failed to read
            eprintln!("Failed to load config from {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let result = match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config).await,
        Command::Migrate => run_migrations(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run_migrations(config: SsoServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let db = DbPool::from_config(&config.database).await?;
    db.run_migrations().await?;
    Ok(())
}

async fn run_server(config: SsoServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        base_url = %config.server.base_url,
        "Starting SSO federation service"
    );

    if !config.session.secure {
        tracing::warn!(
            "session.secure is disabled; SSO cookies will be sent over plain HTTP. \
             Use this only for local development."
        );
    }

    let state = AppState::new(config.clone()).await?;

    tokio::spawn(jobs::start_session_cleanup_worker(
        state.services.sessions.clone(),
        config.session.cleanup_interval(),
    ));

    let app = build_app(&config, state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
