//! Main entry point for the chainwheel daemon.
//!
//! Boots the scheduler against the configured database and keeps it running
//! until a shutdown signal arrives. A dropped database connection triggers
//! reconnect, crash repair and a fresh scheduler run.

use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chainwheel::{Config, Database, RunStatus, Scheduler, TokioCommander};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_DB_ERROR: u8 = 2;
const EXIT_SCHEMA_ERROR: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chainwheel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration error");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    info!(
        client = %config.client_name,
        workers = config.cron_workers,
        "starting chainwheel"
    );

    let root = CancellationToken::new();
    spawn_signal_bridge(root.clone());

    let mut db = match Database::connect(
        &config.database_url,
        &config.client_name,
        config.max_pool_connections,
    )
    .await
    {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "database connection failed");
            return ExitCode::from(EXIT_DB_ERROR);
        }
    };

    if config.start_init || config.start_upgrade {
        if let Err(err) = db.init_schema().await {
            error!(error = %err, "schema bootstrap failed");
            return ExitCode::from(EXIT_SCHEMA_ERROR);
        }
    }

    if config.http_port > 0 {
        let token = root.clone();
        let client_name = config.client_name.clone();
        let port = config.http_port;
        tokio::spawn(async move {
            if let Err(err) = chainwheel::status::serve_status(port, client_name, token).await {
                error!(error = %err, "status endpoint failed");
            }
        });
    }

    loop {
        let scheduler = Scheduler::new(db.clone(), config.clone(), TokioCommander);
        match scheduler.run(&root).await {
            RunStatus::Shutdown => break,
            RunStatus::ConnectionDropped => {
                warn!("database connection dropped, reconnecting");
                db = match reconnect(&root, &config).await {
                    Some(db) => db,
                    None => break,
                };
            }
        }
    }

    info!("chainwheel stopped");
    ExitCode::from(EXIT_OK)
}

/// Retry the database connection until it succeeds or shutdown wins.
async fn reconnect(root: &CancellationToken, config: &Config) -> Option<Database> {
    loop {
        tokio::select! {
            biased;
            _ = root.cancelled() => return None,
            _ = tokio::time::sleep(config.lock_wait_time) => {}
        }
        match Database::connect(
            &config.database_url,
            &config.client_name,
            config.max_pool_connections,
        )
        .await
        {
            Ok(db) => return Some(db),
            Err(err) => error!(error = %err, "reconnect attempt failed"),
        }
    }
}

/// Translate SIGINT/SIGTERM into root-token cancellation.
fn spawn_signal_bridge(root: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = terminate.recv() => {}
                    }
                }
                Err(err) => {
                    error!(error = %err, "cannot install the SIGTERM handler");
                    let _ = ctrl_c.await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        root.cancel();
    });
}
