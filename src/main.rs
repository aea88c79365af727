// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::{env, error::Error, net::SocketAddr};

use relational_auth::{
    api::router,
    config::{bind_address, database_path, AuthSettings, LOG_FORMAT_ENV},
    purge::UnverifiedPurger,
    state::AppState,
    storage::AuthDatabase,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug";

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let json = env::var(LOG_FORMAT_ENV).is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    init_tracing();

    let settings = AuthSettings::from_env()?;
    let missing = settings.missing_secrets();
    if !missing.is_empty() {
        error!(missing = ?missing, "Refusing to start without token secrets");
        return Err(format!("missing required secrets: {}", missing.join(", ")).into());
    }

    let db_path = database_path();
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let database = AuthDatabase::open(&db_path)?;
    info!(path = %db_path.display(), "Opened auth database");

    let state = AppState::from_database(database, settings);
    let shutdown = CancellationToken::new();

    let purger = UnverifiedPurger::new(state.gate.clone());
    let purger_handle = tokio::spawn(purger.run(shutdown.clone()));

    let app = router(state);
    let addr = bind_address();
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Relational Auth server listening (docs at /docs)");

    let server_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for shutdown signal");
                }
            }
            _ = server_shutdown.cancelled() => {}
        }
        info!("Gracefully shutting down");
        server_shutdown.cancel();
    })
    .await?;

    shutdown.cancel();
    if let Err(e) = purger_handle.await {
        warn!(error = %e, "Purger task ended abnormally");
    }
    Ok(())
}
