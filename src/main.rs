use std::future::ready;
use std::time::Duration;

use axum::routing::get;
use tokio::net::TcpListener;
use travel_board_auth::clock::{Clock, SystemClock};
use travel_board_auth::{AppState, app, initialize_state, telemetry};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Drop retired keys once their grace period is over, and refresh token
/// families nothing can use anymore.
fn spawn_purge(state: AppState) {
    tokio::spawn(async move {
        let clock = SystemClock::new();
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            state.keys.purge_expired(clock.now());
            metrics::gauge!("signing_keys")
                .set(state.keys.snapshot().iter().count() as f64);

            if let Err(err) = state.sessions.prune_families().await {
                tracing::warn!(%err, "cannot prune refresh token families");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "cannot listen for shutdown signal");
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() {
    telemetry::setup_tracing();

    let state = match initialize_state().await {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(%err, "cannot start server");
            std::process::exit(1);
        },
    };

    let handle = match telemetry::setup_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(%err, "prometheus recorder not installed");
            None
        },
    };

    spawn_purge(state.clone());

    let address = state.config.address.clone();
    let mut router = app(state);
    if let Some(handle) = handle {
        router = router.route("/metrics", get(move || ready(handle.render())));
    }

    let listener = match TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, %address, "cannot bind address");
            std::process::exit(1);
        },
    };
    tracing::info!(%address, "server started");

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(%err, "server stopped unexpectedly");
        std::process::exit(1);
    }
}
