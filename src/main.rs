//! Loyalty-bonus gateway entry point: loads configuration, applies
//! migrations, wires the ledger store, the accrual controller, and the
//! ingress HTTP server, then waits for SIGINT/SIGTERM (spec.md §6, "process
//! lifecycle").

use std::sync::Arc;

use bonusbridge::accrual::{Controller, ReqwestAccrualClient};
use bonusbridge::config::Config;
use bonusbridge::handlers::{router, AppState};
use bonusbridge::store::LedgerStore;
use bonusbridge::store_postgres::PostgresStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    tracing::info!(address = %config.run_address, "starting bonusbridge");

    let store = PostgresStore::connect(&config.database_uri).await?;
    store.run_migrations().await?;
    let store: Arc<dyn LedgerStore> = Arc::new(store);

    let client = Arc::new(ReqwestAccrualClient::default());
    let controller = Controller::new(
        store.clone(),
        client,
        config.accrual_system_address.clone(),
        config.accrual_poll_interval,
        config.worker_count,
    );
    let controller_cancel = controller.cancellation_token();
    let (poller, updater) = controller.run();

    let state = AppState { store, config: Arc::new(config.clone()) };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.run_address).await?;
    tracing::info!(address = %config.run_address, "listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("HTTP server drained, stopping accrual controller");
    controller_cancel.cancel();
    let _ = tokio::join!(poller, updater);

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
