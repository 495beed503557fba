use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::counter::SlidingCounter;
use crate::http::{router, AppState};
use crate::store::JsonFileStore;

/// Open the counter, serve HTTP until SIGINT/SIGTERM, then shut down in order.
pub async fn run(config: AppConfig) -> Result<()> {
    let store = Arc::new(JsonFileStore::new(&config.storage.data_file));
    let counter = SlidingCounter::open(config.counter_config(), store.clone())
        .await
        .with_context(|| format!("loading persisted window from {}", store.path().display()))?;

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;

    serve(
        listener,
        Arc::new(counter),
        config.request_timeout(),
        Duration::from_secs(config.server.shutdown_timeout_secs),
        shutdown_signal(),
    )
    .await
}

/// Serve on `listener` until `signal` resolves.
///
/// Shutdown order: stop the HTTP listener and let open requests finish (up to
/// `shutdown_timeout`), close the counter so nothing new is admitted and accepted
/// requests drain, flush the final snapshot, close the store.
pub async fn serve<F>(
    listener: TcpListener,
    counter: Arc<SlidingCounter>,
    request_timeout: Duration,
    shutdown_timeout: Duration,
    signal: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    info!(addr = %listener.local_addr()?, "Listening");

    let app = router(AppState::new(Arc::clone(&counter), request_timeout));
    let stop_http = CancellationToken::new();
    let http_stopped = stop_http.clone();
    let mut http = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_stopped.cancelled().await })
            .await
    });

    let served = tokio::select! {
        _ = signal => {
            info!("Shutdown signal received");
            None
        }
        res = &mut http => Some(res),
    };

    let served = match served {
        Some(res) => res,
        None => {
            stop_http.cancel();
            match tokio::time::timeout(shutdown_timeout, &mut http).await {
                Ok(res) => res,
                Err(_) => {
                    warn!(
                        timeout_secs = shutdown_timeout.as_secs(),
                        "HTTP shutdown timeout reached, aborting open connections"
                    );
                    http.abort();
                    Ok(Ok(()))
                }
            }
        }
    };

    let flushed = counter.shutdown().await;
    if let Err(e) = &flushed {
        error!(error = %e, "Final snapshot failed");
    }

    served.context("HTTP server task failed")?.context("HTTP server failed")?;
    flushed.context("flushing final snapshot")?;
    info!("Server stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
