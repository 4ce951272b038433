//! API server using Axum

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::config::Config;
use crate::error::{Result, RotaError};
use crate::proxy::ProxyPool;
use crate::services::{NightWindow, ScreenSwitch};

use super::middleware::RequestLogging;
use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<ProxyPool>,
    pub screen: Arc<ScreenSwitch>,
    pub night_window: Option<NightWindow>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: &Config, pool: Arc<ProxyPool>) -> Self {
        Self {
            pool,
            screen: Arc::new(ScreenSwitch::load(&config.extras.screen_flag_path)),
            night_window: NightWindow::from_bounds(
                config.extras.night_transfer_start,
                config.extras.night_transfer_end,
            ),
            started_at: Instant::now(),
        }
    }
}

/// Control-plane server; the listener is bound up front
pub struct ApiServer {
    listener: TcpListener,
    state: AppState,
}

impl ApiServer {
    /// Bind the control listener
    ///
    /// A failure here is the one error that stops the process.
    pub async fn bind(config: &Config, state: AppState) -> Result<Self> {
        let addr = config.control_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| RotaError::ControlBind(format!("{}: {}", addr, e)))?;

        info!("Control API listening on {}", addr);
        Ok(Self { listener, state })
    }

    /// Build the router
    fn build_router(&self) -> Router {
        routes::create_router(self.state.clone())
            .layer(axum::middleware::from_fn(RequestLogging::log_request))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until shutdown is signalled
    #[instrument(skip(self, shutdown))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let router = self.build_router();

        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| RotaError::Internal(e.to_string()))?;

        info!("Control API shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::instance::tests::{test_context, ScriptedProbe};
    use crate::modem::StaticModemProvider;

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = Config::default();
        config.control.host = "127.0.0.1".to_string();
        config.control.port = taken.local_addr().unwrap().port();

        let (ctx, _shutdown) = test_context(
            config.clone(),
            Arc::new(StaticModemProvider::new()),
            Arc::new(ScriptedProbe::default()),
        );
        let pool = Arc::new(ProxyPool::new(ctx));
        let state = AppState::new(&config, pool);

        let err = ApiServer::bind(&config, state).await.err().unwrap();
        assert!(err.is_fatal());
    }
}
