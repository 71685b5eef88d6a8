//! API Server
//!
//! Assembles the access path (resolver, quota, gate) and the live relay
//! (registry, broadcaster, feed) from one [`GatewayConfig`] and serves them.

use super::{
    auth::{CredentialResolver, TierLimits},
    handlers::AppState,
    middleware::{create_cors_layer, request_id_middleware},
    quota::QuotaEnforcer,
    routes::create_router,
    security::AccessGate,
};
use crate::{
    clock::{Clock, SystemClock},
    config::GatewayConfig,
    errors::{ConfigError, GatewayResult},
    feed::{self, EventBroadcaster, SubscriptionRegistry},
    metrics::GatewayMetrics,
};
use axum::Router;
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

/// Fully wired application, before it is bound to a socket
pub struct GatewayApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub quota: Arc<QuotaEnforcer>,
    pub broadcaster: EventBroadcaster,
    pub metrics: Arc<GatewayMetrics>,
}

impl GatewayApp {
    pub fn build(config: &GatewayConfig, clock: Arc<dyn Clock>) -> Self {
        let metrics = Arc::new(GatewayMetrics::new());

        let limits = TierLimits::from(&config.rate_limit);
        let resolver = Arc::new(CredentialResolver::new(&config.auth, limits));
        let quota = Arc::new(QuotaEnforcer::new(config.rate_limit.window(), clock));
        let gate = AccessGate::new(resolver, Arc::clone(&quota), Arc::clone(&metrics))
            .trust_forwarded_headers(config.rate_limit.trust_forwarded_headers);

        let registry = Arc::new(SubscriptionRegistry::new(
            config.live.subscriber_buffer,
            config.live.max_subscribers,
            Arc::clone(&metrics),
        ));
        let broadcaster = EventBroadcaster::new(Arc::clone(&registry), Arc::clone(&metrics));

        let state = Arc::new(AppState::new(
            config.rate_limit.window_seconds,
            Arc::clone(&metrics),
            registry,
        ));

        let router = create_router(
            Arc::clone(&state),
            gate,
            &config.rate_limit.auth_required_groups,
        )
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(create_cors_layer(&config.server.allowed_origins))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.request_timeout_secs,
        )))
        .layer(TraceLayer::new_for_http());

        Self {
            router,
            state,
            quota,
            broadcaster,
            metrics,
        }
    }
}

pub struct ApiServer {
    config: GatewayConfig,
    clock: Arc<dyn Clock>,
}

impl ApiServer {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bind the configured address and serve until Ctrl+C / SIGTERM.
    pub async fn run(self) -> GatewayResult<()> {
        let addr = self.socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = GatewayApp::build(&self.config, Arc::clone(&self.clock));

        let sweeper = QuotaEnforcer::start_sweep_task(
            Arc::clone(&app.quota),
            self.config.rate_limit.sweep_interval(),
        );

        let feed = feed::start_feed(
            &self.config.feed,
            app.broadcaster.clone(),
            Arc::clone(&app.metrics),
        )
        .await;
        app.state.set_feed_enabled(feed.is_some());

        self.log_server_info(listener.local_addr()?, feed.is_some());

        axum::serve(
            listener,
            app.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        sweeper.abort();
        if let Some(feed) = feed {
            feed.abort();
        }
        info!("🛑 Gateway stopped gracefully");
        Ok(())
    }

    fn socket_addr(&self) -> GatewayResult<SocketAddr> {
        let ip = self
            .config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .map_err(|e| ConfigError::InvalidValue {
                field: "server.host".to_string(),
                value: self.config.server.host.clone(),
                reason: e.to_string(),
            })?;
        Ok(SocketAddr::from((ip, self.config.server.port)))
    }

    fn log_server_info(&self, addr: SocketAddr, feed_enabled: bool) {
        let rate = &self.config.rate_limit;
        info!("✅ bchgate listening on http://{}", addr);
        info!(
            "   Window: {}s (anonymous {}, basic {}, max {})",
            rate.window_seconds,
            rate.anonymous_requests,
            rate.basic_requests,
            rate.max_requests_per_window
        );
        if !rate.auth_required_groups.is_empty() {
            info!("   Credentials required for: {:?}", rate.auth_required_groups);
        }
        info!(
            "   Live feed: {}",
            if feed_enabled { "enabled" } else { "disabled" }
        );
    }
}

/// Wait for shutdown signal
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
