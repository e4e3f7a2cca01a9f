//! The application root: construct every component once, wire them
//! together by constructor injection, spawn the long-lived tasks, and
//! join them until shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tollgate_api::server::{spawn_server_task, LayerConfig};
use tollgate_common::{
    shutdown::Shutdown,
    task::{self, NamedTask},
};
use tracing::{error, info};

use crate::{
    admin::AdminOps,
    auth::Authenticator,
    cache::EntitlementCache,
    config::Config,
    db::Store,
    entitlements::EntitlementEngine,
    ingest::Ingestor,
    provider::{ProviderApi, ProviderClient},
    reconciler::Reconciler,
    server::{router, RouterState},
};

/// How long tasks get to drain after the shutdown signal before they are
/// reported as hung.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct App {
    tasks: Vec<NamedTask<()>>,
    shutdown: Shutdown,
}

impl App {
    /// Builds the full object graph and spawns the long-lived tasks: the
    /// API server, the signal listener, and (if enabled) the reconciler.
    pub async fn init(config: &Config) -> anyhow::Result<Self> {
        info!("Starting tollgate: {config:?}");
        let shutdown = Shutdown::new();

        let store = Store::connect(config).await?;
        let cache =
            EntitlementCache::connect(&config.cache_url, config.cache_ttl)
                .await?;
        let engine = EntitlementEngine::new(
            store.clone(),
            cache,
            config.past_due_grace,
        );

        let state = Arc::new(RouterState {
            store: store.clone(),
            auth: Authenticator::new(store.clone(), &config.admin_token),
            engine: engine.clone(),
            ingest: Ingestor::new(
                store.clone(),
                engine.clone(),
                config.webhook_signing_secret.as_bytes(),
                config.webhook_skew_tolerance,
            ),
            admin: AdminOps::new(store.clone(), engine.clone()),
        });

        let listener = std::net::TcpListener::bind(config.bind_addr)
            .with_context(|| format!("Could not bind {}", config.bind_addr))?;
        let (server_task, server_addr) = spawn_server_task(
            listener,
            router(state),
            LayerConfig::default(),
            "api-server",
            shutdown.clone(),
        )?;
        info!("API server listening on {server_addr}");

        let mut tasks =
            vec![server_task, spawn_signal_listener(shutdown.clone())];

        if config.reconcile_enabled {
            let provider: Arc<dyn ProviderApi> =
                Arc::new(ProviderClient::new(config)?);
            let reconciler = Reconciler::new(
                store,
                engine,
                provider,
                config.reconcile_hour_utc,
                config.reconcile_lookback,
            );
            tasks.push(reconciler.spawn(shutdown.clone()));
        } else {
            info!("Reconciler disabled on this replica");
        }

        Ok(Self { tasks, shutdown })
    }

    /// Runs until a shutdown signal, then drains all tasks.
    pub async fn run(self) -> anyhow::Result<()> {
        task::try_join_until_shutdown(
            self.tasks,
            self.shutdown,
            SHUTDOWN_TIMEOUT,
        )
        .await
        .map_err(anyhow::Error::from)
    }
}

/// Translates SIGINT / SIGTERM into a shutdown trigger carrying the
/// signal name as the cause.
fn spawn_signal_listener(shutdown: Shutdown) -> NamedTask<()> {
    NamedTask::spawn("signal-listener", async move {
        let sigterm = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(err) => {
                    error!("Could not install SIGTERM handler: {err}");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => shutdown.trigger("SIGINT"),
                Err(err) =>
                    shutdown.trigger(format!("SIGINT listener failed: {err}")),
            },
            () = sigterm => shutdown.trigger("SIGTERM"),
        }
    })
}
