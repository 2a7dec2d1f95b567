//! Cluster node that joins the service registry in the role given by
//! `NODE_ROLE` and logs membership changes until Ctrl+C or SIGTERM.
//!
//! Run: REDIS_URL=redis://127.0.0.1:6379 NODE_ROLE=worker SERVER_PORT=8081 \
//!      cargo run -p service-registry --bin registry_node

use dotenv::dotenv;
use service_registry::{
    Backend, CoordinationStore, MemoryStore, MembershipEvent, NodeConfig, RedisStore,
    RoleTransitionHandler, ServiceRegistry,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    // JSON logs in production for log aggregation
    let is_production = std::env::var("NODE_ENV").unwrap_or_default() == "production";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if is_production {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match NodeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("\nConfiguration Error:\n{}\n", e);
            std::process::exit(1);
        }
    };

    init_tracing();
    tracing::info!(
        backend = %config.backend,
        role = %config.role,
        port = config.port,
        root = %config.registry_root,
        "Registry node starting"
    );

    // Keep the Redis handle around so shutdown can close the session
    let mut redis_session: Option<Arc<RedisStore>> = None;
    let (session, events): (Arc<dyn CoordinationStore>, _) = match config.backend {
        Backend::Redis => {
            let url = config.redis_url.as_deref().unwrap_or_default();
            let (store, events) =
                RedisStore::connect_with(url, config.key_prefix.as_deref(), config.session_ttl)
                    .await?;
            redis_session = Some(store.clone());
            (store as Arc<dyn CoordinationStore>, events)
        }
        Backend::Memory => {
            let (session, events) = MemoryStore::new().connect();
            (session as Arc<dyn CoordinationStore>, events)
        }
    };

    let registry = Arc::new(ServiceRegistry::with_root(session, &config.registry_root));
    if let Err(e) = registry.ensure_registry_exists().await {
        // Another node has most likely created it already
        tracing::warn!(error = %e, "Could not ensure registry root exists");
    }

    let cancel_token = CancellationToken::new();
    let watch_handle =
        ServiceRegistry::spawn_watch_task(registry.clone(), events, cancel_token.clone());

    let mut membership_rx = registry.membership_events();
    let events_cancel = cancel_token.clone();
    let events_registry = registry.clone();
    let events_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = events_cancel.cancelled() => break,
                event = membership_rx.recv() => match event {
                    Ok(MembershipEvent::Joined(address)) => {
                        tracing::info!(%address, "Member joined");
                    }
                    Ok(MembershipEvent::Left(address)) => {
                        tracing::info!(%address, "Member left");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Membership events lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
            if let Some(addresses) = events_registry.cached_addresses() {
                tracing::info!(count = addresses.len(), addresses = ?addresses, "Cluster membership");
            }
        }
    });

    let mut handler = RoleTransitionHandler::new(registry.clone(), config.port);
    if let Some(host) = &config.advertised_host {
        handler = handler.with_advertised_host(host.clone());
    }
    handler.apply(config.role).await;

    wait_for_shutdown_signal().await;

    // 1. Stop consuming notifications
    cancel_token.cancel();
    let _ = watch_handle.await;
    let _ = events_handle.await;

    // 2. Withdraw our advertisement
    if let Err(e) = registry.unregister().await {
        tracing::warn!(error = %e, "Failed to unregister during shutdown");
    }

    // 3. End the session (drops any remaining ephemeral nodes)
    if let Some(store) = redis_session {
        store.close().await?;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
