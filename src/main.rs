//! Watch room bridge entrypoint: wires the room session to a document store
//! and exposes it to the browser over REST and SSE.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use watch_room::{
    config::AppConfig,
    dao::store::{DocumentStore, MemoryStore},
    routes,
    services::{events::RoomEvents, session::RoomSession, storage_monitor},
    state::{
        AppState, SharedState, SyncContext, clock::SystemClock, identity::IdentityProvider,
        room_link::room_id_from_url,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let store = open_store().await;

    let context = SyncContext::new(
        store,
        IdentityProvider::new(None),
        Arc::new(SystemClock),
        RoomEvents::default(),
        config.sync.clone(),
    );
    let session = RoomSession::new(context, config.page_url.clone());
    session.start().await;

    if let Some(room_id) = room_id_from_url(&config.page_url) {
        // Shared links open straight into their room.
        if let Err(err) = session.join(&room_id).await {
            warn!(room_id = %room_id, error = %err, "could not join room from page link");
        }
    }

    let app_state = AppState::new(session.clone());
    tokio::spawn(storage_monitor::run(app_state.clone()));
    let app = build_router(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting watch room bridge");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    session.shutdown().await;
    info!("watch room bridge stopped");
    Ok(())
}

/// Pick the document store named by `STORE_BACKEND` (`memory` or `couch`).
async fn open_store() -> Arc<dyn DocumentStore> {
    let backend = env::var("STORE_BACKEND").unwrap_or_else(|_| "memory".into());
    match backend.as_str() {
        "couch" => open_couch_store().await,
        "memory" => {
            info!("using in-memory document store");
            Arc::new(MemoryStore::default())
        }
        other => {
            warn!(backend = other, "unknown STORE_BACKEND; using in-memory document store");
            Arc::new(MemoryStore::default())
        }
    }
}

#[cfg(feature = "couch-store")]
async fn open_couch_store() -> Arc<dyn DocumentStore> {
    use watch_room::dao::{
        storage::StorageError,
        store::couchdb::{CouchConfig, CouchStore},
    };

    storage_monitor::connect_with_retry(|| async {
        let config = CouchConfig::from_env().map_err(StorageError::from)?;
        let store = CouchStore::connect(config).await?;
        Ok::<_, StorageError>(Arc::new(store) as Arc<dyn DocumentStore>)
    })
    .await
}

#[cfg(not(feature = "couch-store"))]
async fn open_couch_store() -> Arc<dyn DocumentStore> {
    warn!("built without the couch-store feature; using in-memory document store");
    Arc::new(MemoryStore::default())
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
