//! Asset Chat - portfolio assistant conversation service
//!
//! Hosts one conversation manager and exposes it over HTTP so a display
//! layer can render the transcript and issue commands.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use asset_chat::config::{Config, StoreKind};
use asset_chat::core::{
    ConversationManager, FileStore, InMemoryStore, PersistenceAdapter, SnapshotStore, SqliteStore,
};
use asset_chat::providers::HttpBackend;
use asset_chat::{routes, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "asset_chat=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let assistant = config.assistant()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    // Initialize conversation storage
    let location = assistant.persistence.location(&config.data_dir);
    let store: Arc<dyn SnapshotStore> = match assistant.persistence.store {
        StoreKind::Sqlite => Arc::new(SqliteStore::new(&location).await?),
        StoreKind::File => Arc::new(FileStore::new(location.clone())),
        StoreKind::Memory => Arc::new(InMemoryStore::new()),
    };
    tracing::info!(
        store = ?assistant.persistence.store,
        location = %location.display(),
        "Conversation storage ready"
    );

    // Initialize assistant backend
    let mut http_config = assistant.backend.http_config();
    if http_config.api_key.is_none() {
        http_config.api_key = config.api_key.clone();
    }
    tracing::info!(url = %http_config.base_url, "Streaming from assistant backend");
    let backend = Arc::new(HttpBackend::new(http_config)?);

    let persistence = PersistenceAdapter::new(store, assistant.persistence.key.clone());
    let manager = Arc::new(
        ConversationManager::new(
            backend,
            persistence,
            assistant.conversation.manager_settings(),
        )
        .await,
    );

    let state = AppState {
        manager: manager.clone(),
    };

    let app = Router::new()
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("Asset Chat API running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    manager.dispose();
    Ok(())
}
