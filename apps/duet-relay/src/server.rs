use std::future::Future;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::handlers::{
    create_session, delete_session, get_answer, get_offer, health_check, post_answer,
};
use crate::signaling::SignalingGateway;
use crate::store::{EphemeralStore, StoreError};

pub fn build_router(gateway: SignalingGateway) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/signaling/create", post(create_session))
        .route("/signaling/get", get(get_offer))
        .route("/signaling/answer", post(post_answer))
        .route("/signaling/get-answer", get(get_answer))
        .route("/signaling/delete", delete(delete_session))
        .with_state(gateway)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Picks the backend named by the configuration.
pub async fn open_store(config: &Config) -> Result<EphemeralStore, StoreError> {
    match &config.redis_url {
        Some(url) => EphemeralStore::redis(url).await,
        None => Ok(EphemeralStore::in_memory()),
    }
}

/// Serves the relay on `listener` until `shutdown` resolves. The memory
/// sweeper runs for as long as the server does.
pub async fn serve(
    listener: TcpListener,
    config: &Config,
    store: EphemeralStore,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let sweeper = store.spawn_sweeper(config.sweep_interval());
    let gateway = SignalingGateway::with_ttls(store, config.offer_ttl(), config.answer_ttl());
    let app = build_router(gateway);

    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "duet relay listening");
    }
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    sweeper.abort();
    result
}
