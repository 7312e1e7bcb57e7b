use super::api::{
    check_and_send, get_template, health_check, list_templates, put_template, remove_template,
    AppState,
};
use crate::config::WebConfig;
use crate::lifecycle::Dispatcher;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    let templates = dispatcher.templates();
    let state = Arc::new(AppState {
        dispatcher,
        templates,
    });

    Router::new()
        .route("/_/health", get(health_check))
        .route("/checkandsend", post(check_and_send))
        .route("/templates", get(list_templates))
        .route(
            "/templates/:id",
            get(get_template).put(put_template).delete(remove_template),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the trigger and template API until `shutdown_rx` flips to true
pub async fn run_server(
    dispatcher: Arc<Dispatcher>,
    web_config: WebConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let app = router(dispatcher);

    let listener = tokio::net::TcpListener::bind(&web_config.listen).await?;
    tracing::info!("Web server listening on {}", web_config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|&v| v).await;
            tracing::info!("Web server shutting down gracefully");
        })
        .await
}
