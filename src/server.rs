use anyhow::{Context, Result};
use axum::{extract::State, response::Html, routing::get, Router};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Reads the page once; the server answers every request from memory.
pub fn load_template(path: impl AsRef<Path>) -> Result<Arc<String>> {
    let path = path.as_ref();
    let page = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read template {}", path.display()))?;
    Ok(Arc::new(page))
}

pub fn router(page: Arc<String>) -> Router {
    Router::new().route("/", get(home)).with_state(page)
}

async fn home(State(page): State<Arc<String>>) -> Html<String> {
    Html(page.as_str().to_owned())
}

pub async fn serve(page: Arc<String>, address: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!(address = %listener.local_addr()?, "serving the drawing page");
    axum::serve(listener, router(page))
        .await
        .context("page server stopped")
}
