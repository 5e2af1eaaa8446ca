//! HTTP API.

mod binary_cache;

#[cfg(test)]
mod tests;

use axum::{extract::Extension, routing::get, Router};

use crate::State;

async fn get_metrics(Extension(state): Extension<State>) -> String {
    state.metrics.render()
}

pub(crate) fn get_router() -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .merge(binary_cache::get_router())
}
