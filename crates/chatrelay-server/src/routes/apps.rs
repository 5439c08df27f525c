//! App registry listing.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use super::{blocking, ApiError};
use crate::state::AppState;
use chatrelay_core::AppSummary;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/apps", get(list_apps))
}

/// GET /api/apps: registered apps, credentials omitted.
async fn list_apps(State(state): State<Arc<AppState>>) -> Result<Json<Vec<AppSummary>>, ApiError> {
    let store = state.store.clone();
    let apps = blocking(move || store.list_apps()).await?;
    Ok(Json(apps))
}
