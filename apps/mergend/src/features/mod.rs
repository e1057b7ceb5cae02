use axum::{Extension, Router};

use crate::AppState;

pub mod health;
pub mod vms;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(vms::router())
        .layer(Extension(state))
}
