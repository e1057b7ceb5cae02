use axum::Router;

pub mod routes;
pub mod service;
pub mod store;

pub fn router() -> Router {
    routes::router()
}
