use axum::Router;

pub mod auth;
pub mod ws;

pub fn router() -> Router {
    Router::new()
        .merge(auth::router())
        .merge(ws::router())
}
