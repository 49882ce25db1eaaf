mod config;
mod error;
mod protocol;
mod pump;
mod room;
mod state;
mod utils {
    pub mod clean;
    pub mod token;
}
mod routes;

use std::sync::Arc;
use axum::{Router, Extension};
use tower_http::{
    limit::RequestBodyLimitLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::info;
use crate::config::Config;
use crate::state::{RoomRegistry, SharedRegistry};
use crate::utils::clean;
use error::AppErr;

const BODY_LIMIT: usize = 16 * 1024;

#[tokio::main]
async fn main() -> Result<(), AppErr> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().init();

    let config = Config::from_env()?;
    let registry: SharedRegistry = Arc::new(RoomRegistry::new(config.outbound_capacity));

    tokio::spawn(clean::task(registry.clone(), config.token_ttl));  // expire unredeemed tokens

    let app = Router::new()
        .route_service("/", ServeFile::new(config.static_dir.join("index.html")))
        .nest_service("/static", ServeDir::new(&config.static_dir))
        .merge(routes::router())
        .layer(Extension(registry))
        .layer(Extension(config.clone()))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
