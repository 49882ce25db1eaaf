//! routes/auth.rs
use axum::{
    routing::post,
    extract::{rejection::JsonRejection, Extension, Json},
    Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{bad, AppErr, AppResult},
    state::{SharedRegistry, NAME_TAKEN},
};

#[derive(Deserialize)]
struct AuthInput {
    room: String,
    name: String,
}

#[derive(Serialize)]
struct TokenJson {
    token: String,
}

pub fn router() -> Router {
    Router::new().route("/auth", post(auth))
}

/* ---------------- Auth: reserve a name, hand out a token ---------------- */
async fn auth(
    Extension(registry): Extension<SharedRegistry>,
    payload: Result<Json<AuthInput>, JsonRejection>,
) -> AppResult<Json<TokenJson>> {
    let Json(p) = payload.map_err(bad)?;
    if p.room.is_empty() || p.name.is_empty() {
        return Err(AppErr::Bad("room and name are required".into()));
    }

    if registry.room_has_member(&p.room, &p.name).await {
        return Err(AppErr::Conflict(NAME_TAKEN.into()));
    }
    let token = registry.issue_token(&p.room, &p.name).await?;
    Ok(Json(TokenJson { token }))
}
