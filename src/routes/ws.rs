use axum::{
    Router, routing::get, response::{IntoResponse, Response},
    extract::{ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade}, Query, Extension},
};
use serde::Deserialize;
use tracing::warn;
use crate::{config::Config, error::{AppErr, AppResult}, pump, state::SharedRegistry};

#[derive(Deserialize)] struct WsQuery { #[serde(default)] token: String }

pub fn router() -> Router {
    Router::new().route("/ws", get(ws_handler))
}

/* ---------------- check token, upgrade, then redeem ---------------- */
async fn ws_handler(
    Query(q): Query<WsQuery>,
    Extension(registry): Extension<SharedRegistry>,
    Extension(cfg): Extension<Config>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<Response> {
    if !registry.knows_token(&q.token).await {
        return Err(AppErr::Unauthorized);
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),   // token stays usable
    };
    let session = registry.redeem(&q.token).await?;

    // release the reserved name if the upgrade never completes
    let (room, member) = (session.room.clone(), session.member);
    let hb = cfg.heartbeat;
    Ok(ws
        .max_message_size(cfg.max_message_size)
        .on_failed_upgrade(move |e| {
            warn!(room = %room.name(), error = %e, "websocket upgrade failed");
            tokio::spawn(async move { room.detach(member).await });
        })
        .on_upgrade(move |socket| pump::serve(socket, session, hb)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RoomRegistry;
    use axum::{body::Body, http::{Request, StatusCode}};
    use std::{sync::Arc, time::Duration};
    use tower::ServiceExt;

    fn app(registry: &SharedRegistry) -> Router {
        router()
            .layer(Extension(registry.clone()))
            .layer(Extension(Config::default()))
    }

    fn upgrade_request(uri: &str) -> Request<Body> {
        Request::get(uri)
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_or_missing_token_is_unauthorized() {
        let registry: SharedRegistry = Arc::new(RoomRegistry::new(8));
        for uri in ["/ws", "/ws?token=", "/ws?token=deadbeef"] {
            let res = app(&registry).oneshot(upgrade_request(uri)).await.unwrap();
            assert_eq!(res.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
    }

    #[tokio::test]
    async fn plain_request_does_not_burn_the_token() {
        let registry: SharedRegistry = Arc::new(RoomRegistry::new(8));
        let token = registry.issue_token("standup", "alice").await.unwrap();

        let req = Request::get(format!("/ws?token={token}")).body(Body::empty()).unwrap();
        let res = app(&registry).oneshot(req).await.unwrap();
        assert_ne!(res.status(), StatusCode::UNAUTHORIZED);
        assert!(!res.status().is_success());
        assert!(registry.knows_token(&token).await);
    }

    #[tokio::test]
    async fn failed_upgrade_releases_the_name() {
        let registry: SharedRegistry = Arc::new(RoomRegistry::new(8));
        let token = registry.issue_token("standup", "alice").await.unwrap();

        // a connection hyper cannot actually upgrade
        let mut req = upgrade_request(&format!("/ws?token={token}"));
        let on_upgrade = hyper::upgrade::on(&mut req);
        req.extensions_mut().insert(on_upgrade);

        let res = app(&registry).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert!(!registry.knows_token(&token).await);

        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.room_has_member("standup", "alice").await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("name was never released");
    }
}
