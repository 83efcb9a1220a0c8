//! WebSocket transport: handshake, subprotocol negotiation, then a long-lived session.

use crate::compression::{negotiate, offered_subprotocols};
use crate::gateway::server::GatewayState;
use crate::session::{error_body, run_ws_session};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::header::{CONTENT_TYPE, SEC_WEBSOCKET_PROTOCOL};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;

pub fn router(state: GatewayState) -> Router {
    Router::new().fallback(handle_ws).with_state(state)
}

fn refuse(status: StatusCode, body: String) -> Response {
    (status, [(CONTENT_TYPE, "application/json")], body).into_response()
}

async fn handle_ws(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => {
            log::error!("client must set up a websocket session: {}", rejection);
            return refuse(
                StatusCode::BAD_REQUEST,
                error_body("400", "Bad request", "WebSocket upgrade required"),
            );
        }
    };

    let link = match state.ws_pool.open_session() {
        Ok(link) => link,
        Err(e) => {
            log::error!("not possible to start more app client sessions: {}", e);
            return refuse(
                StatusCode::SERVICE_UNAVAILABLE,
                error_body("503", "Service unavailable", "Too many concurrent sessions"),
            );
        }
    };

    let offered = offered_subprotocols(&headers);
    let negotiated = negotiate(&offered, state.path_list.as_ref());
    log::info!(
        "client {} upgrading, offered {:?}, selected {:?}",
        link.client_id(),
        offered,
        negotiated.subprotocol
    );

    let codec = state.codec.clone();
    let buffer = state.config.hub.channel_buffer;
    let mode = negotiated.mode;
    let mut response = ws
        .on_failed_upgrade(|e: axum::Error| log::error!("websocket upgrade failed: {}", e))
        .on_upgrade(move |socket| run_ws_session(socket, link, mode, codec, buffer));
    if let Some(sub) = negotiated.subprotocol {
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(sub));
    }
    response
}
