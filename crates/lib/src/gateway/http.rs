//! HTTP transport: each request becomes one get/set envelope sent through the HTTP manager.

use crate::gateway::server::GatewayState;
use crate::hub::HubError;
use crate::session::{build_http_request, error_body, run_http_session, unsupported_method_body};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CONTENT_LENGTH,
    CONTENT_TYPE, UPGRADE,
};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;

pub fn router(state: GatewayState) -> Router {
    Router::new().fallback(handle_http).with_state(state)
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Response with the CORS headers and explicit length every HTTP reply carries.
fn client_response(status: StatusCode, content_type: &'static str, body: String) -> Response {
    let len = body.len();
    Response::builder()
        .status(status)
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(ACCESS_CONTROL_ALLOW_HEADERS, "*")
        .header(CONTENT_TYPE, content_type)
        .header(CONTENT_LENGTH, len)
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn json_response(status: StatusCode, body: String) -> Response {
    client_response(status, "application/json", body)
}

async fn handle_http(
    State(state): State<GatewayState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if is_websocket_upgrade(&headers) {
        log::warn!("websocket upgrade attempted on the http port");
        return client_response(
            StatusCode::BAD_REQUEST,
            "text/plain; charset=utf-8",
            "400 Incorrect port number".to_string(),
        );
    }

    let raw_uri = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let token = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    log::info!("HTTP method: {}, path: {}", method, raw_uri);

    let envelope =
        match build_http_request(&method, raw_uri, token, &body, state.request_ids.next()) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("{}", e);
                return json_response(StatusCode::BAD_REQUEST, unsupported_method_body());
            }
        };

    match run_http_session(&state.http_pool, &envelope).await {
        Ok(response) => {
            log::debug!("http response: {}", response);
            json_response(StatusCode::OK, response)
        }
        Err(e @ HubError::PoolExhausted { .. }) => {
            log::error!("not possible to start more http sessions: {}", e);
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                error_body("503", "Service unavailable", "Too many concurrent sessions"),
            )
        }
        Err(HubError::Routing(e)) => {
            log::warn!("http request rejected: {}", e);
            json_response(
                StatusCode::BAD_REQUEST,
                error_body("400", "Bad request", &e.to_string()),
            )
        }
        Err(e) => {
            log::error!("http request failed: {}", e);
            json_response(
                StatusCode::BAD_GATEWAY,
                error_body("502", "Bad gateway", "Server core unavailable"),
            )
        }
    }
}
