//! HTTP upgrade handler: turns an axum upgrade request into an admission.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Extension;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::header::{HOST, ORIGIN};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures::SinkExt;
use tracing::{debug, warn};

use super::callback::RequestMeta;
use super::manager::{Admission, WebSocketManager};
use super::transport::AxumTransport;

/// Upgrade handler for one endpoint. Mount with the endpoint's
/// [`WebSocketManager`] as router state.
pub async fn websocket_handler(
    State(manager): State<Arc<WebSocketManager>>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let config = manager.config();
    if config.check_origin && !origin_matches_host(&headers) {
        warn!(
            origin = ?headers.get(ORIGIN),
            host = ?headers.get(HOST),
            "websocket upgrade refused: cross-origin request"
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    let request = RequestMeta {
        peer_addr: connect_info.map(|Extension(ConnectInfo(addr))| addr),
        headers,
        query,
    };

    let mut upgrade = upgrade
        .read_buffer_size(config.read_buffer_size)
        .write_buffer_size(config.write_buffer_size)
        .max_message_size(config.max_message_size);
    if !config.subprotocols.is_empty() {
        upgrade = upgrade.protocols(config.subprotocols.clone());
    }

    upgrade
        .on_failed_upgrade(|err| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            let peer = request.peer_addr;
            if let Admission::Rejected(mut transport) =
                manager.admit(AxumTransport::new(socket), request).await
            {
                if let Err(err) = transport.close().await {
                    debug!(peer = ?peer, error = %err, "closing rejected websocket failed");
                }
            }
        })
}

/// Same-origin check: a request without `Origin` passes; otherwise the
/// origin's authority must equal the `Host` header, ignoring ASCII case.
pub fn origin_matches_host(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(ORIGIN) else {
        return true;
    };
    let Some(host) = headers.get(HOST).and_then(|h| h.to_str().ok()) else {
        return false;
    };
    origin
        .to_str()
        .ok()
        .and_then(|origin| origin.parse::<Uri>().ok())
        .and_then(|uri| uri.authority().map(|a| a.as_str().eq_ignore_ascii_case(host)))
        .unwrap_or(false)
}
