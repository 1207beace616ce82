//! `TetherServer` is the axum host for named WebSocket endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use tether_settings::TetherSettings;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::WebSocketConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::shutdown::{DEFAULT_SHUTDOWN_TIMEOUT, ShutdownCoordinator};
use crate::websocket::callback::WebSocketCallback;
use crate::websocket::manager::{WebSocketController, WebSocketManager};
use crate::websocket::upgrade::websocket_handler;

struct Endpoint {
    path: String,
    class: String,
    manager: Arc<WebSocketManager>,
}

#[derive(Clone)]
struct HealthState {
    start_time: Instant,
    endpoints: Arc<Vec<(String, WebSocketController)>>,
}

/// HTTP server hosting WebSocket endpoints and `/health`.
pub struct TetherServer {
    settings: TetherSettings,
    endpoints: Vec<Endpoint>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl TetherServer {
    /// Create a server with no endpoints.
    pub fn new(settings: TetherSettings) -> Self {
        Self {
            settings,
            endpoints: Vec::new(),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Mount `callback` at `path`, tuned by the `class` entry of the
    /// `websockets` settings.
    pub fn register_websocket<C: WebSocketCallback>(
        &mut self,
        path: &str,
        class: &str,
        callback: C,
    ) -> Result<WebSocketController, ServerError> {
        self.register_websocket_with(path, class, |_| callback)
    }

    /// Like [`TetherServer::register_websocket`], for callbacks that need
    /// the endpoint's own controller.
    pub fn register_websocket_with<C, F>(
        &mut self,
        path: &str,
        class: &str,
        build: F,
    ) -> Result<WebSocketController, ServerError>
    where
        C: WebSocketCallback,
        F: FnOnce(WebSocketController) -> C,
    {
        if self.endpoints.iter().any(|e| e.path == path) {
            return Err(ServerError::DuplicateRoute(path.to_owned()));
        }

        let config = WebSocketConfig::from_settings(&self.settings.websocket(class));
        info!(
            path,
            class,
            max_message_size = config.max_message_size,
            pong_wait_secs = config.pong_wait.as_secs(),
            "websocket endpoint registered"
        );
        let manager = Arc::new(WebSocketManager::new_cyclic(config, build));
        let controller = manager.controller();
        self.endpoints.push(Endpoint {
            path: path.to_owned(),
            class: class.to_owned(),
            manager,
        });
        Ok(controller)
    }

    /// Build the router: one upgrade route per endpoint plus `/health`.
    pub fn router(&self) -> Router {
        let health_state = HealthState {
            start_time: self.start_time,
            endpoints: Arc::new(
                self.endpoints
                    .iter()
                    .map(|e| (e.path.clone(), e.manager.controller()))
                    .collect(),
            ),
        };

        let mut app = Router::new()
            .route("/health", get(health_handler))
            .with_state(health_state);

        for endpoint in &self.endpoints {
            let route = Router::new()
                .route(&endpoint.path, get(websocket_handler))
                .with_state(Arc::clone(&endpoint.manager))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    endpoint.manager.config().handshake_timeout,
                ));
            app = app.merge(route);
        }

        app.layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve in the background. Returns
    /// the bound address; the serving task is tracked by the shutdown
    /// coordinator.
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        let addr = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        let bind_error = |source| ServerError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&addr).await.map_err(bind_error)?;
        let local = listener.local_addr().map_err(bind_error)?;

        let app = self.router();
        let token = self.shutdown.token();
        let endpoints: Vec<(String, WebSocketController)> = self
            .endpoints
            .iter()
            .map(|e| (e.path.clone(), e.manager.controller()))
            .collect();

        let signal = async move {
            token.cancelled().await;
            for (path, controller) in &endpoints {
                let closed = controller.close_all().await;
                info!(path = %path, closed, "websocket endpoint drained");
            }
        };

        self.shutdown.track(tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(err) = axum::serve(listener, service)
                .with_graceful_shutdown(signal)
                .await
            {
                error!(error = %err, "server terminated with error");
            }
            info!("server stopped");
        }));

        info!(addr = %local, endpoints = self.endpoints.len(), "tether server listening");
        Ok(local)
    }

    /// Signal shutdown and wait for the server to drain, bounded by the
    /// configured shutdown timeout.
    pub async fn shutdown_gracefully(&self) {
        let timeout = match self.settings.server.shutdown_timeout_secs {
            0 => DEFAULT_SHUTDOWN_TIMEOUT,
            secs => Duration::from_secs(secs),
        };
        self.shutdown.graceful_shutdown(timeout).await;
    }

    /// Controller of the endpoint mounted at `path`.
    pub fn endpoint(&self, path: &str) -> Option<WebSocketController> {
        self.endpoints
            .iter()
            .find(|e| e.path == path)
            .map(|e| e.manager.controller())
    }

    /// `(path, class)` of every registered endpoint.
    pub fn endpoints(&self) -> Vec<(&str, &str)> {
        self.endpoints
            .iter()
            .map(|e| (e.path.as_str(), e.class.as_str()))
            .collect()
    }

    /// Live connections across every endpoint.
    pub fn connection_count(&self) -> usize {
        self.endpoints
            .iter()
            .map(|e| e.manager.connection_count())
            .sum()
    }

    /// Loaded settings.
    pub fn settings(&self) -> &TetherSettings {
        &self.settings
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }
}

async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state
            .endpoints
            .iter()
            .map(|(path, controller)| (path.as_str(), controller.connection_count())),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingCallback;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tether_settings::WebSocketSettings;
    use tower::ServiceExt;

    fn make_server() -> TetherServer {
        TetherServer::new(TetherSettings::default())
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[tokio::test]
    async fn health_endpoint_reports_endpoints() {
        let mut server = make_server();
        let _ = server
            .register_websocket("/chat", "chat", RecordingCallback::new())
            .unwrap();

        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["endpoints"]["/chat"], 0);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let (status, _) = get_json(make_server().router(), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn plain_get_on_websocket_route_is_refused() {
        let mut server = make_server();
        let _ = server
            .register_websocket("/chat", "chat", RecordingCallback::new())
            .unwrap();

        let (status, _) = get_json(server.router(), "/chat").await;
        assert!(status.is_client_error());
        assert_ne!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn duplicate_path_is_rejected() {
        let mut server = make_server();
        let _ = server
            .register_websocket("/chat", "chat", RecordingCallback::new())
            .unwrap();
        let Err(err) = server.register_websocket("/chat", "other", RecordingCallback::new()) else {
            panic!("second registration of /chat succeeded");
        };
        assert!(matches!(err, ServerError::DuplicateRoute(ref p) if p == "/chat"));
        assert_eq!(server.endpoints(), vec![("/chat", "chat")]);
    }

    #[test]
    fn endpoint_class_selects_settings() {
        let mut settings = TetherSettings::default();
        let _ = settings.websockets.insert(
            "chat".into(),
            WebSocketSettings {
                max_message_size: Some(512),
                ..WebSocketSettings::default()
            },
        );
        let mut server = TetherServer::new(settings);
        let _ = server
            .register_websocket("/chat", "chat", RecordingCallback::new())
            .unwrap();
        let _ = server
            .register_websocket("/feed", "unknown", RecordingCallback::new())
            .unwrap();

        let max_sizes: Vec<usize> = server
            .endpoints
            .iter()
            .map(|e| e.manager.config().max_message_size)
            .collect();
        assert_eq!(max_sizes, vec![512, 2048]);
        assert_eq!(server.endpoints(), vec![("/chat", "chat"), ("/feed", "unknown")]);
        assert!(server.endpoint("/feed").is_some());
        assert!(server.endpoint("/nope").is_none());
    }

    #[tokio::test]
    async fn shutdown_stops_listener() {
        let mut settings = TetherSettings::default();
        settings.server.host = "127.0.0.1".into();
        settings.server.port = 0;
        let server = TetherServer::new(settings);

        let addr = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);

        server.shutdown_gracefully().await;
        assert!(server.shutdown().is_shutting_down());
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
