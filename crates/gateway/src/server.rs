use std::{sync::Arc, time::Instant};

use {
    axum::{
        Router,
        extract::{Query, Request, State},
        http::{HeaderMap, StatusCode, header},
        middleware::{self, Next},
        response::{IntoResponse, Json, Response},
        routing::get,
    },
    serde::Deserialize,
    serde_json::json,
    subtle::ConstantTimeEq,
    tokio::net::TcpListener,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::{accounts::ChannelManager, health::health_report};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ChannelManager>,
    /// Bearer token guarding everything but `/health`. `None` disables auth.
    pub token: Option<Arc<str>>,
    pub started_at: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(manager: Arc<ChannelManager>, token: Option<String>) -> Self {
        Self {
            manager,
            token: token.filter(|t| !t.is_empty()).map(Arc::from),
            started_at: Instant::now(),
        }
    }
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/channels", get(channels_handler))
        .route("/channels/health", get(channels_health_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health_handler))
        .merge(protected)
        .with_state(state)
}

/// Serve until `shutdown` fires, then drain in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, auth = state.token.is_some(), "gateway listening");
    }
    let app = build_gateway_app(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

// ── Auth ─────────────────────────────────────────────────────────────────────

fn bearer_matches(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token.trim().as_bytes().ct_eq(expected.as_bytes()).into())
}

async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.token.as_deref() else {
        return next.run(request).await;
    };
    if bearer_matches(request.headers(), expected) {
        return next.run(request).await;
    }
    warn!(path = %request.uri().path(), "rejected request without valid bearer token");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "missing or invalid bearer token" })),
    )
        .into_response()
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "pid": std::process::id(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "accounts": state.manager.account_keys().len(),
    }))
}

async fn channels_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshots = state.manager.snapshots();
    let channels: Vec<_> = state
        .manager
        .registry()
        .iter()
        .map(|plugin| {
            let accounts: Vec<_> = snapshots
                .iter()
                .filter(|s| s.channel == plugin.id())
                .collect();
            json!({
                "meta": plugin.meta,
                "capabilities": plugin.capabilities,
                "groups": plugin.adapter_groups(),
                "accounts": accounts,
            })
        })
        .collect();
    Json(json!({ "channels": channels }))
}

#[derive(Debug, Default, Deserialize)]
struct HealthQuery {
    #[serde(default)]
    probe: bool,
}

async fn channels_health_handler(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
) -> impl IntoResponse {
    let report = health_report(&state.manager, query.probe).await;
    let status = if report.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::log_channel::{LOG_CHANNEL_ID, log_channel_plugin},
        axum::http::HeaderValue,
        switchboard_channels::ChannelRegistry,
        switchboard_config::SwitchboardConfig,
        tokio::io::{AsyncReadExt, AsyncWriteExt},
    };

    #[test]
    fn bearer_must_match_exactly() {
        let mut headers = HeaderMap::new();
        assert!(!bearer_matches(&headers, "secret"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert!(!bearer_matches(&headers, "secret"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic secret"));
        assert!(!bearer_matches(&headers, "secret"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secre"));
        assert!(!bearer_matches(&headers, "secret"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secrets"));
        assert!(!bearer_matches(&headers, "secret"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert!(bearer_matches(&headers, "secret"));
    }

    async fn get(addr: std::net::SocketAddr, path: &str, token: Option<&str>) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let auth = token
            .map(|t| format!("Authorization: Bearer {t}\r\n"))
            .unwrap_or_default();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{auth}Connection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn health_is_public_and_channels_need_the_token() {
        let mut registry = ChannelRegistry::new();
        registry.register(log_channel_plugin());
        let mut cfg = SwitchboardConfig::default();
        cfg.channels.insert(LOG_CHANNEL_ID.into(), json!({}));
        let manager = Arc::new(ChannelManager::new(registry, cfg));
        manager.refresh().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(
            listener,
            AppState::new(manager, Some("secret".into())),
            shutdown.clone(),
        ));

        let health = get(addr, "/health", None).await;
        assert!(health.starts_with("HTTP/1.1 200"), "{health}");
        assert!(health.contains("\"status\":\"ok\""));

        let denied = get(addr, "/channels", None).await;
        assert!(denied.starts_with("HTTP/1.1 401"), "{denied}");

        let channels = get(addr, "/channels", Some("secret")).await;
        assert!(channels.starts_with("HTTP/1.1 200"), "{channels}");
        assert!(channels.contains("\"accountId\":\"default\""));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
