use std::{net::SocketAddr, sync::Arc};

use {
    anyhow::Context,
    axum::{
        Router,
        extract::{ConnectInfo, Query, State, WebSocketUpgrade},
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::get,
    },
    serde::Deserialize,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

use {
    duet_config::DuetConfig,
    duet_protocol::PROTOCOL_VERSION,
    duet_store::{SqliteConversationStore, SqliteUserDirectory},
};

use crate::{
    auth::{SessionAuthenticator, credential_from_request},
    methods::MethodRegistry,
    presence::spawn_presence_announcer,
    state::{GatewaySettings, GatewayState},
    ws::handle_connection,
};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct AppState {
    gateway: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    authenticator: Arc<SessionAuthenticator>,
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    authenticator: Arc<SessionAuthenticator>,
) -> Router {
    let app_state = AppState {
        gateway: state,
        methods,
        authenticator,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Open storage and assemble the shared state. Fails on an invalid config
/// (including a missing secret) before anything is bound.
pub async fn prepare_gateway(
    config: &DuetConfig,
) -> anyhow::Result<(Arc<GatewayState>, Arc<MethodRegistry>, Arc<SessionAuthenticator>)> {
    config.validate().context("invalid configuration")?;
    let authenticator = Arc::new(SessionAuthenticator::from_config(&config.auth)?);

    let pool = duet_store::connect(&config.storage.database_url, config.storage.max_connections)
        .await
        .with_context(|| format!("failed to open {}", config.storage.database_url))?;

    let state = GatewayState::new(
        GatewaySettings::from_config(config),
        Arc::new(SqliteConversationStore::new(pool.clone())),
        Arc::new(SqliteUserDirectory::new(pool)),
    );
    Ok((state, Arc::new(MethodRegistry::new()), authenticator))
}

/// Start the gateway HTTP + WebSocket server.
pub async fn start_gateway(config: DuetConfig) -> anyhow::Result<()> {
    let (state, methods, authenticator) = prepare_gateway(&config).await?;
    let app = build_gateway_app(Arc::clone(&state), Arc::clone(&methods), authenticator);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    // Startup banner.
    let lines = [
        format!("duet gateway v{}", state.version),
        format!("protocol v{PROTOCOL_VERSION}, listening on {addr}"),
        format!("{} intents registered", methods.method_names().len()),
        format!("storage: {}", config.storage.database_url),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    spawn_presence_announcer(Arc::clone(&state));

    // Run the server with ConnectInfo for remote IP extraction.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let count = state.gateway.client_count().await;
    let online = state.gateway.presence.len().await;
    let channels = state.gateway.rooms.channel_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "version": state.gateway.version,
        "protocol": PROTOCOL_VERSION,
        "connections": count,
        "online": online,
        "channels": channels,
    }))
}

#[derive(Debug, Deserialize)]
struct UpgradeQuery {
    token: Option<String>,
}

/// Authenticate the handshake, then upgrade. A rejected credential never
/// reaches the WebSocket state machine.
async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<UpgradeQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let credential = credential_from_request(query.token, &headers);
    let identity = match state.authenticator.authenticate(credential.as_deref()) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(remote = %addr, "connection refused: unauthenticated");
            return (StatusCode::UNAUTHORIZED, Json(e.to_error_shape())).into_response();
        },
    };

    let max_frame = state.gateway.settings.max_frame_bytes;
    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| {
            handle_connection(socket, state.gateway, state.methods, identity, addr)
        })
        .into_response()
}
