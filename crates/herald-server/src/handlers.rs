//! Connection handlers for Herald server.
//!
//! This module wires the dispatcher to axum: it owns the shared state,
//! builds the router and pumps frames between each WebSocket and its
//! connection handle.

use crate::api;
use crate::config::{Config, ReplicationMode};
use crate::metrics::{self, MetricsHook};
use crate::tasks;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tenvis_herald_core::{
    AppProvider, ChannelManager, ConfigAppProvider, ConnectionRegistry, Dispatcher,
    DispatcherConfig, LocalChannelManager, LoggingHook, ManagerConfig, MemoryStatisticsStore,
    OpenRequest, Outbound, ReplicatedChannelManager, ReplicationConfig, StatisticsCollector,
    StatisticsStore,
};
use tenvis_herald_transport::{RedisBus, RedisConfig};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The protocol dispatcher, which owns apps, channels and statistics.
    pub dispatcher: Dispatcher,
    /// Flushed statistics.
    pub store: Arc<dyn StatisticsStore>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state around a channel manager.
    #[must_use]
    pub fn new(config: Config, manager: Arc<dyn ChannelManager>) -> Self {
        let apps: Arc<dyn AppProvider> = Arc::new(ConfigAppProvider::new(config.apps.clone()));
        let statistics = Arc::new(StatisticsCollector::new(Arc::clone(&apps)));
        let dispatcher_config = DispatcherConfig {
            activity_timeout: config.heartbeat.activity_timeout_secs,
            max_message_size: config.limits.max_message_size,
        };

        let dispatcher = Dispatcher::new(apps, manager, statistics, dispatcher_config)
            .with_hook(Arc::new(LoggingHook::new(false)))
            .with_hook(Arc::new(MetricsHook));

        Self {
            dispatcher,
            store: Arc::new(MemoryStatisticsStore::with_max_records(config.statistics.max_records)),
            config,
        }
    }
}

/// Build the channel manager selected by the configuration.
///
/// # Errors
///
/// Returns an error if the replication bus cannot be reached.
pub async fn build_manager(config: &Config) -> Result<Arc<dyn ChannelManager>> {
    let local = LocalChannelManager::with_config(
        Arc::new(ConnectionRegistry::new()),
        ManagerConfig {
            max_channels: config.limits.max_channels,
            max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
        },
    );

    match config.replication.mode {
        ReplicationMode::Local => Ok(Arc::new(local)),
        ReplicationMode::Redis => {
            let bus = RedisBus::connect(RedisConfig {
                url: config.replication.redis_url.clone(),
                ..RedisConfig::default()
            })
            .await
            .context("Failed to connect to Redis")?;

            let manager = Arc::new(ReplicatedChannelManager::new(
                local,
                Arc::new(bus),
                ReplicationConfig {
                    prefix: config.replication.prefix.clone(),
                    request_timeout: config.replication.request_timeout(),
                },
            ));
            manager.start().await.context("Failed to listen on the replication bus")?;
            Ok(manager)
        }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.trim_end_matches('/').to_string();

    let mut app = Router::new()
        .route(&format!("{ws_path}/:key"), get(ws_handler))
        .route(&ws_path, get(ws_query_handler))
        .route("/health", get(health_handler));

    if state.config.transport.rest_api {
        app = app
            .route("/apps/:app_id/events", post(api::trigger_event))
            .route("/apps/:app_id/batch_events", post(api::trigger_batch))
            .route("/apps/:app_id/channels", get(api::channels))
            .route("/apps/:app_id/channels/:channel", get(api::channel))
            .route("/apps/:app_id/channels/:channel/users", get(api::channel_users))
            .route("/apps/:app_id/statistics", get(api::statistics));
    }

    app.with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.apps.is_empty() {
        warn!("No apps configured, every connection will be rejected");
    }

    let manager = build_manager(&config).await?;
    info!(manager = manager.name(), "Channel manager ready");

    let state = Arc::new(AppState::new(config.clone(), manager));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let _tasks = tasks::spawn_all(&state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Herald server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}/{{app_key}}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, router(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "manager": state.dispatcher.manager().name(),
        "connections": state.dispatcher.registry().len(),
    }))
}

/// Query parameters of the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Pusher protocol version.
    pub protocol: Option<String>,
    /// App key, when not given in the path.
    #[serde(rename = "appKey")]
    pub app_key: Option<String>,
}

fn open_request(key: Option<String>, params: ConnectParams, headers: &HeaderMap) -> OpenRequest {
    OpenRequest {
        app_key: key.or(params.app_key).unwrap_or_default(),
        origin: headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        protocol: params.protocol,
    }
}

/// WebSocket upgrade handler for `/app/{key}`.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(key): Path<String>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let request = open_request(Some(key), params, &headers);
    ws.on_upgrade(move |socket| handle_websocket(socket, state, request))
}

/// WebSocket upgrade handler for `/app?appKey={key}`.
async fn ws_query_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let request = open_request(None, params, &headers);
    ws.on_upgrade(move |socket| handle_websocket(socket, state, request))
}

fn to_message(outbound: Outbound) -> Message {
    match outbound {
        Outbound::Text(text) => Message::Text(text),
        Outbound::Close { code, reason } => Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })),
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, request: OpenRequest) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let connection = match state.dispatcher.on_open(&request, tx).await {
        Ok(connection) => connection,
        Err(_) => {
            // Flush the error and close frames queued by the dispatcher.
            while let Ok(outbound) = rx.try_recv() {
                if sender.send(to_message(outbound)).await.is_err() {
                    break;
                }
            }
            return;
        }
    };
    let socket_id = connection.socket_id().clone();

    // Message processing loop
    loop {
        tokio::select! {
            biased;

            // Frames queued for this client
            outbound = rx.recv() => {
                let Some(outbound) = outbound else {
                    break;
                };
                let closing = matches!(outbound, Outbound::Close { .. });
                if let Outbound::Text(text) = &outbound {
                    metrics::record_message(text.len(), "outbound");
                }
                if sender.send(to_message(outbound)).await.is_err() || closing {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        metrics::record_message(text.len(), "inbound");
                        state.dispatcher.on_message(&connection, &text).await;
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        connection.touch();
                        debug!(socket_id = %socket_id, bytes = data.len(), "Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        connection.touch();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        connection.touch();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(socket_id = %socket_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(socket_id = %socket_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(socket_id = %socket_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.dispatcher.on_close(&connection).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tenvis_herald_core::{auth, App};
    use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    fn test_config() -> Config {
        Config {
            apps: vec![
                App::new("1234", "TestKey", "TestSecret"),
                App::new("5678", "TestClient", "TestSecret").with_client_messages(true),
            ],
            ..Config::default()
        }
    }

    async fn serve() -> (SocketAddr, Arc<AppState>) {
        let config = test_config();
        let manager = build_manager(&config).await.unwrap();
        let state = Arc::new(AppState::new(config, manager));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    async fn next_json(client: &mut Client) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .unwrap();
            if let tungstenite::Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn data_of(message: &Value) -> Value {
        match &message["data"] {
            Value::String(raw) => serde_json::from_str(raw).unwrap(),
            other => other.clone(),
        }
    }

    async fn connect(addr: SocketAddr, key: &str) -> (Client, String) {
        let (mut client, _) = connect_async(format!("ws://{addr}/app/{key}?protocol=7"))
            .await
            .unwrap();
        let established = next_json(&mut client).await;
        assert_eq!(established["event"], "pusher:connection_established");
        let socket_id = data_of(&established)["socket_id"].as_str().unwrap().to_string();
        (client, socket_id)
    }

    #[tokio::test]
    async fn test_connect_and_subscribe() {
        let (addr, state) = serve().await;
        let (mut client, _) = connect(addr, "TestKey").await;

        let subscribe = json!({"event": "pusher:subscribe", "data": {"channel": "news"}});
        client.send(tungstenite::Message::Text(subscribe.to_string())).await.unwrap();

        let reply = next_json(&mut client).await;
        assert_eq!(reply["event"], "pusher_internal:subscription_succeeded");
        assert_eq!(reply["channel"], "news");
        assert_eq!(state.dispatcher.manager().local().subscriber_count("1234", "news"), 1);
    }

    #[tokio::test]
    async fn test_unknown_app_closes_with_4001() {
        let (addr, _state) = serve().await;
        let (mut client, _) = connect_async(format!("ws://{addr}/app/Nope")).await.unwrap();

        let error = next_json(&mut client).await;
        assert_eq!(error["event"], "pusher:error");
        assert_eq!(data_of(&error)["code"], 4001);

        let close = tokio::time::timeout(Duration::from_secs(2), client.next()).await.unwrap();
        match close {
            Some(Ok(tungstenite::Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 4001);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_app_key_query_parameter() {
        let (addr, _state) = serve().await;
        let (mut client, _) = connect_async(format!("ws://{addr}/app?appKey=TestKey"))
            .await
            .unwrap();
        let established = next_json(&mut client).await;
        assert_eq!(established["event"], "pusher:connection_established");
    }

    #[tokio::test]
    async fn test_client_event_between_sockets() {
        let (addr, _state) = serve().await;
        let app = App::new("5678", "TestClient", "TestSecret");
        let (mut alice, alice_id) = connect(addr, "TestClient").await;
        let (mut bob, bob_id) = connect(addr, "TestClient").await;

        for (client, socket_id) in [(&mut alice, &alice_id), (&mut bob, &bob_id)] {
            let auth = auth::sign_channel(&app, socket_id, "private-chat", None);
            let subscribe = json!({
                "event": "pusher:subscribe",
                "data": {"channel": "private-chat", "auth": auth}
            });
            client.send(tungstenite::Message::Text(subscribe.to_string())).await.unwrap();
            assert_eq!(next_json(client).await["event"], "pusher_internal:subscription_succeeded");
        }

        let event = json!({"event": "client-typing", "channel": "private-chat", "data": {"who": "alice"}});
        alice.send(tungstenite::Message::Text(event.to_string())).await.unwrap();

        assert_eq!(next_json(&mut bob).await, event);
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up() {
        let (addr, state) = serve().await;
        let (mut client, _) = connect(addr, "TestKey").await;
        assert_eq!(state.dispatcher.registry().len(), 1);

        client.close(None).await.unwrap();
        for _ in 0..50 {
            if state.dispatcher.registry().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.dispatcher.registry().is_empty());
    }
}
