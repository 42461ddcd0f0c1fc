//! Pusher protocol dispatcher.
//!
//! Turns socket lifecycle events and raw client frames into channel manager
//! calls. Connection-level failures answer with `pusher:error` and close the
//! socket; request-level failures answer with `pusher:error` and keep it open.

use herald_protocol::{
    codec, ChannelData, ErrorCode, EventKind, PresenceData, ProtocolError, PusherMessage,
    SigninData, SubscribeData, UnsubscribeData, Version,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::app::{App, AppProvider};
use crate::auth::{self, AuthError};
use crate::channel::{validate_channel_name, ChannelKind};
use crate::connection::{ConnectionHandle, ConnectionRegistry, Outbound, SocketId};
use crate::hooks::ConnectionHook;
use crate::manager::{ChannelManager, ManagerError, UnsubscribeOutcome};
use crate::presence::PresenceMember;
use crate::statistics::StatisticsCollector;

/// Maximum length of an event name triggered through the REST API.
pub const MAX_EVENT_NAME_LENGTH: usize = 200;

/// Maximum number of channels one trigger may target.
pub const MAX_TRIGGER_CHANNELS: usize = 100;

/// Reasons to refuse or drop a whole connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Could not find app key `{0}`.")]
    AppNotFound(String),

    #[error("Origin not allowed")]
    OriginNotAllowed,

    #[error("Unsupported protocol version {0}")]
    UnsupportedProtocol(String),

    #[error("Over capacity")]
    OverCapacity,

    #[error("Invalid Signature")]
    Unauthorized,

    #[error("Pong reply not received in time")]
    PongTimeout,
}

impl ConnectionError {
    /// The error and close code sent to the client.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            ConnectionError::AppNotFound(_) => ErrorCode::AppNotFound,
            ConnectionError::OriginNotAllowed | ConnectionError::Unauthorized => {
                ErrorCode::Unauthorized
            }
            ConnectionError::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
            ConnectionError::OverCapacity => ErrorCode::OverCapacity,
            ConnectionError::PongTimeout => ErrorCode::PongTimeout,
        }
    }
}

/// Failures while handling one client frame.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid message format: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("Invalid Signature")]
    InvalidSignature(#[from] AuthError),

    #[error("Client events are not enabled for this app")]
    ClientEventsDisabled,

    #[error("Not subscribed to channel {0}")]
    NotSubscribed(String),

    #[error("Already signed in as another user")]
    AlreadySignedIn,

    #[error("Unsupported event {0}")]
    UnsupportedEvent(String),

    #[error(transparent)]
    Channel(#[from] ManagerError),

    /// The connection must be closed.
    #[error(transparent)]
    Fatal(#[from] ConnectionError),
}

impl DispatchError {
    /// The error code sent to the client.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            DispatchError::InvalidSignature(_) => ErrorCode::Unauthorized,
            DispatchError::Fatal(error) => error.code(),
            _ => ErrorCode::Generic,
        }
    }

    /// Whether the connection must be closed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::Fatal(_))
    }
}

/// Failures of a REST trigger.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("No channels given")]
    NoChannels,

    #[error("At most {MAX_TRIGGER_CHANNELS} channels may be triggered at once")]
    TooManyChannels,

    #[error("Event name too long")]
    NameTooLong,

    #[error("Invalid channel name {channel}: {reason}")]
    InvalidChannel { channel: String, reason: &'static str },

    #[error(transparent)]
    Channel(#[from] ManagerError),
}

/// An event published by an application backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub name: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub channel: Option<String>,
    /// Forwarded to clients untouched, usually a JSON-encoded string.
    pub data: Value,
    /// Socket excluded from delivery.
    #[serde(default)]
    pub socket_id: Option<String>,
}

impl TriggerEvent {
    /// Every target channel.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.channels
            .iter()
            .map(String::as_str)
            .chain(self.channel.as_deref())
    }

    /// Check limits and channel names.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violation.
    pub fn validate(&self) -> Result<(), TriggerError> {
        if self.name.len() > MAX_EVENT_NAME_LENGTH {
            return Err(TriggerError::NameTooLong);
        }
        let count = self.targets().count();
        if count == 0 {
            return Err(TriggerError::NoChannels);
        }
        if count > MAX_TRIGGER_CHANNELS {
            return Err(TriggerError::TooManyChannels);
        }
        for channel in self.targets() {
            validate_channel_name(channel).map_err(|reason| TriggerError::InvalidChannel {
                channel: channel.to_string(),
                reason,
            })?;
        }
        Ok(())
    }
}

/// What the client asked for when opening the socket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenRequest {
    pub app_key: String,
    /// The `Origin` header.
    pub origin: Option<String>,
    /// The `protocol` query parameter.
    pub protocol: Option<String>,
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Seconds of silence after which clients should ping, announced on
    /// connect.
    pub activity_timeout: u64,
    /// Maximum size of a client frame in bytes.
    pub max_message_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            activity_timeout: 30,
            max_message_size: codec::MAX_FRAME_SIZE,
        }
    }
}

/// Protocol handler shared by every socket of the process.
pub struct Dispatcher {
    apps: Arc<dyn AppProvider>,
    manager: Arc<dyn ChannelManager>,
    statistics: Arc<StatisticsCollector>,
    hooks: Vec<Arc<dyn ConnectionHook>>,
    config: DispatcherConfig,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        apps: Arc<dyn AppProvider>,
        manager: Arc<dyn ChannelManager>,
        statistics: Arc<StatisticsCollector>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            apps,
            manager,
            statistics,
            hooks: Vec::new(),
            config,
        }
    }

    /// Append a hook. Hooks run in the order they were added.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn ConnectionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    #[must_use]
    pub fn apps(&self) -> &Arc<dyn AppProvider> {
        &self.apps
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<dyn ChannelManager> {
        &self.manager
    }

    #[must_use]
    pub fn statistics(&self) -> &Arc<StatisticsCollector> {
        &self.statistics
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.manager.local().registry()
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Accept or refuse a new socket.
    ///
    /// On success the client has been sent `pusher:connection_established`.
    /// On failure it has been sent `pusher:error` followed by a close.
    ///
    /// # Errors
    ///
    /// Returns why the connection was refused.
    pub async fn on_open(
        &self,
        request: &OpenRequest,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Result<Arc<ConnectionHandle>, ConnectionError> {
        let app = match self.accept(request).await {
            Ok(app) => app,
            Err(error) => {
                reject(&sender, &error);
                for hook in &self.hooks {
                    hook.on_rejected(&request.app_key, &error);
                }
                return Err(error);
            }
        };

        let connection = self.registry().open(app, sender);
        self.statistics.connection(connection.app_id());
        connection.send(&PusherMessage::connection_established(
            connection.socket_id().as_str(),
            self.config.activity_timeout,
        ));

        for hook in &self.hooks {
            hook.on_open(&connection);
        }
        Ok(connection)
    }

    async fn accept(&self, request: &OpenRequest) -> Result<Arc<App>, ConnectionError> {
        let app = self
            .apps
            .find_by_key(&request.app_key)
            .ok_or_else(|| ConnectionError::AppNotFound(request.app_key.clone()))?;

        if !app.is_origin_allowed(request.origin.as_deref()) {
            return Err(ConnectionError::OriginNotAllowed);
        }

        if let Some(raw) = &request.protocol {
            if !Version::parse(raw).is_some_and(|v| v.is_supported()) {
                return Err(ConnectionError::UnsupportedProtocol(raw.clone()));
            }
        }

        if let Some(capacity) = app.capacity {
            if self.manager.global_connection_count(&app.id).await >= capacity {
                return Err(ConnectionError::OverCapacity);
            }
        }

        Ok(app)
    }

    /// Handle a text frame from a client.
    pub async fn on_message(&self, connection: &Arc<ConnectionHandle>, frame: &str) {
        for hook in &self.hooks {
            hook.on_message(connection, frame);
        }
        self.statistics.web_socket_message(connection.app_id());
        connection.touch();
        if connection.is_closing() {
            return;
        }

        if let Err(error) = self.dispatch(connection, frame).await {
            self.on_error(connection, &error);
        }
    }

    /// Report a failure to the client, closing the socket if it is fatal.
    pub fn on_error(&self, connection: &ConnectionHandle, error: &DispatchError) {
        for hook in &self.hooks {
            hook.on_error(connection, error);
        }
        let code = error.code();
        connection.send(&PusherMessage::error(code, error.to_string()));
        if error.is_fatal() {
            connection.close(code.code(), error.to_string());
        }
    }

    /// Tear down a connection. Safe to call more than once.
    ///
    /// Returns `false` if the connection was already gone.
    pub async fn on_close(&self, connection: &ConnectionHandle) -> bool {
        connection.mark_closing();
        if self.registry().remove(connection.socket_id()).is_none() {
            return false;
        }

        for (channel, outcome) in self.manager.unsubscribe_all(connection) {
            self.announce_departure(connection.app_id(), &channel, outcome).await;
        }
        self.statistics.disconnection(connection.app_id());

        for hook in &self.hooks {
            hook.on_close(connection);
        }
        true
    }

    async fn dispatch(&self, connection: &Arc<ConnectionHandle>, frame: &str) -> Result<(), DispatchError> {
        let message = codec::decode_with_limit(frame, self.config.max_message_size)?;

        match message.kind() {
            EventKind::Subscribe => self.subscribe(connection, &message).await,
            EventKind::Unsubscribe => self.unsubscribe(connection, &message).await,
            EventKind::Ping => {
                connection.send(&PusherMessage::pong());
                Ok(())
            }
            EventKind::Pong => Ok(()),
            EventKind::Signin => self.signin(connection, &message),
            EventKind::Client(_) => self.client_event(connection, &message).await,
            EventKind::UnsupportedProtocol(event) | EventKind::Unknown(event) => {
                Err(DispatchError::UnsupportedEvent(event.to_string()))
            }
        }
    }

    async fn subscribe(
        &self,
        connection: &Arc<ConnectionHandle>,
        message: &PusherMessage,
    ) -> Result<(), DispatchError> {
        let data: SubscribeData = message.decode_data()?;
        let channel = data.channel.as_str();
        validate_channel_name(channel).map_err(ManagerError::InvalidChannel)?;
        let kind = ChannelKind::of(channel);

        let channel_data = if kind.is_presence() {
            Some(data.channel_data.as_deref().ok_or_else(|| {
                ProtocolError::Invalid(format!("Missing channel_data for {channel}"))
            })?)
        } else {
            None
        };

        if kind.requires_auth() {
            auth::verify_channel_auth(
                connection.app(),
                connection.socket_id().as_str(),
                channel,
                channel_data,
                data.auth.as_deref(),
            )?;
        }

        let member = channel_data.map(parse_member).transpose()?;
        let outcome = self.manager.subscribe(connection, channel, member)?;
        let app_id = connection.app_id();

        if let Some(member) = &outcome.member_added {
            let added = PusherMessage::member_added(channel, &member.user_id, &member.user_info);
            self.manager
                .broadcast(app_id, channel, &added, Some(connection.socket_id()))
                .await?;
        }

        let presence = if kind.is_presence() {
            let roster = self.manager.channel_members(app_id, channel).await;
            Some(PresenceData::from_roster(&roster))
        } else {
            None
        };
        connection.send(&PusherMessage::subscription_succeeded(channel, presence));
        Ok(())
    }

    async fn unsubscribe(
        &self,
        connection: &ConnectionHandle,
        message: &PusherMessage,
    ) -> Result<(), DispatchError> {
        let data: UnsubscribeData = message.decode_data()?;
        let outcome = self.manager.unsubscribe(connection, &data.channel);
        self.announce_departure(connection.app_id(), &data.channel, outcome).await;
        Ok(())
    }

    async fn announce_departure(&self, app_id: &str, channel: &str, outcome: UnsubscribeOutcome) {
        let Some(member) = outcome.member_removed else {
            return;
        };
        let removed = PusherMessage::member_removed(channel, &member.user_id);
        if let Err(e) = self.manager.broadcast(app_id, channel, &removed, None).await {
            warn!(channel = %channel, error = %e, "Failed to announce member removal");
        }
    }

    fn signin(&self, connection: &ConnectionHandle, message: &PusherMessage) -> Result<(), DispatchError> {
        let data: SigninData = message.decode_data()?;
        auth::verify_user_auth(
            connection.app(),
            connection.socket_id().as_str(),
            &data.user_data,
            &data.auth,
        )
        .map_err(|_| ConnectionError::Unauthorized)?;

        let user: Value = serde_json::from_str(&data.user_data).map_err(ProtocolError::from)?;
        let user_id = user
            .get("id")
            .and_then(user_id_of)
            .ok_or_else(|| ProtocolError::Invalid("user_data must contain an id".into()))?;

        if !connection.set_user_id(user_id.clone()) && connection.user_id() != Some(user_id.as_str()) {
            return Err(DispatchError::AlreadySignedIn);
        }
        debug!(socket_id = %connection.socket_id(), user_id = %user_id, "Signed in");
        connection.send(&PusherMessage::signin_success(&data.user_data));
        Ok(())
    }

    async fn client_event(
        &self,
        connection: &ConnectionHandle,
        message: &PusherMessage,
    ) -> Result<(), DispatchError> {
        if !connection.app().enable_client_messages {
            return Err(DispatchError::ClientEventsDisabled);
        }
        let channel = message
            .channel
            .as_deref()
            .ok_or_else(|| ProtocolError::Invalid("Client events require a channel".into()))?;
        if !connection.is_subscribed(channel) {
            return Err(DispatchError::NotSubscribed(channel.to_string()));
        }

        self.manager
            .broadcast(connection.app_id(), channel, message, Some(connection.socket_id()))
            .await?;
        Ok(())
    }

    /// Publish an application event on behalf of a backend.
    ///
    /// Returns the number of local deliveries.
    ///
    /// # Errors
    ///
    /// Returns an error if the event is invalid or cannot be encoded.
    pub async fn trigger(&self, app: &App, event: &TriggerEvent) -> Result<usize, TriggerError> {
        event.validate()?;

        let except = event.socket_id.clone().map(SocketId::from);
        let mut delivered = 0;
        for channel in event.targets() {
            let message = PusherMessage::channel_event(&event.name, channel, event.data.clone());
            delivered += self
                .manager
                .broadcast(&app.id, channel, &message, except.as_ref())
                .await?;
        }

        self.statistics.api_message(&app.id);
        Ok(delivered)
    }

    /// Close every connection silent for longer than `timeout`.
    ///
    /// Returns how many were closed.
    pub async fn close_stale(&self, timeout: Duration) -> usize {
        let stale = self.registry().stale(timeout);
        let error = DispatchError::Fatal(ConnectionError::PongTimeout);
        for connection in &stale {
            self.on_error(connection, &error);
            self.on_close(connection).await;
        }
        stale.len()
    }
}

fn reject(sender: &mpsc::UnboundedSender<Outbound>, error: &ConnectionError) {
    let code = error.code();
    if let Ok(text) = codec::encode(&PusherMessage::error(code, error.to_string())) {
        let _ = sender.send(Outbound::Text(text));
    }
    let _ = sender.send(Outbound::Close {
        code: code.code(),
        reason: error.to_string(),
    });
}

fn user_id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_member(raw: &str) -> Result<PresenceMember, DispatchError> {
    let data: ChannelData = serde_json::from_str(raw).map_err(ProtocolError::from)?;
    let user_id = data
        .user_id()
        .ok_or_else(|| ProtocolError::Invalid("channel_data.user_id must be a string or number".into()))?;
    Ok(PresenceMember::new(user_id, data.user_info()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ConfigAppProvider;
    use crate::manager::{LocalChannelManager, ReplicatedChannelManager, ReplicationConfig};
    use herald_protocol::events;
    use serde_json::json;
    use tenvis_herald_transport::MemoryBus;

    struct Client {
        connection: Arc<ConnectionHandle>,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl Client {
        fn socket_id(&self) -> &str {
            self.connection.socket_id().as_str()
        }

        fn outbound(&mut self) -> Vec<Outbound> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                frames.push(frame);
            }
            frames
        }

        fn messages(&mut self) -> Vec<PusherMessage> {
            self.outbound()
                .into_iter()
                .filter_map(|frame| match frame {
                    Outbound::Text(text) => Some(serde_json::from_str(&text).unwrap()),
                    Outbound::Close { .. } => None,
                })
                .collect()
        }

        async fn next_message(&mut self) -> PusherMessage {
            match tokio::time::timeout(Duration::from_secs(1), self.rx.recv()).await {
                Ok(Some(Outbound::Text(text))) => serde_json::from_str(&text).unwrap(),
                other => panic!("expected a message, got {other:?}"),
            }
        }
    }

    fn test_app() -> App {
        App::new("1234", "TestKey", "TestSecret")
    }

    fn apps() -> Arc<dyn AppProvider> {
        Arc::new(ConfigAppProvider::new([
            test_app(),
            App::new("2468", "TestOrigin", "TestSecret").with_allowed_origins(["test.origin.com"]),
            App::new("4321", "TestCapacity", "TestSecret").with_capacity(1),
            App::new("5678", "TestClient", "TestSecret").with_client_messages(true),
        ]))
    }

    fn dispatcher() -> Dispatcher {
        let apps = apps();
        let manager = Arc::new(LocalChannelManager::new(Arc::new(ConnectionRegistry::new())));
        let statistics = Arc::new(StatisticsCollector::new(Arc::clone(&apps)));
        Dispatcher::new(apps, manager, statistics, DispatcherConfig::default())
    }

    async fn replicated_dispatcher(bus: &MemoryBus) -> Dispatcher {
        let apps = apps();
        let local = LocalChannelManager::new(Arc::new(ConnectionRegistry::new()));
        let manager = Arc::new(ReplicatedChannelManager::new(
            local,
            Arc::new(bus.clone()),
            ReplicationConfig {
                request_timeout: Duration::from_millis(500),
                ..ReplicationConfig::default()
            },
        ));
        manager.start().await.unwrap();
        let statistics = Arc::new(StatisticsCollector::new(Arc::clone(&apps)));
        Dispatcher::new(apps, manager, statistics, DispatcherConfig::default())
    }

    async fn try_connect(dispatcher: &Dispatcher, request: OpenRequest) -> (Result<Arc<ConnectionHandle>, ConnectionError>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (dispatcher.on_open(&request, tx).await, rx)
    }

    async fn connect(dispatcher: &Dispatcher, key: &str) -> Client {
        let request = OpenRequest {
            app_key: key.to_string(),
            protocol: Some("7".to_string()),
            ..OpenRequest::default()
        };
        let (result, rx) = try_connect(dispatcher, request).await;
        let mut client = Client {
            connection: result.unwrap(),
            rx,
        };
        client.outbound();
        client
    }

    async fn send(dispatcher: &Dispatcher, client: &Client, frame: Value) {
        dispatcher.on_message(&client.connection, &frame.to_string()).await;
    }

    fn subscribe_frame(channel: &str, auth: Option<String>, channel_data: Option<&str>) -> Value {
        json!({
            "event": "pusher:subscribe",
            "data": {
                "channel": channel,
                "auth": auth,
                "channel_data": channel_data,
            }
        })
    }

    async fn join_presence(dispatcher: &Dispatcher, client: &Client, channel: &str, member: Value) {
        let channel_data = member.to_string();
        let auth = auth::sign_channel(&test_app(), client.socket_id(), channel, Some(&channel_data));
        send(dispatcher, client, subscribe_frame(channel, Some(auth), Some(&channel_data))).await;
    }

    fn data_of(message: &PusherMessage) -> Value {
        match message.data.as_ref().unwrap() {
            Value::String(raw) => serde_json::from_str(raw).unwrap(),
            other => other.clone(),
        }
    }

    fn assert_error(message: &PusherMessage, code: u16) {
        assert_eq!(message.event, events::ERROR);
        assert_eq!(data_of(message)["code"], json!(code));
    }

    #[tokio::test]
    async fn test_connection_established() {
        let dispatcher = dispatcher();
        let (result, mut rx) = try_connect(
            &dispatcher,
            OpenRequest {
                app_key: "TestKey".into(),
                ..OpenRequest::default()
            },
        )
        .await;
        let connection = result.unwrap();

        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected connection_established");
        };
        let message: PusherMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(message.event, events::CONNECTION_ESTABLISHED);
        assert_eq!(data_of(&message)["socket_id"], json!(connection.socket_id().as_str()));
        assert_eq!(data_of(&message)["activity_timeout"], json!(30));

        assert_eq!(dispatcher.registry().count_for_app("1234"), 1);
        assert_eq!(dispatcher.statistics().get("1234").unwrap().current_connections, 1);
    }

    #[tokio::test]
    async fn test_unknown_app_is_rejected() {
        let dispatcher = dispatcher();
        let (result, mut rx) = try_connect(
            &dispatcher,
            OpenRequest {
                app_key: "UnknownKey".into(),
                ..OpenRequest::default()
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), ConnectionError::AppNotFound("UnknownKey".into()));
        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected an error");
        };
        assert_error(&serde_json::from_str(&text).unwrap(), 4001);
        assert!(matches!(rx.recv().await, Some(Outbound::Close { code: 4001, .. })));
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_origin_check() {
        let dispatcher = dispatcher();
        let denied = OpenRequest {
            app_key: "TestOrigin".into(),
            origin: Some("https://evil.com".into()),
            protocol: None,
        };
        let (result, _rx) = try_connect(&dispatcher, denied).await;
        assert_eq!(result.unwrap_err().code(), ErrorCode::Unauthorized);

        let allowed = OpenRequest {
            app_key: "TestOrigin".into(),
            origin: Some("https://test.origin.com".into()),
            protocol: None,
        };
        let (result, _rx) = try_connect(&dispatcher, allowed).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_unsupported_protocol() {
        let dispatcher = dispatcher();
        let request = OpenRequest {
            app_key: "TestKey".into(),
            protocol: Some("2".into()),
            ..OpenRequest::default()
        };
        let (result, _rx) = try_connect(&dispatcher, request).await;
        assert_eq!(result.unwrap_err().code(), ErrorCode::UnsupportedProtocol);
    }

    #[tokio::test]
    async fn test_capacity() {
        let dispatcher = dispatcher();
        let _first = connect(&dispatcher, "TestCapacity").await;

        let request = OpenRequest {
            app_key: "TestCapacity".into(),
            ..OpenRequest::default()
        };
        let (result, mut rx) = try_connect(&dispatcher, request).await;
        assert_eq!(result.unwrap_err(), ConnectionError::OverCapacity);
        rx.recv().await;
        assert!(matches!(rx.recv().await, Some(Outbound::Close { code: 4100, .. })));
    }

    #[tokio::test]
    async fn test_public_subscribe() {
        let dispatcher = dispatcher();
        let mut client = connect(&dispatcher, "TestKey").await;

        send(&dispatcher, &client, subscribe_frame("basic-channel", None, None)).await;

        let messages = client.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event, events::SUBSCRIPTION_SUCCEEDED);
        assert_eq!(messages[0].channel.as_deref(), Some("basic-channel"));
        assert_eq!(data_of(&messages[0]), json!({}));
        assert_eq!(dispatcher.manager().local().subscriber_count("1234", "basic-channel"), 1);

        // Subscribing again succeeds without double counting.
        send(&dispatcher, &client, subscribe_frame("basic-channel", None, None)).await;
        assert_eq!(client.messages()[0].event, events::SUBSCRIPTION_SUCCEEDED);
        assert_eq!(dispatcher.manager().local().subscriber_count("1234", "basic-channel"), 1);
    }

    #[tokio::test]
    async fn test_private_subscribe_with_valid_signature() {
        let dispatcher = dispatcher();
        let mut client = connect(&dispatcher, "TestKey").await;

        let auth = auth::sign_channel(&test_app(), client.socket_id(), "private-channel", None);
        send(&dispatcher, &client, subscribe_frame("private-channel", Some(auth), None)).await;

        assert_eq!(client.messages()[0].event, events::SUBSCRIPTION_SUCCEEDED);
        assert!(client.connection.is_subscribed("private-channel"));
    }

    #[tokio::test]
    async fn test_private_subscribe_with_wrong_secret() {
        let dispatcher = dispatcher();
        let mut client = connect(&dispatcher, "TestKey").await;

        let forged = App::new("1234", "TestKey", "InvalidSecret");
        let auth = auth::sign_channel(&forged, client.socket_id(), "private-x", None);
        send(&dispatcher, &client, subscribe_frame("private-x", Some(auth), None)).await;

        let outbound = client.outbound();
        assert_eq!(outbound.len(), 1, "connection must stay open");
        let Outbound::Text(text) = &outbound[0] else {
            panic!("expected an error frame");
        };
        assert_error(&serde_json::from_str(text).unwrap(), 4009);
        assert_eq!(dispatcher.manager().local().subscriber_count("1234", "private-x"), 0);
        assert!(!client.connection.is_subscribed("private-x"));
    }

    #[tokio::test]
    async fn test_presence_subscribe_with_wrong_secret() {
        let dispatcher = dispatcher();
        let mut rick = connect(&dispatcher, "TestKey").await;
        let mut morty = connect(&dispatcher, "TestKey").await;

        join_presence(&dispatcher, &rick, "presence-room", json!({"user_id": 1})).await;
        rick.outbound();

        let channel_data = json!({"user_id": 2, "user_info": {"name": "Morty"}}).to_string();
        let forged = App::new("1234", "TestKey", "InvalidSecret");
        let auth = auth::sign_channel(&forged, morty.socket_id(), "presence-room", Some(&channel_data));
        send(&dispatcher, &morty, subscribe_frame("presence-room", Some(auth), Some(&channel_data))).await;

        let messages = morty.messages();
        assert_eq!(messages.len(), 1);
        assert_error(&messages[0], 4009);
        assert!(rick.messages().is_empty(), "no member_added for a rejected join");

        let local = dispatcher.manager().local();
        assert_eq!(local.subscriber_count("1234", "presence-room"), 1);
        assert_eq!(local.members("1234", "presence-room").keys().collect::<Vec<_>>(), ["1"]);
        assert!(!morty.connection.is_subscribed("presence-room"));
    }

    #[tokio::test]
    async fn test_presence_subscribe_with_wrong_secret_on_empty_channel() {
        let dispatcher = dispatcher();
        let mut client = connect(&dispatcher, "TestKey").await;

        let channel_data = json!({"user_id": 7}).to_string();
        let forged = App::new("1234", "TestKey", "InvalidSecret");
        let auth = auth::sign_channel(&forged, client.socket_id(), "presence-room", Some(&channel_data));
        send(&dispatcher, &client, subscribe_frame("presence-room", Some(auth), Some(&channel_data))).await;

        assert_error(&client.messages()[0], 4009);
        let local = dispatcher.manager().local();
        assert_eq!(local.subscriber_count("1234", "presence-room"), 0);
        assert!(local.members("1234", "presence-room").is_empty());
    }

    #[tokio::test]
    async fn test_frames_after_close_are_ignored() {
        let dispatcher = dispatcher();
        let mut client = connect(&dispatcher, "TestKey").await;

        assert!(dispatcher.on_close(&client.connection).await);
        join_presence(&dispatcher, &client, "presence-room", json!({"user_id": 7})).await;
        assert!(!dispatcher.on_close(&client.connection).await);

        assert!(dispatcher.registry().is_empty());
        let local = dispatcher.manager().local();
        assert_eq!(local.subscriber_count("1234", "presence-room"), 0);
        assert!(local.members("1234", "presence-room").is_empty());
        assert!(client.messages().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_wins_over_pending_subscribe() {
        let dispatcher = dispatcher();
        let client = connect(&dispatcher, "TestKey").await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(dispatcher.close_stale(Duration::ZERO).await, 1);

        join_presence(&dispatcher, &client, "presence-room", json!({"user_id": 7})).await;
        assert!(!dispatcher.on_close(&client.connection).await);
        assert_eq!(dispatcher.manager().local().subscriber_count("1234", "presence-room"), 0);
    }

    #[tokio::test]
    async fn test_private_subscribe_without_signature() {
        let dispatcher = dispatcher();
        let mut client = connect(&dispatcher, "TestKey").await;

        send(&dispatcher, &client, subscribe_frame("private-channel", None, None)).await;
        assert_error(&client.messages()[0], 4009);
    }

    #[tokio::test]
    async fn test_presence_rick_and_morty() {
        let dispatcher = dispatcher();
        let mut rick = connect(&dispatcher, "TestKey").await;
        let mut morty = connect(&dispatcher, "TestKey").await;

        join_presence(&dispatcher, &rick, "presence-room", json!({"user_id": 1, "user_info": {"name": "Rick"}})).await;
        let messages = rick.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event, events::SUBSCRIPTION_SUCCEEDED);
        assert_eq!(
            data_of(&messages[0]),
            json!({"presence": {"ids": ["1"], "hash": {"1": {"name": "Rick"}}, "count": 1}})
        );

        join_presence(&dispatcher, &morty, "presence-room", json!({"user_id": 2, "user_info": {"name": "Morty"}})).await;
        let to_rick = rick.messages();
        assert_eq!(to_rick.len(), 1);
        assert_eq!(to_rick[0].event, events::MEMBER_ADDED);
        assert_eq!(data_of(&to_rick[0]), json!({"user_id": "2", "user_info": {"name": "Morty"}}));

        let to_morty = morty.messages();
        assert_eq!(to_morty.len(), 1, "the joiner gets no member_added");
        assert_eq!(data_of(&to_morty[0])["presence"]["count"], json!(2));

        assert!(dispatcher.on_close(&morty.connection).await);
        let to_rick = rick.messages();
        assert_eq!(to_rick.len(), 1);
        assert_eq!(to_rick[0].event, events::MEMBER_REMOVED);
        assert_eq!(data_of(&to_rick[0]), json!({"user_id": "2"}));
    }

    #[tokio::test]
    async fn test_presence_same_user_two_connections() {
        let dispatcher = dispatcher();
        let mut observer = connect(&dispatcher, "TestKey").await;
        let tab1 = connect(&dispatcher, "TestKey").await;
        let tab2 = connect(&dispatcher, "TestKey").await;

        join_presence(&dispatcher, &observer, "presence-room", json!({"user_id": "observer"})).await;
        observer.messages();

        let rick = json!({"user_id": 1, "user_info": {"name": "Rick"}});
        join_presence(&dispatcher, &tab1, "presence-room", rick.clone()).await;
        join_presence(&dispatcher, &tab2, "presence-room", rick).await;
        let added: Vec<_> = observer
            .messages()
            .into_iter()
            .filter(|m| m.event == events::MEMBER_ADDED)
            .collect();
        assert_eq!(added.len(), 1);

        send(&dispatcher, &tab1, json!({"event": "pusher:unsubscribe", "data": {"channel": "presence-room"}})).await;
        assert!(observer.messages().is_empty());
        let roster = dispatcher.manager().channel_members("1234", "presence-room").await;
        assert!(roster.contains_key("1"));

        dispatcher.on_close(&tab2.connection).await;
        let removed: Vec<_> = observer
            .messages()
            .into_iter()
            .filter(|m| m.event == events::MEMBER_REMOVED)
            .collect();
        assert_eq!(removed.len(), 1);
        let roster = dispatcher.manager().channel_members("1234", "presence-room").await;
        assert!(!roster.contains_key("1"));
    }

    #[tokio::test]
    async fn test_presence_requires_channel_data() {
        let dispatcher = dispatcher();
        let mut client = connect(&dispatcher, "TestKey").await;

        let auth = auth::sign_channel(&test_app(), client.socket_id(), "presence-room", None);
        send(&dispatcher, &client, subscribe_frame("presence-room", Some(auth), None)).await;
        assert_error(&client.messages()[0], 4000);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let dispatcher = dispatcher();
        let mut client = connect(&dispatcher, "TestKey").await;

        send(&dispatcher, &client, json!({"event": "pusher:ping", "data": {}})).await;
        assert_eq!(client.messages()[0].event, events::PONG);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_events_keep_connection() {
        let dispatcher = dispatcher();
        let mut client = connect(&dispatcher, "TestKey").await;

        dispatcher.on_message(&client.connection, "not json").await;
        send(&dispatcher, &client, json!({"event": "whatever"})).await;
        send(&dispatcher, &client, json!({"event": "pusher:nonsense"})).await;

        let outbound = client.outbound();
        assert_eq!(outbound.len(), 3);
        assert!(outbound.iter().all(|o| matches!(o, Outbound::Text(_))));
        assert!(!client.connection.is_closing());
    }

    #[tokio::test]
    async fn test_client_events_disabled() {
        let dispatcher = dispatcher();
        let mut client = connect(&dispatcher, "TestKey").await;
        let auth = auth::sign_channel(&test_app(), client.socket_id(), "private-chat", None);
        send(&dispatcher, &client, subscribe_frame("private-chat", Some(auth), None)).await;
        client.messages();

        send(&dispatcher, &client, json!({"event": "client-typing", "channel": "private-chat", "data": {}})).await;
        assert_error(&client.messages()[0], 4000);
    }

    #[tokio::test]
    async fn test_client_events_forwarded_to_others() {
        let dispatcher = dispatcher();
        let app = App::new("5678", "TestClient", "TestSecret");
        let mut sender = connect(&dispatcher, "TestClient").await;
        let mut receiver = connect(&dispatcher, "TestClient").await;

        for client in [&sender, &receiver] {
            let auth = auth::sign_channel(&app, client.socket_id(), "private-chat", None);
            send(&dispatcher, client, subscribe_frame("private-chat", Some(auth), None)).await;
        }
        sender.messages();
        receiver.messages();

        let event = json!({"event": "client-typing", "channel": "private-chat", "data": {"who": "rick"}});
        send(&dispatcher, &sender, event.clone()).await;

        assert!(sender.messages().is_empty());
        let received = receiver.messages();
        assert_eq!(received.len(), 1);
        assert_eq!(serde_json::to_value(&received[0]).unwrap(), event);
    }

    #[tokio::test]
    async fn test_client_event_requires_subscription() {
        let dispatcher = dispatcher();
        let mut client = connect(&dispatcher, "TestClient").await;

        send(&dispatcher, &client, json!({"event": "client-typing", "channel": "private-chat", "data": {}})).await;
        assert_error(&client.messages()[0], 4000);
    }

    #[tokio::test]
    async fn test_signin() {
        let dispatcher = dispatcher();
        let mut client = connect(&dispatcher, "TestKey").await;

        let user_data = r#"{"id":"rick","name":"Rick"}"#;
        let auth = auth::sign_user(&test_app(), client.socket_id(), user_data);
        send(&dispatcher, &client, json!({"event": "pusher:signin", "data": {"user_data": user_data, "auth": auth}})).await;

        let messages = client.messages();
        assert_eq!(messages[0].event, events::SIGNIN_SUCCESS);
        assert_eq!(client.connection.user_id(), Some("rick"));
    }

    #[tokio::test]
    async fn test_signin_with_bad_signature_closes() {
        let dispatcher = dispatcher();
        let mut client = connect(&dispatcher, "TestKey").await;

        let user_data = r#"{"id":"rick"}"#;
        let auth = auth::sign_user(&App::new("1234", "TestKey", "Wrong"), client.socket_id(), user_data);
        send(&dispatcher, &client, json!({"event": "pusher:signin", "data": {"user_data": user_data, "auth": auth}})).await;

        let outbound = client.outbound();
        assert_eq!(outbound.len(), 2);
        assert!(matches!(outbound[1], Outbound::Close { code: 4009, .. }));
    }

    #[tokio::test]
    async fn test_messages_are_counted() {
        let dispatcher = dispatcher();
        let client = connect(&dispatcher, "TestKey").await;

        for _ in 0..3 {
            send(&dispatcher, &client, json!({"event": "pusher:ping"})).await;
        }
        assert_eq!(dispatcher.statistics().get("1234").unwrap().websocket_messages, 3);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dispatcher = dispatcher();
        let client = connect(&dispatcher, "TestKey").await;

        assert!(dispatcher.on_close(&client.connection).await);
        assert!(!dispatcher.on_close(&client.connection).await);
        assert_eq!(dispatcher.statistics().get("1234").unwrap().current_connections, 0);
    }

    #[tokio::test]
    async fn test_trigger() {
        let dispatcher = dispatcher();
        let mut a = connect(&dispatcher, "TestKey").await;
        let mut b = connect(&dispatcher, "TestKey").await;
        for client in [&a, &b] {
            send(&dispatcher, client, subscribe_frame("basic-channel", None, None)).await;
        }
        a.messages();
        b.messages();

        let event = TriggerEvent {
            name: "greeting".into(),
            channels: vec!["basic-channel".into()],
            channel: None,
            data: json!("{\"hello\":\"world\"}"),
            socket_id: Some(a.socket_id().to_string()),
        };
        let delivered = dispatcher.trigger(&test_app(), &event).await.unwrap();

        assert_eq!(delivered, 1);
        assert!(a.messages().is_empty());
        let received = b.messages();
        assert_eq!(received[0].event, "greeting");
        assert_eq!(received[0].data, Some(json!("{\"hello\":\"world\"}")));
        assert_eq!(dispatcher.statistics().get("1234").unwrap().api_messages, 1);
    }

    #[test]
    fn test_trigger_validation() {
        let mut event = TriggerEvent {
            name: "greeting".into(),
            channels: Vec::new(),
            channel: None,
            data: json!("{}"),
            socket_id: None,
        };
        assert!(matches!(event.validate(), Err(TriggerError::NoChannels)));

        event.channel = Some("bad channel".into());
        assert!(matches!(event.validate(), Err(TriggerError::InvalidChannel { .. })));

        event.channel = None;
        event.channels = (0..=MAX_TRIGGER_CHANNELS).map(|i| format!("c{i}")).collect();
        assert!(matches!(event.validate(), Err(TriggerError::TooManyChannels)));
    }

    #[tokio::test]
    async fn test_close_stale() {
        let dispatcher = dispatcher();
        let mut client = connect(&dispatcher, "TestKey").await;

        assert_eq!(dispatcher.close_stale(Duration::from_secs(60)).await, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.close_stale(Duration::from_millis(1)).await, 1);

        let outbound = client.outbound();
        assert!(matches!(outbound.last(), Some(Outbound::Close { code: 4201, .. })));
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_presence_across_nodes() {
        let bus = MemoryBus::new();
        let node1 = replicated_dispatcher(&bus).await;
        let node2 = replicated_dispatcher(&bus).await;

        let mut rick = connect(&node1, "TestKey").await;
        let mut morty = connect(&node2, "TestKey").await;

        join_presence(&node1, &rick, "presence-room", json!({"user_id": 1, "user_info": {"name": "Rick"}})).await;
        assert_eq!(rick.next_message().await.event, events::SUBSCRIPTION_SUCCEEDED);

        join_presence(&node2, &morty, "presence-room", json!({"user_id": 2, "user_info": {"name": "Morty"}})).await;
        let joined = morty.next_message().await;
        assert_eq!(joined.event, events::SUBSCRIPTION_SUCCEEDED);
        assert_eq!(data_of(&joined)["presence"]["count"], json!(2));

        let added = rick.next_message().await;
        assert_eq!(added.event, events::MEMBER_ADDED);
        assert_eq!(data_of(&added)["user_id"], json!("2"));

        node2.on_close(&morty.connection).await;
        let removed = rick.next_message().await;
        assert_eq!(removed.event, events::MEMBER_REMOVED);
        assert_eq!(data_of(&removed)["user_id"], json!("2"));
    }
}
