//! Pusher HTTP API.
//!
//! Every endpoint except `statistics` requires a request signed with the
//! app's secret (`auth_key`, `auth_timestamp`, `auth_version`, `body_md5`
//! and `auth_signature` query parameters).

use crate::handlers::AppState;
use crate::metrics;
use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tenvis_herald_core::auth::{self, AuthError};
use tenvis_herald_core::connection::now_millis;
use tenvis_herald_core::statistics::{StatisticsStore, StoreError, TimeRange};
use tenvis_herald_core::{App, ChannelKind, TriggerError, TriggerEvent};
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum number of events in one batch.
pub const MAX_BATCH_SIZE: usize = 10;

/// REST API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unknown app")]
    AppNotFound,

    #[error(transparent)]
    Unauthorized(#[from] AuthError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error("Only presence channels have users")]
    NotPresence,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::AppNotFound => StatusCode::NOT_FOUND,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) | ApiError::NotPresence => StatusCode::BAD_REQUEST,
            ApiError::Trigger(TriggerError::Channel(_)) | ApiError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Trigger(_) => StatusCode::BAD_REQUEST,
        };
        if status.is_server_error() {
            warn!(error = %self, "API request failed");
        } else {
            debug!(error = %self, "API request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type Params = BTreeMap<String, String>;

/// Resolve the app and check the request signature.
fn authorize(
    state: &AppState,
    app_id: &str,
    method: &Method,
    uri: &Uri,
    params: &Params,
    body: &[u8],
) -> Result<Arc<App>, ApiError> {
    let app = state
        .dispatcher
        .apps()
        .find_by_id(app_id)
        .ok_or(ApiError::AppNotFound)?;
    auth::verify_api_request(&app, method.as_str(), uri.path(), params, body, now_millis() / 1000)?;
    Ok(app)
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// `POST /apps/{app_id}/events`
pub async fn trigger_event(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    method: Method,
    uri: Uri,
    Query(params): Query<Params>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let app = authorize(&state, &app_id, &method, &uri, &params, &body)?;
    let event: TriggerEvent = parse_body(&body)?;

    state.dispatcher.trigger(&app, &event).await?;
    metrics::record_api_events(1);
    Ok(Json(json!({})))
}

#[derive(Debug, Deserialize)]
struct Batch {
    batch: Vec<TriggerEvent>,
}

/// `POST /apps/{app_id}/batch_events`
pub async fn trigger_batch(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    method: Method,
    uri: Uri,
    Query(params): Query<Params>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let app = authorize(&state, &app_id, &method, &uri, &params, &body)?;
    let Batch { batch } = parse_body(&body)?;
    if batch.len() > MAX_BATCH_SIZE {
        return Err(ApiError::BadRequest(format!(
            "At most {MAX_BATCH_SIZE} events may be sent in a batch"
        )));
    }

    // Validate everything before publishing anything.
    for event in &batch {
        event.validate()?;
    }
    for event in &batch {
        state.dispatcher.trigger(&app, event).await?;
    }
    metrics::record_api_events(batch.len());
    Ok(Json(json!({})))
}

fn requested_info(params: &Params) -> Vec<&str> {
    params
        .get("info")
        .map(|info| info.split(',').map(str::trim).collect())
        .unwrap_or_default()
}

/// `GET /apps/{app_id}/channels`
pub async fn channels(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    method: Method,
    uri: Uri,
    Query(params): Query<Params>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &app_id, &method, &uri, &params, &[])?;

    let prefix = params.get("filter_by_prefix").map(String::as_str).unwrap_or("");
    let info = requested_info(&params);
    let want_users = info.contains(&"user_count");
    if want_users && !prefix.starts_with("presence-") {
        return Err(ApiError::BadRequest(
            "user_count requires filter_by_prefix=presence-".into(),
        ));
    }

    let manager = state.dispatcher.manager();
    let mut channels = Map::new();
    for (name, subscriptions) in manager.global_channels(&app_id).await {
        if !name.starts_with(prefix) {
            continue;
        }
        let mut attributes = Map::new();
        if want_users {
            let users = manager.channel_members(&app_id, &name).await.len();
            attributes.insert("user_count".into(), users.into());
        }
        if info.contains(&"subscription_count") {
            attributes.insert("subscription_count".into(), subscriptions.into());
        }
        channels.insert(name, Value::Object(attributes));
    }

    Ok(Json(json!({ "channels": channels })))
}

/// `GET /apps/{app_id}/channels/{channel}`
pub async fn channel(
    State(state): State<Arc<AppState>>,
    Path((app_id, channel)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    Query(params): Query<Params>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &app_id, &method, &uri, &params, &[])?;

    let manager = state.dispatcher.manager();
    let subscriptions = manager
        .global_channels(&app_id)
        .await
        .get(&channel)
        .copied()
        .unwrap_or(0);

    let mut body = json!({
        "occupied": subscriptions > 0,
        "subscription_count": subscriptions,
    });
    if ChannelKind::of(&channel).is_presence() {
        body["user_count"] = manager.channel_members(&app_id, &channel).await.len().into();
    }
    Ok(Json(body))
}

/// `GET /apps/{app_id}/channels/{channel}/users`
pub async fn channel_users(
    State(state): State<Arc<AppState>>,
    Path((app_id, channel)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    Query(params): Query<Params>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &app_id, &method, &uri, &params, &[])?;
    if !ChannelKind::of(&channel).is_presence() {
        return Err(ApiError::NotPresence);
    }

    let users: Vec<Value> = state
        .dispatcher
        .manager()
        .channel_members(&app_id, &channel)
        .await
        .into_keys()
        .map(|id| json!({ "id": id }))
        .collect();
    Ok(Json(json!({ "users": users })))
}

/// `GET /apps/{app_id}/statistics?from=&to=`
pub async fn statistics(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    Query(range): Query<TimeRange>,
) -> Result<Json<Value>, ApiError> {
    if state.dispatcher.apps().find_by_id(&app_id).is_none() {
        return Err(ApiError::AppNotFound);
    }
    let graph = state.store.graph(&app_id, range).await?;
    Ok(Json(json!(graph)))
}
