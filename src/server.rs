use std::{net::SocketAddr, path::PathBuf};

use axum::{
    extract::{Extension, Path},
    handler::{get, post},
    http::StatusCode,
    AddExtensionLayer, Json, Router,
};
use chrono::{DateTime, Utc};
use governor::Quota;
use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};
use tower::{layer::layer_fn, ServiceBuilder};
use tower_http::trace::TraceLayer;

use crate::logging::{LogError, WebResult};
use crate::model::Preferences;
use crate::push::VapidConfig;
use crate::rate_limiter::{shared_limiter, RateLimiterMiddleware};
use crate::schedule::{spawn_timers, Dispatcher};
use crate::server_state::ServerState;
use crate::store::Store;

async fn status() -> &'static str {
    "ok"
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VapidKeyInfo {
    configured: bool,
    public_key: Option<String>,
}

async fn vapid_key(Extension(state): Extension<ServerState>) -> Json<VapidKeyInfo> {
    Json(VapidKeyInfo {
        configured: state.vapid_public_key.is_some(),
        public_key: state.vapid_public_key.clone(),
    })
}

#[derive(Deserialize)]
struct SubscriptionKeys {
    p256dh: String,
    auth: String,
}

#[derive(Deserialize)]
struct SubscribeRequest {
    endpoint: String,
    keys: SubscriptionKeys,
}

fn validate(request: &SubscribeRequest) -> anyhow::Result<()> {
    if request.endpoint.trim().is_empty() {
        anyhow::bail!("Subscription is missing an endpoint.");
    }
    if request.keys.p256dh.trim().is_empty() || request.keys.auth.trim().is_empty() {
        anyhow::bail!("Subscription is missing its crypto keys.");
    }

    Ok(())
}

async fn subscribe(
    Path(user_id): Path<String>,
    Extension(state): Extension<ServerState>,
    Json(request): Json<SubscribeRequest>,
) -> WebResult<StatusCode> {
    validate(&request).log_error_bad_request()?;

    state
        .store
        .replace_subscription(
            &user_id,
            &request.endpoint,
            &request.keys.p256dh,
            &request.keys.auth,
            Utc::now(),
        )
        .log_error_internal()?;

    Ok(StatusCode::CREATED)
}

async fn unsubscribe(
    Path(user_id): Path<String>,
    Extension(state): Extension<ServerState>,
) -> WebResult<StatusCode> {
    state
        .store
        .delete_subscription(&user_id)
        .log_error_internal()?;

    Ok(StatusCode::NO_CONTENT)
}

async fn get_preferences(
    Path(user_id): Path<String>,
    Extension(state): Extension<ServerState>,
) -> WebResult<Json<Preferences>> {
    let preferences = state.store.preferences(&user_id).log_error_internal()?;

    Ok(Json(preferences))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreferencesPatch {
    daily_reminder: Option<bool>,
    friend_posts: Option<bool>,
}

async fn update_preferences(
    Path(user_id): Path<String>,
    Extension(state): Extension<ServerState>,
    Json(patch): Json<PreferencesPatch>,
) -> WebResult<Json<Preferences>> {
    let updated = state
        .store
        .update_preferences(&user_id, patch.daily_reminder, patch.friend_posts, Utc::now())
        .log_error_internal()?;

    Ok(Json(updated))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleInfo {
    scheduled_time: Option<DateTime<Utc>>,
    generated_at: Option<DateTime<Utc>>,
}

async fn schedule_info(Extension(state): Extension<ServerState>) -> WebResult<Json<ScheduleInfo>> {
    let schedule = state.store.schedule().log_error_internal()?;

    Ok(Json(ScheduleInfo {
        scheduled_time: schedule.map(|s| s.scheduled_time),
        generated_at: schedule.map(|s| s.generated_at),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostCreatedEvent {
    poster_id: String,
    poster_display_name: String,
}

/// Hook called by the posts service after a post commits. Delivery runs in
/// the background; the caller never waits on fan-out.
async fn post_created(
    Extension(state): Extension<ServerState>,
    Json(event): Json<PostCreatedEvent>,
) -> StatusCode {
    let notifier = state.notifier.clone();

    tokio::spawn(async move {
        match notifier
            .notify_friend_posted(&event.poster_id, &event.poster_display_name)
            .await
        {
            Ok(delivered) => {
                tracing::info!(%delivered, poster_id = %event.poster_id, "Friend-post fan-out finished.")
            }
            Err(error) => tracing::error!(?error, "Friend-post fan-out failed."),
        }
    });

    StatusCode::ACCEPTED
}

pub async fn serve(port: Option<u16>, db: Option<PathBuf>) -> anyhow::Result<()> {
    let port: u16 = if let Some(port) = port {
        port
    } else if let Ok(port) = std::env::var("PORT") {
        port.parse()?
    } else {
        8080
    };

    let db_path = match db {
        Some(path) => path,
        None => std::env::var("NUDGE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("nudge.db")),
    };

    let store = Store::open(&db_path)?;
    let state = ServerState::new(store.clone(), VapidConfig::from_env()?);

    let dispatcher = Dispatcher::new(store, state.notifier.clone());
    spawn_timers(&dispatcher);

    let quota = Quota::per_minute(nonzero!(60u32));
    let limiter = shared_limiter(quota);

    let app = Router::new()
        .route("/", get(status))
        .route("/api/vapid-key", get(vapid_key))
        .route(
            "/api/users/:user_id/subscription",
            post(subscribe).delete(unsubscribe),
        )
        .route(
            "/api/users/:user_id/preferences",
            get(get_preferences).patch(update_preferences),
        )
        .route("/api/schedule", get(schedule_info))
        .route("/api/events/post-created", post(post_created))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(layer_fn(move |inner| {
                    RateLimiterMiddleware::new(inner, limiter.clone(), quota)
                }))
                .layer(AddExtensionLayer::new(state)),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("listening on {}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
