/**
 * API REST GASMON - Bulk-load et mutations lu/non lu
 *
 * RÔLE :
 * Expose alarmes et notifications persistées aux clients (chargement initial
 * avant le flux temps réel), l'état du kernel, et l'upgrade du canal push.
 *
 * FONCTIONNEMENT :
 * - GET /alarms[?plantName=&deviceName=], GET /alarms/device/{id}
 * - POST /alarms : normalise, insère, publie sur le canal `alarms` du bus
 *   (le kernel reçoit son propre message et le diffuse). Sans bus : diffusion directe
 * - PUT /alarms/{id}/read, PUT /alarms/read/all
 * - Même jeu de routes pour /notifications ; POST diffuse `notification` directement
 * - GET /health, GET /system/health, GET /ws
 *
 * UTILITÉ :
 * 🎯 Réponses au format canonique camelCase, quelle que soit la forme stockée
 * 🎯 Erreurs de stockage typées -> 404 / 409 / 422 / 500
 */

use crate::config::ChannelsConf;
use crate::health::{HealthTracker, KernelHealth};
use crate::push::{ws_handler, PushHub};
use crate::router::FanoutRouter;
use crate::store::{RecordQuery, Repository, StoreError};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use gasmon_common::{Alarm, BusPublish, CanonicalRecord, Normalizer, Notification};
use serde_json::{json, Map, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub alarms: Repository<Alarm>,
    pub notifications: Repository<Notification>,
    pub normalizer: Arc<Normalizer>,
    pub hub: PushHub,
    pub router: Arc<FanoutRouter>,
    pub health: HealthTracker,
    pub publisher: Option<Arc<dyn BusPublish>>,
    pub channels: ChannelsConf,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/ws", get(ws_handler))
        .route("/alarms", get(list_alarms).post(create_alarm))
        .route("/alarms/device/{id}", get(alarms_by_device))
        .route("/alarms/read/all", put(mark_all_alarms_read))
        .route("/alarms/{id}/read", put(mark_alarm_read))
        .route("/notifications", get(list_notifications).post(create_notification))
        .route("/notifications/device/{id}", get(notifications_by_device))
        .route("/notifications/read/all", put(mark_all_notifications_read))
        .route("/notifications/{id}/read", put(mark_notification_read))
        .with_state(app_state)
}

fn store_error(op: &'static str, e: StoreError) -> StatusCode {
    match e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        StoreError::InvalidDocument(_) => StatusCode::UNPROCESSABLE_ENTITY,
        StoreError::Serialization(_) | StoreError::Io(_) => {
            tracing::error!(op, error = %e, "store unavailable");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn as_object(body: Value) -> Result<Map<String, Value>, StatusCode> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(StatusCode::UNPROCESSABLE_ENTITY),
    }
}

// GET /system/health (état du kernel)
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health())
}

// GET /alarms
async fn list_alarms(
    State(app): State<AppState>,
    Query(query): Query<RecordQuery>,
) -> Result<Json<Vec<Alarm>>, StatusCode> {
    let alarms = app.alarms.list(&query).map_err(|e| store_error("list alarms", e))?;
    Ok(Json(alarms))
}

// GET /alarms/device/{id}
async fn alarms_by_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Alarm>>, StatusCode> {
    let alarms = app.alarms.by_device(&id).map_err(|e| store_error("alarms by device", e))?;
    Ok(Json(alarms))
}

// POST /alarms (création + publication sur le bus)
async fn create_alarm(
    State(app): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Alarm>), StatusCode> {
    let raw = as_object(body)?;
    let alarm = app.normalizer.alarm(&raw);
    let stored = app.alarms.insert(&alarm).map_err(|e| store_error("insert alarm", e))?;
    tracing::info!(id = %stored.id, code = %stored.alarm_code, device = %stored.device_id, "alarm created");

    let published = match &app.publisher {
        Some(publisher) => match serde_json::to_value(&stored) {
            Ok(message) => match publisher.publish(&app.channels.alarms, message).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(id = %stored.id, error = %e, "alarm publish failed, broadcasting directly");
                    false
                }
            },
            Err(e) => {
                tracing::warn!(id = %stored.id, error = %e, "alarm serialization failed, broadcasting directly");
                false
            }
        },
        None => false,
    };
    if !published {
        app.router.dispatch(&CanonicalRecord::Alarm(stored.clone()));
    }

    Ok((StatusCode::CREATED, Json(stored)))
}

// PUT /alarms/{id}/read
async fn mark_alarm_read(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Alarm>, StatusCode> {
    let alarm = app.alarms.mark_read(&id).map_err(|e| store_error("mark alarm read", e))?;
    Ok(Json(alarm))
}

// PUT /alarms/read/all
async fn mark_all_alarms_read(State(app): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let updated = app.alarms.mark_all_read().map_err(|e| store_error("mark all alarms read", e))?;
    Ok(Json(json!({ "updated": updated })))
}

// GET /notifications
async fn list_notifications(
    State(app): State<AppState>,
    Query(query): Query<RecordQuery>,
) -> Result<Json<Vec<Notification>>, StatusCode> {
    let notifications = app.notifications.list(&query).map_err(|e| store_error("list notifications", e))?;
    Ok(Json(notifications))
}

// GET /notifications/device/{id}
async fn notifications_by_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Notification>>, StatusCode> {
    let notifications = app
        .notifications
        .by_device(&id)
        .map_err(|e| store_error("notifications by device", e))?;
    Ok(Json(notifications))
}

// POST /notifications (création + diffusion `notification`)
async fn create_notification(
    State(app): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Notification>), StatusCode> {
    let raw = as_object(body)?;
    let notification = app.normalizer.notification(&raw);
    let stored = app
        .notifications
        .insert(&notification)
        .map_err(|e| store_error("insert notification", e))?;
    tracing::info!(id = %stored.id, kind = ?stored.kind, "notification created");

    app.router.dispatch(&CanonicalRecord::Notification(stored.clone()));
    Ok((StatusCode::CREATED, Json(stored)))
}

// PUT /notifications/{id}/read
async fn mark_notification_read(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Notification>, StatusCode> {
    let notification = app
        .notifications
        .mark_read(&id)
        .map_err(|e| store_error("mark notification read", e))?;
    Ok(Json(notification))
}

// PUT /notifications/read/all
async fn mark_all_notifications_read(State(app): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let updated = app
        .notifications
        .mark_all_read()
        .map_err(|e| store_error("mark all notifications read", e))?;
    Ok(Json(json!({ "updated": updated })))
}
