use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use tracing::{debug, error};

use crate::cache::AggregateCache;
use crate::error::StoreError;
use crate::models::OrderAggregate;

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<AggregateCache>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

/// Maps a lookup failure to a response without exposing its details.
fn lookup_error(order_uid: &str, resource: &str, err: StoreError) -> ApiError {
    match err {
        StoreError::NotFound => {
            debug!("{} not found for order {}", resource, order_uid);
            api_error(StatusCode::NOT_FOUND, &format!("{} not found", resource))
        }
        other => {
            error!("Failed to load {} for order {}: {}", resource, order_uid, other);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/order/:id", get(get_order))
        .route("/order/", get(missing_order_id))
        .route("/order", get(missing_order_id))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

/// Resolves order, delivery, payment and items in that order. The first
/// missing part ends the request; a partial aggregate is never returned.
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_uid): Path<String>,
) -> Result<Response, ApiError> {
    if order_uid.trim().is_empty() {
        return Err(missing_order_id().await);
    }

    let cache = &state.cache;

    let order = cache
        .get_order(&order_uid)
        .await
        .map_err(|e| lookup_error(&order_uid, "order", e))?;
    let delivery = cache
        .get_delivery(&order_uid)
        .await
        .map_err(|e| lookup_error(&order_uid, "delivery", e))?;
    let payment = cache
        .get_payment(&order_uid)
        .await
        .map_err(|e| lookup_error(&order_uid, "payment", e))?;
    let items = cache
        .get_items(&order_uid)
        .await
        .map_err(|e| lookup_error(&order_uid, "items", e))?;

    let aggregate = OrderAggregate {
        order,
        delivery,
        payment,
        items,
    };

    match serde_json::to_vec(&aggregate) {
        Ok(body) => Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response()),
        Err(e) => {
            error!("Failed to encode order {}: {}", order_uid, e);
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode response",
            ))
        }
    }
}

pub async fn missing_order_id() -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "order id is required")
}

pub async fn health_check() -> &'static str {
    "OK"
}
