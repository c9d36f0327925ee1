//! HTTP server for the dispatch API.
//!
//! Every endpoint lives under `/api`. The caller's identity comes from the
//! gateway headers (see [`AuthenticatedPrincipal`]), request bodies are JSON
//! and failures are returned as the structured [`APIError`] body.

use axum::{
	extract::{DefaultBodyLimit, Path, State},
	http::{HeaderValue, StatusCode},
	response::Json,
	routing::{get, post},
	Router,
};
use dispatch_config::ApiConfig;
use dispatch_core::DispatchEngine;
use dispatch_types::{
	APIError, AdvanceDeliveryRequest, ConfirmOrderRequest, CreateOrderRequest, Order, OrderDetails,
	OrderHistoryResponse, OrderId, OrderListResponse, ReasonRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
	cors::{AllowOrigin, Any, CorsLayer},
	timeout::TimeoutLayer,
	trace::TraceLayer,
};

use crate::apis::{order, principal::AuthenticatedPrincipal};

/// Shared application state for the API server.
#[derive(Clone)]
pub struct AppState {
	/// Engine whose lifecycle service handles every request.
	pub engine: Arc<DispatchEngine>,
}

/// Builds the API router with its middleware stack.
pub fn router(state: AppState, api_config: &ApiConfig) -> Router {
	let api = Router::new()
		.route("/orders", post(handle_create_order))
		.route("/orders/{id}", get(handle_get_order))
		.route("/orders/{id}/history", get(handle_get_history))
		.route("/orders/{id}/place", post(handle_place))
		.route("/orders/{id}/confirm", post(handle_confirm))
		.route("/orders/{id}/preparing", post(handle_start_preparing))
		.route("/orders/{id}/ready", post(handle_mark_ready))
		.route("/orders/{id}/claim", post(handle_claim))
		.route("/orders/{id}/status", post(handle_advance_delivery))
		.route("/orders/{id}/cancel", post(handle_cancel))
		.route("/orders/{id}/refund", post(handle_refund))
		.route("/driver/orders/available", get(handle_available_orders))
		.route("/driver/orders", get(handle_driver_orders));

	Router::new()
		.nest("/api", api)
		.layer(
			ServiceBuilder::new()
				.layer(TraceLayer::new_for_http())
				.layer(cors_layer(api_config))
				.layer(TimeoutLayer::new(Duration::from_secs(
					api_config.timeout_seconds,
				))),
		)
		.layer(DefaultBodyLimit::max(api_config.max_request_size))
		.with_state(state)
}

fn cors_layer(api_config: &ApiConfig) -> CorsLayer {
	let Some(cors) = &api_config.cors else {
		return CorsLayer::permissive();
	};

	let origins: Vec<HeaderValue> = cors
		.allowed_origins
		.iter()
		.filter_map(|origin| match origin.parse::<HeaderValue>() {
			Ok(value) => Some(value),
			Err(_) => {
				tracing::warn!(%origin, "Ignoring invalid CORS origin");
				None
			},
		})
		.collect();

	CorsLayer::new()
		.allow_origin(AllowOrigin::list(origins))
		.allow_methods(Any)
		.allow_headers(Any)
}

/// Starts the HTTP server for the API.
pub async fn start_server(
	api_config: ApiConfig,
	engine: Arc<DispatchEngine>,
) -> Result<(), Box<dyn std::error::Error>> {
	let app = router(AppState { engine }, &api_config);

	let bind_address = format!("{}:{}", api_config.host, api_config.port);
	let listener = TcpListener::bind(&bind_address).await?;

	tracing::info!("Dispatch API server starting on {}", bind_address);

	axum::serve(listener, app).await?;

	Ok(())
}

/// Logs a failed request before handing the error to axum.
fn rejected<T>(operation: &str, result: Result<T, APIError>) -> Result<T, APIError> {
	if let Err(e) = &result {
		tracing::warn!(operation, status = e.status_code(), "Request failed: {}", e);
	}
	result
}

/// Handles POST /api/orders.
async fn handle_create_order(
	State(state): State<AppState>,
	AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
	Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<Order>), APIError> {
	let order = rejected(
		"create_order",
		order::create_order(&state.engine, &principal, request).await,
	)?;
	Ok((StatusCode::CREATED, Json(order)))
}

/// Handles GET /api/orders/{id}.
async fn handle_get_order(
	Path(id): Path<OrderId>,
	State(state): State<AppState>,
	AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> Result<Json<OrderDetails>, APIError> {
	rejected("get_order", order::get_order(&state.engine, &principal, id).await).map(Json)
}

/// Handles GET /api/orders/{id}/history.
async fn handle_get_history(
	Path(id): Path<OrderId>,
	State(state): State<AppState>,
	AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> Result<Json<OrderHistoryResponse>, APIError> {
	rejected(
		"get_order_history",
		order::get_order_history(&state.engine, &principal, id).await,
	)
	.map(Json)
}

/// Handles POST /api/orders/{id}/place.
async fn handle_place(
	Path(id): Path<OrderId>,
	State(state): State<AppState>,
	AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> Result<Json<Order>, APIError> {
	rejected("place_order", order::place_order(&state.engine, &principal, id).await).map(Json)
}

/// Handles POST /api/orders/{id}/confirm.
async fn handle_confirm(
	Path(id): Path<OrderId>,
	State(state): State<AppState>,
	AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
	Json(request): Json<ConfirmOrderRequest>,
) -> Result<Json<Order>, APIError> {
	rejected(
		"confirm_order",
		order::confirm_order(&state.engine, &principal, id, request).await,
	)
	.map(Json)
}

async fn handle_start_preparing(
	Path(id): Path<OrderId>,
	State(state): State<AppState>,
	AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> Result<Json<Order>, APIError> {
	rejected(
		"start_preparing",
		order::start_preparing(&state.engine, &principal, id).await,
	)
	.map(Json)
}

async fn handle_mark_ready(
	Path(id): Path<OrderId>,
	State(state): State<AppState>,
	AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> Result<Json<Order>, APIError> {
	rejected("mark_ready", order::mark_ready(&state.engine, &principal, id).await).map(Json)
}

/// Handles POST /api/orders/{id}/claim.
///
/// Only one driver can win a given order; everybody else gets a 409.
async fn handle_claim(
	Path(id): Path<OrderId>,
	State(state): State<AppState>,
	AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> Result<Json<Order>, APIError> {
	rejected("claim_order", order::claim_order(&state.engine, &principal, id).await).map(Json)
}

/// Handles POST /api/orders/{id}/status.
async fn handle_advance_delivery(
	Path(id): Path<OrderId>,
	State(state): State<AppState>,
	AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
	Json(request): Json<AdvanceDeliveryRequest>,
) -> Result<Json<Order>, APIError> {
	rejected(
		"advance_delivery",
		order::advance_delivery(&state.engine, &principal, id, request).await,
	)
	.map(Json)
}

async fn handle_cancel(
	Path(id): Path<OrderId>,
	State(state): State<AppState>,
	AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
	Json(request): Json<ReasonRequest>,
) -> Result<Json<Order>, APIError> {
	rejected(
		"cancel_order",
		order::cancel_order(&state.engine, &principal, id, &request.reason).await,
	)
	.map(Json)
}

async fn handle_refund(
	Path(id): Path<OrderId>,
	State(state): State<AppState>,
	AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
	Json(request): Json<ReasonRequest>,
) -> Result<Json<Order>, APIError> {
	rejected(
		"refund_order",
		order::refund_order(&state.engine, &principal, id, &request.reason).await,
	)
	.map(Json)
}

/// Handles GET /api/driver/orders/available.
async fn handle_available_orders(
	State(state): State<AppState>,
	AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> Result<Json<OrderListResponse>, APIError> {
	rejected(
		"list_available_orders",
		order::list_available_orders(&state.engine, &principal).await,
	)
	.map(Json)
}

/// Handles GET /api/driver/orders.
async fn handle_driver_orders(
	State(state): State<AppState>,
	AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> Result<Json<OrderListResponse>, APIError> {
	rejected(
		"list_driver_orders",
		order::list_driver_orders(&state.engine, &principal).await,
	)
	.map(Json)
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::body::{to_bytes, Body};
	use axum::http::{Method, Request};
	use dispatch_config::Config;
	use dispatch_core::{DispatchBuilder, DispatchFactories};
	use dispatch_storage::StorageFactory;
	use serde_json::{json, Value};
	use std::collections::HashMap;
	use tower::ServiceExt;

	const CONFIG: &str = r#"
[service]
id = "server-test"

[storage]
primary = "memory"

[storage.implementations.memory]

[api]
enabled = true
"#;

	#[derive(Clone, Copy)]
	enum As {
		Nobody,
		Customer,
		Vendor,
		Driver(i64),
	}

	fn app() -> Router {
		let config: Config = CONFIG.parse().unwrap();
		let api_config = config.api.clone().unwrap();
		let storage_factories: HashMap<String, StorageFactory> = dispatch_storage::get_all_implementations()
			.into_iter()
			.map(|(name, factory)| (name.to_string(), factory))
			.collect();
		let engine = DispatchBuilder::new(config)
			.build(DispatchFactories { storage_factories })
			.unwrap();
		router(
			AppState {
				engine: Arc::new(engine),
			},
			&api_config,
		)
	}

	async fn call(app: &Router, method: Method, uri: &str, who: As, body: Option<Value>) -> (StatusCode, Value) {
		let mut builder = Request::builder().method(method).uri(uri);
		builder = match who {
			As::Nobody => builder,
			As::Customer => builder
				.header("x-user-id", "100")
				.header("x-user-role", "customer"),
			As::Vendor => builder
				.header("x-user-id", "200")
				.header("x-user-role", "vendor")
				.header("x-restaurant-ids", "7"),
			As::Driver(id) => builder
				.header("x-user-id", id.to_string())
				.header("x-user-role", "driver")
				.header("x-driver-available", "true"),
		};
		let request = match body {
			Some(body) => builder
				.header("content-type", "application/json")
				.body(Body::from(body.to_string()))
				.unwrap(),
			None => builder.body(Body::empty()).unwrap(),
		};

		let response = app.clone().oneshot(request).await.unwrap();
		let status = response.status();
		let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		let value = if bytes.is_empty() {
			Value::Null
		} else {
			serde_json::from_slice(&bytes).unwrap()
		};
		(status, value)
	}

	fn new_order() -> Value {
		json!({
			"restaurant_id": 7,
			"items": [{
				"name": "Pad thai",
				"unit_price": "11.50",
				"quantity": 2,
				"line_total": "23.00"
			}],
			"amounts": {
				"subtotal": "23.00",
				"tax": "2.30",
				"delivery_fee": "3.00",
				"total": "28.30"
			},
			"place": true
		})
	}

	async fn create(app: &Router) -> i64 {
		let (status, body) = call(app, Method::POST, "/api/orders", As::Customer, Some(new_order())).await;
		assert_eq!(status, StatusCode::CREATED);
		assert_eq!(body["status"], "pending");
		body["id"].as_i64().unwrap()
	}

	async fn ready(app: &Router) -> i64 {
		let id = create(app).await;
		let (status, _) = call(
			app,
			Method::POST,
			&format!("/api/orders/{id}/confirm"),
			As::Vendor,
			Some(json!({ "estimated_preparation_minutes": 15 })),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		for step in ["preparing", "ready"] {
			let (status, _) = call(app, Method::POST, &format!("/api/orders/{id}/{step}"), As::Vendor, None).await;
			assert_eq!(status, StatusCode::OK);
		}
		id
	}

	#[tokio::test]
	async fn test_missing_identity_is_unauthorized() {
		let app = app();
		let (status, body) = call(&app, Method::GET, "/api/driver/orders/available", As::Nobody, None).await;
		assert_eq!(status, StatusCode::UNAUTHORIZED);
		assert_eq!(body["error"], "UNAUTHORIZED");
	}

	#[tokio::test]
	async fn test_claim_flow() {
		let app = app();
		let id = ready(&app).await;

		let (status, body) = call(&app, Method::GET, "/api/driver/orders/available", As::Driver(41), None).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["count"], 1);

		let (status, body) = call(&app, Method::POST, &format!("/api/orders/{id}/claim"), As::Driver(41), None).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["status"], "driver_assigned");
		assert_eq!(body["driver_id"], 41);

		let (status, body) = call(&app, Method::POST, &format!("/api/orders/{id}/claim"), As::Driver(42), None).await;
		assert_eq!(status, StatusCode::CONFLICT);
		assert_eq!(body["error"], "ORDER_ALREADY_ASSIGNED");
		assert_eq!(
			body["message"],
			"This order has already been assigned to another driver"
		);

		let (status, body) = call(
			&app,
			Method::POST,
			&format!("/api/orders/{id}/status"),
			As::Driver(41),
			Some(json!({ "status": "picked_up" })),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["status"], "picked_up");

		let (status, body) = call(&app, Method::GET, &format!("/api/orders/{id}/history"), As::Customer, None).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["entries"].as_array().unwrap().len(), 6);
	}

	#[tokio::test]
	async fn test_claim_before_ready() {
		let app = app();
		let id = create(&app).await;

		let (status, body) = call(&app, Method::POST, &format!("/api/orders/{id}/claim"), As::Driver(41), None).await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert_eq!(body["error"], "ORDER_NOT_READY");
	}

	#[tokio::test]
	async fn test_unknown_order() {
		let app = app();
		let (status, body) = call(&app, Method::POST, "/api/orders/999/claim", As::Driver(41), None).await;
		assert_eq!(status, StatusCode::NOT_FOUND);
		assert_eq!(body["error"], "ORDER_NOT_FOUND");
	}

	#[tokio::test]
	async fn test_driver_cannot_confirm() {
		let app = app();
		let id = create(&app).await;

		let (status, body) = call(
			&app,
			Method::POST,
			&format!("/api/orders/{id}/confirm"),
			As::Driver(41),
			Some(json!({})),
		)
		.await;
		assert_eq!(status, StatusCode::FORBIDDEN);
		assert_eq!(body["error"], "FORBIDDEN");
	}

	#[tokio::test]
	async fn test_illegal_transition_reports_statuses() {
		let app = app();
		let id = create(&app).await;

		let (status, body) = call(&app, Method::POST, &format!("/api/orders/{id}/ready"), As::Vendor, None).await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert_eq!(body["error"], "INVALID_TRANSITION");
		assert_eq!(body["details"]["from"], "pending");
		assert_eq!(body["details"]["to"], "ready");
	}
}
