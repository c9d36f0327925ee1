//! Order endpoints.
//!
//! Each function calls one lifecycle operation and converts its error into
//! the API error body: the stable code in `error`, a readable `message`, and
//! for rejected transitions the statuses involved in `details`.

use dispatch_core::{DispatchEngine, ErrorKind, LifecycleError};
use dispatch_types::{
	APIError, AdvanceDeliveryRequest, ConfirmOrderRequest, CreateOrderRequest, Order, OrderDetails,
	OrderHistoryResponse, OrderId, OrderListResponse, Principal,
};
use serde_json::json;

/// Converts a lifecycle failure into its HTTP representation.
pub fn api_error(err: LifecycleError) -> APIError {
	let message = err.to_string();
	match err {
		LifecycleError::Assignment(assignment) => {
			let error_type = assignment.code().to_string();
			match assignment.kind() {
				ErrorKind::NotFound => APIError::NotFound {
					error_type,
					message,
				},
				ErrorKind::Conflict => APIError::Conflict {
					error_type,
					message: "This order has already been assigned to another driver".into(),
					details: None,
				},
				_ => APIError::BadRequest {
					error_type,
					message,
					details: None,
				},
			}
		},
		LifecycleError::NotFound(_) => APIError::NotFound {
			error_type: "ORDER_NOT_FOUND".into(),
			message,
		},
		LifecycleError::InvalidTransition { from, to } => APIError::BadRequest {
			error_type: "INVALID_TRANSITION".into(),
			message,
			details: Some(json!({ "from": from, "to": to })),
		},
		LifecycleError::Validation(_) => APIError::BadRequest {
			error_type: "VALIDATION_ERROR".into(),
			message,
			details: None,
		},
		LifecycleError::Authorization(_) => APIError::Forbidden {
			error_type: "FORBIDDEN".into(),
			message,
		},
		LifecycleError::Conflict(_) => APIError::Conflict {
			error_type: "CONFLICT".into(),
			message,
			details: None,
		},
		LifecycleError::Storage(_) => {
			tracing::error!(error = %message, "Storage failure while handling request");
			APIError::InternalServerError {
				error_type: "STORAGE_ERROR".into(),
				message: "Failed to access order storage".into(),
			}
		},
	}
}

pub async fn create_order(
	engine: &DispatchEngine,
	principal: &Principal,
	request: CreateOrderRequest,
) -> Result<Order, APIError> {
	engine
		.lifecycle()
		.create_order(principal, request)
		.await
		.map_err(api_error)
}

pub async fn get_order(
	engine: &DispatchEngine,
	principal: &Principal,
	order_id: OrderId,
) -> Result<OrderDetails, APIError> {
	engine
		.lifecycle()
		.get_order(order_id, principal)
		.await
		.map_err(api_error)
}

pub async fn get_order_history(
	engine: &DispatchEngine,
	principal: &Principal,
	order_id: OrderId,
) -> Result<OrderHistoryResponse, APIError> {
	let entries = engine
		.lifecycle()
		.get_order_history(order_id, principal)
		.await
		.map_err(api_error)?;
	Ok(OrderHistoryResponse { order_id, entries })
}

pub async fn place_order(
	engine: &DispatchEngine,
	principal: &Principal,
	order_id: OrderId,
) -> Result<Order, APIError> {
	engine
		.lifecycle()
		.place_order(order_id, principal)
		.await
		.map_err(api_error)
}

pub async fn confirm_order(
	engine: &DispatchEngine,
	principal: &Principal,
	order_id: OrderId,
	request: ConfirmOrderRequest,
) -> Result<Order, APIError> {
	engine
		.lifecycle()
		.confirm_order(order_id, principal, request)
		.await
		.map_err(api_error)
}

pub async fn start_preparing(
	engine: &DispatchEngine,
	principal: &Principal,
	order_id: OrderId,
) -> Result<Order, APIError> {
	engine
		.lifecycle()
		.start_preparing(order_id, principal)
		.await
		.map_err(api_error)
}

pub async fn mark_ready(
	engine: &DispatchEngine,
	principal: &Principal,
	order_id: OrderId,
) -> Result<Order, APIError> {
	engine
		.lifecycle()
		.mark_ready(order_id, principal)
		.await
		.map_err(api_error)
}

pub async fn claim_order(
	engine: &DispatchEngine,
	principal: &Principal,
	order_id: OrderId,
) -> Result<Order, APIError> {
	engine
		.lifecycle()
		.claim_order(order_id, principal)
		.await
		.map_err(api_error)
}

pub async fn advance_delivery(
	engine: &DispatchEngine,
	principal: &Principal,
	order_id: OrderId,
	request: AdvanceDeliveryRequest,
) -> Result<Order, APIError> {
	engine
		.lifecycle()
		.advance_delivery(order_id, principal, request.status, request.notes)
		.await
		.map_err(api_error)
}

pub async fn cancel_order(
	engine: &DispatchEngine,
	principal: &Principal,
	order_id: OrderId,
	reason: &str,
) -> Result<Order, APIError> {
	engine
		.lifecycle()
		.cancel_order(order_id, principal, reason)
		.await
		.map_err(api_error)
}

pub async fn refund_order(
	engine: &DispatchEngine,
	principal: &Principal,
	order_id: OrderId,
	reason: &str,
) -> Result<Order, APIError> {
	engine
		.lifecycle()
		.refund_order(order_id, principal, reason)
		.await
		.map_err(api_error)
}

pub async fn list_available_orders(
	engine: &DispatchEngine,
	principal: &Principal,
) -> Result<OrderListResponse, APIError> {
	engine
		.lifecycle()
		.list_available_orders(principal)
		.await
		.map(OrderListResponse::from)
		.map_err(api_error)
}

pub async fn list_driver_orders(
	engine: &DispatchEngine,
	principal: &Principal,
) -> Result<OrderListResponse, APIError> {
	engine
		.lifecycle()
		.list_driver_orders(principal)
		.await
		.map(OrderListResponse::from)
		.map_err(api_error)
}
