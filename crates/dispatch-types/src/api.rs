//! API types for the dispatch HTTP API.
//!
//! Request bodies accepted by the order endpoints and the structured error
//! type every handler returns on failure.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{MonetarySnapshot, NewOrderItem, Order, OrderId, OrderStatus, StatusHistoryEntry};

/// Request to create an order, as forwarded by the checkout flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
	pub restaurant_id: i64,
	#[serde(default)]
	pub delivery_address_id: Option<i64>,
	#[serde(default)]
	pub special_instructions: Option<String>,
	pub items: Vec<NewOrderItem>,
	pub amounts: MonetarySnapshot,
	/// Submit immediately instead of leaving the order in the cart.
	#[serde(default)]
	pub place: bool,
}

/// Body of the vendor confirmation endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfirmOrderRequest {
	#[serde(default)]
	pub estimated_preparation_minutes: Option<i64>,
	/// Drive time estimate from the geocoding collaborator.
	#[serde(default)]
	pub estimated_drive_minutes: Option<i64>,
}

/// Body of the driver status update endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvanceDeliveryRequest {
	pub status: OrderStatus,
	#[serde(default)]
	pub notes: Option<String>,
}

/// Body of the cancel and refund endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonRequest {
	pub reason: String,
}

/// List of orders returned by the listing endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderListResponse {
	pub orders: Vec<Order>,
	pub count: usize,
}

impl From<Vec<Order>> for OrderListResponse {
	fn from(orders: Vec<Order>) -> Self {
		Self {
			count: orders.len(),
			orders,
		}
	}
}

/// Audit trail of one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderHistoryResponse {
	pub order_id: OrderId,
	pub entries: Vec<StatusHistoryEntry>,
}

/// API error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
	/// Stable machine-readable error code.
	pub error: String,
	/// Human-readable description.
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub details: Option<serde_json::Value>,
}

/// Structured API error type with appropriate HTTP status mapping.
#[derive(Debug)]
pub enum APIError {
	/// Malformed request or illegal transition (400)
	BadRequest {
		error_type: String,
		message: String,
		details: Option<serde_json::Value>,
	},
	/// Missing or unusable identity (401)
	Unauthorized { message: String },
	/// Principal may not perform the operation (403)
	Forbidden { error_type: String, message: String },
	/// Order does not exist (404)
	NotFound { error_type: String, message: String },
	/// Lost a race against another writer (409)
	Conflict {
		error_type: String,
		message: String,
		details: Option<serde_json::Value>,
	},
	/// Internal server error (500)
	InternalServerError { error_type: String, message: String },
}

impl APIError {
	/// Get the HTTP status code for this error.
	pub fn status_code(&self) -> u16 {
		match self {
			APIError::BadRequest { .. } => 400,
			APIError::Unauthorized { .. } => 401,
			APIError::Forbidden { .. } => 403,
			APIError::NotFound { .. } => 404,
			APIError::Conflict { .. } => 409,
			APIError::InternalServerError { .. } => 500,
		}
	}

	/// Convert to ErrorResponse for JSON serialization.
	pub fn to_error_response(&self) -> ErrorResponse {
		let (error, message, details) = match self {
			APIError::BadRequest {
				error_type,
				message,
				details,
			}
			| APIError::Conflict {
				error_type,
				message,
				details,
			} => (error_type.clone(), message.clone(), details.clone()),
			APIError::Unauthorized { message } => {
				("UNAUTHORIZED".to_string(), message.clone(), None)
			},
			APIError::Forbidden {
				error_type,
				message,
			}
			| APIError::NotFound {
				error_type,
				message,
			}
			| APIError::InternalServerError {
				error_type,
				message,
			} => (error_type.clone(), message.clone(), None),
		};
		ErrorResponse {
			error,
			message,
			details,
		}
	}
}

impl fmt::Display for APIError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			APIError::BadRequest { message, .. } => write!(f, "Bad Request: {}", message),
			APIError::Unauthorized { message } => write!(f, "Unauthorized: {}", message),
			APIError::Forbidden { message, .. } => write!(f, "Forbidden: {}", message),
			APIError::NotFound { message, .. } => write!(f, "Not Found: {}", message),
			APIError::Conflict { message, .. } => write!(f, "Conflict: {}", message),
			APIError::InternalServerError { message, .. } => {
				write!(f, "Internal Server Error: {}", message)
			},
		}
	}
}

impl std::error::Error for APIError {}

impl axum::response::IntoResponse for APIError {
	fn into_response(self) -> axum::response::Response {
		use axum::{http::StatusCode, response::Json};

		let status = StatusCode::from_u16(self.status_code())
			.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
		(status, Json(self.to_error_response())).into_response()
	}
}
