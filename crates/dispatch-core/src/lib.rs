//! Core orchestration for the dispatch system.
//!
//! Every order moves through a fixed status lifecycle. This crate owns the
//! rules of that lifecycle: which status changes are legal, who may perform
//! them, and how competing drivers are resolved when they claim the same
//! ready order. Persistence is delegated to `dispatch-storage`, which applies
//! each change as a single conditional update together with its audit entry.
//!
//! The crate is organised leaves first:
//! - [`state`]: the legality table for status changes
//! - [`authorization`]: who may perform each change, and who may see an order
//! - [`handlers`]: the assignment coordinator and the lifecycle service
//! - [`housekeeping`]: periodic cancellation of stale orders and archival
//! - [`engine`] and [`builder`]: wiring and the background loop

use dispatch_storage::StorageError;
use dispatch_types::{OrderId, OrderStatus, UserId};
use thiserror::Error;

pub mod authorization;
pub mod builder;
pub mod engine;
pub mod handlers;
pub mod housekeeping;
pub mod state;

pub use authorization::{AccessPolicy, Actor, ClaimsPolicy};
pub use builder::{BuilderError, DispatchBuilder, DispatchFactories};
pub use engine::{DispatchEngine, EngineError};
pub use handlers::{AssignmentCoordinator, LifecycleService};
pub use housekeeping::{HousekeepingReport, HousekeepingService};

/// Broad class of a lifecycle failure.
///
/// The HTTP layer maps each class onto one status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	NotFound,
	Validation,
	Authorization,
	Conflict,
	Storage,
}

/// Reasons a driver claim can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssignmentError {
	#[error("Order {0} not found")]
	OrderNotFound(OrderId),
	#[error("Order {0} is not active")]
	OrderNotActive(OrderId),
	#[error("Order {0} already has a driver assigned")]
	OrderAlreadyAssigned(OrderId),
	#[error("Order must be in 'ready' status to assign driver: current status: {current}")]
	OrderNotReady { order_id: OrderId, current: OrderStatus },
	#[error("Order {0} is not available for assignment")]
	OrderNotAvailable(OrderId),
	#[error("Driver {0} is not available")]
	DriverUnavailable(UserId),
}

impl AssignmentError {
	/// Stable error code reported to clients.
	pub fn code(&self) -> &'static str {
		match self {
			AssignmentError::OrderNotFound(_) => "ORDER_NOT_FOUND",
			AssignmentError::OrderNotActive(_) => "ORDER_NOT_ACTIVE",
			AssignmentError::OrderAlreadyAssigned(_) => "ORDER_ALREADY_ASSIGNED",
			AssignmentError::OrderNotReady { .. } => "ORDER_NOT_READY",
			AssignmentError::OrderNotAvailable(_) => "ORDER_NOT_AVAILABLE",
			AssignmentError::DriverUnavailable(_) => "DRIVER_UNAVAILABLE",
		}
	}

	pub fn kind(&self) -> ErrorKind {
		match self {
			AssignmentError::OrderNotFound(_) => ErrorKind::NotFound,
			AssignmentError::OrderAlreadyAssigned(_) => ErrorKind::Conflict,
			AssignmentError::OrderNotActive(_)
			| AssignmentError::OrderNotReady { .. }
			| AssignmentError::OrderNotAvailable(_)
			| AssignmentError::DriverUnavailable(_) => ErrorKind::Validation,
		}
	}
}

/// Errors returned by lifecycle operations.
///
/// None of these are retried inside the core; they are reported to the
/// caller as they happen.
#[derive(Debug, Error)]
pub enum LifecycleError {
	#[error("Order {0} not found")]
	NotFound(OrderId),
	#[error("Invalid status transition from {from} to {to}")]
	InvalidTransition { from: OrderStatus, to: OrderStatus },
	#[error("Validation error: {0}")]
	Validation(String),
	#[error("Not authorized: {0}")]
	Authorization(String),
	/// Another writer changed the order between the read and the update.
	#[error("Conflict: {0}")]
	Conflict(String),
	#[error(transparent)]
	Assignment(#[from] AssignmentError),
	#[error("Storage error: {0}")]
	Storage(String),
}

impl LifecycleError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			LifecycleError::NotFound(_) => ErrorKind::NotFound,
			LifecycleError::InvalidTransition { .. } | LifecycleError::Validation(_) => {
				ErrorKind::Validation
			},
			LifecycleError::Authorization(_) => ErrorKind::Authorization,
			LifecycleError::Conflict(_) => ErrorKind::Conflict,
			LifecycleError::Assignment(e) => e.kind(),
			LifecycleError::Storage(_) => ErrorKind::Storage,
		}
	}
}

impl From<StorageError> for LifecycleError {
	fn from(err: StorageError) -> Self {
		match err {
			StorageError::NotFound(id) => LifecycleError::NotFound(id),
			StorageError::Duplicate(id) => {
				LifecycleError::Conflict(format!("order {} already exists", id))
			},
			other => LifecycleError::Storage(other.to_string()),
		}
	}
}
