//! Storage module for the dispatch system.
//!
//! Orders, their line items and their status history are persisted through
//! the [`OrderStoreInterface`] trait. Every status mutation goes through a
//! single conditional [`Transition`] which the backend applies atomically
//! together with the matching history entry, or not at all.
//!
//! Two backends are provided: `sqlite` for durable deployments and `memory`
//! for tests and local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_types::{
	ConfigSchema, ImplementationRegistry, NewOrder, Order, OrderId, OrderItem, OrderStatus,
	StatusHistoryEntry, UserId,
};
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod memory;
	pub mod sqlite;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	/// The requested order does not exist.
	#[error("Order {0} not found")]
	NotFound(OrderId),
	/// An externally supplied order id is already taken.
	#[error("Order {0} already exists")]
	Duplicate(OrderId),
	/// A row would have violated a storage-level invariant.
	#[error("Constraint violation: {0}")]
	Constraint(String),
	/// Error that occurs during serialization/deserialization.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// Error that occurs in the storage backend.
	#[error("Backend error: {0}")]
	Backend(String),
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Audit information written to the history log with a status change.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
	/// Principal that caused the change, empty for system jobs.
	pub actor_id: Option<UserId>,
	pub note: Option<String>,
	/// Opaque JSON object stored verbatim.
	pub metadata: serde_json::Value,
}

impl Default for StatusChange {
	fn default() -> Self {
		Self {
			actor_id: None,
			note: None,
			metadata: serde_json::Value::Object(serde_json::Map::new()),
		}
	}
}

impl StatusChange {
	/// A change made by a housekeeping job.
	pub fn system() -> Self {
		Self::default()
	}

	/// A change made by the given principal.
	pub fn by(actor_id: UserId) -> Self {
		Self {
			actor_id: Some(actor_id),
			..Self::default()
		}
	}

	pub fn with_note(mut self, note: impl Into<String>) -> Self {
		self.note = Some(note.into());
		self
	}

	pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
		self.metadata = metadata;
		self
	}
}

/// A conditional status mutation.
///
/// The mutation applies only if the stored order is still in `expected_from`
/// and every additional precondition holds; otherwise nothing is written and
/// the backend reports [`TransitionOutcome::PreconditionFailed`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
	pub order_id: OrderId,
	pub expected_from: OrderStatus,
	pub to: OrderStatus,
	/// Also require that no driver holds the order.
	pub require_unassigned: bool,
	/// Also require that the order has not been archived.
	pub require_active: bool,
	/// Also require that this driver holds the order.
	pub expected_driver: Option<UserId>,
	/// Driver to record on the order.
	pub assign_driver: Option<UserId>,
	pub cancellation_reason: Option<String>,
	pub estimated_preparation_minutes: Option<i64>,
	pub estimated_delivery_at: Option<DateTime<Utc>>,
	pub change: StatusChange,
}

impl Transition {
	pub fn new(order_id: OrderId, expected_from: OrderStatus, to: OrderStatus) -> Self {
		Self {
			order_id,
			expected_from,
			to,
			require_unassigned: false,
			require_active: false,
			expected_driver: None,
			assign_driver: None,
			cancellation_reason: None,
			estimated_preparation_minutes: None,
			estimated_delivery_at: None,
			change: StatusChange::default(),
		}
	}

	pub fn require_unassigned(mut self) -> Self {
		self.require_unassigned = true;
		self
	}

	pub fn require_active(mut self) -> Self {
		self.require_active = true;
		self
	}

	pub fn held_by(mut self, driver_id: UserId) -> Self {
		self.expected_driver = Some(driver_id);
		self
	}

	pub fn assign_driver(mut self, driver_id: UserId) -> Self {
		self.assign_driver = Some(driver_id);
		self
	}

	pub fn cancellation_reason(mut self, reason: impl Into<String>) -> Self {
		self.cancellation_reason = Some(reason.into());
		self
	}

	pub fn estimates(
		mut self,
		preparation_minutes: Option<i64>,
		delivery_at: Option<DateTime<Utc>>,
	) -> Self {
		self.estimated_preparation_minutes = preparation_minutes;
		self.estimated_delivery_at = delivery_at;
		self
	}

	pub fn with_change(mut self, change: StatusChange) -> Self {
		self.change = change;
		self
	}

	/// Whether the stored order satisfies every precondition.
	pub fn matches(&self, order: &Order) -> bool {
		order.id == self.order_id
			&& order.status == self.expected_from
			&& (!self.require_unassigned || order.driver_id.is_none())
			&& (!self.require_active || order.is_active)
			&& self
				.expected_driver
				.is_none_or(|driver| order.driver_id == Some(driver))
	}

	/// Applies the mutation to an in-memory copy of the order.
	pub fn apply(&self, order: &mut Order, now: DateTime<Utc>) {
		order.status = self.to;
		if let Some(driver) = self.assign_driver {
			order.driver_id = Some(driver);
		}
		if let Some(reason) = &self.cancellation_reason {
			order.cancellation_reason = Some(reason.clone());
		}
		if let Some(minutes) = self.estimated_preparation_minutes {
			order.estimated_preparation_minutes = Some(minutes);
		}
		if let Some(at) = self.estimated_delivery_at {
			order.estimated_delivery_at = Some(at);
		}
		order.stamp_entered(self.to, now);
		order.updated_at = now;
	}
}

/// Result of a conditional mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
	/// The mutation was applied; carries the post-update row.
	Applied(Order),
	/// Zero rows matched the preconditions. Nothing was written.
	PreconditionFailed,
}

/// Trait defining the interface for order storage backends.
///
/// Backends must enforce the driver/status consistency invariant themselves,
/// independent of the callers, and must write the history entry for every
/// creation and transition in the same unit of work as the order row.
#[async_trait]
pub trait OrderStoreInterface: Send + Sync {
	/// Prepares the backend (schema creation, migrations). Called once at startup.
	async fn initialize(&self) -> Result<(), StorageError> {
		Ok(())
	}

	/// Inserts a new order with its items and the creation history entry.
	async fn create(&self, order: NewOrder, change: StatusChange) -> Result<Order, StorageError>;

	/// Loads an order by id.
	async fn get(&self, id: OrderId) -> Result<Order, StorageError>;

	/// Loads the line items of an order.
	async fn items(&self, id: OrderId) -> Result<Vec<OrderItem>, StorageError>;

	/// Orders a driver may claim: ready, unassigned and active.
	async fn list_available(&self) -> Result<Vec<Order>, StorageError>;

	/// Active orders currently held by a driver.
	async fn list_by_driver(&self, driver_id: UserId) -> Result<Vec<Order>, StorageError>;

	/// Applies a conditional status mutation.
	async fn transition(&self, transition: Transition) -> Result<TransitionOutcome, StorageError>;

	/// Status history of an order, oldest first.
	async fn history(&self, id: OrderId) -> Result<Vec<StatusHistoryEntry>, StorageError>;

	/// Active pending orders placed before `cutoff`.
	async fn list_pending_placed_before(
		&self,
		cutoff: DateTime<Utc>,
	) -> Result<Vec<Order>, StorageError>;

	/// Marks delivered, cancelled and refunded orders last touched before
	/// `cutoff` as inactive. Returns the number of archived orders.
	async fn archive_closed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError>;

	/// Returns the configuration schema for validation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;
}

/// Type alias for storage factory functions.
pub type StorageFactory = fn(&toml::Value) -> Result<Box<dyn OrderStoreInterface>, StorageError>;

/// Registry trait for storage implementations.
pub trait StorageRegistry: ImplementationRegistry<Factory = StorageFactory> {}

/// Get all registered storage implementations.
pub fn get_all_implementations() -> Vec<(&'static str, StorageFactory)> {
	use implementations::{memory, sqlite};

	vec![
		(memory::Registry::NAME, memory::Registry::factory()),
		(sqlite::Registry::NAME, sqlite::Registry::factory()),
	]
}

/// High-level storage service used by the lifecycle layer.
///
/// Wraps a backend and applies the checks common to every backend before
/// delegating to it.
pub struct StorageService {
	backend: Box<dyn OrderStoreInterface>,
}

impl StorageService {
	pub fn new(backend: Box<dyn OrderStoreInterface>) -> Self {
		Self { backend }
	}

	pub async fn initialize(&self) -> Result<(), StorageError> {
		self.backend.initialize().await
	}

	/// Inserts a new order. Orders start out in `cart` or `pending` without a driver.
	pub async fn create(&self, order: NewOrder, change: StatusChange) -> Result<Order, StorageError> {
		if !matches!(order.status, OrderStatus::Cart | OrderStatus::Pending) {
			return Err(StorageError::Constraint(format!(
				"orders must be created in cart or pending, not {}",
				order.status
			)));
		}
		let created = self.backend.create(order, change).await?;
		tracing::debug!(order_id = created.id, status = %created.status, "Stored new order");
		Ok(created)
	}

	pub async fn get(&self, id: OrderId) -> Result<Order, StorageError> {
		self.backend.get(id).await
	}

	pub async fn items(&self, id: OrderId) -> Result<Vec<OrderItem>, StorageError> {
		self.backend.items(id).await
	}

	pub async fn list_available(&self) -> Result<Vec<Order>, StorageError> {
		self.backend.list_available().await
	}

	pub async fn list_by_driver(&self, driver_id: UserId) -> Result<Vec<Order>, StorageError> {
		self.backend.list_by_driver(driver_id).await
	}

	/// Applies a conditional mutation, rejecting targets that would break the
	/// driver/status invariant before they reach the backend.
	pub async fn transition(
		&self,
		transition: Transition,
	) -> Result<TransitionOutcome, StorageError> {
		if transition.to.is_pre_assignment() && transition.assign_driver.is_some() {
			return Err(StorageError::Constraint(format!(
				"status {} cannot carry a driver",
				transition.to
			)));
		}

		let order_id = transition.order_id;
		let (from, to) = (transition.expected_from, transition.to);
		let outcome = self.backend.transition(transition).await?;
		match &outcome {
			TransitionOutcome::Applied(_) => {
				tracing::debug!(order_id, %from, %to, "Applied status transition")
			},
			TransitionOutcome::PreconditionFailed => {
				tracing::debug!(order_id, %from, %to, "Transition precondition failed")
			},
		}
		Ok(outcome)
	}

	pub async fn history(&self, id: OrderId) -> Result<Vec<StatusHistoryEntry>, StorageError> {
		self.backend.history(id).await
	}

	pub async fn list_pending_placed_before(
		&self,
		cutoff: DateTime<Utc>,
	) -> Result<Vec<Order>, StorageError> {
		self.backend.list_pending_placed_before(cutoff).await
	}

	pub async fn archive_closed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
		self.backend.archive_closed_before(cutoff).await
	}
}
