//! In-memory storage backend implementation for the dispatch service.
//!
//! All state lives behind a single write lock, so a transition's precondition
//! check, order update and history append happen as one step, the same way
//! the sqlite backend relies on a single conditional UPDATE inside a write
//! transaction. Nothing survives a restart.

use crate::{
	OrderStoreInterface, StatusChange, StorageError, StorageFactory, StorageRegistry, Transition,
	TransitionOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_types::{
	ConfigSchema, ImplementationRegistry, NewOrder, Order, OrderId, OrderItem, OrderStatus,
	Schema, StatusHistoryEntry, UserId, ValidationError,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct MemoryState {
	orders: BTreeMap<OrderId, Order>,
	items: HashMap<OrderId, Vec<OrderItem>>,
	history: Vec<StatusHistoryEntry>,
	next_item_id: i64,
}

impl MemoryState {
	fn next_order_id(&self) -> OrderId {
		self.orders.keys().next_back().map_or(1, |id| id + 1)
	}

	fn append_history(
		&mut self,
		order_id: OrderId,
		from: Option<OrderStatus>,
		to: OrderStatus,
		change: StatusChange,
		at: DateTime<Utc>,
	) {
		let id = self.history.len() as i64 + 1;
		self.history.push(StatusHistoryEntry {
			id,
			order_id,
			actor_id: change.actor_id,
			from_status: from,
			to_status: to,
			note: change.note,
			metadata: change.metadata,
			created_at: at,
		});
	}
}

/// Checks the row-level invariants the sqlite schema enforces with
/// constraints, so both backends reject the same writes.
fn check_row(order: &Order) -> Result<(), StorageError> {
	if !order.status.accepts_driver(order.driver_id) {
		return Err(StorageError::Constraint(format!(
			"order {} in status {} cannot have driver {:?}",
			order.id, order.status, order.driver_id
		)));
	}
	Ok(())
}

/// In-memory storage implementation.
pub struct MemoryStorage {
	state: Arc<RwLock<MemoryState>>,
}

impl MemoryStorage {
	/// Creates a new MemoryStorage instance.
	pub fn new() -> Self {
		Self {
			state: Arc::new(RwLock::new(MemoryState::default())),
		}
	}
}

impl Default for MemoryStorage {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl OrderStoreInterface for MemoryStorage {
	async fn create(&self, new: NewOrder, change: StatusChange) -> Result<Order, StorageError> {
		let mut state = self.state.write().await;

		let id = match new.id {
			Some(id) if state.orders.contains_key(&id) => return Err(StorageError::Duplicate(id)),
			Some(id) => id,
			None => state.next_order_id(),
		};

		let now = Utc::now();
		let mut order = Order {
			id,
			customer_id: new.customer_id,
			restaurant_id: new.restaurant_id,
			delivery_address_id: new.delivery_address_id,
			driver_id: None,
			status: new.status,
			amounts: new.amounts,
			special_instructions: new.special_instructions,
			cancellation_reason: None,
			estimated_preparation_minutes: None,
			estimated_delivery_at: None,
			created_at: now,
			updated_at: now,
			placed_at: None,
			confirmed_at: None,
			ready_at: None,
			delivered_at: None,
			cancelled_at: None,
			is_active: true,
		};
		order.stamp_entered(order.status, now);
		check_row(&order)?;

		let mut items = Vec::with_capacity(new.items.len());
		for item in new.items {
			state.next_item_id += 1;
			items.push(OrderItem {
				id: state.next_item_id,
				order_id: id,
				name: item.name,
				description: item.description,
				unit_price: item.unit_price,
				quantity: item.quantity,
				customizations: item.customizations,
				line_total: item.line_total,
			});
		}

		state.items.insert(id, items);
		state.orders.insert(id, order.clone());
		state.append_history(id, None, order.status, change, now);
		Ok(order)
	}

	async fn get(&self, id: OrderId) -> Result<Order, StorageError> {
		let state = self.state.read().await;
		state.orders.get(&id).cloned().ok_or(StorageError::NotFound(id))
	}

	async fn items(&self, id: OrderId) -> Result<Vec<OrderItem>, StorageError> {
		let state = self.state.read().await;
		Ok(state.items.get(&id).cloned().unwrap_or_default())
	}

	async fn list_available(&self) -> Result<Vec<Order>, StorageError> {
		let state = self.state.read().await;
		let mut orders: Vec<Order> = state
			.orders
			.values()
			.filter(|o| o.status == OrderStatus::Ready && o.driver_id.is_none() && o.is_active)
			.cloned()
			.collect();
		orders.sort_by_key(|o| (o.ready_at, o.id));
		Ok(orders)
	}

	async fn list_by_driver(&self, driver_id: UserId) -> Result<Vec<Order>, StorageError> {
		let state = self.state.read().await;
		Ok(state
			.orders
			.values()
			.filter(|o| o.driver_id == Some(driver_id) && o.is_active)
			.cloned()
			.collect())
	}

	async fn transition(&self, transition: Transition) -> Result<TransitionOutcome, StorageError> {
		let mut state = self.state.write().await;

		let Some(current) = state.orders.get(&transition.order_id) else {
			return Ok(TransitionOutcome::PreconditionFailed);
		};
		if !transition.matches(current) {
			return Ok(TransitionOutcome::PreconditionFailed);
		}

		let now = Utc::now();
		let mut updated = current.clone();
		transition.apply(&mut updated, now);
		check_row(&updated)?;

		let from = transition.expected_from;
		let to = transition.to;
		state.orders.insert(updated.id, updated.clone());
		state.append_history(updated.id, Some(from), to, transition.change, now);
		Ok(TransitionOutcome::Applied(updated))
	}

	async fn history(&self, id: OrderId) -> Result<Vec<StatusHistoryEntry>, StorageError> {
		let state = self.state.read().await;
		Ok(state
			.history
			.iter()
			.filter(|e| e.order_id == id)
			.cloned()
			.collect())
	}

	async fn list_pending_placed_before(
		&self,
		cutoff: DateTime<Utc>,
	) -> Result<Vec<Order>, StorageError> {
		let state = self.state.read().await;
		Ok(state
			.orders
			.values()
			.filter(|o| {
				o.status == OrderStatus::Pending
					&& o.is_active
					&& o.placed_at.is_some_and(|placed| placed < cutoff)
			})
			.cloned()
			.collect())
	}

	async fn archive_closed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
		let mut state = self.state.write().await;
		let mut archived = 0;
		for order in state.orders.values_mut() {
			if order.is_active && order.status.is_closed() && order.updated_at < cutoff {
				order.is_active = false;
				archived += 1;
			}
		}
		Ok(archived)
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryStorageSchema)
	}
}

/// Configuration schema for MemoryStorage.
pub struct MemoryStorageSchema;

impl ConfigSchema for MemoryStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		// Memory storage has no configuration
		Schema::new(vec![], vec![]).validate(config)
	}
}

/// Factory function to create a memory storage backend from configuration.
pub fn create_storage(_config: &toml::Value) -> Result<Box<dyn OrderStoreInterface>, StorageError> {
	Ok(Box::new(MemoryStorage::new()))
}

/// Registry for the memory storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StorageRegistry for Registry {}
