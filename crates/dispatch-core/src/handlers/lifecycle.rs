//! Order lifecycle service.
//!
//! Entry point for every operation on an order. Each status change follows
//! the same steps: read the order, check the change against the transition
//! table, authorize the caller, then hand storage a conditional update that
//! only applies if the order is still in the status that was read. If another
//! writer got there first the update matches nothing and the caller gets a
//! conflict; nothing is retried here.

use chrono::{DateTime, TimeDelta, Utc};
use dispatch_config::LifecycleConfig;
use dispatch_storage::{StatusChange, StorageService, Transition, TransitionOutcome};
use dispatch_types::{
	ConfirmOrderRequest, CreateOrderRequest, NewOrder, NewOrderItem, Order, OrderDetails, OrderId,
	OrderStatus, Principal, Role, StatusHistoryEntry,
};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

use super::AssignmentCoordinator;
use crate::authorization::{authorize_transition, can_view, AccessPolicy, Actor};
use crate::state::is_valid_transition;
use crate::{AssignmentError, LifecycleError};

/// Orchestrates status changes, claims and reads of orders.
pub struct LifecycleService {
	storage: Arc<StorageService>,
	policy: Arc<dyn AccessPolicy>,
	assignment: AssignmentCoordinator,
	/// Drive time assumed when the caller supplies no estimate.
	default_drive_minutes: i64,
}

impl LifecycleService {
	pub fn new(
		storage: Arc<StorageService>,
		policy: Arc<dyn AccessPolicy>,
		settings: &LifecycleConfig,
	) -> Self {
		let assignment = AssignmentCoordinator::new(storage.clone(), settings.allow_idempotent_claim);
		Self {
			storage,
			policy,
			assignment,
			default_drive_minutes: settings.default_drive_minutes,
		}
	}

	/// Creates an order for the calling customer.
	///
	/// The order starts in `cart`, or directly in `pending` when the request
	/// asks to place it. Line items and amounts are stored as supplied.
	#[instrument(skip_all, fields(customer_id = principal.id, restaurant_id = request.restaurant_id))]
	pub async fn create_order(
		&self,
		principal: &Principal,
		request: CreateOrderRequest,
	) -> Result<Order, LifecycleError> {
		if principal.role != Role::Customer {
			return Err(LifecycleError::Authorization(format!(
				"only customers can create orders, not {}",
				principal.role
			)));
		}
		validate_items(&request.items)?;
		request
			.amounts
			.validate()
			.map_err(LifecycleError::Validation)?;

		let status = if request.place {
			OrderStatus::Pending
		} else {
			OrderStatus::Cart
		};
		let new_order = NewOrder {
			id: None,
			customer_id: principal.id,
			restaurant_id: request.restaurant_id,
			delivery_address_id: request.delivery_address_id,
			status,
			amounts: request.amounts,
			special_instructions: request.special_instructions,
			items: request.items,
		};

		let order = self
			.storage
			.create(new_order, StatusChange::by(principal.id).with_note("Order created"))
			.await?;
		tracing::info!(order_id = order.id, status = %order.status, "Order created");
		Ok(order)
	}

	/// Submits a cart to the restaurant.
	#[instrument(skip_all, fields(order_id = order_id))]
	pub async fn place_order(
		&self,
		order_id: OrderId,
		principal: &Principal,
	) -> Result<Order, LifecycleError> {
		self.advance(order_id, principal, OrderStatus::Pending, Some("Order placed".into()), |t| t)
			.await
	}

	/// Accepts a pending order on behalf of the restaurant.
	///
	/// With a preparation estimate the expected delivery instant is stored as
	/// well: now, plus preparation, plus the drive time (supplied or default).
	#[instrument(skip_all, fields(order_id = order_id))]
	pub async fn confirm_order(
		&self,
		order_id: OrderId,
		principal: &Principal,
		request: ConfirmOrderRequest,
	) -> Result<Order, LifecycleError> {
		let estimated_delivery_at = self.estimate_delivery(
			Utc::now(),
			request.estimated_preparation_minutes,
			request.estimated_drive_minutes,
		)?;
		let preparation_minutes = request.estimated_preparation_minutes;

		self.advance(
			order_id,
			principal,
			OrderStatus::Confirmed,
			Some("Order confirmed by restaurant".into()),
			move |t| t.estimates(preparation_minutes, estimated_delivery_at),
		)
		.await
	}

	#[instrument(skip_all, fields(order_id = order_id))]
	pub async fn start_preparing(
		&self,
		order_id: OrderId,
		principal: &Principal,
	) -> Result<Order, LifecycleError> {
		self.advance(order_id, principal, OrderStatus::Preparing, None, |t| t)
			.await
	}

	/// Marks the food as ready for pickup, making the order claimable.
	#[instrument(skip_all, fields(order_id = order_id))]
	pub async fn mark_ready(
		&self,
		order_id: OrderId,
		principal: &Principal,
	) -> Result<Order, LifecycleError> {
		self.advance(order_id, principal, OrderStatus::Ready, Some("Ready for pickup".into()), |t| t)
			.await
	}

	/// Claims a ready order for the calling driver.
	#[instrument(skip_all, fields(order_id = order_id, driver_id = principal.id))]
	pub async fn claim_order(
		&self,
		order_id: OrderId,
		principal: &Principal,
	) -> Result<Order, LifecycleError> {
		// Any driver may claim, so there is no order-specific role to check
		if principal.role != Role::Driver {
			return Err(LifecycleError::Authorization(format!(
				"only drivers can claim orders, not {}",
				principal.role
			)));
		}
		if !principal.available {
			return Err(AssignmentError::DriverUnavailable(principal.id).into());
		}

		self.assignment.claim(order_id, principal.id).await
	}

	/// Moves an order along the delivery leg: picked_up, in_transit, delivered.
	///
	/// Only the driver holding the order may do this, and the update is
	/// conditioned on them still holding it.
	#[instrument(skip_all, fields(order_id = order_id, driver_id = principal.id, to = %to))]
	pub async fn advance_delivery(
		&self,
		order_id: OrderId,
		principal: &Principal,
		to: OrderStatus,
		notes: Option<String>,
	) -> Result<Order, LifecycleError> {
		if !matches!(
			to,
			OrderStatus::PickedUp | OrderStatus::InTransit | OrderStatus::Delivered
		) {
			return Err(LifecycleError::Validation(format!(
				"delivery updates cannot move an order to {}",
				to
			)));
		}

		self.advance(order_id, principal, to, notes, |t| t).await
	}

	/// Cancels an order. The reason is kept on the order and in the audit trail.
	#[instrument(skip_all, fields(order_id = order_id))]
	pub async fn cancel_order(
		&self,
		order_id: OrderId,
		principal: &Principal,
		reason: &str,
	) -> Result<Order, LifecycleError> {
		let reason = required_reason(reason, "cancellation")?;
		let stored = reason.clone();
		self.advance(order_id, principal, OrderStatus::Cancelled, Some(reason), move |t| {
			t.cancellation_reason(stored)
		})
		.await
	}

	/// Records a refund of a delivered or cancelled order.
	#[instrument(skip_all, fields(order_id = order_id))]
	pub async fn refund_order(
		&self,
		order_id: OrderId,
		principal: &Principal,
		reason: &str,
	) -> Result<Order, LifecycleError> {
		let reason = required_reason(reason, "refund")?;
		self.advance(order_id, principal, OrderStatus::Refunded, Some(reason), |t| t)
			.await
	}

	/// Orders waiting for a driver. Read-only.
	pub async fn list_available_orders(
		&self,
		principal: &Principal,
	) -> Result<Vec<Order>, LifecycleError> {
		if !matches!(principal.role, Role::Driver | Role::Admin) {
			return Err(LifecycleError::Authorization(
				"only drivers can list available orders".into(),
			));
		}
		Ok(self.storage.list_available().await?)
	}

	/// Active orders held by the calling driver.
	pub async fn list_driver_orders(
		&self,
		principal: &Principal,
	) -> Result<Vec<Order>, LifecycleError> {
		if principal.role != Role::Driver {
			return Err(LifecycleError::Authorization(
				"only drivers have assigned orders".into(),
			));
		}
		Ok(self.storage.list_by_driver(principal.id).await?)
	}

	/// Loads an order with its line items. Read-only.
	pub async fn get_order(
		&self,
		order_id: OrderId,
		principal: &Principal,
	) -> Result<OrderDetails, LifecycleError> {
		let order = self.visible_order(order_id, principal).await?;
		let items = self.storage.items(order.id).await?;
		Ok(OrderDetails { order, items })
	}

	/// Status history of an order, oldest first.
	pub async fn get_order_history(
		&self,
		order_id: OrderId,
		principal: &Principal,
	) -> Result<Vec<StatusHistoryEntry>, LifecycleError> {
		let order = self.visible_order(order_id, principal).await?;
		Ok(self.storage.history(order.id).await?)
	}

	async fn visible_order(
		&self,
		order_id: OrderId,
		principal: &Principal,
	) -> Result<Order, LifecycleError> {
		let order = self.storage.get(order_id).await?;
		if !can_view(self.policy.as_ref(), principal, &order).await {
			return Err(LifecycleError::Authorization(format!(
				"{} {} may not view order {}",
				principal.role, principal.id, order_id
			)));
		}
		Ok(order)
	}

	/// Applies one status change on behalf of `principal`.
	///
	/// `extra` adds the fields specific to the target status.
	async fn advance<F>(
		&self,
		order_id: OrderId,
		principal: &Principal,
		to: OrderStatus,
		note: Option<String>,
		extra: F,
	) -> Result<Order, LifecycleError>
	where
		F: FnOnce(Transition) -> Transition,
	{
		let order = self.storage.get(order_id).await?;
		let from = order.status;
		if !is_valid_transition(from, to) {
			return Err(LifecycleError::InvalidTransition { from, to });
		}

		let actor = authorize_transition(self.policy.as_ref(), principal, &order, to).await?;

		let mut change = StatusChange::by(principal.id)
			.with_metadata(json!({ "role": principal.role.as_str() }));
		if let Some(note) = note {
			change = change.with_note(note);
		}
		let mut transition = extra(Transition::new(order_id, from, to)).with_change(change);
		if actor == Actor::AssignedDriver {
			transition = transition.held_by(principal.id);
		}

		match self.storage.transition(transition).await? {
			TransitionOutcome::Applied(updated) => {
				tracing::info!(%from, %to, ?actor, "Order status changed");
				Ok(updated)
			},
			TransitionOutcome::PreconditionFailed => {
				tracing::warn!(%from, %to, "Order changed concurrently");
				Err(LifecycleError::Conflict(format!(
					"order {} is no longer {}",
					order_id, from
				)))
			},
		}
	}

	fn estimate_delivery(
		&self,
		now: DateTime<Utc>,
		preparation_minutes: Option<i64>,
		drive_minutes: Option<i64>,
	) -> Result<Option<DateTime<Utc>>, LifecycleError> {
		if preparation_minutes.is_some_and(|m| m < 0) || drive_minutes.is_some_and(|m| m < 0) {
			return Err(LifecycleError::Validation(
				"time estimates cannot be negative".into(),
			));
		}
		let Some(preparation) = preparation_minutes else {
			return Ok(None);
		};

		let drive = drive_minutes.unwrap_or(self.default_drive_minutes);
		let at = preparation
			.checked_add(drive)
			.and_then(TimeDelta::try_minutes)
			.and_then(|delta| now.checked_add_signed(delta))
			.ok_or_else(|| LifecycleError::Validation("time estimate out of range".into()))?;
		Ok(Some(at))
	}
}

fn validate_items(items: &[NewOrderItem]) -> Result<(), LifecycleError> {
	if items.is_empty() {
		return Err(LifecycleError::Validation(
			"an order needs at least one item".into(),
		));
	}
	for item in items {
		if item.name.trim().is_empty() {
			return Err(LifecycleError::Validation("item name cannot be empty".into()));
		}
		if item.quantity <= 0 {
			return Err(LifecycleError::Validation(format!(
				"quantity of '{}' must be positive",
				item.name
			)));
		}
		if item.unit_price.is_sign_negative() || item.line_total.is_sign_negative() {
			return Err(LifecycleError::Validation(format!(
				"prices of '{}' cannot be negative",
				item.name
			)));
		}
	}
	Ok(())
}

fn required_reason(reason: &str, what: &str) -> Result<String, LifecycleError> {
	let reason = reason.trim();
	if reason.is_empty() {
		return Err(LifecycleError::Validation(format!(
			"a {} reason is required",
			what
		)));
	}
	Ok(reason.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::authorization::ClaimsPolicy;
	use dispatch_storage::implementations::memory::MemoryStorage;
	use dispatch_types::MonetarySnapshot;

	fn service() -> LifecycleService {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		LifecycleService::new(storage, Arc::new(ClaimsPolicy), &LifecycleConfig::default())
	}

	fn item(quantity: i32) -> NewOrderItem {
		NewOrderItem {
			name: "Margherita".into(),
			description: None,
			unit_price: "9.50".parse().unwrap(),
			quantity,
			customizations: json!({ "crust": "thin" }),
			line_total: "19.00".parse().unwrap(),
		}
	}

	fn request(place: bool) -> CreateOrderRequest {
		CreateOrderRequest {
			restaurant_id: 7,
			delivery_address_id: Some(3),
			special_instructions: None,
			items: vec![item(2)],
			amounts: MonetarySnapshot {
				subtotal: "19.00".parse().unwrap(),
				tax: "1.90".parse().unwrap(),
				delivery_fee: "2.50".parse().unwrap(),
				discount: Default::default(),
				total: "23.40".parse().unwrap(),
			},
			place,
		}
	}

	#[tokio::test]
	async fn test_create_and_place() {
		let service = service();
		let customer = Principal::customer(100);

		let order = service.create_order(&customer, request(false)).await.unwrap();
		assert_eq!(order.status, OrderStatus::Cart);
		assert!(order.placed_at.is_none());

		let placed = service.place_order(order.id, &customer).await.unwrap();
		assert_eq!(placed.status, OrderStatus::Pending);
		assert!(placed.placed_at.is_some());

		let details = service.get_order(order.id, &customer).await.unwrap();
		assert_eq!(details.items.len(), 1);
		assert_eq!(details.items[0].customizations["crust"], "thin");
	}

	#[tokio::test]
	async fn test_create_validation() {
		let service = service();
		let customer = Principal::customer(100);

		let mut empty = request(true);
		empty.items.clear();
		assert!(matches!(
			service.create_order(&customer, empty).await,
			Err(LifecycleError::Validation(_))
		));

		let mut zero = request(true);
		zero.items = vec![item(0)];
		assert!(matches!(
			service.create_order(&customer, zero).await,
			Err(LifecycleError::Validation(_))
		));

		assert!(matches!(
			service
				.create_order(&Principal::driver(5, true), request(true))
				.await,
			Err(LifecycleError::Authorization(_))
		));
	}

	#[tokio::test]
	async fn test_confirm_stores_estimates() {
		let service = service();
		let customer = Principal::customer(100);
		let vendor = Principal::vendor(200, vec![7]);
		let order = service.create_order(&customer, request(true)).await.unwrap();

		let before = Utc::now();
		let confirmed = service
			.confirm_order(
				order.id,
				&vendor,
				ConfirmOrderRequest {
					estimated_preparation_minutes: Some(20),
					estimated_drive_minutes: None,
				},
			)
			.await
			.unwrap();

		assert_eq!(confirmed.status, OrderStatus::Confirmed);
		assert_eq!(confirmed.estimated_preparation_minutes, Some(20));
		let eta = confirmed.estimated_delivery_at.unwrap();
		assert!(eta >= before + TimeDelta::minutes(50));
		assert!(eta <= Utc::now() + TimeDelta::minutes(50));
	}

	#[tokio::test]
	async fn test_negative_estimate_rejected_before_storage() {
		let service = service();
		let customer = Principal::customer(100);
		let vendor = Principal::vendor(200, vec![7]);
		let order = service.create_order(&customer, request(true)).await.unwrap();

		let result = service
			.confirm_order(
				order.id,
				&vendor,
				ConfirmOrderRequest {
					estimated_preparation_minutes: Some(-5),
					estimated_drive_minutes: None,
				},
			)
			.await;
		assert!(matches!(result, Err(LifecycleError::Validation(_))));
		let history = service.get_order_history(order.id, &customer).await.unwrap();
		assert_eq!(history.len(), 1);
	}

	#[tokio::test]
	async fn test_blank_reason_rejected() {
		let service = service();
		let customer = Principal::customer(100);
		let order = service.create_order(&customer, request(true)).await.unwrap();

		assert!(matches!(
			service.cancel_order(order.id, &customer, "   ").await,
			Err(LifecycleError::Validation(_))
		));
	}

	#[tokio::test]
	async fn test_unavailable_driver_cannot_claim() {
		let service = service();
		let result = service.claim_order(1, &Principal::driver(50, false)).await;
		assert!(matches!(
			result,
			Err(LifecycleError::Assignment(AssignmentError::DriverUnavailable(50)))
		));
	}

	#[tokio::test]
	async fn test_delivery_update_rejects_other_targets() {
		let service = service();
		let result = service
			.advance_delivery(1, &Principal::driver(50, true), OrderStatus::Cancelled, None)
			.await;
		assert!(matches!(result, Err(LifecycleError::Validation(_))));
	}

	#[test]
	fn test_estimate_without_preparation_is_empty() {
		let service = service();
		let estimate = service.estimate_delivery(Utc::now(), None, Some(15)).unwrap();
		assert!(estimate.is_none());
	}
}
