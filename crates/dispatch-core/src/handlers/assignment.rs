//! Driver claim protocol.
//!
//! A claim is a single conditional update: the order becomes
//! `driver_assigned` to the claiming driver only if it is still ready,
//! unassigned and active at the moment storage evaluates the update. When
//! several drivers race for the same order the storage engine lets exactly
//! one update through; every other claimant matches zero rows. Only then is
//! the order read again, outside the update, to tell the loser why.

use dispatch_storage::{StatusChange, StorageError, StorageService, Transition, TransitionOutcome};
use dispatch_types::{Order, OrderId, OrderStatus, UserId};
use std::sync::Arc;
use tracing::instrument;

use crate::{AssignmentError, LifecycleError};

/// Assigns ready orders to drivers.
pub struct AssignmentCoordinator {
	storage: Arc<StorageService>,
	/// Report success when a driver re-claims an order they already hold.
	allow_idempotent_claim: bool,
}

impl AssignmentCoordinator {
	pub fn new(storage: Arc<StorageService>, allow_idempotent_claim: bool) -> Self {
		Self {
			storage,
			allow_idempotent_claim,
		}
	}

	/// Claims `order_id` for `driver_id`.
	///
	/// Never retries. A lost race is reported as
	/// [`AssignmentError::OrderAlreadyAssigned`].
	#[instrument(skip(self))]
	pub async fn claim(&self, order_id: OrderId, driver_id: UserId) -> Result<Order, LifecycleError> {
		let transition = Transition::new(order_id, OrderStatus::Ready, OrderStatus::DriverAssigned)
			.require_unassigned()
			.require_active()
			.assign_driver(driver_id)
			.with_change(StatusChange::by(driver_id).with_note("Driver claimed order"));

		match self.storage.transition(transition).await? {
			TransitionOutcome::Applied(order) => {
				tracing::info!("Driver assigned");
				Ok(order)
			},
			TransitionOutcome::PreconditionFailed => self.diagnose(order_id, driver_id).await,
		}
	}

	/// Classifies a claim that matched zero rows.
	///
	/// Checks run in a fixed order so the same state always yields the same
	/// error: missing, archived, taken, not ready, and finally a generic
	/// "not available" for a state that changed again between the update and
	/// this read.
	async fn diagnose(&self, order_id: OrderId, driver_id: UserId) -> Result<Order, LifecycleError> {
		let order = match self.storage.get(order_id).await {
			Ok(order) => order,
			Err(StorageError::NotFound(_)) => {
				return Err(AssignmentError::OrderNotFound(order_id).into());
			},
			Err(e) => return Err(e.into()),
		};

		if self.allow_idempotent_claim
			&& order.driver_id == Some(driver_id)
			&& order.status.is_post_assignment()
			&& !order.status.is_closed()
		{
			tracing::debug!(status = %order.status, "Repeated claim by current holder");
			return Ok(order);
		}

		let error = if !order.is_active {
			AssignmentError::OrderNotActive(order_id)
		} else if order.driver_id.is_some() {
			AssignmentError::OrderAlreadyAssigned(order_id)
		} else if order.status != OrderStatus::Ready {
			AssignmentError::OrderNotReady {
				order_id,
				current: order.status,
			}
		} else {
			AssignmentError::OrderNotAvailable(order_id)
		};

		tracing::warn!(code = error.code(), status = %order.status, "Claim rejected");
		Err(error.into())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dispatch_storage::implementations::memory::MemoryStorage;
	use dispatch_types::{MonetarySnapshot, NewOrder};

	async fn ready_order(storage: &StorageService) -> Order {
		let order = storage
			.create(
				NewOrder {
					id: None,
					customer_id: 1,
					restaurant_id: 2,
					delivery_address_id: None,
					status: OrderStatus::Pending,
					amounts: MonetarySnapshot::default(),
					special_instructions: None,
					items: Vec::new(),
				},
				StatusChange::by(1),
			)
			.await
			.unwrap();

		let steps = [
			(OrderStatus::Pending, OrderStatus::Confirmed),
			(OrderStatus::Confirmed, OrderStatus::Preparing),
			(OrderStatus::Preparing, OrderStatus::Ready),
		];
		let mut current = order;
		for (from, to) in steps {
			match storage
				.transition(Transition::new(current.id, from, to))
				.await
				.unwrap()
			{
				TransitionOutcome::Applied(order) => current = order,
				TransitionOutcome::PreconditionFailed => panic!("setup transition failed"),
			}
		}
		current
	}

	fn setup(idempotent: bool) -> (AssignmentCoordinator, Arc<StorageService>) {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		(AssignmentCoordinator::new(storage.clone(), idempotent), storage)
	}

	#[tokio::test]
	async fn test_claim_assigns_driver() {
		let (coordinator, storage) = setup(true);
		let order = ready_order(&storage).await;

		let claimed = coordinator.claim(order.id, 40).await.unwrap();
		assert_eq!(claimed.status, OrderStatus::DriverAssigned);
		assert_eq!(claimed.driver_id, Some(40));

		let history = storage.history(order.id).await.unwrap();
		let last = history.last().unwrap();
		assert_eq!(last.actor_id, Some(40));
		assert_eq!(last.from_status, Some(OrderStatus::Ready));
	}

	#[tokio::test]
	async fn test_second_driver_sees_already_assigned() {
		let (coordinator, storage) = setup(true);
		let order = ready_order(&storage).await;

		coordinator.claim(order.id, 40).await.unwrap();
		let err = coordinator.claim(order.id, 41).await.unwrap_err();
		assert!(matches!(
			err,
			LifecycleError::Assignment(AssignmentError::OrderAlreadyAssigned(_))
		));
	}

	#[tokio::test]
	async fn test_repeated_claim_by_holder() {
		let (coordinator, storage) = setup(true);
		let order = ready_order(&storage).await;

		coordinator.claim(order.id, 40).await.unwrap();
		let again = coordinator.claim(order.id, 40).await.unwrap();
		assert_eq!(again.driver_id, Some(40));
		// No second history entry for the repeated claim
		assert_eq!(storage.history(order.id).await.unwrap().len(), 5);

		let (strict, storage) = setup(false);
		let order = ready_order(&storage).await;
		strict.claim(order.id, 40).await.unwrap();
		assert!(matches!(
			strict.claim(order.id, 40).await,
			Err(LifecycleError::Assignment(AssignmentError::OrderAlreadyAssigned(_)))
		));
	}

	#[tokio::test]
	async fn test_missing_order() {
		let (coordinator, _) = setup(true);
		assert!(matches!(
			coordinator.claim(404, 40).await,
			Err(LifecycleError::Assignment(AssignmentError::OrderNotFound(404)))
		));
	}

	#[tokio::test]
	async fn test_archived_order_not_active() {
		let (coordinator, storage) = setup(true);
		let order = ready_order(&storage).await;
		storage
			.transition(
				Transition::new(order.id, OrderStatus::Ready, OrderStatus::Cancelled)
					.cancellation_reason("kitchen closed"),
			)
			.await
			.unwrap();
		storage
			.archive_closed_before(chrono::Utc::now() + chrono::TimeDelta::seconds(1))
			.await
			.unwrap();

		assert!(matches!(
			coordinator.claim(order.id, 40).await,
			Err(LifecycleError::Assignment(AssignmentError::OrderNotActive(_)))
		));
	}
}
