//! Authorization rules for lifecycle operations.
//!
//! Legality of a status change and permission to perform it are separate
//! questions. The transition table in [`crate::state`] answers the first;
//! this module answers the second with a per-transition table of [`Actor`]s,
//! resolved against the caller through an [`AccessPolicy`].

use async_trait::async_trait;
use dispatch_types::{Order, OrderStatus, Principal, Role};

use crate::LifecycleError;

/// The relationship a principal must have with an order to act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
	/// The customer who owns the order.
	Customer,
	/// A vendor managing the order's restaurant.
	Vendor,
	/// Any driver, independent of the order.
	Driver,
	/// The driver currently holding the order.
	AssignedDriver,
	Admin,
}

/// Answers whether a principal acts in a role with respect to an order.
///
/// The identity collaborator may implement this against its own records;
/// [`ClaimsPolicy`] decides from the claims carried by the principal.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccessPolicy: Send + Sync {
	async fn has_role(&self, principal: &Principal, role: Role, order: &Order) -> bool;
}

/// Policy that trusts the claims on the authenticated principal.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClaimsPolicy;

#[async_trait]
impl AccessPolicy for ClaimsPolicy {
	async fn has_role(&self, principal: &Principal, role: Role, order: &Order) -> bool {
		if principal.role != role {
			return false;
		}
		match role {
			Role::Customer => principal.id == order.customer_id,
			Role::Vendor => principal.manages(order.restaurant_id),
			Role::Driver | Role::Admin => true,
		}
	}
}

/// Actors permitted to move an order from `from` to `to`.
///
/// Pairs that are not legal transitions have no permitted actors.
pub fn permitted_actors(from: OrderStatus, to: OrderStatus) -> &'static [Actor] {
	use OrderStatus::*;

	match (from, to) {
		(Cart, Pending) => &[Actor::Customer],
		(Pending, Confirmed) | (Confirmed, Preparing) | (Preparing, Ready) => &[Actor::Vendor],
		(Ready, DriverAssigned) => &[Actor::Driver],
		(DriverAssigned, PickedUp) | (PickedUp, InTransit) | (InTransit, Delivered) => {
			&[Actor::AssignedDriver]
		},
		(Cart | Pending | Confirmed | Preparing | Ready, Cancelled) => {
			&[Actor::Customer, Actor::Vendor, Actor::Admin]
		},
		(DriverAssigned | PickedUp, Cancelled) => {
			&[Actor::Vendor, Actor::AssignedDriver, Actor::Admin]
		},
		(InTransit, Cancelled) => &[Actor::Vendor, Actor::Admin],
		(Delivered | Cancelled, Refunded) => &[Actor::Admin],
		_ => &[],
	}
}

/// Whether `principal` is `actor` for `order`.
pub async fn acts_as(
	policy: &dyn AccessPolicy,
	principal: &Principal,
	actor: Actor,
	order: &Order,
) -> bool {
	match actor {
		Actor::Customer => policy.has_role(principal, Role::Customer, order).await,
		Actor::Vendor => policy.has_role(principal, Role::Vendor, order).await,
		Actor::Driver => policy.has_role(principal, Role::Driver, order).await,
		Actor::AssignedDriver => {
			order.driver_id == Some(principal.id)
				&& policy.has_role(principal, Role::Driver, order).await
		},
		Actor::Admin => policy.has_role(principal, Role::Admin, order).await,
	}
}

/// Resolves the actor under which `principal` may move `order` to `to`.
///
/// Returns the first matching actor from the table, so callers can add
/// preconditions that depend on it.
pub async fn authorize_transition(
	policy: &dyn AccessPolicy,
	principal: &Principal,
	order: &Order,
	to: OrderStatus,
) -> Result<Actor, LifecycleError> {
	for actor in permitted_actors(order.status, to) {
		if acts_as(policy, principal, *actor, order).await {
			return Ok(*actor);
		}
	}

	Err(LifecycleError::Authorization(format!(
		"{} {} may not move order {} from {} to {}",
		principal.role, principal.id, order.id, order.status, to
	)))
}

/// Whether `principal` may read `order` and its history.
///
/// Drivers see every order they hold and every order still waiting for a
/// driver, so they can decide what to claim.
pub async fn can_view(policy: &dyn AccessPolicy, principal: &Principal, order: &Order) -> bool {
	if acts_as(policy, principal, Actor::Admin, order).await
		|| acts_as(policy, principal, Actor::Customer, order).await
		|| acts_as(policy, principal, Actor::Vendor, order).await
		|| acts_as(policy, principal, Actor::AssignedDriver, order).await
	{
		return true;
	}

	order.status == OrderStatus::Ready
		&& order.driver_id.is_none()
		&& acts_as(policy, principal, Actor::Driver, order).await
}
