//! Order types for the dispatch system.
//!
//! This module defines the order record as persisted by the storage layer,
//! the status lifecycle it moves through, its line items and the audit trail
//! entries written alongside every status change.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store-generated order identifier.
pub type OrderId = i64;
/// Identifier of a customer, vendor, driver or admin account.
pub type UserId = i64;
/// Identifier of a restaurant.
pub type RestaurantId = i64;

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
	/// Items are being collected, nothing has been submitted yet.
	Cart,
	/// Submitted by the customer and waiting for the restaurant.
	Pending,
	/// Accepted by the restaurant.
	Confirmed,
	/// Food is being prepared.
	Preparing,
	/// Waiting at the restaurant for a driver to claim it.
	Ready,
	/// A driver has claimed the order.
	DriverAssigned,
	/// The driver collected the food.
	PickedUp,
	/// On its way to the customer.
	InTransit,
	/// Handed over to the customer.
	Delivered,
	/// Cancelled before delivery.
	Cancelled,
	/// Refunded after delivery or cancellation.
	Refunded,
}

impl OrderStatus {
	/// Every status, in lifecycle order.
	pub const ALL: [OrderStatus; 11] = [
		OrderStatus::Cart,
		OrderStatus::Pending,
		OrderStatus::Confirmed,
		OrderStatus::Preparing,
		OrderStatus::Ready,
		OrderStatus::DriverAssigned,
		OrderStatus::PickedUp,
		OrderStatus::InTransit,
		OrderStatus::Delivered,
		OrderStatus::Cancelled,
		OrderStatus::Refunded,
	];

	/// Returns the wire and storage representation of the status.
	pub fn as_str(&self) -> &'static str {
		match self {
			OrderStatus::Cart => "cart",
			OrderStatus::Pending => "pending",
			OrderStatus::Confirmed => "confirmed",
			OrderStatus::Preparing => "preparing",
			OrderStatus::Ready => "ready",
			OrderStatus::DriverAssigned => "driver_assigned",
			OrderStatus::PickedUp => "picked_up",
			OrderStatus::InTransit => "in_transit",
			OrderStatus::Delivered => "delivered",
			OrderStatus::Cancelled => "cancelled",
			OrderStatus::Refunded => "refunded",
		}
	}

	/// Statuses that must not carry a driver.
	pub fn is_pre_assignment(&self) -> bool {
		matches!(
			self,
			OrderStatus::Cart
				| OrderStatus::Pending
				| OrderStatus::Confirmed
				| OrderStatus::Preparing
				| OrderStatus::Ready
		)
	}

	/// Statuses that must carry a driver.
	pub fn is_post_assignment(&self) -> bool {
		matches!(
			self,
			OrderStatus::DriverAssigned
				| OrderStatus::PickedUp
				| OrderStatus::InTransit
				| OrderStatus::Delivered
		)
	}

	/// Statuses with no further outgoing transitions.
	pub fn is_terminal(&self) -> bool {
		matches!(self, OrderStatus::Refunded)
	}

	/// Statuses after which no driver is working on the order anymore.
	///
	/// Orders in these statuses are the ones housekeeping may archive.
	pub fn is_closed(&self) -> bool {
		matches!(
			self,
			OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Refunded
		)
	}

	/// Whether a driver value is consistent with this status.
	///
	/// Cancelled and refunded orders keep whatever driver they had when they
	/// left the regular lifecycle, so both values are accepted there.
	pub fn accepts_driver(&self, driver_id: Option<UserId>) -> bool {
		if self.is_pre_assignment() {
			driver_id.is_none()
		} else if self.is_post_assignment() {
			driver_id.is_some()
		} else {
			true
		}
	}
}

impl fmt::Display for OrderStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for OrderStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		OrderStatus::ALL
			.into_iter()
			.find(|status| status.as_str() == s)
			.ok_or_else(|| format!("Unknown order status: {}", s))
	}
}

/// Amounts captured when the order was placed.
///
/// Supplied by the pricing collaborator and stored verbatim; nothing in the
/// dispatch core recomputes them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MonetarySnapshot {
	pub subtotal: Decimal,
	pub tax: Decimal,
	pub delivery_fee: Decimal,
	#[serde(default)]
	pub discount: Decimal,
	pub total: Decimal,
}

impl MonetarySnapshot {
	/// Rejects snapshots containing negative amounts.
	pub fn validate(&self) -> Result<(), String> {
		let fields = [
			("subtotal", self.subtotal),
			("tax", self.tax),
			("delivery_fee", self.delivery_fee),
			("discount", self.discount),
			("total", self.total),
		];
		for (name, value) in fields {
			if value.is_sign_negative() && !value.is_zero() {
				return Err(format!("{} cannot be negative", name));
			}
		}
		Ok(())
	}
}

/// A persisted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
	pub id: OrderId,
	pub customer_id: UserId,
	pub restaurant_id: RestaurantId,
	pub delivery_address_id: Option<i64>,
	/// Driver currently or last holding the order.
	pub driver_id: Option<UserId>,
	pub status: OrderStatus,
	pub amounts: MonetarySnapshot,
	pub special_instructions: Option<String>,
	pub cancellation_reason: Option<String>,
	/// Preparation estimate given by the restaurant on confirmation.
	pub estimated_preparation_minutes: Option<i64>,
	pub estimated_delivery_at: Option<DateTime<Utc>>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub placed_at: Option<DateTime<Utc>>,
	pub confirmed_at: Option<DateTime<Utc>>,
	pub ready_at: Option<DateTime<Utc>>,
	pub delivered_at: Option<DateTime<Utc>>,
	pub cancelled_at: Option<DateTime<Utc>>,
	/// Only active orders can be claimed. Archival clears the flag.
	pub is_active: bool,
}

impl Order {
	/// Records the instant the order entered `status`, if that status has a
	/// dedicated timestamp. Timestamps that are already set are left alone.
	pub fn stamp_entered(&mut self, status: OrderStatus, at: DateTime<Utc>) {
		let slot = match status {
			OrderStatus::Pending => &mut self.placed_at,
			OrderStatus::Confirmed => &mut self.confirmed_at,
			OrderStatus::Ready => &mut self.ready_at,
			OrderStatus::Delivered => &mut self.delivered_at,
			OrderStatus::Cancelled => &mut self.cancelled_at,
			_ => return,
		};
		if slot.is_none() {
			*slot = Some(at);
		}
	}
}

/// Column holding the entry timestamp for `status`, if it has one.
pub fn entered_at_column(status: OrderStatus) -> Option<&'static str> {
	match status {
		OrderStatus::Pending => Some("placed_at"),
		OrderStatus::Confirmed => Some("confirmed_at"),
		OrderStatus::Ready => Some("ready_at"),
		OrderStatus::Delivered => Some("delivered_at"),
		OrderStatus::Cancelled => Some("cancelled_at"),
		_ => None,
	}
}

/// A line item captured with the order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
	pub id: i64,
	pub order_id: OrderId,
	pub name: String,
	pub description: Option<String>,
	pub unit_price: Decimal,
	pub quantity: i32,
	/// Customizations as chosen by the customer, kept as opaque JSON.
	pub customizations: serde_json::Value,
	pub line_total: Decimal,
}

/// Line item as supplied by the cart collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrderItem {
	pub name: String,
	#[serde(default)]
	pub description: Option<String>,
	pub unit_price: Decimal,
	pub quantity: i32,
	#[serde(default)]
	pub customizations: serde_json::Value,
	pub line_total: Decimal,
}

/// Everything needed to insert a new order.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
	/// Externally assigned identifier. Left empty the store generates one.
	pub id: Option<OrderId>,
	pub customer_id: UserId,
	pub restaurant_id: RestaurantId,
	pub delivery_address_id: Option<i64>,
	/// Either `cart` or `pending`.
	pub status: OrderStatus,
	pub amounts: MonetarySnapshot,
	pub special_instructions: Option<String>,
	pub items: Vec<NewOrderItem>,
}

/// An order together with its line items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetails {
	pub order: Order,
	pub items: Vec<OrderItem>,
}

/// One row of the append-only status audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
	pub id: i64,
	pub order_id: OrderId,
	/// Principal that caused the change. Empty for system transitions.
	pub actor_id: Option<UserId>,
	/// Empty for the creation record.
	pub from_status: Option<OrderStatus>,
	pub to_status: OrderStatus,
	pub note: Option<String>,
	pub metadata: serde_json::Value,
	pub created_at: DateTime<Utc>,
}

/// Replays a history trail and returns the status it ends in.
pub fn replay_status(entries: &[StatusHistoryEntry]) -> Option<OrderStatus> {
	entries.iter().map(|e| e.to_status).last()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_status_round_trips_through_str() {
		for status in OrderStatus::ALL {
			assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
		}
		assert!("shipped".parse::<OrderStatus>().is_err());
	}

	#[test]
	fn test_status_serializes_snake_case() {
		let json = serde_json::to_string(&OrderStatus::DriverAssigned).unwrap();
		assert_eq!(json, "\"driver_assigned\"");
	}

	#[test]
	fn test_driver_consistency() {
		assert!(OrderStatus::Ready.accepts_driver(None));
		assert!(!OrderStatus::Ready.accepts_driver(Some(7)));
		assert!(OrderStatus::InTransit.accepts_driver(Some(7)));
		assert!(!OrderStatus::Delivered.accepts_driver(None));
		assert!(OrderStatus::Cancelled.accepts_driver(None));
		assert!(OrderStatus::Cancelled.accepts_driver(Some(7)));
		assert!(OrderStatus::Refunded.accepts_driver(Some(7)));
	}

	#[test]
	fn test_only_refunded_is_terminal() {
		let terminal: Vec<_> = OrderStatus::ALL
			.into_iter()
			.filter(OrderStatus::is_terminal)
			.collect();
		assert_eq!(terminal, vec![OrderStatus::Refunded]);
	}

	#[test]
	fn test_negative_amounts_rejected() {
		let snapshot = MonetarySnapshot {
			subtotal: Decimal::new(1000, 2),
			tax: Decimal::new(-1, 2),
			delivery_fee: Decimal::ZERO,
			discount: Decimal::ZERO,
			total: Decimal::new(999, 2),
		};
		assert!(snapshot.validate().unwrap_err().contains("tax"));
	}
}
