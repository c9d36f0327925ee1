//! Legal status transitions.
//!
//! Orders move forward one step at a time: cart -> pending -> confirmed ->
//! preparing -> ready -> driver_assigned -> picked_up -> in_transit ->
//! delivered. Every status before delivery may also be cancelled, and both
//! delivered and cancelled orders may be refunded. Refunded is terminal.

use dispatch_types::OrderStatus;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};

// Static transition table - each status maps to its allowed next statuses
static TRANSITIONS: Lazy<HashMap<OrderStatus, HashSet<OrderStatus>>> = Lazy::new(|| {
	use OrderStatus::*;

	let mut m = HashMap::new();
	m.insert(Cart, HashSet::from([Pending, Cancelled]));
	m.insert(Pending, HashSet::from([Confirmed, Cancelled]));
	m.insert(Confirmed, HashSet::from([Preparing, Cancelled]));
	m.insert(Preparing, HashSet::from([Ready, Cancelled]));
	m.insert(Ready, HashSet::from([DriverAssigned, Cancelled]));
	m.insert(DriverAssigned, HashSet::from([PickedUp, Cancelled]));
	m.insert(PickedUp, HashSet::from([InTransit, Cancelled]));
	m.insert(InTransit, HashSet::from([Delivered, Cancelled]));
	m.insert(Delivered, HashSet::from([Refunded]));
	m.insert(Cancelled, HashSet::from([Refunded]));
	m.insert(Refunded, HashSet::new()); // terminal
	m
});

/// Checks whether an order may move from `from` to `to`.
pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
	TRANSITIONS
		.get(&from)
		.is_some_and(|targets| targets.contains(&to))
}

/// Statuses reachable from `from` in one step, in lifecycle order.
pub fn allowed_targets(from: OrderStatus) -> Vec<OrderStatus> {
	OrderStatus::ALL
		.into_iter()
		.filter(|to| is_valid_transition(from, *to))
		.collect()
}
