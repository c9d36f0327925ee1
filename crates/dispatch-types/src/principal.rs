//! Authenticated principals.
//!
//! The identity collaborator authenticates every request and hands the core a
//! principal; the core never verifies credentials itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{RestaurantId, UserId};

/// Role a principal acts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Customer,
	Vendor,
	Driver,
	Admin,
}

impl Role {
	pub fn as_str(&self) -> &'static str {
		match self {
			Role::Customer => "customer",
			Role::Vendor => "vendor",
			Role::Driver => "driver",
			Role::Admin => "admin",
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Role {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"customer" => Ok(Role::Customer),
			"vendor" => Ok(Role::Vendor),
			"driver" => Ok(Role::Driver),
			"admin" => Ok(Role::Admin),
			other => Err(format!("Unknown role: {}", other)),
		}
	}
}

/// The authenticated caller of a lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
	pub id: UserId,
	pub role: Role,
	/// Restaurants a vendor manages. Empty for every other role.
	#[serde(default)]
	pub restaurant_ids: Vec<RestaurantId>,
	/// Driver availability as maintained by the driver profile service.
	#[serde(default)]
	pub available: bool,
}

impl Principal {
	pub fn customer(id: UserId) -> Self {
		Self {
			id,
			role: Role::Customer,
			restaurant_ids: Vec::new(),
			available: false,
		}
	}

	pub fn vendor(id: UserId, restaurant_ids: Vec<RestaurantId>) -> Self {
		Self {
			id,
			role: Role::Vendor,
			restaurant_ids,
			available: false,
		}
	}

	pub fn driver(id: UserId, available: bool) -> Self {
		Self {
			id,
			role: Role::Driver,
			restaurant_ids: Vec::new(),
			available,
		}
	}

	pub fn admin(id: UserId) -> Self {
		Self {
			id,
			role: Role::Admin,
			restaurant_ids: Vec::new(),
			available: false,
		}
	}

	/// Whether this principal manages the given restaurant.
	pub fn manages(&self, restaurant_id: RestaurantId) -> bool {
		self.role == Role::Vendor && self.restaurant_ids.contains(&restaurant_id)
	}
}
