//! Status lifecycle rules.
//!
//! This module holds the table of legal status changes. It is pure: nothing
//! here reads or writes storage, so the lifecycle service can reject an
//! illegal request before touching the order.

pub mod transitions;

pub use transitions::{allowed_targets, is_valid_transition};
