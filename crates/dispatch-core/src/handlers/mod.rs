//! Request handlers for order operations.
//!
//! The lifecycle service is the entry point for every caller. It delegates
//! driver claims to the assignment coordinator, which owns the
//! compare-and-swap protocol and the classification of lost claims.

pub mod assignment;
pub mod lifecycle;

pub use assignment::AssignmentCoordinator;
pub use lifecycle::LifecycleService;
