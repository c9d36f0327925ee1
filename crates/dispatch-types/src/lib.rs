//! Common types module for the dispatch system.
//!
//! Shared domain types for orders, their status history and the principals
//! acting on them, together with API payloads and configuration validation
//! helpers used by every other crate in the workspace.

/// API types for HTTP endpoints and request/response structures.
pub mod api;
/// Order records, line items, monetary snapshots and status history.
pub mod order;
/// Authenticated principals and their roles.
pub mod principal;
/// Registry trait for pluggable implementations.
pub mod registry;
/// Configuration validation types for ensuring type-safe configurations.
pub mod validation;

// Re-export all types for convenient access
pub use api::*;
pub use order::*;
pub use principal::*;
pub use registry::ImplementationRegistry;
pub use validation::*;
