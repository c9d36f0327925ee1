//! Registry trait for self-registering implementations.

/// Base trait for implementation registries.
///
/// Each pluggable backend exposes a `Registry` struct implementing this trait,
/// pairing the name it is configured under with its factory function.
pub trait ImplementationRegistry {
	/// Name of the implementation table in the configuration, for example
	/// `sqlite` for `[storage.implementations.sqlite]`.
	const NAME: &'static str;

	/// Factory function type provided by the implementation.
	type Factory;

	/// Returns the factory that builds the implementation from its config table.
	fn factory() -> Self::Factory;
}
