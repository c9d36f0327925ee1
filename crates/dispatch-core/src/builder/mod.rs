//! Builder for constructing dispatch engines.
//!
//! Storage backends are pluggable: the service binary hands the builder a map
//! of factory functions keyed by implementation name, and the builder creates
//! every implementation listed in the configuration before selecting the
//! primary one.

use crate::authorization::{AccessPolicy, ClaimsPolicy};
use crate::engine::DispatchEngine;
use dispatch_config::Config;
use dispatch_storage::{OrderStoreInterface, StorageError, StorageService};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during engine construction.
#[derive(Debug, Error)]
pub enum BuilderError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Missing required component: {0}")]
	MissingComponent(String),
}

/// Factory functions for every pluggable component.
pub struct DispatchFactories<SF> {
	pub storage_factories: HashMap<String, SF>,
}

/// Builder for a [`DispatchEngine`].
pub struct DispatchBuilder {
	config: Config,
	policy: Option<Arc<dyn AccessPolicy>>,
}

impl DispatchBuilder {
	pub fn new(config: Config) -> Self {
		Self {
			config,
			policy: None,
		}
	}

	/// Replaces the default claims-based access policy.
	pub fn with_access_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
		self.policy = Some(policy);
		self
	}

	/// Builds the engine. The storage backend is not initialized yet; call
	/// [`DispatchEngine::initialize`] before serving requests.
	pub fn build<SF>(self, factories: DispatchFactories<SF>) -> Result<DispatchEngine, BuilderError>
	where
		SF: Fn(&toml::Value) -> Result<Box<dyn OrderStoreInterface>, StorageError>,
	{
		let mut storage_impls = HashMap::new();
		for (name, config) in &self.config.storage.implementations {
			let Some(factory) = factories.storage_factories.get(name) else {
				tracing::warn!(component = "storage", implementation = %name, "No factory registered, skipping");
				continue;
			};

			match factory(config) {
				Ok(implementation) => {
					if let Err(e) = implementation.config_schema().validate(config) {
						tracing::error!(
							component = "storage",
							implementation = %name,
							error = %e,
							"Invalid storage configuration"
						);
						return Err(BuilderError::Config(format!(
							"Invalid configuration for storage implementation '{}': {}",
							name, e
						)));
					}
					let is_primary = &self.config.storage.primary == name;
					tracing::info!(component = "storage", implementation = %name, enabled = %is_primary, "Loaded");
					storage_impls.insert(name.clone(), implementation);
				},
				Err(e) => {
					tracing::error!(
						component = "storage",
						implementation = %name,
						error = %e,
						"Failed to create storage implementation"
					);
					return Err(BuilderError::Config(format!(
						"Failed to create storage implementation '{}': {}",
						name, e
					)));
				},
			}
		}

		if storage_impls.is_empty() {
			return Err(BuilderError::MissingComponent(
				"No valid storage implementations available".into(),
			));
		}

		let primary_storage = &self.config.storage.primary;
		let storage_backend = storage_impls.remove(primary_storage).ok_or_else(|| {
			BuilderError::Config(format!(
				"Primary storage '{}' failed to load or has invalid configuration",
				primary_storage
			))
		})?;

		let storage = Arc::new(StorageService::new(storage_backend));
		let policy = self.policy.unwrap_or_else(|| Arc::new(ClaimsPolicy));

		Ok(DispatchEngine::new(self.config, storage, policy))
	}
}
