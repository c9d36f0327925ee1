//! Dispatch engine wiring and background loop.
//!
//! The engine owns the storage service and the services built on top of it.
//! Request handling happens in the callers' tasks through
//! [`DispatchEngine::lifecycle`]; the engine itself only runs housekeeping on
//! a fixed interval until it is told to stop.

pub mod lifecycle;

use crate::authorization::AccessPolicy;
use crate::handlers::LifecycleService;
use crate::housekeeping::HousekeepingService;
use dispatch_config::Config;
use dispatch_storage::StorageService;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Service error: {0}")]
	Service(String),
}

/// Main engine that owns the order lifecycle services.
#[derive(Clone)]
pub struct DispatchEngine {
	pub(crate) config: Config,
	pub(crate) storage: Arc<StorageService>,
	pub(crate) lifecycle: Arc<LifecycleService>,
	pub(crate) housekeeping: Arc<HousekeepingService>,
}

impl DispatchEngine {
	pub fn new(config: Config, storage: Arc<StorageService>, policy: Arc<dyn AccessPolicy>) -> Self {
		let lifecycle = Arc::new(LifecycleService::new(
			storage.clone(),
			policy,
			&config.lifecycle,
		));
		let housekeeping = Arc::new(HousekeepingService::new(storage.clone(), &config.lifecycle));

		Self {
			config,
			storage,
			lifecycle,
			housekeeping,
		}
	}

	/// Runs housekeeping on the configured interval until Ctrl+C.
	///
	/// A failed pass is logged and retried on the next tick.
	pub async fn run(&self) -> Result<(), EngineError> {
		let mut interval = tokio::time::interval(Duration::from_secs(
			self.config.lifecycle.housekeeping_interval_seconds,
		));
		interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				_ = interval.tick() => {
					if let Err(e) = self.housekeeping.run_once(chrono::Utc::now()).await {
						tracing::warn!(error = %e, "Housekeeping pass failed");
					}
				}

				// Shutdown signal
				_ = tokio::signal::ctrl_c() => {
					break;
				}
			}
		}

		Ok(())
	}

	/// Returns the lifecycle service used to handle requests.
	pub fn lifecycle(&self) -> &Arc<LifecycleService> {
		&self.lifecycle
	}

	pub fn housekeeping(&self) -> &Arc<HousekeepingService> {
		&self.housekeeping
	}

	/// Returns a reference to the configuration.
	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Returns a reference to the storage service.
	pub fn storage(&self) -> &Arc<StorageService> {
		&self.storage
	}
}
