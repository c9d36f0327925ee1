//! Startup and shutdown of the dispatch engine.

use super::{DispatchEngine, EngineError};

impl DispatchEngine {
	/// Prepares the storage backend. Must complete before requests are served.
	pub async fn initialize(&self) -> Result<(), EngineError> {
		tracing::info!(service_id = %self.config.service.id, "Initializing dispatch engine");
		self.storage
			.initialize()
			.await
			.map_err(|e| EngineError::Service(format!("Storage initialization failed: {}", e)))
	}

	pub async fn shutdown(&self) -> Result<(), EngineError> {
		tracing::info!("Shutting down dispatch engine");
		Ok(())
	}
}
