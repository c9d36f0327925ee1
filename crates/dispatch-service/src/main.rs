//! Main entry point for the dispatch service.
//!
//! This binary runs the order lifecycle engine: it serves the order and
//! driver endpoints over HTTP and runs housekeeping in the background. Storage
//! backends are pluggable and selected through configuration.

use clap::Parser;
use dispatch_config::Config;
use dispatch_core::{DispatchBuilder, DispatchEngine, DispatchFactories};
use dispatch_storage::StorageFactory;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

mod apis;
mod server;

/// Command-line arguments for the dispatch service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

/// Main entry point for the dispatch service.
///
/// This function:
/// 1. Parses command-line arguments
/// 2. Initializes logging infrastructure
/// 3. Loads configuration from file
/// 4. Builds and initializes the engine with the configured storage
/// 5. Serves the API and runs housekeeping until interrupted
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let default_directive = args.log_level.to_string();
	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started dispatch service");

	let config_path = args.config.to_string_lossy();
	let config = Config::from_file(&config_path).await?;
	tracing::info!("Loaded configuration [{}]", config.service.id);

	let engine = Arc::new(build_engine(config.clone())?);
	engine.initialize().await?;

	match config.api.clone().filter(|api| api.enabled) {
		Some(api_config) => {
			let api_engine = Arc::clone(&engine);

			tokio::select! {
				result = engine.run() => {
					tracing::info!("Engine finished");
					result?;
				}
				result = server::start_server(api_config, api_engine) => {
					tracing::info!("API server finished");
					result?;
				}
			}
		},
		None => {
			tracing::info!("API disabled, running housekeeping only");
			engine.run().await?;
		},
	}

	engine.shutdown().await?;
	tracing::info!("Stopped dispatch service");
	Ok(())
}

/// Builds the engine with every storage backend compiled into the binary.
fn build_engine(config: Config) -> Result<DispatchEngine, Box<dyn std::error::Error>> {
	let storage_factories: HashMap<String, StorageFactory> =
		dispatch_storage::get_all_implementations()
			.into_iter()
			.map(|(name, factory)| (name.to_string(), factory))
			.collect();

	let engine = DispatchBuilder::new(config).build(DispatchFactories { storage_factories })?;
	Ok(engine)
}
