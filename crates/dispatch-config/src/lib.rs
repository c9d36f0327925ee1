//! Configuration module for the dispatch service.
//!
//! Configuration is read from TOML. String values may reference environment
//! variables as `${NAME}` or `${NAME:-default}`, and a file may pull in other
//! files with `include = ["storage.toml"]`. Each top-level section must be
//! defined exactly once across all included files.

mod loader;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// Keep the message, drop the echoed input
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure for the dispatch service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Identity of this service instance.
	pub service: ServiceConfig,
	/// Order store backends.
	pub storage: StorageConfig,
	/// Lifecycle rules and housekeeping schedule.
	#[serde(default)]
	pub lifecycle: LifecycleConfig,
	/// Configuration for the HTTP API server.
	pub api: Option<ApiConfig>,
}

/// Configuration specific to the service instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
	/// Unique identifier for this instance, used in logs.
	pub id: String,
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of storage implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
}

/// Lifecycle rules and housekeeping schedule.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleConfig {
	/// Report success when a driver re-claims an order they already hold.
	#[serde(default = "default_true")]
	pub allow_idempotent_claim: bool,
	/// Drive time assumed when confirming without a geocoded estimate.
	#[serde(default = "default_drive_minutes")]
	pub default_drive_minutes: i64,
	/// Pending orders the restaurant has not confirmed within this many
	/// minutes are cancelled by housekeeping.
	#[serde(default = "default_unconfirmed_timeout_minutes")]
	pub unconfirmed_timeout_minutes: u64,
	/// Closed orders untouched for this many days are archived.
	#[serde(default = "default_archive_after_days")]
	pub archive_after_days: u64,
	/// Seconds between housekeeping runs.
	#[serde(default = "default_housekeeping_interval_seconds")]
	pub housekeeping_interval_seconds: u64,
}

impl Default for LifecycleConfig {
	fn default() -> Self {
		Self {
			allow_idempotent_claim: true,
			default_drive_minutes: default_drive_minutes(),
			unconfirmed_timeout_minutes: default_unconfirmed_timeout_minutes(),
			archive_after_days: default_archive_after_days(),
			housekeeping_interval_seconds: default_housekeeping_interval_seconds(),
		}
	}
}

fn default_true() -> bool {
	true
}

fn default_drive_minutes() -> i64 {
	30
}

fn default_unconfirmed_timeout_minutes() -> u64 {
	30
}

fn default_archive_after_days() -> u64 {
	90
}

fn default_housekeeping_interval_seconds() -> u64 {
	60
}

/// Configuration for the HTTP API server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
	/// Whether the API server is enabled.
	#[serde(default)]
	pub enabled: bool,
	/// Host address to bind the server to.
	#[serde(default = "default_api_host")]
	pub host: String,
	/// Port to bind the server to.
	#[serde(default = "default_api_port")]
	pub port: u16,
	/// Request timeout in seconds.
	#[serde(default = "default_api_timeout")]
	pub timeout_seconds: u64,
	/// Maximum request size in bytes.
	#[serde(default = "default_max_request_size")]
	pub max_request_size: usize,
	/// CORS configuration. Permissive when absent.
	pub cors: Option<CorsConfig>,
}

/// CORS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorsConfig {
	/// Allowed origins for CORS.
	pub allowed_origins: Vec<String>,
}

fn default_api_host() -> String {
	"127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
	3000
}

fn default_api_timeout() -> u64 {
	30
}

fn default_max_request_size() -> usize {
	1024 * 1024 // 1MB
}

/// Resolves environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of VAR_NAME and supports defaults
/// with `${VAR_NAME:-default_value}`. Input is capped at 1MB.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut result = String::with_capacity(input.len());
	let mut last = 0;
	for cap in re.captures_iter(input) {
		let (Some(whole), Some(name)) = (cap.get(0), cap.get(1)) else {
			continue;
		};
		let value = match (std::env::var(name.as_str()), cap.get(2)) {
			(Ok(value), _) => value,
			(Err(_), Some(default)) => default.as_str().to_string(),
			(Err(_), None) => {
				return Err(ConfigError::Validation(format!(
					"Environment variable '{}' not found",
					name.as_str()
				)))
			},
		};
		result.push_str(&input[last..whole.start()]);
		result.push_str(&value);
		last = whole.end();
	}
	result.push_str(&input[last..]);

	Ok(result)
}

impl Config {
	/// Loads configuration from a file, following `include` directives.
	pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
		let path_buf = Path::new(path);
		let base_dir = path_buf.parent().unwrap_or_else(|| Path::new("."));

		let mut loader = loader::ConfigLoader::new(base_dir);
		let file_name = path_buf
			.file_name()
			.ok_or_else(|| ConfigError::Validation(format!("Invalid path: {}", path)))?;
		loader.load_config(file_name).await
	}

	/// Checks cross-field constraints serde cannot express.
	fn validate(&self) -> Result<(), ConfigError> {
		if self.service.id.trim().is_empty() {
			return Err(ConfigError::Validation("Service ID cannot be empty".into()));
		}

		if self.storage.implementations.is_empty() {
			return Err(ConfigError::Validation(
				"At least one storage implementation must be configured".into(),
			));
		}
		if self.storage.primary.is_empty() {
			return Err(ConfigError::Validation(
				"Storage primary implementation cannot be empty".into(),
			));
		}
		if !self
			.storage
			.implementations
			.contains_key(&self.storage.primary)
		{
			return Err(ConfigError::Validation(format!(
				"Primary storage '{}' not found in implementations",
				self.storage.primary
			)));
		}

		let lifecycle = &self.lifecycle;
		if lifecycle.default_drive_minutes < 0 {
			return Err(ConfigError::Validation(
				"lifecycle.default_drive_minutes cannot be negative".into(),
			));
		}
		if lifecycle.unconfirmed_timeout_minutes == 0 {
			return Err(ConfigError::Validation(
				"lifecycle.unconfirmed_timeout_minutes must be greater than 0".into(),
			));
		}
		if lifecycle.archive_after_days == 0 {
			return Err(ConfigError::Validation(
				"lifecycle.archive_after_days must be greater than 0".into(),
			));
		}
		if lifecycle.housekeeping_interval_seconds == 0 {
			return Err(ConfigError::Validation(
				"lifecycle.housekeeping_interval_seconds must be greater than 0".into(),
			));
		}
		if lifecycle.housekeeping_interval_seconds > 86400 {
			return Err(ConfigError::Validation(
				"lifecycle.housekeeping_interval_seconds cannot exceed 86400 (24 hours)".into(),
			));
		}

		if let Some(api) = self.api.as_ref().filter(|api| api.enabled) {
			if api.port == 0 {
				return Err(ConfigError::Validation("api.port cannot be 0".into()));
			}
			if api.timeout_seconds == 0 {
				return Err(ConfigError::Validation(
					"api.timeout_seconds must be greater than 0".into(),
				));
			}
		}

		Ok(())
	}
}

/// Parses a TOML string, resolving environment variables and validating the result.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}
