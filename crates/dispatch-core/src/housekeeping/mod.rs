//! Periodic maintenance of the order table.
//!
//! Two jobs run on every pass:
//! - pending orders the restaurant never confirmed are cancelled once they
//!   are older than the configured timeout;
//! - closed orders that have not changed for the configured number of days
//!   are archived, which takes them out of every active listing.
//!
//! Cancellation goes through the same conditional transition as a user
//! request, so a vendor confirming at the last moment simply wins.

use chrono::{DateTime, TimeDelta, Utc};
use dispatch_config::LifecycleConfig;
use dispatch_storage::{StatusChange, StorageService, Transition, TransitionOutcome};
use dispatch_types::OrderStatus;
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

use crate::LifecycleError;

/// Outcome of one housekeeping pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HousekeepingReport {
	/// Pending orders cancelled for lack of confirmation.
	pub cancelled: usize,
	/// Closed orders marked inactive.
	pub archived: usize,
}

pub struct HousekeepingService {
	storage: Arc<StorageService>,
	unconfirmed_timeout_minutes: u64,
	archive_after_days: u64,
}

impl HousekeepingService {
	pub fn new(storage: Arc<StorageService>, settings: &LifecycleConfig) -> Self {
		Self {
			storage,
			unconfirmed_timeout_minutes: settings.unconfirmed_timeout_minutes,
			archive_after_days: settings.archive_after_days,
		}
	}

	/// Runs both jobs as of `now`.
	#[instrument(skip_all)]
	pub async fn run_once(&self, now: DateTime<Utc>) -> Result<HousekeepingReport, LifecycleError> {
		let report = HousekeepingReport {
			cancelled: self.cancel_unconfirmed(now).await?,
			archived: self.archive_closed(now).await?,
		};
		if report.cancelled > 0 || report.archived > 0 {
			tracing::info!(
				cancelled = report.cancelled,
				archived = report.archived,
				"Housekeeping completed"
			);
		}
		Ok(report)
	}

	/// Cancels pending orders placed before the confirmation deadline.
	pub async fn cancel_unconfirmed(&self, now: DateTime<Utc>) -> Result<usize, LifecycleError> {
		let cutoff = cutoff(now, self.unconfirmed_timeout_minutes, TimeDelta::try_minutes)?;
		let reason = format!(
			"Order not confirmed by vendor within {} minutes",
			self.unconfirmed_timeout_minutes
		);

		let mut cancelled = 0;
		for order in self.storage.list_pending_placed_before(cutoff).await? {
			let transition = Transition::new(order.id, OrderStatus::Pending, OrderStatus::Cancelled)
				.cancellation_reason(reason.clone())
				.with_change(
					StatusChange::system()
						.with_note(reason.clone())
						.with_metadata(json!({ "job": "unconfirmed_timeout" })),
				);

			match self.storage.transition(transition).await? {
				TransitionOutcome::Applied(_) => {
					tracing::info!(order_id = order.id, "Cancelled unconfirmed order");
					cancelled += 1;
				},
				TransitionOutcome::PreconditionFailed => {
					tracing::debug!(order_id = order.id, "Order left pending before timeout cancel");
				},
			}
		}
		Ok(cancelled)
	}

	/// Archives delivered, cancelled and refunded orders past retention.
	pub async fn archive_closed(&self, now: DateTime<Utc>) -> Result<usize, LifecycleError> {
		let cutoff = cutoff(now, self.archive_after_days, TimeDelta::try_days)?;
		let archived = self.storage.archive_closed_before(cutoff).await?;
		if archived > 0 {
			tracing::debug!(archived, %cutoff, "Archived closed orders");
		}
		Ok(archived)
	}
}

fn cutoff(
	now: DateTime<Utc>,
	amount: u64,
	unit: fn(i64) -> Option<TimeDelta>,
) -> Result<DateTime<Utc>, LifecycleError> {
	i64::try_from(amount)
		.ok()
		.and_then(unit)
		.and_then(|delta| now.checked_sub_signed(delta))
		.ok_or_else(|| LifecycleError::Validation(format!("retention of {} is out of range", amount)))
}
