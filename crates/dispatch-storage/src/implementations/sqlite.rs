//! SQLite storage backend.
//!
//! The driver/status invariant is a CHECK constraint on the `orders` table and
//! the claimable-orders query is served by a partial index, so the database
//! rejects inconsistent rows no matter which process writes them. An order has
//! a single `driver_id` column, so it can never hold two current drivers.
//!
//! Every write runs inside `BEGIN IMMEDIATE`, which takes the database write
//! lock up front. A transition is a single `UPDATE ... WHERE <preconditions>
//! RETURNING ...`; zero returned rows means the precondition no longer holds.

use crate::{
	OrderStoreInterface, StatusChange, StorageError, StorageFactory, StorageRegistry, Transition,
	TransitionOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dispatch_types::{
	entered_at_column, ConfigSchema, Field, FieldType, ImplementationRegistry, MonetarySnapshot,
	NewOrder, Order, OrderId, OrderItem, OrderStatus, Schema, StatusHistoryEntry, UserId,
	ValidationError,
};
use rust_decimal::Decimal;
use sqlx::sqlite::{
	SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, Transaction};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

const CREATE_ORDERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    customer_id INTEGER NOT NULL,
    restaurant_id INTEGER NOT NULL,
    delivery_address_id INTEGER,
    driver_id INTEGER,
    status TEXT NOT NULL CHECK (status IN (
        'cart', 'pending', 'confirmed', 'preparing', 'ready', 'driver_assigned',
        'picked_up', 'in_transit', 'delivered', 'cancelled', 'refunded'
    )),
    subtotal_amount TEXT NOT NULL,
    tax_amount TEXT NOT NULL,
    delivery_fee TEXT NOT NULL,
    discount_amount TEXT NOT NULL,
    total_amount TEXT NOT NULL,
    special_instructions TEXT,
    cancellation_reason TEXT,
    estimated_preparation_minutes INTEGER,
    estimated_delivery_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    placed_at TEXT,
    confirmed_at TEXT,
    ready_at TEXT,
    delivered_at TEXT,
    cancelled_at TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    CONSTRAINT chk_orders_driver_status CHECK (
        (status IN ('cart', 'pending', 'confirmed', 'preparing', 'ready') AND driver_id IS NULL)
        OR (status IN ('driver_assigned', 'picked_up', 'in_transit', 'delivered') AND driver_id IS NOT NULL)
        OR status IN ('cancelled', 'refunded')
    )
)
"#;

/// Hot path for drivers polling for work.
const CREATE_AVAILABLE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_orders_available
    ON orders(status, driver_id)
    WHERE status = 'ready' AND driver_id IS NULL AND is_active = 1
"#;

const CREATE_DRIVER_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_orders_driver
    ON orders(driver_id)
    WHERE driver_id IS NOT NULL
"#;

const CREATE_PENDING_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_orders_status_placed
    ON orders(status, placed_at)
"#;

const CREATE_ITEMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS order_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id INTEGER NOT NULL REFERENCES orders(id),
    name TEXT NOT NULL,
    description TEXT,
    unit_price TEXT NOT NULL,
    quantity INTEGER NOT NULL CHECK (quantity > 0),
    customizations TEXT NOT NULL DEFAULT 'null',
    line_total TEXT NOT NULL
)
"#;

const CREATE_ITEMS_INDEX: &str =
	"CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id)";

const CREATE_HISTORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS order_status_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id INTEGER NOT NULL REFERENCES orders(id),
    actor_id INTEGER,
    from_status TEXT,
    to_status TEXT NOT NULL,
    note TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
)
"#;

const CREATE_HISTORY_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_order_status_history_order ON order_status_history(order_id, id)";

const SCHEMA: &[&str] = &[
	CREATE_ORDERS_TABLE,
	CREATE_AVAILABLE_INDEX,
	CREATE_DRIVER_INDEX,
	CREATE_PENDING_INDEX,
	CREATE_ITEMS_TABLE,
	CREATE_ITEMS_INDEX,
	CREATE_HISTORY_TABLE,
	CREATE_HISTORY_INDEX,
];

const ORDER_COLUMNS: &str = "id, customer_id, restaurant_id, delivery_address_id, driver_id, \
	status, subtotal_amount, tax_amount, delivery_fee, discount_amount, total_amount, \
	special_instructions, cancellation_reason, estimated_preparation_minutes, \
	estimated_delivery_at, created_at, updated_at, placed_at, confirmed_at, ready_at, \
	delivered_at, cancelled_at, is_active";

impl From<sqlx::Error> for StorageError {
	fn from(err: sqlx::Error) -> Self {
		use sqlx::error::ErrorKind;

		match &err {
			sqlx::Error::Database(db) => match db.kind() {
				ErrorKind::CheckViolation
				| ErrorKind::UniqueViolation
				| ErrorKind::ForeignKeyViolation
				| ErrorKind::NotNullViolation => StorageError::Constraint(db.message().to_string()),
				_ => StorageError::Backend(err.to_string()),
			},
			sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
				StorageError::Serialization(err.to_string())
			},
			_ => StorageError::Backend(err.to_string()),
		}
	}
}

fn format_ts(at: DateTime<Utc>) -> String {
	// Fixed width so lexical order in SQL matches chronological order.
	at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StorageError> {
	DateTime::parse_from_rfc3339(value)
		.map(|at| at.with_timezone(&Utc))
		.map_err(|e| StorageError::Serialization(format!("invalid timestamp '{}': {}", value, e)))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>, StorageError> {
	value.as_deref().map(parse_ts).transpose()
}

fn parse_decimal(value: &str) -> Result<Decimal, StorageError> {
	Decimal::from_str(value)
		.map_err(|e| StorageError::Serialization(format!("invalid amount '{}': {}", value, e)))
}

fn parse_status(value: &str) -> Result<OrderStatus, StorageError> {
	value.parse().map_err(StorageError::Serialization)
}

fn parse_json(value: &str) -> Result<serde_json::Value, StorageError> {
	serde_json::from_str(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn order_from_row(row: &SqliteRow) -> Result<Order, StorageError> {
	let status: String = row.try_get("status")?;
	Ok(Order {
		id: row.try_get("id")?,
		customer_id: row.try_get("customer_id")?,
		restaurant_id: row.try_get("restaurant_id")?,
		delivery_address_id: row.try_get("delivery_address_id")?,
		driver_id: row.try_get("driver_id")?,
		status: parse_status(&status)?,
		amounts: MonetarySnapshot {
			subtotal: parse_decimal(row.try_get("subtotal_amount")?)?,
			tax: parse_decimal(row.try_get("tax_amount")?)?,
			delivery_fee: parse_decimal(row.try_get("delivery_fee")?)?,
			discount: parse_decimal(row.try_get("discount_amount")?)?,
			total: parse_decimal(row.try_get("total_amount")?)?,
		},
		special_instructions: row.try_get("special_instructions")?,
		cancellation_reason: row.try_get("cancellation_reason")?,
		estimated_preparation_minutes: row.try_get("estimated_preparation_minutes")?,
		estimated_delivery_at: parse_opt_ts(row.try_get("estimated_delivery_at")?)?,
		created_at: parse_ts(row.try_get("created_at")?)?,
		updated_at: parse_ts(row.try_get("updated_at")?)?,
		placed_at: parse_opt_ts(row.try_get("placed_at")?)?,
		confirmed_at: parse_opt_ts(row.try_get("confirmed_at")?)?,
		ready_at: parse_opt_ts(row.try_get("ready_at")?)?,
		delivered_at: parse_opt_ts(row.try_get("delivered_at")?)?,
		cancelled_at: parse_opt_ts(row.try_get("cancelled_at")?)?,
		is_active: row.try_get("is_active")?,
	})
}

fn item_from_row(row: &SqliteRow) -> Result<OrderItem, StorageError> {
	Ok(OrderItem {
		id: row.try_get("id")?,
		order_id: row.try_get("order_id")?,
		name: row.try_get("name")?,
		description: row.try_get("description")?,
		unit_price: parse_decimal(row.try_get("unit_price")?)?,
		quantity: row.try_get("quantity")?,
		customizations: parse_json(row.try_get("customizations")?)?,
		line_total: parse_decimal(row.try_get("line_total")?)?,
	})
}

fn history_from_row(row: &SqliteRow) -> Result<StatusHistoryEntry, StorageError> {
	let from_status: Option<String> = row.try_get("from_status")?;
	Ok(StatusHistoryEntry {
		id: row.try_get("id")?,
		order_id: row.try_get("order_id")?,
		actor_id: row.try_get("actor_id")?,
		from_status: from_status.as_deref().map(parse_status).transpose()?,
		to_status: parse_status(row.try_get("to_status")?)?,
		note: row.try_get("note")?,
		metadata: parse_json(row.try_get("metadata")?)?,
		created_at: parse_ts(row.try_get("created_at")?)?,
	})
}

/// SQLite implementation of the order store.
pub struct SqliteStorage {
	pool: SqlitePool,
}

impl SqliteStorage {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	/// Opens a write transaction. `BEGIN IMMEDIATE` takes the write lock up
	/// front so concurrent writers queue on the busy timeout instead of failing
	/// when a deferred transaction tries to upgrade its lock.
	///
	/// The returned guard rolls back when dropped without `commit`, including
	/// when the calling future is cancelled, so the connection goes back to the
	/// pool outside any transaction.
	async fn begin_immediate(&self) -> Result<Transaction<'static, Sqlite>, StorageError> {
		Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
	}

	async fn append_history(
		conn: &mut SqliteConnection,
		order_id: OrderId,
		from: Option<OrderStatus>,
		to: OrderStatus,
		change: &StatusChange,
		at: DateTime<Utc>,
	) -> Result<(), StorageError> {
		let metadata = serde_json::to_string(&change.metadata)
			.map_err(|e| StorageError::Serialization(e.to_string()))?;
		sqlx::query(
			"INSERT INTO order_status_history \
			 (order_id, actor_id, from_status, to_status, note, metadata, created_at) \
			 VALUES (?, ?, ?, ?, ?, ?, ?)",
		)
		.bind(order_id)
		.bind(change.actor_id)
		.bind(from.map(|s| s.as_str()))
		.bind(to.as_str())
		.bind(change.note.as_deref())
		.bind(metadata)
		.bind(format_ts(at))
		.execute(&mut *conn)
		.await?;
		Ok(())
	}

	async fn insert_order(
		conn: &mut SqliteConnection,
		new: NewOrder,
		change: StatusChange,
	) -> Result<Order, StorageError> {
		if let Some(id) = new.id {
			let exists = sqlx::query("SELECT 1 FROM orders WHERE id = ?")
				.bind(id)
				.fetch_optional(&mut *conn)
				.await?;
			if exists.is_some() {
				return Err(StorageError::Duplicate(id));
			}
		}

		let now = Utc::now();
		let created = format_ts(now);
		let placed_at = (new.status == OrderStatus::Pending).then(|| created.clone());

		let row = sqlx::query(&format!(
			"INSERT INTO orders (id, customer_id, restaurant_id, delivery_address_id, status, \
			 subtotal_amount, tax_amount, delivery_fee, discount_amount, total_amount, \
			 special_instructions, created_at, updated_at, placed_at, is_active) \
			 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1) RETURNING {}",
			ORDER_COLUMNS
		))
		.bind(new.id)
		.bind(new.customer_id)
		.bind(new.restaurant_id)
		.bind(new.delivery_address_id)
		.bind(new.status.as_str())
		.bind(new.amounts.subtotal.to_string())
		.bind(new.amounts.tax.to_string())
		.bind(new.amounts.delivery_fee.to_string())
		.bind(new.amounts.discount.to_string())
		.bind(new.amounts.total.to_string())
		.bind(new.special_instructions.as_deref())
		.bind(&created)
		.bind(&created)
		.bind(placed_at)
		.fetch_one(&mut *conn)
		.await?;
		let order = order_from_row(&row)?;

		for item in &new.items {
			let customizations = serde_json::to_string(&item.customizations)
				.map_err(|e| StorageError::Serialization(e.to_string()))?;
			sqlx::query(
				"INSERT INTO order_items \
				 (order_id, name, description, unit_price, quantity, customizations, line_total) \
				 VALUES (?, ?, ?, ?, ?, ?, ?)",
			)
			.bind(order.id)
			.bind(&item.name)
			.bind(item.description.as_deref())
			.bind(item.unit_price.to_string())
			.bind(item.quantity)
			.bind(customizations)
			.bind(item.line_total.to_string())
			.execute(&mut *conn)
			.await?;
		}

		Self::append_history(conn, order.id, None, order.status, &change, now).await?;
		Ok(order)
	}

	async fn apply_transition(
		conn: &mut SqliteConnection,
		transition: Transition,
	) -> Result<TransitionOutcome, StorageError> {
		let now = Utc::now();
		let stamp = format_ts(now);

		let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE orders SET status = ");
		query.push_bind(transition.to.as_str());
		query.push(", updated_at = ").push_bind(stamp.clone());
		if let Some(driver) = transition.assign_driver {
			query.push(", driver_id = ").push_bind(driver);
		}
		if let Some(reason) = &transition.cancellation_reason {
			query.push(", cancellation_reason = ").push_bind(reason.clone());
		}
		if let Some(minutes) = transition.estimated_preparation_minutes {
			query
				.push(", estimated_preparation_minutes = ")
				.push_bind(minutes);
		}
		if let Some(at) = transition.estimated_delivery_at {
			query
				.push(", estimated_delivery_at = ")
				.push_bind(format_ts(at));
		}
		if let Some(column) = entered_at_column(transition.to) {
			query
				.push(format!(", {column} = COALESCE({column}, "))
				.push_bind(stamp.clone())
				.push(")");
		}

		query.push(" WHERE id = ").push_bind(transition.order_id);
		query
			.push(" AND status = ")
			.push_bind(transition.expected_from.as_str());
		if transition.require_unassigned {
			query.push(" AND driver_id IS NULL");
		}
		if transition.require_active {
			query.push(" AND is_active = 1");
		}
		if let Some(driver) = transition.expected_driver {
			query.push(" AND driver_id = ").push_bind(driver);
		}
		query.push(" RETURNING ").push(ORDER_COLUMNS);

		let Some(row) = query.build().fetch_optional(&mut *conn).await? else {
			return Ok(TransitionOutcome::PreconditionFailed);
		};
		let order = order_from_row(&row)?;

		Self::append_history(
			conn,
			order.id,
			Some(transition.expected_from),
			transition.to,
			&transition.change,
			now,
		)
		.await?;
		Ok(TransitionOutcome::Applied(order))
	}

	async fn fetch_orders(&self, sql: &str, bind: Option<i64>) -> Result<Vec<Order>, StorageError> {
		let mut query = sqlx::query(sql);
		if let Some(value) = bind {
			query = query.bind(value);
		}
		query
			.fetch_all(&self.pool)
			.await?
			.iter()
			.map(order_from_row)
			.collect()
	}
}

#[async_trait]
impl OrderStoreInterface for SqliteStorage {
	async fn initialize(&self) -> Result<(), StorageError> {
		for statement in SCHEMA {
			sqlx::query(statement).execute(&self.pool).await?;
		}
		tracing::debug!("SQLite order schema ready");
		Ok(())
	}

	async fn create(&self, order: NewOrder, change: StatusChange) -> Result<Order, StorageError> {
		let mut tx = self.begin_immediate().await?;
		let order = Self::insert_order(&mut tx, order, change).await?;
		tx.commit().await?;
		Ok(order)
	}

	async fn get(&self, id: OrderId) -> Result<Order, StorageError> {
		let row = sqlx::query(&format!("SELECT {} FROM orders WHERE id = ?", ORDER_COLUMNS))
			.bind(id)
			.fetch_optional(&self.pool)
			.await?
			.ok_or(StorageError::NotFound(id))?;
		order_from_row(&row)
	}

	async fn items(&self, id: OrderId) -> Result<Vec<OrderItem>, StorageError> {
		sqlx::query("SELECT * FROM order_items WHERE order_id = ? ORDER BY id")
			.bind(id)
			.fetch_all(&self.pool)
			.await?
			.iter()
			.map(item_from_row)
			.collect()
	}

	async fn list_available(&self) -> Result<Vec<Order>, StorageError> {
		let sql = format!(
			"SELECT {} FROM orders \
			 WHERE status = 'ready' AND driver_id IS NULL AND is_active = 1 \
			 ORDER BY ready_at, id",
			ORDER_COLUMNS
		);
		self.fetch_orders(&sql, None).await
	}

	async fn list_by_driver(&self, driver_id: UserId) -> Result<Vec<Order>, StorageError> {
		let sql = format!(
			"SELECT {} FROM orders WHERE driver_id = ? AND is_active = 1 ORDER BY id",
			ORDER_COLUMNS
		);
		self.fetch_orders(&sql, Some(driver_id)).await
	}

	async fn transition(&self, transition: Transition) -> Result<TransitionOutcome, StorageError> {
		let mut tx = self.begin_immediate().await?;
		let outcome = Self::apply_transition(&mut tx, transition).await?;
		tx.commit().await?;
		Ok(outcome)
	}

	async fn history(&self, id: OrderId) -> Result<Vec<StatusHistoryEntry>, StorageError> {
		sqlx::query("SELECT * FROM order_status_history WHERE order_id = ? ORDER BY id")
			.bind(id)
			.fetch_all(&self.pool)
			.await?
			.iter()
			.map(history_from_row)
			.collect()
	}

	async fn list_pending_placed_before(
		&self,
		cutoff: DateTime<Utc>,
	) -> Result<Vec<Order>, StorageError> {
		let rows = sqlx::query(&format!(
			"SELECT {} FROM orders \
			 WHERE status = 'pending' AND is_active = 1 AND placed_at < ? \
			 ORDER BY placed_at",
			ORDER_COLUMNS
		))
		.bind(format_ts(cutoff))
		.fetch_all(&self.pool)
		.await?;
		rows.iter().map(order_from_row).collect()
	}

	async fn archive_closed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
		let result = sqlx::query(
			"UPDATE orders SET is_active = 0 \
			 WHERE is_active = 1 \
			   AND status IN ('delivered', 'cancelled', 'refunded') \
			   AND updated_at < ?",
		)
		.bind(format_ts(cutoff))
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() as usize)
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(SqliteStorageSchema)
	}
}

/// Configuration schema for SqliteStorage.
pub struct SqliteStorageSchema;

impl ConfigSchema for SqliteStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![
				Field::new("path", FieldType::String).with_validator(|value| {
					match value.as_str() {
						Some(path) if path.trim().is_empty() => {
							Err("path cannot be empty".to_string())
						},
						_ => Ok(()),
					}
				}),
			],
			vec![
				Field::new(
					"max_connections",
					FieldType::Integer {
						min: Some(1),
						max: Some(64),
					},
				),
				Field::new(
					"busy_timeout_ms",
					FieldType::Integer {
						min: Some(0),
						max: Some(600_000),
					},
				),
			],
		);
		schema.validate(config)
	}
}

/// Factory function to create a SQLite storage backend from configuration.
///
/// Configuration parameters:
/// - `path`: database file, created if missing
/// - `max_connections`: pool size (default: 8)
/// - `busy_timeout_ms`: how long a writer waits for the lock (default: 5000)
///
/// The pool connects lazily; the schema is created by `initialize`.
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn OrderStoreInterface>, StorageError> {
	SqliteStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;

	let path = config
		.get("path")
		.and_then(|v| v.as_str())
		.ok_or_else(|| StorageError::Configuration("path is required".to_string()))?;
	let max_connections = config
		.get("max_connections")
		.and_then(|v| v.as_integer())
		.map_or(DEFAULT_MAX_CONNECTIONS, |n| n as u32);
	let busy_timeout_ms = config
		.get("busy_timeout_ms")
		.and_then(|v| v.as_integer())
		.map_or(DEFAULT_BUSY_TIMEOUT_MS, |n| n as u64);

	if let Some(parent) = std::path::Path::new(path).parent() {
		if !parent.as_os_str().is_empty() {
			std::fs::create_dir_all(parent).map_err(|e| {
				StorageError::Configuration(format!(
					"cannot create directory {}: {}",
					parent.display(),
					e
				))
			})?;
		}
	}

	let options = SqliteConnectOptions::new()
		.filename(path)
		.create_if_missing(true)
		.journal_mode(SqliteJournalMode::Wal)
		.foreign_keys(true)
		.busy_timeout(Duration::from_millis(busy_timeout_ms));
	let pool = SqlitePoolOptions::new()
		.max_connections(max_connections)
		.connect_lazy_with(options);

	tracing::info!(path, max_connections, "Configured SQLite order store");
	Ok(Box::new(SqliteStorage::new(pool)))
}

/// Registry for the SQLite storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "sqlite";
	type Factory = StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StorageRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;
	use dispatch_types::NewOrderItem;
	use tempfile::TempDir;

	async fn open(dir: &TempDir) -> Box<dyn OrderStoreInterface> {
		let mut table = toml::map::Map::new();
		table.insert(
			"path".to_string(),
			toml::Value::String(dir.path().join("orders.db").display().to_string()),
		);
		let storage = create_storage(&toml::Value::Table(table)).unwrap();
		storage.initialize().await.unwrap();
		storage
	}

	fn pending_order() -> NewOrder {
		NewOrder {
			id: None,
			customer_id: 10,
			restaurant_id: 20,
			delivery_address_id: Some(30),
			status: OrderStatus::Pending,
			amounts: MonetarySnapshot {
				subtotal: Decimal::new(1850, 2),
				tax: Decimal::new(185, 2),
				delivery_fee: Decimal::new(299, 2),
				discount: Decimal::new(100, 2),
				total: Decimal::new(2234, 2),
			},
			special_instructions: Some("Ring twice".to_string()),
			items: vec![NewOrderItem {
				name: "Ramen".to_string(),
				description: Some("Tonkotsu".to_string()),
				unit_price: Decimal::new(1850, 2),
				quantity: 1,
				customizations: serde_json::json!({"spice": "medium"}),
				line_total: Decimal::new(1850, 2),
			}],
		}
	}

	async fn advance(
		storage: &dyn OrderStoreInterface,
		id: OrderId,
		from: OrderStatus,
		to: OrderStatus,
	) -> Order {
		match storage
			.transition(Transition::new(id, from, to).with_change(StatusChange::by(20)))
			.await
			.unwrap()
		{
			TransitionOutcome::Applied(order) => order,
			TransitionOutcome::PreconditionFailed => panic!("{} -> {} did not apply", from, to),
		}
	}

	#[tokio::test]
	async fn test_create_round_trips_all_columns() {
		let dir = TempDir::new().unwrap();
		let storage = open(&dir).await;

		let created = storage
			.create(pending_order(), StatusChange::by(10).with_note("checkout"))
			.await
			.unwrap();
		let loaded = storage.get(created.id).await.unwrap();

		assert_eq!(created, loaded);
		assert_eq!(loaded.amounts.total, Decimal::new(2234, 2));
		assert!(loaded.placed_at.is_some());
		assert!(loaded.is_active);

		let items = storage.items(created.id).await.unwrap();
		assert_eq!(items.len(), 1);
		assert_eq!(items[0].customizations["spice"], "medium");

		let history = storage.history(created.id).await.unwrap();
		assert_eq!(history.len(), 1);
		assert_eq!(history[0].from_status, None);
		assert_eq!(history[0].note.as_deref(), Some("checkout"));
	}

	#[tokio::test]
	async fn test_get_missing_order() {
		let dir = TempDir::new().unwrap();
		let storage = open(&dir).await;
		assert!(matches!(
			storage.get(404).await,
			Err(StorageError::NotFound(404))
		));
	}

	#[tokio::test]
	async fn test_duplicate_external_id() {
		let dir = TempDir::new().unwrap();
		let storage = open(&dir).await;
		let mut new = pending_order();
		new.id = Some(500);

		storage.create(new.clone(), StatusChange::by(10)).await.unwrap();
		let result = storage.create(new, StatusChange::by(10)).await;
		assert!(matches!(result, Err(StorageError::Duplicate(500))));
	}

	#[tokio::test]
	async fn test_check_constraint_rejects_driverless_assignment() {
		let dir = TempDir::new().unwrap();
		let storage = open(&dir).await;
		let order = storage.create(pending_order(), StatusChange::by(10)).await.unwrap();
		advance(storage.as_ref(), order.id, OrderStatus::Pending, OrderStatus::Confirmed).await;
		advance(storage.as_ref(), order.id, OrderStatus::Confirmed, OrderStatus::Preparing).await;
		advance(storage.as_ref(), order.id, OrderStatus::Preparing, OrderStatus::Ready).await;

		let result = storage
			.transition(Transition::new(order.id, OrderStatus::Ready, OrderStatus::DriverAssigned))
			.await;
		assert!(matches!(result, Err(StorageError::Constraint(_))));

		// The rolled back transaction left no trace.
		assert_eq!(storage.get(order.id).await.unwrap().status, OrderStatus::Ready);
		assert_eq!(storage.history(order.id).await.unwrap().len(), 4);
	}

	#[tokio::test]
	async fn test_claim_and_precondition_failure() {
		let dir = TempDir::new().unwrap();
		let storage = open(&dir).await;
		let order = storage.create(pending_order(), StatusChange::by(10)).await.unwrap();
		advance(storage.as_ref(), order.id, OrderStatus::Pending, OrderStatus::Confirmed).await;
		advance(storage.as_ref(), order.id, OrderStatus::Confirmed, OrderStatus::Preparing).await;
		let ready =
			advance(storage.as_ref(), order.id, OrderStatus::Preparing, OrderStatus::Ready).await;
		assert!(ready.ready_at.is_some());
		assert_eq!(storage.list_available().await.unwrap().len(), 1);

		let claim = |driver| {
			Transition::new(order.id, OrderStatus::Ready, OrderStatus::DriverAssigned)
				.require_unassigned()
				.require_active()
				.assign_driver(driver)
				.with_change(StatusChange::by(driver))
		};

		let first = storage.transition(claim(7)).await.unwrap();
		assert!(matches!(first, TransitionOutcome::Applied(ref o) if o.driver_id == Some(7)));
		let second = storage.transition(claim(8)).await.unwrap();
		assert_eq!(second, TransitionOutcome::PreconditionFailed);

		assert!(storage.list_available().await.unwrap().is_empty());
		assert_eq!(storage.list_by_driver(7).await.unwrap().len(), 1);
		assert!(storage.list_by_driver(8).await.unwrap().is_empty());
		assert_eq!(storage.history(order.id).await.unwrap().len(), 5);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_concurrent_claims_have_one_winner() {
		let dir = TempDir::new().unwrap();
		let storage = std::sync::Arc::new(open(&dir).await);
		let order_id = storage
			.create(pending_order(), StatusChange::by(10))
			.await
			.unwrap()
			.id;
		let store: &dyn OrderStoreInterface = storage.as_ref().as_ref();
		advance(store, order_id, OrderStatus::Pending, OrderStatus::Confirmed).await;
		advance(store, order_id, OrderStatus::Confirmed, OrderStatus::Preparing).await;
		advance(store, order_id, OrderStatus::Preparing, OrderStatus::Ready).await;

		let attempts = (1..=12).map(|driver| {
			let storage = storage.clone();
			tokio::spawn(async move {
				storage
					.transition(
						Transition::new(order_id, OrderStatus::Ready, OrderStatus::DriverAssigned)
							.require_unassigned()
							.require_active()
							.assign_driver(100 + driver),
					)
					.await
			})
		});
		let results = futures::future::join_all(attempts).await;

		let applied = results
			.into_iter()
			.map(|joined| joined.unwrap().unwrap())
			.filter(|outcome| matches!(outcome, TransitionOutcome::Applied(_)))
			.count();
		assert_eq!(applied, 1);

		let history = storage.history(order_id).await.unwrap();
		let assignments = history
			.iter()
			.filter(|e| e.to_status == OrderStatus::DriverAssigned)
			.count();
		assert_eq!(assignments, 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_cancelled_write_leaves_no_open_transaction() {
		use sqlx::Connection;

		let dir = TempDir::new().unwrap();
		let path = dir.path().join("orders.db");
		let mut table = toml::map::Map::new();
		table.insert(
			"path".to_string(),
			toml::Value::String(path.display().to_string()),
		);
		table.insert("max_connections".to_string(), toml::Value::Integer(1));
		let storage = create_storage(&toml::Value::Table(table)).unwrap();
		storage.initialize().await.unwrap();
		let order = storage.create(pending_order(), StatusChange::by(10)).await.unwrap();

		// Another writer holds the database lock while the confirmation waits
		let mut blocker = SqliteConnection::connect_with(&SqliteConnectOptions::new().filename(&path))
			.await
			.unwrap();
		sqlx::query("BEGIN IMMEDIATE").execute(&mut blocker).await.unwrap();

		let confirm = || {
			Transition::new(order.id, OrderStatus::Pending, OrderStatus::Confirmed)
				.with_change(StatusChange::by(20))
		};
		let abandoned =
			tokio::time::timeout(Duration::from_millis(200), storage.transition(confirm())).await;
		assert!(abandoned.is_err());

		sqlx::query("COMMIT").execute(&mut blocker).await.unwrap();
		blocker.close().await.unwrap();

		let outcome = storage.transition(confirm()).await.unwrap();
		assert!(matches!(outcome, TransitionOutcome::Applied(ref o) if o.status == OrderStatus::Confirmed));
		storage.create(pending_order(), StatusChange::by(10)).await.unwrap();

		// The abandoned attempt wrote nothing
		let history = storage.history(order.id).await.unwrap();
		assert_eq!(history.len(), 2);
	}

	#[tokio::test]
	async fn test_timestamps_set_once_and_archive() {
		let dir = TempDir::new().unwrap();
		let storage = open(&dir).await;
		let order = storage.create(pending_order(), StatusChange::by(10)).await.unwrap();

		let cancelled = match storage
			.transition(
				Transition::new(order.id, OrderStatus::Pending, OrderStatus::Cancelled)
					.cancellation_reason("restaurant closed")
					.with_change(StatusChange::by(20).with_note("restaurant closed")),
			)
			.await
			.unwrap()
		{
			TransitionOutcome::Applied(order) => order,
			TransitionOutcome::PreconditionFailed => panic!("cancel did not apply"),
		};
		assert_eq!(cancelled.placed_at, order.placed_at);
		assert!(cancelled.cancelled_at.is_some());
		assert_eq!(cancelled.cancellation_reason.as_deref(), Some("restaurant closed"));

		let before = Utc::now() - chrono::Duration::days(1);
		assert_eq!(storage.archive_closed_before(before).await.unwrap(), 0);
		let after = Utc::now() + chrono::Duration::seconds(1);
		assert_eq!(storage.archive_closed_before(after).await.unwrap(), 1);
		assert!(!storage.get(order.id).await.unwrap().is_active);
	}

	#[tokio::test]
	async fn test_pending_cutoff_query() {
		let dir = TempDir::new().unwrap();
		let storage = open(&dir).await;
		let order = storage.create(pending_order(), StatusChange::by(10)).await.unwrap();

		let past = Utc::now() - chrono::Duration::minutes(30);
		assert!(storage.list_pending_placed_before(past).await.unwrap().is_empty());

		let future = Utc::now() + chrono::Duration::seconds(1);
		let stale = storage.list_pending_placed_before(future).await.unwrap();
		assert_eq!(stale.len(), 1);
		assert_eq!(stale[0].id, order.id);
	}

	#[test]
	fn test_schema_requires_path() {
		let config: toml::Value = toml::from_str("max_connections = 2").unwrap();
		assert!(SqliteStorageSchema.validate(&config).is_err());
		assert!(create_storage(&config).is_err());
	}
}
