#![allow(dead_code)]

use dispatch_config::LifecycleConfig;
use dispatch_core::{ClaimsPolicy, LifecycleService};
use dispatch_storage::implementations::{memory::MemoryStorage, sqlite};
use dispatch_storage::StorageService;
use dispatch_types::{
	ConfirmOrderRequest, CreateOrderRequest, MonetarySnapshot, NewOrderItem, Order, Principal,
};
use std::sync::Arc;
use tempfile::TempDir;

pub const RESTAURANT: i64 = 7;

pub fn customer() -> Principal {
	Principal::customer(100)
}

pub fn vendor() -> Principal {
	Principal::vendor(200, vec![RESTAURANT])
}

pub fn driver(id: i64) -> Principal {
	Principal::driver(id, true)
}

pub fn admin() -> Principal {
	Principal::admin(1)
}

pub fn memory_service() -> Arc<LifecycleService> {
	let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
	Arc::new(LifecycleService::new(
		storage,
		Arc::new(ClaimsPolicy),
		&LifecycleConfig::default(),
	))
}

/// Sqlite-backed service. Keep the directory alive for the test's duration.
pub async fn sqlite_service() -> (Arc<LifecycleService>, TempDir) {
	let dir = TempDir::new().unwrap();
	let path = dir.path().join("orders.db");
	let mut table = toml::map::Map::new();
	table.insert(
		"path".into(),
		toml::Value::String(path.to_string_lossy().into_owned()),
	);
	let backend = sqlite::create_storage(&toml::Value::Table(table)).unwrap();
	let storage = Arc::new(StorageService::new(backend));
	storage.initialize().await.unwrap();

	let service = Arc::new(LifecycleService::new(
		storage,
		Arc::new(ClaimsPolicy),
		&LifecycleConfig::default(),
	));
	(service, dir)
}

pub fn order_request() -> CreateOrderRequest {
	CreateOrderRequest {
		restaurant_id: RESTAURANT,
		delivery_address_id: Some(12),
		special_instructions: Some("Ring twice".into()),
		items: vec![NewOrderItem {
			name: "Green curry".into(),
			description: Some("Medium spicy".into()),
			unit_price: "12.00".parse().unwrap(),
			quantity: 1,
			customizations: serde_json::json!({ "rice": "jasmine" }),
			line_total: "12.00".parse().unwrap(),
		}],
		amounts: MonetarySnapshot {
			subtotal: "12.00".parse().unwrap(),
			tax: "1.20".parse().unwrap(),
			delivery_fee: "2.00".parse().unwrap(),
			discount: "0".parse().unwrap(),
			total: "15.20".parse().unwrap(),
		},
		place: true,
	}
}

/// Creates a pending order.
pub async fn pending_order(service: &LifecycleService) -> Order {
	service
		.create_order(&customer(), order_request())
		.await
		.unwrap()
}

/// Creates an order and walks it to `preparing`.
pub async fn preparing_order(service: &LifecycleService) -> Order {
	let order = pending_order(service).await;
	service
		.confirm_order(order.id, &vendor(), ConfirmOrderRequest::default())
		.await
		.unwrap();
	service.start_preparing(order.id, &vendor()).await.unwrap()
}

/// Creates an order and walks it to `ready`.
pub async fn ready_order(service: &LifecycleService) -> Order {
	let order = preparing_order(service).await;
	service.mark_ready(order.id, &vendor()).await.unwrap()
}
