//! Common test utilities for the storage engine integration tests
//!
//! Provides a scratch directory with an opened gateway plus helpers for
//! seeding products and movements.

use inventario_store::{MovementKind, NewMovement, StoreConfig, StoreGateway, Value};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Test context holding temporary resources
#[allow(dead_code)]
pub struct TestContext {
    pub temp_dir: TempDir,
    pub gateway: StoreGateway,
    pub db_path: PathBuf,
}

#[allow(dead_code)]
impl TestContext {
    /// Create a new test context with an opened store
    pub async fn new() -> Self {
        Self::with_name("inventario").await
    }

    /// Create a test context with a specific database name
    pub async fn with_name(name: &str) -> Self {
        let temp_dir =
            TempDir::new().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"));
        let db_path = temp_dir.path().join(format!("{name}.db"));
        let gateway = StoreGateway::spawn(StoreConfig::new(&db_path));
        gateway
            .open()
            .await
            .unwrap_or_else(|err| panic!("failed to open {}: {err}", db_path.display()));

        Self {
            temp_dir,
            gateway,
            db_path,
        }
    }

    /// Get the temp directory path
    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Insert a product and return its id
    pub async fn insert_product(&self, code: &str, name: &str, cost: f64) -> i64 {
        self.gateway
            .execute(
                "INSERT INTO productos (codigo_interno, nombre, costo_unitario, stock_minimo)
                 VALUES (?, ?, ?, 5)",
                vec![Value::from(code), Value::from(name), Value::Real(cost)],
            )
            .await
            .unwrap_or_else(|err| panic!("failed to insert product {code}: {err}"))
            .inserted_id
            .unwrap_or_else(|| panic!("no inserted id for product {code}"))
    }

    /// Append a movement and return its id
    pub async fn movement(&self, product_id: i64, kind: MovementKind, quantity: f64) -> i64 {
        self.gateway
            .record_movement(NewMovement::new(product_id, kind, quantity))
            .await
            .unwrap_or_else(|err| panic!("failed to record {kind} of {quantity}: {err}"))
    }

    /// Current stock of a product
    pub async fn stock(&self, product_id: i64) -> f64 {
        self.gateway
            .current_stock(product_id)
            .await
            .unwrap_or_else(|err| panic!("failed to read stock of {product_id}: {err}"))
            .stock_actual
    }

    /// Count rows of a table
    pub async fn count(&self, table: &str) -> i64 {
        self.gateway
            .query_one(format!("SELECT COUNT(*) AS n FROM {table}"), vec![])
            .await
            .unwrap_or_else(|err| panic!("failed to count {table}: {err}"))
            .and_then(|row| row.get_i64("n"))
            .unwrap_or_else(|| panic!("no count for {table}"))
    }
}
