//! Inventario storage engine
//!
//! Embedded persistence for the retail back office: one SQLite file holding
//! products, the stock movement ledger, purchases, sales and configuration.
//! Every statement goes through a single [`StoreGateway`], which also runs
//! the backup/restore lifecycle without ever opening a second connection.

pub mod backup;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod migration;
pub mod schema;
pub mod settings;

pub use backup::{BackupOperation, BackupOutcome, BackupRecord, BackupTrigger};
pub use config::StoreConfig;
pub use db::{ConnectionPhase, Database, ExecuteResult, IntegrityReport, Row, StoreGateway, Value};
pub use error::{AppError, ErrorCategory, StoreError};
pub use ledger::{
    InventoryItem, MovementKind, NewMovement, NewPurchase, PurchaseLine, StockLevel, StockMovement,
};
pub use migration::{ColumnMigration, FailedStep, MigrationReport};
pub use schema::SchemaObject;
pub use settings::ConfigEntry;
