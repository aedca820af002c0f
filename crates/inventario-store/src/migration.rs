//! Additive schema migrations
//!
//! Older store files predate some columns. Each step adds one nullable (or
//! defaulted) column when `PRAGMA table_info` shows it is missing, so running
//! the list again is a no-op. Steps are isolated: a failing step is logged
//! and reported, and the remaining steps still run.
//!
//! Only additive changes are supported. Renames, drops and type changes are
//! out of scope for this module.

use crate::error::StoreError;
use crate::schema;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// One "add this column if it is absent" step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMigration {
    /// Stable step name, used in logs and reports
    pub name: &'static str,
    pub table: &'static str,
    pub column: &'static str,
    /// Column type and constraints as written after the column name
    pub definition: &'static str,
}

impl ColumnMigration {
    fn alter_sql(&self) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.table, self.column, self.definition
        )
    }
}

/// Known additive changes, applied in order
pub const MIGRATIONS: &[ColumnMigration] = &[
    ColumnMigration {
        name: "productos_ubicacion",
        table: "productos",
        column: "ubicacion",
        definition: "TEXT",
    },
    ColumnMigration {
        name: "productos_marca",
        table: "productos",
        column: "marca",
        definition: "TEXT",
    },
    ColumnMigration {
        name: "ventas_metodo_pago",
        table: "ventas",
        column: "metodo_pago",
        definition: "TEXT DEFAULT 'efectivo'",
    },
    ColumnMigration {
        name: "movimientos_referencia",
        table: "movimientos_inventario",
        column: "referencia",
        definition: "TEXT",
    },
    ColumnMigration {
        name: "detalle_ventas_costo_unitario",
        table: "detalle_ventas",
        column: "costo_unitario",
        definition: "REAL",
    },
];

/// Result of a migration run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Steps that added their column in this run
    pub applied: Vec<String>,
    /// Steps whose column already existed
    pub skipped: Vec<String>,
    /// Steps that failed; the store stays usable without them
    pub failed: Vec<FailedStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStep {
    pub name: String,
    pub reason: String,
}

impl MigrationReport {
    /// Whether any column was added
    pub fn migration_performed(&self) -> bool {
        !self.applied.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Run every known migration step
pub fn migrate(conn: &Connection) -> MigrationReport {
    migrate_with(conn, MIGRATIONS)
}

/// Run the given steps in order, isolating failures
pub fn migrate_with(conn: &Connection, steps: &[ColumnMigration]) -> MigrationReport {
    let mut report = MigrationReport::default();

    for step in steps {
        match apply_step(conn, step) {
            Ok(true) => {
                tracing::info!(
                    "Migration '{}': added {}.{}",
                    step.name,
                    step.table,
                    step.column
                );
                report.applied.push(step.name.to_string());
            }
            Ok(false) => {
                tracing::debug!("Migration '{}' already applied", step.name);
                report.skipped.push(step.name.to_string());
            }
            Err(e) => {
                tracing::error!("{}", e);
                report.failed.push(FailedStep {
                    name: step.name.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    report
}

/// Add the column if missing. `Ok(false)` when it was already there.
fn apply_step(conn: &Connection, step: &ColumnMigration) -> Result<bool, StoreError> {
    let step_err = |source| StoreError::MigrationStep {
        step: step.name.to_string(),
        source,
    };

    if schema::table_has_column(conn, step.table, step.column).map_err(step_err)? {
        return Ok(false);
    }

    conn.execute_batch(&step.alter_sql()).map_err(step_err)?;
    Ok(true)
}
