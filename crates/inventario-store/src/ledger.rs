//! Movement ledger and derived inventory
//!
//! `movimientos_inventario` is append-only: stock is never stored, it is
//! derived on read by `vista_inventario`. Inbound and outbound quantities are
//! positive with the sign implied by the kind; adjustments carry a signed,
//! non-zero delta. Every write snapshots stock before and after from the view.

use crate::db::StoreGateway;
use crate::error::StoreError;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovementKind {
    #[serde(rename = "entrada")]
    Inbound,
    #[serde(rename = "salida")]
    Outbound,
    #[serde(rename = "ajuste")]
    Adjustment,
}

impl MovementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "entrada",
            Self::Outbound => "salida",
            Self::Adjustment => "ajuste",
        }
    }

    /// Effect of a stored quantity on stock
    pub fn signed(self, quantity: f64) -> f64 {
        match self {
            Self::Outbound => -quantity,
            Self::Inbound | Self::Adjustment => quantity,
        }
    }

    fn validate(self, quantity: f64) -> Result<(), StoreError> {
        if !quantity.is_finite() {
            return Err(StoreError::InvalidInput(format!(
                "quantity must be a finite number, got {quantity}"
            )));
        }
        match self {
            Self::Inbound | Self::Outbound if quantity <= 0.0 => Err(StoreError::InvalidInput(
                format!("{} quantity must be positive, got {quantity}", self.as_str()),
            )),
            Self::Adjustment if quantity == 0.0 => Err(StoreError::InvalidInput(
                "ajuste quantity must be non-zero".into(),
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for MovementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MovementKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "entrada" => Ok(Self::Inbound),
            "salida" => Ok(Self::Outbound),
            "ajuste" => Ok(Self::Adjustment),
            other => Err(StoreError::InvalidInput(format!(
                "unknown movement kind '{other}' (expected entrada, salida or ajuste)"
            ))),
        }
    }
}

impl ToSql for MovementKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(ValueRef::Text(self.as_str().as_bytes())))
    }
}

impl FromSql for MovementKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|_| FromSqlError::InvalidType)
    }
}

/// A movement to append
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMovement {
    pub product_id: i64,
    pub kind: MovementKind,
    pub quantity: f64,
    #[serde(default)]
    pub unit_cost: Option<f64>,
    #[serde(default)]
    pub observations: Option<String>,
    /// Source document, e.g. `compra:12`
    #[serde(default)]
    pub reference: Option<String>,
}

impl NewMovement {
    pub fn new(product_id: i64, kind: MovementKind, quantity: f64) -> Self {
        Self {
            product_id,
            kind,
            quantity,
            unit_cost: None,
            observations: None,
            reference: None,
        }
    }

    pub fn with_unit_cost(mut self, unit_cost: f64) -> Self {
        self.unit_cost = Some(unit_cost);
        self
    }

    pub fn with_observations(mut self, observations: impl Into<String>) -> Self {
        self.observations = Some(observations.into());
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// A stored ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: i64,
    pub producto_id: i64,
    pub tipo_movimiento: MovementKind,
    pub cantidad: f64,
    pub costo_unitario: Option<f64>,
    pub stock_anterior: Option<f64>,
    pub stock_nuevo: Option<f64>,
    pub observaciones: Option<String>,
    pub referencia: Option<String>,
    pub fecha_movimiento: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockLevel {
    pub producto_id: i64,
    pub stock_actual: f64,
    /// Timestamp of the most recent movement, absent when there are none
    pub ultimo_movimiento: Option<String>,
    pub tipo_ultimo_movimiento: Option<MovementKind>,
}

/// One row of the inventory projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub producto_id: i64,
    pub codigo_interno: Option<String>,
    pub codigo_barras: Option<String>,
    pub nombre: String,
    pub categoria_id: Option<i64>,
    pub stock_minimo: f64,
    pub activo: bool,
    pub stock_actual: f64,
    pub costo_unitario_ultimo: f64,
    pub valor_total: f64,
    pub ultimo_movimiento: Option<String>,
    pub tipo_ultimo_movimiento: Option<MovementKind>,
}

/// Purchase header plus its lines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPurchase {
    #[serde(default)]
    pub supplier_id: Option<i64>,
    #[serde(default)]
    pub invoice_number: Option<String>,
    /// Purchase timestamp (`YYYY-MM-DD HH:MM:SS`); now when absent
    #[serde(default)]
    pub purchased_at: Option<String>,
    /// Header-level discount, applied after the line subtotals
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub notes: Option<String>,
    pub lines: Vec<PurchaseLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseLine {
    pub product_id: i64,
    pub quantity: f64,
    pub unit_cost: f64,
    #[serde(default)]
    pub discount: f64,
}

impl PurchaseLine {
    pub fn subtotal(&self) -> f64 {
        self.quantity * self.unit_cost - self.discount
    }
}

const INVENTORY_COLUMNS: &str = "producto_id, codigo_interno, codigo_barras, nombre, \
     categoria_id, stock_minimo, activo, stock_actual, costo_unitario_ultimo, valor_total, \
     ultimo_movimiento, tipo_ultimo_movimiento";

fn inventory_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<InventoryItem> {
    Ok(InventoryItem {
        producto_id: row.get(0)?,
        codigo_interno: row.get(1)?,
        codigo_barras: row.get(2)?,
        nombre: row.get(3)?,
        categoria_id: row.get(4)?,
        stock_minimo: row.get(5)?,
        activo: row.get(6)?,
        stock_actual: row.get(7)?,
        costo_unitario_ultimo: row.get(8)?,
        valor_total: row.get(9)?,
        ultimo_movimiento: row.get(10)?,
        tipo_ultimo_movimiento: row.get(11)?,
    })
}

fn missing_product(product_id: i64) -> StoreError {
    StoreError::Reference(format!("producto {product_id} does not exist"))
}

/// Stock used for snapshots; unknown products read as 0 and are then
/// rejected by the foreign key on insert.
fn stock_or_zero(conn: &Connection, product_id: i64) -> Result<f64, StoreError> {
    let stock: Option<f64> = conn
        .query_row(
            "SELECT stock_actual FROM vista_inventario WHERE producto_id = ?1",
            params![product_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(stock.unwrap_or(0.0))
}

/// Append a movement without opening a transaction of its own
fn insert_movement(conn: &Connection, movement: &NewMovement) -> Result<i64, StoreError> {
    let before = stock_or_zero(conn, movement.product_id)?;
    let after = before + movement.kind.signed(movement.quantity);

    conn.execute(
        "INSERT INTO movimientos_inventario (
             producto_id, tipo_movimiento, cantidad, costo_unitario,
             stock_anterior, stock_nuevo, observaciones, referencia
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            movement.product_id,
            movement.kind,
            movement.quantity,
            movement.unit_cost,
            before,
            after,
            movement.observations,
            movement.reference,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Validate and append one movement. Returns the new row id.
pub fn record_movement(conn: &Connection, movement: &NewMovement) -> Result<i64, StoreError> {
    movement.kind.validate(movement.quantity)?;

    let tx = conn.unchecked_transaction()?;
    let id = insert_movement(&tx, movement)?;
    tx.commit()?;

    tracing::debug!(
        "Recorded {} of {} for producto {} (movement {})",
        movement.kind,
        movement.quantity,
        movement.product_id,
        id
    );
    Ok(id)
}

pub fn current_stock(conn: &Connection, product_id: i64) -> Result<StockLevel, StoreError> {
    conn.query_row(
        "SELECT producto_id, stock_actual, ultimo_movimiento, tipo_ultimo_movimiento
         FROM vista_inventario WHERE producto_id = ?1",
        params![product_id],
        |row| {
            Ok(StockLevel {
                producto_id: row.get(0)?,
                stock_actual: row.get(1)?,
                ultimo_movimiento: row.get(2)?,
                tipo_ultimo_movimiento: row.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| missing_product(product_id))
}

/// Most recent purchase cost, else the product's own cost, else 0
pub fn last_unit_cost(conn: &Connection, product_id: i64) -> Result<f64, StoreError> {
    conn.query_row(
        "SELECT costo_unitario_ultimo FROM vista_inventario WHERE producto_id = ?1",
        params![product_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| missing_product(product_id))
}

/// Inventory projection for every product, by name
pub fn inventory(conn: &Connection) -> Result<Vec<InventoryItem>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {INVENTORY_COLUMNS} FROM vista_inventario ORDER BY nombre, producto_id"
    ))?;
    let items = stmt
        .query_map([], inventory_item)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

/// Active products at or below their reorder threshold, most short first
pub fn low_stock(conn: &Connection) -> Result<Vec<InventoryItem>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {INVENTORY_COLUMNS} FROM vista_inventario
         WHERE activo = 1 AND stock_actual <= stock_minimo
         ORDER BY stock_actual - stock_minimo, nombre"
    ))?;
    let items = stmt
        .query_map([], inventory_item)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

/// Ledger rows for a product, newest first
pub fn movements(
    conn: &Connection,
    product_id: i64,
    limit: usize,
) -> Result<Vec<StockMovement>, StoreError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(
        "SELECT id, producto_id, tipo_movimiento, cantidad, costo_unitario,
                stock_anterior, stock_nuevo, observaciones, referencia, fecha_movimiento
         FROM movimientos_inventario
         WHERE producto_id = ?1
         ORDER BY fecha_movimiento DESC, id DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![product_id, limit], |row| {
            Ok(StockMovement {
                id: row.get(0)?,
                producto_id: row.get(1)?,
                tipo_movimiento: row.get(2)?,
                cantidad: row.get(3)?,
                costo_unitario: row.get(4)?,
                stock_anterior: row.get(5)?,
                stock_nuevo: row.get(6)?,
                observaciones: row.get(7)?,
                referencia: row.get(8)?,
                fecha_movimiento: row.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Write a purchase, its lines and one inbound movement per line
///
/// Everything lands in one transaction. Returns the purchase id.
pub fn record_purchase(conn: &Connection, purchase: &NewPurchase) -> Result<i64, StoreError> {
    if purchase.lines.is_empty() {
        return Err(StoreError::InvalidInput(
            "a purchase needs at least one line".into(),
        ));
    }
    for line in &purchase.lines {
        MovementKind::Inbound.validate(line.quantity)?;
        if !line.unit_cost.is_finite() || line.unit_cost < 0.0 {
            return Err(StoreError::InvalidInput(format!(
                "unit cost must be zero or positive, got {}",
                line.unit_cost
            )));
        }
        if !line.discount.is_finite() || line.discount < 0.0 {
            return Err(StoreError::InvalidInput(format!(
                "discount must be zero or positive, got {}",
                line.discount
            )));
        }
    }

    let tx = conn.unchecked_transaction()?;

    tx.execute(
        "INSERT INTO compras (proveedor_id, numero_factura, fecha_compra, descuento, observaciones)
         VALUES (?1, ?2, COALESCE(?3, CURRENT_TIMESTAMP), ?4, ?5)",
        params![
            purchase.supplier_id,
            purchase.invoice_number,
            purchase.purchased_at,
            purchase.discount,
            purchase.notes,
        ],
    )?;
    let purchase_id = tx.last_insert_rowid();
    let reference = format!("compra:{purchase_id}");

    let mut subtotal = 0.0;
    for line in &purchase.lines {
        let line_subtotal = line.subtotal();
        tx.execute(
            "INSERT INTO detalle_compras
                 (compra_id, producto_id, cantidad, costo_unitario, descuento, subtotal)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                purchase_id,
                line.product_id,
                line.quantity,
                line.unit_cost,
                line.discount,
                line_subtotal,
            ],
        )?;

        let movement = NewMovement::new(line.product_id, MovementKind::Inbound, line.quantity)
            .with_unit_cost(line.unit_cost)
            .with_reference(reference.clone());
        insert_movement(&tx, &movement)?;

        subtotal += line_subtotal;
    }

    tx.execute(
        "UPDATE compras SET subtotal = ?1, total = ?1 - descuento WHERE id = ?2",
        params![subtotal, purchase_id],
    )?;
    tx.commit()?;

    tracing::info!(
        "Recorded compra {} with {} lines",
        purchase_id,
        purchase.lines.len()
    );
    Ok(purchase_id)
}

impl StoreGateway {
    pub async fn record_movement(&self, movement: NewMovement) -> Result<i64, StoreError> {
        self.run(move |db| record_movement(db.conn(), &movement))
            .await
    }

    pub async fn current_stock(&self, product_id: i64) -> Result<StockLevel, StoreError> {
        self.run(move |db| current_stock(db.conn(), product_id))
            .await
    }

    pub async fn last_unit_cost(&self, product_id: i64) -> Result<f64, StoreError> {
        self.run(move |db| last_unit_cost(db.conn(), product_id))
            .await
    }

    pub async fn inventory(&self) -> Result<Vec<InventoryItem>, StoreError> {
        self.run(|db| inventory(db.conn())).await
    }

    pub async fn low_stock(&self) -> Result<Vec<InventoryItem>, StoreError> {
        self.run(|db| low_stock(db.conn())).await
    }

    pub async fn movements(
        &self,
        product_id: i64,
        limit: usize,
    ) -> Result<Vec<StockMovement>, StoreError> {
        self.run(move |db| movements(db.conn(), product_id, limit))
            .await
    }

    pub async fn record_purchase(&self, purchase: NewPurchase) -> Result<i64, StoreError> {
        self.run(move |db| record_purchase(db.conn(), &purchase))
            .await
    }
}
