//! Schema manager
//!
//! Creates every table, index and trigger if absent, seeds configuration
//! defaults without clobbering existing values, and rebuilds the inventory
//! projection view on every run. Safe to call on every start.

use crate::db::StoreGateway;
use crate::error::StoreError;
use crate::settings;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// Name of the derived inventory projection
pub const INVENTORY_VIEW: &str = "vista_inventario";

const SCHEMA_SQL: &str = r#"
-- Reference data
CREATE TABLE IF NOT EXISTS categorias (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    nombre TEXT NOT NULL UNIQUE,
    descripcion TEXT,
    activo INTEGER NOT NULL DEFAULT 1,
    fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS tipos_unidad (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    nombre TEXT NOT NULL UNIQUE,
    abreviatura TEXT,
    permite_decimales INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS proveedores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    nombre TEXT NOT NULL,
    contacto TEXT,
    telefono TEXT,
    email TEXT,
    direccion TEXT,
    activo INTEGER NOT NULL DEFAULT 1,
    fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS clientes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    nombre TEXT NOT NULL,
    documento TEXT,
    telefono TEXT,
    email TEXT,
    direccion TEXT,
    activo INTEGER NOT NULL DEFAULT 1,
    fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Products (codigo_interno unique when present; NULLs may repeat)
CREATE TABLE IF NOT EXISTS productos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    codigo_barras TEXT,
    codigo_interno TEXT UNIQUE,
    nombre TEXT NOT NULL,
    descripcion TEXT,
    costo_unitario REAL NOT NULL DEFAULT 0,
    precio_venta REAL NOT NULL DEFAULT 0,
    stock_minimo REAL NOT NULL DEFAULT 0,
    categoria_id INTEGER REFERENCES categorias(id),
    tipo_unidad_id INTEGER REFERENCES tipos_unidad(id),
    activo INTEGER NOT NULL DEFAULT 1,
    fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    fecha_modificacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_productos_codigo_barras ON productos(codigo_barras);
CREATE INDEX IF NOT EXISTS idx_productos_nombre ON productos(nombre);

-- Stock ledger (append-only)
CREATE TABLE IF NOT EXISTS movimientos_inventario (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    producto_id INTEGER NOT NULL REFERENCES productos(id),
    tipo_movimiento TEXT NOT NULL CHECK (tipo_movimiento IN ('entrada', 'salida', 'ajuste')),
    cantidad REAL NOT NULL CHECK (
        cantidad > 0 OR (tipo_movimiento = 'ajuste' AND cantidad <> 0)
    ),
    costo_unitario REAL,
    stock_anterior REAL,
    stock_nuevo REAL,
    observaciones TEXT,
    fecha_movimiento TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_movimientos_producto
    ON movimientos_inventario(producto_id, fecha_movimiento DESC, id DESC);

CREATE TRIGGER IF NOT EXISTS movimientos_inventario_no_update
BEFORE UPDATE ON movimientos_inventario
BEGIN
    SELECT RAISE(ABORT, 'movimientos_inventario is append-only');
END;

CREATE TRIGGER IF NOT EXISTS movimientos_inventario_no_delete
BEFORE DELETE ON movimientos_inventario
BEGIN
    SELECT RAISE(ABORT, 'movimientos_inventario is append-only');
END;

-- Purchases
CREATE TABLE IF NOT EXISTS compras (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    proveedor_id INTEGER REFERENCES proveedores(id),
    numero_factura TEXT,
    fecha_compra TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    subtotal REAL NOT NULL DEFAULT 0,
    descuento REAL NOT NULL DEFAULT 0,
    total REAL NOT NULL DEFAULT 0,
    observaciones TEXT,
    fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_compras_fecha ON compras(fecha_compra DESC);

CREATE TABLE IF NOT EXISTS detalle_compras (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    compra_id INTEGER NOT NULL REFERENCES compras(id) ON DELETE CASCADE,
    producto_id INTEGER NOT NULL REFERENCES productos(id),
    cantidad REAL NOT NULL CHECK (cantidad > 0),
    costo_unitario REAL NOT NULL,
    descuento REAL NOT NULL DEFAULT 0,
    subtotal REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_detalle_compras_producto ON detalle_compras(producto_id);

-- Sales
CREATE TABLE IF NOT EXISTS ventas (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cliente_id INTEGER REFERENCES clientes(id),
    numero_venta TEXT,
    fecha_venta TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    subtotal REAL NOT NULL DEFAULT 0,
    descuento REAL NOT NULL DEFAULT 0,
    impuesto REAL NOT NULL DEFAULT 0,
    total REAL NOT NULL DEFAULT 0,
    estado TEXT NOT NULL DEFAULT 'completada',
    observaciones TEXT
);
CREATE INDEX IF NOT EXISTS idx_ventas_fecha ON ventas(fecha_venta DESC);

CREATE TABLE IF NOT EXISTS detalle_ventas (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    venta_id INTEGER NOT NULL REFERENCES ventas(id) ON DELETE CASCADE,
    producto_id INTEGER NOT NULL REFERENCES productos(id),
    cantidad REAL NOT NULL CHECK (cantidad > 0),
    precio_unitario REAL NOT NULL,
    descuento REAL NOT NULL DEFAULT 0,
    subtotal REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_detalle_ventas_producto ON detalle_ventas(producto_id);

-- Settings
CREATE TABLE IF NOT EXISTS configuracion (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    clave TEXT NOT NULL UNIQUE,
    valor TEXT,
    descripcion TEXT,
    fecha_modificacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Backup/restore audit trail
CREATE TABLE IF NOT EXISTS backups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ruta_archivo TEXT NOT NULL,
    tamano_bytes INTEGER,
    estado TEXT NOT NULL,
    tipo TEXT NOT NULL CHECK (tipo IN ('manual', 'automatico')),
    operacion TEXT NOT NULL CHECK (operacion IN ('backup', 'restore')),
    notas TEXT,
    fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TRIGGER IF NOT EXISTS backups_no_update
BEFORE UPDATE ON backups
BEGIN
    SELECT RAISE(ABORT, 'backups is an audit trail');
END;

CREATE TRIGGER IF NOT EXISTS backups_no_delete
BEFORE DELETE ON backups
BEGIN
    SELECT RAISE(ABORT, 'backups is an audit trail');
END;
"#;

/// The one place stock, last cost and valuation are derived.
///
/// Outbound movements subtract, inbound add, adjustments carry their own
/// sign. "Most recent" orders by timestamp then row id, both descending.
const INVENTORY_VIEW_SQL: &str = r#"
DROP VIEW IF EXISTS vista_inventario;
CREATE VIEW vista_inventario AS
SELECT
    base.*,
    base.stock_actual * base.costo_unitario_ultimo AS valor_total
FROM (
    SELECT
        p.id AS producto_id,
        p.codigo_interno,
        p.codigo_barras,
        p.nombre,
        p.categoria_id,
        p.stock_minimo,
        p.activo,
        COALESCE((
            SELECT SUM(CASE m.tipo_movimiento
                           WHEN 'salida' THEN -m.cantidad
                           ELSE m.cantidad
                       END)
            FROM movimientos_inventario m
            WHERE m.producto_id = p.id
        ), 0) AS stock_actual,
        COALESCE((
            SELECT dc.costo_unitario
            FROM detalle_compras dc
            JOIN compras c ON c.id = dc.compra_id
            WHERE dc.producto_id = p.id
            ORDER BY c.fecha_compra DESC, dc.id DESC
            LIMIT 1
        ), p.costo_unitario, 0) AS costo_unitario_ultimo,
        (
            SELECT m.fecha_movimiento
            FROM movimientos_inventario m
            WHERE m.producto_id = p.id
            ORDER BY m.fecha_movimiento DESC, m.id DESC
            LIMIT 1
        ) AS ultimo_movimiento,
        (
            SELECT m.tipo_movimiento
            FROM movimientos_inventario m
            WHERE m.producto_id = p.id
            ORDER BY m.fecha_movimiento DESC, m.id DESC
            LIMIT 1
        ) AS tipo_ultimo_movimiento
    FROM productos p
) AS base;
"#;

/// A table, view, index or trigger present in the store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaObject {
    pub kind: String,
    pub name: String,
}

/// Create missing structure, seed defaults and rebuild the projection view
pub fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(SCHEMA_SQL)?;
    let seeded = settings::seed_defaults(&tx)?;
    tx.execute_batch(INVENTORY_VIEW_SQL)?;

    tx.commit()?;

    if seeded > 0 {
        tracing::info!("Seeded {} configuration defaults", seeded);
    }
    Ok(())
}

/// List schema objects, excluding SQLite internals
pub fn schema_objects(conn: &Connection) -> Result<Vec<SchemaObject>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT type, name FROM sqlite_master
         WHERE name NOT LIKE 'sqlite_%'
         ORDER BY type, name",
    )?;
    let objects = stmt
        .query_map([], |row| {
            Ok(SchemaObject {
                kind: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(objects)
}

pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table],
        |row| row.get(0),
    )
}

/// Whether `table` exists and has a column named `column`
pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let mut rows = stmt.query(params![table])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        if name.eq_ignore_ascii_case(column) {
            return Ok(true);
        }
    }

    Ok(false)
}

impl StoreGateway {
    /// Tables, views, indexes and triggers in the live store
    pub async fn schema_objects(&self) -> Result<Vec<SchemaObject>, StoreError> {
        self.run(|db| schema_objects(db.conn())).await
    }
}
