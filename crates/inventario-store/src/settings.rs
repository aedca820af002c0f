//! Configuration store
//!
//! Key/value settings in the `configuracion` table. Defaults are seeded with
//! insert-if-absent semantics, so values edited by the operator survive every
//! later schema run.

use crate::db::StoreGateway;
use crate::error::StoreError;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Set by the lifecycle manager after each successful backup
pub const LAST_BACKUP_KEY: &str = "ultimo_backup";
pub const AUTO_BACKUP_KEY: &str = "backup_automatico";
pub const BACKUP_FREQUENCY_KEY: &str = "frecuencia_backup_dias";

/// Storage format of timestamps (matches SQLite `CURRENT_TIMESTAMP`, UTC)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const DEFAULTS: &[(&str, Option<&str>, &str)] = &[
    ("nombre_negocio", Some("Mi Negocio"), "Nombre del negocio"),
    ("moneda", Some("USD"), "Moneda utilizada"),
    ("impuesto_porcentaje", Some("18"), "Porcentaje de impuesto"),
    (
        "stock_minimo_default",
        Some("5"),
        "Stock minimo por defecto para productos nuevos",
    ),
    (LAST_BACKUP_KEY, None, "Fecha del ultimo backup"),
    (AUTO_BACKUP_KEY, Some("false"), "Backup automatico habilitado"),
    (BACKUP_FREQUENCY_KEY, Some("7"), "Frecuencia de backup en dias"),
    ("directorio_backups", None, "Directorio para backups automaticos"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub clave: String,
    pub valor: Option<String>,
    pub descripcion: Option<String>,
    pub fecha_modificacion: String,
}

/// Current UTC time in storage format
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored timestamp; `None` for empty or unparseable values
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Insert missing defaults. Returns how many rows were added.
pub(crate) fn seed_defaults(conn: &Connection) -> Result<usize, StoreError> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO configuracion (clave, valor, descripcion) VALUES (?1, ?2, ?3)",
    )?;

    let mut inserted = 0;
    for (key, value, description) in DEFAULTS {
        inserted += stmt.execute(params![key, value, description])?;
    }
    Ok(inserted)
}

/// Value of `key`. Missing key and NULL value both read as `None`.
pub fn get(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    let value: Option<Option<String>> = conn
        .query_row(
            "SELECT valor FROM configuracion WHERE clave = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.flatten())
}

/// Insert or update `key`, stamping the modification time
pub fn set(conn: &Connection, key: &str, value: Option<&str>) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO configuracion (clave, valor) VALUES (?1, ?2)
         ON CONFLICT(clave) DO UPDATE SET
             valor = excluded.valor,
             fecha_modificacion = CURRENT_TIMESTAMP",
        params![key, value],
    )?;
    Ok(())
}

pub fn list(conn: &Connection) -> Result<Vec<ConfigEntry>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT clave, valor, descripcion, fecha_modificacion
         FROM configuracion ORDER BY clave",
    )?;
    let entries = stmt
        .query_map([], |row| {
            Ok(ConfigEntry {
                clave: row.get(0)?,
                valor: row.get(1)?,
                descripcion: row.get(2)?,
                fecha_modificacion: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Whether an automatic backup should run at `now`
///
/// False when automatic backups are disabled. True when no backup was ever
/// recorded or the last one is at least `frecuencia_backup_dias` old. A
/// frequency that does not parse as a positive integer falls back to 7 days.
pub fn backup_due(conn: &Connection, now: DateTime<Utc>) -> Result<bool, StoreError> {
    let enabled = get(conn, AUTO_BACKUP_KEY)?
        .is_some_and(|v| matches!(v.trim(), "true" | "1" | "si" | "sí"));
    if !enabled {
        return Ok(false);
    }

    let days = get(conn, BACKUP_FREQUENCY_KEY)?
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|d| *d > 0)
        .unwrap_or(7);

    let last = get(conn, LAST_BACKUP_KEY)?.and_then(|v| parse_timestamp(&v));
    Ok(match last {
        Some(last) => now - last >= Duration::days(days),
        None => true,
    })
}

impl StoreGateway {
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.run(move |db| get(db.conn(), &key)).await
    }

    pub async fn set_setting(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.map(str::to_string);
        self.run(move |db| set(db.conn(), &key, value.as_deref()))
            .await
    }

    pub async fn list_settings(&self) -> Result<Vec<ConfigEntry>, StoreError> {
        self.run(|db| list(db.conn())).await
    }

    /// Whether an automatic backup is due at `now`
    pub async fn backup_due(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.run(move |db| backup_due(db.conn(), now)).await
    }
}
