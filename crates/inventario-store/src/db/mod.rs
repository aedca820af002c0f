//! Database module for Inventario
//! Single SQLite file, rollback journal, foreign keys enforced

pub mod executor;
pub mod value;

pub use executor::{ConnectionPhase, StoreGateway};
pub use value::{Row, Value};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::migration::{self, MigrationReport};
use crate::schema;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Result of a write statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResult {
    /// Row id of the inserted row, when the statement inserted one
    pub inserted_id: Option<i64>,
    pub rows_affected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.quick_check_ok && self.foreign_key_violations.is_empty()
    }
}

/// Live connection to the store file
pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    /// Open or create the store file and apply connection pragmas
    pub fn open(path: &Path, config: &StoreConfig) -> Result<Self, StoreError> {
        let open_err = |source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        };

        let conn = Connection::open(path).map_err(open_err)?;

        // Fails with "file is not a database" on garbage input
        conn.execute_batch("SELECT count(*) FROM sqlite_master;")
            .map_err(open_err)?;

        // Enable foreign key enforcement (ledger and purchase references)
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(open_err)?;

        conn.busy_timeout(config.busy_timeout).map_err(open_err)?;

        // Rollback journal keeps the store a single file at rest
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "DELETE", |row| row.get(0))
            .map_err(open_err)?;
        if !mode.eq_ignore_ascii_case("delete") {
            tracing::warn!("journal_mode is {} for {}", mode, path.display());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
        }

        tracing::debug!("Opened database at {}", path.display());

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Provision the schema and run additive migrations
    ///
    /// Schema provisioning errors are fatal; migration step errors are only
    /// reported.
    pub fn initialize(&self) -> Result<MigrationReport, StoreError> {
        schema::ensure_schema(&self.conn)?;
        Ok(migration::migrate(&self.conn))
    }

    /// Run quick-check and foreign-key-check probes
    pub fn check_integrity(&self) -> Result<IntegrityReport, StoreError> {
        let quick_check_message: String =
            self.conn
                .query_row("PRAGMA quick_check", [], |row| row.get(0))?;

        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check")?;
        let foreign_key_violations = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
        })
    }

    /// Get inner connection reference
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a statement and collect every row
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        self.collect_rows(sql, params, None)
    }

    /// Run a statement and return its first row, if any
    pub fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>, StoreError> {
        Ok(self.collect_rows(sql, params, Some(1))?.into_iter().next())
    }

    /// Run a write statement
    ///
    /// `inserted_id` is the rowid of the last row written by an `INSERT` or
    /// `REPLACE` that affected rows. Rowids are per table, so this is decided
    /// from the statement rather than from a change in `last_insert_rowid`.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult, StoreError> {
        let rows_affected = self.conn.execute(sql, params_from_iter(params.iter()))?;
        let inserted_id = (rows_affected > 0 && is_insert_statement(sql))
            .then(|| self.conn.last_insert_rowid());

        Ok(ExecuteResult {
            inserted_id,
            rows_affected,
        })
    }

    fn collect_rows(
        &self,
        sql: &str,
        params: &[Value],
        limit: Option<usize>,
    ) -> Result<Vec<Row>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Row::from_sqlite(&names, row)?);
            if limit.is_some_and(|max| out.len() >= max) {
                break;
            }
        }
        Ok(out)
    }

    /// Close the connection, reporting (not hiding) a failed close
    ///
    /// On failure the handle is dropped anyway, which releases the file.
    pub fn close(self) -> Result<(), StoreError> {
        let path = self.path;
        self.conn.close().map_err(|(conn, err)| {
            drop(conn);
            tracing::debug!("Close of {} reported: {}", path.display(), err);
            StoreError::Statement(err)
        })
    }
}

/// Leading keyword is `INSERT` or `REPLACE`, ignoring comments
fn is_insert_statement(sql: &str) -> bool {
    let mut rest = sql.trim_start();
    loop {
        if let Some(line) = rest.strip_prefix("--") {
            rest = line.split_once('\n').map_or("", |(_, tail)| tail).trim_start();
        } else if let Some(block) = rest.strip_prefix("/*") {
            rest = block.split_once("*/").map_or("", |(_, tail)| tail).trim_start();
        } else {
            break;
        }
    }

    let keyword: String = rest
        .chars()
        .take_while(char::is_ascii_alphabetic)
        .collect();
    keyword.eq_ignore_ascii_case("insert") || keyword.eq_ignore_ascii_case("replace")
}

/// Open a candidate store file read-only and check it is usable
///
/// Used before a restore so an unreadable file never replaces the live one.
pub(crate) fn verify_store_file(path: &Path) -> Result<(), StoreError> {
    let invalid = |reason: String| StoreError::InvalidBackup {
        path: path.to_path_buf(),
        reason,
    };

    let metadata = std::fs::metadata(path).map_err(|e| StoreError::file("stat", path, e))?;
    if !metadata.is_file() {
        return Err(invalid("not a regular file".into()));
    }

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| invalid(e.to_string()))?;

    let check: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|e| invalid(e.to_string()))?;
    if check != "ok" {
        return Err(invalid(format!("quick_check reported: {check}")));
    }

    if !schema::table_exists(&conn, "productos").map_err(|e| invalid(e.to_string()))? {
        return Err(invalid("missing productos table".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn create_test_db() -> Result<(Database, tempfile::TempDir), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let db_path = dir.path().join("test.db");
        let db = Database::open(&db_path, &StoreConfig::new(&db_path))?;
        db.initialize()?;
        Ok((db, dir))
    }

    #[test]
    fn test_database_creation() -> TestResult {
        let (db, _dir) = create_test_db()?;
        assert!(db.check_integrity()?.is_clean());
        Ok(())
    }

    #[test]
    fn test_foreign_keys_enabled() -> TestResult {
        let (db, _dir) = create_test_db()?;
        let enabled: i64 = db
            .conn()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        assert_eq!(enabled, 1);
        Ok(())
    }

    #[test]
    fn test_execute_reports_inserted_id() -> TestResult {
        let (db, _dir) = create_test_db()?;
        let result = db.execute(
            "INSERT INTO productos (codigo_interno, nombre, costo_unitario) VALUES (?, ?, ?)",
            &[Value::from("ARZ-1"), Value::from("Arroz 1kg"), Value::Real(3.2)],
        )?;
        assert_eq!(result.rows_affected, 1);
        assert!(result.inserted_id.is_some());

        let update = db.execute(
            "UPDATE productos SET precio_venta = ? WHERE codigo_interno = ?",
            &[Value::Real(4.5), Value::from("ARZ-1")],
        )?;
        assert_eq!(update.rows_affected, 1);
        assert_eq!(update.inserted_id, None);
        Ok(())
    }

    #[test]
    fn test_inserted_id_is_per_table() -> TestResult {
        let (db, _dir) = create_test_db()?;
        let product = db.execute(
            "INSERT INTO productos (codigo_interno, nombre) VALUES ('SAL-1', 'Sal')",
            &[],
        )?;
        assert_eq!(product.inserted_id, Some(1));

        // Same rowid as the previous insert, different table
        let category = db.execute(
            "INSERT INTO categorias (nombre) VALUES ('Abarrotes')",
            &[],
        )?;
        assert_eq!(category.inserted_id, Some(1));

        let ignored = db.execute(
            "INSERT OR IGNORE INTO productos (codigo_interno, nombre) VALUES ('SAL-1', 'Sal')",
            &[],
        )?;
        assert_eq!(ignored.rows_affected, 0);
        assert_eq!(ignored.inserted_id, None);
        Ok(())
    }

    #[test]
    fn test_insert_keyword_detection() {
        assert!(is_insert_statement("insert into productos (nombre) values ('x')"));
        assert!(is_insert_statement("  -- alta\n  INSERT INTO categorias (nombre) VALUES ('x')"));
        assert!(is_insert_statement("/* carga */ REPLACE INTO configuracion (clave) VALUES ('x')"));
        assert!(!is_insert_statement("UPDATE productos SET nombre = 'insert'"));
        assert!(!is_insert_statement("DELETE FROM categorias"));
        assert!(!is_insert_statement(""));
    }

    #[test]
    fn test_query_one_absent() -> TestResult {
        let (db, _dir) = create_test_db()?;
        let row = db.query_one("SELECT id FROM productos WHERE id = ?", &[Value::Integer(99)])?;
        assert!(row.is_none());
        Ok(())
    }

    #[test]
    fn test_malformed_sql_is_statement_error() -> TestResult {
        let (db, _dir) = create_test_db()?;
        let err = db.query("SELEC nombre FROM productos", &[]);
        assert!(matches!(err, Err(StoreError::Statement(_))));
        Ok(())
    }

    #[test]
    fn test_open_rejects_garbage_file() -> TestResult {
        let dir = tempdir()?;
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, b"this is definitely not a sqlite database file at all....")?;
        let result = Database::open(&path, &StoreConfig::new(&path));
        assert!(matches!(result, Err(StoreError::Open { .. })));
        Ok(())
    }

    #[test]
    fn test_verify_store_file_rejects_empty_schema() -> TestResult {
        let dir = tempdir()?;
        let path = dir.path().join("empty.db");
        Connection::open(&path)?.execute_batch("CREATE TABLE otra (id INTEGER);")?;
        let result = verify_store_file(&path);
        assert!(matches!(result, Err(StoreError::InvalidBackup { .. })));
        Ok(())
    }

    #[test]
    fn test_close_releases_connection() -> TestResult {
        let (db, dir) = create_test_db()?;
        db.close()?;
        let path = dir.path().join("test.db");
        let reopened = Database::open(&path, &StoreConfig::new(&path))?;
        assert!(reopened.check_integrity()?.quick_check_ok);
        Ok(())
    }
}
