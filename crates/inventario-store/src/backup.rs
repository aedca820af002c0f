//! Backup and restore lifecycle
//!
//! Both operations run as one exclusive job on the gateway worker:
//!
//! 1. `Closing`: the live connection is closed. A failed close is logged and
//!    noted on the audit record, never fatal.
//! 2. `FileOp`: the file is copied through a `.partial` staging file and
//!    renamed into place, so a half-written copy is never visible.
//! 3. Reopen: always attempted, re-running the schema manager. A copy error
//!    is returned only after the store is back.
//! 4. Audit: one `backups` row per completed operation. Failing to write it
//!    is logged only.
//!
//! Requests that arrive meanwhile wait in the gateway queue.
//!
//! Restore additionally checks the source before touching anything, keeps a
//! safety copy of the live file that is put back if the restored file cannot
//! be opened, and carries audit rows from the live store into the restored
//! one so the trail survives.

use crate::db::executor::Slot;
use crate::db::{self, ConnectionPhase, StoreGateway};
use crate::error::StoreError;
use crate::migration::MigrationReport;
use crate::settings;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, ToSql};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Audit state written for every finished operation
pub const STATUS_COMPLETED: &str = "completado";

const SAFETY_COPY_EXTENSION: &str = "db.pre-restore";
const STAGING_SUFFIX: &str = ".partial";
const SIDECAR_SUFFIXES: &[&str] = &["-journal", "-wal", "-shm"];

/// Who asked for the backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupTrigger {
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "automatico")]
    Automatic,
}

impl BackupTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Automatic => "automatico",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupOperation {
    Backup,
    Restore,
}

impl BackupOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }
}

impl ToSql for BackupTrigger {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(ValueRef::Text(self.as_str().as_bytes())))
    }
}

impl FromSql for BackupTrigger {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "manual" => Ok(Self::Manual),
            "automatico" => Ok(Self::Automatic),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

impl ToSql for BackupOperation {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(ValueRef::Text(self.as_str().as_bytes())))
    }
}

impl FromSql for BackupOperation {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "backup" => Ok(Self::Backup),
            "restore" => Ok(Self::Restore),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// A row of the `backups` audit table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: i64,
    pub ruta_archivo: String,
    pub tamano_bytes: Option<i64>,
    pub estado: String,
    pub tipo: BackupTrigger,
    pub operacion: BackupOperation,
    pub notas: Option<String>,
    pub fecha_creacion: String,
}

/// What a finished backup or restore did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupOutcome {
    pub operation: BackupOperation,
    pub trigger: BackupTrigger,
    /// Backup destination, or restore source
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Whether the audit row was written
    pub recorded: bool,
    /// Non-fatal problems met along the way (failed close, audit insert)
    pub notes: Vec<String>,
    /// Schema manager result from the reopen
    pub migrations: MigrationReport,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Copy `from` to `to` via a staging file in the destination directory
///
/// The destination directory must already exist. Returns the copied size.
fn copy_atomic(from: &Path, to: &Path) -> Result<u64, StoreError> {
    fs::metadata(from).map_err(|e| StoreError::file("stat", from, e))?;

    let staging = with_suffix(to, STAGING_SUFFIX);
    let copied = fs::copy(from, &staging)
        .map_err(|e| StoreError::file("copy", to, e))
        .and_then(|size| {
            fs::File::open(&staging)
                .and_then(|f| f.sync_all())
                .map_err(|e| StoreError::file("sync", &staging, e))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&staging, fs::Permissions::from_mode(0o600));
            }

            fs::rename(&staging, to).map_err(|e| StoreError::file("rename", to, e))?;
            Ok(size)
        });

    if copied.is_err() && staging.exists() {
        if let Err(e) = fs::remove_file(&staging) {
            tracing::warn!("Failed to remove staging file {}: {}", staging.display(), e);
        }
    }
    copied
}

/// Remove journal files left next to the live file
fn remove_sidecars(live: &Path) {
    for suffix in SIDECAR_SUFFIXES {
        let sidecar = with_suffix(live, suffix);
        if sidecar.exists() {
            match fs::remove_file(&sidecar) {
                Ok(()) => tracing::debug!("Removed stale {}", sidecar.display()),
                Err(e) => tracing::warn!("Failed to remove {}: {}", sidecar.display(), e),
            }
        }
    }
}

/// Close the connection, reporting a failed close as a note
fn close_for_file_op(slot: &Slot, db: db::Database, notes: &mut Vec<String>) {
    slot.set_phase(ConnectionPhase::Closing);
    if let Err(e) = db.close() {
        tracing::warn!("Close before file operation failed, continuing: {}", e);
        notes.push(format!("close failed: {e}"));
    }
    slot.set_phase(ConnectionPhase::FileOp);
}

#[allow(clippy::cast_possible_wrap)]
fn insert_record(
    conn: &Connection,
    path: &Path,
    size_bytes: u64,
    trigger: BackupTrigger,
    operation: BackupOperation,
    notes: &[String],
) -> Result<i64, StoreError> {
    let notas = (!notes.is_empty()).then(|| notes.join("; "));
    conn.execute(
        "INSERT INTO backups (ruta_archivo, tamano_bytes, estado, tipo, operacion, notas)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            path.display().to_string(),
            size_bytes as i64,
            STATUS_COMPLETED,
            trigger,
            operation,
            notas,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn backup_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackupRecord> {
    Ok(BackupRecord {
        id: row.get(0)?,
        ruta_archivo: row.get(1)?,
        tamano_bytes: row.get(2)?,
        estado: row.get(3)?,
        tipo: row.get(4)?,
        operacion: row.get(5)?,
        notas: row.get(6)?,
        fecha_creacion: row.get(7)?,
    })
}

/// Audit rows, newest first
pub fn history(conn: &Connection, limit: usize) -> Result<Vec<BackupRecord>, StoreError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(
        "SELECT id, ruta_archivo, tamano_bytes, estado, tipo, operacion, notas, fecha_creacion
         FROM backups
         ORDER BY fecha_creacion DESC, id DESC
         LIMIT ?1",
    )?;
    let records = stmt
        .query_map(params![limit], backup_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Re-insert audit rows the restored file does not have. Returns how many.
fn carry_forward(conn: &Connection, records: &[BackupRecord]) -> Result<usize, StoreError> {
    let tx = conn.unchecked_transaction()?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO backups
                 (ruta_archivo, tamano_bytes, estado, tipo, operacion, notas, fecha_creacion)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
             WHERE NOT EXISTS (
                 SELECT 1 FROM backups
                 WHERE ruta_archivo = ?1 AND operacion = ?5
                   AND fecha_creacion = ?7 AND tamano_bytes IS ?2
             )",
        )?;
        // Oldest first so ids keep chronological order
        for record in records.iter().rev() {
            inserted += stmt.execute(params![
                record.ruta_archivo,
                record.tamano_bytes,
                record.estado,
                record.tipo,
                record.operacion,
                record.notas,
                record.fecha_creacion,
            ])?;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Copy the live file to `destination` and record it
///
/// `ultimo_backup` is stamped with `clock` when given, else the wall clock.
pub(crate) fn run_backup(
    slot: &mut Slot,
    destination: &Path,
    trigger: BackupTrigger,
    clock: Option<DateTime<Utc>>,
) -> Result<BackupOutcome, StoreError> {
    let live = slot.config().db_path.clone();
    if same_file(&live, destination) {
        return Err(StoreError::InvalidInput(
            "backup destination is the live database file".into(),
        ));
    }

    let db = slot.take()?;
    let mut notes = Vec::new();

    tracing::info!(
        "Starting {} backup of {} to {}",
        trigger.as_str(),
        live.display(),
        destination.display()
    );
    close_for_file_op(slot, db, &mut notes);

    let copied = copy_atomic(&live, destination);
    if let Err(e) = &copied {
        tracing::error!("Backup copy failed: {}", e);
    }

    let migrations = match slot.open() {
        Ok(report) => report,
        Err(reopen) => {
            // Store is down either way; a copy error is the more specific cause
            return Err(match copied {
                Err(copy) => {
                    tracing::error!("Reopen after failed backup also failed: {}", reopen);
                    copy
                }
                Ok(_) => reopen,
            });
        }
    };
    let size_bytes = copied?;

    let conn = slot.database()?.conn();
    let recorded =
        match insert_record(conn, destination, size_bytes, trigger, BackupOperation::Backup, &notes) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Failed to record backup in audit table: {}", e);
                notes.push(format!("audit insert failed: {e}"));
                false
            }
        };

    let completed_at = settings::format_timestamp(clock.unwrap_or_else(Utc::now));
    if let Err(e) = settings::set(conn, settings::LAST_BACKUP_KEY, Some(&completed_at)) {
        tracing::warn!("Failed to update {}: {}", settings::LAST_BACKUP_KEY, e);
        notes.push(format!("{} not updated: {e}", settings::LAST_BACKUP_KEY));
    }

    tracing::info!(
        "Backup completed: {} ({} bytes)",
        destination.display(),
        size_bytes
    );

    Ok(BackupOutcome {
        operation: BackupOperation::Backup,
        trigger,
        path: destination.to_path_buf(),
        size_bytes,
        recorded,
        notes,
        migrations,
    })
}

/// Replace the live file with `source` and record it
pub(crate) fn run_restore(slot: &mut Slot, source: &Path) -> Result<BackupOutcome, StoreError> {
    let live = slot.config().db_path.clone();
    if same_file(&live, source) {
        return Err(StoreError::InvalidInput(
            "restore source is the live database file".into(),
        ));
    }

    // Nothing is touched until the source proves usable
    db::verify_store_file(source)?;

    let mut notes = Vec::new();
    let carried = match slot.take() {
        Ok(db) => {
            let records = history(db.conn(), usize::MAX).unwrap_or_else(|e| {
                tracing::warn!("Could not read audit rows to carry forward: {}", e);
                notes.push(format!("audit carry-forward skipped: {e}"));
                Vec::new()
            });
            close_for_file_op(slot, db, &mut notes);
            records
        }
        Err(StoreError::NotInitialized) => {
            tracing::warn!("Restoring without a live connection; audit rows not carried");
            slot.set_phase(ConnectionPhase::FileOp);
            Vec::new()
        }
        Err(e) => return Err(e),
    };

    tracing::info!("Restoring {} from {}", live.display(), source.display());

    let safety = live.with_extension(SAFETY_COPY_EXTENSION);
    let safety_copy = if live.exists() {
        if let Err(e) = copy_atomic(&live, &safety) {
            tracing::error!("Safety copy failed, aborting restore: {}", e);
            if let Err(reopen) = slot.open() {
                tracing::error!("Reopen after failed safety copy also failed: {}", reopen);
            }
            return Err(e);
        }
        Some(safety)
    } else {
        None
    };

    let copied = copy_atomic(source, &live);
    if copied.is_ok() {
        remove_sidecars(&live);
    }

    let (migrations, size_bytes) = match (slot.open(), copied) {
        (Ok(report), Ok(size)) => (report, size),
        (Ok(_), Err(copy)) => {
            tracing::error!("Restore copy failed, live store unchanged: {}", copy);
            discard_safety_copy(safety_copy.as_deref());
            return Err(copy);
        }
        (Err(reopen), copied) => {
            tracing::error!("Restored file could not be opened: {}", reopen);
            if let (Some(safety), Ok(_)) = (safety_copy.as_deref(), &copied) {
                put_back(slot, safety, &live);
            }
            return Err(copied.err().unwrap_or(reopen));
        }
    };

    let conn = slot.database()?.conn();
    match carry_forward(conn, &carried) {
        Ok(0) => {}
        Ok(n) => tracing::info!("Carried {} audit rows into the restored store", n),
        Err(e) => {
            tracing::error!("Failed to carry audit rows forward: {}", e);
            notes.push(format!("audit carry-forward failed: {e}"));
        }
    }

    let recorded = match insert_record(
        conn,
        source,
        size_bytes,
        BackupTrigger::Manual,
        BackupOperation::Restore,
        &notes,
    ) {
        Ok(_) => true,
        Err(e) => {
            tracing::error!("Failed to record restore in audit table: {}", e);
            notes.push(format!("audit insert failed: {e}"));
            false
        }
    };

    discard_safety_copy(safety_copy.as_deref());
    tracing::info!("Restore completed from {}", source.display());

    Ok(BackupOutcome {
        operation: BackupOperation::Restore,
        trigger: BackupTrigger::Manual,
        path: source.to_path_buf(),
        size_bytes,
        recorded,
        notes,
        migrations,
    })
}

/// Put the pre-restore file back and reopen it
fn put_back(slot: &mut Slot, safety: &Path, live: &Path) {
    slot.set_phase(ConnectionPhase::FileOp);
    match copy_atomic(safety, live) {
        Ok(_) => {
            remove_sidecars(live);
            match slot.open() {
                Ok(_) => tracing::warn!("Previous store put back after failed restore"),
                Err(e) => tracing::error!("Previous store could not be reopened: {}", e),
            }
            discard_safety_copy(Some(safety));
        }
        Err(e) => tracing::error!(
            "Could not put back previous store; it remains at {}: {}",
            safety.display(),
            e
        ),
    }
}

fn discard_safety_copy(safety: Option<&Path>) {
    if let Some(path) = safety {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!("Failed to remove safety copy {}: {}", path.display(), e);
        }
    }
}

/// File name used for automatic backups taken at `at`
pub fn automatic_file_name(at: DateTime<Utc>) -> String {
    format!("inventario_backup_{}.db", at.format("%Y%m%d_%H%M%S"))
}

impl StoreGateway {
    /// Copy the live store to `destination`
    ///
    /// The destination directory must exist. The copy is byte-identical to the
    /// live file at the moment of the copy.
    pub async fn backup(
        &self,
        destination: impl Into<PathBuf>,
        trigger: BackupTrigger,
    ) -> Result<BackupOutcome, StoreError> {
        let destination = destination.into();
        self.run_exclusive(move |slot| run_backup(slot, &destination, trigger, None))
            .await
    }

    /// Replace the live store with `source`
    ///
    /// Callers confirm with the operator first and restart afterwards.
    pub async fn restore(&self, source: impl Into<PathBuf>) -> Result<BackupOutcome, StoreError> {
        let source = source.into();
        self.run_exclusive(move |slot| run_restore(slot, &source))
            .await
    }

    pub async fn backup_history(&self, limit: usize) -> Result<Vec<BackupRecord>, StoreError> {
        self.run(move |db| history(db.conn(), limit)).await
    }

    /// Run an automatic backup when the settings say one is due
    ///
    /// Writes into `directorio_backups` when set, else the configured backup
    /// directory, creating it if needed. `None` when nothing was due.
    pub async fn backup_if_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<BackupOutcome>, StoreError> {
        self.run_exclusive(move |slot| {
            let conn = slot.database()?.conn();
            if !settings::backup_due(conn, now)? {
                return Ok(None);
            }

            let dir = settings::get(conn, "directorio_backups")?
                .filter(|d| !d.trim().is_empty())
                .map_or_else(|| slot.config().backup_dir.clone(), PathBuf::from);
            fs::create_dir_all(&dir).map_err(|e| StoreError::file("create_dir", &dir, e))?;

            let destination = dir.join(automatic_file_name(now));
            run_backup(slot, &destination, BackupTrigger::Automatic, Some(now)).map(Some)
        })
        .await
    }
}
