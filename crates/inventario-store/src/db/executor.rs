//! Statement gateway: the one owner of the live connection
//!
//! The connection lives on a dedicated thread. Every request is a job sent
//! over a channel and executed in arrival order, so concurrent callers queue
//! instead of racing, and async callers never hold a lock across an await.
//!
//! Backup and restore run as a single exclusive job on the same thread.
//! Requests issued while that job is closing, copying or reopening the file
//! simply wait in the channel and run after the reopen. `NotInitialized` is
//! returned only when no connection exists at all: before [`StoreGateway::open`]
//! or after a reopen that failed.
//!
//! # Usage
//!
//! ```ignore
//! let gateway = StoreGateway::spawn(StoreConfig::new("inventario.db"));
//! gateway.open().await?;
//!
//! let rows = gateway
//!     .query("SELECT nombre FROM productos WHERE activo = ?", vec![Value::Integer(1)])
//!     .await?;
//! ```

use crate::config::StoreConfig;
use crate::db::{Database, ExecuteResult, Row, Value};
use crate::error::StoreError;
use crate::migration::MigrationReport;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;

/// Connection lifecycle as seen from outside the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// Worker running, connection not opened yet
    Unopened,
    Open,
    /// Lifecycle job is tearing the connection down
    Closing,
    /// Lifecycle job owns the file (copy in progress)
    FileOp,
    /// Reopen failed; statements fail with `NotInitialized` until `open` succeeds
    OpenFailed,
}

type Job = Box<dyn FnOnce(&mut Slot) + Send + 'static>;

/// Worker-side state: the configuration and the connection, if any
pub(crate) struct Slot {
    config: StoreConfig,
    db: Option<Database>,
    phase: Arc<RwLock<ConnectionPhase>>,
}

impl Slot {
    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn database(&self) -> Result<&Database, StoreError> {
        self.db.as_ref().ok_or(StoreError::NotInitialized)
    }

    pub(crate) fn set_phase(&self, phase: ConnectionPhase) {
        *self.phase.write() = phase;
    }

    /// Hand the live connection to the caller, leaving the slot empty
    pub(crate) fn take(&mut self) -> Result<Database, StoreError> {
        self.db.take().ok_or(StoreError::NotInitialized)
    }

    /// Open the store file and run the schema manager
    ///
    /// An already open connection is kept and only re-provisioned.
    pub(crate) fn open(&mut self) -> Result<MigrationReport, StoreError> {
        if let Some(db) = self.db.as_ref() {
            return db.initialize();
        }

        let opened = Database::open(&self.config.db_path, &self.config).and_then(|db| {
            let report = db.initialize()?;
            Ok((db, report))
        });

        match opened {
            Ok((db, report)) => {
                self.db = Some(db);
                self.set_phase(ConnectionPhase::Open);
                tracing::info!("Store open at {}", self.config.db_path.display());
                Ok(report)
            }
            Err(e) => {
                self.set_phase(ConnectionPhase::OpenFailed);
                tracing::error!(
                    "Failed to open store at {}: {}",
                    self.config.db_path.display(),
                    e
                );
                Err(e)
            }
        }
    }
}

/// Async handle to the single store connection
pub struct StoreGateway {
    sender: mpsc::Sender<Job>,
    phase: Arc<RwLock<ConnectionPhase>>,
    db_path: std::path::PathBuf,
    _handle: thread::JoinHandle<()>,
}

impl StoreGateway {
    /// Start the worker thread. The connection is opened by [`Self::open`].
    pub fn spawn(config: StoreConfig) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let phase = Arc::new(RwLock::new(ConnectionPhase::Unopened));
        let db_path = config.db_path.clone();

        let mut slot = Slot {
            config,
            db: None,
            phase: Arc::clone(&phase),
        };

        let handle = thread::spawn(move || {
            while let Ok(job) = receiver.recv() {
                job(&mut slot);
            }
            if let Some(db) = slot.db.take() {
                if let Err(e) = db.close() {
                    tracing::warn!("Store close on shutdown failed: {}", e);
                }
            }
        });

        Self {
            sender,
            phase,
            db_path,
            _handle: handle,
        }
    }

    /// Open the connection and provision the schema
    ///
    /// Must complete before any other traffic. Calling it again on an open
    /// store re-runs the (idempotent) schema manager; calling it after a
    /// failed reopen retries the open.
    pub async fn open(&self) -> Result<MigrationReport, StoreError> {
        self.run_exclusive(Slot::open).await
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.read()
    }

    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }

    /// Run a database operation on the worker thread
    ///
    /// Fails with `NotInitialized` when there is no live connection.
    pub async fn run<F, T>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        self.run_exclusive(move |slot| op(slot.database()?)).await
    }

    /// Run a job with full control of the worker state
    pub(crate) async fn run_exclusive<F, T>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Slot) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();

        let job: Job = Box::new(move |slot| {
            let _ = response_tx.send(op(slot));
        });

        self.sender
            .send(job)
            .map_err(|_| StoreError::ChannelClosed)?;

        response_rx.await.map_err(|_| StoreError::ChannelClosed)?
    }

    /// Run a statement and return every row
    pub async fn query(
        &self,
        sql: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<Vec<Row>, StoreError> {
        let sql = sql.into();
        self.run(move |db| db.query(&sql, &params)).await
    }

    /// Run a write statement
    pub async fn execute(
        &self,
        sql: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<ExecuteResult, StoreError> {
        let sql = sql.into();
        self.run(move |db| db.execute(&sql, &params)).await
    }

    /// Run a statement and return its first row, if any
    pub async fn query_one(
        &self,
        sql: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<Option<Row>, StoreError> {
        let sql = sql.into();
        self.run(move |db| db.query_one(&sql, &params)).await
    }

    pub async fn check_integrity(&self) -> Result<crate::db::IntegrityReport, StoreError> {
        self.run(Database::check_integrity).await
    }

    /// Close the connection and stop the worker
    pub async fn shutdown(self) -> Result<(), StoreError> {
        let result = self
            .run_exclusive(|slot| match slot.db.take() {
                Some(db) => {
                    slot.set_phase(ConnectionPhase::Unopened);
                    db.close()
                }
                None => Ok(()),
            })
            .await;
        drop(self.sender);
        result
    }
}
