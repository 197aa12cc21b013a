use mqc_core::{ClaimConfig, Clock, HexMaskCodec, SystemClock};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

mod claims;
mod messages;
mod queues;

pub use claims::{ClaimController, ClaimedMessages};
pub use queues::QueueStats;

pub const QUEUE_SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("queue {queue:?} does not exist in project {project:?}")]
    QueueDoesNotExist { queue: String, project: String },
    #[error("queue {queue:?} already exists in project {project:?}")]
    QueueAlreadyExists { queue: String, project: String },
    #[error("message {message_id} does not exist in queue {queue:?} of project {project:?}")]
    MessageDoesNotExist {
        message_id: String,
        queue: String,
        project: String,
    },
    #[error("claim {claim_id} does not exist in queue {queue:?} of project {project:?}")]
    ClaimDoesNotExist {
        claim_id: String,
        queue: String,
        project: String,
    },
}

impl StorageError {
    pub(crate) fn claim_does_not_exist(claim_id: &str, queue: &str, project: &str) -> Self {
        Self::ClaimDoesNotExist {
            claim_id: claim_id.to_string(),
            queue: queue.to_string(),
            project: project.to_string(),
        }
    }
}

/// SQLite-backed queue storage: queues, messages and the claims over them.
///
/// One store wraps one connection. Concurrent callers each open their own
/// store on the same database file and coordinate through SQLite locking.
pub struct QueueStore {
    conn: Connection,
    clock: Arc<dyn Clock>,
    config: ClaimConfig,
    claim_ids: HexMaskCodec,
    message_ids: HexMaskCodec,
}

impl QueueStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with(path, ClaimConfig::default(), Arc::new(SystemClock))
    }

    pub fn open_with(
        path: impl AsRef<Path>,
        config: ClaimConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, config, clock)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open_in_memory_with(ClaimConfig::default(), Arc::new(SystemClock))
    }

    pub fn open_in_memory_with(
        config: ClaimConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, config, clock)
    }

    fn from_connection(
        conn: Connection,
        config: ClaimConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        apply_pragmas(&conn, &config)?;
        let store = Self {
            conn,
            clock,
            config,
            claim_ids: HexMaskCodec::claims(),
            message_ids: HexMaskCodec::messages(),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn claims(&self) -> ClaimController<'_> {
        ClaimController::new(self)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > QUEUE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: QUEUE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_queue_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            info!(event = "schema_migrated", version = 1);
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_claims.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
            info!(event = "schema_migrated", version = 2);
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table_name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn apply_pragmas(conn: &Connection, config: &ClaimConfig) -> Result<(), StorageError> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    let mode: String = conn.query_row(
        &format!("PRAGMA journal_mode = {}", config.journal_mode.pragma_value()),
        [],
        |row| row.get(0),
    )?;
    debug!(event = "store_opened", journal_mode = %mode, busy_timeout_ms = config.busy_timeout_ms);
    Ok(())
}
