use crate::{QueueStore, StorageError};
use mqc_core::project_or_default;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Live messages held by an active claim.
    pub claimed: u64,
    /// Live messages a new claim could capture.
    pub free: u64,
    /// Claims past their ttl that the next create will sweep.
    pub expired_claims: u64,
}

impl QueueStore {
    pub fn create_queue(&self, name: &str, project: Option<&str>) -> Result<(), StorageError> {
        self.create_queue_with_metadata(name, project, &Value::Object(Default::default()))
    }

    pub fn create_queue_with_metadata(
        &self,
        name: &str,
        project: Option<&str>,
        metadata: &Value,
    ) -> Result<(), StorageError> {
        let project = project_or_default(project);
        let metadata_json = serde_json::to_string(metadata)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        let changes = self.conn.execute(
            "
            INSERT OR IGNORE INTO queues (project, name, metadata)
            VALUES (?1, ?2, ?3)
            ",
            params![project, name, metadata_json],
        )?;
        if changes == 0 {
            return Err(StorageError::QueueAlreadyExists {
                queue: name.to_string(),
                project: project.to_string(),
            });
        }

        debug!(event = "queue_created", queue = %name, project = %project);
        Ok(())
    }

    /// Removes the queue with all of its messages and claims. Missing queues are ignored.
    pub fn delete_queue(&self, name: &str, project: Option<&str>) -> Result<(), StorageError> {
        let project = project_or_default(project);
        let changes = self.conn.execute(
            "DELETE FROM queues WHERE project = ?1 AND name = ?2",
            params![project, name],
        )?;
        debug!(event = "queue_deleted", queue = %name, project = %project, removed = changes);
        Ok(())
    }

    pub fn queue_metadata(&self, name: &str, project: Option<&str>) -> Result<Value, StorageError> {
        let project = project_or_default(project);
        let metadata_json: Option<String> = self
            .conn
            .query_row(
                "SELECT metadata FROM queues WHERE project = ?1 AND name = ?2",
                params![project, name],
                |row| row.get(0),
            )
            .optional()?;
        let metadata_json = metadata_json.ok_or_else(|| StorageError::QueueDoesNotExist {
            queue: name.to_string(),
            project: project.to_string(),
        })?;
        serde_json::from_str(&metadata_json)
            .map_err(|err| StorageError::Serialization(err.to_string()))
    }

    pub fn resolve_queue(&self, name: &str, project: Option<&str>) -> Result<i64, StorageError> {
        queue_id(&self.conn, project_or_default(project), name)
    }

    pub fn queue_stats(
        &self,
        name: &str,
        project: Option<&str>,
    ) -> Result<QueueStats, StorageError> {
        let project = project_or_default(project);
        let now = self.clock.now_millis();
        let qid = queue_id(&self.conn, project, name)?;

        let (claimed, free) = self.conn.query_row(
            "
            SELECT
                COALESCE(SUM(CASE WHEN c.id IS NOT NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN c.id IS NULL THEN 1 ELSE 0 END), 0)
            FROM messages AS m
            LEFT JOIN locked AS l ON l.message_id = m.id
            LEFT JOIN claims AS c ON c.id = l.claim_id AND c.ttl * 1000 > ?2 - c.created
            WHERE m.queue_id = ?1
              AND m.ttl * 1000 > ?2 - m.created
            ",
            params![qid, now],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;

        let expired_claims: i64 = self.conn.query_row(
            "
            SELECT COUNT(*) FROM claims
            WHERE queue_id = ?1
              AND ttl * 1000 <= ?2 - created
            ",
            params![qid, now],
            |row| row.get(0),
        )?;

        Ok(QueueStats {
            claimed: claimed as u64,
            free: free as u64,
            expired_claims: expired_claims as u64,
        })
    }
}

pub(crate) fn queue_id(conn: &Connection, project: &str, name: &str) -> Result<i64, StorageError> {
    conn.query_row(
        "SELECT id FROM queues WHERE project = ?1 AND name = ?2",
        params![project, name],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| StorageError::QueueDoesNotExist {
        queue: name.to_string(),
        project: project.to_string(),
    })
}
