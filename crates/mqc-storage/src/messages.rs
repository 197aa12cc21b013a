use crate::queues::queue_id;
use crate::{QueueStore, StorageError};
use mqc_core::claim_contracts::age_seconds;
use mqc_core::{project_or_default, HexMaskCodec, IdCodec, MessageView, NewMessage};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

impl QueueStore {
    /// Appends messages to a queue and returns their encoded ids in order.
    pub fn post_messages(
        &self,
        queue: &str,
        project: Option<&str>,
        messages: &[NewMessage],
    ) -> Result<Vec<String>, StorageError> {
        let project = project_or_default(project);
        let now = self.clock.now_millis();
        let tx = self.conn.unchecked_transaction()?;
        let qid = queue_id(&tx, project, queue)?;

        let mut ids = Vec::with_capacity(messages.len());
        {
            let mut insert = tx.prepare(
                "
                INSERT INTO messages (queue_id, ttl, created, body)
                VALUES (?1, ?2, ?3, ?4)
                ",
            )?;
            for message in messages {
                let body = serde_json::to_string(&message.body)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?;
                insert.execute(params![qid, message.ttl, now, body])?;
                ids.push(self.message_ids.encode(tx.last_insert_rowid()));
            }
        }
        tx.commit()?;

        debug!(event = "messages_posted", queue = %queue, project = %project, count = ids.len());
        Ok(ids)
    }

    pub fn get_message(
        &self,
        queue: &str,
        message_id: &str,
        project: Option<&str>,
    ) -> Result<MessageView, StorageError> {
        let project = project_or_default(project);
        let not_found = || StorageError::MessageDoesNotExist {
            message_id: message_id.to_string(),
            queue: queue.to_string(),
            project: project.to_string(),
        };
        let Ok(mid) = self.message_ids.decode(message_id) else {
            return Err(not_found());
        };
        let now = self.clock.now_millis();

        self.conn
            .query_row(
                "
                SELECT m.id, m.body, m.ttl, m.created
                FROM messages AS m
                JOIN queues AS q ON q.id = m.queue_id
                WHERE m.id = ?1
                  AND q.project = ?2
                  AND q.name = ?3
                  AND m.ttl * 1000 > ?4 - m.created
                ",
                params![mid, project, queue, now],
                |row| message_from_row(row, &self.message_ids, now),
            )
            .optional()?
            .ok_or_else(not_found)
    }

    /// Lists live messages oldest first. Unless `include_claimed` is set,
    /// messages held by an active claim are hidden.
    pub fn list_messages(
        &self,
        queue: &str,
        project: Option<&str>,
        include_claimed: bool,
        limit: usize,
    ) -> Result<Vec<MessageView>, StorageError> {
        let project = project_or_default(project);
        let now = self.clock.now_millis();
        let qid = queue_id(&self.conn, project, queue)?;

        let mut stmt = self.conn.prepare(
            "
            SELECT m.id, m.body, m.ttl, m.created
            FROM messages AS m
            WHERE m.queue_id = ?1
              AND m.ttl * 1000 > ?2 - m.created
              AND (?3 OR NOT EXISTS (
                    SELECT 1 FROM locked AS l
                    JOIN claims AS c ON c.id = l.claim_id
                    WHERE l.message_id = m.id
                      AND c.ttl * 1000 > ?2 - c.created
              ))
            ORDER BY m.id
            LIMIT ?4
            ",
        )?;
        let rows = stmt.query_map(
            params![qid, now, include_claimed, sql_limit(limit)],
            |row| message_from_row(row, &self.message_ids, now),
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Deletes a message and any lock on it. Unknown or malformed ids are ignored.
    pub fn delete_message(
        &self,
        queue: &str,
        message_id: &str,
        project: Option<&str>,
    ) -> Result<(), StorageError> {
        let project = project_or_default(project);
        let Ok(mid) = self.message_ids.decode(message_id) else {
            return Ok(());
        };

        self.conn.execute(
            "
            DELETE FROM messages
            WHERE id = ?1
              AND queue_id = (SELECT id FROM queues WHERE project = ?2 AND name = ?3)
            ",
            params![mid, project, queue],
        )?;
        Ok(())
    }
}

/// Maps `(id, body, ttl, created)` onto a message view as seen at `now`.
pub(crate) fn message_from_row(
    row: &Row<'_>,
    codec: &HexMaskCodec,
    now: i64,
) -> rusqlite::Result<MessageView> {
    let body_json: String = row.get(1)?;
    let body = serde_json::from_str(&body_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let created: i64 = row.get(3)?;

    Ok(MessageView {
        id: codec.encode(row.get(0)?),
        ttl: row.get(2)?,
        age: age_seconds(created, now),
        body,
    })
}

pub(crate) fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
