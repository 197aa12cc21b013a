use crate::messages::{message_from_row, sql_limit};
use crate::queues::queue_id;
use crate::{QueueStore, StorageError};
use mqc_core::claim_contracts::age_seconds;
use mqc_core::{project_or_default, ClaimRenewal, ClaimRequest, ClaimView, IdCodec, MessageView};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::debug;

/// Claim operations for one store.
///
/// Create runs in an IMMEDIATE transaction: choosing unlocked messages and
/// inserting their locks must not interleave with another create on the same
/// database. Get, update and delete use deferred transactions; update and
/// delete match the exact claim row and inspect the affected row count.
#[derive(Clone, Copy)]
pub struct ClaimController<'s> {
    store: &'s QueueStore,
}

impl<'s> ClaimController<'s> {
    pub(crate) fn new(store: &'s QueueStore) -> Self {
        Self { store }
    }

    pub fn get(
        &self,
        queue: &str,
        claim_id: &str,
        project: Option<&str>,
    ) -> Result<(ClaimView, ClaimedMessages<'s>), StorageError> {
        let project = project_or_default(project);
        let Ok(cid) = self.store.claim_ids.decode(claim_id) else {
            return Err(StorageError::claim_does_not_exist(claim_id, queue, project));
        };
        let now = self.store.clock.now_millis();

        let tx = Transaction::new_unchecked(&self.store.conn, TransactionBehavior::Deferred)?;
        let row = tx
            .query_row(
                "
                SELECT c.ttl, c.created
                FROM claims AS c
                JOIN queues AS q ON q.id = c.queue_id
                WHERE c.id = ?1
                  AND q.project = ?2
                  AND q.name = ?3
                  AND c.ttl * 1000 > ?4 - c.created
                ",
                params![cid, project, queue, now],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        tx.commit()?;

        let Some((ttl, created)) = row else {
            return Err(StorageError::claim_does_not_exist(claim_id, queue, project));
        };

        let view = ClaimView {
            id: self.store.claim_ids.encode(cid),
            ttl,
            age: age_seconds(created, now),
        };
        Ok((view, ClaimedMessages::new(self.store, cid)))
    }

    /// Takes a new claim over up to `limit` claimable messages (the configured
    /// default when `None`). An empty claim is still created when nothing is
    /// claimable.
    pub fn create(
        &self,
        queue: &str,
        request: ClaimRequest,
        project: Option<&str>,
        limit: Option<usize>,
    ) -> Result<(String, ClaimedMessages<'s>), StorageError> {
        let project = project_or_default(project);
        let limit = limit.unwrap_or(self.store.config.default_limit);

        let tx = Transaction::new_unchecked(&self.store.conn, TransactionBehavior::Immediate)?;
        // Read only once the write lock is held; BEGIN IMMEDIATE may have waited.
        let now = self.store.clock.now_millis();
        let qid = queue_id(&tx, project, queue)?;

        let swept = sweep_expired_claims(&tx, qid, now)?;

        tx.execute(
            "INSERT INTO claims (queue_id, ttl, created) VALUES (?1, ?2, ?3)",
            params![qid, request.ttl, now],
        )?;
        let cid = tx.last_insert_rowid();

        let locked = lock_claimable_messages(&tx, cid, qid, limit, now)?;
        let extended = extend_claimed_messages(&tx, cid, request.message_ttl(), now)?;
        tx.commit()?;

        debug!(
            event = "claim_created",
            queue = %queue,
            project = %project,
            claim = cid,
            swept,
            locked,
            extended
        );

        Ok((
            self.store.claim_ids.encode(cid),
            ClaimedMessages::new(self.store, cid),
        ))
    }

    /// Renews a live claim: restarts its clock with the new ttl and extends
    /// its messages to match.
    pub fn update(
        &self,
        queue: &str,
        claim_id: &str,
        renewal: ClaimRenewal,
        project: Option<&str>,
    ) -> Result<(), StorageError> {
        let project = project_or_default(project);
        let Ok(cid) = self.store.claim_ids.decode(claim_id) else {
            return Err(StorageError::claim_does_not_exist(claim_id, queue, project));
        };

        let tx = Transaction::new_unchecked(&self.store.conn, TransactionBehavior::Deferred)?;
        // A no-op write takes the write lock, so the clock is read after any
        // wait on another writer.
        tx.execute("UPDATE claims SET ttl = ttl WHERE id = ?1", params![cid])?;
        let now = self.store.clock.now_millis();

        let affected = tx.execute(
            "
            UPDATE claims
            SET created = ?1,
                ttl = ?2
            WHERE id = ?3
              AND ttl * 1000 > ?1 - created
              AND queue_id = (SELECT id FROM queues WHERE project = ?4 AND name = ?5)
            ",
            params![now, renewal.ttl, cid, project, queue],
        )?;
        if affected == 0 {
            return Err(StorageError::claim_does_not_exist(claim_id, queue, project));
        }

        let extended = extend_claimed_messages(&tx, cid, renewal.ttl, now)?;
        tx.commit()?;

        debug!(event = "claim_renewed", queue = %queue, project = %project, claim = cid, extended);
        Ok(())
    }

    /// Releases a claim and its locks. Never fails for unknown or malformed ids.
    pub fn delete(
        &self,
        queue: &str,
        claim_id: &str,
        project: Option<&str>,
    ) -> Result<(), StorageError> {
        let project = project_or_default(project);
        let Ok(cid) = self.store.claim_ids.decode(claim_id) else {
            debug!(event = "claim_delete_malformed", queue = %queue, claim = %claim_id);
            return Ok(());
        };

        let tx = Transaction::new_unchecked(&self.store.conn, TransactionBehavior::Deferred)?;
        let removed = tx.execute(
            "
            DELETE FROM claims
            WHERE id = ?1
              AND queue_id = (SELECT id FROM queues WHERE project = ?2 AND name = ?3)
            ",
            params![cid, project, queue],
        )?;
        tx.commit()?;

        debug!(event = "claim_deleted", queue = %queue, project = %project, claim = cid, removed);
        Ok(())
    }
}

/// Messages bound to one claim, read on demand.
///
/// Each `fetch` re-runs the query against a fresh clock reading, so the result
/// reflects expiry and releases that happened since the claim was returned.
pub struct ClaimedMessages<'s> {
    store: &'s QueueStore,
    claim_id: i64,
}

impl std::fmt::Debug for ClaimedMessages<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedMessages")
            .field("claim_id", &self.claim_id)
            .finish_non_exhaustive()
    }
}

impl<'s> ClaimedMessages<'s> {
    fn new(store: &'s QueueStore, claim_id: i64) -> Self {
        Self { store, claim_id }
    }

    pub fn fetch(&self) -> Result<Vec<MessageView>, StorageError> {
        let now = self.store.clock.now_millis();
        let codec = &self.store.message_ids;
        let mut stmt = self.store.conn.prepare(
            "
            SELECT m.id, m.body, m.ttl, m.created
            FROM messages AS m
            JOIN locked AS l ON l.message_id = m.id
            WHERE l.claim_id = ?1
              AND m.ttl * 1000 > ?2 - m.created
            ORDER BY m.id
            ",
        )?;
        let rows = stmt.query_map(params![self.claim_id, now], |row| {
            message_from_row(row, codec, now)
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

/// Deletes every lapsed claim in the queue; their locks go with them.
fn sweep_expired_claims(conn: &Connection, qid: i64, now: i64) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "
        DELETE FROM claims
        WHERE queue_id = ?1
          AND ttl * 1000 <= ?2 - created
        ",
        params![qid, now],
    )?)
}

/// Binds up to `limit` live, unlocked messages of the queue to the claim,
/// oldest first.
fn lock_claimable_messages(
    conn: &Connection,
    cid: i64,
    qid: i64,
    limit: usize,
    now: i64,
) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "
        INSERT INTO locked (claim_id, message_id)
        SELECT ?1, m.id
        FROM messages AS m
        LEFT JOIN locked AS l ON l.message_id = m.id
        WHERE l.message_id IS NULL
          AND m.queue_id = ?2
          AND m.ttl * 1000 > ?3 - m.created
        ORDER BY m.id
        LIMIT ?4
        ",
        params![cid, qid, now, sql_limit(limit)],
    )?)
}

/// Pushes the visibility of the claim's live messages out to `ttl` seconds
/// from `now`, leaving any message that already has at least that long to
/// live untouched.
fn extend_claimed_messages(
    conn: &Connection,
    cid: i64,
    ttl: u32,
    now: i64,
) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "
        UPDATE messages
        SET created = ?1,
            ttl = ?2
        WHERE id IN (SELECT message_id FROM locked WHERE claim_id = ?3)
          AND ttl * 1000 > ?1 - created
          AND ttl * 1000 - (?1 - created) < ?2 * 1000
        ",
        params![now, ttl, cid],
    )?)
}
