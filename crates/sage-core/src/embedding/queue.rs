//! Store-backed embedding queue.
//!
//! A chunk is either waiting here or carries an embedding reference, never
//! both. Entries stay until the consumer acknowledges them; the queue never
//! retries on its own.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{SageError, SageResult};
use crate::models::QueueEntry;
use crate::store::database::Store;

pub struct EmbeddingQueue<'a> {
    store: &'a Store,
}

impl<'a> EmbeddingQueue<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Queue a chunk for (re-)embedding, dropping any reference it had.
    /// Re-enqueueing an existing entry only updates its priority.
    pub fn enqueue(&self, chunk_id: i64, priority: f64) -> SageResult<()> {
        let mut conn = self.store.connection();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE chunks SET embedding_id = NULL WHERE id = ?1;",
            params![chunk_id],
        )?;
        if updated == 0 {
            return Err(SageError::Database(format!("chunk {chunk_id} not found")));
        }
        tx.execute(
            "INSERT INTO embedding_queue (chunk_id, priority) VALUES (?1, ?2) \
             ON CONFLICT(chunk_id) DO UPDATE SET priority = excluded.priority;",
            params![chunk_id, priority],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Up to `limit` entries, highest priority first, oldest first among
    /// equal priorities. Entries are not removed.
    pub fn drain(&self, limit: usize) -> SageResult<Vec<QueueEntry>> {
        let conn = self.store.connection();
        let mut stmt = conn.prepare(
            "SELECT q.chunk_id, q.priority, q.enqueued_at, q.attempts, q.last_error, \
                    COALESCE(c.enhanced_text, c.content) \
             FROM embedding_queue q JOIN chunks c ON c.id = q.chunk_id \
             ORDER BY q.priority DESC, q.enqueued_at ASC, q.chunk_id ASC \
             LIMIT ?1;",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(QueueEntry {
                    chunk_id: row.get(0)?,
                    priority: row.get(1)?,
                    enqueued_at: row.get(2)?,
                    attempts: row.get(3)?,
                    last_error: row.get(4)?,
                    text: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Record a successful embedding: the reference is written and the entry
    /// removed together. Returns false when the chunk no longer exists.
    pub fn complete(&self, chunk_id: i64, embedding_ref: &str) -> SageResult<bool> {
        let mut conn = self.store.connection();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE chunks SET embedding_id = ?2 WHERE id = ?1;",
            params![chunk_id, embedding_ref],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        tx.execute(
            "DELETE FROM embedding_queue WHERE chunk_id = ?1;",
            params![chunk_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Record a failed attempt; the entry stays queued.
    pub fn fail(&self, chunk_id: i64, error: &str) -> SageResult<bool> {
        let conn = self.store.connection();
        let updated = conn.execute(
            "UPDATE embedding_queue SET attempts = attempts + 1, last_error = ?2 \
             WHERE chunk_id = ?1;",
            params![chunk_id, error],
        )?;
        Ok(updated > 0)
    }

    pub fn set_priority(&self, chunk_id: i64, priority: f64) -> SageResult<bool> {
        let conn = self.store.connection();
        let updated = conn.execute(
            "UPDATE embedding_queue SET priority = ?2 WHERE chunk_id = ?1;",
            params![chunk_id, priority],
        )?;
        Ok(updated > 0)
    }

    pub fn get(&self, chunk_id: i64) -> SageResult<Option<QueueEntry>> {
        let conn = self.store.connection();
        let entry = conn
            .query_row(
                "SELECT q.chunk_id, q.priority, q.enqueued_at, q.attempts, q.last_error, \
                        COALESCE(c.enhanced_text, c.content) \
                 FROM embedding_queue q JOIN chunks c ON c.id = q.chunk_id \
                 WHERE q.chunk_id = ?1;",
                params![chunk_id],
                |row| {
                    Ok(QueueEntry {
                        chunk_id: row.get(0)?,
                        priority: row.get(1)?,
                        enqueued_at: row.get(2)?,
                        attempts: row.get(3)?,
                        last_error: row.get(4)?,
                        text: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    pub fn pending_count(&self) -> SageResult<i64> {
        let conn = self.store.connection();
        let count = conn.query_row("SELECT COUNT(*) FROM embedding_queue;", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// The embedding model boundary. `Ok` carries an opaque vector reference.
pub trait Embedder {
    fn model(&self) -> &str;

    fn embed(&self, chunk_id: i64, text: &str) -> Result<String, String>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub embedded: usize,
    pub failed: usize,
    /// Entries whose chunk disappeared while being embedded.
    pub vanished: usize,
}

/// Drain once and hand each entry to `embedder`, acknowledging entries one
/// by one. Embedding failures are recorded on the entry, not returned.
pub fn run_embedding_batch(
    queue: &EmbeddingQueue<'_>,
    embedder: &dyn Embedder,
    limit: usize,
) -> SageResult<DrainReport> {
    let mut report = DrainReport::default();
    for entry in queue.drain(limit)? {
        report.attempted += 1;
        match embedder.embed(entry.chunk_id, &entry.text) {
            Ok(reference) => {
                if queue.complete(entry.chunk_id, &reference)? {
                    report.embedded += 1;
                } else {
                    report.vanished += 1;
                }
            }
            Err(message) => {
                warn!(chunk_id = entry.chunk_id, model = embedder.model(), error = %message, "embedding failed");
                queue.fail(entry.chunk_id, &message)?;
                report.failed += 1;
            }
        }
    }
    debug!(
        model = embedder.model(),
        attempted = report.attempted,
        embedded = report.embedded,
        failed = report.failed,
        "embedding batch finished"
    );
    Ok(report)
}
