/**
 * ============================================================================
 * DURABLE QUEUE MODULE
 * ============================================================================
 *
 * PURPOSE: Persist captured items until the collector accepts them
 *
 * STORAGE STRUCTURE:
 * {data_dir}/queue.sqlite3
 * └── queue_items (storage_key INTEGER PRIMARY KEY AUTOINCREMENT,
 *                  id TEXT UNIQUE, context, message JSON, enqueued_at)
 *
 * QUEUE BEHAVIOR:
 * - Oldest storage key first
 * - Enqueue is idempotent on item id
 * - Scans are window-limited and never remove anything
 * - Cached pending count, replaced by a full recount at open and on drift,
 *   and by the row count of any scan shorter than its window
 * - Count changes are published to subscribers
 *
 * SQLite allows one writer transaction at a time; the connection itself is
 * guarded by a mutex so the cached count only changes under that lock.
 *
 * ============================================================================
 */

use crate::relay::error::QueueError;
use crate::relay::types::{ApplicationMessage, CapturedItem, QueueItem};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

struct QueueInner {
    conn: Connection,
    cached_count: usize,
}

/**
 * Persistent queue of pending outbound items
 */
pub struct DurableQueue {
    inner: Mutex<QueueInner>,
    count_tx: watch::Sender<usize>,
}

impl DurableQueue {
    /**
     * Open (or create) the queue database at the given path
     * Recounts pending items so the cache starts authoritative
     */
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| QueueError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let queue = Self::from_connection(conn)?;
        log::info!(
            "Opened durable queue at {} ({} pending)",
            path.display(),
            queue.pending_count()
        );
        Ok(queue)
    }

    /// Queue backed by a private in-memory database
    pub fn open_in_memory() -> Result<Self, QueueError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, QueueError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queue_items (
                storage_key INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                context TEXT,
                message TEXT NOT NULL,
                enqueued_at TEXT NOT NULL
            );",
        )?;
        let count = count_rows(&conn)?;
        let (count_tx, _) = watch::channel(count);
        Ok(Self {
            inner: Mutex::new(QueueInner {
                conn,
                cached_count: count,
            }),
            count_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, count: usize) {
        self.count_tx.send_replace(count);
    }

    /**
     * Persist an item
     * Returns false without changing anything if the id is already pending
     */
    pub fn enqueue(&self, item: &CapturedItem) -> Result<bool, QueueError> {
        let message_json = serde_json::to_string(&item.message)?;
        let mut inner = self.lock();
        let inserted = inner.conn.execute(
            "INSERT OR IGNORE INTO queue_items (id, context, message, enqueued_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                item.id,
                item.context,
                message_json,
                item.enqueued_at.to_rfc3339()
            ],
        )?;
        if inserted == 0 {
            log::debug!("Item {} already queued, ignoring", item.id);
            return Ok(false);
        }
        inner.cached_count += 1;
        let count = inner.cached_count;
        drop(inner);

        self.publish(count);
        log::debug!(
            "Enqueued {} ({}) - {} pending",
            item.id,
            item.message.message_type,
            count
        );
        Ok(true)
    }

    /**
     * Read up to `limit` oldest items without removing them
     * Rows that no longer decode are purged so they cannot block the head
     * A scan that returns fewer than `limit` rows also resets the cached
     * count, which picks up deletes made by another handle on the same file
     */
    pub fn scan(&self, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        let mut inner = self.lock();
        let mut items = Vec::new();
        let mut corrupt_keys = Vec::new();
        {
            let tx = inner.conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "SELECT storage_key, id, context, message, enqueued_at
                     FROM queue_items ORDER BY storage_key ASC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?;
                for row in rows {
                    let (storage_key, id, context, message_json, enqueued_at) = row?;
                    match decode_row(&message_json, &enqueued_at) {
                        Some((message, enqueued_at)) => items.push(QueueItem {
                            storage_key,
                            id,
                            context,
                            message,
                            enqueued_at,
                        }),
                        None => corrupt_keys.push(storage_key),
                    }
                }
            }
            tx.commit()?;
        }

        // A short scan saw every row, so it is an exact count
        let rows_read = items.len() + corrupt_keys.len();
        let corrected = rows_read < limit && rows_read != inner.cached_count;
        if corrected {
            log::info!(
                "Pending count corrected from {} to {} by scan",
                inner.cached_count,
                rows_read
            );
            inner.cached_count = rows_read;
        }
        drop(inner);
        if corrected {
            self.publish(rows_read);
        }

        if !corrupt_keys.is_empty() {
            log::warn!("Purging {} undecodable queue rows", corrupt_keys.len());
            self.delete_many(&corrupt_keys)?;
        }
        Ok(items)
    }

    /**
     * Delete items by storage key in one transaction
     * Returns the number of rows actually removed
     */
    pub fn delete_many(&self, keys: &[i64]) -> Result<usize, QueueError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut inner = self.lock();
        let mut removed = 0;
        {
            let tx = inner.conn.transaction()?;
            {
                let mut stmt = tx.prepare("DELETE FROM queue_items WHERE storage_key = ?1")?;
                for key in keys {
                    removed += stmt.execute(params![key])?;
                }
            }
            tx.commit()?;
        }

        if removed > inner.cached_count {
            log::warn!(
                "Pending count drifted (cached {}, removed {}), recounting",
                inner.cached_count,
                removed
            );
            inner.cached_count = count_rows(&inner.conn)?;
        } else {
            inner.cached_count -= removed;
        }
        let count = inner.cached_count;
        drop(inner);

        self.publish(count);
        Ok(removed)
    }

    /**
     * Remove every pending item
     * Returns the number of rows removed
     */
    pub fn clear(&self) -> Result<usize, QueueError> {
        let mut inner = self.lock();
        let removed = inner.conn.execute("DELETE FROM queue_items", [])?;
        inner.cached_count = 0;
        drop(inner);

        self.publish(0);
        log::info!("Durable queue cleared ({} items)", removed);
        Ok(removed)
    }

    /**
     * Replace the cached count with a full store count
     */
    pub fn recount(&self) -> Result<usize, QueueError> {
        let mut inner = self.lock();
        let count = count_rows(&inner.conn)?;
        if count != inner.cached_count {
            log::info!("Pending count corrected from {} to {}", inner.cached_count, count);
        }
        inner.cached_count = count;
        drop(inner);

        self.publish(count);
        Ok(count)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().cached_count
    }

    /// Receive every pending count change
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }
}

fn count_rows(conn: &Connection) -> Result<usize, QueueError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM queue_items", [], |row| row.get(0))?;
    Ok(count.max(0) as usize)
}

fn decode_row(message_json: &str, enqueued_at: &str) -> Option<(ApplicationMessage, DateTime<Utc>)> {
    let message = serde_json::from_str(message_json).ok()?;
    let enqueued_at = DateTime::parse_from_rfc3339(enqueued_at)
        .ok()?
        .with_timezone(&Utc);
    Some((message, enqueued_at))
}
