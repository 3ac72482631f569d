//! SQLite-based archive repository

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params, params_from_iter,
};
use rusqlite_migration::{M, Migrations};
use serde::de::DeserializeOwned;

use super::stats_cache::StatsCache;
use super::traits::{
    ArchiveRepository, AttachmentRecord, AttachmentRecords, ThreadFilter, ThreadListing,
};
use crate::error::{ArchiveError, Result};
use crate::models::{
    Attachment, AttachmentId, EmailAddress, LabelCount, MailboxStats, MessageBody, MessageId,
    PageWindow, StorageKind, SyncRun, SyncRunId, SyncStats, SyncStatus, Thread, ThreadId,
    ThreadMessage,
};

/// How long a connection waits on another process's write lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database migrations
///
/// Every archive table is partitioned by `owner`. Timestamps are RFC3339
/// text with a fixed nanosecond width, so text order is time order.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
        r#"
        CREATE TABLE threads (
            owner TEXT NOT NULL,
            id TEXT NOT NULL,
            subject TEXT NOT NULL,
            snippet TEXT NOT NULL,
            last_message_at TEXT NOT NULL,
            message_count INTEGER NOT NULL DEFAULT 0,
            sender_name TEXT,
            sender_email TEXT NOT NULL,
            PRIMARY KEY (owner, id)
        );

        CREATE INDEX idx_threads_recent
            ON threads(owner, last_message_at DESC, id ASC);

        -- Label set of each thread
        CREATE TABLE thread_labels (
            owner TEXT NOT NULL,
            thread_id TEXT NOT NULL,
            label TEXT NOT NULL,
            PRIMARY KEY (owner, thread_id, label),
            FOREIGN KEY (owner, thread_id) REFERENCES threads(owner, id) ON DELETE CASCADE
        );

        CREATE INDEX idx_thread_labels_label ON thread_labels(owner, label);

        -- Messages in provider order; html body is zstd compressed
        CREATE TABLE messages (
            owner TEXT NOT NULL,
            id TEXT NOT NULL,
            thread_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            headers TEXT NOT NULL,
            from_name TEXT,
            from_email TEXT NOT NULL,
            subject TEXT NOT NULL,
            snippet TEXT NOT NULL,
            received_at TEXT NOT NULL,
            label_ids TEXT NOT NULL,
            body_text TEXT,
            body_html BLOB,
            attachment_refs TEXT NOT NULL,
            PRIMARY KEY (owner, id),
            FOREIGN KEY (owner, thread_id) REFERENCES threads(owner, id) ON DELETE CASCADE
        );

        CREATE INDEX idx_messages_thread ON messages(owner, thread_id, position);

        -- Attachment metadata; inline payloads are zstd compressed
        CREATE TABLE attachments (
            id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            message_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            headers TEXT NOT NULL,
            size INTEGER NOT NULL,
            storage_kind TEXT NOT NULL,
            stored_at TEXT NOT NULL,
            payload BLOB
        );

        CREATE TABLE sync_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner TEXT NOT NULL,
            query TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            page_token TEXT,
            stats TEXT NOT NULL,
            error TEXT
        );

        CREATE INDEX idx_sync_runs_owner ON sync_runs(owner, id DESC);
        "#,
        ),
        M::up(
            r#"
            -- Liveness of active runs; '' sorts before every timestamp
            ALTER TABLE sync_runs ADD COLUMN heartbeat_at TEXT NOT NULL DEFAULT '';

            -- Keep only the newest active run per owner before enforcing one
            UPDATE sync_runs SET status = 'failed', error = 'interrupted'
            WHERE status IN ('pending', 'running')
              AND id NOT IN (
                  SELECT MAX(id) FROM sync_runs
                  WHERE status IN ('pending', 'running')
                  GROUP BY owner
              );

            CREATE UNIQUE INDEX idx_sync_runs_active ON sync_runs(owner)
                WHERE status IN ('pending', 'running');
            "#,
        ),
    ])
}

fn encode_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

fn invalid_column(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("invalid {}: {}", what, value).into(),
    )
}

/// Escape `%`, `_` and `\` for a LIKE pattern using `ESCAPE '\'`
fn like_pattern(search: &str) -> String {
    let mut out = String::with_capacity(search.len() + 2);
    out.push('%');
    for c in search.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

const THREAD_COLUMNS: &str = "t.id, t.subject, t.snippet, t.last_message_at, t.message_count, \
                              t.sender_name, t.sender_email";

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<Thread> {
    let count: i64 = row.get(4)?;
    Ok(Thread::new(
        ThreadId::new(row.get::<_, String>(0)?),
        row.get::<_, String>(1)?,
        row.get::<_, String>(2)?,
        time_column(row, 3)?,
        count.max(0) as usize,
    )
    .with_sender(row.get(5)?, row.get::<_, String>(6)?))
}

/// `FROM ... WHERE ...` clause and its parameters for a thread filter
fn filter_clause(owner: &str, filter: &ThreadFilter) -> (&'static str, Vec<Value>) {
    let owner = Value::Text(owner.to_string());
    match filter {
        ThreadFilter::All => ("FROM threads t WHERE t.owner = ?1", vec![owner]),
        ThreadFilter::Label(label) => (
            "FROM threads t
             JOIN thread_labels l ON l.owner = t.owner AND l.thread_id = t.id
             WHERE t.owner = ?1 AND l.label = ?2",
            vec![owner, Value::Text(label.clone())],
        ),
        ThreadFilter::Search(search) => (
            r"FROM threads t
             WHERE t.owner = ?1 AND (
                t.subject LIKE ?2 ESCAPE '\'
                OR t.snippet LIKE ?2 ESCAPE '\'
                OR EXISTS (
                    SELECT 1 FROM messages m
                    WHERE m.owner = t.owner AND m.thread_id = t.id AND (
                        m.subject LIKE ?2 ESCAPE '\'
                        OR m.snippet LIKE ?2 ESCAPE '\'
                        OR m.body_text LIKE ?2 ESCAPE '\'
                    )
                )
             )",
            vec![owner, Value::Text(like_pattern(search))],
        ),
    }
}

/// SQLite-based archive storage
///
/// Holds threads, messages, attachment records and sync runs in a single
/// database file. Attachment payloads above the inline threshold live in a
/// `BlobStore` managed by `AttachmentStore`, not here.
pub struct SqliteArchive {
    conn: Mutex<Connection>,
    stats_cache: StatsCache,
}

impl SqliteArchive {
    /// Open (or create) the archive database at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                ArchiveError::storage(format!("create {}: {}", parent.display(), e))
            })?;
        }

        let mut conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL lets the query service read while a sync job writes
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations().to_latest(&mut conn)?;

        log::debug!("[STORE] Opened archive database at {}", db_path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            stats_cache: StatsCache::new(),
        })
    }

    fn load_thread_labels(
        conn: &Connection,
        owner: &str,
        thread: &mut Thread,
    ) -> rusqlite::Result<()> {
        let mut stmt = conn.prepare_cached(
            "SELECT label FROM thread_labels WHERE owner = ? AND thread_id = ? ORDER BY label",
        )?;
        thread.labels = stmt
            .query_map(params![owner, thread.id.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(())
    }

    fn compute_stats(conn: &Connection, owner: &str) -> Result<MailboxStats> {
        let total_threads: i64 = conn.query_row(
            "SELECT COUNT(*) FROM threads WHERE owner = ?",
            [owner],
            |row| row.get(0),
        )?;
        let total_messages: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE owner = ?",
            [owner],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT label, COUNT(*) FROM thread_labels WHERE owner = ?
             GROUP BY label ORDER BY label",
        )?;
        let labels = stmt
            .query_map([owner], |row| {
                let threads: i64 = row.get(1)?;
                Ok(LabelCount {
                    label: row.get(0)?,
                    threads: threads as usize,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(MailboxStats {
            total_threads: total_threads as usize,
            total_messages: total_messages as usize,
            labels,
        })
    }

    fn read_thread(conn: &Connection, owner: &str, id: &ThreadId) -> Result<Thread> {
        let sql = format!(
            "SELECT {} FROM threads t WHERE t.owner = ? AND t.id = ?",
            THREAD_COLUMNS
        );
        let thread = conn
            .query_row(&sql, params![owner, id.as_str()], thread_from_row)
            .optional()?;

        let Some(mut thread) = thread else {
            return Err(ArchiveError::not_found(format!("thread {}", id)));
        };
        Self::load_thread_labels(conn, owner, &mut thread)?;
        Ok(thread)
    }

    fn read_messages(conn: &Connection, owner: &str, id: &ThreadId) -> Result<Vec<ThreadMessage>> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, thread_id, headers, from_name, from_email, subject, snippet,
                    received_at, label_ids, body_text, body_html, attachment_refs
             FROM messages WHERE owner = ? AND thread_id = ?
             ORDER BY position",
        )?;

        let rows = stmt
            .query_map(params![owner, id.as_str()], |row| {
                let message = ThreadMessage {
                    id: MessageId::new(row.get::<_, String>(0)?),
                    thread_id: ThreadId::new(row.get::<_, String>(1)?),
                    headers: json_column(row, 2)?,
                    from: EmailAddress {
                        name: row.get(3)?,
                        email: row.get(4)?,
                    },
                    subject: row.get(5)?,
                    snippet: row.get(6)?,
                    received_at: time_column(row, 7)?,
                    label_ids: json_column(row, 8)?,
                    body: MessageBody {
                        text: row.get(9)?,
                        html: None,
                    },
                    attachment_refs: json_column(row, 11)?,
                };
                let html: Option<Vec<u8>> = row.get(10)?;
                Ok((message, html))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(mut message, html)| {
                if let Some(compressed) = html {
                    let bytes = zstd::decode_all(compressed.as_slice()).map_err(|e| {
                        ArchiveError::storage(format!("decompress body of {}: {}", message.id.0, e))
                    })?;
                    message.body.html = Some(String::from_utf8_lossy(&bytes).into_owned());
                }
                Ok(message)
            })
            .collect()
    }

    fn read_run(conn: &Connection, id: SyncRunId) -> Result<SyncRun> {
        conn.query_row(
            &format!("SELECT {} FROM sync_runs WHERE id = ?", RUN_COLUMNS),
            [id.0],
            Self::run_from_row,
        )
        .optional()?
        .ok_or_else(|| ArchiveError::not_found(format!("sync run {}", id)))
    }

    /// Pending or Running run of `owner`, if any
    fn active_run(conn: &Connection, owner: &str) -> Result<Option<SyncRunId>> {
        let id = conn
            .query_row(
                "SELECT id FROM sync_runs WHERE owner = ? AND status IN (?, ?)",
                params![
                    owner,
                    SyncStatus::Pending.as_str(),
                    SyncStatus::Running.as_str()
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(SyncRunId))
    }

    /// Map a write rejected by the one-active-run index to `SyncInProgress`
    fn claim_error(&self, e: rusqlite::Error, owner: &str) -> ArchiveError {
        if !is_constraint_violation(&e) {
            return e.into();
        }
        let active = match self.conn.lock() {
            Ok(conn) => Self::active_run(&conn, owner).ok().flatten(),
            Err(_) => None,
        };
        match active {
            Some(run_id) => ArchiveError::SyncInProgress {
                owner: owner.to_string(),
                run_id,
            },
            None => e.into(),
        }
    }

    fn run_from_row(row: &Row<'_>) -> rusqlite::Result<SyncRun> {
        let status: String = row.get(3)?;
        let finished_at = match row.get::<_, Option<String>>(5)? {
            Some(_) => Some(time_column(row, 5)?),
            None => None,
        };
        Ok(SyncRun {
            id: SyncRunId(row.get(0)?),
            owner: row.get(1)?,
            query: row.get(2)?,
            status: SyncStatus::parse(&status)
                .ok_or_else(|| invalid_column(3, "sync status", &status))?,
            started_at: time_column(row, 4)?,
            finished_at,
            page_token: row.get(6)?,
            stats: json_column::<SyncStats>(row, 7)?,
            error: row.get(8)?,
        })
    }

    fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<Attachment> {
        let kind: String = row.get(6)?;
        let size: i64 = row.get(5)?;
        Ok(Attachment {
            id: AttachmentId::new(row.get::<_, String>(0)?),
            owner: row.get(1)?,
            message_id: MessageId::new(row.get::<_, String>(2)?),
            filename: row.get(3)?,
            headers: json_column::<BTreeMap<String, String>>(row, 4)?,
            size: size.max(0) as u64,
            storage_kind: StorageKind::parse(&kind)
                .ok_or_else(|| invalid_column(6, "storage kind", &kind))?,
            stored_at: time_column(row, 7)?,
        })
    }
}

const RUN_COLUMNS: &str =
    "id, owner, query, status, started_at, finished_at, page_token, stats, error";

impl ArchiveRepository for SqliteArchive {
    fn upsert_thread(
        &self,
        owner: &str,
        thread: Thread,
        messages: Vec<ThreadMessage>,
    ) -> Result<()> {
        // Compress outside the lock
        let html_bodies = messages
            .iter()
            .map(|m| {
                m.body
                    .html
                    .as_ref()
                    .map(|html| zstd::encode_all(html.as_bytes(), 3))
                    .transpose()
            })
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| ArchiveError::storage(format!("compress body: {}", e)))?;

        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;

        // ON CONFLICT DO UPDATE keeps the row, so the cascade on messages
        // and labels does not fire
        tx.execute(
            "INSERT INTO threads
             (owner, id, subject, snippet, last_message_at, message_count, sender_name, sender_email)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(owner, id) DO UPDATE SET
                subject = excluded.subject,
                snippet = excluded.snippet,
                last_message_at = excluded.last_message_at,
                message_count = excluded.message_count,
                sender_name = excluded.sender_name,
                sender_email = excluded.sender_email",
            params![
                owner,
                thread.id.as_str(),
                thread.subject,
                thread.snippet,
                encode_time(&thread.last_message_at),
                thread.message_count as i64,
                thread.sender_name,
                thread.sender_email,
            ],
        )?;

        tx.execute(
            "DELETE FROM thread_labels WHERE owner = ? AND thread_id = ?",
            params![owner, thread.id.as_str()],
        )?;
        tx.execute(
            "DELETE FROM messages WHERE owner = ? AND thread_id = ?",
            params![owner, thread.id.as_str()],
        )?;

        {
            let mut label_stmt = tx.prepare(
                "INSERT INTO thread_labels (owner, thread_id, label) VALUES (?, ?, ?)",
            )?;
            for label in &thread.labels {
                label_stmt.execute(params![owner, thread.id.as_str(), label])?;
            }

            let mut msg_stmt = tx.prepare(
                "INSERT INTO messages
                 (owner, id, thread_id, position, headers, from_name, from_email, subject,
                  snippet, received_at, label_ids, body_text, body_html, attachment_refs)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(owner, id) DO UPDATE SET
                    thread_id = excluded.thread_id,
                    position = excluded.position,
                    headers = excluded.headers,
                    from_name = excluded.from_name,
                    from_email = excluded.from_email,
                    subject = excluded.subject,
                    snippet = excluded.snippet,
                    received_at = excluded.received_at,
                    label_ids = excluded.label_ids,
                    body_text = excluded.body_text,
                    body_html = excluded.body_html,
                    attachment_refs = excluded.attachment_refs",
            )?;
            for (position, (message, html)) in messages.iter().zip(html_bodies).enumerate() {
                msg_stmt.execute(params![
                    owner,
                    message.id.as_str(),
                    thread.id.as_str(),
                    position as i64,
                    serde_json::to_string(&message.headers)?,
                    message.from.name,
                    message.from.email,
                    message.subject,
                    message.snippet,
                    encode_time(&message.received_at),
                    serde_json::to_string(&message.label_ids)?,
                    message.body.text,
                    html,
                    serde_json::to_string(&message.attachment_refs)?,
                ])?;
            }
        }

        tx.commit()?;
        drop(conn);

        self.stats_cache.invalidate(owner);
        log::debug!(
            "[STORE] Upserted thread {} for {} ({} messages)",
            thread.id,
            owner,
            messages.len()
        );
        Ok(())
    }

    fn get_thread(&self, owner: &str, id: &ThreadId) -> Result<Thread> {
        let conn = self.conn.lock()?;
        Self::read_thread(&conn, owner, id)
    }

    fn get_thread_messages(&self, owner: &str, id: &ThreadId) -> Result<Vec<ThreadMessage>> {
        let conn = self.conn.lock()?;
        Self::read_messages(&conn, owner, id)
    }

    fn get_thread_with_messages(
        &self,
        owner: &str,
        id: &ThreadId,
    ) -> Result<(Thread, Vec<ThreadMessage>)> {
        let mut conn = self.conn.lock()?;
        // One read transaction: a writer in another process cannot commit
        // between the thread row and its messages
        let tx = conn.transaction()?;
        let thread = Self::read_thread(&tx, owner, id)?;
        let messages = Self::read_messages(&tx, owner, id)?;
        tx.commit()?;
        Ok((thread, messages))
    }

    fn has_thread(&self, owner: &str, id: &ThreadId) -> Result<bool> {
        let conn = self.conn.lock()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM threads WHERE owner = ? AND id = ?)",
            params![owner, id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn list_labels(&self, owner: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT label FROM thread_labels WHERE owner = ? ORDER BY label")?;
        let labels = stmt
            .query_map([owner], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(labels)
    }

    fn list_threads(
        &self,
        owner: &str,
        filter: &ThreadFilter,
        window: &PageWindow,
    ) -> Result<ThreadListing> {
        let (clause, mut values) = filter_clause(owner, filter);
        let conn = self.conn.lock()?;

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) {}", clause),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {} {} ORDER BY t.last_message_at DESC, t.id ASC LIMIT ?{} OFFSET ?{}",
            THREAD_COLUMNS,
            clause,
            values.len() + 1,
            values.len() + 2
        );
        values.push(Value::Integer(window.limit() as i64));
        values.push(Value::Integer(window.offset() as i64));

        let mut stmt = conn.prepare(&sql)?;
        let mut threads = stmt
            .query_map(params_from_iter(values.iter()), thread_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for thread in &mut threads {
            Self::load_thread_labels(&conn, owner, thread)?;
        }

        Ok(ThreadListing {
            total_count: total as usize,
            threads,
        })
    }

    fn stats(&self, owner: &str) -> Result<MailboxStats> {
        if let Some(stats) = self.stats_cache.get(owner) {
            return Ok(stats);
        }
        // Fill the cache while holding the connection so an upsert cannot
        // commit between the read and the put
        let conn = self.conn.lock()?;
        let stats = Self::compute_stats(&conn, owner)?;
        self.stats_cache.put(owner, stats.clone());
        Ok(stats)
    }

    fn create_sync_run(&self, mut run: SyncRun) -> Result<SyncRun> {
        let now = encode_time(&Utc::now());
        let result = {
            let mut conn = self.conn.lock()?;
            // IMMEDIATE takes the write lock before the check, so check and
            // insert are atomic across processes sharing the file
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if !run.status.is_finished()
                && let Some(active) = Self::active_run(&tx, &run.owner)?
            {
                return Err(ArchiveError::SyncInProgress {
                    owner: run.owner,
                    run_id: active,
                });
            }
            tx.execute(
                "INSERT INTO sync_runs
                 (owner, query, status, started_at, finished_at, page_token, stats, error, heartbeat_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    run.owner,
                    run.query,
                    run.status.as_str(),
                    encode_time(&run.started_at),
                    run.finished_at.as_ref().map(encode_time),
                    run.page_token,
                    serde_json::to_string(&run.stats)?,
                    run.error,
                    now,
                ],
            )
            .map(|_| tx.last_insert_rowid())
            .and_then(|id| tx.commit().map(|_| id))
        };
        let id = result.map_err(|e| self.claim_error(e, &run.owner))?;
        run.id = SyncRunId(id);
        Ok(run)
    }

    fn save_sync_run(&self, run: &SyncRun) -> Result<()> {
        let result = {
            let conn = self.conn.lock()?;
            conn.execute(
                "UPDATE sync_runs SET
                    status = ?, finished_at = ?, page_token = ?, stats = ?, error = ?,
                    heartbeat_at = ?
                 WHERE id = ?",
                params![
                    run.status.as_str(),
                    run.finished_at.as_ref().map(encode_time),
                    run.page_token,
                    serde_json::to_string(&run.stats)?,
                    run.error,
                    encode_time(&Utc::now()),
                    run.id.0,
                ],
            )
        };
        let updated = result.map_err(|e| self.claim_error(e, &run.owner))?;
        if updated == 0 {
            return Err(ArchiveError::not_found(format!("sync run {}", run.id)));
        }
        Ok(())
    }

    fn reopen_sync_run(&self, id: SyncRunId) -> Result<SyncRun> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut run = Self::read_run(&tx, id)?;
        if !run.status.is_resumable() {
            return Err(ArchiveError::InvalidInput {
                message: format!("sync run {} is {} and cannot be resumed", id, run.status.as_str()),
            });
        }
        if let Some(active) = Self::active_run(&tx, &run.owner)? {
            return Err(ArchiveError::SyncInProgress {
                owner: run.owner,
                run_id: active,
            });
        }

        run.reopen();
        tx.execute(
            "UPDATE sync_runs SET status = ?, finished_at = NULL, error = NULL, heartbeat_at = ?
             WHERE id = ?",
            params![run.status.as_str(), encode_time(&Utc::now()), id.0],
        )?;
        tx.commit()?;
        Ok(run)
    }

    fn touch_sync_run(&self, id: SyncRunId) -> Result<()> {
        let conn = self.conn.lock()?;
        let updated = conn.execute(
            "UPDATE sync_runs SET heartbeat_at = ? WHERE id = ?",
            params![encode_time(&Utc::now()), id.0],
        )?;
        if updated == 0 {
            return Err(ArchiveError::not_found(format!("sync run {}", id)));
        }
        Ok(())
    }

    fn get_sync_run(&self, id: SyncRunId) -> Result<SyncRun> {
        let conn = self.conn.lock()?;
        Self::read_run(&conn, id)
    }

    fn list_sync_runs(&self, owner: &str) -> Result<Vec<SyncRun>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sync_runs WHERE owner = ? ORDER BY id DESC",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map([owner], Self::run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn fail_interrupted_runs(&self, stale_before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock()?;
        let updated = conn.execute(
            "UPDATE sync_runs SET status = ?, error = 'interrupted', finished_at = ?
             WHERE status IN (?, ?) AND heartbeat_at < ?",
            params![
                SyncStatus::Failed.as_str(),
                encode_time(&Utc::now()),
                SyncStatus::Pending.as_str(),
                SyncStatus::Running.as_str(),
                encode_time(&stale_before),
            ],
        )?;
        if updated > 0 {
            log::warn!(
                "[STORE] Marked {} interrupted sync run(s) as failed (no heartbeat since {})",
                updated,
                encode_time(&stale_before)
            );
        }
        Ok(updated)
    }
}

impl AttachmentRecords for SqliteArchive {
    fn insert_attachment(&self, record: AttachmentRecord) -> Result<bool> {
        let a = &record.attachment;
        let conn = self.conn.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO attachments
             (id, owner, message_id, filename, headers, size, storage_kind, stored_at, payload)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                a.id.as_str(),
                a.owner,
                a.message_id.as_str(),
                a.filename,
                serde_json::to_string(&a.headers)?,
                a.size as i64,
                a.storage_kind.as_str(),
                encode_time(&a.stored_at),
                record.inline_payload,
            ],
        )?;
        Ok(inserted == 1)
    }

    fn get_attachment(&self, id: &AttachmentId) -> Result<Option<Attachment>> {
        let conn = self.conn.lock()?;
        let attachment = conn
            .query_row(
                "SELECT id, owner, message_id, filename, headers, size, storage_kind, stored_at
                 FROM attachments WHERE id = ?",
                [id.as_str()],
                Self::attachment_from_row,
            )
            .optional()?;
        Ok(attachment)
    }

    fn get_inline_payload(&self, id: &AttachmentId) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock()?;
        let payload: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT payload FROM attachments WHERE id = ?",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(payload.flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Header;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    const OWNER: &str = "alice@example.com";

    fn create_test_store() -> (SqliteArchive, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SqliteArchive::open(dir.path().join("archive.test.sqlite")).unwrap();
        (store, dir)
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn make_thread(id: &str, subject: &str, minutes: i64, labels: &[&str]) -> Thread {
        Thread::new(ThreadId::new(id), subject, "snippet", at(minutes), 1)
            .with_labels(labels.iter().copied())
            .with_sender(Some("Bob".to_string()), "bob@example.com")
    }

    fn make_message(id: &str, thread_id: &str, body: &str) -> ThreadMessage {
        ThreadMessage::builder(MessageId::new(id), ThreadId::new(thread_id))
            .headers(vec![Header::new("Subject", "Hello")])
            .from(EmailAddress::with_name("Bob", "bob@example.com"))
            .subject("Hello")
            .snippet("short")
            .received_at(at(0))
            .label_ids(vec!["INBOX".to_string()])
            .body_text(Some(body.to_string()))
            .body_html(Some(format!("<p>{}</p>", body)))
            .attachment_refs(vec![AttachmentId::new(format!("{}.1", id))])
            .build()
    }

    #[test]
    fn test_upsert_and_get_thread() {
        let (store, _dir) = create_test_store();
        let thread = make_thread("t1", "Quarterly report", 5, &["INBOX", "Work"]);
        store
            .upsert_thread(OWNER, thread.clone(), vec![make_message("m1", "t1", "body")])
            .unwrap();

        assert_eq!(store.get_thread(OWNER, &ThreadId::new("t1")).unwrap(), thread);
        assert!(store.has_thread(OWNER, &ThreadId::new("t1")).unwrap());
        assert!(!store.has_thread("eve@example.com", &ThreadId::new("t1")).unwrap());
    }

    #[test]
    fn test_upsert_overwrites_without_duplicates() {
        let (store, _dir) = create_test_store();
        let id = ThreadId::new("t1");
        store
            .upsert_thread(
                OWNER,
                make_thread("t1", "First", 1, &["INBOX"]),
                vec![
                    make_message("m1", "t1", "one"),
                    make_message("m2", "t1", "two"),
                ],
            )
            .unwrap();

        let modified = make_thread("t1", "Second", 2, &["Archive"]);
        store
            .upsert_thread(OWNER, modified.clone(), vec![make_message("m3", "t1", "three")])
            .unwrap();

        assert_eq!(store.get_thread(OWNER, &id).unwrap(), modified);
        let messages = store.get_thread_messages(OWNER, &id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id.as_str(), "m3");
        assert_eq!(store.list_labels(OWNER).unwrap(), vec!["Archive".to_string()]);
        assert_eq!(store.stats(OWNER).unwrap().total_threads, 1);
    }

    #[test]
    fn test_get_thread_not_found() {
        let (store, _dir) = create_test_store();
        let err = store
            .get_thread(OWNER, &ThreadId::new("nonexistent"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_messages_round_trip_in_order() {
        let (store, _dir) = create_test_store();
        let messages = vec![
            make_message("m2", "t1", "later in id order"),
            make_message("m1", "t1", "earlier in id order"),
        ];
        store
            .upsert_thread(OWNER, make_thread("t1", "s", 0, &[]), messages.clone())
            .unwrap();

        let loaded = store
            .get_thread_messages(OWNER, &ThreadId::new("t1"))
            .unwrap();
        assert_eq!(loaded, messages);
        assert!(
            store
                .get_thread_messages(OWNER, &ThreadId::new("missing"))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_owner_partitioning() {
        let (store, _dir) = create_test_store();
        store
            .upsert_thread(OWNER, make_thread("t1", "Alice's", 0, &["INBOX"]), vec![])
            .unwrap();
        store
            .upsert_thread(
                "bob@example.com",
                make_thread("t1", "Bob's", 0, &["Later"]),
                vec![],
            )
            .unwrap();

        let alice = store.get_thread(OWNER, &ThreadId::new("t1")).unwrap();
        assert_eq!(alice.subject, "Alice's");
        assert_eq!(store.list_labels(OWNER).unwrap(), vec!["INBOX".to_string()]);
        assert_eq!(
            store.list_labels("bob@example.com").unwrap(),
            vec!["Later".to_string()]
        );
    }

    #[test]
    fn test_labels_are_lexicographic() {
        let (store, _dir) = create_test_store();
        store
            .upsert_thread(OWNER, make_thread("t1", "a", 0, &["Work", "INBOX"]), vec![])
            .unwrap();
        store
            .upsert_thread(OWNER, make_thread("t2", "b", 1, &["Archive"]), vec![])
            .unwrap();

        assert_eq!(
            store.list_labels(OWNER).unwrap(),
            vec!["Archive".to_string(), "INBOX".to_string(), "Work".to_string()]
        );
    }

    #[test]
    fn test_list_threads_ordering_and_window() {
        let (store, _dir) = create_test_store();
        for i in 0..120 {
            store
                .upsert_thread(
                    OWNER,
                    make_thread(&format!("t{:03}", i), "s", i, &["INBOX"]),
                    vec![],
                )
                .unwrap();
        }

        let first = store
            .list_threads(OWNER, &ThreadFilter::All, &PageWindow::for_page(0))
            .unwrap();
        assert_eq!(first.total_count, 120);
        assert_eq!(first.threads.len(), 50);
        assert_eq!(first.threads[0].id.as_str(), "t119");

        let last = store
            .list_threads(OWNER, &ThreadFilter::All, &PageWindow::for_page(2))
            .unwrap();
        assert_eq!(last.total_count, 120);
        assert_eq!(last.threads.len(), 20);
        assert_eq!(last.threads[19].id.as_str(), "t000");
    }

    #[test]
    fn test_ties_broken_by_id() {
        let (store, _dir) = create_test_store();
        for id in ["tb", "ta", "tc"] {
            store
                .upsert_thread(OWNER, make_thread(id, "s", 7, &[]), vec![])
                .unwrap();
        }
        let listing = store
            .list_threads(OWNER, &ThreadFilter::All, &PageWindow::for_page(0))
            .unwrap();
        let ids: Vec<&str> = listing.threads.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["ta", "tb", "tc"]);
    }

    #[test]
    fn test_label_and_search_filters() {
        let (store, _dir) = create_test_store();
        store
            .upsert_thread(
                OWNER,
                make_thread("t1", "Your Invoice", 1, &["Promotions"]),
                vec![make_message("m1", "t1", "amount due")],
            )
            .unwrap();
        store
            .upsert_thread(
                OWNER,
                make_thread("t2", "Lunch", 2, &["INBOX"]),
                vec![make_message("m2", "t2", "see attached invoice_2024")],
            )
            .unwrap();
        store
            .upsert_thread(
                OWNER,
                make_thread("t3", "Sale", 3, &["Promotions"]),
                vec![make_message("m3", "t3", "50% off")],
            )
            .unwrap();

        let window = PageWindow::for_page(0);
        let promos = store
            .list_threads(OWNER, &ThreadFilter::Label("Promotions".into()), &window)
            .unwrap();
        assert_eq!(promos.total_count, 2);

        let invoices = store
            .list_threads(OWNER, &ThreadFilter::Search("INVOICE".into()), &window)
            .unwrap();
        let ids: Vec<&str> = invoices.threads.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t1"]);

        // LIKE wildcards in the search text match literally
        let percent = store
            .list_threads(OWNER, &ThreadFilter::Search("50%".into()), &window)
            .unwrap();
        assert_eq!(percent.total_count, 1);
        let underscore = store
            .list_threads(OWNER, &ThreadFilter::Search("e_2024".into()), &window)
            .unwrap();
        assert_eq!(underscore.total_count, 1);
        let none = store
            .list_threads(OWNER, &ThreadFilter::Search("e_2025".into()), &window)
            .unwrap();
        assert_eq!(none.total_count, 0);
    }

    #[test]
    fn test_stats_invalidated_on_upsert() {
        let (store, _dir) = create_test_store();
        store
            .upsert_thread(
                OWNER,
                make_thread("t1", "s", 0, &["INBOX"]),
                vec![make_message("m1", "t1", "x")],
            )
            .unwrap();
        let stats = store.stats(OWNER).unwrap();
        assert_eq!(stats.total_threads, 1);
        assert_eq!(stats.total_messages, 1);

        store
            .upsert_thread(
                OWNER,
                make_thread("t2", "s", 1, &["INBOX", "Work"]),
                vec![
                    make_message("m2", "t2", "y"),
                    make_message("m3", "t2", "z"),
                ],
            )
            .unwrap();
        let stats = store.stats(OWNER).unwrap();
        assert_eq!(stats.total_threads, 2);
        assert_eq!(stats.total_messages, 3);
        assert_eq!(
            stats.labels,
            vec![
                LabelCount {
                    label: "INBOX".into(),
                    threads: 2
                },
                LabelCount {
                    label: "Work".into(),
                    threads: 1
                },
            ]
        );
    }

    #[test]
    fn test_sync_run_lifecycle() {
        let (store, _dir) = create_test_store();
        let mut run = store
            .create_sync_run(SyncRun::pending(OWNER, "label:work"))
            .unwrap();
        assert!(run.id.0 > 0);

        run.mark_running();
        run.page_token = Some("page-2".to_string());
        run.stats.threads_synced = 4;
        store.save_sync_run(&run).unwrap();

        let loaded = store.get_sync_run(run.id).unwrap();
        assert_eq!(loaded, run);

        run.mark_succeeded();
        store.save_sync_run(&run).unwrap();
        let second = store.create_sync_run(SyncRun::pending(OWNER, "")).unwrap();
        let runs = store.list_sync_runs(OWNER).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second.id);

        assert!(store.get_sync_run(SyncRunId(9999)).unwrap_err().is_not_found());
    }

    #[test]
    fn test_fail_interrupted_runs() {
        let (store, _dir) = create_test_store();
        let mut done = store.create_sync_run(SyncRun::pending(OWNER, "")).unwrap();
        done.mark_succeeded();
        store.save_sync_run(&done).unwrap();
        let mut running = store.create_sync_run(SyncRun::pending(OWNER, "")).unwrap();
        running.mark_running();
        store.save_sync_run(&running).unwrap();

        // Fresh heartbeat: the run belongs to a live process
        assert_eq!(
            store.fail_interrupted_runs(Utc::now() - Duration::minutes(2)).unwrap(),
            0
        );
        assert_eq!(
            store.get_sync_run(running.id).unwrap().status,
            SyncStatus::Running
        );

        assert_eq!(
            store.fail_interrupted_runs(Utc::now() + Duration::seconds(1)).unwrap(),
            1
        );
        let reloaded = store.get_sync_run(running.id).unwrap();
        assert_eq!(reloaded.status, SyncStatus::Failed);
        assert_eq!(reloaded.error.as_deref(), Some("interrupted"));
        assert_eq!(
            store.get_sync_run(done.id).unwrap().status,
            SyncStatus::Succeeded
        );
    }

    #[test]
    fn test_heartbeat_keeps_run_alive() {
        let (store, _dir) = create_test_store();
        let run = store.create_sync_run(SyncRun::pending(OWNER, "")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let cutoff = Utc::now();

        store.touch_sync_run(run.id).unwrap();
        assert_eq!(store.fail_interrupted_runs(cutoff).unwrap(), 0);
        assert!(store.touch_sync_run(SyncRunId(9999)).unwrap_err().is_not_found());
    }

    #[test]
    fn test_active_run_is_shared_between_connections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.test.sqlite");
        let first = SqliteArchive::open(&path).unwrap();
        let second = SqliteArchive::open(&path).unwrap();

        let mut active = first.create_sync_run(SyncRun::pending(OWNER, "")).unwrap();
        match second.create_sync_run(SyncRun::pending(OWNER, "")) {
            Err(ArchiveError::SyncInProgress { run_id, .. }) => assert_eq!(run_id, active.id),
            other => panic!("expected SyncInProgress, got {:?}", other),
        }
        assert!(second.create_sync_run(SyncRun::pending("bob@example.com", "")).is_ok());

        active.mark_cancelled();
        first.save_sync_run(&active).unwrap();
        let mut next = second.create_sync_run(SyncRun::pending(OWNER, "")).unwrap();

        // A stale copy of the cancelled run cannot become active again
        active.mark_running();
        assert!(matches!(
            first.save_sync_run(&active),
            Err(ArchiveError::SyncInProgress { .. })
        ));

        next.mark_succeeded();
        second.save_sync_run(&next).unwrap();
        let reopened = first.reopen_sync_run(active.id).unwrap();
        assert_eq!(reopened.status, SyncStatus::Pending);
        assert_eq!(first.get_sync_run(active.id).unwrap(), reopened);
    }

    #[test]
    fn test_reopen_requires_resumable_run() {
        let (store, _dir) = create_test_store();
        let mut run = store.create_sync_run(SyncRun::pending(OWNER, "")).unwrap();
        assert!(matches!(
            store.reopen_sync_run(run.id),
            Err(ArchiveError::InvalidInput { .. })
        ));

        run.page_token = Some("p2".to_string());
        run.mark_failed("rate limited");
        store.save_sync_run(&run).unwrap();

        let reopened = store.reopen_sync_run(run.id).unwrap();
        assert_eq!(reopened.status, SyncStatus::Pending);
        assert!(reopened.error.is_none());
        assert_eq!(reopened.page_token.as_deref(), Some("p2"));
        assert!(store.reopen_sync_run(SyncRunId(9999)).unwrap_err().is_not_found());
    }

    #[test]
    fn test_thread_with_messages() {
        let (store, _dir) = create_test_store();
        let id = ThreadId::new("t1");
        store
            .upsert_thread(
                OWNER,
                make_thread("t1", "Plans", 0, &["INBOX"]),
                vec![make_message("m1", "t1", "one"), make_message("m2", "t1", "two")],
            )
            .unwrap();

        let (thread, messages) = store.get_thread_with_messages(OWNER, &id).unwrap();
        assert_eq!(thread.labels, std::collections::BTreeSet::from(["INBOX".to_string()]));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].id.as_str(), "m2");
        assert!(
            store
                .get_thread_with_messages("bob@example.com", &id)
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_attachment_records_write_once() {
        let (store, _dir) = create_test_store();
        let attachment = Attachment {
            id: AttachmentId::new("m1.2"),
            owner: OWNER.to_string(),
            message_id: MessageId::new("m1"),
            filename: "report.pdf".to_string(),
            headers: BTreeMap::from([(
                "Content-Type".to_string(),
                "application/pdf".to_string(),
            )]),
            size: 3,
            storage_kind: StorageKind::Inline,
            stored_at: at(0),
        };

        assert!(
            store
                .insert_attachment(AttachmentRecord {
                    attachment: attachment.clone(),
                    inline_payload: Some(vec![1, 2, 3]),
                })
                .unwrap()
        );
        assert!(
            !store
                .insert_attachment(AttachmentRecord {
                    attachment: attachment.clone(),
                    inline_payload: Some(vec![9]),
                })
                .unwrap()
        );

        assert_eq!(store.get_attachment(&attachment.id).unwrap(), Some(attachment.clone()));
        assert_eq!(
            store.get_inline_payload(&attachment.id).unwrap(),
            Some(vec![1, 2, 3])
        );
        assert!(store.get_attachment(&AttachmentId::new("nope")).unwrap().is_none());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.test.sqlite");
        {
            let store = SqliteArchive::open(&path).unwrap();
            store
                .upsert_thread(OWNER, make_thread("t1", "kept", 0, &["INBOX"]), vec![])
                .unwrap();
        }
        let store = SqliteArchive::open(&path).unwrap();
        assert_eq!(
            store.get_thread(OWNER, &ThreadId::new("t1")).unwrap().subject,
            "kept"
        );
    }
}
