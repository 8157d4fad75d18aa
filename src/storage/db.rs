//! SQLite message store.
//!
//! One file holds the message cache (with an FTS5 index kept in sync by
//! triggers), local drafts, cache metadata and the append-only send log. The
//! pool is limited to a single connection: the store is single-writer by
//! contract and serializes all access through it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use sqlx::sqlite::SqliteRow;

use crate::config;
use crate::errors::{Error, Result};
use crate::search::{self, RowPredicate, SearchQuery};
use crate::types::{
    Address, CacheStats, Conversation, ConversationSummary, Draft, Message,
    MessageFlag, SendLogEntry, now_utc,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    conv_id TEXT NOT NULL,
    account TEXT NOT NULL,
    folder TEXT NOT NULL,

    from_addr TEXT NOT NULL,
    from_name TEXT NOT NULL DEFAULT '',
    to_json TEXT NOT NULL DEFAULT '[]',
    cc_json TEXT NOT NULL DEFAULT '[]',
    reply_to_json TEXT NOT NULL DEFAULT '[]',

    subject TEXT NOT NULL DEFAULT '',
    date_utc INTEGER NOT NULL,

    body_text TEXT,
    body_html TEXT,

    flags TEXT NOT NULL DEFAULT '[]',
    attachments_json TEXT NOT NULL DEFAULT '[]',

    in_reply_to TEXT,
    references_json TEXT NOT NULL DEFAULT '[]',

    headers_fetched_at INTEGER NOT NULL,
    body_fetched_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_messages_conv ON messages(conv_id);
CREATE INDEX IF NOT EXISTS idx_messages_date ON messages(date_utc DESC);
CREATE INDEX IF NOT EXISTS idx_messages_from ON messages(from_addr);
CREATE INDEX IF NOT EXISTS idx_messages_folder ON messages(folder);
CREATE INDEX IF NOT EXISTS idx_messages_account ON messages(account);

CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    message_id,
    subject,
    body_text,
    from_name,
    from_addr,
    content=messages,
    content_rowid=rowid
);

CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, message_id, subject, body_text, from_name, from_addr)
    VALUES (new.rowid, new.message_id, new.subject, new.body_text, new.from_name, new.from_addr);
END;

CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, message_id, subject, body_text, from_name, from_addr)
    VALUES ('delete', old.rowid, old.message_id, old.subject, old.body_text, old.from_name, old.from_addr);
END;

CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, message_id, subject, body_text, from_name, from_addr)
    VALUES ('delete', old.rowid, old.message_id, old.subject, old.body_text, old.from_name, old.from_addr);
    INSERT INTO messages_fts(rowid, message_id, subject, body_text, from_name, from_addr)
    VALUES (new.rowid, new.message_id, new.subject, new.body_text, new.from_name, new.from_addr);
END;

CREATE TABLE IF NOT EXISTS drafts (
    draft_id TEXT PRIMARY KEY,
    account TEXT NOT NULL,

    to_json TEXT NOT NULL,
    cc_json TEXT NOT NULL DEFAULT '[]',
    bcc_json TEXT NOT NULL DEFAULT '[]',

    subject TEXT NOT NULL,
    body_text TEXT NOT NULL,
    body_html TEXT,

    reply_to_conv_id TEXT,
    in_reply_to TEXT,
    references_json TEXT NOT NULL DEFAULT '[]',

    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS send_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    account TEXT NOT NULL,
    to_json TEXT NOT NULL,
    cc_json TEXT NOT NULL DEFAULT '[]',
    bcc_json TEXT NOT NULL DEFAULT '[]',
    subject TEXT NOT NULL,
    message_id TEXT
);
"#;

const RAW_QUERY_FORBIDDEN: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE",
];

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl Store {
    /// Open the store at the default data-dir location.
    pub async fn open_default() -> Result<Store> {
        let path = config::data_dir().join(config::CACHE_FILE_NAME);
        Store::open(&path).await
    }

    pub async fn open(path: &Path) -> Result<Store> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;
        let store = Store {
            pool,
            path: Some(path.to_path_buf()),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub async fn open_in_memory() -> Result<Store> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Store { pool, path: None };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON;").execute(&self.pool).await?;
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Insert or replace a message by id. The FTS index follows via triggers.
    pub async fn put_message(&self, msg: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (
                message_id, conv_id, account, folder,
                from_addr, from_name, to_json, cc_json, reply_to_json,
                subject, date_utc, body_text, body_html,
                flags, attachments_json, in_reply_to, references_json,
                headers_fetched_at, body_fetched_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            ON CONFLICT(message_id) DO UPDATE SET
                conv_id = excluded.conv_id,
                account = excluded.account,
                folder = excluded.folder,
                from_addr = excluded.from_addr,
                from_name = excluded.from_name,
                to_json = excluded.to_json,
                cc_json = excluded.cc_json,
                reply_to_json = excluded.reply_to_json,
                subject = excluded.subject,
                date_utc = excluded.date_utc,
                body_text = excluded.body_text,
                body_html = excluded.body_html,
                flags = excluded.flags,
                attachments_json = excluded.attachments_json,
                in_reply_to = excluded.in_reply_to,
                references_json = excluded.references_json,
                headers_fetched_at = excluded.headers_fetched_at,
                body_fetched_at = excluded.body_fetched_at;
            "#,
        )
        .bind(&msg.message_id)
        .bind(&msg.conv_id)
        .bind(&msg.account)
        .bind(&msg.folder)
        .bind(&msg.from.addr)
        .bind(&msg.from.name)
        .bind(serde_json::to_string(&msg.to)?)
        .bind(serde_json::to_string(&msg.cc)?)
        .bind(serde_json::to_string(&msg.reply_to)?)
        .bind(&msg.subject)
        .bind(msg.date.timestamp())
        .bind(&msg.body_text)
        .bind(&msg.body_html)
        .bind(serde_json::to_string(&msg.flags)?)
        .bind(serde_json::to_string(&msg.attachments)?)
        .bind(&msg.in_reply_to)
        .bind(serde_json::to_string(&msg.references)?)
        .bind(msg.headers_fetched_at.timestamp())
        .bind(msg.body_fetched_at.map(|t| t.timestamp()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE message_id = ?1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_message(&r)).transpose()
    }

    pub async fn update_flags(&self, message_id: &str, flags: &[MessageFlag]) -> Result<()> {
        sqlx::query("UPDATE messages SET flags = ?1 WHERE message_id = ?2")
            .bind(serde_json::to_string(flags)?)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Update body columns and stamp `body_fetched_at`.
    pub async fn update_body(
        &self,
        message_id: &str,
        body_text: Option<&str>,
        body_html: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE messages
            SET body_text = ?1, body_html = ?2, body_fetched_at = ?3
            WHERE message_id = ?4
            "#,
        )
        .bind(body_text)
        .bind(body_html)
        .bind(now_utc().timestamp())
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn move_message(&self, message_id: &str, folder: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET folder = ?1 WHERE message_id = ?2")
            .bind(folder)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_message(&self, message_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE message_id = ?1")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Load message rows for a folder, newest first. Used by the full
    /// rethreading pass.
    pub async fn list_messages(
        &self,
        account: Option<&str>,
        folder: &str,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM messages WHERE folder = ");
        qb.push_bind(folder);
        if let Some(account) = account {
            qb.push(" AND account = ");
            qb.push_bind(account);
        }
        qb.push(" ORDER BY date_utc DESC LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_message).collect()
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    /// Find conversation summaries whose id starts with `prefix`, ordered by
    /// latest activity descending.
    pub async fn find_conversations_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<ConversationSummary>> {
        let rows = sqlx::query(&format!(
            "{SUMMARY_SELECT} WHERE conv_id LIKE ?1 GROUP BY conv_id ORDER BY latest_date DESC"
        ))
        .bind(format!("{prefix}%"))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_summary).collect()
    }

    /// Get a conversation by exact id or unique prefix. Returns `None` when
    /// nothing matches or the prefix is ambiguous.
    pub async fn get_conversation(&self, conv_id: &str) -> Result<Option<Conversation>> {
        let rows = self.conversation_rows(conv_id).await?;
        if !rows.is_empty() {
            return Ok(Some(build_conversation(rows)?));
        }

        let matches = self.find_conversations_by_prefix(conv_id).await?;
        if matches.len() == 1 {
            let rows = self.conversation_rows(&matches[0].conv_id).await?;
            if !rows.is_empty() {
                return Ok(Some(build_conversation(rows)?));
            }
        }
        Ok(None)
    }

    async fn conversation_rows(&self, conv_id: &str) -> Result<Vec<SqliteRow>> {
        Ok(
            sqlx::query("SELECT * FROM messages WHERE conv_id = ?1 ORDER BY date_utc ASC")
                .bind(conv_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// List conversation summaries for a folder, newest first.
    pub async fn list_conversations(
        &self,
        account: Option<&str>,
        folder: &str,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SUMMARY_SELECT);
        qb.push(" WHERE folder = ");
        qb.push_bind(folder);
        if let Some(account) = account {
            qb.push(" AND account = ");
            qb.push_bind(account);
        }
        qb.push(" GROUP BY conv_id");
        if unread_only {
            qb.push(" HAVING unread_count > 0");
        }
        qb.push(" ORDER BY latest_date DESC LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_summary).collect()
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Basic full-text search. The whole input is matched as one FTS5 phrase
    /// so punctuation-heavy strings (addresses, ids) work as users expect;
    /// boolean multi-term semantics live in [`Store::search_advanced`].
    pub async fn search(
        &self,
        query: &str,
        account: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let phrase = format!("\"{}\"", query.replace('"', "\"\""));

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT m.* FROM messages m JOIN messages_fts ON m.rowid = messages_fts.rowid \
             WHERE messages_fts MATCH ",
        );
        qb.push_bind(phrase);
        if let Some(account) = account {
            qb.push(" AND m.account = ");
            qb.push_bind(account);
        }
        qb.push(" ORDER BY messages_fts.rank LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_message).collect()
    }

    /// Operator-aware search: FTS expression plus row predicates, per the
    /// compiled [`SearchQuery`].
    pub async fn search_advanced(
        &self,
        query: &SearchQuery,
        account: Option<&str>,
        folder: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let fts = search::build_fts_query(query);
        let predicates = search::row_predicates(query);

        let mut qb: QueryBuilder<Sqlite> = match &fts {
            Some(expr) => {
                let mut qb = QueryBuilder::new(
                    "SELECT m.* FROM messages m JOIN messages_fts ON m.rowid = messages_fts.rowid \
                     WHERE messages_fts MATCH ",
                );
                qb.push_bind(expr.clone());
                qb
            }
            None => QueryBuilder::new("SELECT m.* FROM messages m WHERE 1=1"),
        };

        for predicate in &predicates {
            qb.push(" AND ");
            push_predicate(&mut qb, predicate);
        }
        if let Some(account) = account {
            qb.push(" AND m.account = ");
            qb.push_bind(account);
        }
        if let Some(folder) = folder {
            qb.push(" AND m.folder = ");
            qb.push_bind(folder);
        }

        if fts.is_some() {
            qb.push(" ORDER BY messages_fts.rank");
        } else {
            qb.push(" ORDER BY m.date_utc DESC");
        }
        qb.push(" LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_message).collect()
    }

    /// Read-only SQL escape hatch. Only a single SELECT over the messages
    /// table is allowed; statements containing write keywords are rejected
    /// outright and a LIMIT is appended when missing.
    pub async fn execute_raw_query(
        &self,
        sql: &str,
        params: &[String],
        limit: usize,
    ) -> Result<Vec<Message>> {
        let sql_upper = sql.trim().to_uppercase();
        if !sql_upper.starts_with("SELECT") {
            return Err(Error::InvalidInput("only SELECT queries are allowed".into()));
        }
        for keyword in RAW_QUERY_FORBIDDEN {
            if sql_upper.contains(keyword) {
                return Err(Error::InvalidInput(format!(
                    "query contains disallowed keyword: {keyword}"
                )));
            }
        }

        let bounded;
        let sql = if sql_upper.contains("LIMIT") {
            sql
        } else {
            bounded = format!("{} LIMIT {limit}", sql.trim().trim_end_matches(';'));
            bounded.as_str()
        };

        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(param.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_message).collect()
    }

    // ------------------------------------------------------------------
    // Freshness & maintenance
    // ------------------------------------------------------------------

    /// True when the message's headers (or body, with `check_body`) were
    /// fetched within the last `minutes`.
    pub async fn is_fresh(&self, message_id: &str, minutes: u32, check_body: bool) -> Result<bool> {
        let column = if check_body {
            "body_fetched_at"
        } else {
            "headers_fetched_at"
        };
        let row = sqlx::query(&format!(
            "SELECT {column} FROM messages WHERE message_id = ?1"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(false) };
        let Some(fetched_at) = row.get::<Option<i64>, _>(0) else {
            return Ok(false);
        };
        let fetched_at = Utc
            .timestamp_opt(fetched_at, 0)
            .single()
            .ok_or_else(|| Error::Store("corrupt fetched_at timestamp".into()))?;
        Ok(now_utc() - fetched_at < Duration::minutes(minutes as i64))
    }

    pub async fn is_inbox_fresh(&self, account: &str, minutes: u32) -> Result<bool> {
        let row = sqlx::query("SELECT value FROM cache_meta WHERE key = ?1")
            .bind(format!("inbox_sync_{account}"))
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(false) };
        let raw: String = row.get(0);
        let synced_at = DateTime::parse_from_rfc3339(&raw)
            .map_err(|e| Error::Store(format!("corrupt sync marker: {e}")))?
            .with_timezone(&Utc);
        Ok(now_utc() - synced_at < Duration::minutes(minutes as i64))
    }

    pub async fn mark_inbox_synced(&self, account: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO cache_meta (key, value) VALUES (?1, ?2)")
            .bind(format!("inbox_sync_{account}"))
            .bind(now_utc().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete messages older than the cache window. Returns the number of
    /// rows removed.
    pub async fn prune_old_messages(&self, window_days: u32) -> Result<u64> {
        let cutoff = now_utc() - Duration::days(window_days as i64);
        let result = sqlx::query("DELETE FROM messages WHERE date_utc < ?1")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Wipe messages, drafts and cache metadata. The send log is an audit
    /// trail and is never cleared.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM messages").execute(&self.pool).await?;
        sqlx::query("DELETE FROM cache_meta").execute(&self.pool).await?;
        sqlx::query("DELETE FROM drafts").execute(&self.pool).await?;
        sqlx::query("INSERT INTO messages_fts(messages_fts) VALUES('rebuild')")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<CacheStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS message_count,
                   COUNT(DISTINCT conv_id) AS conversation_count,
                   MIN(date_utc) AS oldest,
                   MAX(date_utc) AS newest
            FROM messages
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let last_sync_row =
            sqlx::query("SELECT MAX(value) FROM cache_meta WHERE key LIKE 'inbox_sync_%'")
                .fetch_one(&self.pool)
                .await?;
        let last_sync = last_sync_row
            .get::<Option<String>, _>(0)
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let cache_size_bytes = match &self.path {
            Some(path) => std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            None => 0,
        };

        let to_utc = |ts: Option<i64>| ts.and_then(|t| Utc.timestamp_opt(t, 0).single());

        Ok(CacheStats {
            message_count: row.get::<i64, _>("message_count") as u64,
            conversation_count: row.get::<i64, _>("conversation_count") as u64,
            oldest_message: to_utc(row.get::<Option<i64>, _>("oldest")),
            newest_message: to_utc(row.get::<Option<i64>, _>("newest")),
            cache_size_bytes,
            last_sync,
        })
    }

    // ------------------------------------------------------------------
    // Drafts
    // ------------------------------------------------------------------

    pub async fn put_draft(&self, draft: &Draft) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO drafts (
                draft_id, account,
                to_json, cc_json, bcc_json,
                subject, body_text, body_html,
                reply_to_conv_id, in_reply_to, references_json,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&draft.draft_id)
        .bind(&draft.account)
        .bind(serde_json::to_string(&draft.to)?)
        .bind(serde_json::to_string(&draft.cc)?)
        .bind(serde_json::to_string(&draft.bcc)?)
        .bind(&draft.subject)
        .bind(&draft.body_text)
        .bind(&draft.body_html)
        .bind(&draft.reply_to_conv_id)
        .bind(&draft.in_reply_to)
        .bind(serde_json::to_string(&draft.references)?)
        .bind(draft.created_at.timestamp())
        .bind(draft.updated_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_draft(&self, draft_id: &str) -> Result<Option<Draft>> {
        let row = sqlx::query("SELECT * FROM drafts WHERE draft_id = ?1")
            .bind(draft_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_draft(&r)).transpose()
    }

    pub async fn list_drafts(&self, account: Option<&str>) -> Result<Vec<Draft>> {
        let rows = match account {
            Some(account) => {
                sqlx::query("SELECT * FROM drafts WHERE account = ?1 ORDER BY updated_at DESC")
                    .bind(account)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM drafts ORDER BY updated_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_draft).collect()
    }

    /// Delete a draft. Returns whether a row existed.
    pub async fn delete_draft(&self, draft_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM drafts WHERE draft_id = ?1")
            .bind(draft_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Send log
    // ------------------------------------------------------------------

    pub async fn log_send(
        &self,
        account: &str,
        to: &[Address],
        cc: &[Address],
        bcc: &[Address],
        subject: &str,
        message_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO send_log (timestamp, account, to_json, cc_json, bcc_json, subject, message_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(now_utc().timestamp())
        .bind(account)
        .bind(serde_json::to_string(to)?)
        .bind(serde_json::to_string(cc)?)
        .bind(serde_json::to_string(bcc)?)
        .bind(subject)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_send_log(&self, limit: usize) -> Result<Vec<SendLogEntry>> {
        let rows = sqlx::query("SELECT * FROM send_log ORDER BY id DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(SendLogEntry {
                    id: row.get("id"),
                    timestamp: parse_ts(row.get("timestamp"))?,
                    account: row.get("account"),
                    to: serde_json::from_str(row.get::<&str, _>("to_json"))?,
                    cc: serde_json::from_str(row.get::<&str, _>("cc_json"))?,
                    bcc: serde_json::from_str(row.get::<&str, _>("bcc_json"))?,
                    subject: row.get("subject"),
                    message_id: row.get("message_id"),
                })
            })
            .collect()
    }
}

const SUMMARY_SELECT: &str = r#"
SELECT
    conv_id,
    MAX(date_utc) AS latest_date,
    MIN(subject) AS subject,
    COUNT(*) AS message_count,
    SUM(CASE WHEN flags NOT LIKE '%"seen"%' THEN 1 ELSE 0 END) AS unread_count,
    GROUP_CONCAT(DISTINCT from_addr) AS participants,
    (SELECT body_text FROM messages m2
     WHERE m2.conv_id = messages.conv_id
     ORDER BY date_utc DESC LIMIT 1) AS snippet,
    MIN(account) AS account
FROM messages
"#;

fn push_predicate(qb: &mut QueryBuilder<Sqlite>, predicate: &RowPredicate) {
    match predicate {
        RowPredicate::ToContains(addr) => {
            qb.push("m.to_json LIKE ");
            qb.push_bind(format!("%{addr}%"));
        }
        RowPredicate::HasAttachment(true) => {
            qb.push("m.attachments_json != '[]'");
        }
        RowPredicate::HasAttachment(false) => {
            qb.push("m.attachments_json = '[]'");
        }
        RowPredicate::IsRead(true) => {
            qb.push(r#"m.flags LIKE '%"seen"%'"#);
        }
        RowPredicate::IsRead(false) => {
            qb.push(r#"m.flags NOT LIKE '%"seen"%'"#);
        }
        RowPredicate::IsFlagged(true) => {
            qb.push(r#"m.flags LIKE '%"flagged"%'"#);
        }
        RowPredicate::IsFlagged(false) => {
            qb.push(r#"m.flags NOT LIKE '%"flagged"%'"#);
        }
        RowPredicate::After(ts) => {
            qb.push("m.date_utc >= ");
            qb.push_bind(*ts);
        }
        RowPredicate::Before(ts) => {
            qb.push("m.date_utc < ");
            qb.push_bind(*ts);
        }
        RowPredicate::OnDay(start, end) => {
            qb.push("m.date_utc >= ");
            qb.push_bind(*start);
            qb.push(" AND m.date_utc < ");
            qb.push_bind(*end);
        }
    }
}

fn parse_ts(ts: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| Error::Store("timestamp out of range".into()))
}

fn row_to_message(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        message_id: row.get("message_id"),
        conv_id: row.get("conv_id"),
        account: row.get("account"),
        folder: row.get("folder"),
        from: Address::new(
            row.get::<String, _>("from_addr"),
            row.get::<String, _>("from_name"),
        ),
        to: serde_json::from_str(row.get::<&str, _>("to_json"))?,
        cc: serde_json::from_str(row.get::<&str, _>("cc_json"))?,
        reply_to: serde_json::from_str(row.get::<&str, _>("reply_to_json"))?,
        subject: row.get("subject"),
        date: parse_ts(row.get("date_utc"))?,
        body_text: row.get("body_text"),
        body_html: row.get("body_html"),
        flags: serde_json::from_str(row.get::<&str, _>("flags"))?,
        attachments: serde_json::from_str(row.get::<&str, _>("attachments_json"))?,
        in_reply_to: row.get("in_reply_to"),
        references: serde_json::from_str(row.get::<&str, _>("references_json"))?,
        headers_fetched_at: parse_ts(row.get("headers_fetched_at"))?,
        body_fetched_at: row
            .get::<Option<i64>, _>("body_fetched_at")
            .map(parse_ts)
            .transpose()?,
    })
}

fn row_to_summary(row: &SqliteRow) -> Result<ConversationSummary> {
    let participants: Vec<String> = row
        .get::<Option<String>, _>("participants")
        .map(|raw| raw.split(',').map(|s| s.to_string()).collect())
        .unwrap_or_default();
    let snippet: String = row
        .get::<Option<String>, _>("snippet")
        .map(|s| s.chars().take(100).collect())
        .unwrap_or_default();
    let subject: Option<String> = row.get("subject");

    Ok(ConversationSummary {
        conv_id: row.get("conv_id"),
        subject: subject.filter(|s| !s.is_empty()).unwrap_or_else(|| "(no subject)".into()),
        participants,
        message_count: row.get::<i64, _>("message_count") as usize,
        unread_count: row.get::<i64, _>("unread_count") as usize,
        latest_date: parse_ts(row.get("latest_date"))?,
        snippet,
        account: row.get::<Option<String>, _>("account").unwrap_or_default(),
    })
}

fn row_to_draft(row: &SqliteRow) -> Result<Draft> {
    Ok(Draft {
        draft_id: row.get("draft_id"),
        account: row.get("account"),
        to: serde_json::from_str(row.get::<&str, _>("to_json"))?,
        cc: serde_json::from_str(row.get::<&str, _>("cc_json"))?,
        bcc: serde_json::from_str(row.get::<&str, _>("bcc_json"))?,
        subject: row.get("subject"),
        body_text: row.get("body_text"),
        body_html: row.get("body_html"),
        reply_to_conv_id: row.get("reply_to_conv_id"),
        in_reply_to: row.get("in_reply_to"),
        references: serde_json::from_str(row.get::<&str, _>("references_json"))?,
        created_at: parse_ts(row.get("created_at"))?,
        updated_at: parse_ts(row.get("updated_at"))?,
    })
}

/// Build a full conversation from date-ascending message rows.
fn build_conversation(rows: Vec<SqliteRow>) -> Result<Conversation> {
    let messages: Vec<Message> = rows
        .iter()
        .map(row_to_message)
        .collect::<Result<Vec<_>>>()?;

    let mut participants = std::collections::BTreeSet::new();
    let mut unread_count = 0;
    for msg in &messages {
        participants.insert(msg.from.addr.clone());
        for addr in msg.to.iter().chain(msg.cc.iter()) {
            participants.insert(addr.addr.clone());
        }
        if !msg.is_read() {
            unread_count += 1;
        }
    }

    let latest_date = messages
        .iter()
        .map(|m| m.date)
        .max()
        .ok_or_else(|| Error::Store("conversation without messages".into()))?;

    Ok(Conversation {
        conv_id: messages[0].conv_id.clone(),
        subject: messages[0].subject.clone(),
        participants: participants.into_iter().collect(),
        message_count: messages.len(),
        unread_count,
        latest_date,
        account: messages[0].account.clone(),
        messages,
    })
}
