//! SQLite-backed `CallStore` implementation with durable persistence.
//!
//! Conditional updates run inside `IMMEDIATE` transactions and are guarded by
//! `WHERE status = ?expected`, so several processes sharing one database file
//! still agree on a single winner per attempt.

use crate::{
    validate_new_call, CallAttempt, CallAttemptQuery, CallStatus, CallStore,
    CallStoreError, ExclusiveAccept, NewCall, StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ATTEMPT_COLUMNS: &str = "call_id, from_identifier, to_identifier, organization_id, message, \
     attachment_ref, status, created_at, accepted_at, rejected_at, resolved_at";

/// Persistent SQLite store backend for call attempts.
#[derive(Debug)]
pub struct SqliteCallStore {
    db_path: PathBuf,
}

impl SqliteCallStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        tracing::debug!(db_path = %store.db_path.display(), "opened sqlite call store");
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS call_attempts (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                call_id TEXT NOT NULL,
                from_identifier TEXT NOT NULL,
                to_identifier TEXT NOT NULL,
                organization_id TEXT NULL,
                message TEXT NULL,
                attachment_ref TEXT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                accepted_at TEXT NULL,
                rejected_at TEXT NULL,
                resolved_at TEXT NULL,
                UNIQUE (call_id, to_identifier)
            );

            CREATE INDEX IF NOT EXISTS idx_call_attempts_call_status
                ON call_attempts (call_id, status);

            CREATE INDEX IF NOT EXISTS idx_call_attempts_created
                ON call_attempts (created_at);
            "#,
        )?;
        Ok(())
    }
}

#[async_trait]
impl CallStore for SqliteCallStore {
    async fn create_attempts(&self, call: NewCall) -> StoreResult<Vec<CallAttempt>> {
        validate_new_call(&call)?;
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists = transaction
            .query_row(
                "SELECT 1 FROM call_attempts WHERE call_id = ?1 LIMIT 1",
                params![call.call_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(CallStoreError::CallAlreadyExists(call.call_id));
        }

        let attempts = call.attempts();
        {
            let mut insert = transaction.prepare(
                r#"
                INSERT INTO call_attempts (
                    call_id, from_identifier, to_identifier, organization_id, message,
                    attachment_ref, status, created_at, accepted_at, rejected_at, resolved_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, NULL)
                "#,
            )?;
            for attempt in &attempts {
                insert.execute(params![
                    attempt.call_id,
                    attempt.from_identifier,
                    attempt.to_identifier,
                    attempt.organization_id,
                    attempt.message,
                    attempt.attachment_ref,
                    attempt.status.as_str(),
                    timestamp_to_db(attempt.created_at),
                ])?;
            }
        }
        transaction.commit()?;
        Ok(attempts)
    }

    async fn compare_and_set_status(
        &self,
        call_id: &str,
        to_identifier: &str,
        expected: CallStatus,
        next: CallStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<CallAttempt>> {
        expected.ensure_transition(next)?;
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous = transaction
            .query_row(
                format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM call_attempts \
                     WHERE call_id = ?1 AND to_identifier = ?2 AND status = ?3"
                )
                .as_str(),
                params![call_id, to_identifier, expected.as_str()],
                AttemptRow::from_row,
            )
            .optional()?
            .map(AttemptRow::into_attempt)
            .transpose()?;
        let Some(previous) = previous else {
            transaction.commit()?;
            return Ok(None);
        };

        let mut updated = previous.clone();
        updated.resolve(next, at);
        let changed = transaction.execute(
            r#"
            UPDATE call_attempts
            SET status = ?1, accepted_at = ?2, rejected_at = ?3, resolved_at = ?4
            WHERE call_id = ?5 AND to_identifier = ?6 AND status = ?7
            "#,
            params![
                next.as_str(),
                option_timestamp_to_db(updated.accepted_at),
                option_timestamp_to_db(updated.rejected_at),
                option_timestamp_to_db(updated.resolved_at),
                call_id,
                to_identifier,
                expected.as_str(),
            ],
        )?;
        transaction.commit()?;

        Ok((changed == 1).then_some(previous))
    }

    async fn set_terminal_for_all_pending(
        &self,
        call_id: &str,
        next: CallStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        CallStatus::Pending.ensure_transition(next)?;
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let pending = {
            let mut statement = transaction.prepare(
                r#"
                SELECT to_identifier FROM call_attempts
                WHERE call_id = ?1 AND status = ?2
                ORDER BY row_id ASC
                "#,
            )?;
            let rows = statement.query_map(
                params![call_id, CallStatus::Pending.as_str()],
                |row| row.get::<_, String>(0),
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        if pending.is_empty() {
            transaction.commit()?;
            return Ok(pending);
        }

        let at_db = timestamp_to_db(at);
        let accepted_at = (next == CallStatus::Accepted).then(|| at_db.clone());
        let rejected_at = (next == CallStatus::Rejected).then(|| at_db.clone());
        transaction.execute(
            r#"
            UPDATE call_attempts
            SET status = ?1, accepted_at = ?2, rejected_at = ?3, resolved_at = ?4
            WHERE call_id = ?5 AND status = ?6
            "#,
            params![
                next.as_str(),
                accepted_at,
                rejected_at,
                at_db,
                call_id,
                CallStatus::Pending.as_str(),
            ],
        )?;
        transaction.commit()?;
        Ok(pending)
    }

    async fn accept_exclusive(
        &self,
        call_id: &str,
        to_identifier: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<ExclusiveAccept>> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous = transaction
            .query_row(
                format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM call_attempts \
                     WHERE call_id = ?1 AND to_identifier = ?2 AND status = ?3"
                )
                .as_str(),
                params![call_id, to_identifier, CallStatus::Pending.as_str()],
                AttemptRow::from_row,
            )
            .optional()?
            .map(AttemptRow::into_attempt)
            .transpose()?;
        let Some(previous) = previous else {
            transaction.commit()?;
            return Ok(None);
        };

        let at_db = timestamp_to_db(at);
        transaction.execute(
            r#"
            UPDATE call_attempts
            SET status = ?1, accepted_at = ?2, resolved_at = ?2
            WHERE call_id = ?3 AND to_identifier = ?4 AND status = ?5
            "#,
            params![
                CallStatus::Accepted.as_str(),
                at_db,
                call_id,
                to_identifier,
                CallStatus::Pending.as_str(),
            ],
        )?;
        let cancelled_siblings = {
            let mut statement = transaction.prepare(
                r#"
                SELECT to_identifier FROM call_attempts
                WHERE call_id = ?1 AND status = ?2
                ORDER BY row_id ASC
                "#,
            )?;
            let rows = statement.query_map(
                params![call_id, CallStatus::Pending.as_str()],
                |row| row.get::<_, String>(0),
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        transaction.execute(
            r#"
            UPDATE call_attempts
            SET status = ?1, resolved_at = ?2
            WHERE call_id = ?3 AND status = ?4
            "#,
            params![
                CallStatus::Cancelled.as_str(),
                at_db,
                call_id,
                CallStatus::Pending.as_str(),
            ],
        )?;
        transaction.commit()?;

        Ok(Some(ExclusiveAccept {
            previous,
            cancelled_siblings,
        }))
    }

    async fn find_by_call_id(&self, call_id: &str) -> StoreResult<Vec<CallAttempt>> {
        self.query_attempts(CallAttemptQuery {
            call_id: Some(call_id.to_string()),
            ..CallAttemptQuery::default()
        })
        .await
    }

    async fn query_attempts(&self, query: CallAttemptQuery) -> StoreResult<Vec<CallAttempt>> {
        if query
            .statuses
            .as_ref()
            .is_some_and(|statuses| statuses.is_empty())
        {
            return Ok(Vec::new());
        }

        let mut clauses = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();
        let mut push_filter = |clause: &str, value: Box<dyn ToSql>| {
            values.push(value);
            clauses.push(clause.replace('?', format!("?{}", values.len()).as_str()));
        };
        if let Some(call_id) = query.call_id.clone() {
            push_filter("call_id = ?", Box::new(call_id));
        }
        if let Some(from) = query.from_identifier.clone() {
            push_filter("from_identifier = ?", Box::new(from));
        }
        if let Some(to) = query.to_identifier.clone() {
            push_filter("to_identifier = ?", Box::new(to));
        }
        if let Some(organization_id) = query.organization_id.clone() {
            push_filter("organization_id = ?", Box::new(organization_id));
        }
        if let Some(after) = query.created_after {
            push_filter("created_at >= ?", Box::new(timestamp_to_db(after)));
        }
        if let Some(before) = query.created_before {
            push_filter("created_at < ?", Box::new(timestamp_to_db(before)));
        }
        if let Some(statuses) = query.statuses.as_ref() {
            let mut placeholders = Vec::with_capacity(statuses.len());
            for status in statuses {
                values.push(Box::new(status.as_str()));
                placeholders.push(format!("?{}", values.len()));
            }
            clauses.push(format!("status IN ({})", placeholders.join(", ")));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let limit = query
            .limit
            .map(|limit| i64::try_from(limit).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let offset = i64::try_from(query.offset).unwrap_or(i64::MAX);
        values.push(Box::new(limit));
        values.push(Box::new(offset));
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM call_attempts {where_clause} \
             ORDER BY row_id ASC LIMIT ?{} OFFSET ?{}",
            values.len() - 1,
            values.len()
        );

        let connection = self.open_connection()?;
        let mut statement = connection.prepare(sql.as_str())?;
        let rows = statement.query_map(
            params_from_iter(values.iter().map(|value| value.as_ref())),
            AttemptRow::from_row,
        )?;

        let mut attempts = Vec::new();
        for row in rows {
            attempts.push(row?.into_attempt()?);
        }
        Ok(attempts)
    }
}

struct AttemptRow {
    call_id: String,
    from_identifier: String,
    to_identifier: String,
    organization_id: Option<String>,
    message: Option<String>,
    attachment_ref: Option<String>,
    status: String,
    created_at: String,
    accepted_at: Option<String>,
    rejected_at: Option<String>,
    resolved_at: Option<String>,
}

impl AttemptRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            call_id: row.get(0)?,
            from_identifier: row.get(1)?,
            to_identifier: row.get(2)?,
            organization_id: row.get(3)?,
            message: row.get(4)?,
            attachment_ref: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
            accepted_at: row.get(8)?,
            rejected_at: row.get(9)?,
            resolved_at: row.get(10)?,
        })
    }

    fn into_attempt(self) -> StoreResult<CallAttempt> {
        Ok(CallAttempt {
            call_id: self.call_id,
            from_identifier: self.from_identifier,
            to_identifier: self.to_identifier,
            organization_id: self.organization_id,
            message: self.message,
            attachment_ref: self.attachment_ref,
            status: call_status_from_db(&self.status)?,
            created_at: timestamp_from_db(&self.created_at)?,
            accepted_at: option_timestamp_from_db(self.accepted_at)?,
            rejected_at: option_timestamp_from_db(self.rejected_at)?,
            resolved_at: option_timestamp_from_db(self.resolved_at)?,
        })
    }
}

// Fixed-width UTC timestamps keep lexical and chronological order aligned.
fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn option_timestamp_to_db(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(timestamp_to_db)
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn option_timestamp_from_db(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.as_deref().map(timestamp_from_db).transpose()
}

fn call_status_from_db(value: &str) -> StoreResult<CallStatus> {
    value
        .parse::<CallStatus>()
        .map_err(|_| CallStoreError::InvalidPersistedValue {
            field: "call_status",
            value: value.to_string(),
        })
}
