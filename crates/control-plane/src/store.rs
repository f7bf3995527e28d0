use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, Transaction, TransactionBehavior};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::utcnow;
use crate::tenancy::{default_tenant_id, DEFAULT_TENANT_NAME};

const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Forward-only migrations. `PRAGMA user_version` records how many entries
/// have been applied; downgrades are unsupported (forward-fix policy).
const MIGRATIONS: &[&str] = &[
    // v1: full control-plane schema.
    "CREATE TABLE tenants (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    );
    CREATE TABLE devices (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id),
        device_key TEXT NOT NULL,
        hostname TEXT,
        os TEXT,
        os_version TEXT,
        arch TEXT,
        agent_version TEXT,
        tags TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL DEFAULT 'active',
        created_at TEXT NOT NULL,
        last_seen_at TEXT,
        deleted_at TEXT,
        UNIQUE (tenant_id, device_key)
    );
    CREATE INDEX ix_devices_last_seen_at ON devices (last_seen_at);
    CREATE TABLE enroll_tokens (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id),
        token_hash TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL,
        expires_at TEXT,
        used_at TEXT,
        revoked_at TEXT,
        used_by_device_id TEXT,
        note TEXT
    );
    CREATE INDEX ix_enroll_tokens_expires_at ON enroll_tokens (expires_at);
    CREATE TABLE device_auth_tokens (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id),
        device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
        token_hash TEXT NOT NULL UNIQUE,
        prefix TEXT NOT NULL,
        issued_at TEXT NOT NULL,
        revoked_at TEXT,
        last_used_at TEXT,
        replaced_by_id TEXT
    );
    CREATE INDEX ix_device_auth_tokens_device_id ON device_auth_tokens (device_id);
    CREATE TABLE policies (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id),
        name TEXT NOT NULL,
        description TEXT,
        schema_version TEXT NOT NULL DEFAULT '1.0',
        is_active INTEGER NOT NULL DEFAULT 1,
        document TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (tenant_id, name)
    );
    CREATE INDEX ix_policies_is_active ON policies (is_active);
    CREATE TABLE policy_assignments (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id),
        device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
        policy_id TEXT NOT NULL REFERENCES policies(id) ON DELETE CASCADE,
        priority INTEGER NOT NULL DEFAULT 100,
        mode TEXT NOT NULL DEFAULT 'enforce',
        created_at TEXT NOT NULL,
        UNIQUE (device_id, policy_id)
    );
    CREATE INDEX ix_policy_assignments_device_id ON policy_assignments (device_id);
    CREATE INDEX ix_policy_assignments_policy_id ON policy_assignments (policy_id);
    CREATE TABLE runs (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id),
        device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        status TEXT NOT NULL,
        run_kind TEXT NOT NULL DEFAULT 'baseline',
        agent_version TEXT,
        effective_policy_hash TEXT,
        policy_snapshot TEXT NOT NULL DEFAULT '{}',
        summary TEXT NOT NULL DEFAULT '{}',
        correlation_id TEXT
    );
    CREATE INDEX ix_runs_device_started ON runs (device_id, started_at);
    CREATE UNIQUE INDEX ux_runs_device_correlation
        ON runs (device_id, correlation_id) WHERE correlation_id IS NOT NULL;
    CREATE TABLE run_items (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
        ordinal INTEGER NOT NULL,
        resource_type TEXT NOT NULL,
        resource_id TEXT NOT NULL,
        name TEXT,
        status_detect TEXT NOT NULL DEFAULT 'not_run',
        status_remediate TEXT NOT NULL DEFAULT 'not_run',
        status_validate TEXT NOT NULL DEFAULT 'not_run',
        compliant_before INTEGER,
        compliant_after INTEGER,
        changed INTEGER NOT NULL DEFAULT 0,
        reboot_required INTEGER NOT NULL DEFAULT 0,
        started_at TEXT,
        ended_at TEXT,
        evidence TEXT NOT NULL DEFAULT '{}',
        error TEXT
    );
    CREATE INDEX ix_run_items_run_ordinal ON run_items (run_id, ordinal);
    CREATE TABLE log_events (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
        ts TEXT NOT NULL,
        level TEXT NOT NULL DEFAULT 'info',
        message TEXT NOT NULL,
        data TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX ix_log_events_run_ts ON log_events (run_id, ts);
    CREATE TABLE audit_logs (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id),
        ts TEXT NOT NULL,
        actor TEXT NOT NULL,
        actor_id TEXT,
        action TEXT NOT NULL,
        target_type TEXT,
        target_id TEXT,
        before TEXT,
        after TEXT,
        correlation_id TEXT,
        request_method TEXT,
        request_path TEXT,
        remote_addr TEXT
    );
    CREATE INDEX ix_audit_logs_tenant_ts_id ON audit_logs (tenant_id, ts, id);",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Single-writer SQLite store. All mutations run as IMMEDIATE transactions
/// on one connection behind a mutex, which serializes writes per process;
/// readers hold the connection only for the duration of their query.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.execute_batch("PRAGMA journal_mode = wal; PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        store.ensure_default_tenant()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let applied: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        for (index, migration) in MIGRATIONS.iter().enumerate() {
            let version = index as i64 + 1;
            if version <= applied {
                continue;
            }
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute_batch(migration)?;
            tx.execute_batch(&format!("PRAGMA user_version = {version};"))?;
            tx.commit()?;
        }
        Ok(())
    }

    fn ensure_default_tenant(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO tenants (id, name, is_active, created_at)
             VALUES (?1, ?2, 1, ?3)",
            params![
                default_tenant_id().to_string(),
                DEFAULT_TENANT_NAME,
                to_ts(utcnow())
            ],
        )?;
        Ok(())
    }

    pub(crate) fn with_conn<R, E: From<StoreError>>(
        &self,
        f: impl FnOnce(&Connection) -> Result<R, E>,
    ) -> Result<R, E> {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub(crate) fn with_tx<R, E: From<StoreError>>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<R, E>,
    ) -> Result<R, E> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| E::from(StoreError::from(err)))?;
        let result = f(&tx)?;
        tx.commit().map_err(|err| E::from(StoreError::from(err)))?;
        Ok(result)
    }

}

// Column conversion helpers shared by the entity modules. Parse failures
// surface as rusqlite conversion errors so query_map closures stay simple.

#[derive(Debug, Error)]
#[error("invalid stored value: {0}")]
pub(crate) struct ColumnParseError(pub String);

pub(crate) fn column_err(detail: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(ColumnParseError(detail.into())),
    )
}

pub(crate) fn to_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn to_ts_opt(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(to_ts)
}

pub(crate) fn sql_ts(value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| column_err(format!("timestamp {value}: {err}")))
}

pub(crate) fn sql_ts_opt(value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(sql_ts).transpose()
}

pub(crate) fn sql_uuid(value: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&value).map_err(|err| column_err(format!("uuid {value}: {err}")))
}

pub(crate) fn sql_uuid_opt(value: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    value.map(sql_uuid).transpose()
}

pub(crate) fn sql_json(value: String) -> rusqlite::Result<Value> {
    serde_json::from_str(&value).map_err(|err| column_err(format!("json column: {err}")))
}

pub(crate) fn sql_enum<T>(value: String, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(&value).ok_or_else(|| column_err(format!("enum value {value}")))
}
