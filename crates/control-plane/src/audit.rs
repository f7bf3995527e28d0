use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rusqlite::{params, Row, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{utcnow, AuditActor, AuditRecord};
use crate::store::{sql_enum, sql_json, sql_ts, sql_uuid, to_ts, Store, StoreError};

/// Request-scoped audit attribution, threaded explicitly through every
/// mutating call so the audit row lands in the same transaction as the
/// mutation it describes.
#[derive(Clone, Debug)]
pub struct AuditContext {
    pub actor: AuditActor,
    pub actor_id: Option<String>,
    pub correlation_id: Option<String>,
    pub request_method: Option<String>,
    pub request_path: Option<String>,
    pub remote_addr: Option<String>,
}

impl AuditContext {
    pub fn admin(actor_id: impl Into<String>) -> Self {
        Self {
            actor: AuditActor::Admin,
            actor_id: Some(actor_id.into()),
            correlation_id: None,
            request_method: None,
            request_path: None,
            remote_addr: None,
        }
    }

    pub fn device(device_id: Uuid) -> Self {
        Self {
            actor: AuditActor::Device,
            actor_id: Some(device_id.to_string()),
            correlation_id: None,
            request_method: None,
            request_path: None,
            remote_addr: None,
        }
    }

    pub fn system() -> Self {
        Self {
            actor: AuditActor::System,
            actor_id: None,
            correlation_id: None,
            request_method: None,
            request_path: None,
            remote_addr: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_request(
        mut self,
        method: impl Into<String>,
        path: impl Into<String>,
        remote_addr: Option<String>,
    ) -> Self {
        self.request_method = Some(method.into());
        self.request_path = Some(path.into());
        self.remote_addr = remote_addr;
        self
    }
}

/// Append one audit row inside the caller's transaction. An error here
/// aborts the enclosing mutation (fail-closed auditing).
pub(crate) fn write_audit(
    tx: &Transaction,
    tenant_id: Uuid,
    ctx: &AuditContext,
    action: &str,
    target_type: &str,
    target_id: &str,
    before: Option<&Value>,
    after: Option<&Value>,
) -> Result<Uuid, StoreError> {
    let id = Uuid::new_v4();
    let before_text = before
        .map(|v| serde_json::to_string(v))
        .transpose()
        .map_err(|err| StoreError::Serialization(err.to_string()))?;
    let after_text = after
        .map(|v| serde_json::to_string(v))
        .transpose()
        .map_err(|err| StoreError::Serialization(err.to_string()))?;
    tx.execute(
        "INSERT INTO audit_logs
            (id, tenant_id, ts, actor, actor_id, action, target_type, target_id,
             before, after, correlation_id, request_method, request_path, remote_addr)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            id.to_string(),
            tenant_id.to_string(),
            to_ts(utcnow()),
            ctx.actor.as_str(),
            ctx.actor_id,
            action,
            target_type,
            target_id,
            before_text,
            after_text,
            ctx.correlation_id,
            ctx.request_method,
            ctx.request_path,
            ctx.remote_addr,
        ],
    )?;
    Ok(id)
}

#[derive(Debug, Serialize, Deserialize)]
struct AuditCursor {
    ts: String,
    id: String,
}

pub fn encode_cursor(ts: &str, id: &str) -> String {
    let payload = serde_json::to_vec(&AuditCursor {
        ts: ts.to_string(),
        id: id.to_string(),
    })
    .unwrap_or_default();
    URL_SAFE_NO_PAD.encode(payload)
}

/// Decode an opaque page cursor. `None` means the cursor is malformed and
/// the caller should reject the request rather than restart pagination.
pub fn decode_cursor(cursor: &str) -> Option<(String, String)> {
    let bytes = URL_SAFE_NO_PAD.decode(cursor).ok()?;
    let parsed: AuditCursor = serde_json::from_slice(&bytes).ok()?;
    Some((parsed.ts, parsed.id))
}

#[derive(Clone, Debug, Default)]
pub struct AuditQuery {
    pub action: Option<String>,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub cursor: Option<(String, String)>,
    pub limit: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct AuditPage {
    pub items: Vec<AuditRecord>,
    pub next_cursor: Option<String>,
}

impl Store {
    pub fn audit_page(&self, tenant_id: Uuid, query: &AuditQuery) -> Result<AuditPage, StoreError> {
        let limit = query.limit.clamp(1, 500);
        let (cursor_ts, cursor_id) = match &query.cursor {
            Some((ts, id)) => (Some(ts.clone()), Some(id.clone())),
            None => (None, None),
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tenant_id, ts, actor, actor_id, action, target_type, target_id,
                        before, after, correlation_id, request_method, request_path, remote_addr
                 FROM audit_logs
                 WHERE tenant_id = ?1
                   AND (?2 IS NULL OR action = ?2)
                   AND (?3 IS NULL OR target_type = ?3)
                   AND (?4 IS NULL OR target_id = ?4)
                   AND (?5 IS NULL OR ts < ?5 OR (ts = ?5 AND id < ?6))
                 ORDER BY ts DESC, id DESC
                 LIMIT ?7",
            )?;
            let mut items: Vec<AuditRecord> = stmt
                .query_map(
                    params![
                        tenant_id.to_string(),
                        query.action,
                        query.target_type,
                        query.target_id,
                        cursor_ts,
                        cursor_id,
                        (limit + 1) as i64,
                    ],
                    audit_from_row,
                )?
                .collect::<Result<_, _>>()?;

            let next_cursor = if items.len() > limit {
                items.truncate(limit);
                items
                    .last()
                    .map(|last| encode_cursor(&to_ts(last.ts), &last.id.to_string()))
            } else {
                None
            };

            Ok(AuditPage { items, next_cursor })
        })
    }
}

fn audit_from_row(row: &Row) -> rusqlite::Result<AuditRecord> {
    Ok(AuditRecord {
        id: sql_uuid(row.get(0)?)?,
        tenant_id: sql_uuid(row.get(1)?)?,
        ts: sql_ts(row.get(2)?)?,
        actor: sql_enum(row.get(3)?, AuditActor::parse)?,
        actor_id: row.get(4)?,
        action: row.get(5)?,
        target_type: row.get(6)?,
        target_id: row.get(7)?,
        before: row.get::<_, Option<String>>(8)?.map(sql_json).transpose()?,
        after: row.get::<_, Option<String>>(9)?.map(sql_json).transpose()?,
        correlation_id: row.get(10)?,
        request_method: row.get(11)?,
        request_path: row.get(12)?,
        remote_addr: row.get(13)?,
    })
}
