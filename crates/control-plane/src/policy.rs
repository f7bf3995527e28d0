use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{write_audit, AuditContext};
use crate::hashing::hash_canonical_json;
use crate::models::{utcnow, Policy, PolicyDocument};
use crate::store::{sql_ts, sql_uuid, to_ts, Store, StoreError};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("policy not found")]
    NotFound,
    #[error("policy document invalid")]
    Document(Vec<DocumentError>),
}

impl From<rusqlite::Error> for PolicyError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DocumentError {
    pub path: String,
    pub message: String,
}

impl DocumentError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct UpsertPolicy {
    pub name: String,
    pub description: Option<String>,
    pub schema_version: String,
    pub is_active: bool,
    pub document: Value,
}

impl Store {
    /// Upsert by (tenant, name). Policies are versioned by mutation in
    /// place; the effective-policy hash captures content changes.
    pub fn upsert_policy(
        &self,
        ctx: &AuditContext,
        tenant_id: Uuid,
        request: &UpsertPolicy,
    ) -> Result<Policy, PolicyError> {
        let normalized = validate_and_normalize_document(&request.document)
            .map_err(PolicyError::Document)?;
        let document: PolicyDocument = serde_json::from_value(normalized.clone())
            .map_err(|err| PolicyError::Store(StoreError::Serialization(err.to_string())))?;
        let document_text = serde_json::to_string(&normalized)
            .map_err(|err| PolicyError::Store(StoreError::Serialization(err.to_string())))?;
        let content_hash = hash_canonical_json(&normalized)
            .map_err(|err| PolicyError::Store(StoreError::Serialization(err.to_string())))?;
        let now = utcnow();

        self.with_tx(|tx| {
            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {POLICY_COLUMNS} FROM policies WHERE tenant_id = ?1 AND name = ?2"
                    ),
                    params![tenant_id.to_string(), request.name],
                    policy_from_row,
                )
                .optional()?;

            let policy = match existing {
                Some(previous) => {
                    tx.execute(
                        "UPDATE policies SET description = ?1, schema_version = ?2,
                             is_active = ?3, document = ?4, updated_at = ?5
                         WHERE id = ?6",
                        params![
                            request.description,
                            request.schema_version,
                            request.is_active as i64,
                            document_text,
                            to_ts(now),
                            previous.id.to_string(),
                        ],
                    )?;
                    let before = json!({
                        "is_active": previous.is_active,
                        "schema_version": previous.schema_version,
                    });
                    write_audit(
                        tx,
                        tenant_id,
                        ctx,
                        "policy.upsert",
                        "policy",
                        &previous.id.to_string(),
                        Some(&before),
                        Some(&json!({
                            "name": request.name,
                            "is_active": request.is_active,
                            "content_hash": content_hash,
                        })),
                    )?;
                    Policy {
                        description: request.description.clone(),
                        schema_version: request.schema_version.clone(),
                        is_active: request.is_active,
                        document: document.clone(),
                        updated_at: now,
                        ..previous
                    }
                }
                None => {
                    let policy = Policy {
                        id: Uuid::new_v4(),
                        tenant_id,
                        name: request.name.clone(),
                        description: request.description.clone(),
                        schema_version: request.schema_version.clone(),
                        is_active: request.is_active,
                        document: document.clone(),
                        created_at: now,
                        updated_at: now,
                    };
                    tx.execute(
                        "INSERT INTO policies
                            (id, tenant_id, name, description, schema_version, is_active,
                             document, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            policy.id.to_string(),
                            policy.tenant_id.to_string(),
                            policy.name,
                            policy.description,
                            policy.schema_version,
                            policy.is_active as i64,
                            document_text,
                            to_ts(policy.created_at),
                            to_ts(policy.updated_at),
                        ],
                    )?;
                    write_audit(
                        tx,
                        tenant_id,
                        ctx,
                        "policy.upsert",
                        "policy",
                        &policy.id.to_string(),
                        None,
                        Some(&json!({
                            "name": policy.name,
                            "is_active": policy.is_active,
                            "content_hash": content_hash,
                        })),
                    )?;
                    policy
                }
            };
            Ok(policy)
        })
    }

    pub fn list_policies(&self, tenant_id: Uuid) -> Result<Vec<Policy>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {POLICY_COLUMNS} FROM policies WHERE tenant_id = ?1 ORDER BY name ASC"
            ))?;
            let rows = stmt
                .query_map(params![tenant_id.to_string()], policy_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_policy(&self, tenant_id: Uuid, policy_id: Uuid) -> Result<Option<Policy>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {POLICY_COLUMNS} FROM policies WHERE tenant_id = ?1 AND id = ?2"),
                params![tenant_id.to_string(), policy_id.to_string()],
                policy_from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    pub fn get_policy_by_name(
        &self,
        tenant_id: Uuid,
        name: &str,
    ) -> Result<Option<Policy>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {POLICY_COLUMNS} FROM policies WHERE tenant_id = ?1 AND name = ?2"),
                params![tenant_id.to_string(), name],
                policy_from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })
    }
}

pub(crate) const POLICY_COLUMNS: &str =
    "id, tenant_id, name, description, schema_version, is_active, document, created_at, updated_at";

pub(crate) fn policy_from_row(row: &Row) -> rusqlite::Result<Policy> {
    let document_text: String = row.get(6)?;
    let document: PolicyDocument = serde_json::from_str(&document_text)
        .map_err(|err| crate::store::column_err(format!("policy document: {err}")))?;
    Ok(Policy {
        id: sql_uuid(row.get(0)?)?,
        tenant_id: sql_uuid(row.get(1)?)?,
        name: row.get(2)?,
        description: row.get(3)?,
        schema_version: row.get(4)?,
        is_active: row.get::<_, i64>(5)? != 0,
        document,
        created_at: sql_ts(row.get(7)?)?,
        updated_at: sql_ts(row.get(8)?)?,
    })
}

/// Validate and normalize a policy document before it is persisted.
///
/// Normalization: `type`/`id` lowercased, winget ids backfilled from
/// `package_id`, legacy camelCase spellings folded in. Unknown resource
/// types only need `type` + `id` and are otherwise preserved verbatim.
pub fn validate_and_normalize_document(document: &Value) -> Result<Value, Vec<DocumentError>> {
    if document.is_null() {
        return Ok(json!({ "resources": [] }));
    }
    let Some(doc) = document.as_object() else {
        return Err(vec![DocumentError::new("document", "must be an object")]);
    };

    let raw_resources = match doc.get("resources") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(vec![DocumentError::new(
                "document.resources",
                "must be a list",
            )])
        }
    };

    let mut errors = Vec::new();
    let mut out_resources = Vec::with_capacity(raw_resources.len());

    for (index, raw) in raw_resources.into_iter().enumerate() {
        let prefix = format!("document.resources[{index}]");
        let Some(resource) = raw.as_object() else {
            errors.push(DocumentError::new(&prefix, "must be an object"));
            continue;
        };
        let mut nr = resource.clone();

        let rtype = string_field(&nr, "type").to_lowercase();
        if rtype.is_empty() {
            errors.push(DocumentError::new(format!("{prefix}.type"), "is required"));
            out_resources.push(Value::Object(nr));
            continue;
        }
        nr.insert("type".to_string(), Value::String(rtype.clone()));

        let mut rid = string_field(&nr, "id").to_lowercase();
        if rid.is_empty() && rtype == "winget.package" {
            let pkg = string_field(&nr, "package_id");
            let pkg = if pkg.is_empty() {
                string_field(&nr, "packageId")
            } else {
                pkg
            };
            rid = pkg.to_lowercase();
        }
        if rid.is_empty() {
            errors.push(DocumentError::new(format!("{prefix}.id"), "is required"));
        } else {
            nr.insert("id".to_string(), Value::String(rid));
        }

        if let Some(ensure) = nr.get("ensure").and_then(Value::as_str) {
            nr.insert(
                "ensure".to_string(),
                Value::String(ensure.trim().to_lowercase()),
            );
        }

        match rtype.as_str() {
            "winget.package" => {
                let mut pkg = string_field(&nr, "package_id");
                if pkg.is_empty() {
                    pkg = string_field(&nr, "packageId");
                }
                if pkg.is_empty() {
                    errors.push(DocumentError::new(
                        format!("{prefix}.package_id"),
                        "is required for winget.package",
                    ));
                } else {
                    nr.insert("package_id".to_string(), Value::String(pkg));
                    nr.remove("packageId");
                }

                let ensure = nr
                    .get("ensure")
                    .and_then(Value::as_str)
                    .unwrap_or("present")
                    .to_string();
                if ensure != "present" && ensure != "absent" {
                    errors.push(DocumentError::new(
                        format!("{prefix}.ensure"),
                        "must be 'present' or 'absent'",
                    ));
                }
                nr.insert("ensure".to_string(), Value::String(ensure));
            }
            "script.powershell" => {
                let script = string_field(&nr, "script");
                let path = string_field(&nr, "path");
                if script.is_empty() && path.is_empty() {
                    errors.push(DocumentError::new(
                        &prefix,
                        "script.powershell requires 'script' or 'path'",
                    ));
                }
                let timeout = nr
                    .get("timeout_seconds")
                    .or_else(|| nr.get("timeoutSeconds"))
                    .cloned();
                if let Some(value) = timeout {
                    match value.as_i64() {
                        Some(seconds) if seconds > 0 => {
                            nr.insert("timeout_seconds".to_string(), json!(seconds));
                        }
                        _ => errors.push(DocumentError::new(
                            format!("{prefix}.timeout_seconds"),
                            "must be a positive integer",
                        )),
                    }
                    nr.remove("timeoutSeconds");
                }
            }
            _ => {}
        }

        out_resources.push(Value::Object(nr));
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let mut out_doc: Map<String, Value> = doc.clone();
    out_doc.insert("resources".to_string(), Value::Array(out_resources));
    Ok(Value::Object(out_doc))
}

fn string_field(map: &Map<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string()
}
