use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{write_audit, AuditContext};
use crate::models::{utcnow, AssignmentMode, Policy, PolicyAssignment};
use crate::policy::{policy_from_row, POLICY_COLUMNS};
use crate::store::{sql_enum, sql_ts, sql_uuid, to_ts, Store, StoreError};

#[derive(Debug, Error)]
pub enum AssignmentError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("device not found")]
    DeviceNotFound,
    #[error("policy not found")]
    PolicyNotFound,
    #[error("assignment not found")]
    AssignmentNotFound,
}

impl From<rusqlite::Error> for AssignmentError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

#[derive(Clone, Debug)]
pub struct AssignPolicy {
    pub device_id: Uuid,
    pub policy_name: String,
    pub priority: i64,
    pub mode: AssignmentMode,
}

impl Store {
    /// Bind a policy to a device. Re-assigning an existing (device, policy)
    /// pair updates priority/mode in place; the original row keeps its id
    /// and created_at so compile ordering stays stable.
    pub fn assign_policy(
        &self,
        ctx: &AuditContext,
        tenant_id: Uuid,
        request: &AssignPolicy,
    ) -> Result<PolicyAssignment, AssignmentError> {
        let now = utcnow();
        self.with_tx(|tx| {
            if !device_exists(tx, tenant_id, request.device_id)? {
                return Err(AssignmentError::DeviceNotFound);
            }

            let policy = tx
                .query_row(
                    &format!(
                        "SELECT {POLICY_COLUMNS} FROM policies WHERE tenant_id = ?1 AND name = ?2"
                    ),
                    params![tenant_id.to_string(), request.policy_name],
                    policy_from_row,
                )
                .optional()?
                .ok_or(AssignmentError::PolicyNotFound)?;

            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {ASSIGNMENT_COLUMNS} FROM policy_assignments
                         WHERE device_id = ?1 AND policy_id = ?2"
                    ),
                    params![request.device_id.to_string(), policy.id.to_string()],
                    assignment_from_row,
                )
                .optional()?;

            let assignment = match existing {
                Some(mut assignment) => {
                    let before = json!({
                        "priority": assignment.priority,
                        "mode": assignment.mode,
                    });
                    assignment.priority = request.priority;
                    assignment.mode = request.mode;
                    tx.execute(
                        "UPDATE policy_assignments SET priority = ?1, mode = ?2 WHERE id = ?3",
                        params![
                            assignment.priority,
                            assignment.mode.as_str(),
                            assignment.id.to_string(),
                        ],
                    )?;
                    write_audit(
                        tx,
                        tenant_id,
                        ctx,
                        "assignment.create",
                        "policy_assignment",
                        &assignment.id.to_string(),
                        Some(&before),
                        Some(&json!({
                            "policy_name": policy.name,
                            "priority": assignment.priority,
                            "mode": assignment.mode,
                        })),
                    )?;
                    assignment
                }
                None => {
                    let assignment = PolicyAssignment {
                        id: Uuid::new_v4(),
                        tenant_id,
                        device_id: request.device_id,
                        policy_id: policy.id,
                        priority: request.priority,
                        mode: request.mode,
                        created_at: now,
                    };
                    tx.execute(
                        "INSERT INTO policy_assignments
                            (id, tenant_id, device_id, policy_id, priority, mode, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            assignment.id.to_string(),
                            assignment.tenant_id.to_string(),
                            assignment.device_id.to_string(),
                            assignment.policy_id.to_string(),
                            assignment.priority,
                            assignment.mode.as_str(),
                            to_ts(assignment.created_at),
                        ],
                    )?;
                    write_audit(
                        tx,
                        tenant_id,
                        ctx,
                        "assignment.create",
                        "policy_assignment",
                        &assignment.id.to_string(),
                        None,
                        Some(&json!({
                            "policy_name": policy.name,
                            "priority": assignment.priority,
                            "mode": assignment.mode,
                        })),
                    )?;
                    assignment
                }
            };
            Ok(assignment)
        })
    }

    /// Assignments joined with their policies in canonical compile order:
    /// priority asc, created_at asc, id asc.
    pub fn list_assignments(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
    ) -> Result<Vec<(PolicyAssignment, Policy)>, StoreError> {
        self.with_conn(|conn| ordered_assignments(conn, tenant_id, device_id))
    }

    pub fn clear_assignments(
        &self,
        ctx: &AuditContext,
        tenant_id: Uuid,
        device_id: Uuid,
    ) -> Result<usize, AssignmentError> {
        self.with_tx(|tx| {
            let removed = tx.execute(
                "DELETE FROM policy_assignments WHERE tenant_id = ?1 AND device_id = ?2",
                params![tenant_id.to_string(), device_id.to_string()],
            )?;
            write_audit(
                tx,
                tenant_id,
                ctx,
                "assignment.clear",
                "device",
                &device_id.to_string(),
                None,
                Some(&json!({ "removed": removed })),
            )?;
            Ok(removed)
        })
    }

    pub fn remove_assignment(
        &self,
        ctx: &AuditContext,
        tenant_id: Uuid,
        device_id: Uuid,
        policy_id: Uuid,
    ) -> Result<(), AssignmentError> {
        self.with_tx(|tx| {
            let removed = tx.execute(
                "DELETE FROM policy_assignments
                 WHERE tenant_id = ?1 AND device_id = ?2 AND policy_id = ?3",
                params![
                    tenant_id.to_string(),
                    device_id.to_string(),
                    policy_id.to_string()
                ],
            )?;
            if removed == 0 {
                return Err(AssignmentError::AssignmentNotFound);
            }
            write_audit(
                tx,
                tenant_id,
                ctx,
                "assignment.delete",
                "policy_assignment",
                &policy_id.to_string(),
                Some(&json!({ "device_id": device_id, "policy_id": policy_id })),
                None,
            )?;
            Ok(())
        })
    }
}

pub(crate) const ASSIGNMENT_COLUMNS: &str =
    "id, tenant_id, device_id, policy_id, priority, mode, created_at";

pub(crate) fn assignment_from_row(row: &Row) -> rusqlite::Result<PolicyAssignment> {
    Ok(PolicyAssignment {
        id: sql_uuid(row.get(0)?)?,
        tenant_id: sql_uuid(row.get(1)?)?,
        device_id: sql_uuid(row.get(2)?)?,
        policy_id: sql_uuid(row.get(3)?)?,
        priority: row.get(4)?,
        mode: sql_enum(row.get(5)?, AssignmentMode::parse)?,
        created_at: sql_ts(row.get(6)?)?,
    })
}

/// Shared by the listing API and the compiler so both observe the same
/// total order.
pub(crate) fn ordered_assignments(
    conn: &rusqlite::Connection,
    tenant_id: Uuid,
    device_id: Uuid,
) -> Result<Vec<(PolicyAssignment, Policy)>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT a.id, a.tenant_id, a.device_id, a.policy_id, a.priority, a.mode, a.created_at,
                p.id, p.tenant_id, p.name, p.description, p.schema_version, p.is_active,
                p.document, p.created_at, p.updated_at
         FROM policy_assignments a
         JOIN policies p ON p.id = a.policy_id
         WHERE a.tenant_id = ?1 AND a.device_id = ?2
         ORDER BY a.priority ASC, a.created_at ASC, a.id ASC",
    )?;
    let rows = stmt
        .query_map(
            params![tenant_id.to_string(), device_id.to_string()],
            |row| {
                let assignment = assignment_from_row(row)?;
                let document_text: String = row.get(13)?;
                let document = serde_json::from_str(&document_text)
                    .map_err(|err| crate::store::column_err(format!("policy document: {err}")))?;
                let policy = Policy {
                    id: sql_uuid(row.get(7)?)?,
                    tenant_id: sql_uuid(row.get(8)?)?,
                    name: row.get(9)?,
                    description: row.get(10)?,
                    schema_version: row.get(11)?,
                    is_active: row.get::<_, i64>(12)? != 0,
                    document,
                    created_at: sql_ts(row.get(14)?)?,
                    updated_at: sql_ts(row.get(15)?)?,
                };
                Ok((assignment, policy))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn device_exists(
    tx: &Transaction,
    tenant_id: Uuid,
    device_id: Uuid,
) -> Result<bool, StoreError> {
    let found: Option<String> = tx
        .query_row(
            "SELECT id FROM devices WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id.to_string(), device_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}
