use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::assignment::ordered_assignments;
use crate::hashing::{hash_canonical_json, HashError};
use crate::models::{AssignmentMode, Policy, PolicyAssignment, PolicyDocument};
use crate::store::{Store, StoreError};

pub const CONFLICT_FIRST_WINS: &str = "first-wins-by-priority";

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("device not found")]
    DeviceNotFound,
}

impl From<rusqlite::Error> for CompileError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

impl From<HashError> for CompileError {
    fn from(err: HashError) -> Self {
        Self::Store(StoreError::Serialization(err.to_string()))
    }
}

/// Where a winning resource came from, recorded per key for the debug
/// surface.
#[derive(Clone, Debug, Serialize)]
pub struct ResourceSource {
    pub assignment_id: Uuid,
    pub policy_id: Uuid,
    pub policy_name: String,
    pub priority: i64,
    pub mode: AssignmentMode,
}

#[derive(Clone, Debug, Serialize)]
pub struct Conflict {
    pub key: String,
    pub winner: ResourceSource,
    pub loser: ResourceSource,
    pub reason: &'static str,
}

#[derive(Clone, Debug, Serialize)]
pub struct SkippedAssignment {
    pub assignment_id: Uuid,
    pub policy_id: Uuid,
    pub policy_name: String,
    pub reason: &'static str,
}

#[derive(Clone, Debug, Serialize)]
pub struct CompiledEffectivePolicy {
    pub document: PolicyDocument,
    pub hash: String,
    pub sources_by_key: BTreeMap<String, ResourceSource>,
    pub mode_by_key: BTreeMap<String, AssignmentMode>,
    pub conflicts: Vec<Conflict>,
    pub skipped: Vec<SkippedAssignment>,
}

impl Store {
    /// Compile the effective policy for a device from its assignments.
    /// Read-only; the result is a pure function of the assignment and
    /// policy rows observed in one statement.
    pub fn compile_effective_policy(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
    ) -> Result<CompiledEffectivePolicy, CompileError> {
        let rows = self.with_conn(|conn| {
            let device: Option<String> = conn
                .query_row(
                    "SELECT id FROM devices WHERE tenant_id = ?1 AND id = ?2",
                    params![tenant_id.to_string(), device_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if device.is_none() {
                return Err(CompileError::DeviceNotFound);
            }
            Ok(ordered_assignments(conn, tenant_id, device_id)?)
        })?;
        compile_assignments(&rows)
    }
}

/// Deterministic merge of ordered (assignment, policy) pairs.
///
/// The walk applies assignments in canonical order (priority asc,
/// created_at asc, assignment id asc) with first-wins semantics per
/// resource key. Inputs are re-sorted here so the result does not depend
/// on how the caller fetched the rows.
pub fn compile_assignments(
    rows: &[(PolicyAssignment, Policy)],
) -> Result<CompiledEffectivePolicy, CompileError> {
    let mut ordered: Vec<&(PolicyAssignment, Policy)> = rows.iter().collect();
    ordered.sort_by(|a, b| {
        a.0.priority
            .cmp(&b.0.priority)
            .then_with(|| a.0.created_at.cmp(&b.0.created_at))
            .then_with(|| a.0.id.to_string().cmp(&b.0.id.to_string()))
    });

    let mut document = PolicyDocument::default();
    let mut sources_by_key: BTreeMap<String, ResourceSource> = BTreeMap::new();
    let mut mode_by_key: BTreeMap<String, AssignmentMode> = BTreeMap::new();
    let mut conflicts = Vec::new();
    let mut skipped = Vec::new();

    for (assignment, policy) in ordered {
        if !policy.is_active {
            skipped.push(SkippedAssignment {
                assignment_id: assignment.id,
                policy_id: policy.id,
                policy_name: policy.name.clone(),
                reason: "policy-inactive",
            });
            continue;
        }

        let source = ResourceSource {
            assignment_id: assignment.id,
            policy_id: policy.id,
            policy_name: policy.name.clone(),
            priority: assignment.priority,
            mode: assignment.mode,
        };

        for resource in &policy.document.resources {
            let Some(key) = resource.key() else {
                // Unkeyed resources cannot conflict; carry them through in
                // encounter order.
                document.resources.push(resource.clone());
                continue;
            };
            match sources_by_key.get(&key) {
                None => {
                    document.resources.push(resource.clone());
                    sources_by_key.insert(key.clone(), source.clone());
                    mode_by_key.insert(key, assignment.mode);
                }
                Some(winner) => {
                    conflicts.push(Conflict {
                        key,
                        winner: winner.clone(),
                        loser: source.clone(),
                        reason: CONFLICT_FIRST_WINS,
                    });
                }
            }
        }
    }

    let hash = hash_canonical_json(&document)?;

    Ok(CompiledEffectivePolicy {
        document,
        hash,
        sources_by_key,
        mode_by_key,
        conflicts,
        skipped,
    })
}
