use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use control_plane::{
    rollup_items, AssignPolicy, AssignmentMode, AuditActor, AuditContext, AuditQuery, Conflict,
    Device, DeviceAuthToken, DeviceStatus, EnrollRequest, EnrollToken, LogEvent, PolicyDocument,
    PruneRequest, RegistryError, ReportCaps, ReportSubmission, ResourceSource, Run, RunItem,
    RunRollup, RunStatus, SkippedAssignment, UpsertPolicy,
};

use crate::error::AppError;
use crate::middleware::{AdminContext, AuthedDevice, CorrelationId};
use crate::state::AppState;

const DEFAULT_PAGE_LIMIT: usize = 50;
const MAX_PAGE_LIMIT: usize = 500;
const DEFAULT_STALE_AFTER_SECONDS: i64 = 1_800;
const DEFAULT_OFFLINE_AFTER_SECONDS: i64 = 3_600;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ---- device surface ----

#[derive(Deserialize)]
pub struct EnrollBody {
    pub enroll_token: String,
    pub device_key: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Serialize)]
pub struct EnrollResponse {
    pub device_id: Uuid,
    pub device_token: String,
}

pub async fn enroll(
    State(state): State<Arc<AppState>>,
    Extension(cid): Extension<CorrelationId>,
    Json(body): Json<EnrollBody>,
) -> Result<Json<EnrollResponse>, AppError> {
    if body.device_key.trim().is_empty() {
        return Err(AppError::schema("device_key is required"));
    }
    let ctx = AuditContext {
        actor: AuditActor::Device,
        actor_id: None,
        correlation_id: Some(cid.value.clone()),
        request_method: Some("POST".to_string()),
        request_path: Some("/api/v1/enroll".to_string()),
        remote_addr: None,
    };
    let request = EnrollRequest {
        enroll_token: body.enroll_token,
        device_key: body.device_key.trim().to_string(),
        hostname: body.hostname,
        os: body.os,
        os_version: body.os_version,
        arch: body.arch,
        agent_version: body.agent_version,
        tags: body.tags,
    };
    let outcome = state
        .store
        .enroll(&state.tokens, &ctx, &request)
        .map_err(|err| match err {
            // Enrolling a soft-deleted device is a lifecycle conflict, not
            // an auth failure.
            RegistryError::DeviceInactive => {
                AppError::conflict("device is deactivated; cannot enroll")
            }
            other => other.into(),
        })?;
    Ok(Json(EnrollResponse {
        device_id: outcome.device.id,
        device_token: outcome.token.raw,
    }))
}

#[derive(Serialize)]
pub struct EffectivePolicyResponse {
    pub document: PolicyDocument,
    pub effective_policy_hash: String,
    pub mode_by_key: BTreeMap<String, AssignmentMode>,
}

pub async fn get_device_policy(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedDevice>,
) -> Result<Json<EffectivePolicyResponse>, AppError> {
    let compiled = state
        .store
        .compile_effective_policy(authed.device.tenant_id, authed.device.id)?;
    Ok(Json(EffectivePolicyResponse {
        document: compiled.document,
        effective_policy_hash: compiled.hash,
        mode_by_key: compiled.mode_by_key,
    }))
}

#[derive(Serialize)]
pub struct SubmitReportResponse {
    pub run_id: Uuid,
}

pub async fn submit_report(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedDevice>,
    Extension(cid): Extension<CorrelationId>,
    Json(report): Json<ReportSubmission>,
) -> Result<(StatusCode, Json<SubmitReportResponse>), AppError> {
    let caps = ReportCaps {
        max_items: state.settings.max_report_items,
        max_log_events: state.settings.max_report_log_events,
    };
    // Ingest can write thousands of rows; keep it off the async workers.
    let store = state.store.clone();
    let correlation = cid.client_value().map(str::to_string);
    let outcome = tokio::task::spawn_blocking(move || {
        store.ingest_report(
            &authed.device,
            authed.token_id,
            &report,
            &caps,
            correlation.as_deref(),
        )
    })
    .await
    .map_err(|err| AppError::internal(err.to_string()))??;
    let status = if outcome.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(SubmitReportResponse {
            run_id: outcome.run_id,
        }),
    ))
}

// ---- admin: enroll tokens ----

#[derive(Deserialize)]
pub struct CreateEnrollTokenBody {
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Serialize)]
pub struct CreateEnrollTokenResponse {
    pub id: Uuid,
    pub enroll_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn create_enroll_token(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Json(body): Json<CreateEnrollTokenBody>,
) -> Result<Json<CreateEnrollTokenResponse>, AppError> {
    let (record, minted) = state.store.mint_enroll_token(
        &state.tokens,
        &admin.audit,
        admin.tenant.id,
        body.expires_at,
        body.note,
    )?;
    // The raw token appears in this response and nowhere else.
    Ok(Json(CreateEnrollTokenResponse {
        id: record.id,
        enroll_token: minted.raw,
        expires_at: record.expires_at,
    }))
}

pub async fn list_enroll_tokens(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
) -> Result<Json<Vec<EnrollToken>>, AppError> {
    Ok(Json(state.store.list_enroll_tokens(admin.tenant.id)?))
}

pub async fn revoke_enroll_token(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Path(token_id): Path<Uuid>,
) -> Result<Json<EnrollToken>, AppError> {
    let token = state
        .store
        .revoke_enroll_token(&admin.audit, admin.tenant.id, token_id)?;
    Ok(Json(token))
}

// ---- admin: devices ----

#[derive(Deserialize)]
pub struct DevicesQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub include_health: Option<bool>,
    #[serde(default)]
    pub stale_after_seconds: Option<i64>,
    #[serde(default)]
    pub offline_after_seconds: Option<i64>,
}

#[derive(Serialize)]
pub struct DeviceHealth {
    pub status: &'static str,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub seen_age_seconds: Option<i64>,
    pub run_age_seconds: Option<i64>,
    pub stale: bool,
    pub offline: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

#[derive(Serialize)]
pub struct DeviceSummaryOut {
    #[serde(flatten)]
    pub device: Device,
    pub last_run: Option<Run>,
    pub health: Option<DeviceHealth>,
}

#[derive(Serialize)]
pub struct DevicesListResponse {
    pub items: Vec<DeviceSummaryOut>,
    pub limit: usize,
    pub offset: usize,
    pub total: i64,
}

pub async fn list_devices(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Query(query): Query<DevicesQuery>,
) -> Result<Json<DevicesListResponse>, AppError> {
    let (limit, offset) = page_bounds(query.limit, query.offset);
    let stale_after = query
        .stale_after_seconds
        .unwrap_or(DEFAULT_STALE_AFTER_SECONDS);
    let offline_after = query
        .offline_after_seconds
        .unwrap_or(DEFAULT_OFFLINE_AFTER_SECONDS);
    let include_health = query.include_health.unwrap_or(false);

    let (devices, total) = state.store.list_devices(admin.tenant.id, limit, offset)?;
    let mut latest = state.store.latest_runs_by_device(admin.tenant.id)?;
    let now = control_plane::utcnow();

    let items = devices
        .into_iter()
        .map(|device| {
            let last_run = latest.remove(&device.id);
            let health = (include_health
                || last_run.is_some()
                || device.last_seen_at.is_some())
            .then(|| compute_health(&device, last_run.as_ref(), now, stale_after, offline_after));
            DeviceSummaryOut {
                device,
                last_run,
                health,
            }
        })
        .collect();

    Ok(Json(DevicesListResponse {
        items,
        limit,
        offset,
        total,
    }))
}

fn compute_health(
    device: &Device,
    last_run: Option<&Run>,
    now: DateTime<Utc>,
    stale_after_seconds: i64,
    offline_after_seconds: i64,
) -> DeviceHealth {
    let last_run_at = last_run.map(|run| run.ended_at.unwrap_or(run.started_at));
    let last_run_status = last_run.map(|run| run.status);
    let seen_age_seconds = device
        .last_seen_at
        .map(|seen| (now - seen).num_seconds());
    let run_age_seconds = last_run_at.map(|at| (now - at).num_seconds());

    let offline = seen_age_seconds.map_or(true, |age| age > offline_after_seconds);
    let stale = run_age_seconds.map_or(true, |age| age > stale_after_seconds);
    let last_run_failed = matches!(
        last_run_status,
        Some(status) if status != RunStatus::Succeeded
    );

    let (status, reason) = if offline {
        ("offline", Some("device has not checked in recently"))
    } else if last_run_failed {
        ("warn", Some("latest run failed"))
    } else if stale {
        ("warn", Some("stale"))
    } else {
        ("ok", None)
    };

    DeviceHealth {
        status,
        last_run_at,
        last_run_status,
        seen_age_seconds,
        run_age_seconds,
        stale,
        offline,
        reason,
    }
}

#[derive(Serialize)]
pub struct AssignmentOut {
    pub assignment_id: Uuid,
    pub policy_id: Uuid,
    pub policy_name: String,
    pub priority: i64,
    pub mode: AssignmentMode,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct CompiledResourceOut {
    pub key: String,
    #[serde(flatten)]
    pub source: ResourceSource,
}

#[derive(Serialize)]
pub struct CompileOut {
    pub resources: Vec<CompiledResourceOut>,
    pub conflicts: Vec<Conflict>,
    pub skipped: Vec<SkippedAssignment>,
}

#[derive(Serialize)]
pub struct EffectivePolicyDebug {
    pub hash: String,
    pub document: PolicyDocument,
    pub mode_by_key: BTreeMap<String, AssignmentMode>,
    pub compile: CompileOut,
}

#[derive(Serialize)]
pub struct LastRunOut {
    #[serde(flatten)]
    pub run: Run,
    #[serde(flatten)]
    pub rollup: RunRollup,
    pub duration_ms: Option<i64>,
}

#[derive(Serialize)]
pub struct DeviceDebugResponse {
    pub device: Device,
    pub assignments: Vec<AssignmentOut>,
    pub effective_policy: EffectivePolicyDebug,
    pub last_run: Option<LastRunOut>,
    pub last_run_items: Vec<RunItem>,
}

/// Operator "debug this device" bundle: identity, ordered assignments,
/// compile output with its conflict report, and the most recent run.
pub async fn debug_device(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Path(device_id): Path<Uuid>,
) -> Result<Json<DeviceDebugResponse>, AppError> {
    let device = state
        .store
        .get_device(admin.tenant.id, device_id)?
        .ok_or_else(|| AppError::not_found("device not found"))?;

    let assignments = state
        .store
        .list_assignments(admin.tenant.id, device_id)?
        .into_iter()
        .map(|(assignment, policy)| AssignmentOut {
            assignment_id: assignment.id,
            policy_id: policy.id,
            policy_name: policy.name,
            priority: assignment.priority,
            mode: assignment.mode,
            is_active: policy.is_active,
            created_at: assignment.created_at,
        })
        .collect();

    let compiled = state
        .store
        .compile_effective_policy(admin.tenant.id, device_id)?;
    let resources = compiled
        .sources_by_key
        .iter()
        .map(|(key, source)| CompiledResourceOut {
            key: key.clone(),
            source: source.clone(),
        })
        .collect();

    let (last_run, last_run_items) = match state.store.last_run(admin.tenant.id, device_id)? {
        Some((run, items)) => {
            let rollup = rollup_items(&items);
            let duration_ms = run
                .ended_at
                .map(|ended| (ended - run.started_at).num_milliseconds());
            (
                Some(LastRunOut {
                    run,
                    rollup,
                    duration_ms,
                }),
                items,
            )
        }
        None => (None, Vec::new()),
    };

    Ok(Json(DeviceDebugResponse {
        device,
        assignments,
        effective_policy: EffectivePolicyDebug {
            hash: compiled.hash,
            document: compiled.document,
            mode_by_key: compiled.mode_by_key,
            compile: CompileOut {
                resources,
                conflicts: compiled.conflicts,
                skipped: compiled.skipped,
            },
        },
        last_run,
        last_run_items,
    }))
}

#[derive(Serialize)]
pub struct DeleteDeviceResponse {
    pub device_id: Uuid,
    pub status: DeviceStatus,
    pub revoked_tokens: bool,
}

pub async fn delete_device(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Path(device_id): Path<Uuid>,
) -> Result<Json<DeleteDeviceResponse>, AppError> {
    let device = state
        .store
        .soft_delete_device(&admin.audit, admin.tenant.id, device_id)?;
    Ok(Json(DeleteDeviceResponse {
        device_id: device.id,
        status: device.status,
        revoked_tokens: true,
    }))
}

#[derive(Serialize)]
pub struct RestoreDeviceResponse {
    pub device_id: Uuid,
    pub status: DeviceStatus,
    pub device_token: String,
}

pub async fn restore_device(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Path(device_id): Path<Uuid>,
) -> Result<Json<RestoreDeviceResponse>, AppError> {
    let (device, minted) =
        state
            .store
            .restore_device(&state.tokens, &admin.audit, admin.tenant.id, device_id)?;
    Ok(Json(RestoreDeviceResponse {
        device_id: device.id,
        status: device.status,
        device_token: minted.raw,
    }))
}

#[derive(Serialize)]
pub struct RevokeTokenResponse {
    pub device_id: Uuid,
    pub device_token: String,
    pub prefix: String,
}

pub async fn revoke_device_token(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Path(device_id): Path<Uuid>,
) -> Result<Json<RevokeTokenResponse>, AppError> {
    let (device, minted) = state.store.revoke_device_token(
        &state.tokens,
        &admin.audit,
        admin.tenant.id,
        device_id,
    )?;
    Ok(Json(RevokeTokenResponse {
        device_id: device.id,
        device_token: minted.raw,
        prefix: minted.prefix,
    }))
}

pub async fn device_token_history(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Path(device_id): Path<Uuid>,
) -> Result<Json<Vec<DeviceAuthToken>>, AppError> {
    require_device(&state, admin.tenant.id, device_id)?;
    Ok(Json(state.store.token_history(admin.tenant.id, device_id)?))
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Serialize)]
pub struct RunWithRollup {
    #[serde(flatten)]
    pub run: Run,
    #[serde(flatten)]
    pub rollup: RunRollup,
    pub duration_ms: Option<i64>,
}

#[derive(Serialize)]
pub struct DeviceRunsResponse {
    pub device_id: Uuid,
    pub items: Vec<RunWithRollup>,
    pub limit: usize,
    pub offset: usize,
    pub total: i64,
}

pub async fn device_runs(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Path(device_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> Result<Json<DeviceRunsResponse>, AppError> {
    require_device(&state, admin.tenant.id, device_id)?;
    let (limit, offset) = page_bounds(query.limit, query.offset);
    let (runs, total) = state
        .store
        .list_runs(admin.tenant.id, Some(device_id), limit, offset)?;

    let mut items = Vec::with_capacity(runs.len());
    for run in runs {
        let rollup = rollup_from_summary(&run.summary)
            .map(Ok)
            .unwrap_or_else(|| state.store.run_rollup(run.id))?;
        let duration_ms = summary_int(&run.summary, &["duration_ms", "durationMs"]).or_else(|| {
            run.ended_at
                .map(|ended| (ended - run.started_at).num_milliseconds())
        });
        items.push(RunWithRollup {
            run,
            rollup,
            duration_ms,
        });
    }

    Ok(Json(DeviceRunsResponse {
        device_id,
        items,
        limit,
        offset,
        total,
    }))
}

// ---- admin: policies & assignments ----

#[derive(Deserialize)]
pub struct UpsertPolicyBody {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub document: Value,
}

#[derive(Serialize)]
pub struct UpsertPolicyResponse {
    pub policy_id: Uuid,
    pub name: String,
    pub is_active: bool,
}

pub async fn upsert_policy(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Json(body): Json<UpsertPolicyBody>,
) -> Result<Json<UpsertPolicyResponse>, AppError> {
    if body.name.trim().is_empty() {
        return Err(AppError::schema("policy name is required"));
    }
    let request = UpsertPolicy {
        name: body.name.trim().to_string(),
        description: body.description,
        schema_version: body.schema_version,
        is_active: body.is_active,
        document: body.document,
    };
    let policy = state
        .store
        .upsert_policy(&admin.audit, admin.tenant.id, &request)?;
    Ok(Json(UpsertPolicyResponse {
        policy_id: policy.id,
        name: policy.name,
        is_active: policy.is_active,
    }))
}

#[derive(Serialize)]
pub struct PolicySummaryOut {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub schema_version: String,
    pub is_active: bool,
    pub resource_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub async fn list_policies(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
) -> Result<Json<Vec<PolicySummaryOut>>, AppError> {
    let policies = state.store.list_policies(admin.tenant.id)?;
    Ok(Json(
        policies
            .into_iter()
            .map(|policy| PolicySummaryOut {
                id: policy.id,
                name: policy.name,
                description: policy.description,
                schema_version: policy.schema_version,
                is_active: policy.is_active,
                resource_count: policy.document.resources.len(),
                created_at: policy.created_at,
                updated_at: policy.updated_at,
            })
            .collect(),
    ))
}

pub async fn get_policy(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Path(policy_id): Path<Uuid>,
) -> Result<Json<control_plane::Policy>, AppError> {
    let policy = state
        .store
        .get_policy(admin.tenant.id, policy_id)?
        .ok_or_else(|| AppError::not_found("policy not found"))?;
    Ok(Json(policy))
}

#[derive(Deserialize)]
pub struct AssignPolicyBody {
    pub device_id: Uuid,
    pub policy_name: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub mode: Option<String>,
}

pub async fn assign_policy(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Json(body): Json<AssignPolicyBody>,
) -> Result<Json<AssignmentOut>, AppError> {
    let mode = match body.mode.as_deref() {
        None => AssignmentMode::Enforce,
        Some(raw) => AssignmentMode::parse(raw.trim())
            .ok_or_else(|| AppError::schema("mode must be 'enforce' or 'audit'"))?,
    };
    let request = AssignPolicy {
        device_id: body.device_id,
        policy_name: body.policy_name,
        priority: body.priority,
        mode,
    };
    let assignment = state
        .store
        .assign_policy(&admin.audit, admin.tenant.id, &request)?;
    let policy = state
        .store
        .get_policy(admin.tenant.id, assignment.policy_id)?
        .ok_or_else(|| AppError::not_found("policy not found"))?;
    Ok(Json(AssignmentOut {
        assignment_id: assignment.id,
        policy_id: assignment.policy_id,
        policy_name: policy.name,
        priority: assignment.priority,
        mode: assignment.mode,
        is_active: policy.is_active,
        created_at: assignment.created_at,
    }))
}

#[derive(Serialize)]
pub struct DeviceAssignmentsResponse {
    pub device_id: Uuid,
    pub assignments: Vec<AssignmentOut>,
}

pub async fn list_device_assignments(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Path(device_id): Path<Uuid>,
) -> Result<Json<DeviceAssignmentsResponse>, AppError> {
    require_device(&state, admin.tenant.id, device_id)?;
    let assignments = state
        .store
        .list_assignments(admin.tenant.id, device_id)?
        .into_iter()
        .map(|(assignment, policy)| AssignmentOut {
            assignment_id: assignment.id,
            policy_id: policy.id,
            policy_name: policy.name,
            priority: assignment.priority,
            mode: assignment.mode,
            is_active: policy.is_active,
            created_at: assignment.created_at,
        })
        .collect();
    Ok(Json(DeviceAssignmentsResponse {
        device_id,
        assignments,
    }))
}

#[derive(Serialize)]
pub struct ClearAssignmentsResponse {
    pub device_id: Uuid,
    pub removed: usize,
}

pub async fn clear_device_assignments(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Path(device_id): Path<Uuid>,
) -> Result<Json<ClearAssignmentsResponse>, AppError> {
    require_device(&state, admin.tenant.id, device_id)?;
    let removed = state
        .store
        .clear_assignments(&admin.audit, admin.tenant.id, device_id)?;
    Ok(Json(ClearAssignmentsResponse { device_id, removed }))
}

#[derive(Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

pub async fn remove_device_assignment(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Path((device_id, policy_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<OkResponse>, AppError> {
    state
        .store
        .remove_assignment(&admin.audit, admin.tenant.id, device_id, policy_id)?;
    Ok(Json(OkResponse { ok: true }))
}

// ---- admin: runs ----

#[derive(Deserialize)]
pub struct RunsQuery {
    #[serde(default)]
    pub device_id: Option<Uuid>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Serialize)]
pub struct RunsListResponse {
    pub items: Vec<Run>,
    pub limit: usize,
    pub offset: usize,
    pub total: i64,
}

pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<RunsListResponse>, AppError> {
    let (limit, offset) = page_bounds(query.limit, query.offset);
    let (items, total) = state
        .store
        .list_runs(admin.tenant.id, query.device_id, limit, offset)?;
    Ok(Json(RunsListResponse {
        items,
        limit,
        offset,
        total,
    }))
}

#[derive(Serialize)]
pub struct RunDetailResponse {
    #[serde(flatten)]
    pub run: Run,
    pub items: Vec<RunItem>,
    pub logs: Vec<LogEvent>,
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunDetailResponse>, AppError> {
    let detail = state
        .store
        .get_run(admin.tenant.id, run_id)?
        .ok_or_else(|| AppError::not_found("run not found"))?;
    Ok(Json(RunDetailResponse {
        run: detail.run,
        items: detail.items,
        logs: detail.logs,
    }))
}

// ---- admin: audit & maintenance ----

#[derive(Deserialize)]
pub struct AuditQueryParams {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn list_audit(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Query(params): Query<AuditQueryParams>,
) -> Result<Json<control_plane::AuditPage>, AppError> {
    let cursor = params
        .cursor
        .as_deref()
        .map(|raw| {
            control_plane::decode_cursor(raw)
                .ok_or_else(|| AppError::bad_request("invalid audit cursor"))
        })
        .transpose()?;
    let query = AuditQuery {
        action: params.action,
        target_type: params.target_type,
        target_id: params.target_id,
        cursor,
        limit: params.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
    };
    Ok(Json(state.store.audit_page(admin.tenant.id, &query)?))
}

#[derive(Deserialize)]
pub struct PruneBody {
    pub keep_days: i64,
    pub keep_runs_per_device: i64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub dry_run: bool,
}

pub async fn prune_runs(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminContext>,
    Json(body): Json<PruneBody>,
) -> Result<Json<control_plane::PruneOutcome>, AppError> {
    let request = PruneRequest {
        keep_days: body.keep_days,
        keep_runs_per_device: body.keep_runs_per_device,
        batch_size: body.batch_size,
        dry_run: body.dry_run,
    };
    // Retention sweeps delete in batches and can take a while.
    let store = state.store.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        store.prune_runs(&admin.audit, admin.tenant.id, &request)
    })
    .await
    .map_err(|err| AppError::internal(err.to_string()))??;
    Ok(Json(outcome))
}

// ---- helpers ----

fn require_device(state: &AppState, tenant_id: Uuid, device_id: Uuid) -> Result<Device, AppError> {
    state
        .store
        .get_device(tenant_id, device_id)?
        .ok_or_else(|| AppError::not_found("device not found"))
}

fn page_bounds(limit: Option<usize>, offset: Option<usize>) -> (usize, usize) {
    let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
    (limit, offset.unwrap_or(0))
}

fn rollup_from_summary(summary: &Value) -> Option<RunRollup> {
    let items_total = summary_int(summary, &["items_total", "itemsTotal"])?;
    let items_failed = summary_int(summary, &["items_failed", "itemsFailed", "failed"])?;
    let items_changed = summary_int(summary, &["items_changed", "itemsChanged"])?;
    Some(RunRollup {
        items_total,
        items_failed,
        items_changed,
    })
}

fn summary_int(summary: &Value, keys: &[&str]) -> Option<i64> {
    let map = summary.as_object()?;
    for key in keys {
        if let Some(value) = map.get(*key) {
            if let Some(number) = value.as_i64() {
                return Some(number);
            }
            if let Some(text) = value.as_str() {
                if let Ok(number) = text.trim().parse::<i64>() {
                    return Some(number);
                }
            }
        }
    }
    None
}

fn default_priority() -> i64 {
    100
}

fn default_schema_version() -> String {
    "1.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    500
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use chrono::Duration;
    use control_plane::{Settings, Store, TenantContext, TokenCheck};

    use crate::middleware::{AdminContext, CorrelationId};

    fn test_settings() -> Settings {
        let mut values = HashMap::new();
        values.insert(
            "BASELINER_ADMIN_KEY".to_string(),
            "test-admin-key".to_string(),
        );
        values.insert(
            "BASELINER_TOKEN_PEPPER".to_string(),
            "test-pepper".to_string(),
        );
        Settings::from_map(&values).expect("settings")
    }

    fn test_state() -> Arc<AppState> {
        let store = Store::open_in_memory().expect("store");
        Arc::new(AppState::with_store(test_settings(), store))
    }

    fn admin() -> AdminContext {
        AdminContext {
            tenant: TenantContext::default(),
            audit: AuditContext::admin("test-admin"),
        }
    }

    fn admin_for(tenant: TenantContext) -> AdminContext {
        AdminContext {
            tenant,
            audit: AuditContext::admin("test-admin"),
        }
    }

    fn generated_cid() -> CorrelationId {
        CorrelationId {
            value: Uuid::new_v4().to_string(),
            client_supplied: false,
        }
    }

    fn client_cid(value: &str) -> CorrelationId {
        CorrelationId {
            value: value.to_string(),
            client_supplied: true,
        }
    }

    async fn mint_enroll_token(state: &Arc<AppState>) -> String {
        let Json(response) = create_enroll_token(
            State(state.clone()),
            Extension(admin()),
            Json(CreateEnrollTokenBody {
                expires_at: None,
                note: None,
            }),
        )
        .await
        .expect("mint enroll token");
        response.enroll_token
    }

    async fn enroll_device(state: &Arc<AppState>, device_key: &str) -> EnrollResponse {
        let token = mint_enroll_token(state).await;
        let Json(response) = enroll(
            State(state.clone()),
            Extension(generated_cid()),
            Json(EnrollBody {
                enroll_token: token,
                device_key: device_key.to_string(),
                hostname: Some(format!("host-{device_key}")),
                os: Some("windows".to_string()),
                os_version: Some("10.0".to_string()),
                arch: Some("x64".to_string()),
                agent_version: Some("0.1.0".to_string()),
                tags: BTreeMap::new(),
            }),
        )
        .await
        .expect("enroll");
        response
    }

    fn authed(state: &Arc<AppState>, token: &str) -> AuthedDevice {
        let (device, auth_token) = state
            .store
            .authenticate_device(&state.tokens, token)
            .expect("device auth");
        AuthedDevice {
            device,
            token_id: auth_token.id,
        }
    }

    async fn upsert_named_policy(state: &Arc<AppState>, name: &str, resources: Value) {
        upsert_policy(
            State(state.clone()),
            Extension(admin()),
            Json(UpsertPolicyBody {
                name: name.to_string(),
                description: None,
                schema_version: "1.0".to_string(),
                is_active: true,
                document: json!({ "resources": resources }),
            }),
        )
        .await
        .expect("upsert policy");
    }

    async fn assign(state: &Arc<AppState>, device_id: Uuid, policy_name: &str, priority: i64) {
        assign_policy(
            State(state.clone()),
            Extension(admin()),
            Json(AssignPolicyBody {
                device_id,
                policy_name: policy_name.to_string(),
                priority,
                mode: None,
            }),
        )
        .await
        .expect("assign policy");
        // created_at participates in the canonical order; keep assignments
        // from landing in the same microsecond.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    fn report_body(correlation_id: Option<&str>, items: Value) -> ReportSubmission {
        serde_json::from_value(json!({
            "started_at": control_plane::utcnow().to_rfc3339(),
            "ended_at": control_plane::utcnow().to_rfc3339(),
            "status": "succeeded",
            "agent_version": "0.1.0",
            "effective_policy_hash": "0000",
            "summary": {},
            "items": items,
            "logs": [{ "level": "info", "message": "run finished" }],
            "correlation_id": correlation_id,
        }))
        .expect("report body")
    }

    fn item(resource_id: &str) -> Value {
        json!({
            "resource_type": "winget.package",
            "resource_id": resource_id,
            "status_detect": "ok",
            "status_remediate": "skipped",
            "status_validate": "ok",
            "compliant_before": true,
            "compliant_after": true,
        })
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn enroll_token_is_single_use() {
        let state = test_state();
        let token = mint_enroll_token(&state).await;

        let first = enroll(
            State(state.clone()),
            Extension(generated_cid()),
            Json(EnrollBody {
                enroll_token: token.clone(),
                device_key: "DEV1".to_string(),
                hostname: None,
                os: None,
                os_version: None,
                arch: None,
                agent_version: None,
                tags: BTreeMap::new(),
            }),
        )
        .await;
        assert!(first.is_ok());

        let second = enroll(
            State(state.clone()),
            Extension(generated_cid()),
            Json(EnrollBody {
                enroll_token: token,
                device_key: "DEV2".to_string(),
                hostname: None,
                os: None,
                os_version: None,
                arch: None,
                agent_version: None,
                tags: BTreeMap::new(),
            }),
        )
        .await;
        let err = second.err().expect("second enroll rejected");
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.kind(), "auth.invalid");
    }

    #[tokio::test]
    async fn expired_enroll_token_rejected() {
        let state = test_state();
        let Json(minted) = create_enroll_token(
            State(state.clone()),
            Extension(admin()),
            Json(CreateEnrollTokenBody {
                expires_at: Some(control_plane::utcnow() - Duration::hours(1)),
                note: None,
            }),
        )
        .await
        .expect("mint");

        let result = enroll(
            State(state.clone()),
            Extension(generated_cid()),
            Json(EnrollBody {
                enroll_token: minted.enroll_token,
                device_key: "DEV1".to_string(),
                hostname: None,
                os: None,
                os_version: None,
                arch: None,
                agent_version: None,
                tags: BTreeMap::new(),
            }),
        )
        .await;
        let err = result.err().expect("expired token rejected");
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn re_enroll_same_key_rotates_token() {
        let state = test_state();
        let first = enroll_device(&state, "DEV1").await;
        let second = enroll_device(&state, "DEV1").await;
        assert_eq!(first.device_id, second.device_id);

        let old = state
            .store
            .authenticate_device(&state.tokens, &first.device_token);
        assert!(matches!(
            old,
            Err(control_plane::RegistryError::DeviceToken(TokenCheck::Revoked))
        ));
        assert!(state
            .store
            .authenticate_device(&state.tokens, &second.device_token)
            .is_ok());
    }

    #[tokio::test]
    async fn tied_priority_resolves_first_wins() {
        let state = test_state();
        let enrolled = enroll_device(&state, "DEV1").await;
        upsert_named_policy(
            &state,
            "P_A",
            json!([{ "type": "winget.package", "id": "putty", "package_id": "PuTTY.PuTTY", "ensure": "present" }]),
        )
        .await;
        upsert_named_policy(
            &state,
            "P_B",
            json!([{ "type": "winget.package", "id": "putty", "package_id": "PuTTY.PuTTY", "ensure": "absent" }]),
        )
        .await;
        assign(&state, enrolled.device_id, "P_A", 100).await;
        assign(&state, enrolled.device_id, "P_B", 100).await;

        let Json(effective) = get_device_policy(
            State(state.clone()),
            Extension(authed(&state, &enrolled.device_token)),
        )
        .await
        .expect("device policy");
        assert_eq!(effective.document.resources.len(), 1);

        let Json(debug) = debug_device(
            State(state.clone()),
            Extension(admin()),
            Path(enrolled.device_id),
        )
        .await
        .expect("debug bundle");
        assert_eq!(debug.effective_policy.compile.conflicts.len(), 1);
        let conflict = &debug.effective_policy.compile.conflicts[0];
        assert_eq!(conflict.key, "winget.package/putty");
        assert_eq!(conflict.winner.policy_name, "P_A");
        assert_eq!(conflict.loser.policy_name, "P_B");
        assert_eq!(conflict.reason, "first-wins-by-priority");
        assert_eq!(debug.effective_policy.hash, effective.effective_policy_hash);
    }

    #[tokio::test]
    async fn lower_priority_number_wins() {
        let state = test_state();
        let enrolled = enroll_device(&state, "DEV1").await;
        upsert_named_policy(
            &state,
            "P_A",
            json!([{ "type": "script.powershell", "id": "marker", "script": "Set-Content a" }]),
        )
        .await;
        upsert_named_policy(
            &state,
            "P_B",
            json!([{ "type": "script.powershell", "id": "marker", "script": "Set-Content b" }]),
        )
        .await;
        assign(&state, enrolled.device_id, "P_A", 200).await;
        assign(&state, enrolled.device_id, "P_B", 100).await;

        let Json(debug) = debug_device(
            State(state.clone()),
            Extension(admin()),
            Path(enrolled.device_id),
        )
        .await
        .expect("debug bundle");
        let source = debug
            .effective_policy
            .compile
            .resources
            .iter()
            .find(|entry| entry.key == "script.powershell/marker")
            .expect("compiled resource");
        assert_eq!(source.source.policy_name, "P_B");
    }

    #[tokio::test]
    async fn compile_is_deterministic_across_calls() {
        let state = test_state();
        let enrolled = enroll_device(&state, "DEV1").await;
        upsert_named_policy(
            &state,
            "base",
            json!([
                { "type": "winget.package", "id": "putty", "package_id": "PuTTY.PuTTY" },
                { "type": "script.powershell", "id": "marker", "script": "Write-Output hi" },
            ]),
        )
        .await;
        assign(&state, enrolled.device_id, "base", 100).await;

        let first = state
            .store
            .compile_effective_policy(TenantContext::default().id, enrolled.device_id)
            .expect("compile");
        let second = state
            .store
            .compile_effective_policy(TenantContext::default().id, enrolled.device_id)
            .expect("compile again");
        assert_eq!(first.hash, second.hash);
        let first_keys: Vec<_> = first
            .document
            .resources
            .iter()
            .filter_map(|r| r.key())
            .collect();
        let second_keys: Vec<_> = second
            .document
            .resources
            .iter()
            .filter_map(|r| r.key())
            .collect();
        assert_eq!(first_keys, second_keys);
    }

    #[tokio::test]
    async fn report_ingest_is_idempotent_by_correlation() {
        let state = test_state();
        let enrolled = enroll_device(&state, "DEV1").await;

        let (status, Json(first)) = submit_report(
            State(state.clone()),
            Extension(authed(&state, &enrolled.device_token)),
            Extension(generated_cid()),
            Json(report_body(Some("cid-abc"), json!([item("putty")]))),
        )
        .await
        .expect("first report");
        assert_eq!(status, StatusCode::CREATED);

        let (status, Json(second)) = submit_report(
            State(state.clone()),
            Extension(authed(&state, &enrolled.device_token)),
            Extension(generated_cid()),
            Json(report_body(Some("cid-abc"), json!([item("putty")]))),
        )
        .await
        .expect("replayed report");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first.run_id, second.run_id);

        let Json(detail) = get_run(
            State(state.clone()),
            Extension(admin()),
            Path(first.run_id),
        )
        .await
        .expect("run detail");
        assert_eq!(detail.run.correlation_id.as_deref(), Some("cid-abc"));
    }

    #[tokio::test]
    async fn header_correlation_id_is_persisted() {
        let state = test_state();
        let enrolled = enroll_device(&state, "DEV1").await;

        let (_, Json(response)) = submit_report(
            State(state.clone()),
            Extension(authed(&state, &enrolled.device_token)),
            Extension(client_cid("cid-from-header")),
            Json(report_body(None, json!([]))),
        )
        .await
        .expect("report");

        let Json(detail) = get_run(
            State(state.clone()),
            Extension(admin()),
            Path(response.run_id),
        )
        .await
        .expect("run detail");
        assert_eq!(
            detail.run.correlation_id.as_deref(),
            Some("cid-from-header")
        );
    }

    #[tokio::test]
    async fn malformed_item_aborts_whole_report() {
        let state = test_state();
        let enrolled = enroll_device(&state, "DEV1").await;

        let items = json!([
            item("one"),
            item("two"),
            item("three"),
            { "resource_type": "winget.package", "resource_id": "" },
        ]);
        let result = submit_report(
            State(state.clone()),
            Extension(authed(&state, &enrolled.device_token)),
            Extension(generated_cid()),
            Json(report_body(None, items)),
        )
        .await;
        let err = result.err().expect("rejected report");
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.kind(), "input.schema");

        let Json(runs) = list_runs(
            State(state.clone()),
            Extension(admin()),
            Query(RunsQuery {
                device_id: None,
                limit: None,
                offset: None,
            }),
        )
        .await
        .expect("list runs");
        assert_eq!(runs.total, 0);
        assert!(runs.items.is_empty());
    }

    #[tokio::test]
    async fn oversized_item_count_rejected() {
        let state = test_state();
        let enrolled = enroll_device(&state, "DEV1").await;

        let too_many: Vec<Value> = (0..state.settings.max_report_items + 1)
            .map(|index| item(&format!("res-{index}")))
            .collect();
        let result = submit_report(
            State(state.clone()),
            Extension(authed(&state, &enrolled.device_token)),
            Extension(generated_cid()),
            Json(report_body(None, Value::Array(too_many))),
        )
        .await;
        let err = result.err().expect("rejected report");
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(err.kind(), "input.too_large");
    }

    #[tokio::test]
    async fn token_rotation_blocks_old_token() {
        let state = test_state();
        let enrolled = enroll_device(&state, "DEV1").await;

        let Json(rotated) = revoke_device_token(
            State(state.clone()),
            Extension(admin()),
            Path(enrolled.device_id),
        )
        .await
        .expect("rotate");

        let old = state
            .store
            .authenticate_device(&state.tokens, &enrolled.device_token);
        assert!(matches!(
            old,
            Err(control_plane::RegistryError::DeviceToken(TokenCheck::Revoked))
        ));

        let (status, _) = submit_report(
            State(state.clone()),
            Extension(authed(&state, &rotated.device_token)),
            Extension(generated_cid()),
            Json(report_body(None, json!([]))),
        )
        .await
        .expect("report with fresh token");
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn soft_delete_restore_lifecycle() {
        let state = test_state();
        let enrolled = enroll_device(&state, "DEV1").await;

        let Json(deleted) = delete_device(
            State(state.clone()),
            Extension(admin()),
            Path(enrolled.device_id),
        )
        .await
        .expect("soft delete");
        assert_eq!(deleted.status, DeviceStatus::Inactive);
        assert!(deleted.revoked_tokens);

        assert!(state
            .store
            .authenticate_device(&state.tokens, &enrolled.device_token)
            .is_err());

        // Enrolling a deactivated device is a lifecycle conflict.
        let token = mint_enroll_token(&state).await;
        let blocked = enroll(
            State(state.clone()),
            Extension(generated_cid()),
            Json(EnrollBody {
                enroll_token: token,
                device_key: "DEV1".to_string(),
                hostname: None,
                os: None,
                os_version: None,
                arch: None,
                agent_version: None,
                tags: BTreeMap::new(),
            }),
        )
        .await;
        assert_eq!(
            blocked.err().expect("enroll blocked").status(),
            StatusCode::CONFLICT
        );

        let Json(restored) = restore_device(
            State(state.clone()),
            Extension(admin()),
            Path(enrolled.device_id),
        )
        .await
        .expect("restore");
        assert_eq!(restored.status, DeviceStatus::Active);
        assert!(state
            .store
            .authenticate_device(&state.tokens, &restored.device_token)
            .is_ok());

        // Restoring an active device is a conflict.
        let again = restore_device(
            State(state.clone()),
            Extension(admin()),
            Path(enrolled.device_id),
        )
        .await;
        assert_eq!(
            again.err().expect("restore blocked").status(),
            StatusCode::CONFLICT
        );
    }

    #[tokio::test]
    async fn tenant_isolation_hides_other_tenants_rows() {
        let state = test_state();
        let enrolled = enroll_device(&state, "DEV1").await;
        let other = admin_for(TenantContext::new(Uuid::from_u128(2)));

        let debug = debug_device(
            State(state.clone()),
            Extension(other.clone()),
            Path(enrolled.device_id),
        )
        .await;
        assert_eq!(
            debug.err().expect("cross-tenant read blocked").status(),
            StatusCode::NOT_FOUND
        );

        let Json(devices) = list_devices(
            State(state.clone()),
            Extension(other),
            Query(DevicesQuery {
                limit: None,
                offset: None,
                include_health: None,
                stale_after_seconds: None,
                offline_after_seconds: None,
            }),
        )
        .await
        .expect("list devices");
        assert_eq!(devices.total, 0);
        assert!(devices.items.is_empty());
    }

    #[tokio::test]
    async fn admin_mutations_emit_one_audit_row_each() {
        let state = test_state();
        let enrolled = enroll_device(&state, "DEV1").await;
        upsert_named_policy(
            &state,
            "base",
            json!([{ "type": "winget.package", "id": "putty", "package_id": "PuTTY.PuTTY" }]),
        )
        .await;
        assign(&state, enrolled.device_id, "base", 100).await;

        let Json(assignments) = list_device_assignments(
            State(state.clone()),
            Extension(admin()),
            Path(enrolled.device_id),
        )
        .await
        .expect("assignments");
        remove_device_assignment(
            State(state.clone()),
            Extension(admin()),
            Path((enrolled.device_id, assignments.assignments[0].policy_id)),
        )
        .await
        .expect("remove assignment");

        delete_device(
            State(state.clone()),
            Extension(admin()),
            Path(enrolled.device_id),
        )
        .await
        .expect("soft delete");
        restore_device(
            State(state.clone()),
            Extension(admin()),
            Path(enrolled.device_id),
        )
        .await
        .expect("restore");
        revoke_device_token(
            State(state.clone()),
            Extension(admin()),
            Path(enrolled.device_id),
        )
        .await
        .expect("rotate");

        let Json(page) = list_audit(
            State(state.clone()),
            Extension(admin()),
            Query(AuditQueryParams {
                action: None,
                target_type: None,
                target_id: None,
                cursor: None,
                limit: Some(100),
            }),
        )
        .await
        .expect("audit page");

        let count = |action: &str| {
            page.items
                .iter()
                .filter(|row| row.action == action)
                .count()
        };
        assert_eq!(count("policy.upsert"), 1);
        assert_eq!(count("assignment.create"), 1);
        assert_eq!(count("assignment.delete"), 1);
        assert_eq!(count("device.soft_delete"), 1);
        assert_eq!(count("device.restore"), 1);
        assert_eq!(count("device.revoke_token"), 1);
    }

    #[tokio::test]
    async fn audit_cursor_walks_without_skips_or_repeats() {
        let state = test_state();
        for index in 0..5 {
            upsert_named_policy(
                &state,
                &format!("policy-{index}"),
                json!([{ "type": "winget.package", "id": "putty", "package_id": "PuTTY.PuTTY" }]),
            )
            .await;
            tokio::time::sleep(std::time::Duration::from_millis(3)).await;
        }

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let Json(page) = list_audit(
                State(state.clone()),
                Extension(admin()),
                Query(AuditQueryParams {
                    action: Some("policy.upsert".to_string()),
                    target_type: None,
                    target_id: None,
                    cursor: cursor.clone(),
                    limit: Some(2),
                }),
            )
            .await
            .expect("audit page");
            seen.extend(page.items.iter().map(|row| row.id));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen.len(), 5);
        let unique: std::collections::HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test]
    async fn invalid_audit_cursor_rejected() {
        let state = test_state();
        let result = list_audit(
            State(state.clone()),
            Extension(admin()),
            Query(AuditQueryParams {
                action: None,
                target_type: None,
                target_id: None,
                cursor: Some("not-a-cursor!!".to_string()),
                limit: None,
            }),
        )
        .await;
        assert_eq!(
            result.err().expect("cursor rejected").status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn prune_dry_run_reports_without_deleting() {
        let state = test_state();
        let enrolled = enroll_device(&state, "DEV1").await;
        for _ in 0..3 {
            submit_report(
                State(state.clone()),
                Extension(authed(&state, &enrolled.device_token)),
                Extension(generated_cid()),
                Json(report_body(None, json!([item("putty")]))),
            )
            .await
            .expect("report");
            tokio::time::sleep(std::time::Duration::from_millis(3)).await;
        }

        let Json(preview) = prune_runs(
            State(state.clone()),
            Extension(admin()),
            Json(PruneBody {
                keep_days: 0,
                keep_runs_per_device: 1,
                batch_size: 10,
                dry_run: true,
            }),
        )
        .await
        .expect("dry run");
        assert!(preview.dry_run);
        assert_eq!(preview.runs_targeted, 2);

        let Json(runs) = list_runs(
            State(state.clone()),
            Extension(admin()),
            Query(RunsQuery {
                device_id: None,
                limit: None,
                offset: None,
            }),
        )
        .await
        .expect("runs after dry run");
        assert_eq!(runs.total, 3);

        let Json(outcome) = prune_runs(
            State(state.clone()),
            Extension(admin()),
            Json(PruneBody {
                keep_days: 0,
                keep_runs_per_device: 1,
                batch_size: 10,
                dry_run: false,
            }),
        )
        .await
        .expect("prune");
        assert_eq!(outcome.counts.runs, 2);

        let Json(runs) = list_runs(
            State(state.clone()),
            Extension(admin()),
            Query(RunsQuery {
                device_id: None,
                limit: None,
                offset: None,
            }),
        )
        .await
        .expect("runs after prune");
        assert_eq!(runs.total, 1);
    }

    #[test]
    fn health_classification_covers_ok_warn_offline() {
        let now = control_plane::utcnow();
        let device = |seen: Option<DateTime<Utc>>| Device {
            id: Uuid::new_v4(),
            tenant_id: TenantContext::default().id,
            device_key: "DEV1".to_string(),
            hostname: None,
            os: None,
            os_version: None,
            arch: None,
            agent_version: None,
            tags: BTreeMap::new(),
            status: DeviceStatus::Active,
            created_at: now,
            last_seen_at: seen,
            deleted_at: None,
        };
        let run = |status: RunStatus, age_seconds: i64| Run {
            id: Uuid::new_v4(),
            tenant_id: TenantContext::default().id,
            device_id: Uuid::new_v4(),
            started_at: now - Duration::seconds(age_seconds),
            ended_at: Some(now - Duration::seconds(age_seconds)),
            status,
            run_kind: control_plane::RunKind::Baseline,
            agent_version: None,
            effective_policy_hash: None,
            policy_snapshot: json!({}),
            summary: json!({}),
            correlation_id: None,
        };

        let fresh = compute_health(
            &device(Some(now)),
            Some(&run(RunStatus::Succeeded, 10)),
            now,
            1_800,
            3_600,
        );
        assert_eq!(fresh.status, "ok");

        let failed = compute_health(
            &device(Some(now)),
            Some(&run(RunStatus::Failed, 10)),
            now,
            1_800,
            3_600,
        );
        assert_eq!(failed.status, "warn");

        let stale = compute_health(
            &device(Some(now)),
            Some(&run(RunStatus::Succeeded, 7_200)),
            now,
            1_800,
            3_600,
        );
        assert_eq!(stale.status, "warn");
        assert!(stale.stale);

        let offline = compute_health(&device(None), None, now, 1_800, 3_600);
        assert_eq!(offline.status, "offline");
        assert!(offline.offline);
    }
}
