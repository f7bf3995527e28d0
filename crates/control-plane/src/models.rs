use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub fn utcnow() -> DateTime<Utc> {
    Utc::now()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Inactive,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentMode {
    Enforce,
    Audit,
}

impl AssignmentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enforce => "enforce",
            Self::Audit => "audit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "enforce" => Some(Self::Enforce),
            "audit" => Some(Self::Audit),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Partial,
    Failed,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "succeeded" => Some(Self::Succeeded),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Baseline,
    Heartbeat,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Heartbeat => "heartbeat",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "baseline" => Some(Self::Baseline),
            "heartbeat" => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotRun,
    Ok,
    Fail,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotRun => "not_run",
            Self::Ok => "ok",
            Self::Fail => "fail",
            Self::Skipped => "skipped",
        }
    }

    /// Agents have shipped a few spellings over time; map them onto the
    /// stored vocabulary instead of rejecting the whole report.
    pub fn coerce(value: Option<&str>) -> Self {
        let v = value.unwrap_or("").trim().to_lowercase();
        match v.as_str() {
            "" | "none" | "not_run" => Self::NotRun,
            "ok" | "pass" | "passed" => Self::Ok,
            "fail" | "failed" => Self::Fail,
            "skipped" | "skip" => Self::Skipped,
            _ => Self::NotRun,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_run" => Some(Self::NotRun),
            "ok" => Some(Self::Ok),
            "fail" => Some(Self::Fail),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditActor {
    Admin,
    Device,
    System,
}

impl AuditActor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Device => "device",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "device" => Some(Self::Device),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub device_key: String,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub arch: Option<String>,
    pub agent_version: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub status: DeviceStatus,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnrollToken {
    pub id: Uuid,
    pub tenant_id: Uuid,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub used_by_device_id: Option<Uuid>,
    pub note: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceAuthToken {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub prefix: String,
    pub issued_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub replaced_by_id: Option<Uuid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub schema_version: String,
    pub is_active: bool,
    pub document: PolicyDocument,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyAssignment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    pub policy_id: Uuid,
    pub priority: i64,
    pub mode: AssignmentMode,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub run_kind: RunKind,
    pub agent_version: Option<String>,
    pub effective_policy_hash: Option<String>,
    pub policy_snapshot: Value,
    pub summary: Value,
    pub correlation_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunItem {
    pub id: Uuid,
    pub run_id: Uuid,
    pub ordinal: i64,
    pub resource_type: String,
    pub resource_id: String,
    pub name: Option<String>,
    pub status_detect: StepStatus,
    pub status_remediate: StepStatus,
    pub status_validate: StepStatus,
    pub compliant_before: Option<bool>,
    pub compliant_after: Option<bool>,
    pub changed: bool,
    pub reboot_required: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub evidence: Value,
    pub error: Option<ItemError>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEvent {
    pub id: Uuid,
    pub run_id: Uuid,
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub data: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub ts: DateTime<Utc>,
    pub actor: AuditActor,
    pub actor_id: Option<String>,
    pub action: String,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub correlation_id: Option<String>,
    pub request_method: Option<String>,
    pub request_path: Option<String>,
    pub remote_addr: Option<String>,
}

/// Typed policy-document envelope. Known resource types get structured
/// fields; unknown types round-trip verbatim through the `Other` variant so
/// a newer agent schema survives an older server.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Resource {
    #[serde(rename = "winget.package")]
    WingetPackage(WingetPackage),
    #[serde(rename = "script.powershell")]
    ScriptPowershell(ScriptPowershell),
    #[serde(untagged)]
    Other(Map<String, Value>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WingetPackage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub package_id: String,
    #[serde(default = "default_ensure")]
    pub ensure: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScriptPowershell {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_ensure() -> String {
    "present".to_string()
}

impl Resource {
    pub fn resource_type(&self) -> Option<&str> {
        match self {
            Self::WingetPackage(_) => Some("winget.package"),
            Self::ScriptPowershell(_) => Some("script.powershell"),
            Self::Other(map) => map.get("type").and_then(Value::as_str),
        }
    }

    pub fn resource_id(&self) -> Option<&str> {
        match self {
            Self::WingetPackage(r) => Some(r.id.as_str()),
            Self::ScriptPowershell(r) => Some(r.id.as_str()),
            Self::Other(map) => map.get("id").and_then(Value::as_str),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::WingetPackage(r) => r.name.as_deref(),
            Self::ScriptPowershell(r) => r.name.as_deref(),
            Self::Other(map) => map.get("name").and_then(Value::as_str),
        }
    }

    /// Conflict-resolution key, `(type, id)` rendered as `type/id`.
    pub fn key(&self) -> Option<String> {
        match (self.resource_type(), self.resource_id()) {
            (Some(t), Some(i)) if !t.is_empty() && !i.is_empty() => Some(format!("{t}/{i}")),
            _ => None,
        }
    }
}
