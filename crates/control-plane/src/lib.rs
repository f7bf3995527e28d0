pub mod assignment;
pub mod audit;
pub mod compiler;
pub mod config;
pub mod hashing;
pub mod ingest;
pub mod maintenance;
pub mod models;
pub mod policy;
pub mod rate_limit;
pub mod registry;
pub mod static_config;
pub mod store;
pub mod tenancy;
pub mod token;

pub use assignment::{AssignPolicy, AssignmentError};
pub use audit::{decode_cursor, encode_cursor, AuditContext, AuditPage, AuditQuery};
pub use compiler::{
    compile_assignments, CompileError, CompiledEffectivePolicy, Conflict, ResourceSource,
    SkippedAssignment, CONFLICT_FIRST_WINS,
};
pub use config::{ConfigError, RateLimitSettings, Settings};
pub use hashing::{canonical_json_bytes, hash_canonical_json, sha256_hex};
pub use ingest::{
    rollup_items, IngestError, IngestOutcome, ReportCaps, ReportItem, ReportLog, ReportSubmission,
    RunDetail, RunRollup,
};
pub use maintenance::{MaintenanceError, PruneCounts, PruneOutcome, PruneRequest};
pub use models::{
    utcnow, AssignmentMode, AuditActor, AuditRecord, Device, DeviceAuthToken, DeviceStatus,
    EnrollToken, ItemError, LogEvent, LogLevel, Policy, PolicyAssignment, PolicyDocument, Resource,
    Run, RunItem, RunKind, RunStatus, ScriptPowershell, StepStatus, Tenant, WingetPackage,
};
pub use policy::{
    validate_and_normalize_document, DocumentError, PolicyError, UpsertPolicy,
};
pub use rate_limit::{InMemoryRateLimiter, RateDecision, RateLimiter};
pub use registry::{EnrollOutcome, EnrollRequest, RegistryError};
pub use static_config::{SettingItem, SETTINGS_TABLE};
pub use store::{Store, StoreError};
pub use tenancy::{default_tenant_id, TenantContext, DEFAULT_TENANT_NAME};
pub use token::{MintedToken, TokenCheck, TokenService};
