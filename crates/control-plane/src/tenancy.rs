use uuid::Uuid;

pub const DEFAULT_TENANT_NAME: &str = "default";

/// Phase 0 runs single-tenant: every row belongs to this tenant unless an
/// admin explicitly selects another via X-Tenant-ID.
pub fn default_tenant_id() -> Uuid {
    Uuid::from_u128(1)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TenantContext {
    pub id: Uuid,
}

impl TenantContext {
    pub fn new(id: Uuid) -> Self {
        Self { id }
    }

    /// Resolve the acting tenant from an optional X-Tenant-ID header value.
    /// Missing header falls back to the default tenant; a malformed value is
    /// rejected rather than silently defaulted.
    pub fn from_header(value: Option<&str>) -> Result<Self, String> {
        match value {
            None => Ok(Self::default()),
            Some(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Ok(Self::default());
                }
                Uuid::parse_str(trimmed)
                    .map(Self::new)
                    .map_err(|_| format!("invalid tenant id: {trimmed}"))
            }
        }
    }
}

impl Default for TenantContext {
    fn default() -> Self {
        Self {
            id: default_tenant_id(),
        }
    }
}
