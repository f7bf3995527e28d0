use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{write_audit, AuditContext};
use crate::models::{utcnow, Device, DeviceAuthToken, DeviceStatus, EnrollToken};
use crate::store::{
    sql_enum, sql_ts, sql_ts_opt, sql_uuid, sql_uuid_opt, to_ts, to_ts_opt, Store, StoreError,
};
use crate::token::{check_device_token, check_enroll_token, MintedToken, TokenCheck, TokenService};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("device is deactivated")]
    DeviceInactive,
    #[error("lifecycle conflict: {0}")]
    Conflict(String),
    #[error("enroll token rejected")]
    EnrollToken(TokenCheck),
    #[error("device token rejected")]
    DeviceToken(TokenCheck),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

#[derive(Clone, Debug, Default)]
pub struct EnrollRequest {
    pub enroll_token: String,
    pub device_key: String,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub arch: Option<String>,
    pub agent_version: Option<String>,
    pub tags: BTreeMap<String, String>,
}

pub struct EnrollOutcome {
    pub device: Device,
    pub token: MintedToken,
}

impl Store {
    /// Exchange a single-use enroll token for a device identity and a fresh
    /// device token. Idempotent by (tenant, device_key): re-enrolling an
    /// active device updates its metadata and rotates the token.
    pub fn enroll(
        &self,
        tokens: &TokenService,
        ctx: &AuditContext,
        request: &EnrollRequest,
    ) -> Result<EnrollOutcome, RegistryError> {
        let token_hash = tokens.hash(request.enroll_token.trim());
        let now = utcnow();
        self.with_tx(|tx| {
            let enroll_token = find_enroll_token_by_hash(tx, &token_hash)?
                .ok_or(RegistryError::EnrollToken(TokenCheck::NotFound))?;
            match check_enroll_token(&enroll_token, now) {
                TokenCheck::Valid => {}
                check => return Err(RegistryError::EnrollToken(check)),
            }

            let tenant_id = enroll_token.tenant_id;
            let existing = find_device_by_key(tx, tenant_id, &request.device_key)?;

            let (device, minted) = match existing {
                Some(device) if device.status == DeviceStatus::Inactive => {
                    return Err(RegistryError::DeviceInactive);
                }
                Some(mut device) => {
                    merge_metadata(&mut device, request);
                    device.last_seen_at = Some(now);
                    update_device_metadata(tx, &device)?;
                    let (minted, _row) = rotate_device_token(tx, tokens, &device, now)?;
                    (device, minted)
                }
                None => {
                    let device = Device {
                        id: Uuid::new_v4(),
                        tenant_id,
                        device_key: request.device_key.clone(),
                        hostname: request.hostname.clone(),
                        os: request.os.clone(),
                        os_version: request.os_version.clone(),
                        arch: request.arch.clone(),
                        agent_version: request.agent_version.clone(),
                        tags: request.tags.clone(),
                        status: DeviceStatus::Active,
                        created_at: now,
                        last_seen_at: Some(now),
                        deleted_at: None,
                    };
                    insert_device(tx, &device)?;
                    let minted = tokens.mint();
                    insert_device_token(tx, tenant_id, device.id, &minted, now, Some(now))?;
                    (device, minted)
                }
            };

            // Single-use consumption: the conditional update is the guard
            // against a racing enroll presenting the same token.
            let consumed = tx.execute(
                "UPDATE enroll_tokens SET used_at = ?1, used_by_device_id = ?2
                 WHERE id = ?3 AND used_at IS NULL",
                params![to_ts(now), device.id.to_string(), enroll_token.id.to_string()],
            )?;
            if consumed == 0 {
                return Err(RegistryError::EnrollToken(TokenCheck::Used));
            }

            write_audit(
                tx,
                tenant_id,
                ctx,
                "device.enroll",
                "device",
                &device.id.to_string(),
                None,
                Some(&json!({ "device_key": device.device_key, "status": device.status })),
            )?;

            Ok(EnrollOutcome {
                device,
                token: minted,
            })
        })
    }

    pub fn get_device(&self, tenant_id: Uuid, device_id: Uuid) -> Result<Option<Device>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE tenant_id = ?1 AND id = ?2"),
                params![tenant_id.to_string(), device_id.to_string()],
                device_from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })
    }

    pub fn list_devices(
        &self,
        tenant_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Device>, i64), StoreError> {
        self.with_conn(|conn| {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM devices WHERE tenant_id = ?1",
                params![tenant_id.to_string()],
                |row| row.get(0),
            )?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {DEVICE_COLUMNS} FROM devices WHERE tenant_id = ?1
                 ORDER BY last_seen_at DESC, created_at DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let devices = stmt
                .query_map(
                    params![tenant_id.to_string(), limit as i64, offset as i64],
                    device_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok((devices, total))
        })
    }

    /// Soft delete: the row stays for history, authentication is cut off by
    /// revoking the active token and gating on status.
    pub fn soft_delete_device(
        &self,
        ctx: &AuditContext,
        tenant_id: Uuid,
        device_id: Uuid,
    ) -> Result<Device, RegistryError> {
        let now = utcnow();
        self.with_tx(|tx| {
            let mut device = require_device(tx, tenant_id, device_id)?;
            if device.status == DeviceStatus::Inactive {
                return Err(RegistryError::Conflict("device already inactive".to_string()));
            }
            let before = json!({ "status": device.status, "deleted_at": device.deleted_at });
            device.status = DeviceStatus::Inactive;
            device.deleted_at = Some(now);
            tx.execute(
                "UPDATE devices SET status = 'inactive', deleted_at = ?1 WHERE id = ?2",
                params![to_ts(now), device.id.to_string()],
            )?;
            revoke_active_tokens(tx, device.id, now, None)?;
            write_audit(
                tx,
                tenant_id,
                ctx,
                "device.soft_delete",
                "device",
                &device.id.to_string(),
                Some(&before),
                Some(&json!({ "status": device.status, "deleted_at": device.deleted_at })),
            )?;
            Ok(device)
        })
    }

    /// Restore an inactive device. A fresh token is minted because the old
    /// one was revoked at soft-delete time.
    pub fn restore_device(
        &self,
        tokens: &TokenService,
        ctx: &AuditContext,
        tenant_id: Uuid,
        device_id: Uuid,
    ) -> Result<(Device, MintedToken), RegistryError> {
        let now = utcnow();
        self.with_tx(|tx| {
            let mut device = require_device(tx, tenant_id, device_id)?;
            if device.status != DeviceStatus::Inactive {
                return Err(RegistryError::Conflict("device is not inactive".to_string()));
            }
            let before = json!({ "status": device.status, "deleted_at": device.deleted_at });
            device.status = DeviceStatus::Active;
            device.deleted_at = None;
            tx.execute(
                "UPDATE devices SET status = 'active', deleted_at = NULL WHERE id = ?1",
                params![device.id.to_string()],
            )?;
            let (minted, _row) = rotate_device_token(tx, tokens, &device, now)?;
            write_audit(
                tx,
                tenant_id,
                ctx,
                "device.restore",
                "device",
                &device.id.to_string(),
                Some(&before),
                Some(&json!({ "status": device.status, "deleted_at": device.deleted_at })),
            )?;
            Ok((device, minted))
        })
    }

    pub fn revoke_device_token(
        &self,
        tokens: &TokenService,
        ctx: &AuditContext,
        tenant_id: Uuid,
        device_id: Uuid,
    ) -> Result<(Device, MintedToken), RegistryError> {
        let now = utcnow();
        self.with_tx(|tx| {
            let device = require_device(tx, tenant_id, device_id)?;
            if device.status != DeviceStatus::Active {
                return Err(RegistryError::DeviceInactive);
            }
            let (minted, _row) = rotate_device_token(tx, tokens, &device, now)?;
            write_audit(
                tx,
                tenant_id,
                ctx,
                "device.revoke_token",
                "device",
                &device.id.to_string(),
                None,
                Some(&json!({ "rotated_at": to_ts(now) })),
            )?;
            Ok((device, minted))
        })
    }

    pub fn token_history(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
    ) -> Result<Vec<DeviceAuthToken>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tenant_id, device_id, token_hash, prefix, issued_at,
                        revoked_at, last_used_at, replaced_by_id
                 FROM device_auth_tokens
                 WHERE tenant_id = ?1 AND device_id = ?2
                 ORDER BY issued_at DESC, id DESC",
            )?;
            let rows = stmt
                .query_map(
                    params![tenant_id.to_string(), device_id.to_string()],
                    device_token_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn touch_last_seen(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| touch_last_seen_tx(tx, tenant_id, device_id, now))
    }

    /// Resolve a bearer token to its device. Read-only: last-seen/last-used
    /// stamps happen on report ingest, not on every authenticated call.
    pub fn authenticate_device(
        &self,
        tokens: &TokenService,
        raw_token: &str,
    ) -> Result<(Device, DeviceAuthToken), RegistryError> {
        let token_hash = tokens.hash(raw_token.trim());
        let found = self.with_conn(|conn| -> Result<Option<(Device, DeviceAuthToken)>, RegistryError> {
            let token = conn
                .query_row(
                    "SELECT id, tenant_id, device_id, token_hash, prefix, issued_at,
                            revoked_at, last_used_at, replaced_by_id
                     FROM device_auth_tokens WHERE token_hash = ?1",
                    params![token_hash],
                    device_token_from_row,
                )
                .optional()
                .map_err(StoreError::from)?;
            let Some(token) = token else {
                return Ok(None);
            };
            let device = conn
                .query_row(
                    &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
                    params![token.device_id.to_string()],
                    device_from_row,
                )
                .optional()
                .map_err(StoreError::from)?;
            Ok(device.map(|device| (device, token)))
        })?;

        let (device, token) = found.ok_or(RegistryError::DeviceToken(TokenCheck::NotFound))?;
        if let TokenCheck::Revoked = check_device_token(&token) {
            return Err(RegistryError::DeviceToken(TokenCheck::Revoked));
        }
        if device.status != DeviceStatus::Active {
            return Err(RegistryError::DeviceInactive);
        }
        Ok((device, token))
    }

    /// Cheap device-id lookup for rate-limit keying; never errors outward.
    pub fn device_id_for_token(&self, tokens: &TokenService, raw_token: &str) -> Option<Uuid> {
        let token_hash = tokens.hash(raw_token.trim());
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT device_id FROM device_auth_tokens
                 WHERE token_hash = ?1 AND revoked_at IS NULL",
                params![token_hash],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(StoreError::from)
        })
        .ok()
        .flatten()
        .and_then(|id| Uuid::parse_str(&id).ok())
    }

    pub fn mint_enroll_token(
        &self,
        tokens: &TokenService,
        ctx: &AuditContext,
        tenant_id: Uuid,
        expires_at: Option<DateTime<Utc>>,
        note: Option<String>,
    ) -> Result<(EnrollToken, MintedToken), RegistryError> {
        let minted = tokens.mint();
        let now = utcnow();
        let record = EnrollToken {
            id: Uuid::new_v4(),
            tenant_id,
            token_hash: minted.hash.clone(),
            created_at: now,
            expires_at,
            used_at: None,
            revoked_at: None,
            used_by_device_id: None,
            note,
        };
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO enroll_tokens
                    (id, tenant_id, token_hash, created_at, expires_at, used_at,
                     revoked_at, used_by_device_id, note)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL, ?6)",
                params![
                    record.id.to_string(),
                    record.tenant_id.to_string(),
                    record.token_hash,
                    to_ts(record.created_at),
                    to_ts_opt(record.expires_at),
                    record.note,
                ],
            )?;
            write_audit(
                tx,
                tenant_id,
                ctx,
                "enroll_token.create",
                "enroll_token",
                &record.id.to_string(),
                None,
                Some(&json!({ "expires_at": record.expires_at, "note": record.note })),
            )?;
            Ok::<_, RegistryError>(())
        })?;
        Ok((record, minted))
    }

    pub fn list_enroll_tokens(&self, tenant_id: Uuid) -> Result<Vec<EnrollToken>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tenant_id, token_hash, created_at, expires_at, used_at,
                        revoked_at, used_by_device_id, note
                 FROM enroll_tokens WHERE tenant_id = ?1
                 ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt
                .query_map(params![tenant_id.to_string()], enroll_token_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Revoking an enroll token expires it immediately.
    pub fn revoke_enroll_token(
        &self,
        ctx: &AuditContext,
        tenant_id: Uuid,
        token_id: Uuid,
    ) -> Result<EnrollToken, RegistryError> {
        let now = utcnow();
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE enroll_tokens SET revoked_at = ?1, expires_at = ?1
                 WHERE tenant_id = ?2 AND id = ?3",
                params![to_ts(now), tenant_id.to_string(), token_id.to_string()],
            )?;
            if changed == 0 {
                return Err(RegistryError::NotFound("enroll token"));
            }
            let token = tx.query_row(
                "SELECT id, tenant_id, token_hash, created_at, expires_at, used_at,
                        revoked_at, used_by_device_id, note
                 FROM enroll_tokens WHERE id = ?1",
                params![token_id.to_string()],
                enroll_token_from_row,
            )?;
            write_audit(
                tx,
                tenant_id,
                ctx,
                "enroll_token.revoke",
                "enroll_token",
                &token_id.to_string(),
                None,
                Some(&json!({ "revoked_at": token.revoked_at })),
            )?;
            Ok(token)
        })
    }
}

pub(crate) const DEVICE_COLUMNS: &str = "id, tenant_id, device_key, hostname, os, os_version, \
     arch, agent_version, tags, status, created_at, last_seen_at, deleted_at";

pub(crate) fn device_from_row(row: &Row) -> rusqlite::Result<Device> {
    let tags_text: String = row.get(8)?;
    let tags: BTreeMap<String, String> = serde_json::from_str(&tags_text)
        .map_err(|err| crate::store::column_err(format!("tags column: {err}")))?;
    Ok(Device {
        id: sql_uuid(row.get(0)?)?,
        tenant_id: sql_uuid(row.get(1)?)?,
        device_key: row.get(2)?,
        hostname: row.get(3)?,
        os: row.get(4)?,
        os_version: row.get(5)?,
        arch: row.get(6)?,
        agent_version: row.get(7)?,
        tags,
        status: sql_enum(row.get(9)?, DeviceStatus::parse)?,
        created_at: sql_ts(row.get(10)?)?,
        last_seen_at: sql_ts_opt(row.get(11)?)?,
        deleted_at: sql_ts_opt(row.get(12)?)?,
    })
}

fn device_token_from_row(row: &Row) -> rusqlite::Result<DeviceAuthToken> {
    Ok(DeviceAuthToken {
        id: sql_uuid(row.get(0)?)?,
        tenant_id: sql_uuid(row.get(1)?)?,
        device_id: sql_uuid(row.get(2)?)?,
        token_hash: row.get(3)?,
        prefix: row.get(4)?,
        issued_at: sql_ts(row.get(5)?)?,
        revoked_at: sql_ts_opt(row.get(6)?)?,
        last_used_at: sql_ts_opt(row.get(7)?)?,
        replaced_by_id: sql_uuid_opt(row.get(8)?)?,
    })
}

fn enroll_token_from_row(row: &Row) -> rusqlite::Result<EnrollToken> {
    Ok(EnrollToken {
        id: sql_uuid(row.get(0)?)?,
        tenant_id: sql_uuid(row.get(1)?)?,
        token_hash: row.get(2)?,
        created_at: sql_ts(row.get(3)?)?,
        expires_at: sql_ts_opt(row.get(4)?)?,
        used_at: sql_ts_opt(row.get(5)?)?,
        revoked_at: sql_ts_opt(row.get(6)?)?,
        used_by_device_id: sql_uuid_opt(row.get(7)?)?,
        note: row.get(8)?,
    })
}

fn find_enroll_token_by_hash(
    tx: &Transaction,
    token_hash: &str,
) -> Result<Option<EnrollToken>, StoreError> {
    tx.query_row(
        "SELECT id, tenant_id, token_hash, created_at, expires_at, used_at,
                revoked_at, used_by_device_id, note
         FROM enroll_tokens WHERE token_hash = ?1",
        params![token_hash],
        enroll_token_from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

fn find_device_by_key(
    tx: &Transaction,
    tenant_id: Uuid,
    device_key: &str,
) -> Result<Option<Device>, StoreError> {
    tx.query_row(
        &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE tenant_id = ?1 AND device_key = ?2"),
        params![tenant_id.to_string(), device_key],
        device_from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

fn require_device(
    tx: &Transaction,
    tenant_id: Uuid,
    device_id: Uuid,
) -> Result<Device, RegistryError> {
    tx.query_row(
        &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE tenant_id = ?1 AND id = ?2"),
        params![tenant_id.to_string(), device_id.to_string()],
        device_from_row,
    )
    .optional()?
    .ok_or(RegistryError::NotFound("device"))
}

fn merge_metadata(device: &mut Device, request: &EnrollRequest) {
    if request.hostname.is_some() {
        device.hostname = request.hostname.clone();
    }
    if request.os.is_some() {
        device.os = request.os.clone();
    }
    if request.os_version.is_some() {
        device.os_version = request.os_version.clone();
    }
    if request.arch.is_some() {
        device.arch = request.arch.clone();
    }
    if request.agent_version.is_some() {
        device.agent_version = request.agent_version.clone();
    }
    if !request.tags.is_empty() {
        device.tags = request.tags.clone();
    }
}

fn insert_device(tx: &Transaction, device: &Device) -> Result<(), StoreError> {
    let tags = serde_json::to_string(&device.tags)
        .map_err(|err| StoreError::Serialization(err.to_string()))?;
    tx.execute(
        "INSERT INTO devices
            (id, tenant_id, device_key, hostname, os, os_version, arch, agent_version,
             tags, status, created_at, last_seen_at, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL)",
        params![
            device.id.to_string(),
            device.tenant_id.to_string(),
            device.device_key,
            device.hostname,
            device.os,
            device.os_version,
            device.arch,
            device.agent_version,
            tags,
            device.status.as_str(),
            to_ts(device.created_at),
            to_ts_opt(device.last_seen_at),
        ],
    )?;
    Ok(())
}

fn update_device_metadata(tx: &Transaction, device: &Device) -> Result<(), StoreError> {
    let tags = serde_json::to_string(&device.tags)
        .map_err(|err| StoreError::Serialization(err.to_string()))?;
    tx.execute(
        "UPDATE devices SET hostname = ?1, os = ?2, os_version = ?3, arch = ?4,
             agent_version = ?5, tags = ?6, last_seen_at = ?7
         WHERE id = ?8",
        params![
            device.hostname,
            device.os,
            device.os_version,
            device.arch,
            device.agent_version,
            tags,
            to_ts_opt(device.last_seen_at),
            device.id.to_string(),
        ],
    )?;
    Ok(())
}

fn insert_device_token(
    tx: &Transaction,
    tenant_id: Uuid,
    device_id: Uuid,
    minted: &MintedToken,
    issued_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
) -> Result<Uuid, StoreError> {
    let id = Uuid::new_v4();
    tx.execute(
        "INSERT INTO device_auth_tokens
            (id, tenant_id, device_id, token_hash, prefix, issued_at,
             revoked_at, last_used_at, replaced_by_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, NULL)",
        params![
            id.to_string(),
            tenant_id.to_string(),
            device_id.to_string(),
            minted.hash,
            minted.prefix,
            to_ts(issued_at),
            to_ts_opt(last_used_at),
        ],
    )?;
    Ok(id)
}

/// Mint a replacement token and revoke every other un-revoked row for the
/// device in the same transaction, preserving the at-most-one-active
/// invariant.
pub(crate) fn rotate_device_token(
    tx: &Transaction,
    tokens: &TokenService,
    device: &Device,
    now: DateTime<Utc>,
) -> Result<(MintedToken, Uuid), StoreError> {
    let minted = tokens.mint();
    let new_id = insert_device_token(tx, device.tenant_id, device.id, &minted, now, None)?;
    revoke_active_tokens(tx, device.id, now, Some(new_id))?;
    Ok((minted, new_id))
}

fn revoke_active_tokens(
    tx: &Transaction,
    device_id: Uuid,
    now: DateTime<Utc>,
    replaced_by: Option<Uuid>,
) -> Result<(), StoreError> {
    match replaced_by {
        Some(new_id) => tx.execute(
            "UPDATE device_auth_tokens SET revoked_at = ?1, replaced_by_id = ?2
             WHERE device_id = ?3 AND revoked_at IS NULL AND id != ?2",
            params![to_ts(now), new_id.to_string(), device_id.to_string()],
        )?,
        None => tx.execute(
            "UPDATE device_auth_tokens SET revoked_at = ?1
             WHERE device_id = ?2 AND revoked_at IS NULL",
            params![to_ts(now), device_id.to_string()],
        )?,
    };
    Ok(())
}

pub(crate) fn touch_last_seen_tx(
    tx: &Transaction,
    tenant_id: Uuid,
    device_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE devices SET last_seen_at = MAX(COALESCE(last_seen_at, ''), ?1)
         WHERE tenant_id = ?2 AND id = ?3",
        params![to_ts(now), tenant_id.to_string(), device_id.to_string()],
    )?;
    Ok(())
}
