use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    utcnow, Device, ItemError, LogEvent, LogLevel, Run, RunItem, RunKind, RunStatus, StepStatus,
};
use crate::registry::touch_last_seen_tx;
use crate::store::{
    sql_enum, sql_json, sql_ts, sql_ts_opt, sql_uuid, to_ts, to_ts_opt, Store, StoreError,
};

const BUSY_RETRY_BACKOFF_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("report too large: {0}")]
    TooLarge(String),
    #[error("invalid report: {path}: {message}")]
    Schema { path: String, message: String },
}

impl From<rusqlite::Error> for IngestError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

impl IngestError {
    fn is_busy(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_busy())
    }

    fn schema(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Device-posted run report, exactly as received on the wire.
#[derive(Clone, Debug, Deserialize)]
pub struct ReportSubmission {
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: String,
    #[serde(default)]
    pub run_kind: Option<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub effective_policy_hash: Option<String>,
    #[serde(default)]
    pub policy_snapshot: Value,
    #[serde(default)]
    pub summary: Value,
    #[serde(default)]
    pub items: Vec<ReportItem>,
    #[serde(default)]
    pub logs: Vec<ReportLog>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReportItem {
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status_detect: Option<String>,
    #[serde(default)]
    pub status_remediate: Option<String>,
    #[serde(default)]
    pub status_validate: Option<String>,
    #[serde(default)]
    pub compliant_before: Option<bool>,
    #[serde(default)]
    pub compliant_after: Option<bool>,
    #[serde(default)]
    pub changed: bool,
    #[serde(default)]
    pub reboot_required: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub evidence: Value,
    #[serde(default)]
    pub error: Option<ItemError>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReportLog {
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub level: Option<String>,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Clone, Copy, Debug)]
pub struct ReportCaps {
    pub max_items: usize,
    pub max_log_events: usize,
}

#[derive(Clone, Debug)]
pub struct IngestOutcome {
    pub run_id: Uuid,
    pub duplicate: bool,
}

#[derive(Clone, Debug)]
pub struct RunDetail {
    pub run: Run,
    pub items: Vec<RunItem>,
    pub logs: Vec<LogEvent>,
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct RunRollup {
    pub items_total: i64,
    pub items_failed: i64,
    pub items_changed: i64,
}

impl Store {
    /// Persist a run report atomically: header, items, and logs land in one
    /// transaction together with the device's last-seen stamp, or nothing
    /// lands at all. Idempotent per (device, correlation_id). A busy store
    /// is retried once before the failure surfaces.
    pub fn ingest_report(
        &self,
        device: &Device,
        token_id: Uuid,
        report: &ReportSubmission,
        caps: &ReportCaps,
        correlation_id: Option<&str>,
    ) -> Result<IngestOutcome, IngestError> {
        let status = RunStatus::parse(report.status.trim())
            .ok_or_else(|| IngestError::schema("status", "unknown run status"))?;
        let run_kind = match report.run_kind.as_deref() {
            None => RunKind::Baseline,
            Some(raw) => RunKind::parse(raw.trim())
                .ok_or_else(|| IngestError::schema("run_kind", "unknown run kind"))?,
        };
        if report.items.len() > caps.max_items {
            return Err(IngestError::TooLarge(format!(
                "items count {} exceeds cap {}",
                report.items.len(),
                caps.max_items
            )));
        }
        if report.logs.len() > caps.max_log_events {
            return Err(IngestError::TooLarge(format!(
                "logs count {} exceeds cap {}",
                report.logs.len(),
                caps.max_log_events
            )));
        }
        let correlation_id = report
            .correlation_id
            .as_deref()
            .or(correlation_id)
            .map(str::to_string);

        let attempt = |tx: &Transaction| -> Result<IngestOutcome, IngestError> {
            persist_report(tx, device, token_id, report, status, run_kind, &correlation_id)
        };
        match self.with_tx(&attempt) {
            Err(err) if err.is_busy() => {
                std::thread::sleep(Duration::from_millis(BUSY_RETRY_BACKOFF_MS));
                self.with_tx(&attempt)
            }
            other => other,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn persist_report(
    tx: &Transaction,
    device: &Device,
    token_id: Uuid,
    report: &ReportSubmission,
    status: RunStatus,
    run_kind: RunKind,
    correlation_id: &Option<String>,
) -> Result<IngestOutcome, IngestError> {
    let now = utcnow();

    if let Some(cid) = correlation_id {
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM runs WHERE device_id = ?1 AND correlation_id = ?2",
                params![device.id.to_string(), cid],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(run_id) = existing {
            let run_id = Uuid::parse_str(&run_id)
                .map_err(|err| StoreError::Serialization(err.to_string()))?;
            return Ok(IngestOutcome {
                run_id,
                duplicate: true,
            });
        }
    }

    let run_id = Uuid::new_v4();
    tx.execute(
        "INSERT INTO runs
            (id, tenant_id, device_id, started_at, ended_at, status, run_kind,
             agent_version, effective_policy_hash, policy_snapshot, summary, correlation_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            run_id.to_string(),
            device.tenant_id.to_string(),
            device.id.to_string(),
            to_ts(report.started_at),
            to_ts_opt(report.ended_at),
            status.as_str(),
            run_kind.as_str(),
            report.agent_version,
            report.effective_policy_hash,
            json_text(&report.policy_snapshot)?,
            json_text(&report.summary)?,
            correlation_id,
        ],
    )?;

    // Items persist in body order; the ordinal is the body index.
    // Validation runs item by item so a bad entry aborts mid-persist
    // and the transaction rolls everything back.
    for (index, item) in report.items.iter().enumerate() {
        if item.resource_type.trim().is_empty() {
            return Err(IngestError::schema(
                format!("items[{index}].resource_type"),
                "is required",
            ));
        }
        if item.resource_id.trim().is_empty() {
            return Err(IngestError::schema(
                format!("items[{index}].resource_id"),
                "is required",
            ));
        }
        let error_text = item
            .error
            .as_ref()
            .map(|err| serde_json::to_string(err))
            .transpose()
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        tx.execute(
            "INSERT INTO run_items
                (id, run_id, ordinal, resource_type, resource_id, name,
                 status_detect, status_remediate, status_validate,
                 compliant_before, compliant_after, changed, reboot_required,
                 started_at, ended_at, evidence, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                Uuid::new_v4().to_string(),
                run_id.to_string(),
                index as i64,
                item.resource_type.trim(),
                item.resource_id.trim(),
                item.name,
                StepStatus::coerce(item.status_detect.as_deref()).as_str(),
                StepStatus::coerce(item.status_remediate.as_deref()).as_str(),
                StepStatus::coerce(item.status_validate.as_deref()).as_str(),
                item.compliant_before.map(|v| v as i64),
                item.compliant_after.map(|v| v as i64),
                item.changed as i64,
                item.reboot_required as i64,
                to_ts_opt(item.started_at),
                to_ts_opt(item.ended_at),
                json_text(&item.evidence)?,
                error_text,
            ],
        )?;
    }

    // Logs persist in body order; timestamps are taken as-is even when
    // out of order.
    for (index, log) in report.logs.iter().enumerate() {
        let level = match log.level.as_deref() {
            None => LogLevel::Info,
            Some(raw) => LogLevel::parse(raw.trim()).ok_or_else(|| {
                IngestError::schema(format!("logs[{index}].level"), "unknown log level")
            })?,
        };
        tx.execute(
            "INSERT INTO log_events (id, run_id, ts, level, message, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                run_id.to_string(),
                to_ts(log.ts.unwrap_or(now)),
                level.as_str(),
                log.message,
                json_text(&log.data)?,
            ],
        )?;
    }

    touch_last_seen_tx(tx, device.tenant_id, device.id, now)?;
    tx.execute(
        "UPDATE device_auth_tokens SET last_used_at = ?1 WHERE id = ?2",
        params![to_ts(now), token_id.to_string()],
    )?;

    Ok(IngestOutcome {
        run_id,
        duplicate: false,
    })
}

impl Store {
    pub fn list_runs(
        &self,
        tenant_id: Uuid,
        device_id: Option<Uuid>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Run>, i64), StoreError> {
        self.with_conn(|conn| {
            let device_filter = device_id.map(|id| id.to_string());
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM runs
                 WHERE tenant_id = ?1 AND (?2 IS NULL OR device_id = ?2)",
                params![tenant_id.to_string(), device_filter],
                |row| row.get(0),
            )?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs
                 WHERE tenant_id = ?1 AND (?2 IS NULL OR device_id = ?2)
                 ORDER BY started_at DESC, id DESC
                 LIMIT ?3 OFFSET ?4"
            ))?;
            let runs = stmt
                .query_map(
                    params![
                        tenant_id.to_string(),
                        device_filter,
                        limit as i64,
                        offset as i64
                    ],
                    run_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok((runs, total))
        })
    }

    pub fn get_run(&self, tenant_id: Uuid, run_id: Uuid) -> Result<Option<RunDetail>, StoreError> {
        self.with_conn(|conn| {
            let run = conn
                .query_row(
                    &format!("SELECT {RUN_COLUMNS} FROM runs WHERE tenant_id = ?1 AND id = ?2"),
                    params![tenant_id.to_string(), run_id.to_string()],
                    run_from_row,
                )
                .optional()?;
            let Some(run) = run else {
                return Ok(None);
            };
            let items = run_items(conn, run.id)?;
            let mut stmt = conn.prepare(
                "SELECT id, run_id, ts, level, message, data
                 FROM log_events WHERE run_id = ?1 ORDER BY ts ASC, id ASC",
            )?;
            let logs = stmt
                .query_map(params![run.id.to_string()], log_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(RunDetail { run, items, logs }))
        })
    }

    pub fn last_run(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
    ) -> Result<Option<(Run, Vec<RunItem>)>, StoreError> {
        self.with_conn(|conn| {
            let run = conn
                .query_row(
                    &format!(
                        "SELECT {RUN_COLUMNS} FROM runs
                         WHERE tenant_id = ?1 AND device_id = ?2
                         ORDER BY started_at DESC, id DESC LIMIT 1"
                    ),
                    params![tenant_id.to_string(), device_id.to_string()],
                    run_from_row,
                )
                .optional()?;
            let Some(run) = run else {
                return Ok(None);
            };
            let items = run_items(conn, run.id)?;
            Ok(Some((run, items)))
        })
    }

    /// Aggregate item counts for one run without loading the items.
    pub fn run_rollup(&self, run_id: Uuid) -> Result<RunRollup, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN error IS NOT NULL
                            OR status_detect = 'fail'
                            OR status_remediate = 'fail'
                            OR status_validate = 'fail' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(changed), 0)
                 FROM run_items WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| {
                    Ok(RunRollup {
                        items_total: row.get(0)?,
                        items_failed: row.get(1)?,
                        items_changed: row.get(2)?,
                    })
                },
            )
            .map_err(StoreError::from)
        })
    }

    /// Latest run per device, one window query instead of N lookups.
    pub fn latest_runs_by_device(&self, tenant_id: Uuid) -> Result<HashMap<Uuid, Run>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM (
                     SELECT *, ROW_NUMBER() OVER (
                         PARTITION BY device_id ORDER BY started_at DESC, id DESC
                     ) AS rn
                     FROM runs WHERE tenant_id = ?1
                 ) WHERE rn = 1"
            ))?;
            let runs = stmt
                .query_map(params![tenant_id.to_string()], run_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(runs.into_iter().map(|run| (run.device_id, run)).collect())
        })
    }
}

/// Rollup counts for operator listings. An item counts as failed when it
/// carries an error or any step reported `fail`.
pub fn rollup_items(items: &[RunItem]) -> RunRollup {
    let failed = |item: &RunItem| {
        item.error.is_some()
            || item.status_detect == StepStatus::Fail
            || item.status_remediate == StepStatus::Fail
            || item.status_validate == StepStatus::Fail
    };
    RunRollup {
        items_total: items.len() as i64,
        items_failed: items.iter().filter(|item| failed(item)).count() as i64,
        items_changed: items.iter().filter(|item| item.changed).count() as i64,
    }
}

pub(crate) const RUN_COLUMNS: &str = "id, tenant_id, device_id, started_at, ended_at, status, \
     run_kind, agent_version, effective_policy_hash, policy_snapshot, summary, correlation_id";

pub(crate) fn run_from_row(row: &Row) -> rusqlite::Result<Run> {
    Ok(Run {
        id: sql_uuid(row.get(0)?)?,
        tenant_id: sql_uuid(row.get(1)?)?,
        device_id: sql_uuid(row.get(2)?)?,
        started_at: sql_ts(row.get(3)?)?,
        ended_at: sql_ts_opt(row.get(4)?)?,
        status: sql_enum(row.get(5)?, RunStatus::parse)?,
        run_kind: sql_enum(row.get(6)?, RunKind::parse)?,
        agent_version: row.get(7)?,
        effective_policy_hash: row.get(8)?,
        policy_snapshot: sql_json(row.get(9)?)?,
        summary: sql_json(row.get(10)?)?,
        correlation_id: row.get(11)?,
    })
}

fn item_from_row(row: &Row) -> rusqlite::Result<RunItem> {
    let error: Option<ItemError> = row
        .get::<_, Option<String>>(16)?
        .map(|text| {
            serde_json::from_str(&text)
                .map_err(|err| crate::store::column_err(format!("item error column: {err}")))
        })
        .transpose()?;
    Ok(RunItem {
        id: sql_uuid(row.get(0)?)?,
        run_id: sql_uuid(row.get(1)?)?,
        ordinal: row.get(2)?,
        resource_type: row.get(3)?,
        resource_id: row.get(4)?,
        name: row.get(5)?,
        status_detect: sql_enum(row.get(6)?, StepStatus::parse)?,
        status_remediate: sql_enum(row.get(7)?, StepStatus::parse)?,
        status_validate: sql_enum(row.get(8)?, StepStatus::parse)?,
        compliant_before: row.get::<_, Option<i64>>(9)?.map(|v| v != 0),
        compliant_after: row.get::<_, Option<i64>>(10)?.map(|v| v != 0),
        changed: row.get::<_, i64>(11)? != 0,
        reboot_required: row.get::<_, i64>(12)? != 0,
        started_at: sql_ts_opt(row.get(13)?)?,
        ended_at: sql_ts_opt(row.get(14)?)?,
        evidence: sql_json(row.get(15)?)?,
        error,
    })
}

fn log_from_row(row: &Row) -> rusqlite::Result<LogEvent> {
    Ok(LogEvent {
        id: sql_uuid(row.get(0)?)?,
        run_id: sql_uuid(row.get(1)?)?,
        ts: sql_ts(row.get(2)?)?,
        level: sql_enum(row.get(3)?, LogLevel::parse)?,
        message: row.get(4)?,
        data: sql_json(row.get(5)?)?,
    })
}

fn run_items(conn: &rusqlite::Connection, run_id: Uuid) -> Result<Vec<RunItem>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, run_id, ordinal, resource_type, resource_id, name,
                status_detect, status_remediate, status_validate,
                compliant_before, compliant_after, changed, reboot_required,
                started_at, ended_at, evidence, error
         FROM run_items WHERE run_id = ?1 ORDER BY ordinal ASC",
    )?;
    let items = stmt
        .query_map(params![run_id.to_string()], item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

fn json_text(value: &Value) -> Result<String, StoreError> {
    if value.is_null() {
        return Ok("{}".to_string());
    }
    serde_json::to_string(value).map_err(|err| StoreError::Serialization(err.to_string()))
}
