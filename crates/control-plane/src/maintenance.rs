use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Transaction};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{write_audit, AuditContext};
use crate::models::utcnow;
use crate::store::{to_ts, Store, StoreError};

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid prune request: {0}")]
    Invalid(String),
}

impl From<rusqlite::Error> for MaintenanceError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PruneRequest {
    pub keep_days: i64,
    pub keep_runs_per_device: i64,
    pub batch_size: usize,
    pub dry_run: bool,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct PruneCounts {
    pub runs: i64,
    pub run_items: i64,
    pub log_events: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PruneOutcome {
    pub dry_run: bool,
    pub keep_days: i64,
    pub keep_runs_per_device: i64,
    pub cutoff: DateTime<Utc>,
    pub runs_targeted: usize,
    pub counts: PruneCounts,
}

impl Store {
    /// Bounded retention: delete runs that are older than `keep_days` and
    /// ranked beyond the `keep_runs_per_device` most-recent for their
    /// device. A zero disables that protection. Deletes are chunked by
    /// `batch_size`, each chunk in its own transaction, to bound lock
    /// duration; cascades cover items and logs explicitly.
    pub fn prune_runs(
        &self,
        ctx: &AuditContext,
        tenant_id: Uuid,
        request: &PruneRequest,
    ) -> Result<PruneOutcome, MaintenanceError> {
        if request.keep_days < 0 {
            return Err(MaintenanceError::Invalid("keep_days must be >= 0".to_string()));
        }
        if request.keep_runs_per_device < 0 {
            return Err(MaintenanceError::Invalid(
                "keep_runs_per_device must be >= 0".to_string(),
            ));
        }
        let now = utcnow();
        let cutoff = now - Duration::days(request.keep_days);
        let cutoff_param = (request.keep_days > 0).then(|| to_ts(cutoff));

        let run_ids: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id FROM (
                     SELECT id AS run_id, started_at, ROW_NUMBER() OVER (
                         PARTITION BY device_id ORDER BY started_at DESC, id DESC
                     ) AS rn
                     FROM runs WHERE tenant_id = ?1
                 )
                 WHERE (?2 <= 0 OR rn > ?2) AND (?3 IS NULL OR started_at < ?3)",
            )?;
            let ids = stmt
                .query_map(
                    params![
                        tenant_id.to_string(),
                        request.keep_runs_per_device,
                        cutoff_param
                    ],
                    |row| row.get::<_, String>(0),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, StoreError>(ids)
        })?;

        let counts = self.count_run_children(&run_ids)?;
        let outcome = PruneOutcome {
            dry_run: request.dry_run,
            keep_days: request.keep_days,
            keep_runs_per_device: request.keep_runs_per_device,
            cutoff,
            runs_targeted: run_ids.len(),
            counts,
        };
        if request.dry_run {
            return Ok(outcome);
        }

        let batch_size = if request.batch_size == 0 {
            run_ids.len().max(1)
        } else {
            request.batch_size
        };
        // The audit row rides in the same transaction as the deletes it
        // describes: with the final chunk, or alone when the sweep matched
        // nothing.
        let chunk_count = run_ids.chunks(batch_size).len();
        let mut deleted = PruneCounts::default();
        for (index, chunk) in run_ids.chunks(batch_size).enumerate() {
            let placeholders = placeholders(chunk.len());
            let is_last = index + 1 == chunk_count;
            self.with_tx(|tx| {
                deleted.log_events += tx.execute(
                    &format!("DELETE FROM log_events WHERE run_id IN ({placeholders})"),
                    rusqlite::params_from_iter(chunk.iter()),
                )? as i64;
                deleted.run_items += tx.execute(
                    &format!("DELETE FROM run_items WHERE run_id IN ({placeholders})"),
                    rusqlite::params_from_iter(chunk.iter()),
                )? as i64;
                deleted.runs += tx.execute(
                    &format!("DELETE FROM runs WHERE id IN ({placeholders})"),
                    rusqlite::params_from_iter(chunk.iter()),
                )? as i64;
                if is_last {
                    write_prune_audit(tx, tenant_id, ctx, request, deleted)?;
                }
                Ok::<_, StoreError>(())
            })?;
        }
        if run_ids.is_empty() {
            self.with_tx(|tx| {
                write_prune_audit(tx, tenant_id, ctx, request, deleted)?;
                Ok::<_, StoreError>(())
            })?;
        }

        Ok(PruneOutcome {
            counts: deleted,
            ..outcome
        })
    }

    fn count_run_children(&self, run_ids: &[String]) -> Result<PruneCounts, StoreError> {
        if run_ids.is_empty() {
            return Ok(PruneCounts::default());
        }
        let placeholders = placeholders(run_ids.len());
        self.with_conn(|conn| {
            let run_items: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM run_items WHERE run_id IN ({placeholders})"),
                rusqlite::params_from_iter(run_ids.iter()),
                |row| row.get(0),
            )?;
            let log_events: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM log_events WHERE run_id IN ({placeholders})"),
                rusqlite::params_from_iter(run_ids.iter()),
                |row| row.get(0),
            )?;
            Ok(PruneCounts {
                runs: run_ids.len() as i64,
                run_items,
                log_events,
            })
        })
    }
}

fn write_prune_audit(
    tx: &Transaction,
    tenant_id: Uuid,
    ctx: &AuditContext,
    request: &PruneRequest,
    deleted: PruneCounts,
) -> Result<(), StoreError> {
    write_audit(
        tx,
        tenant_id,
        ctx,
        "maintenance.prune",
        "runs",
        "retention",
        None,
        Some(&json!({
            "keep_days": request.keep_days,
            "keep_runs_per_device": request.keep_runs_per_device,
            "deleted": deleted,
        })),
    )?;
    Ok(())
}

fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 2);
    for index in 0..count {
        if index > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}
