use std::collections::BTreeMap;

use serde_json::json;
use uuid::Uuid;

use control_plane::{
    default_tenant_id, utcnow, AuditContext, EnrollOutcome, EnrollRequest, IngestError,
    ReportCaps, ReportSubmission, Store, TokenService,
};

fn store() -> Store {
    Store::open_in_memory().expect("in-memory store")
}

fn tokens() -> TokenService {
    TokenService::new("test-pepper")
}

fn ctx() -> AuditContext {
    AuditContext::admin("test-admin")
}

fn caps() -> ReportCaps {
    ReportCaps {
        max_items: 10,
        max_log_events: 10,
    }
}

fn enroll(store: &Store, tokens: &TokenService) -> EnrollOutcome {
    let (_, minted) = store
        .mint_enroll_token(tokens, &ctx(), default_tenant_id(), None, None)
        .expect("mint enroll token");
    store
        .enroll(
            tokens,
            &ctx(),
            &EnrollRequest {
                enroll_token: minted.raw,
                device_key: "DEV1".to_string(),
                tags: BTreeMap::new(),
                ..Default::default()
            },
        )
        .expect("enroll")
}

fn token_row_id(store: &Store, device_id: Uuid) -> Uuid {
    store
        .token_history(default_tenant_id(), device_id)
        .expect("history")
        .into_iter()
        .find(|token| token.revoked_at.is_none())
        .expect("active token")
        .id
}

fn report(correlation_id: Option<&str>, items: serde_json::Value) -> ReportSubmission {
    serde_json::from_value(json!({
        "started_at": utcnow().to_rfc3339(),
        "ended_at": utcnow().to_rfc3339(),
        "status": "succeeded",
        "agent_version": "0.1.0",
        "effective_policy_hash": "cafe",
        "policy_snapshot": { "resources": [] },
        "summary": { "items_total": 1 },
        "items": items,
        "logs": [
            { "level": "info", "message": "started" },
            { "level": "debug", "message": "out of order", "ts": "2020-01-01T00:00:00Z" },
        ],
        "correlation_id": correlation_id,
    }))
    .expect("report")
}

fn item(resource_id: &str) -> serde_json::Value {
    json!({
        "resource_type": "winget.package",
        "resource_id": resource_id,
        "status_detect": "ok",
        "status_remediate": "failed",
        "changed": true,
    })
}

#[test]
fn ingest_persists_header_items_and_logs_together() {
    let store = store();
    let tokens = tokens();
    let enrolled = enroll(&store, &tokens);
    let token_id = token_row_id(&store, enrolled.device.id);

    let outcome = store
        .ingest_report(
            &enrolled.device,
            token_id,
            &report(None, json!([item("putty"), item("git")])),
            &caps(),
            None,
        )
        .expect("ingest");
    assert!(!outcome.duplicate);

    let detail = store
        .get_run(default_tenant_id(), outcome.run_id)
        .expect("get run")
        .expect("run exists");
    assert_eq!(detail.items.len(), 2);
    assert_eq!(detail.items[0].ordinal, 0);
    assert_eq!(detail.items[1].ordinal, 1);
    assert_eq!(detail.logs.len(), 2);
    // Legacy "failed" spelling is folded into the stored vocabulary.
    assert_eq!(
        detail.items[0].status_remediate,
        control_plane::StepStatus::Fail
    );
}

#[test]
fn failed_item_validation_leaves_no_rows() {
    let store = store();
    let tokens = tokens();
    let enrolled = enroll(&store, &tokens);
    let token_id = token_row_id(&store, enrolled.device.id);

    let items = json!([
        item("one"),
        item("two"),
        item("three"),
        { "resource_type": "winget.package", "resource_id": "" },
    ]);
    let result = store.ingest_report(
        &enrolled.device,
        token_id,
        &report(None, items),
        &caps(),
        None,
    );
    assert!(matches!(result, Err(IngestError::Schema { .. })));

    let (runs, total) = store
        .list_runs(default_tenant_id(), None, 10, 0)
        .expect("list runs");
    assert_eq!(total, 0);
    assert!(runs.is_empty());
}

#[test]
fn duplicate_correlation_returns_original_run() {
    let store = store();
    let tokens = tokens();
    let enrolled = enroll(&store, &tokens);
    let token_id = token_row_id(&store, enrolled.device.id);

    let first = store
        .ingest_report(
            &enrolled.device,
            token_id,
            &report(Some("cid-1"), json!([item("putty")])),
            &caps(),
            None,
        )
        .expect("first ingest");
    let second = store
        .ingest_report(
            &enrolled.device,
            token_id,
            &report(Some("cid-1"), json!([item("putty")])),
            &caps(),
            None,
        )
        .expect("second ingest");

    assert_eq!(first.run_id, second.run_id);
    assert!(second.duplicate);

    let (_, total) = store
        .list_runs(default_tenant_id(), Some(enrolled.device.id), 10, 0)
        .expect("list");
    assert_eq!(total, 1);
}

#[test]
fn missing_correlation_always_creates_new_runs() {
    let store = store();
    let tokens = tokens();
    let enrolled = enroll(&store, &tokens);
    let token_id = token_row_id(&store, enrolled.device.id);

    for _ in 0..2 {
        store
            .ingest_report(
                &enrolled.device,
                token_id,
                &report(None, json!([])),
                &caps(),
                None,
            )
            .expect("ingest");
    }
    let (_, total) = store
        .list_runs(default_tenant_id(), Some(enrolled.device.id), 10, 0)
        .expect("list");
    assert_eq!(total, 2);
}

#[test]
fn item_cap_is_enforced() {
    let store = store();
    let tokens = tokens();
    let enrolled = enroll(&store, &tokens);
    let token_id = token_row_id(&store, enrolled.device.id);

    let too_many: Vec<_> = (0..11).map(|i| item(&format!("r{i}"))).collect();
    let result = store.ingest_report(
        &enrolled.device,
        token_id,
        &report(None, serde_json::Value::Array(too_many)),
        &caps(),
        None,
    );
    assert!(matches!(result, Err(IngestError::TooLarge(_))));
}

#[test]
fn unknown_run_status_is_a_schema_error() {
    let store = store();
    let tokens = tokens();
    let enrolled = enroll(&store, &tokens);
    let token_id = token_row_id(&store, enrolled.device.id);

    let mut body = report(None, json!([]));
    body.status = "exploded".to_string();
    let result = store.ingest_report(&enrolled.device, token_id, &body, &caps(), None);
    assert!(matches!(result, Err(IngestError::Schema { .. })));
}

#[test]
fn ingest_updates_last_seen_and_token_usage() {
    let store = store();
    let tokens = tokens();
    let enrolled = enroll(&store, &tokens);
    let token_id = token_row_id(&store, enrolled.device.id);
    let before = store
        .get_device(default_tenant_id(), enrolled.device.id)
        .expect("get")
        .expect("device")
        .last_seen_at;

    std::thread::sleep(std::time::Duration::from_millis(5));
    store
        .ingest_report(
            &enrolled.device,
            token_id,
            &report(None, json!([])),
            &caps(),
            None,
        )
        .expect("ingest");

    let device = store
        .get_device(default_tenant_id(), enrolled.device.id)
        .expect("get")
        .expect("device");
    assert!(device.last_seen_at > before);

    let history = store
        .token_history(default_tenant_id(), enrolled.device.id)
        .expect("history");
    let active = history
        .iter()
        .find(|token| token.id == token_id)
        .expect("token row");
    assert!(active.last_used_at.is_some());
}

#[test]
fn heartbeat_run_kind_round_trips() {
    let store = store();
    let tokens = tokens();
    let enrolled = enroll(&store, &tokens);
    let token_id = token_row_id(&store, enrolled.device.id);

    let mut body = report(None, json!([]));
    body.run_kind = Some("heartbeat".to_string());
    let outcome = store
        .ingest_report(&enrolled.device, token_id, &body, &caps(), None)
        .expect("ingest");

    let detail = store
        .get_run(default_tenant_id(), outcome.run_id)
        .expect("get")
        .expect("run");
    assert_eq!(detail.run.run_kind, control_plane::RunKind::Heartbeat);
}
