use std::collections::BTreeMap;

use serde_json::json;
use uuid::Uuid;

use control_plane::{
    default_tenant_id, utcnow, AuditContext, EnrollOutcome, EnrollRequest, MaintenanceError,
    PruneRequest, ReportCaps, ReportSubmission, Store, TokenService,
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

fn enroll(store: &Store, tokens: &TokenService, key: &str) -> EnrollOutcome {
    let (_, minted) = store
        .mint_enroll_token(tokens, &ctx(), default_tenant_id(), None, None)
        .expect("mint");
    store
        .enroll(
            tokens,
            &ctx(),
            &EnrollRequest {
                enroll_token: minted.raw,
                device_key: key.to_string(),
                tags: BTreeMap::new(),
                ..Default::default()
            },
        )
        .expect("enroll")
}

fn post_run(store: &Store, enrolled: &EnrollOutcome, started_at: chrono::DateTime<chrono::Utc>) {
    let token_id = store
        .token_history(default_tenant_id(), enrolled.device.id)
        .expect("history")
        .into_iter()
        .find(|token| token.revoked_at.is_none())
        .expect("active token")
        .id;
    let report: ReportSubmission = serde_json::from_value(json!({
        "started_at": started_at.to_rfc3339(),
        "status": "succeeded",
        "items": [{ "resource_type": "winget.package", "resource_id": "putty" }],
        "logs": [{ "message": "done" }],
    }))
    .expect("report");
    store
        .ingest_report(
            &enrolled.device,
            token_id,
            &report,
            &ReportCaps {
                max_items: 10,
                max_log_events: 10,
            },
            None,
        )
        .expect("ingest");
}

#[test]
fn negative_knobs_are_rejected() {
    let store = store();
    let result = store.prune_runs(
        &ctx(),
        default_tenant_id(),
        &PruneRequest {
            keep_days: -1,
            keep_runs_per_device: 5,
            batch_size: 100,
            dry_run: true,
        },
    );
    assert!(matches!(result, Err(MaintenanceError::Invalid(_))));
}

#[test]
fn dry_run_counts_match_real_deletion() {
    let store = store();
    let tokens = tokens();
    let enrolled = enroll(&store, &tokens, "DEV1");
    let now = utcnow();
    for age_days in [40, 20, 10, 1] {
        post_run(&store, &enrolled, now - chrono::Duration::days(age_days));
    }

    // Both protections active: delete only runs that are old AND beyond
    // the per-device keep window.
    let request = PruneRequest {
        keep_days: 30,
        keep_runs_per_device: 2,
        batch_size: 2,
        dry_run: true,
    };
    let preview = store
        .prune_runs(&ctx(), default_tenant_id(), &request)
        .expect("dry run");
    assert!(preview.dry_run);
    assert_eq!(preview.runs_targeted, 1);
    assert_eq!(preview.counts.runs, 1);
    assert_eq!(preview.counts.run_items, 1);
    assert_eq!(preview.counts.log_events, 1);

    let (_, total) = store
        .list_runs(default_tenant_id(), None, 10, 0)
        .expect("list");
    assert_eq!(total, 4);

    let outcome = store
        .prune_runs(
            &ctx(),
            default_tenant_id(),
            &PruneRequest {
                dry_run: false,
                ..request
            },
        )
        .expect("prune");
    assert_eq!(outcome.counts.runs, preview.counts.runs);
    assert_eq!(outcome.counts.run_items, preview.counts.run_items);
    assert_eq!(outcome.counts.log_events, preview.counts.log_events);

    let (_, total) = store
        .list_runs(default_tenant_id(), None, 10, 0)
        .expect("list");
    assert_eq!(total, 3);
}

#[test]
fn zero_keep_days_disables_age_protection() {
    let store = store();
    let tokens = tokens();
    let enrolled = enroll(&store, &tokens, "DEV1");
    let now = utcnow();
    for minutes in [30, 20, 10] {
        post_run(&store, &enrolled, now - chrono::Duration::minutes(minutes));
    }

    let outcome = store
        .prune_runs(
            &ctx(),
            default_tenant_id(),
            &PruneRequest {
                keep_days: 0,
                keep_runs_per_device: 1,
                batch_size: 10,
                dry_run: false,
            },
        )
        .expect("prune");
    assert_eq!(outcome.counts.runs, 2);

    let (_, total) = store
        .list_runs(default_tenant_id(), None, 10, 0)
        .expect("list");
    assert_eq!(total, 1);
}

#[test]
fn rank_protection_is_per_device() {
    let store = store();
    let tokens = tokens();
    let first = enroll(&store, &tokens, "DEV1");
    let second = enroll(&store, &tokens, "DEV2");
    let now = utcnow();
    for enrolled in [&first, &second] {
        for minutes in [20, 10] {
            post_run(&store, enrolled, now - chrono::Duration::minutes(minutes));
        }
    }

    let outcome = store
        .prune_runs(
            &ctx(),
            default_tenant_id(),
            &PruneRequest {
                keep_days: 0,
                keep_runs_per_device: 1,
                batch_size: 10,
                dry_run: false,
            },
        )
        .expect("prune");
    // One run pruned per device.
    assert_eq!(outcome.counts.runs, 2);

    for enrolled in [&first, &second] {
        let (_, total) = store
            .list_runs(default_tenant_id(), Some(enrolled.device.id), 10, 0)
            .expect("list");
        assert_eq!(total, 1);
    }
}

#[test]
fn prune_emits_an_audit_row() {
    let store = store();
    store
        .prune_runs(
            &ctx(),
            default_tenant_id(),
            &PruneRequest {
                keep_days: 0,
                keep_runs_per_device: 0,
                batch_size: 10,
                dry_run: false,
            },
        )
        .expect("prune");

    let page = store
        .audit_page(
            default_tenant_id(),
            &control_plane::AuditQuery {
                action: Some("maintenance.prune".to_string()),
                limit: 10,
                ..Default::default()
            },
        )
        .expect("audit page");
    assert_eq!(page.items.len(), 1);
}

#[test]
fn tenant_scope_limits_prune_targets() {
    let store = store();
    let tokens = tokens();
    let enrolled = enroll(&store, &tokens, "DEV1");
    post_run(&store, &enrolled, utcnow());

    let other_tenant = Uuid::from_u128(9);
    let preview = store.prune_runs(
        &ctx(),
        other_tenant,
        &PruneRequest {
            keep_days: 0,
            keep_runs_per_device: 0,
            batch_size: 10,
            dry_run: true,
        },
    );
    assert_eq!(preview.expect("dry run").runs_targeted, 0);
}
