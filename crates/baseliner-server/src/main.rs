mod error;
mod handlers;
mod middleware;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use control_plane::Settings;

use crate::handlers::*;
use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let settings = Settings::from_env()?;
    let state = Arc::new(AppState::from_settings(settings)?);

    let app = router(state.clone());

    info!("baseliner-server listening on {}", args.listen);
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    // Layer order per route (outermost first): body cap, deadline, rate
    // limit, auth. Correlation id wraps the whole app.
    let reports = Router::new()
        .route("/device/reports", post(submit_report))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::device_auth,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::reports_rate_limit,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::deadline_reports,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::body_cap_reports,
        ))
        .layer(DefaultBodyLimit::max(
            state.settings.max_body_bytes_device_reports,
        ));

    let device_routes = Router::new()
        .route("/device/policy", get(get_device_policy))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::device_auth,
        ));

    let admin_routes = Router::new()
        .route(
            "/admin/enroll-tokens",
            post(create_enroll_token).get(list_enroll_tokens),
        )
        .route("/admin/enroll-tokens/:id/revoke", post(revoke_enroll_token))
        .route("/admin/devices", get(list_devices))
        .route("/admin/devices/:id", delete(delete_device))
        .route("/admin/devices/:id/debug", get(debug_device))
        .route("/admin/devices/:id/restore", post(restore_device))
        .route("/admin/devices/:id/revoke-token", post(revoke_device_token))
        .route("/admin/devices/:id/tokens", get(device_token_history))
        .route("/admin/devices/:id/runs", get(device_runs))
        .route(
            "/admin/devices/:id/assignments",
            get(list_device_assignments).delete(clear_device_assignments),
        )
        .route(
            "/admin/devices/:id/assignments/:policy_id",
            delete(remove_device_assignment),
        )
        .route("/admin/policies", post(upsert_policy).get(list_policies))
        .route("/admin/policies/:id", get(get_policy))
        .route("/admin/assign-policy", post(assign_policy))
        .route("/admin/runs", get(list_runs))
        .route("/admin/runs/:id", get(get_run))
        .route("/admin/audit", get(list_audit))
        .route("/admin/maintenance/prune", post(prune_runs))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::admin_auth,
        ));

    let api = Router::new()
        .route("/enroll", post(enroll))
        .merge(device_routes)
        .merge(admin_routes)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::deadline_default,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::body_cap_default,
        ))
        .layer(DefaultBodyLimit::max(state.settings.max_body_bytes_default))
        .merge(reports);

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(middleware::correlation))
        .with_state(state)
}
