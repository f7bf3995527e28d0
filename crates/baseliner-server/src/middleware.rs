use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use control_plane::{AuditContext, Device, TenantContext};

use crate::error::AppError;
use crate::state::AppState;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";
pub const TENANT_ID_HEADER: &str = "x-tenant-id";

#[derive(Clone, Debug)]
pub struct CorrelationId {
    pub value: String,
    pub client_supplied: bool,
}

impl CorrelationId {
    /// The id to persist for idempotency purposes: only values the client
    /// actually sent count, a generated one would defeat replay detection.
    pub fn client_value(&self) -> Option<&str> {
        self.client_supplied.then_some(self.value.as_str())
    }
}

#[derive(Clone)]
pub struct AdminContext {
    pub tenant: TenantContext,
    pub audit: AuditContext,
}

#[derive(Clone)]
pub struct AuthedDevice {
    pub device: Device,
    pub token_id: Uuid,
}

/// Outermost layer: validate or mint the correlation id, expose it to
/// handlers, echo it on the way out.
pub async fn correlation(mut req: Request, next: Next) -> Response {
    let supplied = req
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let (value, client_supplied) = match supplied {
        Some(raw) if is_safe_correlation_id(raw) => (raw.to_string(), true),
        _ => (Uuid::new_v4().to_string(), false),
    };
    req.extensions_mut().insert(CorrelationId {
        value: value.clone(),
        client_supplied,
    });

    let mut response = next.run(req).await;
    if let Ok(header_value) = HeaderValue::from_str(&value) {
        response
            .headers_mut()
            .insert(CORRELATION_ID_HEADER, header_value);
    }
    response
}

// 1-128 chars, leading alphanumeric, then alphanumeric plus . _ -
fn is_safe_correlation_id(value: &str) -> bool {
    if value.is_empty() || value.len() > 128 {
        return false;
    }
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

pub async fn body_cap_default(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    check_content_length(req.headers(), state.settings.max_body_bytes_default)?;
    Ok(next.run(req).await)
}

pub async fn body_cap_reports(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    check_content_length(req.headers(), state.settings.max_body_bytes_device_reports)?;
    Ok(next.run(req).await)
}

/// Fast-path rejection on the declared length; the per-route
/// `DefaultBodyLimit` backstops bodies that arrive without one.
fn check_content_length(headers: &HeaderMap, limit: usize) -> Result<(), AppError> {
    let Some(raw) = headers.get(header::CONTENT_LENGTH) else {
        return Ok(());
    };
    let declared = raw
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok());
    if let Some(received) = declared {
        if received > limit {
            return Err(AppError::too_large("request body too large")
                .with_details(serde_json::json!({ "limit": limit, "received": received })));
        }
    }
    Ok(())
}

pub async fn deadline_default(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    run_with_deadline(state.settings.request_timeout_seconds, req, next).await
}

pub async fn deadline_reports(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    run_with_deadline(
        state.settings.request_timeout_seconds_device_reports,
        req,
        next,
    )
    .await
}

async fn run_with_deadline(seconds: u64, req: Request, next: Next) -> Result<Response, AppError> {
    match tokio::time::timeout(Duration::from_secs(seconds), next.run(req)).await {
        Ok(response) => Ok(response),
        Err(_) => Err(AppError::timeout()),
    }
}

/// Rate limit for report ingestion, keyed by device when the bearer token
/// resolves, by source IP otherwise. Decisions happen before auth so a
/// flood of bad tokens still burns the IP bucket, not the handlers.
pub async fn reports_rate_limit(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let config = &state.settings.rate_limit;
    if !config.enabled {
        return Ok(next.run(req).await);
    }

    let device_id = bearer_token(req.headers())
        .and_then(|token| state.store.device_id_for_token(&state.tokens, &token));
    let decision = match device_id {
        Some(id) => state.limiter.check(
            &format!("device:{id}"),
            config.reports_burst,
            config.reports_per_minute,
        ),
        None => state.limiter.check(
            &format!("ip:{}", client_ip(&req)),
            config.reports_ip_burst,
            config.reports_ip_per_minute,
        ),
    };
    if !decision.allowed {
        return Err(AppError::rate_limited(decision.retry_after_seconds));
    }
    Ok(next.run(req).await)
}

pub async fn admin_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let provided = req
        .headers()
        .get(ADMIN_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| AppError::missing_credentials("missing admin key"))?;
    if !constant_time_eq(provided.as_bytes(), state.settings.admin_key.as_bytes()) {
        return Err(AppError::unauthorized("invalid admin key"));
    }

    let tenant = TenantContext::from_header(
        req.headers()
            .get(TENANT_ID_HEADER)
            .and_then(|value| value.to_str().ok()),
    )
    .map_err(AppError::bad_request)?;

    // Audit rows carry a peppered hash of the key, never the key itself.
    // The "admin:" domain separator keeps it from colliding with token
    // hashes.
    let actor_id = state.tokens.hash(&format!("admin:{provided}"));
    let correlation = req
        .extensions()
        .get::<CorrelationId>()
        .map(|cid| cid.value.clone());
    let audit = AuditContext::admin(actor_id)
        .with_correlation(correlation)
        .with_request(
            req.method().as_str(),
            req.uri().path(),
            Some(client_ip(&req)),
        );

    req.extensions_mut().insert(AdminContext { tenant, audit });
    Ok(next.run(req).await)
}

pub async fn device_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(req.headers())
        .ok_or_else(|| AppError::missing_credentials("missing bearer token"))?;
    let (device, auth_token) = state.store.authenticate_device(&state.tokens, &token)?;
    req.extensions_mut().insert(AuthedDevice {
        device,
        token_id: auth_token.id,
    });
    Ok(next.run(req).await)
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn client_ip(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn echo_app() -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn(correlation))
    }

    #[tokio::test]
    async fn client_correlation_id_is_echoed() {
        let response = echo_app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header(CORRELATION_ID_HEADER, "cid-abc")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.headers()[CORRELATION_ID_HEADER], "cid-abc");
    }

    #[tokio::test]
    async fn invalid_correlation_id_is_replaced_with_uuid() {
        let response = echo_app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header(CORRELATION_ID_HEADER, "!!bad value!!")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let echoed = response.headers()[CORRELATION_ID_HEADER]
            .to_str()
            .expect("header");
        assert_ne!(echoed, "!!bad value!!");
        assert!(Uuid::parse_str(echoed).is_ok());
    }

    #[tokio::test]
    async fn missing_correlation_id_is_generated() {
        let response = echo_app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let echoed = response.headers()[CORRELATION_ID_HEADER]
            .to_str()
            .expect("header");
        assert!(Uuid::parse_str(echoed).is_ok());
    }

    #[test]
    fn safe_correlation_id_rules() {
        assert!(is_safe_correlation_id("cid-abc"));
        assert!(is_safe_correlation_id("a1.b2_c3-d4"));
        assert!(!is_safe_correlation_id(""));
        assert!(!is_safe_correlation_id("-leading-dash"));
        assert!(!is_safe_correlation_id("has space"));
        assert!(!is_safe_correlation_id(&"x".repeat(129)));
    }

    #[test]
    fn admin_key_compare_rejects_prefix_and_case() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"Secret"));
    }
}
