use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use control_plane::{
    AssignmentError, CompileError, ConfigError, IngestError, MaintenanceError, PolicyError,
    RegistryError, StoreError, TokenCheck,
};

/// Central error mapper: every handler failure funnels through here so the
/// wire shape `{"error": {"type", "message", "details"}}` and the status
/// mapping live in exactly one place.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    details: Option<Value>,
    retry_after: Option<u64>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl AppError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            details: None,
            retry_after: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "input.malformed", message)
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "input.schema", message)
    }

    pub fn too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, "input.too_large", message)
    }

    pub fn missing_credentials(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "auth.missing", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "auth.invalid", message)
    }

    pub fn revoked(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "auth.revoked", message)
    }

    pub fn device_inactive(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "auth.device_inactive", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "resource.not_found", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "resource.conflict", message)
    }

    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        let mut err = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate.limited",
            "rate limit exceeded",
        );
        err.retry_after = Some(retry_after_seconds);
        err
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "server.internal", message)
    }

    pub fn timeout() -> Self {
        Self::new(
            StatusCode::GATEWAY_TIMEOUT,
            "server.timeout",
            "request deadline exceeded",
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: ErrorDetail {
                kind: self.kind,
                message: self.message,
                details: self.details,
            },
        });
        let mut response = (self.status, body).into_response();
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.status.as_u16(), self.kind, self.message)
    }
}

impl std::error::Error for AppError {}

// Store/SQL detail never leaks to clients; it is logged and replaced with a
// generic message.
impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "store failure");
        AppError::internal("storage failure")
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Store(inner) => inner.into(),
            RegistryError::NotFound(what) => AppError::not_found(format!("{what} not found")),
            RegistryError::DeviceInactive => AppError::device_inactive("device is deactivated"),
            RegistryError::Conflict(detail) => AppError::conflict(detail),
            RegistryError::EnrollToken(check) => match check {
                TokenCheck::Used => AppError::unauthorized("enroll token already used"),
                TokenCheck::Expired => AppError::unauthorized("enroll token expired"),
                TokenCheck::Revoked => AppError::unauthorized("enroll token revoked"),
                _ => AppError::unauthorized("invalid enroll token"),
            },
            RegistryError::DeviceToken(check) => match check {
                TokenCheck::Revoked => AppError::revoked("device token revoked"),
                _ => AppError::unauthorized("invalid device token"),
            },
        }
    }
}

impl From<PolicyError> for AppError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::Store(inner) => inner.into(),
            PolicyError::NotFound => AppError::not_found("policy not found"),
            PolicyError::Document(errors) => {
                AppError::schema("policy document invalid").with_details(
                    serde_json::to_value(errors).unwrap_or(Value::Null),
                )
            }
        }
    }
}

impl From<AssignmentError> for AppError {
    fn from(err: AssignmentError) -> Self {
        match err {
            AssignmentError::Store(inner) => inner.into(),
            AssignmentError::DeviceNotFound => AppError::not_found("device not found"),
            AssignmentError::PolicyNotFound => AppError::not_found("policy not found"),
            AssignmentError::AssignmentNotFound => AppError::not_found("assignment not found"),
        }
    }
}

impl From<CompileError> for AppError {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::Store(inner) => inner.into(),
            CompileError::DeviceNotFound => AppError::not_found("device not found"),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Store(inner) => inner.into(),
            IngestError::TooLarge(detail) => AppError::too_large(detail),
            IngestError::Schema { path, message } => {
                AppError::schema(format!("{path}: {message}"))
            }
        }
    }
}

impl From<MaintenanceError> for AppError {
    fn from(err: MaintenanceError) -> Self {
        match err {
            MaintenanceError::Store(inner) => inner.into(),
            MaintenanceError::Invalid(detail) => AppError::bad_request(detail),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::internal(err.to_string())
    }
}
