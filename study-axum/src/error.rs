use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use study_core::{ErrorKind, TenancyError};

/// Seconds a client should wait before retrying after backpressure.
pub const RETRY_AFTER_SECS: u64 = 1;

/// What the gate renders when a request cannot proceed.
///
/// Always a service-unavailable response; identifier and lookup failures
/// that reach this point get the generic body. Bodies never carry the
/// source chain.
#[derive(Debug)]
pub enum GateError {
    Tenancy(TenancyError),
    /// A downstream handler panicked; cleanup already ran.
    HandlerPanicked,
}

impl From<TenancyError> for GateError {
    fn from(e: TenancyError) -> Self {
        Self::Tenancy(e)
    }
}

impl GateError {
    pub fn status(&self) -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

fn unavailable_body(status: StatusCode) -> serde_json::Value {
    json!({
        "name": "Unavailable",
        "message": "The service is temporarily unavailable",
        "code": status.as_u16(),
        "className": "unavailable",
    })
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            GateError::Tenancy(err) => {
                let body = match err.kind() {
                    ErrorKind::Capacity | ErrorKind::Connectivity | ErrorKind::Catalog => err.to_json(),
                    _ => unavailable_body(status),
                };
                let mut response = (status, Json(body)).into_response();
                if matches!(err, TenancyError::Capacity { .. }) {
                    response
                        .headers_mut()
                        .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
                }
                response
            }
            GateError::HandlerPanicked => (status, Json(unavailable_body(status))).into_response(),
        }
    }
}
