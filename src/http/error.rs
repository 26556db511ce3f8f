//! Error responses.
//!
//! Every failure is rendered as `{"error": "<message>", "kind": "<class>"}` with the
//! status code chosen by its [`ErrorClass`]:
//!
//! | Class                | Status |
//! |----------------------|--------|
//! | `validation`         | 400    |
//! | `state_conflict`     | 409    |
//! | `hardware_transient` | 503    |
//! | `hardware_fatal`     | 503    |
//! | `internal`           | 500    |

use crate::error::{ErrorClass, ServiceError, ValidationError};
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Handler error wrapping a [`ServiceError`].
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl<E: Into<ServiceError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

/// Turn a body that does not deserialize into a validation error.
pub fn bad_body(rejection: JsonRejection) -> ApiError {
    ApiError(
        ValidationError::InvalidValue {
            field: "body",
            reason: rejection.body_text(),
        }
        .into(),
    )
}

pub(crate) fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Validation => StatusCode::BAD_REQUEST,
        ErrorClass::StateConflict => StatusCode::CONFLICT,
        ErrorClass::HardwareTransient | ErrorClass::HardwareFatal => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let class = self.0.class();
        let status = status_for(class);
        if status.is_server_error() {
            tracing::warn!(error = %self.0, kind = class.as_str(), "Request failed");
        } else {
            tracing::debug!(error = %self.0, kind = class.as_str(), "Request rejected");
        }
        let body = Json(json!({
            "error": self.0.to_string(),
            "kind": class.as_str(),
        }));
        (status, body).into_response()
    }
}
