use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;

use toolgrid_types::ErrorCode;

use crate::budget::BudgetError;
use crate::gateway::GatewayError;
use crate::pool::error::PoolError;
use crate::registry::semantic::SearchError;
use crate::storage::StorageError;
use crate::webhook::WebhookError;
use crate::workflow::WorkflowError;

/// Error half of the response envelope. Everything the kernel can throw
/// funnels into this one shape so the status mapping and `Retry-After`
/// handling live in exactly one place.
#[derive(Debug)]
pub struct HttpError {
    pub code: ErrorCode,
    pub message: String,
    pub retry_after_ms: Option<u64>,
    pub request_id: Option<String>,
}

pub type HttpResult<T> = Result<T, HttpError>;

impl HttpError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after_ms: None,
            request_id: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn with_retry_after(mut self, retry_after_ms: Option<u64>) -> Self {
        self.retry_after_ms = retry_after_ms;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // production mode hides internal detail from callers
        let message = if self.code == ErrorCode::Internal && !cfg!(debug_assertions) {
            tracing::error!(error = %self.message, "internal error");
            "Internal error".to_string()
        } else {
            self.message
        };

        let body = Json(json!({
            "success": false,
            "error": message,
            "code": self.code.as_str(),
            "timestamp": Utc::now(),
            "requestId": self.request_id,
        }));

        let mut response = (status, body).into_response();
        if let Some(retry_after_ms) = self.retry_after_ms {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<StorageError> for HttpError {
    fn from(err: StorageError) -> Self {
        let code = match &err {
            StorageError::NotFound(_) => ErrorCode::NotFound,
            StorageError::Conflict(_) => ErrorCode::Conflict,
            StorageError::Retention(_) => ErrorCode::Validation,
            _ => ErrorCode::Internal,
        };
        Self::new(code, err.to_string())
    }
}

impl From<GatewayError> for HttpError {
    fn from(err: GatewayError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<PoolError> for HttpError {
    fn from(err: PoolError) -> Self {
        HttpError::from(GatewayError::Pool(err))
    }
}

impl From<WorkflowError> for HttpError {
    fn from(err: WorkflowError) -> Self {
        let code = match &err {
            WorkflowError::NotFound(_) => ErrorCode::NotFound,
            WorkflowError::Disabled(_) => ErrorCode::Validation,
            WorkflowError::BudgetDenied { .. } => ErrorCode::BudgetExceeded,
            WorkflowError::Storage(storage) => return HttpError::from_storage_ref(storage, &err),
            WorkflowError::Budget(_) => ErrorCode::Internal,
        };
        Self::new(code, err.to_string())
    }
}

impl HttpError {
    fn from_storage_ref(storage: &StorageError, outer: &dyn std::fmt::Display) -> Self {
        let code = match storage {
            StorageError::NotFound(_) => ErrorCode::NotFound,
            StorageError::Conflict(_) => ErrorCode::Conflict,
            _ => ErrorCode::Internal,
        };
        Self::new(code, outer.to_string())
    }
}

impl From<WebhookError> for HttpError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::NotFound(id) => Self::not_found(format!("Subscription not found: {id}")),
            WebhookError::Storage(storage) => storage.into(),
        }
    }
}

impl From<BudgetError> for HttpError {
    fn from(err: BudgetError) -> Self {
        match err {
            BudgetError::Storage(storage) => storage.into(),
        }
    }
}

impl From<SearchError> for HttpError {
    fn from(err: SearchError) -> Self {
        let code = match &err {
            SearchError::Disabled => ErrorCode::Validation,
            SearchError::Embed(_) => ErrorCode::UpstreamFailure,
            SearchError::Storage(_) => ErrorCode::Internal,
        };
        Self::new(code, err.to_string())
    }
}

impl From<anyhow::Error> for HttpError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(ErrorCode::Internal, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_header_rounds_up_to_seconds() {
        let response = HttpError::new(ErrorCode::RateLimited, "slow down")
            .with_retry_after(Some(1500))
            .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "2");
    }

    #[test]
    fn status_codes_follow_error_codes() {
        let response = HttpError::not_found("nope").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = HttpError::new(ErrorCode::CircuitOpen, "open").into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
