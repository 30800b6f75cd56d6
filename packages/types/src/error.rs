use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// The stable error discriminators the gateway surfaces to callers.
/// Structured fields (retry-after, budget id) travel alongside the code in
/// the result types that carry it; the code itself maps 1:1 to an HTTP
/// status at the boundary.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    Validation,
    Unauthenticated,
    Forbidden,
    Conflict,
    RateLimited,
    CircuitOpen,
    ServerDisconnected,
    Timeout,
    BudgetExceeded,
    UpstreamFailure,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::ServerDisconnected => "SERVER_DISCONNECTED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::BudgetExceeded => "BUDGET_EXCEEDED",
            ErrorCode::UpstreamFailure => "UPSTREAM_FAILURE",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// HTTP status this code maps to at the boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::Validation => 400,
            ErrorCode::Unauthenticated => 401,
            ErrorCode::BudgetExceeded => 402,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::Conflict => 409,
            ErrorCode::RateLimited => 429,
            ErrorCode::ServerDisconnected | ErrorCode::CircuitOpen => 503,
            ErrorCode::Timeout => 504,
            ErrorCode::UpstreamFailure | ErrorCode::Internal => 500,
        }
    }
}

/// One field-level validation failure; a Validation error carries a list
/// of these.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ErrorCode::RateLimited.http_status(), 429);
        assert_eq!(ErrorCode::CircuitOpen.http_status(), 503);
        assert_eq!(ErrorCode::Timeout.http_status(), 504);
        assert_eq!(ErrorCode::Validation.http_status(), 400);
    }
}
