use chrono::{DateTime, Utc};
use serde::Serialize;

/// The success half of the response envelope; errors are produced by
/// [`HttpError`](super::error::HttpError) with the same outer shape.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    pub data: T,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T, request_id: impl Into<Option<String>>) -> axum::Json<Self> {
        axum::Json(Self {
            success: true,
            data,
            timestamp: Utc::now(),
            request_id: request_id.into(),
        })
    }
}
