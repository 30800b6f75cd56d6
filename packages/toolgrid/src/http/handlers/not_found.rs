use axum::response::IntoResponse;

use crate::http::error::HttpError;

pub async fn handle_not_found() -> impl IntoResponse {
    HttpError::not_found("No such endpoint")
}
