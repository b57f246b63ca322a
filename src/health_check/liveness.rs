use axum::response::{IntoResponse, Response};
use http::StatusCode;

/// If the process can schedule this handler at all, it's alive. No dependency checks here;
/// that's `readiness`'s job.
pub async fn handler() -> Response {
    StatusCode::OK.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_direct() {
        let response = handler().await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
