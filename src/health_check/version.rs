use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;

pub async fn handler() -> Response {
    let msg = serde_json::json!({
        "build_profile": if cfg!(debug_assertions) { "debug" } else { "release" },
        "version": option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
    });

    (StatusCode::OK, Json(msg)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Deserialize;

    #[tokio::test]
    async fn test_handler_direct() {
        let response = handler().await;
        assert_eq!(response.status(), StatusCode::OK);

        // todo: test the contents at least a little bit...
    }
}
