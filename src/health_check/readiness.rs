use axum::response::{IntoResponse, Response};
use http::StatusCode;

use super::data_source::{DataSourceError, StateDataSource};

pub async fn handler(data_source: StateDataSource) -> Response {
    match data_source.is_ready().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(DataSourceError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(DataSourceError::DependencyFailure) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
