//! REST handlers for segment management, membership updates and reports.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};
use utoipa::ToSchema;

use cohort_core::types::{Segment, User};
use cohort_core::CohortError;
use cohort_service::{Report, SegmentService, UpdateSummary};

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SegmentService>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateSegmentRequest {
    /// Unique human-readable segment key.
    pub slug: String,
    /// Share of the existing user base to auto-assign, 0..=100.
    #[serde(default)]
    pub auto_assign_percent: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DeleteSegmentRequest {
    pub slug: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateUserSegmentsRequest {
    pub user_id: i64,
    #[serde(default)]
    pub add_segments: Vec<String>,
    /// Seconds until added segments are automatically removed; 0 disables.
    #[serde(default)]
    pub ttl_seconds: i64,
    #[serde(default)]
    pub delete_segments: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub month: u32,
    pub year: i32,
}

#[derive(Serialize, ToSchema)]
pub struct UserSegmentsResponse {
    pub segments: Vec<String>,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map a service error onto a status code and a wire-safe payload.
/// Store internals never leak to the client.
fn into_api_error(e: CohortError) -> ApiError {
    let (status, kind, message) = match &e {
        CohortError::Invalid(msg) => (StatusCode::BAD_REQUEST, "invalid_request", msg.clone()),
        CohortError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
        CohortError::Duplicate(slug) => (
            StatusCode::CONFLICT,
            "duplicate_slug",
            format!("segment {slug} already exists"),
        ),
        CohortError::Timeout(_) => (
            StatusCode::GATEWAY_TIMEOUT,
            "store_timeout",
            "Store call timed out".to_string(),
        ),
        // The committed count matters to the caller; the failing step's
        // store detail stays in the log line below.
        CohortError::PartialUpdate { added, .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "partial_update",
            format!("{added} segment(s) added but the update did not complete"),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Internal server error".to_string(),
        ),
    };

    if status.is_server_error() {
        error!(error = %e, "Request failed");
        metrics::counter!("api.errors").increment(1);
    } else {
        warn!(error = %e, "Request rejected");
        metrics::counter!("api.client_errors").increment(1);
    }

    (
        status,
        Json(ErrorResponse {
            error: kind.to_string(),
            message,
        }),
    )
}

/// POST /user — create a user with a store-assigned id.
#[utoipa::path(
    post,
    path = "/user",
    tag = "Users",
    responses(
        (status = 201, description = "User created", body = User),
    )
)]
pub async fn create_user(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let user = state.service.create_user().await.map_err(into_api_error)?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// POST /segment — create a segment, optionally auto-assigning it.
#[utoipa::path(
    post,
    path = "/segment",
    tag = "Segments",
    request_body = CreateSegmentRequest,
    responses(
        (status = 201, description = "Segment created", body = Segment),
        (status = 400, description = "Invalid slug or percent", body = ErrorResponse),
        (status = 409, description = "Slug already taken", body = ErrorResponse),
    )
)]
pub async fn create_segment(
    State(state): State<AppState>,
    Json(request): Json<CreateSegmentRequest>,
) -> Result<(StatusCode, Json<Segment>), ApiError> {
    let segment = state
        .service
        .create_segment(&request.slug, request.auto_assign_percent)
        .await
        .map_err(into_api_error)?;
    metrics::counter!("api.segments_created").increment(1);
    Ok((StatusCode::CREATED, Json(segment)))
}

/// DELETE /segment — delete a segment by slug, cascading membership links.
#[utoipa::path(
    delete,
    path = "/segment",
    tag = "Segments",
    request_body = DeleteSegmentRequest,
    responses(
        (status = 204, description = "Segment deleted"),
        (status = 404, description = "No such segment", body = ErrorResponse),
    )
)]
pub async fn delete_segment(
    State(state): State<AppState>,
    Json(request): Json<DeleteSegmentRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .delete_segment(&request.slug)
        .await
        .map_err(into_api_error)?;
    metrics::counter!("api.segments_deleted").increment(1);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /segment/user — add and/or remove segments for one user.
#[utoipa::path(
    post,
    path = "/segment/user",
    tag = "Segments",
    request_body = UpdateUserSegmentsRequest,
    responses(
        (status = 200, description = "Membership updated", body = UpdateSummary),
        (status = 400, description = "Invalid request", body = ErrorResponse),
    )
)]
pub async fn update_user_segments(
    State(state): State<AppState>,
    Json(request): Json<UpdateUserSegmentsRequest>,
) -> Result<Json<UpdateSummary>, ApiError> {
    if request.add_segments.is_empty() && request.delete_segments.is_empty() {
        metrics::counter!("api.validation_errors").increment(1);
        return Err(into_api_error(CohortError::Invalid(
            "at least one of add_segments or delete_segments is required".into(),
        )));
    }

    let summary = state
        .service
        .update_user_segments(
            request.user_id,
            &request.add_segments,
            request.ttl_seconds,
            &request.delete_segments,
        )
        .await
        .map_err(into_api_error)?;
    metrics::counter!("api.membership_updates").increment(1);
    Ok(Json(summary))
}

/// GET /segment/user/{user_id} — active segments of a user.
#[utoipa::path(
    get,
    path = "/segment/user/{user_id}",
    tag = "Segments",
    params(("user_id" = i64, Path, description = "User id")),
    responses(
        (status = 200, description = "Active segments", body = UserSegmentsResponse),
        (status = 400, description = "Invalid user id", body = ErrorResponse),
    )
)]
pub async fn get_user_segments(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<UserSegmentsResponse>, ApiError> {
    let segments = state
        .service
        .list_user_segments(user_id)
        .await
        .map_err(into_api_error)?;
    Ok(Json(UserSegmentsResponse { segments }))
}

/// GET /segment/history/{user_id}?month=&year= — CSV report link for one
/// calendar month of membership history.
#[utoipa::path(
    get,
    path = "/segment/history/{user_id}",
    tag = "Reports",
    params(
        ("user_id" = i64, Path, description = "User id"),
        ("month" = u32, Query, description = "Calendar month, 1..=12"),
        ("year" = i32, Query, description = "Calendar year"),
    ),
    responses(
        (status = 200, description = "Report generated", body = Report),
        (status = 400, description = "Invalid month or year", body = ErrorResponse),
    )
)]
pub async fn get_user_history(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Report>, ApiError> {
    let report = state
        .service
        .user_history_report(user_id, query.month, query.year)
        .await
        .map_err(into_api_error)?;
    metrics::counter!("api.reports_generated").increment(1);
    Ok(Json(report))
}

/// GET /segment/reports/{file_name} — download a generated CSV report.
#[utoipa::path(
    get,
    path = "/segment/reports/{file_name}",
    tag = "Reports",
    params(("file_name" = String, Path, description = "Report file name")),
    responses(
        (status = 200, description = "CSV contents"),
        (status = 404, description = "No such report", body = ErrorResponse),
    )
)]
pub async fn download_report(
    State(state): State<AppState>,
    Path(file_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let path = state
        .service
        .report_path(&file_name)
        .map_err(into_api_error)?;

    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok((
            [
                (header::CONTENT_TYPE, "text/csv".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{file_name}\""),
                ),
            ],
            bytes,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(into_api_error(
            CohortError::NotFound(format!("report {file_name}")),
        )),
        Err(e) => Err(into_api_error(e.into())),
    }
}

/// GET /health — liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Operations",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_update_reports_the_count_without_store_details() {
        let (status, Json(body)) = into_api_error(CohortError::PartialUpdate {
            added: 2,
            reason: "segment removal failed: store error: link table unavailable".into(),
        });
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "partial_update");
        assert!(body.message.contains("2 segment(s) added"));
        assert!(!body.message.contains("link table"));
    }

    #[test]
    fn internal_errors_are_masked() {
        let (status, Json(body)) =
            into_api_error(CohortError::Store("dsn postgres://user:pw@db".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "internal_error");
        assert_eq!(body.message, "Internal server error");
    }
}
