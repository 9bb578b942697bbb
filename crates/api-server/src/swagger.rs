//! OpenAPI specification and Swagger UI configuration.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Cohort API",
        version = "0.1.0",
        description = "Dynamic user segmentation: named segments, random-percentage auto-assignment, TTL-based expiration and CSV history reports.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Segments", description = "Segment lifecycle and per-user membership"),
        (name = "Users", description = "User creation"),
        (name = "Reports", description = "Membership history exports"),
        (name = "Operations", description = "Health probes"),
    ),
    paths(
        crate::rest::create_user,
        crate::rest::create_segment,
        crate::rest::delete_segment,
        crate::rest::update_user_segments,
        crate::rest::get_user_segments,
        crate::rest::get_user_history,
        crate::rest::download_report,
        crate::rest::health_check,
    ),
    components(schemas(
        cohort_core::types::Segment,
        cohort_core::types::User,
        cohort_core::types::MembershipOp,
        cohort_core::types::HistoryRecord,
        cohort_service::Report,
        cohort_service::UpdateSummary,
        crate::rest::CreateSegmentRequest,
        crate::rest::DeleteSegmentRequest,
        crate::rest::UpdateUserSegmentsRequest,
        crate::rest::UserSegmentsResponse,
        crate::rest::HealthResponse,
        crate::rest::ErrorResponse,
    ))
)]
pub struct ApiDoc;
