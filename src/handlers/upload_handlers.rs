//! HTTP handlers for uploads and their parts.
//! Each handler is a thin adapter over one `Coordinator` operation; the final
//! object is streamed to avoid buffering it in memory.

use crate::{
    errors::AppError,
    models::{
        part::{Part, PartReport},
        upload::{NewUpload, Upload},
    },
    services::coordinator::{Coordinator, PartReceipt},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use uuid::Uuid;

/// `POST /uploads`: open an upload.
pub async fn create_upload(
    State(coordinator): State<Coordinator>,
    Json(request): Json<NewUpload>,
) -> Result<impl IntoResponse, AppError> {
    let upload = coordinator.create_upload(request).await?;
    let location = format!("/uploads/{}", upload.id);

    let mut response = (StatusCode::CREATED, Json(upload)).into_response();
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    Ok(response)
}

/// `GET /uploads/{id}`
pub async fn get_upload(
    State(coordinator): State<Coordinator>,
    Path(upload_id): Path<Uuid>,
) -> Result<Json<Upload>, AppError> {
    Ok(Json(coordinator.get_upload(upload_id).await?))
}

/// `DELETE /uploads/{id}`: forget an upload. Blobs are not removed.
pub async fn delete_upload(
    State(coordinator): State<Coordinator>,
    Path(upload_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    coordinator.delete_upload(upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /uploads/{id}/parts`
pub async fn get_upload_parts(
    State(coordinator): State<Coordinator>,
    Path(upload_id): Path<Uuid>,
) -> Result<Json<Vec<Part>>, AppError> {
    Ok(Json(coordinator.get_upload_parts(upload_id).await?))
}

/// `PUT /uploads/{id}/parts/{part_number}`: report a part uploaded or failed.
pub async fn report_part(
    State(coordinator): State<Coordinator>,
    Path((upload_id, part_number)): Path<(Uuid, i64)>,
    Json(report): Json<PartReport>,
) -> Result<Json<PartReceipt>, AppError> {
    Ok(Json(
        coordinator
            .report_part(upload_id, part_number, report)
            .await?,
    ))
}

/// `GET /uploads/{id}/object`: stream the assembled object.
pub async fn get_final_object(
    State(coordinator): State<Coordinator>,
    Path(upload_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let (upload, stream) = coordinator.final_object(upload_id).await?;

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&upload.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(upload.size.max(0)));
    Ok(response)
}
