//! Defines routes for upload and part operations.
//!
//! ## Structure
//! - **Upload-level endpoints**
//!   - `POST   /uploads` - open an upload
//!   - `GET    /uploads/{id}` - upload status
//!   - `DELETE /uploads/{id}` - remove the upload and its parts from the ledger
//!   - `GET    /uploads/{id}/object` - stream the assembled object
//!
//! - **Part-level endpoints**
//!   - `GET    /uploads/{id}/parts` - all parts in part order
//!   - `PUT    /uploads/{id}/parts/{part_number}` - report a part uploaded or failed

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        request_log::log_requests,
        upload_handlers::{
            create_upload, delete_upload, get_final_object, get_upload, get_upload_parts,
            report_part,
        },
    },
    services::coordinator::Coordinator,
};
use axum::{
    Router, middleware,
    routing::{get, post, put},
};

/// Build the router. Every handler receives the shared `Coordinator` as state.
pub fn routes() -> Router<Coordinator> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/uploads", post(create_upload))
        .route("/uploads/{id}", get(get_upload).delete(delete_upload))
        .route("/uploads/{id}/object", get(get_final_object))
        .route("/uploads/{id}/parts", get(get_upload_parts))
        .route("/uploads/{id}/parts/{part_number}", put(report_part))
        .layer(middleware::from_fn(log_requests))
}
