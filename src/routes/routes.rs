//! Defines routes for the submission vault.
//!
//! ## Structure
//! - **Public**
//!   - `POST /submit-poa`: multipart submission (fields + `documents`)
//!
//! - **Administrator** (session cookie or bearer token)
//!   - `POST /admin/login` / `POST /admin/logout`
//!   - `GET  /admin/submissions`: newest first
//!   - `GET  /admin/submissions/{id}`
//!   - `GET  /admin/file/{file_id}`: streamed download
//!
//! - **Probes**: `GET /healthz`, `GET /readyz`

use crate::{
    handlers::{
        admin_handlers::{
            admin_login, admin_logout, download_file, get_submission, list_submissions,
        },
        health_handlers::{healthz, readyz},
        submission_handlers::submit_poa,
    },
    services::intake_service::IntakeService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build and return the router for all routes.
///
/// The router carries shared state (`IntakeService`) to all handlers.
/// `max_request_size` caps a whole request body, multipart included.
pub fn routes(max_request_size: usize) -> Router<IntakeService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // public intake
        .route("/submit-poa", post(submit_poa))
        // admin surface
        .route("/admin/login", post(admin_login))
        .route("/admin/logout", post(admin_logout))
        .route("/admin/submissions", get(list_submissions))
        .route("/admin/submissions/{id}", get(get_submission))
        .route("/admin/file/{file_id}", get(download_file))
        .layer(DefaultBodyLimit::max(max_request_size))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
