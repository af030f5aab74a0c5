//! HTTP handler for the public submission form.
//! File parts are streamed straight into the object writer; nothing is
//! buffered beyond one chunk.

use crate::{
    errors::AppError,
    models::submission::SubmitterFields,
    services::intake_service::{IntakeService, PendingSubmission},
};
use axum::{
    Json,
    extract::{Multipart, State},
};
use futures::StreamExt;
use serde::Serialize;
use std::{collections::HashSet, io};
use tracing::debug;
use uuid::Uuid;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const DEFAULT_FILENAME: &str = "document";

/// The only part name whose files are stored.
const DOCUMENTS_FIELD: &str = "documents";

/// Text parts every submission carries.
const REQUIRED_FIELDS: [&str; 4] = ["fullName", "email", "paymentDate", "accountDetails"];

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub id: Uuid,
}

/// POST `/submit-poa`: multipart form with submitter fields and `documents`.
pub async fn submit_poa(
    State(service): State<IntakeService>,
    mut multipart: Multipart,
) -> Result<Json<SubmitResponse>, AppError> {
    let mut pending = service.begin_submission();
    let mut fields = SubmitterFields::default();

    if let Err(err) = drain_form(&mut multipart, &mut pending, &mut fields).await {
        pending.abort().await;
        return Err(err);
    }

    debug!(files = pending.file_count(), "submission form received");
    let submission = pending.commit(fields).await?;
    Ok(Json(SubmitResponse {
        success: true,
        id: submission.id,
    }))
}

async fn drain_form(
    multipart: &mut Multipart,
    pending: &mut PendingSubmission,
    fields: &mut SubmitterFields,
) -> Result<(), AppError> {
    let mut seen = HashSet::new();

    while let Some(field) = multipart.next_field().await? {
        let part_name = field.name().unwrap_or_default().to_string();

        let Some(file_name) = field.file_name().map(str::to_string) else {
            let value = field.text().await?;
            if fields.set(&part_name, value) {
                seen.insert(part_name);
            } else {
                debug!(field = %part_name, "ignoring unknown form field");
            }
            continue;
        };

        if part_name != DOCUMENTS_FIELD {
            debug!(field = %part_name, "ignoring file part outside `documents`");
            continue;
        }

        // Fields sent ahead of the files are checked before anything is stored.
        if REQUIRED_FIELDS.iter().all(|f| seen.contains(*f)) {
            fields.validate()?;
        }

        let content_type = field
            .content_type()
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let original_name = if file_name.is_empty() {
            DEFAULT_FILENAME.to_string()
        } else {
            file_name
        };

        let stream = field.map(|piece| piece.map_err(io::Error::other));
        let object = pending
            .add_file(stream, &content_type, &original_name)
            .await?;
        debug!(object = %object.name, size = object.size_bytes, "received document");
    }

    Ok(())
}
