//! HTTP handlers for the administrator surface.
//! Every handler hands the caller's session token to `IntakeService`, which
//! refuses with 403 unless the access gate admits it.

use crate::{
    errors::AppError,
    models::{object::StoredObject, submission::Submission},
    services::{access_gate::Credentials, intake_service::IntakeService},
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{FromRequestParts, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde::Serialize;
use std::convert::Infallible;
use tracing::warn;

/// Cookie carrying the admin session token.
pub const SESSION_COOKIE: &str = "admin_session";

/// Session token presented by the caller, from the `admin_session` cookie or
/// an `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct SessionToken(pub Option<String>);

impl SessionToken {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl<S> FromRequestParts<S> for SessionToken
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(token_from_headers(&parts.headers)))
    }
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub success: bool,
    pub message: &'static str,
}

/// POST `/admin/login`: optional JSON body `{"password": "..."}`.
pub async fn admin_login(
    State(service): State<IntakeService>,
    body: Bytes,
) -> Result<Response, AppError> {
    let credentials = if body.iter().all(u8::is_ascii_whitespace) {
        Credentials::default()
    } else {
        serde_json::from_slice::<Credentials>(&body)
            .map_err(|err| AppError::bad_request(format!("invalid login body: {}", err)))?
    };

    let session = service.login(&credentials)?;
    let max_age = (session.expires_at - session.created_at).num_seconds().max(0);
    let cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
        SESSION_COOKIE, session.token, max_age
    );

    let mut response = Json(AckResponse {
        success: true,
        message: "Logged in as admin",
    })
    .into_response();
    response.headers_mut().insert(
        header::SET_COOKIE,
        HeaderValue::from_str(&cookie).map_err(|err| AppError::internal(err.to_string()))?,
    );
    Ok(response)
}

/// POST `/admin/logout`
pub async fn admin_logout(
    State(service): State<IntakeService>,
    token: SessionToken,
) -> Result<Response, AppError> {
    service.logout(token.as_deref())?;

    let mut response = Json(AckResponse {
        success: true,
        message: "Logged out",
    })
    .into_response();
    let cleared = format!(
        "{}=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0",
        SESSION_COOKIE
    );
    if let Ok(value) = HeaderValue::from_str(&cleared) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    Ok(response)
}

/// GET `/admin/submissions`: newest first.
pub async fn list_submissions(
    State(service): State<IntakeService>,
    token: SessionToken,
) -> Result<Json<Vec<Submission>>, AppError> {
    Ok(Json(service.list_submissions(token.as_deref()).await?))
}

/// GET `/admin/submissions/{id}`
pub async fn get_submission(
    State(service): State<IntakeService>,
    token: SessionToken,
    Path(id): Path<String>,
) -> Result<Json<Submission>, AppError> {
    Ok(Json(service.get_submission(token.as_deref(), &id).await?))
}

/// GET `/admin/file/{file_id}`: stream a stored file as an attachment.
pub async fn download_file(
    State(service): State<IntakeService>,
    token: SessionToken,
    Path(file_id): Path<String>,
) -> Result<Response, AppError> {
    let download = service.fetch_file(token.as_deref(), &file_id).await?;
    let object = download.object;
    let name = object.name.clone();
    let stream = download.body.inspect_err(move |err| {
        warn!(object = %name, error = %err, "download aborted");
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    set_file_headers(response.headers_mut(), &object);
    Ok(response)
}

fn set_file_headers(headers: &mut HeaderMap, meta: &StoredObject) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&meta.size_bytes.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    if let Ok(value) = HeaderValue::from_str(&content_disposition(&meta.original_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    if let Some(md5) = meta.md5.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", md5)) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Some(completed_at) = meta.completed_at {
        let http_date = completed_at.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(value) = HeaderValue::from_str(&http_date) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
}

/// `attachment` disposition with an ASCII fallback name and an RFC 5987
/// `filename*` carrying the exact UTF-8 name.
fn content_disposition(original_name: &str) -> String {
    let fallback: String = original_name
        .chars()
        .map(|c| match c {
            ' '..='~' if c != '"' && c != '\\' => c,
            _ => '_',
        })
        .collect();

    let mut encoded = String::with_capacity(original_name.len() * 3);
    for byte in original_name.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'!'
            | b'#'
            | b'$'
            | b'&'
            | b'+'
            | b'-'
            | b'.'
            | b'^'
            | b'_'
            | b'`'
            | b'|'
            | b'~' => encoded.push(byte as char),
            other => encoded.push_str(&format!("%{:02X}", other)),
        }
    }

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback, encoded
    )
}

fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}
