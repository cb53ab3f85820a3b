use crate::error::AppError;
use crate::handlers::upload::read_upload;
use crate::state::AppState;
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

/// Queue an uploaded file for background transcription. Returns at once.
pub async fn submit_job(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let upload = read_upload(payload, &state.config.upload).await?;
    let filename = upload.filename.clone();
    let bytes = upload.data.len();
    let request = upload.into_request(state.default_options())?;

    let job_id = state.jobs.submit(request)?;
    info!(%job_id, %filename, bytes, "transcription job submitted");

    Ok(HttpResponse::Accepted().json(json!({ "job_id": job_id })))
}

pub async fn get_job(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let raw = path.into_inner();
    let job_id = Uuid::parse_str(&raw)
        .map_err(|_| AppError::NotFound(format!("Job not found: {}", raw)))?;

    let job = state.jobs.get(job_id)?;
    Ok(HttpResponse::Ok().json(job))
}
