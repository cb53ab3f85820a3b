//! Multipart upload parsing shared by the batch and synchronous endpoints.
//!
//! The form carries one `file` part plus optional `language` and `task`
//! text parts. Extension and size limits are enforced while the body
//! streams in, so an oversized upload is rejected without buffering it.

use crate::config::UploadConfig;
use crate::error::AppError;
use crate::jobs::TranscriptionRequest;
use crate::transcription::TranscribeOptions;
use actix_multipart::{Field, Multipart};
use futures_util::TryStreamExt;
use tracing::debug;

/// Text parts are hints, never content.
const MAX_TEXT_FIELD_BYTES: usize = 256;

#[derive(Debug)]
pub struct Upload {
    pub filename: String,
    /// Lowercase, already checked against the allow list
    pub extension: String,
    pub data: Vec<u8>,
    pub language: Option<String>,
    pub task: Option<String>,
}

impl Upload {
    /// Combine the upload with the server's default options.
    pub fn into_request(self, defaults: TranscribeOptions) -> Result<TranscriptionRequest, AppError> {
        let options = defaults.with_hints(self.language.as_deref(), self.task.as_deref())?;
        Ok(TranscriptionRequest {
            audio: self.data,
            format_hint: Some(self.extension),
            filename: Some(self.filename),
            options,
        })
    }
}

pub async fn read_upload(mut payload: Multipart, limits: &UploadConfig) -> Result<Upload, AppError> {
    let mut file: Option<(String, String, Vec<u8>)> = None;
    let mut language = None;
    let mut task = None;

    while let Some(field) = payload.try_next().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                if file.is_some() {
                    return Err(AppError::ValidationError("Only one file per request".to_string()));
                }
                file = Some(read_file(field, limits).await?);
            }
            Some("language") => language = Some(read_text(field).await?),
            Some("task") => task = Some(read_text(field).await?),
            other => {
                debug!(field = ?other, "ignoring unknown form field");
                drain(field).await?;
            }
        }
    }

    let (filename, extension, data) =
        file.ok_or_else(|| AppError::ValidationError("No file provided".to_string()))?;
    if data.is_empty() {
        return Err(AppError::ValidationError("Uploaded file is empty".to_string()));
    }

    Ok(Upload { filename, extension, data, language, task })
}

async fn read_file(mut field: Field, limits: &UploadConfig) -> Result<(String, String, Vec<u8>), AppError> {
    let filename = field
        .content_disposition()
        .and_then(|cd| cd.get_filename())
        .map(str::to_string)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::ValidationError("No file provided".to_string()))?;

    let extension = limits.allowed_extension(&filename).ok_or_else(|| {
        AppError::ValidationError(format!(
            "File type not allowed. Allowed: {}",
            limits.allowed_extensions.join(", ")
        ))
    })?;

    let max_bytes = limits.max_bytes();
    let mut data = Vec::new();
    while let Some(chunk) = field.try_next().await? {
        if data.len() + chunk.len() > max_bytes {
            return Err(AppError::ValidationError(format!(
                "File too large. Maximum size: {}MB",
                limits.max_file_size_mb
            )));
        }
        data.extend_from_slice(&chunk);
    }

    debug!(%filename, bytes = data.len(), "upload received");
    Ok((filename, extension, data))
}

async fn read_text(mut field: Field) -> Result<String, AppError> {
    let mut data = Vec::new();
    while let Some(chunk) = field.try_next().await? {
        if data.len() + chunk.len() > MAX_TEXT_FIELD_BYTES {
            return Err(AppError::ValidationError("Form field too long".to_string()));
        }
        data.extend_from_slice(&chunk);
    }
    String::from_utf8(data)
        .map(|text| text.trim().to_string())
        .map_err(|_| AppError::ValidationError("Form field is not valid UTF-8".to_string()))
}

async fn drain(mut field: Field) -> Result<(), AppError> {
    while field.try_next().await?.is_some() {}
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use actix_web::http::header;
    use actix_web::test::TestRequest;

    const BOUNDARY: &str = "----stt-gateway-test-boundary";

    /// A POST carrying a multipart form with one file and optional text fields.
    pub fn multipart_request(uri: &str, filename: &str, data: &[u8], fields: &[(&str, &str)]) -> TestRequest {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                BOUNDARY, filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        TestRequest::post()
            .uri(uri)
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(body)
    }
}
