use crate::error::AppError;
use crate::handlers::upload::read_upload;
use crate::state::AppState;
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use tracing::info;

/// Transcribe an uploaded file within the request.
///
/// Normalization and inference run on actix's blocking pool; the engine gate
/// still serializes this request with jobs and streaming sessions.
pub async fn transcribe_file(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    if !state.manager.is_ready() {
        return Err(AppError::ServiceUnavailable("Model not loaded".to_string()));
    }

    let upload = read_upload(payload, &state.config.upload).await?;
    let filename = upload.filename.clone();
    let request = upload.into_request(state.default_options())?;

    let manager = state.manager.clone();
    let normalizer = state.normalizer.clone();
    let result = web::block(move || {
        let pcm = normalizer.normalize(&request.audio, request.format_hint.as_deref())?;
        manager.transcribe(&pcm, &request.options)
    })
    .await
    .map_err(|e| AppError::Internal(format!("Transcription task failed: {}", e)))??;

    info!(
        %filename,
        language = %result.language,
        processing_secs = result.processing_time_seconds,
        "synchronous transcription finished"
    );
    Ok(HttpResponse::Ok().json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::normalizer::encode_wav;
    use crate::config::AppConfig;
    use crate::handlers::upload::testing::multipart_request;
    use crate::jobs::JobQueue;
    use crate::transcription::engine::testing::FakeEngine;
    use crate::transcription::ModelManager;
    use actix_web::{test, App};
    use std::sync::Arc;

    fn state(ready: bool) -> AppState {
        let mut config = AppConfig::default();
        config.transcode.ffmpeg_path = "/nonexistent/ffmpeg".to_string();
        let manager = Arc::new(ModelManager::new("small", "cpu"));
        if ready {
            manager.install(Box::new(FakeEngine::new()), "cpu");
        }
        AppState::new(config, manager, Arc::new(JobQueue::new()))
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .route("/api/v1/transcribe", web::post().to(transcribe_file)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_wav_upload_transcribed() {
        let app = app!(state(true));

        let tone: Vec<i16> = (0..8000).map(|i| ((i as f32 * 0.2).sin() * 8000.0) as i16).collect();
        let wav = encode_wav(&tone, 16000, 1);
        let req = multipart_request("/api/v1/transcribe", "hello.wav", &wav, &[("language", "es")]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["text"], "speech 8000 samples");
        assert_eq!(body["language"], "es");
        assert!(body["processing_time_seconds"].is_number());
    }

    #[actix_web::test]
    async fn test_not_ready_is_503() {
        let app = app!(state(false));

        let wav = encode_wav(&[0i16; 1600], 16000, 1);
        let req = multipart_request("/api/v1/transcribe", "hello.wav", &wav, &[]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 503);
    }

    #[actix_web::test]
    async fn test_undecodable_audio_is_400() {
        let app = app!(state(true));

        let req = multipart_request("/api/v1/transcribe", "broken.wav", b"not audio at all", &[]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert!(body["error"]["message"].as_str().unwrap().contains("Could not decode audio"));
    }

    #[actix_web::test]
    async fn test_missing_file_is_400() {
        let app = app!(state(true));

        let req = test::TestRequest::post()
            .uri("/api/v1/transcribe")
            .insert_header((
                actix_web::http::header::CONTENT_TYPE,
                "multipart/form-data; boundary=xyz",
            ))
            .set_payload("--xyz\r\nContent-Disposition: form-data; name=\"language\"\r\n\r\nen\r\n--xyz--\r\n")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
    }
}
