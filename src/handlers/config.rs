use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// The effective configuration after defaults, file and environment layering.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = serde_json::to_value(state.config.as_ref())?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config,
        "limits": {
            "max_workers": crate::config::MAX_WORKERS,
            "max_upload_bytes": state.config.upload.max_bytes(),
            "frame_bytes": state.config.audio.frame_bytes()
        }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::jobs::JobQueue;
    use crate::transcription::ModelManager;
    use actix_web::{test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_config_reflects_effective_values() {
        let mut config = AppConfig::default();
        config.jobs.worker_count = 3;
        let state = AppState::new(
            config,
            Arc::new(ModelManager::new("small", "cpu")),
            Arc::new(JobQueue::new()),
        );
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["jobs"]["worker_count"], 3);
        assert_eq!(body["config"]["models"]["whisper_model"], "small");
        assert_eq!(body["limits"]["frame_bytes"], 960);
    }
}
