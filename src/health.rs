use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Readiness of the service. Always 200 so load balancers can read the body;
/// `status` says whether transcription requests will succeed.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let engine = state.manager.health();
    let config = &state.config;

    HttpResponse::Ok().json(json!({
        "status": if engine.loaded { "healthy" } else { "model_not_loaded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "version": env!("CARGO_PKG_VERSION"),
        "model_loaded": engine.loaded,
        "device": engine.device,
        "model_size": engine.model_size,
        "engine": engine,
        "jobs": state.jobs.stats(),
        "sessions": session_status(state.active_sessions(), config.performance.max_concurrent_sessions),
        "memory": get_memory_info(),
    }))
}

pub async fn service_info() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "/api/v1/health",
            "transcribe": "/api/v1/transcribe",
            "jobs": "/api/v1/jobs",
            "job_status": "/api/v1/jobs/{job_id}",
            "config": "/api/v1/config",
            "streaming": "/ws/transcribe"
        }
    }))
}

pub async fn ping() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "message": "pong" }))
}

fn session_status(active: usize, max: usize) -> serde_json::Value {
    let usage = if max > 0 { active as f64 / max as f64 } else { 0.0 };
    let load = if usage > 0.9 {
        "high_load"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "active": active,
        "max": max,
        "usage_percent": (usage * 100.0).round(),
        "load": load
    })
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map_or(0, |kb| kb * 1024)
            };
            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::jobs::JobQueue;
    use crate::transcription::engine::testing::FakeEngine;
    use crate::transcription::ModelManager;
    use actix_web::{test as actix_test, App};
    use std::sync::Arc;

    fn state(ready: bool) -> AppState {
        let manager = Arc::new(ModelManager::new("small", "auto"));
        if ready {
            manager.install(Box::new(FakeEngine::new()), "cpu");
        }
        AppState::new(AppConfig::default(), manager, Arc::new(JobQueue::new()))
    }

    #[actix_web::test]
    async fn test_health_reports_model_state() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state(false)))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "model_not_loaded");
        assert_eq!(body["model_loaded"], false);
        assert_eq!(body["engine"]["status"], "loading");
        assert_eq!(body["model_size"], "small");
        assert_eq!(body["jobs"]["queued"], 0);
    }

    #[actix_web::test]
    async fn test_health_when_ready() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state(true)))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["device"], "cpu");
        assert_eq!(body["sessions"]["load"], "normal");
    }

    #[actix_web::test]
    async fn test_ping() {
        let app = actix_test::init_service(App::new().route("/ping", web::get().to(ping))).await;
        let req = actix_test::TestRequest::get().uri("/ping").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["message"], "pong");
    }

    #[test]
    fn test_session_load_levels() {
        assert_eq!(session_status(0, 10)["load"], "normal");
        assert_eq!(session_status(8, 10)["load"], "moderate_load");
        assert_eq!(session_status(10, 10)["load"], "high_load");
        assert_eq!(session_status(3, 0)["usage_percent"], 0.0);
    }
}
