//! Session control endpoints
//!
//! These replace the on-screen microphone button: one call starts the
//! conversation, one ends it, and the status endpoint reports what the
//! indicator would show.

use crate::device::{DeviceManager, DeviceRole};
use crate::error::AppError;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

/// Optional per-session overrides. Anything left out comes from the config.
#[derive(Debug, Default, Deserialize)]
pub struct StartSessionRequest {
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
}

/// POST /api/v1/session/start
pub async fn start_session(
    state: web::Data<AppState>,
    body: Option<web::Json<StartSessionRequest>>,
) -> Result<HttpResponse, AppError> {
    let request = body.map(web::Json::into_inner).unwrap_or_default();

    let mut settings = state.get_config().session_settings();
    if let Some(voice) = request.voice {
        settings.live.voice = voice;
    }
    if let Some(instruction) = request.system_instruction {
        settings.live.system_instruction = instruction;
    }

    info!(voice = %settings.live.voice, "Session start requested over HTTP");
    let result = state.session.start(settings).await;
    state.record_control_request(result.is_err());
    let status = result?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": status
    })))
}

/// POST /api/v1/session/stop
pub async fn stop_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let result = state.session.stop().await;
    state.record_control_request(result.is_err());
    let status = result?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": status
    })))
}

/// GET /api/v1/session
pub async fn get_session(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": state.session.status()
    }))
}

/// GET /api/v1/devices
pub async fn list_devices(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let (inputs, outputs) = web::block(|| {
        (
            DeviceManager::list_devices(DeviceRole::Input),
            DeviceManager::list_devices(DeviceRole::Output),
        )
    })
    .await
    .map_err(|e| AppError::Internal(format!("device enumeration failed: {}", e)))?;

    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "input": {
            "selected": config.audio.input_device,
            "available": inputs
        },
        "output": {
            "selected": config.audio.output_device,
            "available": outputs
        }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpalDevices;
    use crate::state::tests::test_state;
    use crate::transport::WebSocketConnector;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_status_and_stop_when_idle() {
        let state = test_state(CpalDevices, WebSocketConnector);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/session", web::get().to(get_session))
                .route("/session/stop", web::post().to(stop_session)),
        )
        .await;

        let req = test::TestRequest::get().uri("/session").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session"]["state"], "idle");

        // Stopping an idle session is a no-op, not an error
        let req = test::TestRequest::post().uri("/session/stop").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["session"]["state"], "idle");
        assert_eq!(state.get_metrics_snapshot().control_requests, 1);
    }

    #[actix_web::test]
    async fn test_start_request_fields_are_optional() {
        let request: StartSessionRequest = serde_json::from_str("{}").unwrap();
        assert!(request.voice.is_none());

        let request: StartSessionRequest = serde_json::from_str(r#"{"voice": "Puck"}"#).unwrap();
        assert_eq!(request.voice.as_deref(), Some("Puck"));
    }
}
