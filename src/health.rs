use crate::device::DeviceManager;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let session = state.session.status();
    let metrics = state.get_metrics_snapshot();

    // Device enumeration can block on some hosts
    let devices = web::block(DeviceManager::get_device_summary).await.ok();
    let devices_ok = devices
        .as_ref()
        .map(|d| d.input_available && d.output_available)
        .unwrap_or(false);

    HttpResponse::Ok().json(json!({
        "status": if devices_ok { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "session": session,
        "live": {
            "model": config.live.model,
            "voice": config.live.voice,
            "api_key_set": !config.live.api_key.is_empty()
        },
        "devices": devices,
        "status_clients": metrics.status_clients,
        "memory": get_memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let session = state.session.metrics();
    let app = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "session": session,
        "control": {
            "requests": app.control_requests,
            "errors": app.control_errors,
            "error_rate": if app.control_requests > 0 {
                app.control_errors as f64 / app.control_requests as f64
            } else {
                0.0
            },
            "status_clients": app.status_clients
        },
        "audio": {
            "chunk_drop_rate": if session.audio_chunks_received > 0 {
                session.malformed_chunks as f64 / session.audio_chunks_received as f64
            } else {
                0.0
            },
            "frames_per_second": if uptime_seconds > 0 {
                session.frames_sent as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                let kb = || {
                    line.split_whitespace()
                        .nth(1)
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(0)
                        * 1024
                };
                if line.starts_with("VmRSS:") {
                    vm_rss = kb();
                } else if line.starts_with("VmSize:") {
                    vm_size = kb();
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
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
    use crate::device::CpalDevices;
    use crate::state::tests::test_state;
    use crate::transport::WebSocketConnector;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_idle_session() {
        let state = test_state(CpalDevices, WebSocketConnector);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session"]["state"], "idle");
        assert_eq!(body["live"]["api_key_set"], false);
        assert!(body["status"] == "healthy" || body["status"] == "degraded");
    }

    #[actix_web::test]
    async fn test_metrics_start_at_zero() {
        let state = test_state(CpalDevices, WebSocketConnector);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session"]["sessions_started"], 0);
        assert_eq!(body["control"]["requests"], 0);
    }
}
