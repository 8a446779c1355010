//! # Application State Management
//!
//! Shared state handed to every HTTP handler and status socket.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers hold a reference to the same value
//! - **RwLock**: many readers OR one writer at a time
//!
//! ### Handles instead of locks
//! The voice session itself is not behind a lock. It lives on its own thread
//! and is reached through a [`SessionHandle`], which is cheap to clone and
//! only carries channels.

use crate::audio::session::SessionHandle;
use crate::config::AppConfig;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime; applies to the next session)
    pub config: Arc<RwLock<AppConfig>>,

    /// Front door to the session controller thread
    pub session: SessionHandle,

    /// Service-level counters
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Service-level counters, next to the session counters kept by the controller.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Start/stop requests received over HTTP or the status socket
    pub control_requests: u64,

    /// Control requests that returned an error
    pub control_errors: u64,

    /// Status sockets currently connected
    pub status_clients: u32,
}

impl AppState {
    pub fn new(config: AppConfig, session: SessionHandle) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            session,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; the lock is released immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    fn with_metrics(&self, f: impl FnOnce(&mut AppMetrics)) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics);
    }

    pub fn record_control_request(&self, is_error: bool) {
        self.with_metrics(|m| {
            m.control_requests += 1;
            if is_error {
                m.control_errors += 1;
            }
        });
    }

    pub fn increment_status_clients(&self) {
        self.with_metrics(|m| m.status_clients += 1);
    }

    /// Decrement with underflow protection.
    pub fn decrement_status_clients(&self) {
        self.with_metrics(|m| {
            if m.status_clients > 0 {
                m.status_clients -= 1;
            }
        });
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::AudioDevices;
    use crate::transport::Connector;

    /// State wired to a controller that never touches hardware or the network.
    pub(crate) fn test_state<D, C>(devices: D, connector: C) -> AppState
    where
        D: AudioDevices + 'static,
        C: Connector + 'static,
    {
        let session = SessionHandle::spawn(devices, connector).unwrap();
        AppState::new(AppConfig::default(), session)
    }

    #[test]
    fn test_metrics_counters() {
        let state = test_state(crate::device::CpalDevices, crate::transport::WebSocketConnector);
        state.record_control_request(false);
        state.record_control_request(true);
        state.increment_status_clients();
        state.decrement_status_clients();
        state.decrement_status_clients();

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.control_requests, 2);
        assert_eq!(metrics.control_errors, 1);
        assert_eq!(metrics.status_clients, 0);
    }

    #[test]
    fn test_update_config_rejects_invalid() {
        let state = test_state(crate::device::CpalDevices, crate::transport::WebSocketConnector);
        let mut config = state.get_config();
        config.audio.capture_frame_size = 0;
        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().audio.capture_frame_size, 4096);
    }
}
