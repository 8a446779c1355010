//! # Audio Device Detection and Management
//!
//! Finds the microphone and speaker the session should use, either by configured
//! name or the host default, and maps cpal failures onto the session error
//! taxonomy. Also provides the [`AudioDevices`] factory the session controller
//! asks for per-session capture and output handles.

use crate::audio::capture::{CaptureBridge, CaptureDevice};
use crate::audio::playback::{OutputDevice, SpeakerOutput};
use crate::config::AudioConfig;
use crate::error::{SessionError, SessionResult};
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::Device;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Which side of the duplex pair a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Input,
    Output,
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceRole::Input => write!(f, "input"),
            DeviceRole::Output => write!(f, "output"),
        }
    }
}

/// Device detection and selection utilities
pub struct DeviceManager;

impl DeviceManager {
    /// Resolve the input device: the named one if configured, else the host default.
    pub fn input_device(name: Option<&str>) -> SessionResult<Device> {
        Self::find_device(DeviceRole::Input, name)
    }

    /// Resolve the output device: the named one if configured, else the host default.
    pub fn output_device(name: Option<&str>) -> SessionResult<Device> {
        Self::find_device(DeviceRole::Output, name)
    }

    fn find_device(role: DeviceRole, name: Option<&str>) -> SessionResult<Device> {
        let host = cpal::default_host();

        let device = match name {
            Some(wanted) => {
                let mut devices = match role {
                    DeviceRole::Input => host.input_devices(),
                    DeviceRole::Output => host.output_devices(),
                }
                .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))?;

                devices.find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            }
            None => match role {
                DeviceRole::Input => host.default_input_device(),
                DeviceRole::Output => host.default_output_device(),
            },
        };

        match device {
            Some(device) => {
                info!(
                    role = %role,
                    device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
                    "Selected audio device"
                );
                Ok(device)
            }
            None => {
                let label = name.unwrap_or("default");
                warn!(role = %role, device = %label, "Audio device not found");
                Err(SessionError::DeviceUnavailable(format!("no {} device '{}'", role, label)))
            }
        }
    }

    /// List device names for one role. Enumeration failures yield an empty list.
    pub fn list_devices(role: DeviceRole) -> Vec<String> {
        let host = cpal::default_host();
        let devices = match role {
            DeviceRole::Input => host.input_devices(),
            DeviceRole::Output => host.output_devices(),
        };

        match devices {
            Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
            Err(e) => {
                debug!(role = %role, error = %e, "Device enumeration failed");
                Vec::new()
            }
        }
    }

    /// Get system device summary for the health endpoint
    pub fn get_device_summary() -> DeviceSummary {
        let host = cpal::default_host();
        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        DeviceSummary {
            host: host.id().name().to_string(),
            input_available: default_input.is_some(),
            output_available: default_output.is_some(),
            default_input,
            default_output,
        }
    }
}

/// Device availability summary
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub host: String,
    pub input_available: bool,
    pub output_available: bool,
    pub default_input: Option<String>,
    pub default_output: Option<String>,
}

/// Map a cpal stream build failure onto the session taxonomy.
///
/// Backends report a refused microphone as a backend-specific error, so the
/// description is inspected for permission wording.
pub fn map_build_error(err: cpal::BuildStreamError) -> SessionError {
    match err {
        cpal::BuildStreamError::BackendSpecific { err } if is_permission_failure(&err.description) => {
            SessionError::PermissionDenied(err.description)
        }
        other => SessionError::DeviceUnavailable(other.to_string()),
    }
}

pub fn map_play_error(err: cpal::PlayStreamError) -> SessionError {
    SessionError::DeviceUnavailable(err.to_string())
}

fn is_permission_failure(description: &str) -> bool {
    let lower = description.to_lowercase();
    ["permission", "denied", "not authorized", "unauthorized", "eacces"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Per-session source of device handles.
///
/// The controller asks for fresh handles on every `start()` so no device is
/// shared across sessions.
pub trait AudioDevices: Send {
    /// Make sure a microphone can be resolved before any network work starts.
    fn check_input(&self, audio: &AudioConfig) -> SessionResult<()>;

    fn capture(&self, audio: &AudioConfig) -> Box<dyn CaptureDevice>;

    fn output(&self, audio: &AudioConfig) -> Box<dyn OutputDevice>;
}

/// Real devices through the default cpal host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

impl AudioDevices for CpalDevices {
    fn check_input(&self, audio: &AudioConfig) -> SessionResult<()> {
        DeviceManager::input_device(audio.input_device.as_deref()).map(|_| ())
    }

    fn capture(&self, audio: &AudioConfig) -> Box<dyn CaptureDevice> {
        Box::new(CaptureBridge::new(audio))
    }

    fn output(&self, audio: &AudioConfig) -> Box<dyn OutputDevice> {
        Box::new(SpeakerOutput::new(audio))
    }
}
