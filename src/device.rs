use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::datapoint::DatapointStore;
use crate::error::AppError;

pub const APP_NAME: &str = "lamp-switch";
pub const APP_DESCRIPTION: &str = "Simple lamp and switch application for GPIO buttons and LEDs";
pub const DEVICE_MAJOR_VERSION: u32 = 2;

const PROGRAM_ID_PREFIX: &str = "9F:FF:FF:05:00:0A:A0:0";
const STATE_FILE: &str = "device.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub app_name: String,
    pub description: String,
    /// Last digit is the number of channels.
    pub program_id: String,
    pub major_version: u32,
    pub minor_version: u32,
    pub name: Option<String>,
}

impl DeviceIdentity {
    pub fn new(channel_count: usize) -> Self {
        Self {
            app_name: APP_NAME.to_string(),
            description: APP_DESCRIPTION.to_string(),
            program_id: format!("{PROGRAM_ID_PREFIX}{channel_count}"),
            major_version: DEVICE_MAJOR_VERSION,
            minor_version: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            name: None,
        }
    }
}

pub fn default_device_name(hostname: &str, channel_count: usize) -> String {
    format!("{hostname}-{channel_count}Ch-Lamp-Switch")
}

pub fn hostname() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .filter_map(|p| fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

pub trait DeviceStack: Send + Sync {
    fn start(&self, store: Arc<DatapointStore>, identity: DeviceIdentity) -> Result<(), AppError>;
    /// True until a device name has been persisted.
    fn is_first_run(&self) -> bool;
    fn set_device_name(&self, name: &str) -> Result<(), AppError>;
    /// Periodic housekeeping; an error ends the service loop.
    fn service(&self) -> Result<(), AppError>;
    fn stop(&self);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedDevice {
    name: String,
}

pub struct DeviceState {
    path: PathBuf,
}

impl DeviceState {
    pub fn new<P: AsRef<Path>>(state_dir: P) -> Self {
        Self {
            path: state_dir.as_ref().join(STATE_FILE),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load_name(&self) -> Result<Option<String>, AppError> {
        if !self.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .map_err(|e| AppError::Stack(format!("Failed to read device state: {e}")))?;
        let device: PersistedDevice = serde_json::from_str(&contents)
            .map_err(|e| AppError::Stack(format!("Invalid device state json: {e}")))?;
        debug!("loaded device name {:?} from {}", device.name, self.path.display());
        Ok(Some(device.name))
    }

    pub fn save_name(&self, name: &str) -> Result<(), AppError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| AppError::Stack(format!("Failed to create state dir: {e}")))?;
        }
        let contents = serde_json::to_string_pretty(&PersistedDevice {
            name: name.to_string(),
        })
        .map_err(|e| AppError::Stack(format!("Failed to encode device state: {e}")))?;
        fs::write(&self.path, contents)
            .map_err(|e| AppError::Stack(format!("Failed to write device state: {e}")))?;
        info!("Saved device name to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lamp-switch-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn identity_encodes_channel_count() {
        let id = DeviceIdentity::new(3);
        assert_eq!(id.program_id, "9F:FF:FF:05:00:0A:A0:03");
        assert_eq!(id.major_version, 2);
        assert_eq!(id.name, None);
    }

    #[test]
    fn default_name_format() {
        assert_eq!(default_device_name("raspberrypi", 3), "raspberrypi-3Ch-Lamp-Switch");
    }

    #[test]
    fn hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn device_name_round_trips_through_state_dir() {
        let dir = temp_dir("state");
        let state = DeviceState::new(&dir);
        assert!(!state.exists());
        assert_eq!(state.load_name().unwrap(), None);

        state.save_name("pi-3Ch-Lamp-Switch").unwrap();

        let reopened = DeviceState::new(&dir);
        assert!(reopened.exists());
        assert_eq!(reopened.load_name().unwrap().as_deref(), Some("pi-3Ch-Lamp-Switch"));
        let _ = fs::remove_dir_all(&dir);
    }
}
