use std::{collections::HashSet, fs, path::Path, path::PathBuf};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Largest number of button/LED channels a single expansion board can carry.
pub const MAX_CHANNELS: usize = 7;

pub const DEFAULT_DEBOUNCE_MS: u64 = 300;
pub const DEFAULT_SERVICE_INTERVAL_MS: u64 = 100;
pub const DEFAULT_BROADCAST_CAPACITY: usize = 64;

const DEFAULT_CHIP: &str = "/dev/gpiochip0";
const DEFAULT_LAMP_LINES: [u32; 3] = [4, 17, 22];
const DEFAULT_BUTTON_LINES: [u32; 3] = [23, 24, 25];

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            unix_socket: None,
            host: Some("127.0.0.1:8080".to_string()),
            path: "/api/v1".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeviceConfig {
    pub state_dir: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/lamp-switch"),
        }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GpioCapability {
    Disabled,
    PushPull,
    Floating,
    PullUp,
    PullDown,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeDetect {
    #[default]
    None,
    Rising,
    Falling,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PinConfig {
    pub name: String,
    pub chip: String,
    pub line: u32,
    pub capabilities: HashSet<GpioCapability>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub lamp: u32,
    pub button: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    pub gpios: FxHashMap<u32, PinConfig>,
    pub channels: Vec<ChannelConfig>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_service_interval_ms")]
    pub service_interval_ms: u64,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_service_interval_ms() -> u64 {
    DEFAULT_SERVICE_INTERVAL_MS
}

fn default_broadcast_capacity() -> usize {
    DEFAULT_BROADCAST_CAPACITY
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut gpios = FxHashMap::default();
        let mut channels = Vec::with_capacity(DEFAULT_LAMP_LINES.len());

        for (i, (lamp, button)) in DEFAULT_LAMP_LINES
            .into_iter()
            .zip(DEFAULT_BUTTON_LINES)
            .enumerate()
        {
            gpios.insert(
                lamp,
                PinConfig {
                    name: format!("LED {}", i + 1),
                    chip: DEFAULT_CHIP.to_string(),
                    line: lamp,
                    capabilities: HashSet::from([GpioCapability::PushPull]),
                },
            );
            gpios.insert(
                button,
                PinConfig {
                    name: format!("BUTTON {}", i + 1),
                    chip: DEFAULT_CHIP.to_string(),
                    line: button,
                    capabilities: HashSet::from([
                        GpioCapability::Floating,
                        GpioCapability::PullUp,
                        GpioCapability::PullDown,
                    ]),
                },
            );
            channels.push(ChannelConfig { lamp, button });
        }

        Self {
            http: HttpConfig::default(),
            device: DeviceConfig::default(),
            gpios,
            channels,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            service_interval_ms: DEFAULT_SERVICE_INTERVAL_MS,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, AppError> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.channels.is_empty() || self.channels.len() > MAX_CHANNELS {
            return Err(AppError::Config(format!(
                "channel count must be between 1 and {MAX_CHANNELS}, got {}",
                self.channels.len()
            )));
        }
        if self.broadcast_capacity == 0 {
            return Err(AppError::Config("broadcast_capacity must be non-zero".into()));
        }
        if self.service_interval_ms == 0 {
            return Err(AppError::Config("service_interval_ms must be non-zero".into()));
        }

        let mut used = HashSet::new();
        for (i, channel) in self.channels.iter().enumerate() {
            self.require_pin(i, channel.lamp, GpioCapability::PushPull)?;
            self.require_pin(i, channel.button, GpioCapability::PullDown)?;

            for pin_id in [channel.lamp, channel.button] {
                if !used.insert(pin_id) {
                    return Err(AppError::Config(format!(
                        "pin {pin_id} is assigned to more than one channel role"
                    )));
                }
            }
        }
        Ok(())
    }

    fn require_pin(
        &self,
        channel: usize,
        pin_id: u32,
        capability: GpioCapability,
    ) -> Result<(), AppError> {
        let pin = self.gpios.get(&pin_id).ok_or_else(|| {
            AppError::Config(format!("channel {channel} references unknown pin {pin_id}"))
        })?;
        if !pin.capabilities.contains(&capability) {
            return Err(AppError::Config(format!(
                "pin {pin_id} ({}) of channel {channel} lacks capability {capability:?}",
                pin.name
            )));
        }
        Ok(())
    }
}
