mod app;
mod backend;
mod channel;
mod config;
mod datapoint;
mod device;
mod error;
mod gpio;
mod lamp;
mod routes;
mod server;
mod switch;

pub use app::{Application, Command, HELP, ShellState, parse_command, status_report};
pub use channel::{ChannelRegistry, LampChannel, LampPoints, SwitchChannel, SwitchPoints};
pub use config::{
    AppConfig, ChannelConfig, DeviceConfig, EdgeDetect, GpioCapability, HttpConfig, MAX_CHANNELS,
    PinConfig,
};
pub use datapoint::{
    Datapoint, DatapointId, DatapointStore, DatapointStoreBuilder, DatapointUpdate, Direction,
    SwitchValue,
};
pub use device::{DeviceIdentity, DeviceStack, DeviceState, default_device_name, hostname};
pub use error::AppError;
pub use gpio::{
    EdgeCallback, EdgeEvent, EventCallbackHandler, EventHandler, GpioAdapter, GpioBackend,
    GpioState, PinSettings,
};
pub use lamp::{LampBridge, is_lamp_on};
pub use routes::{AppState, api_scope};
pub use server::HttpDeviceStack;
pub use switch::{SwitchBridge, is_switch_on};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockGpioBackend;
