use std::sync::Arc;

use log::{debug, error, info, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{AppConfig, ChannelConfig, EdgeDetect, GpioCapability, PinConfig};
use crate::error::AppError;

pub type GpioState = GpioCapability;

impl GpioState {
    pub fn is_writable(&self) -> bool {
        *self == GpioState::PushPull
    }

    pub fn is_edge_detectable(&self) -> bool {
        matches!(
            self,
            GpioState::Floating | GpioState::PullUp | GpioState::PullDown
        )
    }
}

pub type EdgeCallback = Arc<dyn Fn(usize) + Send + Sync>;

pub struct EventCallbackHandler {
    channel: usize,
    edge: EdgeDetect,
    debounce_ms: u64,
    last_accepted_ms: Mutex<Option<u64>>,
    callback: EdgeCallback,
}

impl EventCallbackHandler {
    pub fn new(channel: usize, edge: EdgeDetect, debounce_ms: u64, callback: EdgeCallback) -> Self {
        Self {
            channel,
            edge,
            debounce_ms,
            last_accepted_ms: Mutex::new(None),
            callback,
        }
    }

    pub fn dispatch(&self, event: EdgeEvent) {
        if !edge_matches(self.edge, event.edge) {
            trace!("ignoring {:?} edge on pin {}", event.edge, event.pin_id);
            return;
        }

        {
            let mut last = self.last_accepted_ms.lock();
            if let Some(prev) = *last
                && event.timestamp_ms.saturating_sub(prev) < self.debounce_ms
            {
                debug!(
                    "debounced edge on pin {} ({} ms after previous)",
                    event.pin_id,
                    event.timestamp_ms.saturating_sub(prev)
                );
                return;
            }
            *last = Some(event.timestamp_ms);
        }

        (self.callback)(self.channel);
    }
}

pub type EventHandler = Arc<EventCallbackHandler>;

#[derive(Debug, Clone, Serialize)]
pub struct EdgeEvent {
    pub pin_id: u32,
    pub edge: EdgeDetect,
    pub timestamp_ms: u64,
}

pub fn edge_matches(configured: EdgeDetect, observed: EdgeDetect) -> bool {
    configured != EdgeDetect::None && configured == observed
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinSettings {
    pub state: GpioState,
    pub edge: EdgeDetect,
    pub debounce_ms: u64,
}

impl Default for PinSettings {
    fn default() -> Self {
        Self {
            state: GpioState::Disabled,
            edge: EdgeDetect::None,
            debounce_ms: 0,
        }
    }
}

impl PinSettings {
    pub fn output() -> Self {
        Self {
            state: GpioState::PushPull,
            ..Self::default()
        }
    }

    pub fn pull_down_input() -> Self {
        Self {
            state: GpioState::PullDown,
            ..Self::default()
        }
    }

    pub fn falling_edge(debounce_ms: u64) -> Self {
        Self {
            state: GpioState::PullDown,
            edge: EdgeDetect::Falling,
            debounce_ms,
        }
    }
}

pub trait GpioBackend: Send + Sync {
    fn configure(
        &self,
        pin_id: u32,
        pin: &PinConfig,
        settings: &PinSettings,
        event_handler: Option<EventHandler>,
    ) -> Result<(), AppError>;
    fn read_value(&self, pin_id: u32) -> Result<bool, AppError>;
    fn write_value(&self, pin_id: u32, value: bool) -> Result<(), AppError>;
    /// Drops the claim on a pin. Releasing an unclaimed pin is a no-op.
    fn release(&self, pin_id: u32) -> Result<(), AppError>;
}

pub struct GpioAdapter<B: GpioBackend> {
    config: Arc<AppConfig>,
    backend: Arc<B>,
}

impl<B: GpioBackend> GpioAdapter<B> {
    pub fn new(config: Arc<AppConfig>, backend: Arc<B>) -> Self {
        Self { config, backend }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn channel_count(&self) -> usize {
        self.config.channels.len()
    }

    fn channel(&self, channel: usize) -> Result<&ChannelConfig, AppError> {
        self.config
            .channels
            .get(channel)
            .ok_or(AppError::NotFoundChannel(channel))
    }

    fn pin_config(&self, pin_id: u32) -> Result<&PinConfig, AppError> {
        self.config
            .gpios
            .get(&pin_id)
            .ok_or_else(|| AppError::NotFoundPin(pin_id.to_string()))
    }

    fn apply(
        &self,
        pin_id: u32,
        settings: &PinSettings,
        handler: Option<EventHandler>,
    ) -> Result<(), AppError> {
        let cfg = self.pin_config(pin_id)?;

        if settings.state != GpioState::Disabled && !cfg.capabilities.contains(&settings.state) {
            return Err(AppError::InvalidState(format!(
                "State {:?} not supported by pin {pin_id} ({})",
                settings.state, cfg.name
            )));
        }
        if settings.edge != EdgeDetect::None && !settings.state.is_edge_detectable() {
            return Err(AppError::InvalidState(format!(
                "Edge detection requires an input-capable state by pin {pin_id}"
            )));
        }

        self.backend.configure(pin_id, cfg, settings, handler)
    }

    pub fn configure(&self) -> Result<(), AppError> {
        for (i, channel) in self.config.channels.iter().enumerate() {
            self.apply(channel.lamp, &PinSettings::output(), None)?;
            self.backend.write_value(channel.lamp, false)?;
            self.apply(channel.button, &PinSettings::pull_down_input(), None)?;
            debug!(
                "channel {i}: lamp pin {} output, button pin {} input",
                channel.lamp, channel.button
            );
        }
        info!("Configured GPIO for {} channels", self.channel_count());
        Ok(())
    }

    pub fn register_edge_callback(
        &self,
        channel: usize,
        callback: EdgeCallback,
        debounce_ms: u64,
    ) -> Result<(), AppError> {
        let pin_id = self.channel(channel)?.button;
        let settings = PinSettings::falling_edge(debounce_ms);
        let handler = Arc::new(EventCallbackHandler::new(
            channel,
            settings.edge,
            debounce_ms,
            callback,
        ));

        self.apply(pin_id, &settings, Some(handler))
    }

    pub fn set_output(&self, channel: usize, on: bool) -> Result<(), AppError> {
        let pin_id = self.channel(channel)?.lamp;
        self.backend.write_value(pin_id, on)
    }

    pub fn output(&self, channel: usize) -> Result<bool, AppError> {
        let pin_id = self.channel(channel)?.lamp;
        self.backend.read_value(pin_id)
    }

    pub fn cleanup(&self) -> Result<(), AppError> {
        let mut first_err = None;
        for channel in &self.config.channels {
            for pin_id in [channel.lamp, channel.button] {
                if let Err(e) = self.backend.release(pin_id) {
                    error!("failed to release pin {pin_id}: {e}");
                    first_err.get_or_insert(e);
                }
            }
        }
        info!("Released GPIO");
        first_err.map_or(Ok(()), Err)
    }
}
