use log::trace;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::config::{EdgeDetect, PinConfig};
use crate::datapoint::epoch_millis;
use crate::error::AppError;
use crate::gpio::{EdgeEvent, EventHandler, GpioBackend, GpioState, PinSettings};

#[derive(Default)]
pub struct MockGpioBackend {
    pins: RwLock<FxHashMap<u32, Mutex<MockPinState>>>, // keyed by pin id
}

struct MockPinState {
    settings: PinSettings,
    value: bool,
    handler: Option<EventHandler>,
}

impl MockGpioBackend {
    pub fn claimed(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.pins.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn settings(&self, pin_id: u32) -> PinSettings {
        self.pins
            .read()
            .get(&pin_id)
            .map(|pin| pin.lock().settings.clone())
            .unwrap_or_default()
    }

    pub fn is_claimed(&self, pin_id: u32) -> bool {
        self.pins.read().contains_key(&pin_id)
    }

    pub fn set_input_level(&self, pin_id: u32, level: bool) -> Result<(), AppError> {
        let dispatch = {
            let pins = self.pins.read();
            let mut pin = pins
                .get(&pin_id)
                .ok_or_else(|| AppError::InvalidState("pin not configured, set state first".into()))?
                .lock();

            if !pin.settings.state.is_edge_detectable() {
                return Err(AppError::InvalidState(
                    "pin must be in input mode to drive its level".into(),
                ));
            }

            let old = pin.value;
            pin.value = level;
            let observed = match (old, level) {
                (false, true) => EdgeDetect::Rising,
                (true, false) => EdgeDetect::Falling,
                _ => EdgeDetect::None,
            };

            match (&pin.handler, observed) {
                (Some(handler), edge) if edge != EdgeDetect::None => Some((handler.clone(), edge)),
                _ => None,
            }
        };

        // handler runs without pin locks held, like a backend listener thread
        if let Some((handler, edge)) = dispatch {
            trace!("mock pin {pin_id}: {edge:?} edge");
            handler.dispatch(EdgeEvent {
                pin_id,
                edge,
                timestamp_ms: epoch_millis(),
            });
        }
        Ok(())
    }

    pub fn press(&self, pin_id: u32) -> Result<(), AppError> {
        self.set_input_level(pin_id, true)?;
        self.set_input_level(pin_id, false)
    }
}

impl GpioBackend for MockGpioBackend {

    fn configure(
        &self,
        pin_id: u32,
        _pin: &PinConfig,
        settings: &PinSettings,
        event_handler: Option<EventHandler>,
    ) -> Result<(), AppError> {
        if settings.state == GpioState::Disabled {
            return self.release(pin_id);
        }

        let mut pins = self.pins.write();
        let mut pin = pins
            .entry(pin_id)
            .or_insert_with(|| {
                Mutex::new(MockPinState {
                    settings: PinSettings::default(),
                    value: false,
                    handler: None,
                })
            })
            .lock();

        pin.settings = settings.clone();
        pin.handler = if settings.edge != EdgeDetect::None {
            event_handler
        } else {
            None
        };

        Ok(())
    }

    fn read_value(&self, pin_id: u32) -> Result<bool, AppError> {
        let pins = self.pins.read();
        let pin = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set state first".into()))?
            .lock();
        Ok(pin.value)
    }

    fn write_value(&self, pin_id: u32, value: bool) -> Result<(), AppError> {
        let pins = self.pins.read();
        let mut pin = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set state first".into()))?
            .lock();

        if !pin.settings.state.is_writable() {
            return Err(AppError::InvalidState(
                "pin must be in output mode to set value".into(),
            ));
        }
        pin.value = value;
        Ok(())
    }

    fn release(&self, pin_id: u32) -> Result<(), AppError> {
        self.pins.write().remove(&pin_id);
        Ok(())
    }
}
