use log::{debug, warn};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, yield_now};
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::{FairMutex, RwLock, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;

use crate::config::{EdgeDetect, PinConfig};
use crate::error::AppError;
use crate::gpio::{EdgeEvent, EventHandler, GpioBackend, GpioState, PinSettings};

const EVENT_BUFFER_CAPACITY: usize = 64;
const EVENT_WAIT_TIMEOUT: Duration = Duration::from_millis(10);

pub struct LibgpiodBackend {
    pins: RwLock<FxHashMap<u32, RwLock<PinHandle>>>, // keyed by pin id
}

struct PinHandle {
    line: u32,
    settings: PinSettings,
    request: Arc<FairMutex<request::Request>>,
    listener: Option<EdgeListener>, // drop in reverse order
}

fn gpio_err<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> AppError {
    move |e| AppError::Gpio(format!("{what}: {e}"))
}

fn request_line(chip: &str, line_cfg: &line::Config) -> Result<request::Request, AppError> {
    let chip = Chip::open(&Path::new(chip))
        .map_err(|e| AppError::Gpio(format!("open chip {chip}: {e}")))?;
    let mut req_cfg = request::Config::new().map_err(gpio_err("request config"))?;
    req_cfg
        .set_consumer(env!("CARGO_PKG_NAME"))
        .map_err(gpio_err("request consumer"))?;
    chip.request_lines(Some(&req_cfg), line_cfg)
        .map_err(gpio_err("request lines"))
}

struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn spawn(
        pin_id: u32,
        request: Arc<FairMutex<request::Request>>,
        handler: EventHandler,
    ) -> Result<Self, AppError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer =
            request::Buffer::new(EVENT_BUFFER_CAPACITY).map_err(gpio_err("event buffer"))?;

        let handle = std::thread::spawn(move || {
            while !cancel_flag.load(Ordering::Relaxed) {
                let req = request.lock();

                match req.wait_edge_events(Some(EVENT_WAIT_TIMEOUT)) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!("wait edge events error for pin {pin_id}: {e}");
                        drop(req);
                        yield_now();
                        continue;
                    }
                }

                let events = match req.read_edge_events(&mut buffer) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("read edge events error for pin {pin_id}: {e}");
                        drop(req);
                        yield_now();
                        continue;
                    }
                };
                for event in events.flatten() {
                    let edge = match event.event_type() {
                        Ok(line::EdgeKind::Rising) => EdgeDetect::Rising,
                        Ok(line::EdgeKind::Falling) => EdgeDetect::Falling,
                        Err(_) => continue,
                    };
                    handler.dispatch(EdgeEvent {
                        pin_id,
                        edge,
                        timestamp_ms: event.timestamp().as_millis() as u64,
                    });
                }
            }
            debug!("edge listener for pin {pin_id} stopped");
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl LibgpiodBackend {
    pub fn new() -> Result<Self, AppError> {
        Ok(Self {
            pins: RwLock::new(FxHashMap::default()),
        })
    }

    fn line_settings(settings: &PinSettings) -> Result<line::Settings, AppError> {
        let mut ls = line::Settings::new().map_err(gpio_err("libgpiod settings"))?;

        let (direction, drive, bias) = match settings.state {
            GpioState::Disabled => {
                return Err(AppError::InvalidState(
                    "cannot create settings for disabled state".into(),
                ));
            }
            GpioState::PushPull => (line::Direction::Output, Some(line::Drive::PushPull), None),
            GpioState::Floating => (line::Direction::Input, None, None),
            GpioState::PullUp => (line::Direction::Input, None, Some(line::Bias::PullUp)),
            GpioState::PullDown => (line::Direction::Input, None, Some(line::Bias::PullDown)),
        };

        ls.set_direction(direction)
            .map_err(gpio_err("set direction"))?;
        if let Some(drive) = drive {
            ls.set_drive(drive).map_err(gpio_err("set drive"))?;
            ls.set_output_value(line::Value::InActive)
                .map_err(gpio_err("set output value"))?;
        } else {
            ls.set_bias(bias).map_err(gpio_err("set bias"))?;
        }

        if settings.edge != EdgeDetect::None {
            if !settings.state.is_edge_detectable() {
                return Err(AppError::InvalidState(
                    "edge detection requires an input-capable state".into(),
                ));
            }
            let edge = match settings.edge {
                EdgeDetect::None => None,
                EdgeDetect::Rising => Some(line::Edge::Rising),
                EdgeDetect::Falling => Some(line::Edge::Falling),
            };
            ls.set_edge_detection(edge)
                .map_err(gpio_err("set edge detection"))?;
            ls.set_event_clock(EventClock::Monotonic)
                .map_err(gpio_err("set event clock"))?;
            ls.set_debounce_period(Duration::from_millis(settings.debounce_ms));
        }

        Ok(ls)
    }

    fn line_config(offset: u32, settings: line::Settings) -> Result<line::Config, AppError> {
        let mut cfg = line::Config::new().map_err(gpio_err("line config"))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(gpio_err("line config add settings"))?;
        Ok(cfg)
    }
}

impl GpioBackend for LibgpiodBackend {
    fn configure(
        &self,
        pin_id: u32,
        pin: &PinConfig,
        settings: &PinSettings,
        event_handler: Option<EventHandler>,
    ) -> Result<(), AppError> {
        if settings.state == GpioState::Disabled {
            return self.release(pin_id);
        }

        let line_cfg = Self::line_config(pin.line, Self::line_settings(settings)?)?;
        let pins = self.pins.upgradable_read();

        if let Some(handle) = pins.get(&pin_id) {
            let mut handle = handle.write();

            // stop the old listener before the line is reconfigured under it
            drop(handle.listener.take());

            handle
                .request
                .lock()
                .reconfigure_lines(&line_cfg)
                .map_err(gpio_err("reconfigure lines"))?;

            handle.listener = match (settings.edge, event_handler) {
                (EdgeDetect::None, _) | (_, None) => None,
                (_, Some(handler)) => {
                    Some(EdgeListener::spawn(pin_id, handle.request.clone(), handler)?)
                }
            };
            handle.settings = settings.clone();
            return Ok(());
        }

        let request = Arc::new(FairMutex::new(request_line(&pin.chip, &line_cfg)?));
        let listener = match (settings.edge, event_handler) {
            (EdgeDetect::None, _) | (_, None) => None,
            (_, Some(handler)) => Some(EdgeListener::spawn(pin_id, request.clone(), handler)?),
        };

        let mut pins = RwLockUpgradableReadGuard::upgrade(pins);
        pins.insert(
            pin_id,
            RwLock::new(PinHandle {
                line: pin.line,
                settings: settings.clone(),
                request,
                listener,
            }),
        );
        Ok(())
    }

    fn read_value(&self, pin_id: u32) -> Result<bool, AppError> {
        let pins = self.pins.read();
        let handle = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set state first".into()))?
            .read();

        let value = handle
            .request
            .lock()
            .value(handle.line)
            .map_err(gpio_err("get value"))?;
        Ok(matches!(value, line::Value::Active))
    }

    fn write_value(&self, pin_id: u32, value: bool) -> Result<(), AppError> {
        let pins = self.pins.read();
        let handle = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set state first".into()))?
            .read();

        if !handle.settings.state.is_writable() {
            return Err(AppError::InvalidState(
                "pin must be in output mode to set value".into(),
            ));
        }

        let level = if value {
            line::Value::Active
        } else {
            line::Value::InActive
        };
        handle
            .request
            .lock()
            .set_value(handle.line, level)
            .map_err(gpio_err("set value"))?;
        Ok(())
    }

    fn release(&self, pin_id: u32) -> Result<(), AppError> {
        // dropping the handle joins its listener and frees the line request
        if self.pins.write().remove(&pin_id).is_some() {
            debug!("released pin {pin_id}");
        }
        Ok(())
    }
}
