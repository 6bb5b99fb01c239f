use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_stream::{Stream, StreamExt};

use crate::channel::ChannelRegistry;
use crate::config::AppConfig;
use crate::datapoint::DatapointUpdate;
use crate::device::{DeviceIdentity, DeviceStack, default_device_name, hostname};
use crate::error::AppError;
use crate::gpio::{GpioAdapter, GpioBackend};
use crate::lamp::LampBridge;
use crate::switch::SwitchBridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Uninitialized,
    Configured,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Quit,
    Status,
    Help,
}

pub const HELP: &str = "commands: q|quit|exit  s|status  h|help|?";

pub fn parse_command(line: &str) -> Result<Option<Command>, AppError> {
    match line.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "q" | "quit" | "exit" => Ok(Some(Command::Quit)),
        "s" | "status" => Ok(Some(Command::Status)),
        "h" | "help" | "?" => Ok(Some(Command::Help)),
        other => Err(AppError::InvalidValue(format!("unknown command '{other}'"))),
    }
}

/// Releases GPIO and stops the device stack when dropped, including during
/// unwinding.
struct CleanupGuard<B: GpioBackend, S: DeviceStack> {
    gpio: Arc<GpioAdapter<B>>,
    stack: Arc<S>,
}

impl<B: GpioBackend, S: DeviceStack> Drop for CleanupGuard<B, S> {
    fn drop(&mut self) {
        if let Err(e) = self.gpio.cleanup() {
            error!("GPIO cleanup failed: {e}");
        }
        self.stack.stop();
        info!("Stopped");
    }
}

struct Wiring<B: GpioBackend, S: DeviceStack> {
    registry: Arc<ChannelRegistry>,
    switches: SwitchBridge,
    lamps: LampBridge<B>,
    buttons: mpsc::UnboundedReceiver<usize>,
    inputs: mpsc::UnboundedReceiver<DatapointUpdate>,
    cleanup: CleanupGuard<B, S>,
}

pub struct Application<B: GpioBackend, S: DeviceStack> {
    config: Arc<AppConfig>,
    gpio: Arc<GpioAdapter<B>>,
    stack: Arc<S>,
    state: ShellState,
    registry: Option<Arc<ChannelRegistry>>,
    wiring: Option<Wiring<B, S>>,
}

impl<B: GpioBackend, S: DeviceStack> Application<B, S> {
    pub fn new(config: Arc<AppConfig>, backend: Arc<B>, stack: Arc<S>) -> Self {
        let gpio = Arc::new(GpioAdapter::new(config.clone(), backend));
        Self {
            config,
            gpio,
            stack,
            state: ShellState::Uninitialized,
            registry: None,
            wiring: None,
        }
    }

    pub fn state(&self) -> ShellState {
        self.state
    }

    pub fn gpio(&self) -> &Arc<GpioAdapter<B>> {
        &self.gpio
    }

    pub fn registry(&self) -> Option<Arc<ChannelRegistry>> {
        self.registry.clone()
    }

    pub fn configure(&mut self) -> Result<(), AppError> {
        if self.state != ShellState::Uninitialized {
            return Err(AppError::InvalidState(format!(
                "cannot configure from {:?}",
                self.state
            )));
        }

        let cleanup = CleanupGuard {
            gpio: self.gpio.clone(),
            stack: self.stack.clone(),
        };
        match self.wire(cleanup) {
            Ok(wiring) => {
                self.registry = Some(wiring.registry.clone());
                self.wiring = Some(wiring);
                self.state = ShellState::Configured;
                Ok(())
            }
            Err(e) => {
                self.state = ShellState::Stopped;
                Err(e)
            }
        }
    }

    fn wire(&self, cleanup: CleanupGuard<B, S>) -> Result<Wiring<B, S>, AppError> {
        let channels = self.config.channel_count();
        let (input_tx, inputs) = mpsc::unbounded_channel();
        let registry = Arc::new(ChannelRegistry::new(
            channels,
            self.config.broadcast_capacity,
            input_tx,
        )?);

        self.stack
            .start(registry.store().clone(), DeviceIdentity::new(channels))?;

        if self.stack.is_first_run() {
            let name = default_device_name(&hostname(), channels);
            info!("First run--initialize device name to {name}");
            self.stack.set_device_name(&name)?;
        }

        self.gpio.configure()?;

        let (button_tx, buttons) = mpsc::unbounded_channel();
        for channel in 0..channels {
            let tx = button_tx.clone();
            self.gpio.register_edge_callback(
                channel,
                Arc::new(move |ch| {
                    if tx.send(ch).is_err() {
                        debug!("button {ch} pressed after shutdown");
                    }
                }),
                self.config.debounce_ms,
            )?;
        }

        Ok(Wiring {
            switches: SwitchBridge::new(registry.clone()),
            lamps: LampBridge::new(registry.clone(), self.gpio.clone()),
            registry,
            buttons,
            inputs,
            cleanup,
        })
    }

    /// Cleanup runs exactly once on every exit path.
    pub async fn run<C, F>(&mut self, mut commands: C, shutdown: F) -> Result<(), AppError>
    where
        C: Stream<Item = String> + Unpin,
        F: Future<Output = ()>,
    {
        let Some(wiring) = self.wiring.take() else {
            return Err(AppError::InvalidState(format!("cannot run from {:?}", self.state)));
        };
        let Wiring {
            registry,
            switches,
            lamps,
            mut buttons,
            mut inputs,
            cleanup,
        } = wiring;

        self.state = ShellState::Running;
        info!("Running; {HELP}");

        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.service_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        let mut commands_open = true;

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                Some(channel) = buttons.recv() => {
                    switches.on_button_pressed(channel);
                }
                Some(update) = inputs.recv() => {
                    if registry.lamp_index(update.id).is_some() {
                        lamps.on_lamp_value_changed(update.id, update.data);
                    } else if registry.switch_index(update.id).is_some() {
                        switches.on_switch_feedback_updated(update.id, update.data);
                    } else {
                        warn!("Not Found: no handler for {}", update.name);
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.stack.service() {
                        error!("Device stack failed: {e}");
                        break Err(e);
                    }
                }
                line = commands.next(), if commands_open => {
                    let Some(line) = line else {
                        debug!("command input closed");
                        commands_open = false;
                        continue;
                    };
                    match parse_command(&line) {
                        Ok(Some(Command::Quit)) => break Ok(()),
                        Ok(Some(Command::Status)) => println!("{}", status_report(&registry)),
                        Ok(Some(Command::Help)) => println!("{HELP}"),
                        Ok(None) => {}
                        Err(e) => warn!("{e}; {HELP}"),
                    }
                }
            }
        };

        drop(cleanup);
        self.state = ShellState::Stopped;
        result
    }
}

pub fn status_report(registry: &ChannelRegistry) -> String {
    let mut out = String::from("ch  switch     switch-fb  lamp       lamp-fb    led");
    for i in 0..registry.channel_count() {
        let (Ok(sw), Ok(lamp)) = (registry.switch_channel(i), registry.lamp_channel(i)) else {
            continue;
        };
        let _ = write!(
            out,
            "\n{i:<3} {:>5.1} {:<3} {:>5.1} {:<3} {:>5.1} {:<3} {:>5.1} {:<3} {}",
            sw.output_value,
            sw.output_state,
            sw.feedback_value,
            sw.feedback_state,
            lamp.input_value,
            lamp.input_state,
            lamp.feedback_value,
            lamp.feedback_state,
            if lamp.physical_output { "on" } else { "off" },
        );
    }
    out
}
