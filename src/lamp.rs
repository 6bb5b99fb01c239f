use std::sync::Arc;

use log::{error, info, warn};

use crate::channel::ChannelRegistry;
use crate::datapoint::{DatapointId, SwitchValue};
use crate::error::AppError;
use crate::gpio::{GpioAdapter, GpioBackend};

pub fn is_lamp_on(input: SwitchValue) -> bool {
    input.value > 0.0 && input.state >= 1
}

pub struct LampBridge<B: GpioBackend> {
    registry: Arc<ChannelRegistry>,
    gpio: Arc<GpioAdapter<B>>,
}

impl<B: GpioBackend> LampBridge<B> {
    pub fn new(registry: Arc<ChannelRegistry>, gpio: Arc<GpioAdapter<B>>) -> Self {
        Self { registry, gpio }
    }

    pub fn on_lamp_value_changed(&self, source: DatapointId, data: SwitchValue) {
        let Some(index) = self.registry.lamp_index(source) else {
            warn!("Not Found: lamp value source {source:?}");
            return;
        };

        if let Err(e) = self.apply(index, data) {
            error!("Failed to process lamp update of lamp {index}: {e}");
        }
    }

    /// Drives the pin of `index`, then mirrors `data` into its feedback.
    /// The feedback is left untouched when the pin cannot be driven.
    pub fn apply(&self, index: usize, data: SwitchValue) -> Result<bool, AppError> {
        let points = self.registry.lamp_points(index)?;
        let on = is_lamp_on(data);

        if on {
            info!("Turn On Lamp[{index}]");
        } else {
            info!("Turn Off Lamp[{index}]");
        }
        self.gpio.set_output(index, on)?;
        self.registry.record_lamp_output(index, on);

        self.registry.store().publish(&[(points.feedback, data)])?;
        Ok(on)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::backend::MockGpioBackend;
    use crate::config::AppConfig;
    use crate::datapoint::DatapointUpdate;

    struct Fixture {
        bridge: LampBridge<MockGpioBackend>,
        registry: Arc<ChannelRegistry>,
        gpio: Arc<GpioAdapter<MockGpioBackend>>,
        _inputs: mpsc::UnboundedReceiver<DatapointUpdate>,
    }

    fn fixture() -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ChannelRegistry::new(3, 8, tx).unwrap());
        let gpio = Arc::new(GpioAdapter::new(
            Arc::new(AppConfig::default()),
            Arc::new(MockGpioBackend::default()),
        ));
        gpio.configure().unwrap();
        Fixture {
            bridge: LampBridge::new(registry.clone(), gpio.clone()),
            registry,
            gpio,
            _inputs: rx,
        }
    }

    fn update(f: &Fixture, index: usize, data: SwitchValue) {
        let input = f.registry.lamp_points(index).unwrap().input;
        f.registry.store().network_write(input, data).unwrap();
        f.bridge.on_lamp_value_changed(input, data);
    }

    #[test]
    fn on_update_drives_pin_and_mirrors_feedback() {
        let f = fixture();
        update(&f, 2, SwitchValue::new(100.0, 1));

        assert!(f.gpio.output(2).unwrap());
        let ch = f.registry.lamp_channel(2).unwrap();
        assert!(ch.physical_output);
        assert_eq!((ch.feedback_value, ch.feedback_state), (100.0, 1));
        assert!(!f.gpio.output(0).unwrap());
        assert!(!f.gpio.output(1).unwrap());
    }

    #[test]
    fn off_update_clears_pin() {
        let f = fixture();
        update(&f, 0, SwitchValue::ON);
        update(&f, 0, SwitchValue::new(0.0, 0));

        assert!(!f.gpio.output(0).unwrap());
        let ch = f.registry.lamp_channel(0).unwrap();
        assert!(!ch.physical_output);
        assert_eq!((ch.feedback_value, ch.feedback_state), (0.0, 0));
    }

    #[test]
    fn pin_follows_value_and_state_predicate() {
        let f = fixture();
        let cases = [
            (SwitchValue::new(100.0, 1), true),
            (SwitchValue::new(0.5, 1), true),
            (SwitchValue::new(100.0, 0), false),
            (SwitchValue::new(100.0, -1), false),
            (SwitchValue::new(0.0, 1), false),
            (SwitchValue::new(0.0, 0), false),
        ];

        for (data, expected) in cases {
            update(&f, 1, data);
            assert_eq!(f.gpio.output(1).unwrap(), expected, "{data}");
            let ch = f.registry.lamp_channel(1).unwrap();
            assert_eq!(ch.physical_output, expected);
            assert_eq!((ch.feedback_value, ch.feedback_state), (data.value, data.state));
            assert_eq!((ch.input_value, ch.input_state), (data.value, data.state));
        }
    }

    #[test]
    fn unknown_source_changes_nothing() {
        let f = fixture();
        let before: Vec<_> = (0..3).map(|i| f.registry.lamp_channel(i).unwrap()).collect();
        let foreign = f.registry.switch_points(0).unwrap().output;

        f.bridge.on_lamp_value_changed(foreign, SwitchValue::ON);

        let after: Vec<_> = (0..3).map(|i| f.registry.lamp_channel(i).unwrap()).collect();
        assert_eq!(before, after);
        for i in 0..3 {
            assert!(!f.gpio.output(i).unwrap());
        }
    }

    #[test]
    fn pin_failure_is_swallowed_and_feedback_kept() {
        let f = fixture();
        f.gpio.cleanup().unwrap();

        update(&f, 1, SwitchValue::ON);

        let ch = f.registry.lamp_channel(1).unwrap();
        assert!(!ch.physical_output);
        assert_eq!((ch.feedback_value, ch.feedback_state), (0.0, 0));
        assert!(f.bridge.apply(1, SwitchValue::ON).is_err());
    }
}
