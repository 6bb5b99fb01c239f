use std::sync::Arc;

use log::{error, info, warn};

use crate::channel::ChannelRegistry;
use crate::datapoint::{DatapointId, SwitchValue};
use crate::error::AppError;

/// Any positive level counts as on, including levels below 1.0, so a press
/// on a dimmed switch turns it off.
pub fn is_switch_on(output: SwitchValue) -> bool {
    output.value > 0.0
}

pub struct SwitchBridge {
    registry: Arc<ChannelRegistry>,
}

impl SwitchBridge {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }

    pub fn on_button_pressed(&self, index: usize) {
        match self.toggle(index) {
            Ok(_) => {}
            Err(AppError::NotFoundChannel(i)) => warn!("Button event for unknown channel {i}"),
            Err(e) => error!("Failed to handle button of switch {index}: {e}"),
        }
    }

    pub fn toggle(&self, index: usize) -> Result<SwitchValue, AppError> {
        let points = self.registry.switch_points(index)?;
        let current = self.registry.store().value(points.output)?;

        let next = if is_switch_on(current) {
            info!("Turn Off Switch[{index}]");
            SwitchValue::OFF
        } else {
            info!("Turn On Switch[{index}]");
            SwitchValue::ON
        };

        self.registry.publish_switch(index, next)?;
        Ok(next)
    }

    pub fn on_switch_feedback_updated(&self, source: DatapointId, data: SwitchValue) {
        let Some(index) = self.registry.switch_index(source) else {
            warn!("Not Found: switch feedback source {source:?}");
            return;
        };

        if let Err(e) = self.registry.publish_switch(index, data) {
            error!("Failed to apply switch feedback of switch {index}: {e}");
        }
    }
}
