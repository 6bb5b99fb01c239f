use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::datapoint::{
    DatapointId, DatapointStore, DatapointStoreBuilder, DatapointUpdate, Direction, SwitchValue,
};
use crate::error::AppError;

#[derive(Debug, Clone, Copy)]
pub struct SwitchPoints {
    pub output: DatapointId,
    pub feedback: DatapointId,
}

#[derive(Debug, Clone, Copy)]
pub struct LampPoints {
    pub input: DatapointId,
    pub feedback: DatapointId,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SwitchChannel {
    pub index: usize,
    pub output_value: f32,
    pub output_state: i8,
    pub feedback_value: f32,
    pub feedback_state: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LampChannel {
    pub index: usize,
    pub input_value: f32,
    pub input_state: i8,
    pub feedback_value: f32,
    pub feedback_state: i8,
    pub physical_output: bool,
}

pub struct ChannelRegistry {
    store: Arc<DatapointStore>,
    switches: Vec<SwitchPoints>,
    lamps: Vec<LampPoints>,
    lamp_outputs: Vec<AtomicBool>,
    lamp_by_input: FxHashMap<DatapointId, usize>,
    switch_by_feedback: FxHashMap<DatapointId, usize>,
}

impl ChannelRegistry {
    pub fn new(
        channel_count: usize,
        broadcast_capacity: usize,
        input_tx: mpsc::UnboundedSender<DatapointUpdate>,
    ) -> Result<Self, AppError> {
        let mut builder = DatapointStoreBuilder::new();
        let mut lamps = Vec::with_capacity(channel_count);
        let mut switches = Vec::with_capacity(channel_count);

        for i in 0..channel_count {
            let block = format!("LampBlock{i}");
            lamps.push(LampPoints {
                input: builder.register(&block, "nviLampValue", Direction::Input)?,
                feedback: builder.register(&block, "nvoLampValueFb", Direction::Output)?,
            });
        }
        for i in 0..channel_count {
            let block = format!("SwitchBlock{i}");
            switches.push(SwitchPoints {
                output: builder.register(&block, "nvoSwitch", Direction::Output)?,
                feedback: builder.register(&block, "nviSwitchFb", Direction::Input)?,
            });
        }

        let lamp_by_input = lamps.iter().enumerate().map(|(i, p)| (p.input, i)).collect();
        let switch_by_feedback = switches
            .iter()
            .enumerate()
            .map(|(i, p)| (p.feedback, i))
            .collect();

        Ok(Self {
            store: Arc::new(builder.build(broadcast_capacity, input_tx)),
            switches,
            lamps,
            lamp_outputs: (0..channel_count).map(|_| AtomicBool::new(false)).collect(),
            lamp_by_input,
            switch_by_feedback,
        })
    }

    pub fn store(&self) -> &Arc<DatapointStore> {
        &self.store
    }

    pub fn channel_count(&self) -> usize {
        self.switches.len()
    }

    pub fn switch_points(&self, index: usize) -> Result<SwitchPoints, AppError> {
        self.switches
            .get(index)
            .copied()
            .ok_or(AppError::NotFoundChannel(index))
    }

    pub fn lamp_points(&self, index: usize) -> Result<LampPoints, AppError> {
        self.lamps
            .get(index)
            .copied()
            .ok_or(AppError::NotFoundChannel(index))
    }

    pub fn lamp_index(&self, source: DatapointId) -> Option<usize> {
        self.lamp_by_input.get(&source).copied()
    }

    pub fn switch_index(&self, source: DatapointId) -> Option<usize> {
        self.switch_by_feedback.get(&source).copied()
    }

    pub(crate) fn record_lamp_output(&self, index: usize, on: bool) {
        if let Some(output) = self.lamp_outputs.get(index) {
            output.store(on, Ordering::Release);
        }
    }

    pub fn switch_channel(&self, index: usize) -> Result<SwitchChannel, AppError> {
        let points = self.switch_points(index)?;
        let [output, feedback] = self.store.values([points.output, points.feedback])?;
        Ok(SwitchChannel {
            index,
            output_value: output.value,
            output_state: output.state,
            feedback_value: feedback.value,
            feedback_state: feedback.state,
        })
    }

    pub fn lamp_channel(&self, index: usize) -> Result<LampChannel, AppError> {
        let points = self.lamp_points(index)?;
        let [input, feedback] = self.store.values([points.input, points.feedback])?;
        Ok(LampChannel {
            index,
            input_value: input.value,
            input_state: input.state,
            feedback_value: feedback.value,
            feedback_state: feedback.state,
            physical_output: self.lamp_outputs[index].load(Ordering::Acquire),
        })
    }

    pub fn publish_switch(&self, index: usize, output: SwitchValue) -> Result<(), AppError> {
        let points = self.switch_points(index)?;
        self.store
            .publish(&[(points.output, output), (points.feedback, output)])
    }
}
