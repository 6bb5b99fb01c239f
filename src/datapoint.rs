use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use log::trace;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::error::AppError;

pub const SWITCH_VALUE_MAX: f32 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SwitchValue {
    pub value: f32,
    pub state: i8,
}

impl SwitchValue {
    pub const OFF: SwitchValue = SwitchValue {
        value: 0.0,
        state: 0,
    };
    pub const ON: SwitchValue = SwitchValue {
        value: SWITCH_VALUE_MAX,
        state: 1,
    };

    pub fn new(value: f32, state: i8) -> Self {
        Self { value, state }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !self.value.is_finite() || !(0.0..=SWITCH_VALUE_MAX).contains(&self.value) {
            return Err(AppError::InvalidValue(format!(
                "switch value must be within 0..={SWITCH_VALUE_MAX}, got {}",
                self.value
            )));
        }
        if !(-1..=1).contains(&self.state) {
            return Err(AppError::InvalidValue(format!(
                "switch state must be -1, 0 or 1, got {}",
                self.state
            )));
        }
        Ok(())
    }
}

impl fmt::Display for SwitchValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} {}", self.value, self.state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatapointId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Serialize)]
pub struct Datapoint {
    pub id: DatapointId,
    pub name: String,
    pub block: String,
    pub direction: Direction,
    pub data: SwitchValue,
    pub updated_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatapointUpdate {
    pub id: DatapointId,
    pub name: String,
    pub data: SwitchValue,
    pub timestamp_ms: u64,
}

pub struct DatapointStoreBuilder {
    points: Vec<Datapoint>,
    names: FxHashMap<String, DatapointId>,
}

impl DatapointStoreBuilder {
    pub fn new() -> Self {
        Self {
            points: Vec::new(),
            names: FxHashMap::default(),
        }
    }

    pub fn register(
        &mut self,
        block: &str,
        member: &str,
        direction: Direction,
    ) -> Result<DatapointId, AppError> {
        let name = format!("{block}.{member}");
        if self.names.contains_key(&name) {
            return Err(AppError::Config(format!("duplicate datapoint {name}")));
        }

        let id = DatapointId(self.points.len() as u32);
        self.names.insert(name.clone(), id);
        self.points.push(Datapoint {
            id,
            name,
            block: block.to_string(),
            direction,
            data: SwitchValue::default(),
            updated_ms: 0,
        });
        Ok(id)
    }

    pub fn build(
        self,
        broadcast_capacity: usize,
        input_tx: mpsc::UnboundedSender<DatapointUpdate>,
    ) -> DatapointStore {
        let (update_tx, _) = broadcast::channel(broadcast_capacity);
        DatapointStore {
            points: RwLock::new(self.points),
            names: self.names,
            update_tx,
            input_tx,
        }
    }
}

impl Default for DatapointStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DatapointStore {
    points: RwLock<Vec<Datapoint>>, // indexed by DatapointId
    names: FxHashMap<String, DatapointId>,
    update_tx: broadcast::Sender<DatapointUpdate>,
    input_tx: mpsc::UnboundedSender<DatapointUpdate>,
}

impl DatapointStore {
    pub fn resolve(&self, name: &str) -> Result<DatapointId, AppError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| AppError::NotFoundDatapoint(name.to_string()))
    }

    pub fn get(&self, id: DatapointId) -> Result<Datapoint, AppError> {
        self.points
            .read()
            .get(id.0 as usize)
            .cloned()
            .ok_or_else(|| AppError::NotFoundDatapoint(format!("#{}", id.0)))
    }

    pub fn value(&self, id: DatapointId) -> Result<SwitchValue, AppError> {
        self.get(id).map(|dp| dp.data)
    }

    pub fn list(&self) -> Vec<Datapoint> {
        self.points.read().clone()
    }

    pub fn values<const N: usize>(
        &self,
        ids: [DatapointId; N],
    ) -> Result<[SwitchValue; N], AppError> {
        let points = self.points.read();
        let mut out = [SwitchValue::default(); N];
        for (slot, id) in out.iter_mut().zip(ids) {
            *slot = points
                .get(id.0 as usize)
                .ok_or_else(|| AppError::NotFoundDatapoint(format!("#{}", id.0)))?
                .data;
        }
        Ok(out)
    }

    /// Every pair is applied under one write lock.
    pub fn publish(&self, writes: &[(DatapointId, SwitchValue)]) -> Result<(), AppError> {
        let now = epoch_millis();
        let updates = {
            let mut points = self.points.write();
            if let Some((id, _)) = writes.iter().find(|(id, _)| points.get(id.0 as usize).is_none())
            {
                return Err(AppError::NotFoundDatapoint(format!("#{}", id.0)));
            }

            writes
                .iter()
                .map(|&(id, data)| {
                    let dp = &mut points[id.0 as usize];
                    dp.data = data;
                    dp.updated_ms = now;
                    DatapointUpdate {
                        id,
                        name: dp.name.clone(),
                        data,
                        timestamp_ms: now,
                    }
                })
                .collect::<Vec<_>>()
        };

        for update in updates {
            trace!("publish {} = {}", update.name, update.data);
            // no observers is fine
            let _ = self.update_tx.send(update);
        }
        Ok(())
    }

    pub fn network_write(&self, id: DatapointId, data: SwitchValue) -> Result<(), AppError> {
        data.validate()?;

        let update = {
            let mut points = self.points.write();
            let dp = points
                .get_mut(id.0 as usize)
                .ok_or_else(|| AppError::NotFoundDatapoint(format!("#{}", id.0)))?;
            if dp.direction != Direction::Input {
                return Err(AppError::PermissionDenied(format!(
                    "{} is an output datapoint",
                    dp.name
                )));
            }

            let update = DatapointUpdate {
                id,
                name: dp.name.clone(),
                data,
                timestamp_ms: epoch_millis(),
            };
            // commit only once the application has taken the update
            self.input_tx.send(update.clone()).map_err(|_| {
                AppError::Stack("application is no longer receiving updates".into())
            })?;
            dp.data = data;
            dp.updated_ms = update.timestamp_ms;
            update
        };

        let _ = self.update_tx.send(update);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DatapointUpdate> {
        self.update_tx.subscribe()
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
