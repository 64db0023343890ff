//! Device polling: probing register support, batched reads and parameter
//! writes. The scheduling lives in [`coordinator`], this module is the per
//! device engine underneath it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::{debug, warn};

use crate::config::ModbusTuning;
use crate::error::{Error, Result};
use crate::modbus::batch::{self, BatchRange, MAX_WRITE_WORDS};
use crate::modbus::{codec, ConnectionManager};
use crate::models::{
    DeviceId, DeviceInstance, RegisterSupport, SupportMap, Topology, Value,
};
use crate::registers::{PollTier, RegisterDefinition, RegisterSet};

pub mod coordinator;

/// Result of reading one tier of one device. Registers whose batch failed are
/// present with a `None` value so stale readings never survive a failure.
pub struct ReadOutcome {
    pub values: HashMap<String, Option<Value>>,
    pub total_batches: usize,
    pub failed_batches: usize,
    pub connection_failure: bool,
}

impl ReadOutcome {
    /// The device answered at least one batch, or had nothing to answer.
    pub fn responded(&self) -> bool {
        return self.failed_batches < self.total_batches || self.total_batches == 0;
    }

    pub fn complete(&self) -> bool {
        return self.failed_batches == 0;
    }
}

struct TierPlan {
    defs: Vec<RegisterDefinition>,
    batches: Vec<BatchRange>,
}

#[derive(Default)]
struct DeviceState {
    support: SupportMap,
    probed: bool,
    plans: HashMap<PollTier, Arc<TierPlan>>,
}

/// Probing, reading and writing against the devices of one plant.
pub struct PollEngine {
    topology: Topology,
    registers: RegisterSet,
    connections: ConnectionManager,
    tuning: ModbusTuning,
    read_only: bool,
    state: RwLock<HashMap<DeviceId, DeviceState>>,
}

impl PollEngine {
    pub fn new(
        topology: Topology,
        registers: RegisterSet,
        tuning: ModbusTuning,
        read_only: bool,
    ) -> Self {
        return PollEngine {
            topology,
            registers,
            connections: ConnectionManager::new(tuning.clone()),
            tuning,
            read_only,
            state: RwLock::new(HashMap::new()),
        };
    }

    pub fn topology(&self) -> &Topology {
        return &self.topology;
    }

    pub fn begin_cycle(&self) {
        self.connections.begin_cycle();
    }

    pub fn close_connections(&self) {
        self.connections.close_all();
    }

    pub fn is_probed(&self, id: DeviceId) -> bool {
        let state = self.state.read().unwrap();
        return state.get(&id).map(|s| s.probed).unwrap_or(false);
    }

    pub fn support_map(&self, id: DeviceId) -> SupportMap {
        let state = self.state.read().unwrap();
        return state.get(&id).map(|s| s.support.clone()).unwrap_or_default();
    }

    /// Forget everything learned about a device. The next poll cycle probes
    /// it again from scratch.
    pub fn invalidate(&self, id: DeviceId) {
        self.state.write().unwrap().remove(&id);
    }

    /// Read every readable register of the device once to learn which ones
    /// this firmware actually implements. A modbus exception or a silent
    /// timeout marks the register unsupported; a connection failure aborts,
    /// leaving the remaining registers undetermined. Registers classified
    /// before an abort are skipped when the probe is retried, so a device
    /// with many silent registers still makes progress every cycle.
    pub async fn probe_device(&self, id: DeviceId) -> Result<()> {
        let device = self.device(id)?;
        let already_classified = self.support_map(id);
        let defs: Vec<RegisterDefinition> = self
            .registers
            .for_kind(device.kind)
            .iter()
            .filter(|d| {
                d.register_type.readable()
                    && d.applies_to(device.model.as_deref())
                    && already_classified.get(&d.name) == RegisterSupport::Unprobed
            })
            .cloned()
            .collect();

        debug!("Probing {} ({} registers)", device.name, defs.len());
        for def in &defs {
            let read = self
                .connections
                .read_registers(&device.endpoint, device.slave_id, def.category(), def.address, def.count)
                .await;
            let support = match read {
                Ok(_) => RegisterSupport::Supported,
                Err(Error::Protocol(_)) | Err(Error::Timeout(_)) => {
                    debug!("{}: register {} not implemented", device.name, def.name);
                    RegisterSupport::Unsupported
                }
                Err(e) => {
                    warn!("Probe of {} aborted: {}", device.name, e);
                    return Err(e);
                }
            };
            let mut state = self.state.write().unwrap();
            state.entry(id).or_default().support.set(&def.name, support);
        }

        let mut state = self.state.write().unwrap();
        let entry = state.entry(id).or_default();
        entry.probed = true;
        entry.plans.clear();
        return Ok(());
    }

    /// Read all supported registers of one tier, in planned batches. A failed
    /// batch nulls its own members and leaves the other batches alone.
    pub async fn read_device(&self, id: DeviceId, tier: PollTier) -> Result<ReadOutcome> {
        let device = self.device(id)?;
        let plan = self.tier_plan(id, &device, tier);

        let mut outcome = ReadOutcome {
            values: HashMap::new(),
            total_batches: plan.batches.len(),
            failed_batches: 0,
            connection_failure: false,
        };

        for batch in &plan.batches {
            let read = self
                .connections
                .read_registers(&device.endpoint, device.slave_id, batch.category, batch.start, batch.count)
                .await;
            match read {
                Ok(words) => {
                    for &idx in &batch.members {
                        let def = &plan.defs[idx];
                        let offset = batch.offset_of(def);
                        let slice = &words[offset..offset + def.count as usize];
                        match codec::decode(slice, def.data, def.gain, self.tuning.word_swap) {
                            Ok(value) => {
                                outcome.values.insert(def.name.clone(), Some(value));
                            }
                            Err(e) => {
                                warn!("{}: failed to decode {}: {}", device.name, def.name, e);
                                outcome.values.insert(def.name.clone(), None);
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!(
                        "{}: batch {}+{} failed: {}",
                        device.name, batch.start, batch.count, e
                    );
                    outcome.failed_batches += 1;
                    if e.is_connection() || matches!(e, Error::Timeout(_)) {
                        outcome.connection_failure = true;
                    }
                    for &idx in &batch.members {
                        outcome.values.insert(plan.defs[idx].name.clone(), None);
                    }
                }
            }
        }
        return Ok(outcome);
    }

    /// Write one parameter register. Checks run in order of cost: the global
    /// write switch first, then name lookups and value validation, and only
    /// then the wire.
    pub async fn write_parameter(
        &self,
        device_name: &str,
        register_name: &str,
        value: &Value,
    ) -> Result<()> {
        if self.read_only {
            return Err(Error::WriteNotPermitted);
        }

        let device = self
            .topology
            .by_name(device_name)
            .ok_or_else(|| Error::UnknownDevice(device_name.to_string()))?;
        let def = self
            .registers
            .for_kind(device.kind)
            .iter()
            .find(|d| d.name == register_name && d.applies_to(device.model.as_deref()))
            .ok_or_else(|| Error::UnknownRegister(register_name.to_string()))?;

        if !def.register_type.writable() {
            return Err(Error::Validation(format!(
                "register {} is not writable", register_name
            )));
        }
        /* write only registers cannot be probed, everything readable must
           have been seen as supported before it may be written */
        if def.register_type.readable()
            && self.support_map(device.id).get(register_name) != RegisterSupport::Supported
        {
            return Err(Error::Validation(format!(
                "register {} is not marked supported on {}", register_name, device_name
            )));
        }

        let words = codec::encode(value, def, self.tuning.word_swap)?;
        if words.len() > MAX_WRITE_WORDS as usize {
            return Err(Error::Validation(format!(
                "register {} spans {} words, above the write ceiling",
                register_name,
                words.len()
            )));
        }

        if words.len() == 1 {
            self.connections
                .write_register(&device.endpoint, device.slave_id, def.address, words[0])
                .await?;
        } else {
            self.connections
                .write_registers(&device.endpoint, device.slave_id, def.address, &words)
                .await?;
        }
        debug!("{}: wrote {:?} to {}", device_name, value, register_name);
        return Ok(());
    }

    fn device(&self, id: DeviceId) -> Result<DeviceInstance> {
        return self
            .topology
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownDevice(format!("device #{}", id.0)));
    }

    fn tier_plan(&self, id: DeviceId, device: &DeviceInstance, tier: PollTier) -> Arc<TierPlan> {
        {
            let state = self.state.read().unwrap();
            if let Some(plan) = state.get(&id).and_then(|s| s.plans.get(&tier)) {
                return plan.clone();
            }
        }

        let support = self.support_map(id);
        let defs: Vec<RegisterDefinition> = self
            .registers
            .for_kind(device.kind)
            .iter()
            .filter(|d| {
                d.register_type.readable()
                    && d.tier == tier
                    && d.applies_to(device.model.as_deref())
                    && support.get(&d.name) == RegisterSupport::Supported
            })
            .cloned()
            .collect();
        let batches = batch::plan_batches(&defs, self.tuning.max_gap, batch::MAX_READ_WORDS);
        let plan = Arc::new(TierPlan { defs, batches });

        let mut state = self.state.write().unwrap();
        state.entry(id).or_default().plans.insert(tier, plan.clone());
        return plan;
    }
}
