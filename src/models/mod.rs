use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::error::{Error, Result};

/// One (host, port) network target. Several device instances may share an
/// endpoint and are told apart by their slave id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint { host: host.into(), port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Plant,
    Inverter,
    AcCharger,
    DcCharger,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Plant => "plant",
            DeviceKind::Inverter => "inverter",
            DeviceKind::AcCharger => "ac_charger",
            DeviceKind::DcCharger => "dc_charger",
        }
    }
}

/// Opaque arena index into the topology. Parent references use ids instead of
/// live references, which keeps the device graph cycle free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

#[derive(Debug, Clone)]
pub struct DeviceInstance {
    pub id: DeviceId,
    pub name: String,
    pub kind: DeviceKind,
    pub slave_id: u8,
    pub endpoint: Endpoint,
    pub parent: Option<DeviceId>,
    pub model: Option<String>,
}

/// Arena of all configured device instances. Built once from the config and
/// immutable for the lifetime of the engine.
#[derive(Debug, Clone)]
pub struct Topology {
    devices: Vec<DeviceInstance>,
}

impl Topology {
    pub fn build(config: &Config) -> Result<Self> {
        let mut devices: Vec<DeviceInstance> = Vec::new();
        let plant_endpoint = Endpoint::new(config.plant.host.clone(), config.plant.port);

        check_slave_id("plant", config.plant.slave_id)?;
        let plant_id = DeviceId(0);
        devices.push(DeviceInstance {
            id: plant_id,
            name: "plant".to_string(),
            kind: DeviceKind::Plant,
            slave_id: config.plant.slave_id,
            endpoint: plant_endpoint.clone(),
            parent: None,
            model: None,
        });

        for inv in config.inverters.iter() {
            check_slave_id(&inv.name, inv.slave_id)?;
            let endpoint = match &inv.host {
                Some(host) => Endpoint::new(host.clone(), inv.port.unwrap_or(config.plant.port)),
                None => plant_endpoint.clone(),
            };
            devices.push(DeviceInstance {
                id: DeviceId(devices.len() as u32),
                name: inv.name.clone(),
                kind: DeviceKind::Inverter,
                slave_id: inv.slave_id,
                endpoint,
                parent: Some(plant_id),
                model: inv.model.clone(),
            });
        }

        for ac in config.ac_chargers.iter() {
            check_slave_id(&ac.name, ac.slave_id)?;
            let endpoint = match &ac.host {
                Some(host) => Endpoint::new(host.clone(), ac.port.unwrap_or(config.plant.port)),
                None => plant_endpoint.clone(),
            };
            devices.push(DeviceInstance {
                id: DeviceId(devices.len() as u32),
                name: ac.name.clone(),
                kind: DeviceKind::AcCharger,
                slave_id: ac.slave_id,
                endpoint,
                parent: Some(plant_id),
                model: None,
            });
        }

        for dc in config.dc_chargers.iter() {
            check_slave_id(&dc.name, dc.slave_id)?;
            let parent = devices
                .iter()
                .find(|d| d.kind == DeviceKind::Inverter && d.name == dc.inverter)
                .ok_or_else(|| Error::Config(format!(
                    "DC charger {} references unknown inverter {}", dc.name, dc.inverter
                )))?;
            let endpoint = match &dc.host {
                Some(host) => Endpoint::new(host.clone(), dc.port.unwrap_or(parent.endpoint.port)),
                None => parent.endpoint.clone(),
            };
            let parent_id = parent.id;
            devices.push(DeviceInstance {
                id: DeviceId(devices.len() as u32),
                name: dc.name.clone(),
                kind: DeviceKind::DcCharger,
                slave_id: dc.slave_id,
                endpoint,
                parent: Some(parent_id),
                model: None,
            });
        }

        for (i, a) in devices.iter().enumerate() {
            for b in devices.iter().skip(i + 1) {
                if a.name == b.name {
                    return Err(Error::Config(format!("duplicate device name: {}", a.name)));
                }
                if a.endpoint == b.endpoint && a.slave_id == b.slave_id {
                    return Err(Error::Config(format!(
                        "devices {} and {} share endpoint {} and slave id {}",
                        a.name, b.name, a.endpoint, a.slave_id
                    )));
                }
            }
        }

        return Ok(Topology { devices });
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceInstance> {
        self.devices.iter()
    }

    pub fn get(&self, id: DeviceId) -> Option<&DeviceInstance> {
        self.devices.get(id.0 as usize)
    }

    pub fn by_name(&self, name: &str) -> Option<&DeviceInstance> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Endpoints in use, deduplicated.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = Vec::new();
        for device in self.devices.iter() {
            if !endpoints.contains(&device.endpoint) {
                endpoints.push(device.endpoint.clone());
            }
        }
        return endpoints;
    }
}

fn check_slave_id(name: &str, slave_id: u8) -> Result<()> {
    if slave_id == 0 || slave_id > 247 {
        return Err(Error::Config(format!(
            "device {name} has slave id {slave_id} outside 1..=247"
        )));
    }
    Ok(())
}

/// Capability state of one register on one device instance. Written only by
/// the prober; the reader never flips it on its own after a failed poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterSupport {
    Supported,
    Unsupported,
    Unprobed,
}

#[derive(Debug, Clone, Default)]
pub struct SupportMap {
    entries: HashMap<String, RegisterSupport>,
}

impl SupportMap {
    pub fn new() -> Self {
        SupportMap { entries: HashMap::new() }
    }

    pub fn set(&mut self, name: impl Into<String>, support: RegisterSupport) {
        self.entries.insert(name.into(), support);
    }

    pub fn get(&self, name: &str) -> RegisterSupport {
        *self.entries.get(name).unwrap_or(&RegisterSupport::Unprobed)
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.get(name) == RegisterSupport::Supported
    }

    pub fn entries(&self) -> &HashMap<String, RegisterSupport> {
        &self.entries
    }
}

impl PartialEq for SupportMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

/// A decoded, scaled register value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Uint(u64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Uint(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(_) => None,
        }
    }
}

/// Device level availability as published in the snapshot.
///
/// `Unknown` means the device has never been probed successfully, which is a
/// different statement than `Offline` (probed once, now unreachable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Unknown,
    Online,
    Degraded,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub kind: DeviceKind,
    pub availability: Availability,
    /// Last time any value of this device was refreshed. Stays behind the
    /// snapshot timestamp while the device is offline, acting as the age
    /// marker for retained values.
    pub updated: DateTime<Utc>,
    /// Register name to value; None flags a register unavailable this tick
    /// rather than silently dropping it.
    pub values: HashMap<String, Option<Value>>,
}

/// Merged view over all devices, replaced atomically on every publish.
#[derive(Debug, Clone, Serialize)]
pub struct PollSnapshot {
    pub timestamp: DateTime<Utc>,
    pub devices: HashMap<String, DeviceSnapshot>,
}

impl PollSnapshot {
    pub fn empty() -> Self {
        PollSnapshot { timestamp: Utc::now(), devices: HashMap::new() }
    }

    pub fn value(&self, device: &str, register: &str) -> Option<&Value> {
        self.devices.get(device)?.values.get(register)?.as_ref()
    }
}
