use log::info;
use serde::Deserialize;
use std::fs::File;
use std::io::prelude::*;

use crate::error::{Error, Result};
use crate::models::DeviceKind;

/// Access class of a register, using the short YAML spellings: `ro` registers
/// live in the input register space, `rw` and `wo` in the holding space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RegisterType {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    Holding,
    #[serde(rename = "wo")]
    WriteOnly,
}

/// Wire category; input and holding registers use different function codes
/// and can never share a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterCategory {
    Input,
    Holding,
}

impl RegisterType {
    pub fn category(&self) -> RegisterCategory {
        match self {
            RegisterType::ReadOnly => RegisterCategory::Input,
            RegisterType::Holding | RegisterType::WriteOnly => RegisterCategory::Holding,
        }
    }

    pub fn readable(&self) -> bool {
        !matches!(self, RegisterType::WriteOnly)
    }

    pub fn writable(&self) -> bool {
        !matches!(self, RegisterType::ReadOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U16,
    S16,
    U32,
    S32,
    U64,
    String,
}

impl DataType {
    /// Register width in 16-bit words; strings are free-width.
    pub fn width_words(&self) -> Option<u16> {
        match self {
            DataType::U16 | DataType::S16 => Some(1),
            DataType::U32 | DataType::S32 => Some(2),
            DataType::U64 => Some(4),
            DataType::String => None,
        }
    }
}

/// Polling cadence group, assigned per register by expected volatility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollTier {
    High,
    Medium,
    Low,
}

impl PollTier {
    pub const ALL: [PollTier; 3] = [PollTier::High, PollTier::Medium, PollTier::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            PollTier::High => "high",
            PollTier::Medium => "medium",
            PollTier::Low => "low",
        }
    }
}

fn default_gain() -> f64 { return 1.0 }
fn default_tier() -> PollTier { return PollTier::Medium }

/// Static description of one named register. Immutable once loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub register_type: RegisterType,
    pub address: u16,
    pub count: u16,
    pub data: DataType,
    /// Divisor applied to the raw integer to obtain the scaled value.
    #[serde(default = "default_gain")]
    pub gain: f64,
    pub unit: Option<String>,
    #[serde(default = "default_tier")]
    pub tier: PollTier,
    /// Restricts the register to specific device models; absent means all.
    pub applicable_to: Option<Vec<String>>,
}

impl RegisterDefinition {
    pub fn category(&self) -> RegisterCategory {
        self.register_type.category()
    }

    pub fn applies_to(&self, model: Option<&str>) -> bool {
        match (&self.applicable_to, model) {
            (None, _) => true,
            (Some(models), Some(m)) => models.iter().any(|candidate| candidate == m),
            (Some(_), None) => false,
        }
    }
}

#[derive(Deserialize)]
struct RegisterFile {
    device: String,
    registers: Vec<RegisterDefinition>,
}

const PLANT_DEFS: &str = include_str!("../../defs/plant.yaml");
const INVERTER_DEFS: &str = include_str!("../../defs/inverter.yaml");
const AC_CHARGER_DEFS: &str = include_str!("../../defs/ac_charger.yaml");
const DC_CHARGER_DEFS: &str = include_str!("../../defs/dc_charger.yaml");

/// All register tables, one per device kind.
#[derive(Debug, Clone)]
pub struct RegisterSet {
    plant: Vec<RegisterDefinition>,
    inverter: Vec<RegisterDefinition>,
    ac_charger: Vec<RegisterDefinition>,
    dc_charger: Vec<RegisterDefinition>,
}

impl RegisterSet {
    pub fn load() -> Result<Self> {
        return Ok(RegisterSet {
            plant: load_table(DeviceKind::Plant)?,
            inverter: load_table(DeviceKind::Inverter)?,
            ac_charger: load_table(DeviceKind::AcCharger)?,
            dc_charger: load_table(DeviceKind::DcCharger)?,
        });
    }

    pub fn for_kind(&self, kind: DeviceKind) -> &[RegisterDefinition] {
        match kind {
            DeviceKind::Plant => &self.plant,
            DeviceKind::Inverter => &self.inverter,
            DeviceKind::AcCharger => &self.ac_charger,
            DeviceKind::DcCharger => &self.dc_charger,
        }
    }

    pub fn find(&self, kind: DeviceKind, name: &str) -> Option<&RegisterDefinition> {
        self.for_kind(kind).iter().find(|def| def.name == name)
    }
}

/// User provided tables take precedence over the embedded defaults, the same
/// lookup order as the config file.
fn load_table(kind: DeviceKind) -> Result<Vec<RegisterDefinition>> {
    let override_path = format!("config/registers/{}.yaml", kind.as_str());
    if let Ok(mut file) = File::open(&override_path) {
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| Error::Config(format!("unable to read {override_path}: {e}")))?;
        info!("Using user provided register definitions for {}", kind.as_str());
        return parse_table(kind, &contents);
    }

    let embedded = match kind {
        DeviceKind::Plant => PLANT_DEFS,
        DeviceKind::Inverter => INVERTER_DEFS,
        DeviceKind::AcCharger => AC_CHARGER_DEFS,
        DeviceKind::DcCharger => DC_CHARGER_DEFS,
    };
    return parse_table(kind, embedded);
}

fn parse_table(kind: DeviceKind, contents: &str) -> Result<Vec<RegisterDefinition>> {
    let file: RegisterFile = serde_yml::from_str(contents)
        .map_err(|e| Error::Config(format!("bad register table for {}: {e}", kind.as_str())))?;

    if file.device != kind.as_str() {
        return Err(Error::Config(format!(
            "register table declares device {} but was loaded for {}",
            file.device, kind.as_str()
        )));
    }

    validate_table(kind, &file.registers)?;
    return Ok(file.registers);
}

fn validate_table(kind: DeviceKind, defs: &[RegisterDefinition]) -> Result<()> {
    for (i, def) in defs.iter().enumerate() {
        if def.count == 0 || def.count > 125 {
            return Err(Error::Config(format!(
                "register {} has word count {}", def.name, def.count
            )));
        }
        if let Some(width) = def.data.width_words() {
            if def.count != width {
                return Err(Error::Config(format!(
                    "register {} is {} words but its data type needs {}",
                    def.name, def.count, width
                )));
            }
        }
        if !(def.gain > 0.0) {
            return Err(Error::Config(format!(
                "register {} has non-positive gain {}", def.name, def.gain
            )));
        }
        for other in defs.iter().skip(i + 1) {
            if other.name == def.name {
                return Err(Error::Config(format!(
                    "duplicate register name {} in {} table", def.name, kind.as_str()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_tables_load() {
        let set = RegisterSet::load().unwrap();
        assert!(!set.for_kind(DeviceKind::Plant).is_empty());
        assert!(!set.for_kind(DeviceKind::Inverter).is_empty());
        assert!(!set.for_kind(DeviceKind::AcCharger).is_empty());
        assert!(!set.for_kind(DeviceKind::DcCharger).is_empty());
    }

    #[test]
    fn test_known_register_shape() {
        let set = RegisterSet::load().unwrap();
        let soc = set.find(DeviceKind::Plant, "ess_soc").unwrap();
        assert_eq!(soc.register_type, RegisterType::ReadOnly);
        assert_eq!(soc.category(), RegisterCategory::Input);
        assert_eq!(soc.data, DataType::U16);
        assert_eq!(soc.count, 1);
        assert_eq!(soc.gain, 10.0);

        let serial = set.find(DeviceKind::Inverter, "serial_number").unwrap();
        assert_eq!(serial.data, DataType::String);
        assert_eq!(serial.count, 8);
    }

    #[test]
    fn test_width_invariant_holds_for_all_tables() {
        let set = RegisterSet::load().unwrap();
        for kind in [DeviceKind::Plant, DeviceKind::Inverter, DeviceKind::AcCharger, DeviceKind::DcCharger] {
            for def in set.for_kind(kind) {
                if let Some(width) = def.data.width_words() {
                    assert_eq!(def.count, width, "register {}", def.name);
                }
            }
        }
    }

    #[test]
    fn test_width_mismatch_rejected() {
        let yaml = r"
device: plant
registers:
  - name: broken
    type: ro
    address: 30000
    count: 1
    data: s32
";
        assert!(parse_table(DeviceKind::Plant, yaml).is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let yaml = r"
device: plant
registers:
  - name: twice
    type: ro
    address: 30000
    count: 1
    data: u16
  - name: twice
    type: ro
    address: 30001
    count: 1
    data: u16
";
        assert!(parse_table(DeviceKind::Plant, yaml).is_err());
    }

    #[test]
    fn test_wrong_device_kind_rejected() {
        let yaml = "device: inverter\nregisters: []\n";
        assert!(parse_table(DeviceKind::Plant, yaml).is_err());
    }

    #[test]
    fn test_applicability() {
        let def = RegisterDefinition {
            name: "pv3_voltage".to_string(),
            register_type: RegisterType::ReadOnly,
            address: 31029,
            count: 1,
            data: DataType::S16,
            gain: 10.0,
            unit: None,
            tier: PollTier::High,
            applicable_to: Some(vec!["EC 12.0".to_string()]),
        };
        assert!(def.applies_to(Some("EC 12.0")));
        assert!(!def.applies_to(Some("Other")));
        assert!(!def.applies_to(None));
    }
}
