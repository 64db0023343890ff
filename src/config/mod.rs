use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::prelude::*;

use crate::error::{Error, Result};

fn plant_port_default() -> u16 { return 502 }
fn plant_slave_id_default() -> u8 { return 247 }

/// Network location of the plant controller. Inverters and chargers default
/// to this connection unless they carry their own host/port.
#[derive(Deserialize, Serialize, Clone)]
pub struct PlantConfig {
    pub host: String,
    #[serde(default="plant_port_default")]
    pub port: u16,
    #[serde(default="plant_slave_id_default")]
    pub slave_id: u8,
}

#[derive(Deserialize, Serialize, Clone)]
pub struct InverterConfig {
    pub name: String,
    pub slave_id: u8,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub model: Option<String>,
}

#[derive(Deserialize, Serialize, Clone)]
pub struct AcChargerConfig {
    pub name: String,
    pub slave_id: u8,
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// DC chargers hang off an inverter and share its connection by default.
#[derive(Deserialize, Serialize, Clone)]
pub struct DcChargerConfig {
    pub name: String,
    pub slave_id: u8,
    pub inverter: String,
    pub host: Option<String>,
    pub port: Option<u16>,
}

fn scan_high_default() -> u64 { return 5 }
fn scan_medium_default() -> u64 { return 30 }
fn scan_low_default() -> u64 { return 600 }

#[derive(Deserialize, Serialize, Clone)]
pub struct ScanIntervals {
    #[serde(default="scan_high_default")]
    pub high: u64,
    #[serde(default="scan_medium_default")]
    pub medium: u64,
    #[serde(default="scan_low_default")]
    pub low: u64,
}

fn scan_intervals_default() -> ScanIntervals {
    return ScanIntervals {
        high: scan_high_default(),
        medium: scan_medium_default(),
        low: scan_low_default(),
    }
}

fn timeout_secs_default() -> u64 { return 10 }
fn max_gap_default() -> u16 { return 0 }
fn connect_attempts_default() -> u32 { return 3 }
fn offline_threshold_default() -> u32 { return 3 }

#[derive(Deserialize, Serialize, Clone)]
pub struct ModbusTuning {
    /// Per request timeout, not per tick, so a slow device cannot block
    /// unrelated endpoints.
    #[serde(default="timeout_secs_default")]
    pub timeout_secs: u64,
    /// Largest address hole the batch planner may bridge. 0 keeps batches
    /// strictly adjacent.
    #[serde(default="max_gap_default")]
    pub max_gap: u16,
    /// Swap the two 16-bit words of 32-bit quantities on the wire.
    #[serde(default)]
    pub word_swap: bool,
    #[serde(default="connect_attempts_default")]
    pub connect_attempts: u32,
    /// Ticks of total failure before a device is demoted to low cadence.
    #[serde(default="offline_threshold_default")]
    pub offline_threshold: u32,
}

fn modbus_tuning_default() -> ModbusTuning {
    return ModbusTuning {
        timeout_secs: timeout_secs_default(),
        max_gap: max_gap_default(),
        word_swap: false,
        connect_attempts: connect_attempts_default(),
        offline_threshold: offline_threshold_default(),
    }
}

fn read_only_default() -> bool { return true }

#[derive(Deserialize, Serialize, Clone)]
pub struct Config {
    pub plant: PlantConfig,
    #[serde(default)]
    pub inverters: Vec<InverterConfig>,
    #[serde(default)]
    pub ac_chargers: Vec<AcChargerConfig>,
    #[serde(default)]
    pub dc_chargers: Vec<DcChargerConfig>,
    /// When set, every write_parameter call fails immediately without any
    /// network access.
    #[serde(default="read_only_default")]
    pub read_only: bool,
    #[serde(default="scan_intervals_default")]
    pub scan_intervals: ScanIntervals,
    #[serde(default="modbus_tuning_default")]
    pub modbus: ModbusTuning,
}

impl Config {
    /// Check the two usual locations for the config file, config/ first.
    pub fn load() -> Result<Self> {
        let mut file = File::open("config/esspoll.yaml");
        if file.is_err() {
            file = File::open("esspoll.yaml");
        }
        let mut file = file
            .map_err(|e| Error::Config(format!("unable to open config/esspoll.yaml or esspoll.yaml: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| Error::Config(format!("unable to read config file: {e}")))?;

        let config = Self::parse(&contents)?;
        info!("Loaded config with {} inverters, {} AC chargers, {} DC chargers",
              config.inverters.len(), config.ac_chargers.len(), config.dc_chargers.len());
        return Ok(config);
    }

    pub fn parse(contents: &str) -> Result<Self> {
        return serde_yml::from_str(contents)
            .map_err(|e| Error::Config(format!("unable to parse config file: {e}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = "plant:\n  host: 192.168.1.10\n";

    #[test]
    fn test_parse_minimal_config() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.plant.port, 502);
        assert_eq!(config.plant.slave_id, 247);
        assert!(config.read_only);
        assert_eq!(config.scan_intervals.high, 5);
        assert_eq!(config.scan_intervals.low, 600);
        assert_eq!(config.modbus.max_gap, 0);
        assert!(!config.modbus.word_swap);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r"
plant:
  host: plant.local
  port: 1502
  slave_id: 247
inverters:
  - name: inverter_1
    slave_id: 1
  - name: inverter_2
    slave_id: 2
    host: 10.0.0.5
dc_chargers:
  - name: dc_charger_1
    slave_id: 3
    inverter: inverter_1
read_only: false
scan_intervals:
  high: 2
modbus:
  word_swap: true
";
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.inverters.len(), 2);
        assert_eq!(config.inverters[1].host.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.dc_chargers[0].inverter, "inverter_1");
        assert!(!config.read_only);
        assert_eq!(config.scan_intervals.high, 2);
        assert_eq!(config.scan_intervals.medium, 30);
        assert!(config.modbus.word_swap);
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(Config::parse("plant: [").is_err());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("esspoll.yaml");
        let mut f = File::create(&path).unwrap();
        f.write_all(MINIMAL.as_bytes()).unwrap();
        drop(f);

        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        let config = Config::parse(&contents).unwrap();
        assert_eq!(config.plant.host, "192.168.1.10");
    }
}
