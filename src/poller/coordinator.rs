//! Tiered poll scheduling and snapshot publishing.
//!
//! Three loops tick at the configured high/medium/low cadences. Each tick
//! fans out over the devices due in that tier, merges the results into one
//! snapshot and publishes it over a watch channel, so consumers always see a
//! consistent view and can await changes instead of polling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{Config, ScanIntervals};
use crate::error::{Error, Result};
use crate::models::{
    Availability, DeviceId, DeviceSnapshot, PollSnapshot, SupportMap, Topology, Value,
};
use crate::poller::{PollEngine, ReadOutcome};
use crate::registers::{PollTier, RegisterSet};

struct Health {
    availability: Availability,
    consecutive_failures: u32,
}

struct Shared {
    health: HashMap<DeviceId, Health>,
    devices: HashMap<String, DeviceSnapshot>,
}

enum DeviceTick {
    Read(ReadOutcome),
    Failed,
}

pub struct PollCoordinator {
    engine: Arc<PollEngine>,
    intervals: ScanIntervals,
    offline_threshold: u32,
    shared: StdMutex<Shared>,
    snapshot_tx: watch::Sender<PollSnapshot>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl PollCoordinator {
    /// Build the engine and start the tier loops. Every loop fires once
    /// immediately, so the first snapshot arrives without waiting a full
    /// interval.
    pub fn start(config: &Config, topology: Topology, registers: RegisterSet) -> Arc<Self> {
        let engine = Arc::new(PollEngine::new(
            topology,
            registers,
            config.modbus.clone(),
            config.read_only,
        ));

        let mut health = HashMap::new();
        let mut devices = HashMap::new();
        for device in engine.topology().devices() {
            health.insert(device.id, Health {
                availability: Availability::Unknown,
                consecutive_failures: 0,
            });
            devices.insert(device.name.clone(), DeviceSnapshot {
                kind: device.kind,
                availability: Availability::Unknown,
                updated: Utc::now(),
                values: HashMap::new(),
            });
        }

        let (snapshot_tx, _) = watch::channel(PollSnapshot {
            timestamp: Utc::now(),
            devices: devices.clone(),
        });

        let coordinator = Arc::new(PollCoordinator {
            engine,
            intervals: config.scan_intervals.clone(),
            offline_threshold: config.modbus.offline_threshold,
            shared: StdMutex::new(Shared { health, devices }),
            snapshot_tx,
            tasks: StdMutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        for tier in PollTier::ALL {
            let me = coordinator.clone();
            tasks.push(tokio::spawn(async move {
                me.tier_loop(tier).await;
            }));
        }
        *coordinator.tasks.lock().unwrap() = tasks;

        info!(
            "Polling {} devices (high {}s, medium {}s, low {}s)",
            coordinator.engine.topology().len(),
            config.scan_intervals.high,
            config.scan_intervals.medium,
            config.scan_intervals.low
        );
        return coordinator;
    }

    /// Current snapshot, cloned out of the watch channel.
    pub fn snapshot(&self) -> PollSnapshot {
        return self.snapshot_tx.borrow().clone();
    }

    /// Receiver that resolves whenever a new snapshot is published.
    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        return self.snapshot_tx.subscribe();
    }

    pub async fn write_parameter(
        &self,
        device: &str,
        register: &str,
        value: &Value,
    ) -> Result<()> {
        return self.engine.write_parameter(device, register, value).await;
    }

    pub fn support_map(&self, device: &str) -> Result<SupportMap> {
        let id = self.device_id(device)?;
        return Ok(self.engine.support_map(id));
    }

    /// Forget the probe results of one device; the next cycle probes it
    /// again. Used after a firmware update changes the register map.
    pub fn reprobe(&self, device: &str) -> Result<()> {
        let id = self.device_id(device)?;
        self.engine.invalidate(id);
        return Ok(());
    }

    /// Stop the tier loops and drop all pooled connections.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.engine.close_connections();
    }

    fn device_id(&self, name: &str) -> Result<DeviceId> {
        return self
            .engine
            .topology()
            .by_name(name)
            .map(|d| d.id)
            .ok_or_else(|| Error::UnknownDevice(name.to_string()));
    }

    async fn tier_loop(self: Arc<Self>, tier: PollTier) {
        let period = Duration::from_secs(interval_secs(&self.intervals, tier));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_tick(tier, period).await;
        }
    }

    async fn run_tick(&self, tier: PollTier, deadline: Duration) {
        self.engine.begin_cycle();

        let due: Vec<DeviceId> = {
            let shared = self.shared.lock().unwrap();
            self.engine
                .topology()
                .devices()
                .filter(|d| {
                    let availability = shared.health[&d.id].availability;
                    should_poll(availability, tier)
                })
                .map(|d| d.id)
                .collect()
        };
        if due.is_empty() {
            return;
        }
        debug!("Tier {} tick, {} devices due", tier.as_str(), due.len());

        let polls = due.iter().map(|&id| async move {
            match tokio::time::timeout(deadline, self.poll_device(id, tier)).await {
                Ok(tick) => (id, tick),
                Err(_) => {
                    warn!("Device #{} did not finish within the tick deadline", id.0);
                    (id, DeviceTick::Failed)
                }
            }
        });
        let results = join_all(polls).await;

        let snapshot = {
            let mut shared = self.shared.lock().unwrap();
            for (id, tick) in results {
                self.apply(&mut shared, id, tick);
            }
            PollSnapshot { timestamp: Utc::now(), devices: shared.devices.clone() }
        };
        self.snapshot_tx.send_replace(snapshot);
    }

    async fn poll_device(&self, id: DeviceId, tier: PollTier) -> DeviceTick {
        if !self.engine.is_probed(id) {
            if let Err(e) = self.engine.probe_device(id).await {
                warn!("Probe failed: {}", e);
                return DeviceTick::Failed;
            }
        }
        match self.engine.read_device(id, tier).await {
            Ok(outcome) => return DeviceTick::Read(outcome),
            Err(e) => {
                warn!("Read failed: {}", e);
                return DeviceTick::Failed;
            }
        }
    }

    fn apply(&self, shared: &mut Shared, id: DeviceId, tick: DeviceTick) {
        let Some(device) = self.engine.topology().get(id) else { return };
        let Some(entry) = shared.devices.get_mut(&device.name) else { return };
        let Some(health) = shared.health.get_mut(&id) else { return };

        match tick {
            DeviceTick::Read(outcome) if outcome.complete() => {
                health.consecutive_failures = 0;
                health.availability = Availability::Online;
                entry.values.extend(outcome.values);
                entry.updated = Utc::now();
            }
            DeviceTick::Read(outcome) if outcome.responded() => {
                health.consecutive_failures = 0;
                health.availability = Availability::Degraded;
                entry.values.extend(outcome.values);
                entry.updated = Utc::now();
            }
            tick => {
                if let DeviceTick::Read(outcome) = tick {
                    /* every batch failed, the outcome carries the None marks */
                    entry.values.extend(outcome.values);
                }
                health.consecutive_failures += 1;
                let was_contacted = health.availability != Availability::Unknown;
                if was_contacted && health.consecutive_failures >= self.offline_threshold {
                    if health.availability != Availability::Offline {
                        warn!("Device {} is offline, demoting it to the low tier", device.name);
                    }
                    health.availability = Availability::Offline;
                    for value in entry.values.values_mut() {
                        *value = None;
                    }
                }
            }
        }
        entry.availability = health.availability;
    }
}

/// Offline devices are only retried at the low cadence to keep dead gear
/// from eating the fast tiers' time budget.
fn should_poll(availability: Availability, tier: PollTier) -> bool {
    return availability != Availability::Offline || tier == PollTier::Low;
}

fn interval_secs(intervals: &ScanIntervals, tier: PollTier) -> u64 {
    return match tier {
        PollTier::High => intervals.high,
        PollTier::Medium => intervals.medium,
        PollTier::Low => intervals.low,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::modbus::testserver::TestServer;
    use crate::models::Value;

    fn config_for(server: &TestServer) -> Config {
        let endpoint = server.endpoint();
        Config::parse(&format!(
            r"
plant:
  host: {}
  port: {}
read_only: false
scan_intervals:
  high: 1
  medium: 1
  low: 1
modbus:
  timeout_secs: 1
  connect_attempts: 2
  offline_threshold: 2
",
            endpoint.host, endpoint.port
        ))
        .unwrap()
    }

    fn seed_plant(server: &TestServer) {
        for addr in 30000..30060 {
            server.set_inputs(247, addr, &[0]);
        }
        for addr in 40000..40040 {
            server.set_holdings(247, addr, &[0]);
        }
    }

    async fn await_value(
        rx: &mut watch::Receiver<PollSnapshot>,
        device: &str,
        register: &str,
    ) -> PollSnapshot {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                {
                    let snapshot = rx.borrow_and_update();
                    if snapshot.value(device, register).is_some() {
                        return snapshot.clone();
                    }
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("snapshot never carried the value")
    }

    #[tokio::test]
    async fn test_snapshot_reaches_online_with_values() {
        let server = TestServer::start().await;
        seed_plant(&server);
        server.set_inputs(247, 30014, &[555]);

        let config = config_for(&server);
        let topology = Topology::build(&config).unwrap();
        let coordinator = PollCoordinator::start(&config, topology, RegisterSet::load().unwrap());

        let mut rx = coordinator.subscribe();
        let snapshot = await_value(&mut rx, "plant", "ess_soc").await;
        assert_eq!(snapshot.value("plant", "ess_soc"), Some(&Value::Float(55.5)));
        assert_eq!(snapshot.devices["plant"].availability, Availability::Online);

        coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_device_goes_offline_and_values_turn_none() {
        let server = TestServer::start().await;
        seed_plant(&server);

        let config = config_for(&server);
        let topology = Topology::build(&config).unwrap();
        let coordinator = PollCoordinator::start(&config, topology, RegisterSet::load().unwrap());

        let mut rx = coordinator.subscribe();
        let _ = await_value(&mut rx, "plant", "ess_soc").await;

        /* pull the plug */
        drop(server);

        let snapshot = tokio::time::timeout(Duration::from_secs(15), async {
            loop {
                rx.changed().await.unwrap();
                let snapshot = rx.borrow_and_update().clone();
                if snapshot.devices["plant"].availability == Availability::Offline {
                    return snapshot;
                }
            }
        })
        .await
        .expect("device never went offline");

        assert!(snapshot.devices["plant"].values.values().all(|v| v.is_none()));
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_write_and_reprobe_through_coordinator() {
        let server = TestServer::start().await;
        seed_plant(&server);

        let config = config_for(&server);
        let topology = Topology::build(&config).unwrap();
        let coordinator = PollCoordinator::start(&config, topology, RegisterSet::load().unwrap());

        /* writes need the probe to have classified the register first */
        let mut rx = coordinator.subscribe();
        let _ = await_value(&mut rx, "plant", "ess_soc").await;

        coordinator
            .write_parameter("plant", "plant_start_stop", &Value::Uint(1))
            .await
            .unwrap();
        assert_eq!(server.holding(247, 40000), Some(1));

        assert!(coordinator.reprobe("plant").is_ok());
        assert!(matches!(
            coordinator.reprobe("ghost"),
            Err(Error::UnknownDevice(_))
        ));
        assert!(coordinator.support_map("plant").is_ok());

        coordinator.shutdown();
    }

    #[test]
    fn test_offline_devices_only_polled_in_low_tier() {
        assert!(should_poll(Availability::Online, PollTier::High));
        assert!(should_poll(Availability::Unknown, PollTier::High));
        assert!(!should_poll(Availability::Offline, PollTier::High));
        assert!(!should_poll(Availability::Offline, PollTier::Medium));
        assert!(should_poll(Availability::Offline, PollTier::Low));
    }
}
