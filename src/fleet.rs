//! Fleet registry.
//!
//! Keeps the simulated devices in insertion order, keyed by serial number,
//! together with the default server endpoint handed to new devices. All
//! devices share one transport and one event channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{Config, DeviceTiming};
use crate::device::{
    Device, DeviceError, DeviceEvent, DeviceOptions, DeviceSummary, EVENT_CHANNEL_CAPACITY,
};
use crate::generator::DataGenerator;
use crate::protocol::validate_field;
use crate::transport::{Endpoint, TcpTransport, Transport};

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("a device with serial number {serial} already exists")]
    DuplicateSerial { serial: String },

    #[error("invalid serial number '{serial}': {reason}")]
    InvalidSerial { serial: String, reason: String },

    #[error("no device with serial number {serial}")]
    NotFound { serial: String },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Outcome of a fleet-wide operation.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Number of devices the operation was applied to
    pub attempted: usize,

    /// Devices that failed, by serial number
    pub failures: Vec<(String, DeviceError)>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.attempted - self.failures.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ordered collection of simulated devices.
pub struct Fleet {
    devices: RwLock<Vec<Device>>,
    server: RwLock<Endpoint>,
    transport: Arc<dyn Transport>,
    timing: DeviceTiming,
    seed: Option<u64>,
    sequence: AtomicU64,
    events: broadcast::Sender<DeviceEvent>,
}

impl Fleet {
    /// Create an empty fleet whose devices talk to `server` by default.
    pub fn new(server: Endpoint, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            devices: RwLock::new(Vec::new()),
            server: RwLock::new(server),
            transport,
            timing: DeviceTiming::default(),
            seed: None,
            sequence: AtomicU64::new(0),
            events,
        }
    }

    /// Loop timing used for devices added from now on.
    pub fn with_timing(mut self, timing: DeviceTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Seed device random sources deterministically.
    ///
    /// Each device gets `seed` plus its position in the order devices were
    /// added, so a fleet built the same way produces the same data.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build a TCP-backed fleet holding the configured devices.
    pub fn from_config(config: &Config) -> Result<Self, FleetError> {
        let transport = Arc::new(TcpTransport::new(config.transport_config()));
        let mut fleet =
            Self::new(config.server.clone(), transport).with_timing(config.timing.clone());
        if let Some(seed) = config.seed {
            fleet = fleet.with_seed(seed);
        }

        for serial in &config.serials {
            fleet.add(serial)?;
        }
        Ok(fleet)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Device>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Device>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generator(&self) -> DataGenerator {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        match self.seed {
            Some(seed) => DataGenerator::from_seed(seed.wrapping_add(sequence)),
            None => DataGenerator::from_entropy(),
        }
    }

    /// Register a new, disconnected device using the current default endpoint.
    pub fn add(&self, serial: &str) -> Result<Device, FleetError> {
        let serial = serial.trim();
        if serial.is_empty() {
            return Err(FleetError::InvalidSerial {
                serial: serial.to_string(),
                reason: "serial number cannot be empty".to_string(),
            });
        }
        validate_field("serial", serial).map_err(|e| FleetError::InvalidSerial {
            serial: serial.to_string(),
            reason: e.to_string(),
        })?;

        let mut devices = self.write();
        if devices.iter().any(|d| d.serial() == serial) {
            return Err(FleetError::DuplicateSerial {
                serial: serial.to_string(),
            });
        }

        let device = Device::new(
            serial,
            self.server(),
            DeviceOptions {
                transport: Arc::clone(&self.transport),
                timing: self.timing.clone(),
                generator: self.next_generator(),
                events: self.events.clone(),
            },
        );
        devices.push(device.clone());

        info!(serial = %serial, endpoint = %device.endpoint(), "Device added");
        Ok(device)
    }

    /// Disconnect and unregister a device.
    pub async fn remove(&self, serial: &str) -> Result<Device, FleetError> {
        let device = self.get(serial).ok_or_else(|| FleetError::NotFound {
            serial: serial.to_string(),
        })?;

        device.disconnect().await;

        let mut devices = self.write();
        let position = devices
            .iter()
            .position(|d| d.serial() == device.serial())
            .ok_or_else(|| FleetError::NotFound {
                serial: serial.to_string(),
            })?;
        let removed = devices.remove(position);
        info!(serial = %removed.serial(), "Device removed");
        Ok(removed)
    }

    pub fn get(&self, serial: &str) -> Option<Device> {
        let serial = serial.trim();
        self.read().iter().find(|d| d.serial() == serial).cloned()
    }

    /// Handles to all devices, in insertion order.
    pub fn devices(&self) -> Vec<Device> {
        self.read().clone()
    }

    /// Summaries of all devices, in insertion order.
    pub fn list(&self) -> Vec<DeviceSummary> {
        self.read().iter().map(Device::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub async fn connect(&self, serial: &str) -> Result<(), FleetError> {
        let device = self.get(serial).ok_or_else(|| FleetError::NotFound {
            serial: serial.to_string(),
        })?;
        device.connect().await?;
        Ok(())
    }

    pub async fn disconnect(&self, serial: &str) -> Result<(), FleetError> {
        let device = self.get(serial).ok_or_else(|| FleetError::NotFound {
            serial: serial.to_string(),
        })?;
        device.disconnect().await;
        Ok(())
    }

    /// Connect every device; one failure does not stop the rest.
    pub async fn connect_all(&self) -> BatchReport {
        let devices = self.devices();
        let mut report = BatchReport {
            attempted: devices.len(),
            failures: Vec::new(),
        };

        for device in devices {
            if let Err(e) = device.connect().await {
                warn!(serial = %device.serial(), error = %e, "Failed to connect device");
                report.failures.push((device.serial().to_string(), e));
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded(),
            "Connected fleet"
        );
        report
    }

    /// Disconnect every device.
    pub async fn disconnect_all(&self) -> BatchReport {
        let devices = self.devices();
        let attempted = devices.len();

        for device in devices {
            device.disconnect().await;
        }

        info!(attempted, "Disconnected fleet");
        BatchReport {
            attempted,
            failures: Vec::new(),
        }
    }

    /// Default endpoint for new devices.
    pub fn server(&self) -> Endpoint {
        self.server
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Change the default endpoint. With `propagate` every existing device
    /// is pointed at it too. Returns the number of devices updated.
    pub fn set_server(&self, endpoint: Endpoint, propagate: bool) -> usize {
        *self.server.write().unwrap_or_else(PoisonError::into_inner) = endpoint.clone();

        let updated = if propagate {
            let devices = self.read();
            for device in devices.iter() {
                device.set_endpoint(endpoint.clone());
            }
            devices.len()
        } else {
            0
        };

        info!(endpoint = %endpoint, updated, "Server endpoint changed");
        updated
    }

    /// Events from every device in the fleet.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("server", &self.server())
            .field("devices", &*self.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConnectionState;
    use crate::protocol::{split_fields, FormatVariant};
    use crate::transport::{Delivery, ReplyMode, TransportError};
    use async_trait::async_trait;
    use std::time::Duration;

    struct AckTransport;

    #[async_trait]
    impl Transport for AckTransport {
        async fn send(
            &self,
            _endpoint: &Endpoint,
            _payload: &[u8],
            reply: ReplyMode,
        ) -> Result<Delivery, TransportError> {
            Ok(match reply {
                ReplyMode::None => Delivery::Sent,
                ReplyMode::AwaitAck => Delivery::Acknowledged("#A".to_string()),
            })
        }
    }

    fn test_fleet() -> Fleet {
        Fleet::new(Endpoint::new("127.0.0.1", 5000), Arc::new(AckTransport)).with_timing(
            DeviceTiming {
                tick_interval_min: Duration::from_millis(10),
                tick_interval_max: Duration::from_millis(20),
                send_throttle: Duration::from_millis(1),
                error_backoff: Duration::from_millis(10),
                batch_pause: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn test_add_and_list_in_order() {
        let fleet = test_fleet();
        assert!(fleet.is_empty());

        fleet.add("LD0000002").unwrap();
        fleet.add(" LD0000001 ").unwrap();
        fleet.add("LD0000003").unwrap();

        let serials: Vec<String> = fleet.list().into_iter().map(|s| s.serial).collect();
        assert_eq!(serials, vec!["LD0000002", "LD0000001", "LD0000003"]);
        assert_eq!(fleet.len(), 3);
        assert!(fleet
            .list()
            .iter()
            .all(|s| s.state == ConnectionState::Disconnected && s.pending == 0));
    }

    #[test]
    fn test_duplicate_serial() {
        let fleet = test_fleet();
        fleet.add("LD0000001").unwrap();

        let err = fleet.add("LD0000001 ").unwrap_err();
        assert!(matches!(err, FleetError::DuplicateSerial { ref serial } if serial == "LD0000001"));
        assert_eq!(fleet.len(), 1);
    }

    #[test]
    fn test_invalid_serials() {
        let fleet = test_fleet();
        for serial in ["", "   ", "LD\n0001", "LD\u{e9}0001"] {
            let err = fleet.add(serial).unwrap_err();
            assert!(
                matches!(err, FleetError::InvalidSerial { .. }),
                "{:?} should be rejected",
                serial
            );
        }
        assert!(fleet.is_empty());
    }

    #[tokio::test]
    async fn test_remove_disconnects() {
        let fleet = test_fleet();
        let device = fleet.add("LD0000001").unwrap();
        fleet.connect("LD0000001").await.unwrap();
        assert!(device.is_connected());

        let removed = fleet.remove("LD0000001").await.unwrap();
        assert_eq!(removed.serial(), "LD0000001");
        assert!(!device.is_connected());
        assert!(fleet.get("LD0000001").is_none());

        let err = fleet.remove("LD0000001").await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unknown_serial() {
        let fleet = test_fleet();
        assert!(matches!(
            fleet.connect("LD0000404").await,
            Err(FleetError::NotFound { .. })
        ));
        assert!(matches!(
            fleet.disconnect("LD0000404").await,
            Err(FleetError::NotFound { .. })
        ));
    }

    #[test]
    fn test_server_propagation() {
        let fleet = test_fleet();
        let first = fleet.add("LD0000001").unwrap();

        let updated = fleet.set_server(Endpoint::new("10.0.0.5", 6000), false);
        assert_eq!(updated, 0);
        assert_eq!(first.endpoint(), Endpoint::new("127.0.0.1", 5000));

        let second = fleet.add("LD0000002").unwrap();
        assert_eq!(second.endpoint(), Endpoint::new("10.0.0.5", 6000));

        let updated = fleet.set_server(Endpoint::new("10.0.0.6", 7000), true);
        assert_eq!(updated, 2);
        assert_eq!(first.endpoint(), Endpoint::new("10.0.0.6", 7000));
        assert_eq!(second.endpoint(), Endpoint::new("10.0.0.6", 7000));
        assert_eq!(fleet.server(), Endpoint::new("10.0.0.6", 7000));
    }

    #[tokio::test]
    async fn test_batch_report_collects_failures() {
        let fleet = test_fleet();
        fleet.add("LD0000001").unwrap();
        let broken = fleet.add("LD0000002").unwrap();
        fleet.add("LD0000003").unwrap();
        broken.set_endpoint(Endpoint::new("", 0));

        let report = fleet.connect_all().await;
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded(), 2);
        assert!(!report.is_success());
        assert_eq!(report.failures[0].0, "LD0000002");
        assert!(matches!(
            report.failures[0].1,
            DeviceError::InvalidEndpoint { .. }
        ));

        let report = fleet.disconnect_all().await;
        assert!(report.is_success());
        assert!(fleet.devices().iter().all(|d| !d.is_connected()));
    }

    #[tokio::test]
    async fn test_fleet_events_are_shared() {
        let fleet = test_fleet();
        fleet.add("LD0000001").unwrap();
        fleet.add("LD0000002").unwrap();
        let mut events = fleet.subscribe();

        fleet.connect("LD0000002").await.unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(event, DeviceEvent::Connected { .. }));
        assert_eq!(event.serial(), "LD0000002");

        fleet.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_seeded_fleets_produce_same_data() {
        let a = test_fleet().with_seed(2024);
        let b = test_fleet().with_seed(2024);

        let device_a = a.add("LD0000001").unwrap();
        let device_b = b.add("LD0000001").unwrap();

        device_a
            .create_donation_data(Some(FormatVariant::AllBarcodes), false)
            .await
            .unwrap();
        device_b
            .create_donation_data(Some(FormatVariant::AllBarcodes), false)
            .await
            .unwrap();

        let record_a = &device_a.stored_records()[0];
        let record_b = &device_b.stored_records()[0];
        let fields_a = split_fields(&record_a.message).unwrap();
        let fields_b = split_fields(&record_b.message).unwrap();

        // Everything but the timestamp
        assert_eq!(fields_a[3..], fields_b[3..]);
    }

    #[test]
    fn test_from_config() {
        let config = Config {
            serials: vec!["LD0000001".to_string(), "LD0000002".to_string()],
            seed: Some(1),
            ..Config::default()
        };
        let fleet = Fleet::from_config(&config).unwrap();
        assert_eq!(fleet.len(), 2);
        assert_eq!(fleet.server(), config.server);

        let config = Config {
            serials: vec!["LD0000001".to_string(), "LD0000001".to_string()],
            ..Config::default()
        };
        assert!(matches!(
            Fleet::from_config(&config),
            Err(FleetError::DuplicateSerial { .. })
        ));
    }
}
