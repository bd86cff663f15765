//! Device runtime.
//!
//! A [`Device`] simulates one LipoDoc analyzer. While connected it runs a
//! background status loop: every tick it reports a randomly sampled state to
//! the server and, if it has undelivered donation records, tries to send the
//! oldest one. Donations can also be created on demand; they go straight to
//! the server when possible and into the [`RecordStore`] otherwise.
//!
//! The loop is a tokio task stopped through a [`CancellationToken`]. Every
//! sleep and every iteration races the token, so `disconnect()` returns as
//! soon as the task has observed it.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DeviceTiming;
use crate::generator::DataGenerator;
use crate::protocol::{printable, DeviceStatus, FormatVariant, ProtocolError};
use crate::store::{DonationRecord, RecordStore, StoreError, StoreStats};
use crate::transport::{
    Delivery, Endpoint, ReplyMode, TcpTransport, Transport, TransportConfig, TransportError,
};

/// Largest number of records a single batch request creates.
pub const MAX_BATCH_SIZE: usize = 50;

/// Capacity of the event channel created by [`DeviceOptions::default`].
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors returned to callers of device operations.
///
/// Send failures never show up here: they are absorbed by the device.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {serial} is not connected")]
    NotConnected { serial: String },

    #[error("device {serial} cannot connect to invalid endpoint '{endpoint}'")]
    InvalidEndpoint { serial: String, endpoint: Endpoint },

    #[error("failed to encode message: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("record store error: {0}")]
    Store(#[from] StoreError),
}

/// Connection state as shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Something observable that happened on a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceEvent {
    Connected {
        serial: String,
        endpoint: Endpoint,
    },
    Disconnected {
        serial: String,
    },
    StatusSent {
        serial: String,
        status: DeviceStatus,
        pending: usize,
    },
    StatusFailed {
        serial: String,
        error: String,
    },
    RecordSent {
        serial: String,
        record_id: Uuid,
        variant: FormatVariant,
        acknowledged: bool,
    },
    RecordStored {
        serial: String,
        record_id: Uuid,
        variant: FormatVariant,
        pending: usize,
    },
    RecordFailed {
        serial: String,
        record_id: Uuid,
        error: String,
    },
    UnexpectedResponse {
        serial: String,
        reply: String,
    },
    LoopError {
        serial: String,
        error: String,
    },
}

impl DeviceEvent {
    /// Serial number of the device that emitted the event.
    pub fn serial(&self) -> &str {
        match self {
            DeviceEvent::Connected { serial, .. }
            | DeviceEvent::Disconnected { serial }
            | DeviceEvent::StatusSent { serial, .. }
            | DeviceEvent::StatusFailed { serial, .. }
            | DeviceEvent::RecordSent { serial, .. }
            | DeviceEvent::RecordStored { serial, .. }
            | DeviceEvent::RecordFailed { serial, .. }
            | DeviceEvent::UnexpectedResponse { serial, .. }
            | DeviceEvent::LoopError { serial, .. } => serial,
        }
    }
}

/// Result of creating a donation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DonationOutcome {
    /// The server took the record right away
    Delivered {
        record_id: Uuid,
        variant: FormatVariant,
        acknowledged: bool,
    },

    /// The record was queued for the status loop
    Stored {
        record_id: Uuid,
        variant: FormatVariant,
        pending: usize,
    },
}

impl DonationOutcome {
    pub fn record_id(&self) -> Uuid {
        match self {
            DonationOutcome::Delivered { record_id, .. }
            | DonationOutcome::Stored { record_id, .. } => *record_id,
        }
    }

    pub fn variant(&self) -> FormatVariant {
        match self {
            DonationOutcome::Delivered { variant, .. }
            | DonationOutcome::Stored { variant, .. } => *variant,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DonationOutcome::Delivered { .. })
    }
}

/// Point-in-time view of a device for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: ConnectionState,
    pub status: DeviceStatus,
    pub endpoint: Endpoint,
    pub last_contact: Option<DateTime<Local>>,
    pub pending: usize,
    pub stored: usize,
}

impl std::fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let last = match &self.last_contact {
            Some(time) => time.format("%H:%M:%S").to_string(),
            None => "never".to_string(),
        };
        write!(
            f,
            "SN: {} | {} | Last msg: {} | {} stored records",
            self.serial, self.state, last, self.stored
        )
    }
}

/// Collaborators injected into a [`Device`].
pub struct DeviceOptions {
    pub transport: Arc<dyn Transport>,
    pub timing: DeviceTiming,
    pub generator: DataGenerator,
    pub events: broadcast::Sender<DeviceEvent>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport: Arc::new(TcpTransport::new(TransportConfig::default())),
            timing: DeviceTiming::default(),
            generator: DataGenerator::from_entropy(),
            events,
        }
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct DeviceInner {
    serial: String,
    endpoint: RwLock<Endpoint>,
    transport: Arc<dyn Transport>,
    timing: DeviceTiming,
    generator: Mutex<DataGenerator>,
    store: Mutex<RecordStore>,
    status: AtomicU8,
    pending: AtomicUsize,
    connected: AtomicBool,
    last_contact: Mutex<Option<DateTime<Local>>>,
    /// Held for the duration of every transport call
    exchange: tokio::sync::Mutex<()>,
    worker: tokio::sync::Mutex<Option<Worker>>,
    events: broadcast::Sender<DeviceEvent>,
}

/// One simulated analyzer. Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Device {
    /// Create a disconnected device.
    pub fn new(serial: impl Into<String>, endpoint: Endpoint, options: DeviceOptions) -> Self {
        let DeviceOptions {
            transport,
            timing,
            generator,
            events,
        } = options;

        Self {
            inner: Arc::new(DeviceInner {
                serial: serial.into(),
                endpoint: RwLock::new(endpoint),
                transport,
                timing,
                generator: Mutex::new(generator),
                store: Mutex::new(RecordStore::new()),
                status: AtomicU8::new(DeviceStatus::Idle.code()),
                pending: AtomicUsize::new(0),
                connected: AtomicBool::new(false),
                last_contact: Mutex::new(None),
                exchange: tokio::sync::Mutex::new(()),
                worker: tokio::sync::Mutex::new(None),
                events,
            }),
        }
    }

    pub fn serial(&self) -> &str {
        &self.inner.serial
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint()
    }

    /// Change the server address; takes effect on the next send.
    pub fn set_endpoint(&self, endpoint: Endpoint) {
        debug!(serial = %self.inner.serial, endpoint = %endpoint, "Endpoint updated");
        *self
            .inner
            .endpoint
            .write()
            .unwrap_or_else(PoisonError::into_inner) = endpoint;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Time of the last successful exchange with the server.
    pub fn last_contact(&self) -> Option<DateTime<Local>> {
        *lock(&self.inner.last_contact)
    }

    /// Backlog size as last refreshed by the device.
    pub fn pending_available(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Current number of records in the store.
    pub fn stored_count(&self) -> usize {
        lock(&self.inner.store).len()
    }

    /// Snapshot of the stored records, oldest first.
    pub fn stored_records(&self) -> Vec<DonationRecord> {
        lock(&self.inner.store).iter().cloned().collect()
    }

    /// Status code sampled by the latest loop iteration.
    pub fn status_code(&self) -> u8 {
        self.inner.status.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_code(self.status_code()).unwrap_or(DeviceStatus::Idle)
    }

    /// Lifetime counters of the record store.
    pub fn store_stats(&self) -> StoreStats {
        lock(&self.inner.store).stats().clone()
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            serial: self.inner.serial.clone(),
            state: self.state(),
            status: self.status(),
            endpoint: self.endpoint(),
            last_contact: self.last_contact(),
            pending: self.pending_available(),
            stored: self.stored_count(),
        }
    }

    /// Receive events from this device (and any device sharing its sender).
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    /// Start the status loop. Does nothing if already connected.
    pub async fn connect(&self) -> Result<(), DeviceError> {
        let mut worker = self.inner.worker.lock().await;
        if worker.is_some() {
            debug!(serial = %self.inner.serial, "Already connected");
            return Ok(());
        }

        let endpoint = self.endpoint();
        if !endpoint.is_routable() {
            return Err(DeviceError::InvalidEndpoint {
                serial: self.inner.serial.clone(),
                endpoint,
            });
        }

        self.inner.connected.store(true, Ordering::SeqCst);
        info!(serial = %self.inner.serial, endpoint = %endpoint, "Device connected");
        self.inner.emit(DeviceEvent::Connected {
            serial: self.inner.serial.clone(),
            endpoint,
        });

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_status_loop(Arc::clone(&self.inner), cancel.clone()));
        *worker = Some(Worker { cancel, handle });
        Ok(())
    }

    /// Stop the status loop and wait for it to exit. Does nothing if
    /// already disconnected.
    pub async fn disconnect(&self) {
        let mut worker = self.inner.worker.lock().await;
        let Some(Worker { cancel, handle }) = worker.take() else {
            return;
        };

        self.inner.connected.store(false, Ordering::SeqCst);
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!(serial = %self.inner.serial, error = %e, "Status loop ended abnormally");
        }
        // Wait out an immediate send that got the exchange before the flag flipped
        drop(self.inner.exchange.lock().await);

        info!(serial = %self.inner.serial, "Device disconnected");
        self.inner.emit(DeviceEvent::Disconnected {
            serial: self.inner.serial.clone(),
        });
    }

    /// Create one donation record.
    ///
    /// With `variant` unset a layout is picked at random. When
    /// `send_immediately` is set and the device is connected the record is
    /// sent right away; if that fails, or it was not attempted, the record
    /// is stored for the status loop.
    pub async fn create_donation_data(
        &self,
        variant: Option<FormatVariant>,
        send_immediately: bool,
    ) -> Result<DonationOutcome, DeviceError> {
        let record = self.inner.build_record(variant)?;

        if send_immediately && self.is_connected() {
            if let Some(delivery) = self.inner.deliver_if_connected(&record).await {
                return Ok(DonationOutcome::Delivered {
                    record_id: record.id,
                    variant: record.variant,
                    acknowledged: delivery.is_acknowledged(),
                });
            }
        }

        Ok(self.inner.store_record(record))
    }

    /// Create a donation record and try to send it now.
    pub async fn send_donation_data(
        &self,
        variant: Option<FormatVariant>,
    ) -> Result<DonationOutcome, DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected {
                serial: self.inner.serial.clone(),
            });
        }
        self.create_donation_data(variant, true).await
    }

    /// Create `count` records (clamped to `1..=MAX_BATCH_SIZE`) with a short
    /// pause between them.
    pub async fn create_donation_batch(
        &self,
        count: usize,
        variant: Option<FormatVariant>,
        send_immediately: bool,
    ) -> Vec<Result<DonationOutcome, DeviceError>> {
        let count = count.clamp(1, MAX_BATCH_SIZE);
        let mut outcomes = Vec::with_capacity(count);

        for index in 0..count {
            if index > 0 {
                tokio::time::sleep(self.inner.timing.batch_pause).await;
            }
            outcomes.push(self.create_donation_data(variant, send_immediately).await);
        }

        info!(
            serial = %self.inner.serial,
            count,
            failed = outcomes.iter().filter(|o| o.is_err()).count(),
            "Donation batch created"
        );
        outcomes
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("serial", &self.inner.serial)
            .field("state", &self.state())
            .field("endpoint", &self.endpoint())
            .field("stored", &self.stored_count())
            .finish()
    }
}

impl DeviceInner {
    fn endpoint(&self) -> Endpoint {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: DeviceEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn touch(&self) {
        *lock(&self.last_contact) = Some(Local::now());
    }

    fn refresh_pending(&self) -> usize {
        let pending = lock(&self.store).len();
        self.pending.store(pending, Ordering::SeqCst);
        pending
    }

    fn next_tick_delay(&self) -> std::time::Duration {
        lock(&self.generator)
            .delay_between(self.timing.tick_interval_min, self.timing.tick_interval_max)
    }

    fn build_record(&self, variant: Option<FormatVariant>) -> Result<DonationRecord, DeviceError> {
        let created_at = Local::now();
        let message = {
            let mut generator = lock(&self.generator);
            let variant = variant.unwrap_or_else(|| generator.format_variant());
            generator.donation_message(&self.serial, variant, created_at.naive_local())
        };
        let payload = message.encode()?;
        Ok(DonationRecord::new(message.variant, payload, created_at))
    }

    fn store_record(&self, record: DonationRecord) -> DonationOutcome {
        let record_id = record.id;
        let variant = record.variant;
        debug!(serial = %self.serial, record = %record.printable(), "Storing donation record");

        lock(&self.store).append(record);
        let pending = self.refresh_pending();

        info!(serial = %self.serial, %record_id, %variant, pending, "Donation record stored");
        self.emit(DeviceEvent::RecordStored {
            serial: self.serial.clone(),
            record_id,
            variant,
            pending,
        });
        DonationOutcome::Stored {
            record_id,
            variant,
            pending,
        }
    }

    /// One pass of the status loop.
    async fn tick(&self, cancel: &CancellationToken) -> Result<(), DeviceError> {
        let status = lock(&self.generator).device_status();
        self.status.store(status.code(), Ordering::SeqCst);
        self.send_status(status).await?;

        if !cancel.is_cancelled() {
            let oldest = lock(&self.store).peek_oldest().cloned();
            if let Some(record) = oldest {
                if self.deliver(&record).await.is_ok() {
                    lock(&self.store).remove_oldest()?;
                    tokio::time::sleep(self.timing.send_throttle).await;
                }
            }
        }

        self.refresh_pending();
        Ok(())
    }

    async fn send_status(&self, status: DeviceStatus) -> Result<(), DeviceError> {
        let pending = lock(&self.store).len();
        let message = lock(&self.generator).status_message(
            &self.serial,
            status,
            pending,
            Local::now().naive_local(),
        );
        let payload = message.encode()?;
        let endpoint = self.endpoint();

        let result = {
            let _exchange = self.exchange.lock().await;
            self.transport
                .send(&endpoint, &payload, ReplyMode::None)
                .await
        };

        match result {
            Ok(_) => {
                self.touch();
                debug!(
                    serial = %self.serial,
                    %status,
                    pending,
                    message = %printable(&payload),
                    "Status sent"
                );
                self.emit(DeviceEvent::StatusSent {
                    serial: self.serial.clone(),
                    status,
                    pending,
                });
            }
            Err(e) => {
                warn!(serial = %self.serial, error = %e, "Failed to send status");
                self.emit(DeviceEvent::StatusFailed {
                    serial: self.serial.clone(),
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn deliver(&self, record: &DonationRecord) -> Result<Delivery, TransportError> {
        let _exchange = self.exchange.lock().await;
        self.send_record(record).await
    }

    /// Immediate send path. `None` means the record was not delivered,
    /// either because the send failed or the device disconnected while
    /// waiting for the exchange.
    async fn deliver_if_connected(&self, record: &DonationRecord) -> Option<Delivery> {
        let _exchange = self.exchange.lock().await;
        if !self.connected.load(Ordering::SeqCst) {
            debug!(
                serial = %self.serial,
                record_id = %record.id,
                "Disconnected before immediate send"
            );
            return None;
        }
        self.send_record(record).await.ok()
    }

    /// Send one record and report the outcome. Caller holds `exchange`.
    async fn send_record(&self, record: &DonationRecord) -> Result<Delivery, TransportError> {
        let endpoint = self.endpoint();
        debug!(serial = %self.serial, message = %record.printable(), "Sending donation record");
        let result = self
            .transport
            .send(&endpoint, &record.message, ReplyMode::AwaitAck)
            .await;

        match &result {
            Ok(delivery) => {
                self.touch();
                if let Delivery::Unrecognized(reply) = delivery {
                    warn!(serial = %self.serial, reply = %reply, "Unexpected server response");
                    self.emit(DeviceEvent::UnexpectedResponse {
                        serial: self.serial.clone(),
                        reply: reply.clone(),
                    });
                }
                info!(
                    serial = %self.serial,
                    record_id = %record.id,
                    variant = %record.variant,
                    "Donation record sent"
                );
                self.emit(DeviceEvent::RecordSent {
                    serial: self.serial.clone(),
                    record_id: record.id,
                    variant: record.variant,
                    acknowledged: delivery.is_acknowledged(),
                });
            }
            Err(e) => {
                warn!(
                    serial = %self.serial,
                    record_id = %record.id,
                    error = %e,
                    "Failed to send donation record"
                );
                self.emit(DeviceEvent::RecordFailed {
                    serial: self.serial.clone(),
                    record_id: record.id,
                    error: e.to_string(),
                });
            }
        }
        result
    }
}

/// Background task of a connected device. Runs until `cancel` fires.
async fn run_status_loop(inner: Arc<DeviceInner>, cancel: CancellationToken) {
    debug!(serial = %inner.serial, "Status loop started");

    loop {
        let pause = tokio::select! {
            _ = cancel.cancelled() => break,
            result = inner.tick(&cancel) => match result {
                Ok(()) => inner.next_tick_delay(),
                Err(e) => {
                    error!(serial = %inner.serial, error = %e, "Status loop iteration failed");
                    inner.emit(DeviceEvent::LoopError {
                        serial: inner.serial.clone(),
                        error: e.to_string(),
                    });
                    inner.timing.error_backoff
                }
            },
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }

    debug!(serial = %inner.serial, "Status loop stopped");
}
