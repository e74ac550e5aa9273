//! Device state coordinator
//!
//! Owns one device connection and drives everything that happens on it: the
//! scheduled acquisition cycle, on-demand refreshes, and control writes with
//! their forced resynchronization. All device traffic funnels through the
//! connection manager's single transport slot, so at most one request is
//! outstanding against the device at any time.
//!
//! A successful cycle publishes a fresh immutable snapshot and notifies
//! observers; a failed cycle leaves the previous snapshot authoritative and
//! relies on the fixed poll interval as the retry mechanism.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CoordinatorConfig, RegisterSpans};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{AcquisitionError, UpdateError, WriteError};
use crate::observer::{ObserverRegistry, SnapshotListener, SubscriptionHandle};
use crate::snapshot::{RegisterImage, RegisterSnapshot, RegisterSpace, SnapshotStore};
use crate::transport::RegisterTransport;

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStats {
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub skipped_ticks: u64,
    pub successful_writes: u64,
    pub failed_writes: u64,
    pub last_error: Option<String>,
    pub last_publish: Option<DateTime<Utc>>,
}

impl CoordinatorStats {
    fn record_cycle_success(&mut self, captured_at: DateTime<Utc>) {
        self.successful_cycles += 1;
        self.last_publish = Some(captured_at);
    }

    fn record_cycle_failure(&mut self, error: &UpdateError) {
        self.failed_cycles += 1;
        self.last_error = Some(error.to_string());
    }

    fn record_skipped_tick(&mut self) {
        self.skipped_ticks += 1;
    }

    fn record_write_success(&mut self, captured_at: DateTime<Utc>) {
        self.successful_writes += 1;
        self.last_publish = Some(captured_at);
    }

    fn record_write_failure(&mut self, error: &WriteError) {
        self.failed_writes += 1;
        self.last_error = Some(error.to_string());
    }
}

enum WriteRequest {
    Coil(u16, bool),
    Register(u16, u16),
}

struct PollTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Coordinates polling, writes, and snapshot publication for one device
pub struct DeviceCoordinator {
    connection: ConnectionManager,
    store: SnapshotStore,
    observers: ObserverRegistry,
    spans: RegisterSpans,
    poll_interval: Duration,
    acquisition_timeout: Duration,
    stats: Mutex<CoordinatorStats>,
    poll_task: Mutex<Option<PollTask>>,
}

impl std::fmt::Debug for DeviceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCoordinator")
            .field("connection", &self.connection)
            .field("sequence", &self.store.sequence())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl DeviceCoordinator {
    pub fn new(transport: Box<dyn RegisterTransport>, config: &CoordinatorConfig) -> Self {
        Self {
            connection: ConnectionManager::new(transport),
            store: SnapshotStore::new(),
            observers: ObserverRegistry::new(),
            spans: config.spans.clone(),
            poll_interval: config.poll_interval(),
            acquisition_timeout: config.acquisition_timeout(),
            stats: Mutex::new(CoordinatorStats::default()),
            poll_task: Mutex::new(None),
        }
    }

    // ---- snapshot access ----------------------------------------------------

    /// The currently published snapshot; `None` until the first cycle succeeds
    pub fn snapshot(&self) -> Option<Arc<RegisterSnapshot>> {
        self.store.latest()
    }

    /// Publish sequence of the current snapshot (0 before the first publish)
    pub fn sequence(&self) -> u64 {
        self.store.sequence()
    }

    pub fn subscribe<L>(&self, listener: L) -> SubscriptionHandle
    where
        L: SnapshotListener + 'static,
    {
        self.observers.subscribe(listener)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.observers.unsubscribe(handle)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_paused(&self) -> bool {
        self.connection.is_paused()
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats.lock().clone()
    }

    // ---- acquisition --------------------------------------------------------

    /// Run one full update cycle now, waiting for the transport slot
    ///
    /// Connects if necessary, reads all four register spaces, and publishes a
    /// new snapshot. On any failure the staging buffer is discarded and the
    /// previously published snapshot remains in place.
    pub async fn poll_once(&self) -> Result<Arc<RegisterSnapshot>, UpdateError> {
        let mut transport = self.connection.transport().lock().await;
        self.update_cycle(transport.as_mut()).await
    }

    /// One scheduled tick: skipped while paused or while another operation
    /// holds the transport slot (a write in flight takes priority)
    async fn scheduled_tick(&self) {
        if self.connection.is_paused() {
            debug!("Paused, skipping scheduled tick");
            return;
        }
        let mut transport = match self.connection.transport().try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Transport busy, skipping scheduled tick");
                self.stats.lock().record_skipped_tick();
                return;
            }
        };
        if let Err(e) = self.update_cycle(transport.as_mut()).await {
            warn!("Scheduled update failed: {}", e);
        }
    }

    async fn update_cycle(
        &self,
        transport: &mut dyn RegisterTransport,
    ) -> Result<Arc<RegisterSnapshot>, UpdateError> {
        let result = self.run_cycle(&mut *transport).await;
        match &result {
            Ok(snapshot) => self.stats.lock().record_cycle_success(snapshot.captured_at()),
            Err(e) => {
                self.connection.sync_state(&*transport);
                self.stats.lock().record_cycle_failure(e);
            }
        }
        result
    }

    async fn run_cycle(
        &self,
        transport: &mut dyn RegisterTransport,
    ) -> Result<Arc<RegisterSnapshot>, UpdateError> {
        self.connection.ensure_connected_on(transport).await?;
        let image = self.acquire(transport).await?;
        let snapshot = self.store.publish(image);
        debug!(
            sequence = snapshot.sequence(),
            "Published snapshot from acquisition cycle"
        );
        self.observers.notify(&snapshot);
        Ok(snapshot)
    }

    /// Read all four register spaces into a staging buffer, bounded by the
    /// acquisition timeout. Read order is fixed: coils, discrete inputs,
    /// input registers, holding registers.
    async fn acquire(
        &self,
        transport: &mut dyn RegisterTransport,
    ) -> Result<RegisterImage, AcquisitionError> {
        match timeout(self.acquisition_timeout, self.read_all(transport)).await {
            Ok(result) => result,
            Err(_) => Err(AcquisitionError::Timeout(self.acquisition_timeout)),
        }
    }

    async fn read_all(
        &self,
        transport: &mut dyn RegisterTransport,
    ) -> Result<RegisterImage, AcquisitionError> {
        let read_failed = |space: RegisterSpace| {
            move |e: crate::error::TransportError| AcquisitionError::PartialReadFailure {
                space,
                detail: e.to_string(),
            }
        };

        let mut image = RegisterImage::default();

        let span = self.spans.coils;
        let bits = transport
            .read_coils(span.start, span.count)
            .await
            .map_err(read_failed(RegisterSpace::Coils))?;
        for (i, bit) in bits.into_iter().take(span.count as usize).enumerate() {
            image.coils.insert(span.start + i as u16, bit);
        }

        let span = self.spans.discrete_inputs;
        let bits = transport
            .read_discrete_inputs(span.start, span.count)
            .await
            .map_err(read_failed(RegisterSpace::DiscreteInputs))?;
        for (i, bit) in bits.into_iter().take(span.count as usize).enumerate() {
            image.discrete_inputs.insert(span.start + i as u16, bit);
        }

        let span = self.spans.input_registers;
        let words = transport
            .read_input_registers(span.start, span.count)
            .await
            .map_err(read_failed(RegisterSpace::InputRegisters))?;
        for (i, word) in words.into_iter().take(span.count as usize).enumerate() {
            image.input_registers.insert(span.start + i as u16, word);
        }

        let span = self.spans.holding_registers;
        let words = transport
            .read_holding_registers(span.start, span.count)
            .await
            .map_err(read_failed(RegisterSpace::HoldingRegisters))?;
        for (i, word) in words.into_iter().take(span.count as usize).enumerate() {
            image.holding_registers.insert(span.start + i as u16, word);
        }

        Ok(image)
    }

    // ---- writes -------------------------------------------------------------

    /// Write a single coil, then resynchronize the snapshot
    pub async fn write_coil(
        &self,
        address: u16,
        value: bool,
    ) -> Result<Arc<RegisterSnapshot>, WriteError> {
        self.write_request(WriteRequest::Coil(address, value)).await
    }

    /// Write a single holding register, then resynchronize the snapshot
    pub async fn write_register(
        &self,
        address: u16,
        value: u16,
    ) -> Result<Arc<RegisterSnapshot>, WriteError> {
        self.write_request(WriteRequest::Register(address, value))
            .await
    }

    async fn write_request(
        &self,
        request: WriteRequest,
    ) -> Result<Arc<RegisterSnapshot>, WriteError> {
        // Writes wait for the slot rather than skipping; the scheduler defers
        // to us by skipping its tick while we hold it.
        let mut transport = self.connection.transport().lock().await;
        let result = self.run_write(transport.as_mut(), request).await;
        match &result {
            Ok(snapshot) => self.stats.lock().record_write_success(snapshot.captured_at()),
            Err(e) => {
                self.connection.sync_state(&**transport);
                tracing::error!("Write failed: {}", e);
                self.stats.lock().record_write_failure(e);
            }
        }
        result
    }

    async fn run_write(
        &self,
        transport: &mut dyn RegisterTransport,
        request: WriteRequest,
    ) -> Result<Arc<RegisterSnapshot>, WriteError> {
        self.connection.ensure_connected_on(transport).await?;

        match request {
            WriteRequest::Coil(address, value) => {
                info!("Writing coil {} = {}", address, value);
                transport.write_coil(address, value).await
            }
            WriteRequest::Register(address, value) => {
                info!("Writing holding register {} = {}", address, value);
                transport.write_register(address, value).await
            }
        }
        .map_err(|e| WriteError::TransportRejected(e.to_string()))?;

        // Forced resynchronization while still holding the transport slot:
        // the write and its follow-up read-back are atomic with respect to
        // the scheduler, and the next published snapshot reflects the write.
        let image = self
            .acquire(transport)
            .await
            .map_err(|e| WriteError::ResyncFailed(e.to_string()))?;
        let snapshot = self.store.publish(image);
        debug!(
            sequence = snapshot.sequence(),
            "Published snapshot from post-write resynchronization"
        );
        self.observers.notify(&snapshot);
        Ok(snapshot)
    }

    // ---- lifecycle ----------------------------------------------------------

    /// Spawn the background poll loop; the first cycle runs immediately
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.poll_task.lock();
        if slot.is_some() {
            warn!("Poll loop already running");
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let coordinator = Arc::clone(self);
        info!(
            "Starting poll loop with {:?} interval",
            coordinator.poll_interval
        );
        let handle = tokio::spawn(async move {
            let mut ticker = interval(coordinator.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Poll loop stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        coordinator.scheduled_tick().await;
                    }
                }
            }
        });
        *slot = Some(PollTask { handle, cancel });
    }

    /// Stop the poll loop and close the connection; idempotent
    pub async fn shutdown(&self) {
        let task = self.poll_task.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!("Poll task ended abnormally: {}", e);
            }
        }
        self.connection.close().await;
        info!("Coordinator shut down");
    }

    /// Pause polling and writes, closing the device connection
    pub async fn pause(&self) {
        self.connection.pause().await;
    }

    /// Resume after a pause: reconnect and refresh the snapshot immediately
    pub async fn resume(&self) -> Result<Arc<RegisterSnapshot>, UpdateError> {
        self.connection.resume().await?;
        self.poll_once().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceAddress;
    use crate::error::ConnectionError;
    use crate::transport::MockTransport;

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            device: DeviceAddress {
                host: "test".to_string(),
                port: 502,
                unit_id: 1,
            },
            poll_interval_secs: 15,
            acquisition_timeout_secs: 10,
            connect_timeout_secs: 5,
            spans: RegisterSpans::default(),
            logging: Default::default(),
        }
    }

    #[test]
    fn test_coordinator_is_shareable_across_tasks() {
        // Arc<DeviceCoordinator> crosses task boundaries in start(); the
        // transport behind the connection manager's mutex only needs Send.
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DeviceCoordinator>();
        assert_send_sync::<ConnectionManager>();
    }

    #[tokio::test]
    async fn test_stats_track_cycles() {
        let mock = MockTransport::new();
        let handle = mock.clone();
        let coordinator = DeviceCoordinator::new(Box::new(mock), &test_config());

        coordinator.poll_once().await.unwrap();
        let stats = coordinator.stats();
        assert_eq!(stats.successful_cycles, 1);
        assert_eq!(stats.failed_cycles, 0);
        assert!(stats.last_publish.is_some());

        handle.fail_space(Some(RegisterSpace::InputRegisters));
        coordinator.poll_once().await.unwrap_err();
        let stats = coordinator.stats();
        assert_eq!(stats.successful_cycles, 1);
        assert_eq!(stats.failed_cycles, 1);
        assert!(stats.last_error.unwrap().contains("input registers"));
    }

    #[tokio::test]
    async fn test_poll_once_while_paused_fails_fast() {
        let mock = MockTransport::new();
        let coordinator = DeviceCoordinator::new(Box::new(mock), &test_config());
        coordinator.pause().await;

        let err = coordinator.poll_once().await.unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Connection(ConnectionError::Paused)
        ));
    }
}
