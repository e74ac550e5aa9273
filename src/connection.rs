//! Connection lifecycle management
//!
//! [`ConnectionManager`] exclusively owns the transport and its connection.
//! The transport sits behind a single async mutex; that lock is the
//! single-slot discipline serializing every round-trip against the device,
//! shared by the poll scheduler and the write path.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ConnectionError;
use crate::transport::RegisterTransport;

/// Coordinator-wide connectivity state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No open connection
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Connection open and usable
    Connected,
    /// Paused by operator request; no connection attempts are made
    Paused,
}

/// Owns the transport and drives its connect/close lifecycle
pub struct ConnectionManager {
    transport: Mutex<Box<dyn RegisterTransport>>,
    state: RwLock<ConnectionState>,
    paused: AtomicBool,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(transport: Box<dyn RegisterTransport>) -> Self {
        Self {
            transport: Mutex::new(transport),
            state: RwLock::new(ConnectionState::Disconnected),
            paused: AtomicBool::new(false),
        }
    }

    /// Current connectivity state
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// The transport slot. Holding the guard is what makes a sequence of
    /// round-trips (an acquisition cycle, a write plus its resync) atomic
    /// with respect to other callers.
    pub(crate) fn transport(&self) -> &Mutex<Box<dyn RegisterTransport>> {
        &self.transport
    }

    /// Make sure the connection is open, connecting if necessary
    ///
    /// Fails immediately with [`ConnectionError::Paused`] while paused. No
    /// retries are attempted here; retry policy belongs to the scheduler's
    /// next tick or to the write caller.
    pub async fn ensure_connected(&self) -> Result<(), ConnectionError> {
        let mut transport = self.transport.lock().await;
        self.ensure_connected_on(transport.as_mut()).await
    }

    /// Same contract as [`ensure_connected`](Self::ensure_connected) for
    /// callers that already hold the transport slot.
    pub(crate) async fn ensure_connected_on(
        &self,
        transport: &mut dyn RegisterTransport,
    ) -> Result<(), ConnectionError> {
        if self.is_paused() {
            return Err(ConnectionError::Paused);
        }
        if transport.is_connected() {
            return Ok(());
        }

        *self.state.write() = ConnectionState::Connecting;
        match transport.connect().await {
            Ok(()) => {
                *self.state.write() = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                *self.state.write() = ConnectionState::Disconnected;
                warn!("Connection attempt failed: {}", e);
                Err(ConnectionError::Unreachable(e.to_string()))
            }
        }
    }

    /// Reconcile the tracked state with the transport after a failed
    /// operation: a transport that tore down its session mid-operation
    /// reports disconnected, and the next cycle reconnects from scratch.
    pub(crate) fn sync_state(&self, transport: &dyn RegisterTransport) {
        if !transport.is_connected() && self.state() == ConnectionState::Connected {
            warn!("Connection to device lost");
            *self.state.write() = ConnectionState::Disconnected;
        }
    }

    /// Pause: stop admitting new operations and close any open connection
    ///
    /// An in-flight operation is not cancelled; pause waits for the transport
    /// slot before closing.
    pub async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        let mut transport = self.transport.lock().await;
        if transport.is_connected() {
            if let Err(e) = transport.close().await {
                warn!("Close during pause failed: {}", e);
            }
        }
        *self.state.write() = ConnectionState::Paused;
        info!("Device communication paused");
    }

    /// Clear the paused state and immediately attempt to reconnect
    pub async fn resume(&self) -> Result<(), ConnectionError> {
        self.paused.store(false, Ordering::SeqCst);
        *self.state.write() = ConnectionState::Disconnected;
        info!("Device communication resuming");
        self.ensure_connected().await
    }

    /// Unconditionally close the connection; idempotent
    pub async fn close(&self) {
        let mut transport = self.transport.lock().await;
        if transport.is_connected() {
            if let Err(e) = transport.close().await {
                warn!("Close failed: {}", e);
            }
        }
        self.paused.store(false, Ordering::SeqCst);
        *self.state.write() = ConnectionState::Disconnected;
    }
}
