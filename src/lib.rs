//! regpoll: device state coordinator for register-oriented field devices
//!
//! Polls a Modbus TCP device on a fixed interval over one persistent
//! connection, maintains an immutable snapshot of its four register spaces,
//! and serializes control writes against the same connection with a forced
//! resynchronization after each write.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use regpoll::{CoordinatorConfig, DeviceCoordinator, ModbusTcpTransport};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CoordinatorConfig::from_file("regpoll.yaml")?;
//! let transport = ModbusTcpTransport::new(config.device.clone(), config.connect_timeout());
//! let coordinator = Arc::new(DeviceCoordinator::new(Box::new(transport), &config));
//!
//! coordinator.subscribe(|snapshot: &Arc<regpoll::RegisterSnapshot>| {
//!     println!("snapshot #{}", snapshot.sequence());
//! });
//! coordinator.start();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod observer;
pub mod snapshot;
pub mod transport;

pub use config::{CoordinatorConfig, DeviceAddress, LoggingSection, RegisterSpans, SpanRange};
pub use connection::{ConnectionManager, ConnectionState};
pub use coordinator::{CoordinatorStats, DeviceCoordinator};
pub use error::{
    AcquisitionError, ConfigError, ConnectionError, TransportError, UpdateError, WriteError,
};
pub use observer::{ObserverRegistry, SnapshotListener, SubscriptionHandle};
pub use snapshot::{RegisterImage, RegisterSnapshot, RegisterSpace, SnapshotStore};
pub use transport::{MockTransport, ModbusTcpTransport, RegisterTransport};
