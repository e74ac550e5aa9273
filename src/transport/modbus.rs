//! Modbus TCP transport
//!
//! Production [`RegisterTransport`] implementation over the `tokio-modbus`
//! client. The unit identifier is bound at connect time, matching the
//! immutable [`DeviceAddress`] the coordinator is constructed with.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Context, Reader, Writer};
use tokio_modbus::Slave;
use tracing::{debug, info, warn};

use super::RegisterTransport;
use crate::config::DeviceAddress;
use crate::error::TransportError;

/// Modbus TCP client transport for one device
pub struct ModbusTcpTransport {
    address: DeviceAddress,
    connect_timeout: Duration,
    ctx: Option<Context>,
}

impl std::fmt::Debug for ModbusTcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusTcpTransport")
            .field("address", &self.address)
            .field("connect_timeout", &self.connect_timeout)
            .field("connected", &self.ctx.is_some())
            .finish()
    }
}

impl ModbusTcpTransport {
    /// Create a new transport for the given device; does not connect yet
    pub fn new(address: DeviceAddress, connect_timeout: Duration) -> Self {
        Self {
            address,
            connect_timeout,
            ctx: None,
        }
    }

    // Takes the endpoint by value so the lookup future does not capture
    // `self`, which is not `Sync` (the Modbus context holds a `!Sync` client).
    async fn resolve(endpoint: String) -> Result<SocketAddr, TransportError> {
        let mut addrs = lookup_host(&endpoint).await.map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to resolve {}: {}", endpoint, e))
        })?;
        addrs.next().ok_or_else(|| {
            TransportError::ConnectionFailed(format!("No address found for {}", endpoint))
        })
    }

    /// Treat an outer client error as a broken session: the connection is
    /// dropped so the next cycle reconnects from scratch.
    fn session_lost(&mut self, context: &str, err: impl std::fmt::Display) -> TransportError {
        warn!("{} failed, dropping connection: {}", context, err);
        self.ctx = None;
        TransportError::ConnectionLost(format!("{}: {}", context, err))
    }
}

#[async_trait]
impl RegisterTransport for ModbusTcpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let endpoint = format!("{}:{}", self.address.host, self.address.port);
        let socket_addr = Self::resolve(endpoint).await?;
        let slave = Slave(self.address.unit_id);
        info!(
            "Connecting to Modbus TCP endpoint {} (unit {})",
            socket_addr, self.address.unit_id
        );

        match timeout(self.connect_timeout, tcp::connect_slave(socket_addr, slave)).await {
            Ok(Ok(ctx)) => {
                info!("Connected to {}", socket_addr);
                self.ctx = Some(ctx);
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::ConnectionFailed(format!(
                "Failed to connect to {}: {}",
                socket_addr, e
            ))),
            Err(_) => Err(TransportError::Timeout(format!(
                "Connection to {} timed out after {:?}",
                socket_addr, self.connect_timeout
            ))),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut ctx) = self.ctx.take() {
            if let Err(e) = ctx.disconnect().await {
                // Connection is gone either way; report for diagnostics only.
                debug!("Disconnect returned error: {}", e);
            }
            info!("Closed Modbus TCP connection to {}", self.address.host);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    async fn read_coils(&mut self, start: u16, count: u16) -> Result<Vec<bool>, TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        match ctx.read_coils(start, count).await {
            Ok(Ok(bits)) => Ok(bits),
            Ok(Err(exception)) => Err(TransportError::Protocol(format!(
                "Coil read rejected: {}",
                exception
            ))),
            Err(e) => Err(self.session_lost("Coil read", e)),
        }
    }

    async fn read_discrete_inputs(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        match ctx.read_discrete_inputs(start, count).await {
            Ok(Ok(bits)) => Ok(bits),
            Ok(Err(exception)) => Err(TransportError::Protocol(format!(
                "Discrete input read rejected: {}",
                exception
            ))),
            Err(e) => Err(self.session_lost("Discrete input read", e)),
        }
    }

    async fn read_input_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        match ctx.read_input_registers(start, count).await {
            Ok(Ok(words)) => Ok(words),
            Ok(Err(exception)) => Err(TransportError::Protocol(format!(
                "Input register read rejected: {}",
                exception
            ))),
            Err(e) => Err(self.session_lost("Input register read", e)),
        }
    }

    async fn read_holding_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        match ctx.read_holding_registers(start, count).await {
            Ok(Ok(words)) => Ok(words),
            Ok(Err(exception)) => Err(TransportError::Protocol(format!(
                "Holding register read rejected: {}",
                exception
            ))),
            Err(e) => Err(self.session_lost("Holding register read", e)),
        }
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> Result<(), TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        debug!("Writing coil {} = {}", address, value);
        match ctx.write_single_coil(address, value).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(exception)) => Err(TransportError::Protocol(format!(
                "Coil write rejected: {}",
                exception
            ))),
            Err(e) => Err(self.session_lost("Coil write", e)),
        }
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        debug!("Writing holding register {} = {}", address, value);
        match ctx.write_single_register(address, value).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(exception)) => Err(TransportError::Protocol(format!(
                "Register write rejected: {}",
                exception
            ))),
            Err(e) => Err(self.session_lost("Register write", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_without_connection_fails() {
        let address = DeviceAddress {
            host: "192.0.2.1".to_string(),
            port: 502,
            unit_id: 1,
        };
        let mut transport = ModbusTcpTransport::new(address, Duration::from_millis(100));
        assert!(!transport.is_connected());

        let err = transport.read_coils(0, 7).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[test]
    fn test_transport_future_stays_send() {
        // The trait's boxed futures are `+ Send`; the transport itself only
        // needs `Send`, exclusive access comes from the connection manager.
        fn assert_send<T: Send>() {}
        assert_send::<ModbusTcpTransport>();

        fn assert_boxable(t: ModbusTcpTransport) -> Box<dyn crate::transport::RegisterTransport> {
            Box::new(t)
        }
        let address = DeviceAddress {
            host: "192.0.2.1".to_string(),
            port: 502,
            unit_id: 1,
        };
        let transport = assert_boxable(ModbusTcpTransport::new(address, Duration::from_millis(100)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_when_never_connected() {
        let address = DeviceAddress {
            host: "192.0.2.1".to_string(),
            port: 502,
            unit_id: 1,
        };
        let mut transport = ModbusTcpTransport::new(address, Duration::from_millis(100));
        assert!(transport.close().await.is_ok());
        assert!(transport.close().await.is_ok());
    }
}
