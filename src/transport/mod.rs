//! Transport layer
//!
//! Defines the contract the coordinator consumes from the protocol client:
//! one persistent connection plus raw read/write primitives for the four
//! register spaces. [`ModbusTcpTransport`] is the production implementation;
//! [`MockTransport`] is a controllable stand-in for tests.

use std::fmt;

use async_trait::async_trait;

use crate::error::TransportError;

pub mod mock;
pub mod modbus;

pub use mock::MockTransport;
pub use modbus::ModbusTcpTransport;

/// Raw register access over one persistent device connection
///
/// Implementations own the connection exclusively; the coordinator guarantees
/// at most one outstanding call at a time, so `&mut self` round-trips never
/// interleave on the wire. Only `Send` is required: the transport lives
/// behind the connection manager's async mutex and is never aliased across
/// threads, which keeps protocol clients with non-`Sync` internals usable.
#[async_trait]
pub trait RegisterTransport: Send + fmt::Debug {
    /// Open the connection to the device
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the connection; must be a no-op when already closed
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Whether the connection is currently open
    fn is_connected(&self) -> bool;

    /// Read `count` coil bits starting at `start`
    async fn read_coils(&mut self, start: u16, count: u16) -> Result<Vec<bool>, TransportError>;

    /// Read `count` discrete input bits starting at `start`
    async fn read_discrete_inputs(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError>;

    /// Read `count` input registers starting at `start`
    async fn read_input_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Read `count` holding registers starting at `start`
    async fn read_holding_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Write a single coil
    async fn write_coil(&mut self, address: u16, value: bool) -> Result<(), TransportError>;

    /// Write a single holding register
    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), TransportError>;
}
