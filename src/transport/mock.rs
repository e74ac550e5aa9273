//! Mock transport implementation for testing
//!
//! Provides a controllable transport for unit and integration tests without a
//! real device: scripted register memory, failure injection per register
//! space, an operation log, and an in-flight counter that lets tests assert
//! the single-outstanding-request discipline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::RegisterTransport;
use crate::error::TransportError;
use crate::snapshot::RegisterSpace;

/// Operations recorded by the mock, in invocation order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Connect,
    Close,
    Read(RegisterSpace),
    WriteCoil(u16, bool),
    WriteRegister(u16, u16),
}

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    connect_attempts: u32,
    fail_connect: bool,
    /// Reads of this space fail with a protocol error until cleared
    fail_space: Option<RegisterSpace>,
    /// Reads of this space drop the connection and fail with a lost-session
    /// error, like a real transport tearing down its client mid-cycle
    lose_connection_space: Option<RegisterSpace>,
    /// Reads of this space never complete (for timeout tests)
    stall_space: Option<RegisterSpace>,
    fail_writes: bool,
    /// Simulated per-operation latency
    op_delay: Duration,
    op_log: Vec<MockOp>,
    coils: HashMap<u16, bool>,
    discrete_inputs: HashMap<u16, bool>,
    input_registers: HashMap<u16, u16>,
    holding_registers: HashMap<u16, u16>,
}

/// Controllable in-memory transport
///
/// Clones share state: hand one clone to the coordinator and keep another as
/// the test-side handle for scripting and inspection.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight counter even when the operation is cancelled
/// (a timed-out read is dropped mid-await).
struct FlightGuard(Arc<AtomicUsize>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- device-side memory -------------------------------------------------

    pub fn set_coil(&self, address: u16, value: bool) {
        self.state.lock().coils.insert(address, value);
    }

    pub fn set_discrete_input(&self, address: u16, value: bool) {
        self.state.lock().discrete_inputs.insert(address, value);
    }

    pub fn set_input_register(&self, address: u16, value: u16) {
        self.state.lock().input_registers.insert(address, value);
    }

    pub fn set_holding_register(&self, address: u16, value: u16) {
        self.state.lock().holding_registers.insert(address, value);
    }

    // ---- failure injection --------------------------------------------------

    pub fn fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    pub fn fail_space(&self, space: Option<RegisterSpace>) {
        self.state.lock().fail_space = space;
    }

    pub fn stall_space(&self, space: Option<RegisterSpace>) {
        self.state.lock().stall_space = space;
    }

    pub fn lose_connection_on(&self, space: Option<RegisterSpace>) {
        self.state.lock().lose_connection_space = space;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    pub fn set_op_delay(&self, delay: Duration) {
        self.state.lock().op_delay = delay;
    }

    // ---- inspection ---------------------------------------------------------

    pub fn op_log(&self) -> Vec<MockOp> {
        self.state.lock().op_log.clone()
    }

    pub fn clear_op_log(&self) {
        self.state.lock().op_log.clear();
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    /// Highest number of transport operations ever in flight simultaneously
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn begin_op(&self) -> FlightGuard {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        FlightGuard(Arc::clone(&self.in_flight))
    }

    /// Shared preamble for read operations: record the op, then stall or wait
    /// out the configured latency without holding the state lock.
    async fn read_preamble(&self, space: RegisterSpace) -> Result<(), TransportError> {
        let (stalled, delay) = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.op_log.push(MockOp::Read(space));
            (state.stall_space == Some(space), state.op_delay)
        };

        if stalled {
            std::future::pending::<()>().await;
        }
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.lose_connection_space == Some(space) {
            state.connected = false;
            return Err(TransportError::ConnectionLost(format!(
                "Simulated connection drop during {} read",
                space
            )));
        }
        if state.fail_space == Some(space) {
            return Err(TransportError::Protocol(format!(
                "Simulated {} read failure",
                space
            )));
        }
        Ok(())
    }

    fn read_bits(&self, space: RegisterSpace, start: u16, count: u16) -> Vec<bool> {
        let state = self.state.lock();
        let memory = match space {
            RegisterSpace::Coils => &state.coils,
            _ => &state.discrete_inputs,
        };
        (0..count)
            .map(|i| memory.get(&(start + i)).copied().unwrap_or(false))
            .collect()
    }

    fn read_words(&self, space: RegisterSpace, start: u16, count: u16) -> Vec<u16> {
        let state = self.state.lock();
        let memory = match space {
            RegisterSpace::InputRegisters => &state.input_registers,
            _ => &state.holding_registers,
        };
        (0..count)
            .map(|i| memory.get(&(start + i)).copied().unwrap_or(0))
            .collect()
    }
}

#[async_trait]
impl RegisterTransport for MockTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let _flight = self.begin_op();
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        state.op_log.push(MockOp::Connect);
        if state.fail_connect {
            return Err(TransportError::ConnectionFailed(
                "Simulated connect failure".to_string(),
            ));
        }
        state.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.connected = false;
        state.op_log.push(MockOp::Close);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn read_coils(&mut self, start: u16, count: u16) -> Result<Vec<bool>, TransportError> {
        let _flight = self.begin_op();
        self.read_preamble(RegisterSpace::Coils).await?;
        Ok(self.read_bits(RegisterSpace::Coils, start, count))
    }

    async fn read_discrete_inputs(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        let _flight = self.begin_op();
        self.read_preamble(RegisterSpace::DiscreteInputs).await?;
        Ok(self.read_bits(RegisterSpace::DiscreteInputs, start, count))
    }

    async fn read_input_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let _flight = self.begin_op();
        self.read_preamble(RegisterSpace::InputRegisters).await?;
        Ok(self.read_words(RegisterSpace::InputRegisters, start, count))
    }

    async fn read_holding_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let _flight = self.begin_op();
        self.read_preamble(RegisterSpace::HoldingRegisters).await?;
        Ok(self.read_words(RegisterSpace::HoldingRegisters, start, count))
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> Result<(), TransportError> {
        let _flight = self.begin_op();
        let delay = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.op_log.push(MockOp::WriteCoil(address, value));
            state.op_delay
        };
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(TransportError::Protocol(
                "Simulated write rejection".to_string(),
            ));
        }
        state.coils.insert(address, value);
        Ok(())
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), TransportError> {
        let _flight = self.begin_op();
        let delay = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.op_log.push(MockOp::WriteRegister(address, value));
            state.op_delay
        };
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(TransportError::Protocol(
                "Simulated write rejection".to_string(),
            ));
        }
        state.holding_registers.insert(address, value);
        Ok(())
    }
}
