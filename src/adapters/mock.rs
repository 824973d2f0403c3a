//! Mock adapter for testing without hardware
//!
//! [`MockAdapter`] is an in-memory byte stream. Tests keep the paired
//! [`MockHandle`] to inject incoming bytes, inspect what the driver wrote and
//! force failures. A responder closure can answer each write, which is how
//! [`ModbusBusSim`] emulates one or more flow controllers on a bus.
//!
//! All waiting uses `tokio::time::sleep`, so tests can run with a paused clock.

use super::Adapter;
use crate::error::{AppResult, DaqError};
use crate::protocol::modbus_rtu::{self, Request};
use crate::protocol::register_codec;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Answers a written frame with bytes to queue as incoming data
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Debug, Default)]
struct MockState {
    incoming: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    open: bool,
    open_count: usize,
    fail_open: bool,
    fail_io: bool,
    fail_close: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn broken_pipe(name: &str) -> DaqError {
    DaqError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("{name}: simulated I/O failure"),
    ))
}

// =============================================================================
// MockAdapter
// =============================================================================

/// Scripted in-memory port
pub struct MockAdapter {
    name: String,
    timeout: Duration,
    latency: Duration,
    responder: Option<Responder>,
    state: Arc<Mutex<MockState>>,
}

/// Test-side handle onto a [`MockAdapter`]
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    /// Create an adapter and its control handle. Default read timeout is 100 ms.
    pub fn new(name: impl Into<String>) -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let adapter = Self {
            name: name.into(),
            timeout: Duration::from_millis(100),
            latency: Duration::ZERO,
            responder: None,
            state: state.clone(),
        };
        (adapter, MockHandle { state })
    }

    /// Delay every write by `latency`, simulating a slow device
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Answer each write with the responder's output
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    async fn open(&mut self) -> AppResult<()> {
        let mut state = lock(&self.state);
        if state.fail_open {
            return Err(DaqError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{}: no such port", self.name),
            )));
        }
        if !state.open {
            state.open = true;
            state.open_count += 1;
        }
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        let mut state = lock(&self.state);
        state.open = false;
        if state.fail_close {
            return Err(broken_pipe(&self.name));
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        {
            let mut state = lock(&self.state);
            if !state.open {
                return Err(DaqError::SerialPortNotConnected);
            }
            if state.fail_io {
                return Err(broken_pipe(&self.name));
            }
            state.writes.push(bytes.to_vec());
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(responder) = self.responder.as_mut() {
            if let Some(reply) = responder(bytes) {
                lock(&self.state).incoming.extend(reply);
            }
        }
        Ok(())
    }

    async fn read(&mut self, buffer: &mut [u8], wait: Duration) -> AppResult<usize> {
        if lock(&self.state).incoming.is_empty() {
            tokio::time::sleep(wait).await;
        }
        let mut state = lock(&self.state);
        if !state.open {
            return Err(DaqError::SerialPortNotConnected);
        }
        if state.fail_io {
            return Err(broken_pipe(&self.name));
        }
        let n = buffer.len().min(state.incoming.len());
        for (slot, byte) in buffer.iter_mut().zip(state.incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn clear_input(&mut self) -> AppResult<()> {
        lock(&self.state).incoming.clear();
        Ok(())
    }
}

impl MockHandle {
    /// Queue bytes for the driver to read
    pub fn push_incoming(&self, bytes: &[u8]) {
        lock(&self.state).incoming.extend(bytes.iter().copied());
    }

    /// Make subsequent opens fail
    pub fn fail_open(&self, fail: bool) {
        lock(&self.state).fail_open = fail;
    }

    /// Make subsequent reads and writes fail with a broken pipe
    pub fn fail_io(&self, fail: bool) {
        lock(&self.state).fail_io = fail;
    }

    /// Make subsequent closes report an error (the port still closes)
    pub fn fail_close(&self, fail: bool) {
        lock(&self.state).fail_close = fail;
    }

    /// How many times the port went from closed to open
    pub fn open_count(&self) -> usize {
        lock(&self.state).open_count
    }

    /// Whether the port is open
    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    /// Every write so far, oldest first
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }

    /// Writes decoded as text with line terminators removed
    pub fn written_lines(&self) -> Vec<String> {
        self.writes()
            .iter()
            .map(|w| String::from_utf8_lossy(w).trim_end_matches(['\r', '\n']).to_string())
            .collect()
    }
}

/// Responder for line-oriented instruments: each CR-terminated command is passed
/// to `reply`, whose answer is queued with a CRLF terminator.
pub fn line_responder<F>(mut reply: F) -> impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static
where
    F: FnMut(&str) -> Option<String> + Send + 'static,
{
    move |bytes: &[u8]| {
        let command = String::from_utf8_lossy(bytes);
        let answer = reply(command.trim_end_matches(['\r', '\n']))?;
        Some(format!("{answer}\r\n").into_bytes())
    }
}

// =============================================================================
// ModbusBusSim - simulated flow controllers on one bus
// =============================================================================

const SIM_REGISTERS: usize = 0x20;

#[derive(Debug, Clone)]
struct SimStation {
    registers: Vec<u16>,
    reject_writes: bool,
}

/// Holding-register images for any number of stations, answering 0x03 and 0x10
/// requests. Stations that do not exist stay silent.
#[derive(Clone, Default)]
pub struct ModbusBusSim {
    stations: Arc<Mutex<HashMap<u8, SimStation>>>,
}

impl ModbusBusSim {
    /// Empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a station with all registers zeroed
    pub fn add_station(&self, station: u8) -> &Self {
        lock(&self.stations).entry(station).or_insert(SimStation {
            registers: vec![0; SIM_REGISTERS],
            reject_writes: false,
        });
        self
    }

    /// Store a float at `address` in big-endian word order
    pub fn set_float(&self, station: u8, address: u16, value: f32) -> &Self {
        self.add_station(station);
        let words = register_codec::encode_f32(value, false);
        if let Some(s) = lock(&self.stations).get_mut(&station) {
            let at = usize::from(address);
            s.registers[at..at + 2].copy_from_slice(&words);
        }
        self
    }

    /// Float stored at `address`, if the station exists
    pub fn float(&self, station: u8, address: u16) -> Option<f32> {
        let stations = lock(&self.stations);
        let s = stations.get(&station)?;
        let at = usize::from(address);
        Some(register_codec::decode_f32([s.registers[at], s.registers[at + 1]], false))
    }

    /// Answer writes to `station` with an Illegal Data Value exception
    pub fn reject_writes(&self, station: u8, reject: bool) -> &Self {
        self.add_station(station);
        if let Some(s) = lock(&self.stations).get_mut(&station) {
            s.reject_writes = reject;
        }
        self
    }

    /// Responder closure for [`MockAdapter::with_responder`]
    pub fn responder(&self) -> impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static {
        let bus = self.clone();
        move |frame: &[u8]| bus.answer(frame)
    }

    fn answer(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let request = modbus_rtu::parse_request(frame).ok()?;
        let mut stations = lock(&self.stations);
        let station = request.station();
        let sim = stations.get_mut(&station)?;
        match request {
            Request::Read { start, count, .. } => {
                let (start, end) = (usize::from(start), usize::from(start) + usize::from(count));
                if end > sim.registers.len() {
                    return Some(modbus_rtu::exception_response(
                        station,
                        modbus_rtu::READ_HOLDING_REGISTERS,
                        modbus_rtu::EXCEPTION_ILLEGAL_ADDRESS,
                    ));
                }
                Some(modbus_rtu::read_response(station, &sim.registers[start..end]))
            }
            Request::Write { start, values, .. } => {
                let from = usize::from(start);
                if sim.reject_writes || from + values.len() > sim.registers.len() {
                    return Some(modbus_rtu::exception_response(
                        station,
                        modbus_rtu::WRITE_MULTIPLE_REGISTERS,
                        modbus_rtu::EXCEPTION_ILLEGAL_VALUE,
                    ));
                }
                sim.registers[from..from + values.len()].copy_from_slice(&values);
                Some(modbus_rtu::write_response(station, start, values.len() as u16))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_read_waits_then_returns_nothing() {
        let (mut adapter, _handle) = MockAdapter::new("mock0");
        adapter.open().await.unwrap();
        let started = tokio::time::Instant::now();
        let mut buf = [0u8; 8];
        assert_eq!(adapter.read(&mut buf, Duration::from_millis(50)).await.unwrap(), 0);
        assert_eq!(started.elapsed(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_line_responder_answers_commands() {
        let (adapter, handle) = MockAdapter::new("mock0");
        let mut adapter = adapter.with_responder(line_responder(|cmd| {
            (cmd == "T").then(|| "23.5".to_string())
        }));
        adapter.open().await.unwrap();
        adapter.write(b"T\r").await.unwrap();
        let mut buf = [0u8; 16];
        let n = adapter.read(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], b"23.5\r\n");
        assert_eq!(handle.written_lines(), vec!["T".to_string()]);
    }

    #[tokio::test]
    async fn test_io_failure_is_transport_failure() {
        let (mut adapter, handle) = MockAdapter::new("mock0");
        adapter.open().await.unwrap();
        handle.fail_io(true);
        assert!(adapter.write(b"x").await.unwrap_err().is_transport_failure());
    }

    #[test]
    fn test_bus_sim_read_and_write() {
        let bus = ModbusBusSim::new();
        bus.set_float(1, 0x0000, 12.5);
        let reply = bus.answer(&modbus_rtu::read_registers_request(1, 0x0000, 2)).unwrap();
        let regs = modbus_rtu::parse_read_response(1, 2, &reply).unwrap();
        assert_eq!(register_codec::decode_f32([regs[0], regs[1]], false), 12.5);

        let words = register_codec::encode_f32(40.0, false);
        let reply = bus
            .answer(&modbus_rtu::write_registers_request(1, 0x0006, &words))
            .unwrap();
        modbus_rtu::parse_write_response(1, 0x0006, 2, &reply).unwrap();
        assert_eq!(bus.float(1, 0x0006), Some(40.0));

        // Unknown station stays silent
        assert!(bus.answer(&modbus_rtu::read_registers_request(9, 0, 2)).is_none());
    }
}
