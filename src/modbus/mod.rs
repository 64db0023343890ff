//! Modbus TCP transport: pooled connections, request framing and the batch
//! and codec helpers built on top of them.
//!
//! One TCP connection is kept per endpoint and every request on it is
//! serialized through an async mutex. Several devices commonly share one
//! endpoint behind a gateway that cannot handle interleaved transactions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, warn};
use rmodbus::{client::ModbusRequest, guess_response_frame_len, ErrorKind, ModbusProto};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::ModbusTuning;
use crate::error::{Error, Result};
use crate::models::Endpoint;
use crate::registers::RegisterCategory;

pub mod batch;
pub mod codec;
#[cfg(test)]
pub(crate) mod testserver;

struct EndpointState {
    stream: Option<TcpStream>,
    consecutive_failures: u32,
    /* cycle number in which this endpoint was written off, see begin_cycle */
    failed_cycle: Option<u64>,
}

/// Held across a transaction. If the caller is cancelled mid exchange the
/// response is still buffered on the stream, and the next request would parse
/// it as its own; dropping the connection instead forces a clean reconnect.
struct InFlight<'a> {
    state: tokio::sync::MutexGuard<'a, EndpointState>,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.stream = None;
        }
    }
}

/// Connection pool over all configured endpoints.
///
/// Connections are opened lazily on first use and dropped on any transport
/// error; the next request reconnects. Once an endpoint has failed
/// `connect_attempts` times in a row, further requests to it fail immediately
/// until the next poll cycle to keep one dead gateway from stalling the tick.
pub struct ConnectionManager {
    tuning: ModbusTuning,
    cycle: AtomicU64,
    pool: StdMutex<HashMap<Endpoint, Arc<Mutex<EndpointState>>>>,
}

impl ConnectionManager {
    pub fn new(tuning: ModbusTuning) -> Self {
        return ConnectionManager {
            tuning,
            cycle: AtomicU64::new(0),
            pool: StdMutex::new(HashMap::new()),
        };
    }

    /// Start a new poll cycle, lifting the fail-fast marker from endpoints
    /// that were written off during the previous one.
    pub fn begin_cycle(&self) {
        self.cycle.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop all pooled connections. They are re-established on next use.
    pub fn close_all(&self) {
        self.pool.lock().unwrap().clear();
    }

    /// Read `count` words starting at `start` from one register table.
    pub async fn read_registers(
        &self,
        endpoint: &Endpoint,
        slave_id: u8,
        category: RegisterCategory,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let mut mreq = ModbusRequest::new(slave_id, ModbusProto::TcpUdp);
        let mut request = Vec::with_capacity(12);
        let generated = match category {
            RegisterCategory::Input => mreq.generate_get_inputs(start, count, &mut request),
            RegisterCategory::Holding => mreq.generate_get_holdings(start, count, &mut request),
        };
        generated.map_err(|e| Error::Protocol(format!("invalid read request: {:?}", e)))?;

        let response = self.exchange(endpoint, &request).await?;

        let mut words = Vec::with_capacity(count as usize);
        mreq.parse_u16(&response, &mut words)
            .map_err(|e| classify(e, endpoint, slave_id))?;
        if words.len() < count as usize {
            return Err(Error::Protocol(format!(
                "short response from {} unit {}: {} of {} words",
                endpoint, slave_id, words.len(), count
            )));
        }
        words.truncate(count as usize);
        return Ok(words);
    }

    /// Write a single holding register (function code 06).
    pub async fn write_register(
        &self,
        endpoint: &Endpoint,
        slave_id: u8,
        address: u16,
        value: u16,
    ) -> Result<()> {
        let mut mreq = ModbusRequest::new(slave_id, ModbusProto::TcpUdp);
        let mut request = Vec::with_capacity(12);
        mreq.generate_set_holding(address, value, &mut request)
            .map_err(|e| Error::Protocol(format!("invalid write request: {:?}", e)))?;

        let response = self.exchange(endpoint, &request).await?;
        mreq.parse_ok(&response)
            .map_err(|e| classify(e, endpoint, slave_id))?;
        return Ok(());
    }

    /// Write a span of holding registers (function code 16).
    pub async fn write_registers(
        &self,
        endpoint: &Endpoint,
        slave_id: u8,
        address: u16,
        values: &[u16],
    ) -> Result<()> {
        let mut mreq = ModbusRequest::new(slave_id, ModbusProto::TcpUdp);
        let mut request = Vec::with_capacity(12 + values.len() * 2);
        mreq.generate_set_holdings_bulk(address, values, &mut request)
            .map_err(|e| Error::Protocol(format!("invalid write request: {:?}", e)))?;

        let response = self.exchange(endpoint, &request).await?;
        mreq.parse_ok(&response)
            .map_err(|e| classify(e, endpoint, slave_id))?;
        return Ok(());
    }

    fn endpoint_state(&self, endpoint: &Endpoint) -> Arc<Mutex<EndpointState>> {
        let mut pool = self.pool.lock().unwrap();
        return pool
            .entry(endpoint.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(EndpointState {
                    stream: None,
                    consecutive_failures: 0,
                    failed_cycle: None,
                }))
            })
            .clone();
    }

    /// One request/response transaction, serialized per endpoint.
    async fn exchange(&self, endpoint: &Endpoint, request: &[u8]) -> Result<Vec<u8>> {
        let state = self.endpoint_state(endpoint);
        let guard = state.lock().await;

        let cycle = self.cycle.load(Ordering::SeqCst);
        if guard.failed_cycle == Some(cycle) {
            return Err(Error::Connection(format!(
                "endpoint {} skipped after {} consecutive failures",
                endpoint, guard.consecutive_failures
            )));
        }

        let timeout = Duration::from_secs(self.tuning.timeout_secs);
        let mut inflight = InFlight { state: guard, armed: true };
        let result =
            tokio::time::timeout(timeout, transact(&mut inflight.state, endpoint, request)).await;
        inflight.armed = false;
        let state = &mut *inflight.state;

        match result {
            Ok(Ok(response)) => {
                state.consecutive_failures = 0;
                return Ok(response);
            }
            Ok(Err(e)) => {
                /* transport is in an unknown state, reconnect next time */
                state.stream = None;
                self.record_failure(state, endpoint, cycle);
                return Err(e);
            }
            Err(_) => {
                state.stream = None;
                self.record_failure(state, endpoint, cycle);
                return Err(Error::Timeout(format!(
                    "no response from {} within {:?}", endpoint, timeout
                )));
            }
        }
    }

    fn record_failure(&self, state: &mut EndpointState, endpoint: &Endpoint, cycle: u64) {
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.tuning.connect_attempts {
            warn!(
                "Endpoint {} failed {} times in a row, skipping it for the rest of the cycle",
                endpoint, state.consecutive_failures
            );
            state.failed_cycle = Some(cycle);
        }
    }
}

async fn transact(
    state: &mut EndpointState,
    endpoint: &Endpoint,
    request: &[u8],
) -> Result<Vec<u8>> {
    if state.stream.is_none() {
        debug!("Connecting to {}", endpoint);
        let stream = TcpStream::connect(endpoint.to_string())
            .await
            .map_err(|e| Error::Connection(format!("failed to connect to {}: {}", endpoint, e)))?;
        let _ = stream.set_nodelay(true);
        state.stream = Some(stream);
    }
    let Some(stream) = state.stream.as_mut() else {
        return Err(Error::Connection(format!("no connection to {}", endpoint)));
    };

    stream
        .write_all(request)
        .await
        .map_err(|e| Error::Connection(format!("failed to write to {}: {}", endpoint, e)))?;

    let mut header = [0u8; 6];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| Error::Connection(format!("failed to read header from {}: {}", endpoint, e)))?;

    let len = guess_response_frame_len(&header, ModbusProto::TcpUdp)
        .map_err(|e| Error::Connection(format!("bad frame from {}: {:?}", endpoint, e)))?;

    let mut response = Vec::with_capacity(len as usize);
    response.extend_from_slice(&header);
    if len as usize > header.len() {
        let mut rest = vec![0u8; len as usize - header.len()];
        stream
            .read_exact(&mut rest)
            .await
            .map_err(|e| Error::Connection(format!("failed to read body from {}: {}", endpoint, e)))?;
        response.extend_from_slice(&rest);
    }
    return Ok(response);
}

/// Map a modbus parse error onto the crate taxonomy. Exception responses from
/// the device are protocol errors, everything else means the byte stream
/// itself is suspect.
fn classify(kind: ErrorKind, endpoint: &Endpoint, slave_id: u8) -> Error {
    let describe = format!("{} unit {}: {:?}", endpoint, slave_id, kind);
    return match kind {
        ErrorKind::IllegalFunction
        | ErrorKind::IllegalDataAddress
        | ErrorKind::IllegalDataValue
        | ErrorKind::SlaveDeviceFailure
        | ErrorKind::Acknowledge
        | ErrorKind::SlaveDeviceBusy
        | ErrorKind::NegativeAcknowledge
        | ErrorKind::MemoryParityError
        | ErrorKind::GatewayPathUnavailable
        | ErrorKind::GatewayTargetFailed => Error::Protocol(describe),
        _ => Error::Connection(describe),
    };
}
