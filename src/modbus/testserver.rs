//! Minimal in-process Modbus TCP server for exercising the transport without
//! hardware. Supports function codes 03, 04, 06 and 16, answers exception 02
//! for addresses it does not hold, and can be told to stay silent or to slow
//! down so timeout and serialization behaviour can be observed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::models::Endpoint;

#[derive(Default)]
struct Unit {
    inputs: HashMap<u16, u16>,
    holdings: HashMap<u16, u16>,
}

#[derive(Default)]
struct ServerState {
    units: HashMap<u8, Unit>,
    silent: HashSet<u16>,
    delay: Duration,
    inflight: usize,
    max_inflight: usize,
    requests: usize,
}

pub struct TestServer {
    endpoint: Endpoint,
    state: Arc<Mutex<ServerState>>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state: Arc<Mutex<ServerState>> = Arc::new(Mutex::new(ServerState::default()));
        let connections: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_state = state.clone();
        let accept_connections = connections.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let conn_state = accept_state.clone();
                let handle = tokio::spawn(async move {
                    serve_connection(stream, conn_state).await;
                });
                accept_connections.lock().unwrap().push(handle);
            }
        });

        TestServer {
            endpoint: Endpoint { host: addr.ip().to_string(), port: addr.port() },
            state,
            connections,
            accept_task,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    pub fn set_inputs(&self, unit: u8, start: u16, values: &[u16]) {
        let mut state = self.state.lock().unwrap();
        let unit = state.units.entry(unit).or_default();
        for (i, value) in values.iter().enumerate() {
            unit.inputs.insert(start + i as u16, *value);
        }
    }

    pub fn set_holdings(&self, unit: u8, start: u16, values: &[u16]) {
        let mut state = self.state.lock().unwrap();
        let unit = state.units.entry(unit).or_default();
        for (i, value) in values.iter().enumerate() {
            unit.holdings.insert(start + i as u16, *value);
        }
    }

    pub fn holding(&self, unit: u8, address: u16) -> Option<u16> {
        let state = self.state.lock().unwrap();
        state.units.get(&unit).and_then(|u| u.holdings.get(&address).copied())
    }

    /// Requests touching this address receive no response at all.
    pub fn silence(&self, address: u16) {
        self.state.lock().unwrap().silent.insert(address);
    }

    /// Hold every request for this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    /// Highest number of requests that were ever being processed at once.
    pub fn max_inflight(&self) -> usize {
        self.state.lock().unwrap().max_inflight
    }

    /// Count of requests seen so far.
    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().requests
    }

    /// Kill all open connections so clients observe a reset.
    pub fn drop_connections(&self) {
        let mut connections = self.connections.lock().unwrap();
        for handle in connections.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

async fn serve_connection(mut stream: TcpStream, state: Arc<Mutex<ServerState>>) {
    loop {
        let mut header = [0u8; 6];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let len = u16::from_be_bytes([header[4], header[5]]) as usize;
        if len == 0 {
            return;
        }
        let mut body = vec![0u8; len];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }

        let delay = {
            let mut s = state.lock().unwrap();
            s.inflight += 1;
            s.requests += 1;
            s.max_inflight = s.max_inflight.max(s.inflight);
            s.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let pdu = {
            let mut s = state.lock().unwrap();
            s.inflight -= 1;
            handle_request(&mut s, &body)
        };

        let Some(pdu) = pdu else { continue };

        let mut frame = Vec::with_capacity(7 + pdu.len());
        frame.extend_from_slice(&header[0..2]); /* transaction id */
        frame.extend_from_slice(&[0, 0]); /* protocol id */
        frame.extend_from_slice(&((pdu.len() as u16 + 1).to_be_bytes()));
        frame.push(body[0]); /* unit */
        frame.extend_from_slice(&pdu);
        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

fn exception(fc: u8, code: u8) -> Option<Vec<u8>> {
    Some(vec![fc | 0x80, code])
}

/// Build the response PDU, or None when the request must go unanswered.
fn handle_request(state: &mut ServerState, body: &[u8]) -> Option<Vec<u8>> {
    let unit_id = body[0];
    let fc = body[1];
    let address = u16::from_be_bytes([body[2], body[3]]);

    let touches_silent = |start: u16, count: u16| {
        (start..start.saturating_add(count)).any(|a| state.silent.contains(&a))
    };

    if !state.units.contains_key(&unit_id) {
        return exception(fc, 0x04);
    }

    match fc {
        0x03 | 0x04 => {
            let count = u16::from_be_bytes([body[4], body[5]]);
            if touches_silent(address, count) {
                return None;
            }
            let unit = &state.units[&unit_id];
            let table = if fc == 0x03 { &unit.holdings } else { &unit.inputs };
            let mut words = Vec::with_capacity(count as usize);
            for a in address..address + count {
                match table.get(&a) {
                    Some(w) => words.push(*w),
                    None => return exception(fc, 0x02),
                }
            }
            let mut pdu = vec![fc, (words.len() * 2) as u8];
            for w in words {
                pdu.extend_from_slice(&w.to_be_bytes());
            }
            Some(pdu)
        }
        0x06 => {
            if touches_silent(address, 1) {
                return None;
            }
            let unit = state.units.get_mut(&unit_id).unwrap();
            if !unit.holdings.contains_key(&address) {
                return exception(fc, 0x02);
            }
            let value = u16::from_be_bytes([body[4], body[5]]);
            unit.holdings.insert(address, value);
            Some(body[1..6].to_vec())
        }
        0x10 => {
            let count = u16::from_be_bytes([body[4], body[5]]);
            if touches_silent(address, count) {
                return None;
            }
            let unit = state.units.get_mut(&unit_id).unwrap();
            for a in address..address + count {
                if !unit.holdings.contains_key(&a) {
                    return exception(fc, 0x02);
                }
            }
            for i in 0..count {
                let at = 7 + i as usize * 2;
                let value = u16::from_be_bytes([body[at], body[at + 1]]);
                unit.holdings.insert(address + i, value);
            }
            let mut pdu = vec![fc];
            pdu.extend_from_slice(&address.to_be_bytes());
            pdu.extend_from_slice(&count.to_be_bytes());
            Some(pdu)
        }
        _ => exception(fc, 0x01),
    }
}
