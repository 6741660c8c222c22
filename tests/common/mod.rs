//! Shared test fixtures: an in-process Modbus/TCP device.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};
use tokio_modbus::ExceptionCode;

/// A scriptable Modbus/TCP device: serves a register bank, records every
/// write in arrival order, and can delay reads to simulate a slow device.
#[derive(Clone, Default)]
pub struct FakeDevice {
    registers: Arc<Mutex<HashMap<u16, u16>>>,
    writes: Arc<Mutex<Vec<(u16, u16)>>>,
    reads: Arc<Mutex<u64>>,
    read_delay: Option<Duration>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_delay(delay: Duration) -> Self {
        Self {
            read_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.registers.lock().unwrap().insert(address, value);
    }

    /// Writes received so far, in order of arrival.
    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.writes.lock().unwrap().clone()
    }

    /// Number of read requests served so far.
    pub fn read_count(&self) -> u64 {
        *self.reads.lock().unwrap()
    }
}

impl tokio_modbus::server::Service for FakeDevice {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = Pin<Box<dyn Future<Output = Result<Response, ExceptionCode>> + Send>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let registers = Arc::clone(&self.registers);
        let writes = Arc::clone(&self.writes);
        let reads = Arc::clone(&self.reads);
        let read_delay = self.read_delay;

        Box::pin(async move {
            match req {
                Request::ReadHoldingRegisters(addr, cnt) => {
                    // Count on arrival so slow reads are visible immediately.
                    *reads.lock().unwrap() += 1;
                    if let Some(delay) = read_delay {
                        tokio::time::sleep(delay).await;
                    }
                    let bank = registers.lock().unwrap();
                    let words = (0..cnt)
                        .map(|i| bank.get(&(addr + i)).copied().unwrap_or(0))
                        .collect();
                    Ok(Response::ReadHoldingRegisters(words))
                }
                Request::ReadInputRegisters(addr, cnt) => {
                    *reads.lock().unwrap() += 1;
                    if let Some(delay) = read_delay {
                        tokio::time::sleep(delay).await;
                    }
                    let bank = registers.lock().unwrap();
                    let words = (0..cnt)
                        .map(|i| bank.get(&(addr + i)).copied().unwrap_or(0))
                        .collect();
                    Ok(Response::ReadInputRegisters(words))
                }
                Request::WriteSingleRegister(addr, value) => {
                    writes.lock().unwrap().push((addr, value));
                    registers.lock().unwrap().insert(addr, value);
                    Ok(Response::WriteSingleRegister(addr, value))
                }
                _ => Err(ExceptionCode::IllegalFunction),
            }
        })
    }
}

/// Serves a [`FakeDevice`] on an ephemeral local port.
pub async fn spawn_device(device: FakeDevice) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(listener);

    tokio::spawn(async move {
        let on_connected = |stream, socket_addr| {
            let device = device.clone();
            async move {
                accept_tcp_connection(stream, socket_addr, move |_addr| Ok(Some(device.clone())))
            }
        };
        let _ = server.serve(&on_connected, |_err| ()).await;
    });

    addr
}
