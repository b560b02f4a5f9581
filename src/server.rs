//! Modbus-TCP front end for the register table.
//!
//! Clients use zero-based wire addresses, so a read at address 40000 returns
//! register 40001 (the "SunS" marker). Only function code 3 is served; the
//! register image is never written by clients.

use std::{future, io, net::SocketAddr, sync::Arc};

use tokio::net::{TcpListener, TcpStream};
use tokio_modbus::{
    prelude::*,
    server::tcp::{Server, accept_tcp_connection},
};
use tracing::{debug, error, warn};

use crate::registers::RegisterTable;

/// Upper bound of a function code 3 request.
pub const MAX_READ_COUNT: u16 = 125;

pub struct SmartMeterService {
    table: Arc<RegisterTable>,
}

impl SmartMeterService {
    pub fn new(table: Arc<RegisterTable>) -> Self {
        Self { table }
    }

    fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, ExceptionCode> {
        if count == 0 || count > MAX_READ_COUNT {
            warn!("Rejecting read of {} registers at {}", count, address);
            return Err(ExceptionCode::IllegalDataValue);
        }

        let register = address
            .checked_add(1)
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        self.table.read(register, count).map_err(|err| {
            warn!("Exception::IllegalDataAddress - {}", err);
            ExceptionCode::IllegalDataAddress
        })
    }
}

impl tokio_modbus::server::Service for SmartMeterService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        debug!("Received Modbus request: {:?}", req);

        let res = match req {
            Request::ReadHoldingRegisters(address, count) => self
                .read_holding_registers(address, count)
                .map(Response::ReadHoldingRegisters),
            _ => {
                warn!("Exception::IllegalFunction - unsupported request: {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

/// Serve the register table on `listener` until the task is dropped.
pub async fn serve(listener: TcpListener, table: Arc<RegisterTable>) -> anyhow::Result<()> {
    let server = Server::new(listener);

    let on_connected = move |stream: TcpStream, socket_addr: SocketAddr| {
        let table = Arc::clone(&table);
        async move {
            debug!("Modbus client connected from {}", socket_addr);
            accept_tcp_connection(stream, socket_addr, move |_socket_addr| {
                Ok(Some(SmartMeterService::new(Arc::clone(&table))))
            })
        }
    };
    let on_process_error = |err: io::Error| {
        error!("Modbus connection error: {}", err);
    };

    server.serve(&on_connected, on_process_error).await?;
    Ok(())
}
