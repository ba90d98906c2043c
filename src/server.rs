//! Modbus TCP serving surface.
//!
//! Serves function code 3 (Read Holding Registers) from the published
//! register bank. Every connection is an independent tokio task; a
//! malformed frame closes only its own session. The server never writes
//! simulation state.
//!
//! Frame layout (MBAP + PDU):
//!
//! ```text
//! [transaction id 2B] [protocol id 2B = 0x0000] [length 2B]
//! [unit id 1B] [function code 1B] [data NB]
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::registers::{RegisterBank, TOTAL_REGISTERS};

/// Unprivileged fallback when the standard port needs root.
pub const FALLBACK_PORT: u16 = 5020;

const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;
const MAX_READ_QUANTITY: u16 = 125;
/// Unit id + PDU of a max-size read request.
const MAX_MBAP_LENGTH: u16 = 254;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind Modbus port {port} (and fallback {fallback}): {source}")]
    Bind { port: u16, fallback: u16, source: std::io::Error },
}

/// Bind the configured port, falling back to [`FALLBACK_PORT`] when the
/// privileged port is unavailable. Returns the listener and the bound port.
pub async fn bind(host: &str, port: u16) -> Result<(TcpListener, u16), ServerError> {
    match TcpListener::bind((host, port)).await {
        Ok(listener) => Ok((listener, port)),
        Err(primary) if port != FALLBACK_PORT => {
            warn!(port, error = %primary, "Modbus port unavailable, trying fallback {FALLBACK_PORT}");
            match TcpListener::bind((host, FALLBACK_PORT)).await {
                Ok(listener) => Ok((listener, FALLBACK_PORT)),
                Err(source) => Err(ServerError::Bind { port, fallback: FALLBACK_PORT, source }),
            }
        }
        Err(source) => Err(ServerError::Bind { port, fallback: port, source }),
    }
}

/// Accept loop. Runs until the task is aborted at shutdown.
pub async fn serve(listener: TcpListener, bank: Arc<RegisterBank>, request_timeout: Duration) {
    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "Modbus TCP listening");
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "Modbus client connected");
                let bank = Arc::clone(&bank);
                tokio::spawn(async move {
                    if let Err(e) = handle_session(stream, bank, request_timeout).await {
                        warn!(%addr, error = %e, "Modbus session closed");
                    }
                    debug!(%addr, "Modbus client disconnected");
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

/// One client session: read a frame, answer it, repeat. Any malformed
/// frame or idle timeout ends the session.
async fn handle_session(
    mut stream: TcpStream,
    bank: Arc<RegisterBank>,
    request_timeout: Duration,
) -> std::io::Result<()> {
    let mut header = [0u8; 7];
    loop {
        match tokio::time::timeout(request_timeout, stream.read_exact(&mut header)).await {
            Err(_) => {
                debug!("request timeout, closing session");
                return Ok(());
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(_)) => {}
        }

        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        let length = u16::from_be_bytes([header[4], header[5]]);
        let unit_id = header[6];

        if protocol_id != 0 {
            warn!(protocol_id, "bad protocol id, closing session");
            return Ok(());
        }
        // Length counts unit id + PDU; the unit id byte is already consumed.
        if !(2..=MAX_MBAP_LENGTH).contains(&length) {
            warn!(length, "bad MBAP length, closing session");
            return Ok(());
        }

        let mut pdu = vec![0u8; length as usize - 1];
        match tokio::time::timeout(request_timeout, stream.read_exact(&mut pdu)).await {
            Err(_) | Ok(Err(_)) => {
                warn!("truncated PDU, closing session");
                return Ok(());
            }
            Ok(Ok(_)) => {}
        }

        let response_pdu = process_request(&bank, pdu[0], &pdu[1..]);
        let mut response = Vec::with_capacity(7 + response_pdu.len());
        response.extend_from_slice(&transaction_id.to_be_bytes());
        response.extend_from_slice(&0u16.to_be_bytes());
        response.extend_from_slice(&((response_pdu.len() as u16 + 1).to_be_bytes()));
        response.push(unit_id);
        response.extend_from_slice(&response_pdu);
        stream.write_all(&response).await?;
    }
}

/// Service one PDU. Only FC03 reads data; everything else answers with
/// exception 01 (Illegal Function), including the other read functions.
fn process_request(bank: &RegisterBank, function: u8, data: &[u8]) -> Vec<u8> {
    match function {
        FC_READ_HOLDING_REGISTERS => read_holding_registers(bank, data),
        other => exception(other, EXCEPTION_ILLEGAL_FUNCTION),
    }
}

fn read_holding_registers(bank: &RegisterBank, data: &[u8]) -> Vec<u8> {
    if data.len() < 4 {
        return exception(FC_READ_HOLDING_REGISTERS, EXCEPTION_ILLEGAL_DATA_VALUE);
    }
    let start = u16::from_be_bytes([data[0], data[1]]);
    let quantity = u16::from_be_bytes([data[2], data[3]]);

    if quantity == 0 || quantity > MAX_READ_QUANTITY {
        return exception(FC_READ_HOLDING_REGISTERS, EXCEPTION_ILLEGAL_DATA_VALUE);
    }
    let Some(words) = bank.snapshot(start as usize, quantity as usize) else {
        return exception(FC_READ_HOLDING_REGISTERS, EXCEPTION_ILLEGAL_DATA_ADDRESS);
    };

    let mut pdu = Vec::with_capacity(2 + words.len() * 2);
    pdu.push(FC_READ_HOLDING_REGISTERS);
    pdu.push((words.len() * 2) as u8);
    for word in words {
        pdu.extend_from_slice(&word.to_be_bytes());
    }
    pdu
}

fn exception(function: u8, code: u8) -> Vec<u8> {
    vec![function | 0x80, code]
}

// Quantity range is bounded by the bank size, so the byte count always fits.
const _: () = assert!(TOTAL_REGISTERS <= u8::MAX as usize * 2);
