//! Modbus TCP surface tests: frame handling, exception codes, session
//! isolation, and snapshot consistency under concurrent writes.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use linesim::registers::{RegisterBank, RegisterImage, R_GOOD_COUNT, TOTAL_REGISTERS};
use linesim::server;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server(bank: Arc<RegisterBank>) -> std::net::SocketAddr {
    let (listener, _) = server::bind("127.0.0.1", 0).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, bank, REQUEST_TIMEOUT));
    addr
}

fn fc03_request(transaction_id: u16, start: u16, quantity: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12);
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes()); // protocol id
    frame.extend_from_slice(&6u16.to_be_bytes()); // unit + pdu length
    frame.push(1); // unit id
    frame.push(0x03);
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&quantity.to_be_bytes());
    frame
}

/// Read one response frame; returns (transaction_id, unit_id, pdu).
async fn read_response(stream: &mut TcpStream) -> (u16, u8, Vec<u8>) {
    let mut header = [0u8; 7];
    stream.read_exact(&mut header).await.unwrap();
    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    assert_eq!(u16::from_be_bytes([header[2], header[3]]), 0);
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut pdu = vec![0u8; length - 1];
    stream.read_exact(&mut pdu).await.unwrap();
    (transaction_id, header[6], pdu)
}

#[tokio::test]
async fn fc03_round_trips_register_words() {
    let bank = Arc::new(RegisterBank::new());
    let mut image = RegisterImage::new();
    image.set_u16(0, 4); // line_state = FAULT
    image.set_u32(R_GOOD_COUNT, 123_456);
    bank.publish(&image);

    let addr = start_server(bank).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(&fc03_request(7, 0, 8)).await.unwrap();
    let (transaction_id, unit_id, pdu) = read_response(&mut stream).await;
    assert_eq!(transaction_id, 7);
    assert_eq!(unit_id, 1);
    assert_eq!(pdu[0], 0x03);
    assert_eq!(pdu[1], 16); // byte count
    let word = |i: usize| u16::from_be_bytes([pdu[2 + 2 * i], pdu[3 + 2 * i]]);
    assert_eq!(word(0), 4);
    assert_eq!(((word(3) as u32) << 16) | word(4) as u32, 123_456);
}

#[tokio::test]
async fn requests_past_the_bank_get_exception_02() {
    let addr = start_server(Arc::new(RegisterBank::new())).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(&fc03_request(1, TOTAL_REGISTERS as u16 - 1, 2))
        .await
        .unwrap();
    let (_, _, pdu) = read_response(&mut stream).await;
    assert_eq!(pdu, vec![0x83, 0x02]);
}

#[tokio::test]
async fn oversized_quantity_gets_exception_03() {
    let addr = start_server(Arc::new(RegisterBank::new())).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(&fc03_request(1, 0, 126)).await.unwrap();
    let (_, _, pdu) = read_response(&mut stream).await;
    assert_eq!(pdu, vec![0x83, 0x03]);
}

#[tokio::test]
async fn unsupported_function_codes_get_exception_01() {
    let addr = start_server(Arc::new(RegisterBank::new())).await;

    for fc in [0x01u8, 0x02, 0x04, 0x06] {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&1u16.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&6u16.to_be_bytes());
        frame.push(1);
        frame.push(fc);
        frame.extend_from_slice(&[0, 0, 0, 1]);
        stream.write_all(&frame).await.unwrap();
        let (_, _, pdu) = read_response(&mut stream).await;
        assert_eq!(pdu, vec![fc | 0x80, 0x01], "fc {fc}");
    }
}

#[tokio::test]
async fn malformed_frame_closes_only_that_session() {
    let bank = Arc::new(RegisterBank::new());
    let addr = start_server(Arc::clone(&bank)).await;

    // Session A sends a frame with a bad protocol id and gets dropped.
    let mut bad = TcpStream::connect(addr).await.unwrap();
    let mut frame = fc03_request(1, 0, 1);
    frame[2] = 0xFF; // corrupt the protocol id
    bad.write_all(&frame).await.unwrap();
    let mut buf = [0u8; 1];
    let n = bad.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "server closes the offending session");

    // Session B is unaffected.
    let mut good = TcpStream::connect(addr).await.unwrap();
    good.write_all(&fc03_request(2, 0, 1)).await.unwrap();
    let (transaction_id, _, pdu) = read_response(&mut good).await;
    assert_eq!(transaction_id, 2);
    assert_eq!(pdu[0], 0x03);
}

/// S6: while the 32-bit good_count sweeps across the 0xFFFF word boundary,
/// concurrent readers must only ever decode published values, never a torn
/// high/low pair.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reads_never_observe_torn_counters() {
    const FIRST: u32 = 0xFF00;
    const LAST: u32 = 0x1_0100;

    let bank = Arc::new(RegisterBank::new());
    let mut image = RegisterImage::new();
    image.set_u32(R_GOOD_COUNT, FIRST);
    bank.publish(&image);

    let addr = start_server(Arc::clone(&bank)).await;

    let writer_bank = Arc::clone(&bank);
    let writer = tokio::spawn(async move {
        let mut image = RegisterImage::new();
        for value in FIRST..=LAST {
            image.set_u32(R_GOOD_COUNT, value);
            writer_bank.publish(&image);
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }
        }
    });

    let mut readers = Vec::new();
    for _ in 0..8 {
        readers.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            for i in 0..200u16 {
                stream
                    .write_all(&fc03_request(i, R_GOOD_COUNT as u16, 2))
                    .await
                    .unwrap();
                let (_, _, pdu) = read_response(&mut stream).await;
                assert_eq!(pdu[0], 0x03);
                let high = u16::from_be_bytes([pdu[2], pdu[3]]);
                let low = u16::from_be_bytes([pdu[4], pdu[5]]);
                let value = ((high as u32) << 16) | low as u32;
                assert!(
                    (FIRST..=LAST).contains(&value),
                    "torn read: {value:#x} (high {high:#x} low {low:#x})"
                );
            }
        }));
    }

    for reader in readers {
        reader.await.unwrap();
    }
    writer.await.unwrap();
}
