//! A fake target: answers START/DATA/END/QUERY_STATUS/ROLLBACK_REQ over a
//! real serial port so `send_firmware_cli` can be exercised without
//! embedded hardware attached. Mirrors the crate's own sender/rpc test
//! doubles, just driven against a real port instead of a loopback pair.
//!
//! ```text
//! cargo run --example loopback_target -- /dev/ttyUSB1
//! ```

use std::env;
use std::io::{Read, Write};
use std::process;
use std::time::Duration;

use env_logger;
use log::{info, warn};

use uart_ota_core::codec::{self, AckPayload, Command, ErrorCode, StatusPayload, TargetState};
use uart_ota_core::framer;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("usage: {} <port>", args[0]);
        process::exit(2);
    }

    let port_path = &args[1];
    let mut port = serialport::new(port_path.as_str(), 921_600)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(500))
        .open()
        .unwrap_or_else(|e| {
            eprintln!("failed to open {}: {}", port_path, e);
            process::exit(1);
        });

    info!("loopback target listening on {}", port_path);

    let mut acc = Vec::new();
    let mut buf = [0u8; 4096];
    let mut received = 0u32;
    let mut total = 0u32;
    let mut version = String::new();

    loop {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => acc.extend_from_slice(&buf[..n]),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!("read error: {}", e);
                continue;
            }
        }

        loop {
            let (frame, rest) = framer::extract(&acc);
            acc = rest;
            let bytes = match frame {
                Some(b) => b,
                None => break,
            };
            let parsed = match codec::unpack_frame(&bytes) {
                Ok(f) => f,
                Err(e) => {
                    warn!("dropping malformed frame: {}", e);
                    continue;
                }
            };

            let reply = match parsed.command() {
                Some(Command::Start) => {
                    let start = codec::StartPayload::unpack(&parsed.payload).unwrap();
                    total = start.firmware_size;
                    version = start.version.clone();
                    received = 0;
                    info!("START: {} bytes, version={}", total, version);
                    codec::pack_frame(Command::Ready.code(), parsed.sequence, 0, &[]).unwrap()
                }
                Some(Command::Data) => {
                    received = parsed.offset + parsed.payload.len() as u32;
                    let ack = AckPayload {
                        error_code: ErrorCode::Success,
                        expected_seq: parsed.sequence,
                        received_bytes: received,
                    };
                    codec::pack_frame(Command::Ack.code(), parsed.sequence, 0, &ack.pack()).unwrap()
                }
                Some(Command::End) => {
                    info!("END: applying {} bytes", received);
                    codec::pack_frame(Command::Complete.code(), parsed.sequence, 0, &[]).unwrap()
                }
                Some(Command::QueryStatus) => {
                    let status = StatusPayload {
                        state: if received < total { TargetState::Receiving } else { TargetState::Idle },
                        error_code: ErrorCode::Success,
                        received,
                        total,
                        current_version: version.clone(),
                    };
                    codec::pack_frame(Command::StatusResp.code(), parsed.sequence, 0, &status.pack().unwrap()).unwrap()
                }
                Some(Command::RollbackReq) => {
                    info!("ROLLBACK_REQ received");
                    codec::pack_frame(Command::Ack.code(), parsed.sequence, 0, &[]).unwrap()
                }
                Some(Command::Abort) => {
                    warn!("ABORT received, resetting transfer state");
                    received = 0;
                    total = 0;
                    continue;
                }
                other => {
                    warn!("unhandled command: {:?}", other);
                    continue;
                }
            };

            port.write_all(&reply).unwrap();
            port.flush().unwrap();
        }
    }
}
