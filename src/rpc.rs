//! QUERY_STATUS and ROLLBACK_REQ (§4.5): one-shot request/response calls
//! over the same reply-latch mechanism the Sender uses, each consuming one
//! tick of the shared sequence counter (§3 invariant 4). Both MUST NOT be
//! issued mid-transfer; that's enforced by the caller serializing access to
//! the `Link` (§4.3), not by this module.

use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use log::warn;

use crate::codec::{self, Command, StatusPayload};
use crate::error::Result;
use crate::link::Link;

fn next_sequence(sequence: &Mutex<u16>) -> u16 {
    let mut seq = sequence.lock().unwrap();
    *seq = seq.wrapping_add(1);
    *seq
}

/// Sends QUERY_STATUS and parses the target's STATUS_RESP. `Ok(None)` on
/// timeout or an unexpected reply; `Err` only on a transport/framing fault.
pub fn query_status<W: Write + Send + 'static>(
    link: &Link<W>,
    sequence: &Mutex<u16>,
    timeout: Duration,
) -> Result<Option<StatusPayload>> {
    let seq = next_sequence(sequence);
    let frame_bytes = codec::pack_frame(Command::QueryStatus.code(), seq, 0, &[])?;

    let reply = link.request(&frame_bytes, timeout)?;
    Ok(match reply {
        Some(frame) if frame.command() == Some(Command::StatusResp) => match StatusPayload::unpack(&frame.payload) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("query_status: malformed STATUS_RESP: {}", e);
                None
            }
        },
        Some(frame) => {
            warn!("query_status: unexpected reply {:?}", frame.command());
            None
        }
        None => {
            warn!("query_status: timed out");
            None
        }
    })
}

/// Sends ROLLBACK_REQ. `Ok(true)` only on an explicit ACK; any other
/// reply, or none at all, is `Ok(false)`.
pub fn request_rollback<W: Write + Send + 'static>(
    link: &Link<W>,
    sequence: &Mutex<u16>,
    timeout: Duration,
) -> Result<bool> {
    let seq = next_sequence(sequence);
    let frame_bytes = codec::pack_frame(Command::RollbackReq.code(), seq, 0, &[])?;

    let reply = link.request(&frame_bytes, timeout)?;
    Ok(match reply {
        Some(frame) if frame.command() == Some(Command::Ack) => true,
        Some(frame) => {
            warn!("request_rollback: target replied {:?} (not ACK)", frame.command());
            false
        }
        None => {
            warn!("request_rollback: timed out");
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AckPayload, ErrorCode, TargetState};
    use crate::link::Hooks;
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::thread;

    fn duplex_pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        b.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        (a, b)
    }

    #[test]
    fn query_status_parses_the_response() {
        let (gateway_io, target_io) = duplex_pair();
        let gateway_reader = gateway_io.try_clone().unwrap();
        let link = Link::spawn(gateway_io, gateway_reader, Hooks::default());

        let mut target_writer = target_io.try_clone().unwrap();
        let responder = thread::spawn(move || {
            let mut target_reader = target_io;
            let mut acc = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                if let Ok(n) = target_reader.read(&mut buf) {
                    if n == 0 {
                        continue;
                    }
                    acc.extend_from_slice(&buf[..n]);
                    let (frame, rest) = crate::framer::extract(&acc);
                    acc = rest;
                    if let Some(bytes) = frame {
                        let parsed = codec::unpack_frame(&bytes).unwrap();
                        assert_eq!(parsed.command(), Some(Command::QueryStatus));
                        let status = StatusPayload {
                            state: TargetState::Receiving,
                            error_code: ErrorCode::Success,
                            received: 512,
                            total: 2560,
                            current_version: "1.0.0".into(),
                        };
                        let reply = codec::pack_frame(Command::StatusResp.code(), parsed.sequence, 0, &status.pack().unwrap()).unwrap();
                        target_writer.write_all(&reply).unwrap();
                        target_writer.flush().unwrap();
                        return;
                    }
                }
            }
        });

        let sequence = Mutex::new(0u16);
        let status = query_status(&link, &sequence, Duration::from_millis(300)).unwrap();
        let status = status.expect("expected a STATUS_RESP");
        assert_eq!(status.state, TargetState::Receiving);
        assert_eq!(status.received, 512);
        assert_eq!(status.total, 2560);
        assert_eq!(status.current_version, "1.0.0");
        assert_eq!(*sequence.lock().unwrap(), 1);

        responder.join().unwrap();
    }

    #[test]
    fn request_rollback_true_only_on_ack() {
        let (gateway_io, target_io) = duplex_pair();
        let gateway_reader = gateway_io.try_clone().unwrap();
        let link = Link::spawn(gateway_io, gateway_reader, Hooks::default());

        let mut target_writer = target_io.try_clone().unwrap();
        let responder = thread::spawn(move || {
            let mut target_reader = target_io;
            let mut acc = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                if let Ok(n) = target_reader.read(&mut buf) {
                    if n == 0 {
                        continue;
                    }
                    acc.extend_from_slice(&buf[..n]);
                    let (frame, rest) = crate::framer::extract(&acc);
                    acc = rest;
                    if let Some(bytes) = frame {
                        let parsed = codec::unpack_frame(&bytes).unwrap();
                        assert_eq!(parsed.command(), Some(Command::RollbackReq));
                        let reply = codec::pack_frame(Command::Ack.code(), parsed.sequence, 0, &[]).unwrap();
                        target_writer.write_all(&reply).unwrap();
                        target_writer.flush().unwrap();
                        return;
                    }
                }
            }
        });

        let sequence = Mutex::new(9u16);
        let ok = request_rollback(&link, &sequence, Duration::from_millis(300)).unwrap();
        assert!(ok);
        assert_eq!(*sequence.lock().unwrap(), 10);

        responder.join().unwrap();
    }

    #[test]
    fn request_rollback_false_on_error_reply() {
        let (gateway_io, target_io) = duplex_pair();
        let gateway_reader = gateway_io.try_clone().unwrap();
        let link = Link::spawn(gateway_io, gateway_reader, Hooks::default());

        let mut target_writer = target_io.try_clone().unwrap();
        let responder = thread::spawn(move || {
            let mut target_reader = target_io;
            let mut acc = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                if let Ok(n) = target_reader.read(&mut buf) {
                    if n == 0 {
                        continue;
                    }
                    acc.extend_from_slice(&buf[..n]);
                    let (frame, rest) = crate::framer::extract(&acc);
                    acc = rest;
                    if let Some(bytes) = frame {
                        let parsed = codec::unpack_frame(&bytes).unwrap();
                        let ack = AckPayload {
                            error_code: ErrorCode::ErrRollbackFailed,
                            expected_seq: parsed.sequence,
                            received_bytes: 0,
                        };
                        let reply = codec::pack_frame(Command::Error.code(), parsed.sequence, 0, &ack.pack()).unwrap();
                        target_writer.write_all(&reply).unwrap();
                        target_writer.flush().unwrap();
                        return;
                    }
                }
            }
        });

        let sequence = Mutex::new(0u16);
        let ok = request_rollback(&link, &sequence, Duration::from_millis(300)).unwrap();
        assert!(!ok);

        responder.join().unwrap();
    }

    #[test]
    fn query_status_none_on_timeout() {
        let (gateway_io, _target_io) = duplex_pair();
        let gateway_reader = gateway_io.try_clone().unwrap();
        let link = Link::spawn(gateway_io, gateway_reader, Hooks::default());

        let sequence = Mutex::new(0u16);
        let status = query_status(&link, &sequence, Duration::from_millis(50)).unwrap();
        assert!(status.is_none());
    }
}
