//! The OTA sender state machine (§4.4): walks a firmware image from
//! `START` through `DATA*` to `END`, enforcing sequencing, retries and
//! timeouts, and reporting progress as each block is accepted.
//!
//! A [`Sender`] borrows a [`Link`] and drives it; it owns none of the
//! concurrency itself (that's the Link's job) and has no knowledge of the
//! serial port underneath. This keeps the state machine testable against
//! any `Read + Write` loopback, not just real hardware.

use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::codec::{self, AckPayload, Command, ErrorCode, Frame};
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::link::{Hooks, Link};

/// Result of a complete `send_firmware` call.
#[derive(Debug)]
pub enum Outcome {
    Success,
    Failed(Error),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Drives one firmware transfer over a [`Link`].
///
/// `sequence` is shared with the owning client: §3 invariant 4 treats
/// START/DATA/END/QUERY_STATUS/ROLLBACK_REQ as one continuous counter that
/// only resets to zero when a new transfer's START frame is sent, so the
/// same counter must survive across RPC calls made between transfers.
pub struct Sender<'a, W: Write + Send + 'static> {
    link: &'a Link<W>,
    config: &'a LinkConfig,
    hooks: Hooks,
    sequence: &'a Mutex<u16>,
}

impl<'a, W: Write + Send + 'static> Sender<'a, W> {
    pub fn new(link: &'a Link<W>, config: &'a LinkConfig, hooks: Hooks, sequence: &'a Mutex<u16>) -> Self {
        Sender {
            link,
            config,
            hooks,
            sequence,
        }
    }

    /// Blocks until the transfer succeeds, fails terminally, or exhausts
    /// its retry budget. Never panics on a malformed peer reply; any
    /// unparsable frame is surfaced as [`Error::Framing`].
    pub fn send_firmware(&self, image: &[u8], version: &str, project: &str) -> Outcome {
        if version.len() > 32 {
            return Outcome::Failed(Error::Argument(format!(
                "version {:?} is {} bytes, exceeds the 32-byte wire field",
                version,
                version.len()
            )));
        }
        if project.len() > 32 {
            return Outcome::Failed(Error::Argument(format!(
                "project {:?} is {} bytes, exceeds the 32-byte wire field",
                project,
                project.len()
            )));
        }
        if image.len() > u32::MAX as usize {
            return Outcome::Failed(Error::Argument(format!(
                "image is {} bytes, exceeds the u32 offset range",
                image.len()
            )));
        }

        info!(
            "OTA transfer starting: {} bytes, version={:?}, project={:?}",
            image.len(),
            version,
            project
        );

        if let Err(e) = self.run_start(image, version, project) {
            error!("OTA transfer failed during START: {}", e);
            return Outcome::Failed(e);
        }

        match self.run_data_and_end(image) {
            Ok(()) => {
                info!("OTA transfer completed successfully");
                Outcome::Success
            }
            Err(e) => {
                error!("OTA transfer failed: {}", e);
                self.abort_best_effort();
                Outcome::Failed(e)
            }
        }
    }

    fn run_start(&self, image: &[u8], version: &str, project: &str) -> Result<()> {
        let firmware_crc32 = codec::crc32(image);
        let start = codec::StartPayload {
            firmware_size: image.len() as u32,
            firmware_crc32,
            version: version.to_string(),
            project: project.to_string(),
            block_size: self.config.block_size as u32,
        };
        let payload = start.pack()?;

        {
            let mut seq = self.sequence.lock().unwrap();
            *seq = 0;
        }

        debug!(
            "sending START: size={} crc32={:#010x}",
            image.len(),
            firmware_crc32
        );

        let reply = self.request_with_retries(Command::Start, 0, &payload, self.config.start_timeout, "START")?;
        match reply.command() {
            Some(Command::Ready) => {
                info!("target ready, streaming firmware");
                Ok(())
            }
            Some(Command::Nack) | Some(Command::Error) => Err(peer_rejected(&reply, "START")),
            other => Err(Error::Framing(format!("unexpected reply to START: {:?}", other))),
        }
    }

    fn run_data_and_end(&self, image: &[u8]) -> Result<()> {
        let firmware_size = image.len() as u32;
        let block_size = self.config.block_size.max(1);

        let mut offset: u32 = 0;
        while (offset as usize) < image.len() {
            let end = (offset as usize + block_size).min(image.len());
            let chunk = &image[offset as usize..end];

            self.send_data_block(offset, chunk)?;

            offset += chunk.len() as u32;
            let percent = if firmware_size == 0 {
                100
            } else {
                ((offset as u64 * 100) / firmware_size as u64) as u8
            };
            debug!("accepted block: {}/{} bytes ({}%)", offset, firmware_size, percent);
            if let Some(hook) = &self.hooks.on_progress {
                hook(offset, firmware_size, percent);
            }
        }

        self.run_end()
    }

    /// Sends one DATA block, handling ACK/NACK/timeout/ERR_SEQ resync per
    /// §4.4. On return, the block has been accepted by the target.
    fn send_data_block(&self, offset: u32, chunk: &[u8]) -> Result<()> {
        self.next_sequence();

        let mut timeout_attempts = 0u32;
        loop {
            let sequence = *self.sequence.lock().unwrap();
            let frame_bytes = codec::pack_frame(Command::Data.code(), sequence, offset, chunk)?;
            debug!("sending DATA seq={} offset={} len={}", sequence, offset, chunk.len());

            let reply = self.link.request(&frame_bytes, self.config.data_timeout)?;
            let frame = match reply {
                Some(f) => f,
                None => {
                    timeout_attempts += 1;
                    warn!(
                        "DATA seq={} offset={} timed out ({}/{})",
                        sequence, offset, timeout_attempts, self.config.max_retries
                    );
                    if timeout_attempts >= self.config.max_retries {
                        return Err(Error::Timeout {
                            command: "DATA",
                            sequence,
                        });
                    }
                    continue;
                }
            };

            match frame.command() {
                Some(Command::Ack) => return Ok(()),
                Some(Command::Nack) => {
                    let ack = AckPayload::unpack(&frame.payload)?;
                    if ack.error_code == ErrorCode::ErrSeq {
                        warn!("sequence mismatch on DATA, resyncing to {}", ack.expected_seq);
                        *self.sequence.lock().unwrap() = ack.expected_seq;
                        // Resend the same offset/chunk at the corrected
                        // sequence; this doesn't consume a timeout retry.
                        continue;
                    }
                    return Err(peer_rejected(&frame, "DATA"));
                }
                Some(Command::Error) => return Err(peer_rejected(&frame, "DATA")),
                other => return Err(Error::Framing(format!("unexpected reply to DATA: {:?}", other))),
            }
        }
    }

    fn run_end(&self) -> Result<()> {
        self.next_sequence();

        let mut timeout_attempts = 0u32;
        loop {
            let sequence = *self.sequence.lock().unwrap();
            let frame_bytes = codec::pack_frame(Command::End.code(), sequence, 0, &[])?;
            info!("sending END seq={}, awaiting target verification/apply", sequence);

            let reply = self
                .link
                .request_awaiting_complete(&frame_bytes, self.config.end_timeout)?;
            let frame = match reply {
                Some(f) => f,
                None => {
                    timeout_attempts += 1;
                    warn!("END seq={} timed out ({}/{})", sequence, timeout_attempts, self.config.max_retries);
                    if timeout_attempts >= self.config.max_retries {
                        return Err(Error::Timeout {
                            command: "END",
                            sequence,
                        });
                    }
                    continue;
                }
            };

            match frame.command() {
                Some(Command::Complete) => return Ok(()),
                Some(Command::Nack) => {
                    let ack = AckPayload::unpack(&frame.payload)?;
                    if ack.error_code == ErrorCode::ErrSeq {
                        warn!("sequence mismatch on END, resyncing to {}", ack.expected_seq);
                        *self.sequence.lock().unwrap() = ack.expected_seq;
                        continue;
                    }
                    return Err(peer_rejected(&frame, "END"));
                }
                Some(Command::Error) => return Err(peer_rejected(&frame, "END")),
                other => return Err(Error::Framing(format!("unexpected reply to END: {:?}", other))),
            }
        }
    }

    /// Sends START or a one-shot RPC frame, retrying on timeout only (a
    /// peer NACK/ERROR is always terminal for these, matching §4.4's
    /// tables: retries are reserved for "no reply", never "reply that says
    /// no").
    fn request_with_retries(
        &self,
        command: Command,
        offset: u32,
        payload: &[u8],
        timeout: Duration,
        label: &'static str,
    ) -> Result<Frame> {
        let mut attempts = 0u32;
        loop {
            let sequence = *self.sequence.lock().unwrap();
            let frame_bytes = codec::pack_frame(command.code(), sequence, offset, payload)?;
            let reply = self.link.request(&frame_bytes, timeout)?;
            match reply {
                Some(f) => return Ok(f),
                None => {
                    attempts += 1;
                    warn!("{} timed out ({}/{})", label, attempts, self.config.max_retries);
                    if attempts >= self.config.max_retries {
                        return Err(Error::Timeout {
                            command: label,
                            sequence,
                        });
                    }
                }
            }
        }
    }

    fn next_sequence(&self) -> u16 {
        let mut seq = self.sequence.lock().unwrap();
        *seq = seq.wrapping_add(1);
        *seq
    }

    /// Best-effort ABORT after a mid-transfer failure (§4.4, §9): no
    /// retry, no wait, errors are logged and swallowed.
    fn abort_best_effort(&self) {
        let sequence = self.next_sequence();
        match codec::pack_frame(Command::Abort.code(), sequence, 0, &[]) {
            Ok(bytes) => {
                warn!("sending best-effort ABORT seq={}", sequence);
                self.link.send_no_reply(&bytes);
            }
            Err(e) => warn!("failed to build ABORT frame: {}", e),
        }
    }
}

fn peer_rejected(frame: &Frame, during: &'static str) -> Error {
    let error_code = if frame.command == Command::Nack.code() {
        AckPayload::unpack(&frame.payload)
            .map(|ack| ack.error_code)
            .unwrap_or(ErrorCode::ErrUnknown)
    } else {
        ErrorCode::ErrUnknown
    };
    Error::PeerRejected { error_code, during }
}
