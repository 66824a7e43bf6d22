//! Pure pack/unpack functions for the UART OTA wire format: frame
//! header/footer, CRC-16 over the frame and CRC-32 over a firmware image,
//! and the typed payloads carried by each command.
//!
//! Nothing in this module touches a serial port or a clock; it only turns
//! bytes into typed values and back, so every function here is covered by
//! ordinary unit tests against the literal vectors in the protocol notes.

use crc::{Crc, CRC_16_IBM_3740, CRC_32_ISO_HDLC};

use crate::error::Error;

pub const MAGIC1: u8 = 0xAA;
pub const MAGIC2: u8 = 0x55;
pub const MAGIC3: u8 = 0x55;
pub const MAGIC4: u8 = 0xAA;
pub const PROTOCOL_VERSION: u8 = 0x01;

pub const HEADER_LEN: usize = 14;
pub const FOOTER_LEN: usize = 4;
pub const MAX_PAYLOAD: usize = 1024;

const STR_FIELD_LEN: usize = 32;

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, no reflection, no xor-out).
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
/// CRC-32/ISO-HDLC, the usual IEEE 802.3 polynomial.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn crc16(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

pub fn crc32(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Gateway -> target commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Data,
    End,
    Abort,
    QueryStatus,
    RollbackReq,
    Ack,
    Nack,
    Ready,
    Progress,
    Complete,
    Error,
    StatusResp,
}

impl Command {
    pub const fn code(self) -> u8 {
        match self {
            Command::Start => 0x01,
            Command::Data => 0x02,
            Command::End => 0x03,
            Command::Abort => 0x04,
            Command::QueryStatus => 0x05,
            Command::RollbackReq => 0x06,
            Command::Ack => 0x80,
            Command::Nack => 0x81,
            Command::Ready => 0x82,
            Command::Progress => 0x83,
            Command::Complete => 0x84,
            Command::Error => 0x85,
            Command::StatusResp => 0x86,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Command::Start,
            0x02 => Command::Data,
            0x03 => Command::End,
            0x04 => Command::Abort,
            0x05 => Command::QueryStatus,
            0x06 => Command::RollbackReq,
            0x80 => Command::Ack,
            0x81 => Command::Nack,
            0x82 => Command::Ready,
            0x83 => Command::Progress,
            0x84 => Command::Complete,
            0x85 => Command::Error,
            0x86 => Command::StatusResp,
            _ => return None,
        })
    }

    /// True for ACK/NACK/READY/STATUS_RESP/ERROR: frames that answer a
    /// specific outstanding request, as opposed to PROGRESS/COMPLETE which
    /// are asynchronous events.
    pub const fn is_reply(self) -> bool {
        matches!(
            self,
            Command::Ack | Command::Nack | Command::Ready | Command::StatusResp | Command::Error
        )
    }

    pub const fn is_event(self) -> bool {
        matches!(self, Command::Progress | Command::Complete)
    }
}

/// Target-reported error codes (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success,
    ErrCrc,
    ErrSeq,
    ErrOffset,
    ErrFlashWrite,
    ErrFlashErase,
    ErrPartition,
    ErrImageInvalid,
    ErrVersion,
    ErrNoMemory,
    ErrTimeout,
    ErrBusy,
    ErrInvalidState,
    ErrFrameInvalid,
    ErrRollbackFailed,
    ErrUnknown,
}

impl ErrorCode {
    pub const fn code(self) -> u8 {
        match self {
            ErrorCode::Success => 0x00,
            ErrorCode::ErrCrc => 0x01,
            ErrorCode::ErrSeq => 0x02,
            ErrorCode::ErrOffset => 0x03,
            ErrorCode::ErrFlashWrite => 0x04,
            ErrorCode::ErrFlashErase => 0x05,
            ErrorCode::ErrPartition => 0x06,
            ErrorCode::ErrImageInvalid => 0x07,
            ErrorCode::ErrVersion => 0x08,
            ErrorCode::ErrNoMemory => 0x09,
            ErrorCode::ErrTimeout => 0x0A,
            ErrorCode::ErrBusy => 0x0B,
            ErrorCode::ErrInvalidState => 0x0C,
            ErrorCode::ErrFrameInvalid => 0x0D,
            ErrorCode::ErrRollbackFailed => 0x0E,
            ErrorCode::ErrUnknown => 0xFF,
        }
    }

    pub const fn from_code(code: u8) -> Self {
        match code {
            0x00 => ErrorCode::Success,
            0x01 => ErrorCode::ErrCrc,
            0x02 => ErrorCode::ErrSeq,
            0x03 => ErrorCode::ErrOffset,
            0x04 => ErrorCode::ErrFlashWrite,
            0x05 => ErrorCode::ErrFlashErase,
            0x06 => ErrorCode::ErrPartition,
            0x07 => ErrorCode::ErrImageInvalid,
            0x08 => ErrorCode::ErrVersion,
            0x09 => ErrorCode::ErrNoMemory,
            0x0A => ErrorCode::ErrTimeout,
            0x0B => ErrorCode::ErrBusy,
            0x0C => ErrorCode::ErrInvalidState,
            0x0D => ErrorCode::ErrFrameInvalid,
            0x0E => ErrorCode::ErrRollbackFailed,
            _ => ErrorCode::ErrUnknown,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::Success => "SUCCESS",
            ErrorCode::ErrCrc => "ERR_CRC",
            ErrorCode::ErrSeq => "ERR_SEQ",
            ErrorCode::ErrOffset => "ERR_OFFSET",
            ErrorCode::ErrFlashWrite => "ERR_FLASH_WRITE",
            ErrorCode::ErrFlashErase => "ERR_FLASH_ERASE",
            ErrorCode::ErrPartition => "ERR_PARTITION",
            ErrorCode::ErrImageInvalid => "ERR_IMAGE_INVALID",
            ErrorCode::ErrVersion => "ERR_VERSION",
            ErrorCode::ErrNoMemory => "ERR_NO_MEMORY",
            ErrorCode::ErrTimeout => "ERR_TIMEOUT",
            ErrorCode::ErrBusy => "ERR_BUSY",
            ErrorCode::ErrInvalidState => "ERR_INVALID_STATE",
            ErrorCode::ErrFrameInvalid => "ERR_FRAME_INVALID",
            ErrorCode::ErrRollbackFailed => "ERR_ROLLBACK_FAILED",
            ErrorCode::ErrUnknown => "ERR_UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Target states as reported in `StatusPayload::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Idle,
    WaitingStart,
    Receiving,
    Verifying,
    Applying,
    Completed,
    Error,
    Rollback,
    Unknown(u8),
}

impl TargetState {
    pub const fn from_code(code: u8) -> Self {
        match code {
            0 => TargetState::Idle,
            1 => TargetState::WaitingStart,
            2 => TargetState::Receiving,
            3 => TargetState::Verifying,
            4 => TargetState::Applying,
            5 => TargetState::Completed,
            6 => TargetState::Error,
            7 => TargetState::Rollback,
            other => TargetState::Unknown(other),
        }
    }
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TargetState::Idle => "IDLE",
            TargetState::WaitingStart => "WAITING_START",
            TargetState::Receiving => "RECEIVING",
            TargetState::Verifying => "VERIFYING",
            TargetState::Applying => "APPLYING",
            TargetState::Completed => "COMPLETED",
            TargetState::Error => "ERROR",
            TargetState::Rollback => "ROLLBACK",
            TargetState::Unknown(code) => return write!(f, "UNKNOWN({:#04x})", code),
        };
        f.write_str(name)
    }
}

/// The 14-byte frame header, decoded.
///
/// The named fields (magic x2, version, command, sequence, offset, length)
/// only total 12 bytes; the two trailing bytes are a reserved pad that
/// brings the header to the declared 14-byte size. Always written as zero
/// and ignored on receipt, for forward compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub command: u8,
    pub sequence: u16,
    pub offset: u32,
    pub length: u16,
}

impl FrameHeader {
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut b = [0u8; HEADER_LEN];
        b[0] = MAGIC1;
        b[1] = MAGIC2;
        b[2] = self.version;
        b[3] = self.command;
        b[4..6].copy_from_slice(&self.sequence.to_le_bytes());
        b[6..10].copy_from_slice(&self.offset.to_le_bytes());
        b[10..12].copy_from_slice(&self.length.to_le_bytes());
        // b[12..14] left as zero: reserved pad.
        b
    }

    /// Decode a 14-byte window as a header, without checking the magic
    /// bytes (the framer has already matched those to find this window).
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < HEADER_LEN {
            return None;
        }
        Some(FrameHeader {
            version: b[2],
            command: b[3],
            sequence: u16::from_le_bytes([b[4], b[5]]),
            offset: u32::from_le_bytes([b[6], b[7], b[8], b[9]]),
            length: u16::from_le_bytes([b[10], b[11]]),
        })
    }
}

/// A fully decoded, CRC-verified frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub sequence: u16,
    pub offset: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.command)
    }
}

/// Builds a complete on-wire frame: header, payload, CRC-16 footer.
pub fn pack_frame(command: u8, sequence: u16, offset: u32, payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::Argument(format!(
            "payload of {} bytes exceeds max frame payload of {}",
            payload.len(),
            MAX_PAYLOAD
        )));
    }

    let header = FrameHeader {
        version: PROTOCOL_VERSION,
        command,
        sequence,
        offset,
        length: payload.len() as u16,
    };

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + FOOTER_LEN);
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);

    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.push(MAGIC3);
    frame.push(MAGIC4);

    Ok(frame)
}

/// Decodes a 14-byte header window (no magic/version validation).
pub fn unpack_header(bytes: &[u8]) -> Result<FrameHeader, Error> {
    FrameHeader::from_bytes(bytes)
        .ok_or_else(|| Error::Framing(format!("header window too short: {} bytes", bytes.len())))
}

/// Validates and decodes a complete on-wire frame (header + payload +
/// footer). `bytes` must be exactly `HEADER_LEN + length + FOOTER_LEN` long,
/// where `length` is read from the header.
pub fn unpack_frame(bytes: &[u8]) -> Result<Frame, Error> {
    let header = unpack_header(bytes)?;
    let length = header.length as usize;

    if header.version != PROTOCOL_VERSION {
        return Err(Error::Framing(format!("unexpected protocol version {:#04x}", header.version)));
    }
    if length > MAX_PAYLOAD {
        return Err(Error::Framing(format!("payload length {} exceeds max {}", length, MAX_PAYLOAD)));
    }
    let expected_len = HEADER_LEN + length + FOOTER_LEN;
    if bytes.len() != expected_len {
        return Err(Error::Framing(format!(
            "expected exactly {} bytes, got {}",
            expected_len,
            bytes.len()
        )));
    }

    let payload = &bytes[HEADER_LEN..HEADER_LEN + length];
    let footer = &bytes[HEADER_LEN + length..];

    let got_crc = u16::from_le_bytes([footer[0], footer[1]]);
    if footer[2] != MAGIC3 || footer[3] != MAGIC4 {
        return Err(Error::Framing("bad footer magic".into()));
    }

    let want_crc = crc16(&bytes[..HEADER_LEN + length]);
    if got_crc != want_crc {
        return Err(Error::Framing(format!(
            "CRC mismatch: frame says {:#06x}, computed {:#06x}",
            got_crc, want_crc
        )));
    }

    Ok(Frame {
        command: header.command,
        sequence: header.sequence,
        offset: header.offset,
        payload: payload.to_vec(),
    })
}

fn encode_fixed_str(s: &str, field: &str) -> Result<[u8; STR_FIELD_LEN], Error> {
    let bytes = s.as_bytes();
    if bytes.len() > STR_FIELD_LEN {
        return Err(Error::Argument(format!(
            "{} is {} bytes, exceeds the {}-byte wire field",
            field,
            bytes.len(),
            STR_FIELD_LEN
        )));
    }
    let mut out = [0u8; STR_FIELD_LEN];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

fn decode_fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub const START_PAYLOAD_LEN: usize = 76;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPayload {
    pub firmware_size: u32,
    pub firmware_crc32: u32,
    pub version: String,
    pub project: String,
    pub block_size: u32,
}

impl StartPayload {
    pub fn pack(&self) -> Result<[u8; START_PAYLOAD_LEN], Error> {
        let version = encode_fixed_str(&self.version, "version")?;
        let project = encode_fixed_str(&self.project, "project")?;

        let mut b = [0u8; START_PAYLOAD_LEN];
        b[0..4].copy_from_slice(&self.firmware_size.to_le_bytes());
        b[4..8].copy_from_slice(&self.firmware_crc32.to_le_bytes());
        b[8..40].copy_from_slice(&version);
        b[40..72].copy_from_slice(&project);
        b[72..76].copy_from_slice(&self.block_size.to_le_bytes());
        Ok(b)
    }

    pub fn unpack(b: &[u8]) -> Result<Self, Error> {
        if b.len() != START_PAYLOAD_LEN {
            return Err(Error::Framing(format!(
                "START payload is {} bytes, expected {}",
                b.len(),
                START_PAYLOAD_LEN
            )));
        }
        Ok(StartPayload {
            firmware_size: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            firmware_crc32: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            version: decode_fixed_str(&b[8..40]),
            project: decode_fixed_str(&b[40..72]),
            block_size: u32::from_le_bytes(b[72..76].try_into().unwrap()),
        })
    }
}

pub const ACK_PAYLOAD_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPayload {
    pub error_code: ErrorCode,
    pub expected_seq: u16,
    pub received_bytes: u32,
}

impl AckPayload {
    pub fn pack(&self) -> [u8; ACK_PAYLOAD_LEN] {
        let mut b = [0u8; ACK_PAYLOAD_LEN];
        b[0] = self.error_code.code();
        b[1..3].copy_from_slice(&self.expected_seq.to_le_bytes());
        b[3..7].copy_from_slice(&self.received_bytes.to_le_bytes());
        b
    }

    pub fn unpack(b: &[u8]) -> Result<Self, Error> {
        if b.len() != ACK_PAYLOAD_LEN {
            return Err(Error::Framing(format!(
                "ACK/NACK payload is {} bytes, expected {}",
                b.len(),
                ACK_PAYLOAD_LEN
            )));
        }
        Ok(AckPayload {
            error_code: ErrorCode::from_code(b[0]),
            expected_seq: u16::from_le_bytes([b[1], b[2]]),
            received_bytes: u32::from_le_bytes(b[3..7].try_into().unwrap()),
        })
    }
}

pub const PROGRESS_PAYLOAD_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressPayload {
    pub received: u32,
    pub total: u32,
    pub percentage: u8,
}

impl ProgressPayload {
    pub fn pack(&self) -> [u8; PROGRESS_PAYLOAD_LEN] {
        let mut b = [0u8; PROGRESS_PAYLOAD_LEN];
        b[0..4].copy_from_slice(&self.received.to_le_bytes());
        b[4..8].copy_from_slice(&self.total.to_le_bytes());
        b[8] = self.percentage;
        b
    }

    pub fn unpack(b: &[u8]) -> Result<Self, Error> {
        if b.len() != PROGRESS_PAYLOAD_LEN {
            return Err(Error::Framing(format!(
                "PROGRESS payload is {} bytes, expected {}",
                b.len(),
                PROGRESS_PAYLOAD_LEN
            )));
        }
        Ok(ProgressPayload {
            received: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            total: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            percentage: b[8],
        })
    }
}

pub const STATUS_PAYLOAD_LEN: usize = 42;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPayload {
    pub state: TargetState,
    pub error_code: ErrorCode,
    pub received: u32,
    pub total: u32,
    pub current_version: String,
}

impl StatusPayload {
    pub fn unpack(b: &[u8]) -> Result<Self, Error> {
        if b.len() != STATUS_PAYLOAD_LEN {
            return Err(Error::Framing(format!(
                "STATUS_RESP payload is {} bytes, expected {}",
                b.len(),
                STATUS_PAYLOAD_LEN
            )));
        }
        Ok(StatusPayload {
            state: TargetState::from_code(b[0]),
            error_code: ErrorCode::from_code(b[1]),
            received: u32::from_le_bytes(b[2..6].try_into().unwrap()),
            total: u32::from_le_bytes(b[6..10].try_into().unwrap()),
            current_version: decode_fixed_str(&b[10..42]),
        })
    }

    pub fn pack(&self) -> Result<[u8; STATUS_PAYLOAD_LEN], Error> {
        let version = encode_fixed_str(&self.current_version, "current_version")?;
        let mut b = [0u8; STATUS_PAYLOAD_LEN];
        b[0] = match self.state {
            TargetState::Idle => 0,
            TargetState::WaitingStart => 1,
            TargetState::Receiving => 2,
            TargetState::Verifying => 3,
            TargetState::Applying => 4,
            TargetState::Completed => 5,
            TargetState::Error => 6,
            TargetState::Rollback => 7,
            TargetState::Unknown(code) => code,
        };
        b[1] = self.error_code.code();
        b[2..6].copy_from_slice(&self.received.to_le_bytes());
        b[6..10].copy_from_slice(&self.total.to_le_bytes());
        b[10..42].copy_from_slice(&version);
        Ok(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit-wise reference CRC-16/CCITT-FALSE, kept only to cross-check the
    /// table-driven `crc` crate result against the canonical vector.
    fn crc16_bitwise(data: &[u8]) -> u16 {
        let mut crc: u16 = 0xFFFF;
        for &byte in data {
            crc ^= (byte as u16) << 8;
            for _ in 0..8 {
                if crc & 0x8000 != 0 {
                    crc = (crc << 1) ^ 0x1021;
                } else {
                    crc <<= 1;
                }
            }
        }
        crc
    }

    #[test]
    fn crc16_vector_from_protocol_notes() {
        let bytes: [u8; 14] = [
            0xAA, 0x55, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(crc16(&bytes), 0x7C6A);
        assert_eq!(crc16_bitwise(&bytes), 0x7C6A);
    }

    #[test]
    fn pack_frame_round_trip() {
        let built = pack_frame(Command::Ack.code(), 0x0102, 0x03040506, &[0x00, 0x01, 0x02]).unwrap();
        assert_eq!(built.len(), 21);
        // First 12 header bytes match the protocol notes' literal vector; the
        // last 2 header bytes are the always-zero reserved pad (see FrameHeader).
        assert_eq!(
            &built[0..12],
            &[0xAA, 0x55, 0x01, 0x80, 0x02, 0x01, 0x06, 0x05, 0x04, 0x03, 0x03, 0x00]
        );
        assert_eq!(&built[12..14], &[0x00, 0x00]);
        assert_eq!(&built[14..17], &[0x00, 0x01, 0x02]);
        assert_eq!(&built[19..21], &[MAGIC3, MAGIC4]);

        let decoded = unpack_frame(&built).unwrap();
        assert_eq!(decoded.command, Command::Ack.code());
        assert_eq!(decoded.sequence, 0x0102);
        assert_eq!(decoded.offset, 0x03040506);
        assert_eq!(decoded.payload, vec![0x00, 0x01, 0x02]);
    }

    #[test]
    fn pack_frame_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert!(pack_frame(Command::Data.code(), 1, 0, &payload).is_err());
    }

    #[test]
    fn unpack_frame_detects_crc_mismatch() {
        let mut built = pack_frame(Command::Ready.code(), 0, 0, &[]).unwrap();
        let last = built.len() - 1;
        built[last - 2] ^= 0xFF; // flip a CRC byte
        assert!(unpack_frame(&built).is_err());
    }

    #[test]
    fn start_payload_round_trip() {
        let payload = StartPayload {
            firmware_size: 2560,
            firmware_crc32: 0xDEADBEEF,
            version: "1.2.3".into(),
            project: "esp32-gateway".into(),
            block_size: 1024,
        };
        let packed = payload.pack().unwrap();
        assert_eq!(packed.len(), START_PAYLOAD_LEN);
        let unpacked = StartPayload::unpack(&packed).unwrap();
        assert_eq!(unpacked, payload);
    }

    #[test]
    fn start_payload_rejects_overlong_strings() {
        let payload = StartPayload {
            firmware_size: 0,
            firmware_crc32: 0,
            version: "x".repeat(33),
            project: "ok".into(),
            block_size: 1024,
        };
        assert!(payload.pack().is_err());
    }

    #[test]
    fn ack_payload_round_trip() {
        let ack = AckPayload {
            error_code: ErrorCode::ErrSeq,
            expected_seq: 3,
            received_bytes: 2048,
        };
        let packed = ack.pack();
        assert_eq!(packed.len(), ACK_PAYLOAD_LEN);
        assert_eq!(AckPayload::unpack(&packed).unwrap(), ack);
    }

    #[test]
    fn progress_payload_round_trip() {
        let progress = ProgressPayload {
            received: 1024,
            total: 2560,
            percentage: 40,
        };
        let packed = progress.pack();
        assert_eq!(ProgressPayload::unpack(&packed).unwrap(), progress);
    }

    #[test]
    fn status_payload_round_trip() {
        let status = StatusPayload {
            state: TargetState::Receiving,
            error_code: ErrorCode::Success,
            received: 512,
            total: 2560,
            current_version: "1.0.0".into(),
        };
        let packed = status.pack().unwrap();
        assert_eq!(packed.len(), STATUS_PAYLOAD_LEN);
        assert_eq!(StatusPayload::unpack(&packed).unwrap(), status);
    }

    #[test]
    fn crc32_matches_ieee_802_3() {
        // "123456789" is the standard CRC-32/ISO-HDLC check value vector.
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }
}
