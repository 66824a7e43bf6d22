//! Locates frame boundaries in a growing byte buffer.
//!
//! The Framer owns no I/O of its own: the Link appends bytes it has read
//! from the serial port, then repeatedly calls [`extract`] until it returns
//! `None`, at which point whatever bytes remain are kept for the next read.

use crate::codec::{self, FrameHeader, MAGIC1, MAGIC2, MAGIC3, MAGIC4, MAX_PAYLOAD};

/// Scans `buffer` for one complete, CRC-valid frame.
///
/// Returns `(Some(frame_bytes), rest)` on success, or `(None, kept)` if no
/// complete frame is present yet (`kept` is `buffer` with any bytes that
/// cannot possibly begin a frame discarded).
///
/// This is a pure function over `&[u8]`/`Vec<u8>` so it's trivial to test
/// against crafted garbage without any serial port involved.
pub fn extract(buffer: &[u8]) -> (Option<Vec<u8>>, Vec<u8>) {
    let mut start = 0usize;

    loop {
        // Step 1: scan forward for magic1, magic2.
        let sof = match find_sof(&buffer[start..]) {
            Some(offset) => start + offset,
            None => {
                // No start-of-frame anywhere in what's left. Keep at most
                // the final byte, and only if it could be the first half
                // of a magic sequence that completes once more bytes
                // arrive (per the design note: don't discard a byte that
                // equals the first magic byte).
                let tail = &buffer[start..];
                return match tail.last() {
                    Some(&b) if b == MAGIC1 => (None, vec![b]),
                    _ => (None, Vec::new()),
                };
            }
        };

        let remaining = &buffer[sof..];

        // Step 2: need at least a full header to inspect length.
        if remaining.len() < codec::HEADER_LEN {
            return (None, remaining.to_vec());
        }

        // Step 3: parse tentative header; an oversized length can't be trusted.
        let header = match FrameHeader::from_bytes(remaining) {
            Some(h) => h,
            None => {
                start = sof + 1;
                continue;
            }
        };
        if header.length as usize > MAX_PAYLOAD {
            start = sof + 1;
            continue;
        }

        // Step 4: need the whole frame (header + payload + footer).
        let frame_len = codec::HEADER_LEN + header.length as usize + codec::FOOTER_LEN;
        if remaining.len() < frame_len {
            return (None, remaining.to_vec());
        }

        // Step 5: validate footer magics and CRC.
        let candidate = &remaining[..frame_len];
        if !footer_magic_ok(candidate) || !crc_ok(candidate) {
            start = sof + 1;
            continue;
        }

        // Step 6: success.
        let frame = candidate.to_vec();
        let rest = remaining[frame_len..].to_vec();
        return (Some(frame), rest);
    }
}

fn find_sof(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    buf.windows(2).position(|w| w[0] == MAGIC1 && w[1] == MAGIC2)
}

fn footer_magic_ok(frame: &[u8]) -> bool {
    let len = frame.len();
    frame[len - 2] == MAGIC3 && frame[len - 1] == MAGIC4
}

fn crc_ok(frame: &[u8]) -> bool {
    let len = frame.len();
    let body = &frame[..len - codec::FOOTER_LEN];
    let got = u16::from_le_bytes([frame[len - 4], frame[len - 3]]);
    codec::crc16(body) == got
}
