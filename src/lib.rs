//! A framed, CRC-protected, sequenced, acknowledged binary transport for
//! streaming a firmware image to an embedded target over a serial line.
//!
//! The gateway (this crate) is the initiator; the target is responsive. The
//! crate is organized leaf-first:
//!
//! - [`codec`] — pure pack/unpack functions for the wire format: frame
//!   header/footer, CRC-16 over the frame, CRC-32 over a firmware image,
//!   and the typed payloads carried by each command.
//! - [`framer`] — locates frame boundaries in a growing byte buffer and
//!   resynchronizes past garbage or a corrupted header.
//! - [`link`] — owns the serial endpoint and the reader/caller concurrency
//!   split: a background thread drains bytes into the framer and latches
//!   replies for a single outstanding request at a time.
//! - [`sender`] — the OTA state machine (START → DATA* → END) that walks
//!   an image from start to completion, handling retries, timeouts, and
//!   sequence recovery.
//! - [`client`] — the public [`Client`] that ties the above to a real
//!   serial port and exposes `connect`/`disconnect`/`send_firmware`/
//!   `query_status`/`request_rollback`.
//!
//! ## Example
//! ```no_run
//! use uart_ota_core::{Client, LinkConfig};
//!
//! let mut client = Client::new(LinkConfig::new("/dev/ttyUSB0"));
//! client.on_progress(|received, total, percent| {
//!     println!("{received}/{total} bytes ({percent}%)");
//! });
//!
//! if !client.connect() {
//!     panic!("failed to open serial port");
//! }
//!
//! let image = std::fs::read("firmware.bin").unwrap();
//! match client.send_firmware(&image, "1.2.3", "esp32-gateway") {
//!     uart_ota_core::Outcome::Success => println!("OTA complete"),
//!     uart_ota_core::Outcome::Failed(e) => eprintln!("OTA failed: {e}"),
//! }
//!
//! client.disconnect();
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod framer;
pub mod link;
pub mod rpc;
pub mod sender;

pub use client::Client;
pub use config::LinkConfig;
pub use error::{Error, Result};
pub use link::Hooks;
pub use sender::Outcome;
