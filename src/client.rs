//! The public surface of the crate (§6): open a serial endpoint, stream a
//! firmware image to the target, and issue the two one-shot RPCs.
//!
//! Everything upstream of this module — MQTT ingress, HTTP firmware
//! staging, base64 chunking, CLI argument handling — is a collaborator
//! that lives outside this crate and hands a caller a byte slice plus
//! `(version, project)`.

use std::sync::Mutex;
use std::time::Duration;

use log::{info, warn};

use crate::codec::StatusPayload;
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::link::{Hooks, Link};
use crate::rpc;
use crate::sender::{Outcome, Sender};

/// A connected OTA gateway session.
///
/// Owns exactly one [`Link`] over one serial endpoint (§5: a single owned
/// serial handle per Link). Not `Clone`: only one transfer or RPC may be
/// outstanding at a time, enforced by this struct taking `&mut self` for
/// every operation that writes a frame.
pub struct Client {
    link: Option<Link<Box<dyn serialport::SerialPort>>>,
    config: LinkConfig,
    hooks: Hooks,
    /// Shared with every [`Sender`] this client creates: resets to 0 on
    /// each new transfer's START, otherwise increments across both
    /// transfers and RPCs (§3 invariant 4).
    sequence: Mutex<u16>,
}

impl Client {
    /// Builds a disconnected client. Call [`Client::connect`] before using it.
    pub fn new(config: LinkConfig) -> Self {
        Client {
            link: None,
            config,
            hooks: Hooks::default(),
            sequence: Mutex::new(0),
        }
    }

    /// Registers the progress hook (§6). Must be called before [`Client::connect`].
    pub fn on_progress(&mut self, hook: impl Fn(u32, u32, u8) + Send + Sync + 'static) -> &mut Self {
        self.hooks.on_progress = Some(std::sync::Arc::new(hook));
        self
    }

    /// Registers the completion hook (§6). Must be called before [`Client::connect`].
    pub fn on_complete(&mut self, hook: impl Fn(bool, u8) + Send + Sync + 'static) -> &mut Self {
        self.hooks.on_complete = Some(std::sync::Arc::new(hook));
        self
    }

    /// Opens the serial endpoint at 8N1 and starts the reader task.
    ///
    /// Returns `false` (rather than an error) on failure, matching §6's
    /// `connect() -> bool` signature; the underlying cause is logged.
    pub fn connect(&mut self) -> bool {
        let opened = serialport::new(self.config.port.as_str(), self.config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open();

        let port = match opened {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to open {}: {}", self.config.port, e);
                return false;
            }
        };

        let reader = match port.try_clone() {
            Ok(r) => r,
            Err(e) => {
                warn!("failed to clone serial handle for reader task: {}", e);
                return false;
            }
        };

        self.link = Some(Link::spawn(port, reader, self.hooks.clone()));
        *self.sequence.lock().unwrap() = 0;
        info!("connected to {} at {} baud", self.config.port, self.config.baud_rate);
        true
    }

    /// Stops the reader task and closes the endpoint.
    pub fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.shutdown();
            info!("disconnected from {}", self.config.port);
        }
    }

    fn link(&self) -> Result<&Link<Box<dyn serialport::SerialPort>>> {
        self.link
            .as_ref()
            .ok_or_else(|| Error::Transport("not connected".into()))
    }

    /// Streams `image` to the target, blocking until success, failure, or
    /// an exhausted retry budget (§4.4). Emits progress events along the way.
    pub fn send_firmware(&mut self, image: &[u8], version: &str, project: &str) -> Outcome {
        let link = match self.link() {
            Ok(l) => l,
            Err(e) => return Outcome::Failed(e),
        };
        let sender = Sender::new(link, &self.config, self.hooks.clone(), &self.sequence);
        sender.send_firmware(image, version, project)
    }

    /// Issues QUERY_STATUS and waits for STATUS_RESP (§4.5). `None` on
    /// timeout or transport failure; logged either way.
    pub fn query_status(&mut self) -> Option<StatusPayload> {
        let link = match self.link() {
            Ok(l) => l,
            Err(e) => {
                warn!("query_status: {}", e);
                return None;
            }
        };
        match rpc::query_status(link, &self.sequence, self.config.rpc_timeout) {
            Ok(status) => status,
            Err(e) => {
                warn!("query_status: {}", e);
                None
            }
        }
    }

    /// Issues ROLLBACK_REQ (§4.5). `true` only on an explicit ACK; any
    /// other reply, or no reply, is a failure.
    pub fn request_rollback(&mut self) -> bool {
        let link = match self.link() {
            Ok(l) => l,
            Err(e) => {
                warn!("request_rollback: {}", e);
                return false;
            }
        };
        match rpc::request_rollback(link, &self.sequence, self.config.rpc_timeout) {
            Ok(ok) => ok,
            Err(e) => {
                warn!("request_rollback: {}", e);
                false
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}
