use std::time::Duration;

/// Caller-supplied configuration for a [`crate::link::Link`].
///
/// The core never reads environment variables or config files itself —
/// that belongs to whatever collaborator (CLI, MQTT bridge, HTTP staging
/// service) wires this crate up. This struct is the seam.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub port: String,
    pub baud_rate: u32,
    /// Reply budget for START and each DATA block.
    pub start_timeout: Duration,
    pub data_timeout: Duration,
    /// Reply budget for END; generous since the target may be erasing and
    /// writing flash partitions.
    pub end_timeout: Duration,
    /// Reply budget for QUERY_STATUS / ROLLBACK_REQ.
    pub rpc_timeout: Duration,
    /// Retries for START/DATA/END before the transfer is declared Failed.
    pub max_retries: u32,
    /// Max payload bytes per DATA frame; always <= `codec::MAX_PAYLOAD`.
    pub block_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            port: String::from("/dev/ttyUSB0"),
            baud_rate: 921_600,
            start_timeout: Duration::from_millis(3000),
            data_timeout: Duration::from_millis(3000),
            end_timeout: Duration::from_millis(10_000),
            rpc_timeout: Duration::from_millis(3000),
            max_retries: 3,
            block_size: crate::codec::MAX_PAYLOAD,
        }
    }
}

impl LinkConfig {
    pub fn new(port: impl Into<String>) -> Self {
        LinkConfig {
            port: port.into(),
            ..Default::default()
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}
