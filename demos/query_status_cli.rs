//! Polls a target's current OTA state without starting a transfer.
//!
//! ```text
//! cargo run --example query_status_cli -- /dev/ttyUSB0
//! ```

use std::env;
use std::process;

use env_logger;

use uart_ota_core::{Client, LinkConfig};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("usage: {} <port>", args[0]);
        process::exit(2);
    }
    let port = &args[1];

    let mut client = Client::new(LinkConfig::new(port.as_str()));
    if !client.connect() {
        eprintln!("failed to open {}", port);
        process::exit(1);
    }

    match client.query_status() {
        Some(status) => {
            println!(
                "state={} error={} received={}/{} version={:?}",
                status.state, status.error_code, status.received, status.total, status.current_version
            );
        }
        None => {
            eprintln!("no response from target");
            client.disconnect();
            process::exit(1);
        }
    }

    client.disconnect();
}
