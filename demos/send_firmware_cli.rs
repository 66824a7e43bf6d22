//! Minimal CLI driving `Client::send_firmware` against a real serial port.
//!
//! ```text
//! cargo run --example send_firmware_cli -- /dev/ttyUSB0 firmware.bin 1.2.3 esp32-gateway
//! ```

use std::env;
use std::process;

use env_logger;
use log::info;

use uart_ota_core::{Client, LinkConfig, Outcome};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 5 {
        eprintln!("usage: {} <port> <firmware.bin> <version> <project>", args[0]);
        process::exit(2);
    }
    let port = &args[1];
    let image_path = &args[2];
    let version = &args[3];
    let project = &args[4];

    let image = std::fs::read(image_path).unwrap_or_else(|e| {
        eprintln!("failed to read {}: {}", image_path, e);
        process::exit(1);
    });

    let mut client = Client::new(LinkConfig::new(port.as_str()));
    client.on_progress(|received, total, percent| {
        info!("{}/{} bytes ({}%)", received, total, percent);
    });
    client.on_complete(|ok, code| {
        info!("on_complete: ok={} code={}", ok, code);
    });

    if !client.connect() {
        eprintln!("failed to open {}", port);
        process::exit(1);
    }

    let outcome = client.send_firmware(&image, version, project);
    client.disconnect();

    match outcome {
        Outcome::Success => {
            println!("OTA complete");
        }
        Outcome::Failed(e) => {
            eprintln!("OTA failed: {}", e);
            process::exit(1);
        }
    }
}
