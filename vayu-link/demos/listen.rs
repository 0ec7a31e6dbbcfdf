//! Listen for vehicles and print what they send
//!
//! ```text
//! cargo run --example listen -- [config.toml] [--json]
//! ```
//!
//! Without a config file it listens on `udpin://0.0.0.0:14550`.

use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use vayu_link::{SdkConfig, Vayu};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().skip(1).collect();
    let json = args.iter().any(|a| a == "--json");
    let config = match args.iter().find(|a| !a.starts_with('-')) {
        Some(path) => SdkConfig::from_file(path)?,
        None => SdkConfig::ground_station_defaults(),
    };
    config.logging.init();

    let vayu = Vayu::with_config(config)?;
    for handle in vayu.connect_configured()? {
        log::info!("Connection {} up", handle.id());
    }

    if json {
        vayu.subscribe_messages_json(|msg| println!("{}", msg.fields_json));
    } else {
        vayu.subscribe_messages(|msg| {
            println!(
                "[{}:{}] #{} {}",
                msg.system_id, msg.component_id, msg.sequence, msg.message_name
            )
        });
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })?;

    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}
