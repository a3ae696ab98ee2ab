//! Ping a Wyoming server and print what it describes about itself
//!
//! First, start a server:
//! ```bash
//! cargo run -- serve --uri tcp://127.0.0.1:10300
//! ```
//!
//! Then run this example:
//! ```bash
//! cd wyoming_protocol && cargo run --example ping_client -- 127.0.0.1:10300
//! ```

use log::{error, info};
use wyoming_protocol::WyomingClient;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:10300".to_string());

    info!("🚀 Starting ping client example");
    let mut client = WyomingClient::connect(&address)?;

    match client.ping(Some("hello".to_string()))? {
        Some(pong) => info!("🏓 Pong: {:?}", pong.text),
        None => {
            error!("❌ Server closed the connection before answering");
            return Ok(());
        }
    }

    match client.describe()? {
        Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
        None => error!("❌ Server closed the connection before describing itself"),
    }

    Ok(())
}
