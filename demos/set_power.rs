use bm2_ble::{Bm2Session, Command, ConnectionParams, DeviceTarget, Result};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "AA:BB:CC:DD:EE:FF".to_string());
    let mode = args.next().and_then(|m| m.parse().ok()).unwrap_or(0);
    let voltage = args.next().and_then(|v| v.parse().ok()).unwrap_or(12.0);

    let (session, _messages) = Bm2Session::new(ConnectionParams::default());
    session
        .connect(&DeviceTarget::Address(address.clone()))
        .await?;
    info!("Connected to {address}");

    let command = Command::SetPower { mode, voltage };
    match session.send(&command).await {
        Ok(()) => info!("Set mode {mode} at {voltage:.2} V"),
        Err(e) => error!("Command rejected: {e}"),
    }

    session.disconnect().await
}
