use bm2_ble::{Bm2Session, ConnectionParams, DeviceTarget, Message, Result};
use tracing::{error, info, warn};

fn target_from_args() -> DeviceTarget {
    match std::env::args().nth(1) {
        Some(arg) if arg.matches(':').count() == 5 => DeviceTarget::Address(arg),
        Some(arg) => DeviceTarget::Name(arg),
        None => DeviceTarget::Name("Battery Monitor".to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let target = target_from_args();
    info!("BM2 monitor, connecting to {target}");

    let (session, mut messages) = Bm2Session::new(ConnectionParams::default());
    if let Err(e) = session.connect(&target).await {
        error!("Failed to connect: {e}");
        return Err(e);
    }

    info!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            message = messages.recv() => match message {
                Some(Message::VoltageStatus(status)) => info!(
                    "Voltage {:.2} V, battery {}%, status {}",
                    status.voltage,
                    status.battery_power,
                    status.battery_status()
                ),
                Some(Message::ChargeTest(result)) => info!(
                    "Charge test: idle {:.2} V, load {:.2} V (status {})",
                    result.idle_volt, result.high_volt, result.status
                ),
                Some(Message::CrankTest(result)) => info!(
                    "Crank test: {:.2} V, {} samples, at {} ms",
                    result.voltage,
                    result.voltages.len(),
                    result.test_time_ms
                ),
                Some(other) => info!("{other:?}"),
                None => {
                    warn!("Message stream closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    session.disconnect().await
}
