use async_trait::async_trait;
use btleplug::{
    api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Adapter, Manager, Peripheral},
};
use futures::{
    future,
    stream::{Stream, StreamExt},
};
use std::{
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Bm2Error, Result},
    types::{ConnectionParams, DeviceInfo, DeviceTarget},
    BM2_NOTIFY_CHAR_UUID, BM2_SERVICE_UUID, BM2_WRITE_CHAR_UUID,
};

/// How often discovered peripherals are re-checked while scanning
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Raw notification payloads, in arrival order
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// The link a session drives: one notify and one write characteristic
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enable notifications and return the payload stream
    async fn subscribe(&self) -> Result<NotificationStream>;

    /// Disable notifications.
    ///
    /// Returns [`Bm2Error::NotSubscribed`] if notifications are not enabled.
    async fn unsubscribe(&self) -> Result<()>;

    /// Write a frame and wait for the device's acknowledgment
    async fn write(&self, frame: &[u8]) -> Result<()>;

    /// Close the link
    async fn disconnect(&self) -> Result<()>;
}

/// BLE manager for locating and connecting BM2 monitors
pub struct BleManager {
    manager: Manager,
}

impl BleManager {
    /// Create a new BLE manager
    ///
    /// # Errors
    ///
    /// Returns [`Bm2Error::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        Ok(Self { manager })
    }

    /// Scan until a peripheral matching `target` shows up
    ///
    /// # Errors
    ///
    /// Returns [`Bm2Error::DeviceNotFound`] if there is no adapter or nothing
    /// matched within `params.scan_timeout_ms`.
    pub async fn find_device(
        &self,
        target: &DeviceTarget,
        params: &ConnectionParams,
    ) -> Result<(Peripheral, DeviceInfo)> {
        let central = self
            .manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Bm2Error::DeviceNotFound("no Bluetooth adapter".to_string()))?;

        info!("Scanning for BM2 device by {target}");
        central.start_scan(ScanFilter::default()).await?;

        let found = timeout(
            Duration::from_millis(params.scan_timeout_ms),
            Self::poll_peripherals(&central, target),
        )
        .await;

        if let Err(e) = central.stop_scan().await {
            debug!("Failed to stop scan: {e}");
        }

        match found {
            Ok(result) => result,
            Err(_) => Err(Bm2Error::DeviceNotFound(target.to_string())),
        }
    }

    async fn poll_peripherals(
        central: &Adapter,
        target: &DeviceTarget,
    ) -> Result<(Peripheral, DeviceInfo)> {
        loop {
            for peripheral in central.peripherals().await? {
                if let Some(info) = Self::device_info(&peripheral).await {
                    if Self::matches(&info, target) {
                        info!(
                            "Found BM2 device: {} ({})",
                            info.name.as_deref().unwrap_or("?"),
                            info.address
                        );
                        return Ok((peripheral, info));
                    }
                }
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        }
    }

    fn matches(info: &DeviceInfo, target: &DeviceTarget) -> bool {
        match target {
            DeviceTarget::Address(address) => info.address.eq_ignore_ascii_case(address),
            DeviceTarget::Name(name) => info
                .name
                .as_deref()
                .is_some_and(|local_name| local_name.contains(name.as_str())),
        }
    }

    async fn device_info(peripheral: &Peripheral) -> Option<DeviceInfo> {
        let properties = peripheral.properties().await.ok().flatten()?;
        Some(DeviceInfo {
            name: properties.local_name,
            address: properties.address.to_string(),
            rssi: properties.rssi,
        })
    }

    /// Locate and connect to a monitor
    ///
    /// # Errors
    ///
    /// Returns [`Bm2Error::DeviceNotFound`] if the device cannot be found,
    /// [`Bm2Error::ConnectTimeout`] if connection times out,
    /// [`Bm2Error::ConnectionFailed`] if the link cannot be established,
    /// or [`Bm2Error::Protocol`] if the GATT characteristics are missing.
    pub async fn connect(
        &self,
        target: &DeviceTarget,
        params: &ConnectionParams,
    ) -> Result<Bm2Connection> {
        let (peripheral, info) = self.find_device(target, params).await?;
        info!("Connecting to {}", info.address);

        timeout(
            Duration::from_millis(params.connect_timeout_ms),
            peripheral.connect(),
        )
        .await
        .map_err(|_| Bm2Error::ConnectTimeout {
            timeout_ms: params.connect_timeout_ms,
        })?
        .map_err(|e| Bm2Error::ConnectionFailed(e.to_string()))?;

        match Self::discover_characteristics(&peripheral).await {
            Ok((notify_char, write_char)) => {
                info!("Successfully connected to {}", info.address);
                Ok(Bm2Connection {
                    peripheral,
                    notify_char,
                    write_char,
                    info,
                    subscribed: AtomicBool::new(false),
                })
            }
            Err(e) => {
                if let Err(disconnect_error) = peripheral.disconnect().await {
                    warn!("Failed to release link after discovery error: {disconnect_error}");
                }
                Err(e)
            }
        }
    }

    async fn discover_characteristics(
        peripheral: &Peripheral,
    ) -> Result<(Characteristic, Characteristic)> {
        peripheral.discover_services().await?;

        let service_uuid = parse_uuid(BM2_SERVICE_UUID)?;
        let notify_uuid = parse_uuid(BM2_NOTIFY_CHAR_UUID)?;
        let write_uuid = parse_uuid(BM2_WRITE_CHAR_UUID)?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid && c.service_uuid == service_uuid)
                .or_else(|| characteristics.iter().find(|c| c.uuid == uuid))
                .cloned()
        };

        let notify_char = find(notify_uuid)
            .ok_or_else(|| Bm2Error::Protocol("Notify characteristic not found".to_string()))?;
        let write_char = find(write_uuid)
            .ok_or_else(|| Bm2Error::Protocol("Write characteristic not found".to_string()))?;

        Ok((notify_char, write_char))
    }
}

/// Parse one of the crate's UUID constants
///
/// # Errors
///
/// Returns [`Bm2Error::Protocol`] if the string is not a UUID.
pub fn parse_uuid(uuid: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid).map_err(|e| Bm2Error::Protocol(format!("Invalid UUID {uuid}: {e}")))
}

/// Active connection to a BM2 monitor
pub struct Bm2Connection {
    peripheral: Peripheral,
    notify_char: Characteristic,
    write_char: Characteristic,
    info: DeviceInfo,
    subscribed: AtomicBool,
}

impl Bm2Connection {
    /// Device this connection is attached to
    #[must_use]
    pub const fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Check if the device is still connected
    pub async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }
}

#[async_trait]
impl Transport for Bm2Connection {
    async fn subscribe(&self) -> Result<NotificationStream> {
        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&self.notify_char).await?;
        self.subscribed.store(true, Ordering::SeqCst);

        let uuid = self.notify_char.uuid;
        Ok(Box::pin(notifications.filter_map(move |notification| {
            future::ready((notification.uuid == uuid).then_some(notification.value))
        })))
    }

    async fn unsubscribe(&self) -> Result<()> {
        if !self.subscribed.swap(false, Ordering::SeqCst) {
            return Err(Bm2Error::NotSubscribed);
        }

        self.peripheral
            .unsubscribe(&self.notify_char)
            .await
            .map_err(|e| match e {
                btleplug::Error::NotConnected => Bm2Error::NotSubscribed,
                other => Bm2Error::Ble(other),
            })
    }

    async fn write(&self, frame: &[u8]) -> Result<()> {
        debug!("Writing frame: {}", hex::encode(frame));

        self.peripheral
            .write(&self.write_char, frame, WriteType::WithResponse)
            .await
            .map_err(|e| Bm2Error::WriteRejected(e.to_string()))
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| Bm2Error::DisconnectError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_parsing() {
        assert!(parse_uuid(BM2_SERVICE_UUID).is_ok());
        assert_eq!(
            parse_uuid(BM2_NOTIFY_CHAR_UUID).unwrap(),
            Uuid::from_u128(0x0000_fff4_0000_1000_8000_0080_5f9b_34fb)
        );
        assert_eq!(
            parse_uuid(BM2_WRITE_CHAR_UUID).unwrap(),
            Uuid::from_u128(0x0000_fff3_0000_1000_8000_0080_5f9b_34fb)
        );
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_target_matching() {
        let info = DeviceInfo {
            name: Some("Battery Monitor BM2".to_string()),
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            rssi: Some(-60),
        };

        assert!(BleManager::matches(
            &info,
            &DeviceTarget::Address("aa:bb:cc:dd:ee:ff".to_string())
        ));
        assert!(!BleManager::matches(
            &info,
            &DeviceTarget::Address("11:22:33:44:55:66".to_string())
        ));
        assert!(BleManager::matches(&info, &DeviceTarget::Name("BM2".to_string())));
        assert!(!BleManager::matches(&info, &DeviceTarget::Name("BM6".to_string())));

        let unnamed = DeviceInfo { name: None, ..info };
        assert!(!BleManager::matches(&unnamed, &DeviceTarget::Name("BM2".to_string())));
    }
}
