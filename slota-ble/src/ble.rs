//! Adapter lookup and scanning

use btleplug::api::{BDAddr, Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use slota_ota::{LinkConfig, LinkError};
use slota_proto::{DeviceAddress, SERVICE_UUID};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A peripheral seen during a scan
#[derive(Debug, Clone)]
pub struct ScannedDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// Advertises the OTA service. Bootloaders often advertise nothing, so
    /// `false` does not rule a device out.
    pub advertises_ota: bool,
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, Box<dyn std::error::Error>> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or_else(|| "No Bluetooth adapter found".into())
}

/// Scan for BLE devices for `duration`
pub async fn scan(
    adapter: &Adapter,
    duration: Duration,
) -> Result<Vec<ScannedDevice>, Box<dyn std::error::Error>> {
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let peripherals = adapter.peripherals().await?;
    let mut devices = Vec::new();

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
            let address = peripheral.address().to_string();
            let rssi = props.rssi;
            let advertises_ota = props.services.contains(&SERVICE_UUID);

            devices.push(ScannedDevice { name, address, rssi, advertises_ota });
        }
    }

    adapter.stop_scan().await?;
    Ok(devices)
}

pub fn bd_addr(address: DeviceAddress) -> BDAddr {
    BDAddr::from(address.octets())
}

/// Scan until a peripheral with `address` shows up or the scan times out
pub async fn find_peripheral(
    adapter: &Adapter,
    address: DeviceAddress,
    config: &LinkConfig,
) -> Result<Peripheral, LinkError> {
    let target = bd_addr(address);
    info!(%address, "scanning");
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(adapter_error)?;

    let deadline = tokio::time::Instant::now() + config.scan_timeout();
    while tokio::time::Instant::now() < deadline {
        let peripherals = adapter.peripherals().await.map_err(adapter_error)?;
        if let Some(peripheral) = peripherals.into_iter().find(|p| p.address() == target) {
            let _ = adapter.stop_scan().await;
            debug!(%address, "peripheral found");
            return Ok(peripheral);
        }
        tokio::time::sleep(config.rescan_interval()).await;
    }

    let _ = adapter.stop_scan().await;
    warn!(%address, "scan timed out");
    Err(LinkError::NotFound(address))
}

pub(crate) fn adapter_error(err: btleplug::Error) -> LinkError {
    LinkError::Adapter(err.to_string())
}
