//! slota BLE - btleplug transport for OTA transfers
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use slota_ble::{BleLink, ble};
//! use slota_ota::{CancelToken, FirmwareImage, LogReporter, OtaConfig, Updater, event_channel};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = OtaConfig::default();
//!     let adapter = ble::get_adapter().await?;
//!     let (sink, events) = event_channel();
//!     let link = BleLink::new(adapter, sink, config.link.clone()).await?;
//!
//!     let updater = Updater::new(Arc::new(link), events, config, Arc::new(LogReporter));
//!     let image = FirmwareImage::load(std::path::Path::new("app.gbl")).await?;
//!     updater.run("0C:43:14:F2:A1:9B".parse()?, image, CancelToken::never()).await?;
//!     Ok(())
//! }
//! ```

pub mod ble;
mod link;

pub use link::BleLink;
