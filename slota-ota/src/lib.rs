//! slota OTA - firmware transfer to BLE GATT peripherals
//!
//! This crate holds the transfer state machine and the tokio driver around
//! it. The BLE stack itself sits behind [`PeripheralLink`]; `slota-ble`
//! provides the btleplug implementation.

mod cancel;
mod config;
mod error;
mod firmware;
mod link;
mod machine;
mod phase;
mod reporter;
mod session;
mod uploader;

pub use cancel::{CancelHandle, CancelToken, cancel_pair};
pub use config::{
    CONFIG_FILE, DisconnectPolicy, LinkConfig, OtaConfig, TimeoutPolicy, config_path, slota_home,
};
pub use error::{FailureKind, LinkError, OtaError, TransferFailure};
pub use firmware::{FirmwareImage, TargetDevice};
pub use link::{
    EventSink, EventStream, Generation, LinkEvent, PeripheralLink, ServiceMap, event_channel,
};
pub use machine::{Action, DelayKind, Event, Timer, TransferMachine, TransferSession};
pub use phase::{Notice, Phase};
pub use reporter::{
    ChannelReporter, LogReporter, ProgressReporter, Report, TransferOutcome, TransferSummary,
};
pub use session::Updater;
pub use uploader::{ChunkUploader, UploadError, UploadStats};

pub use slota_proto::{ControlCommand, DeviceAddress};
