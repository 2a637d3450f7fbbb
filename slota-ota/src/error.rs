use slota_proto::{ControlCommand, DeviceAddress};

use crate::link::Generation;
use crate::phase::Phase;

/// Immediate rejection of a request handed to a [`crate::PeripheralLink`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("no open connection for {0}")]
    NotConnected(Generation),
    #[error("{0} not found while scanning")]
    NotFound(DeviceAddress),
    #[error("{0} characteristic not found")]
    MissingCharacteristic(&'static str),
    #[error("bluetooth adapter error: {0}")]
    Adapter(String),
}

/// Why a transfer session ended without installing the image.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    #[error("connection attempt timed out")]
    ConnectTimeout,
    #[error("protocol failure: {0}")]
    Protocol(String),
    #[error("{command} not acknowledged after {attempts} attempts")]
    WriteFailed { command: ControlCommand, attempts: u32 },
    #[error("frame at offset {offset} rejected {attempts} times")]
    UploadRejected { offset: usize, attempts: u32 },
    #[error("peripheral disconnected unexpectedly")]
    Aborted,
    #[error("cancelled")]
    Cancelled,
    #[error("link error: {0}")]
    Link(String),
}

/// Terminal failure of a session, with the phase it was in when it failed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("transfer failed while {phase}: {kind}")]
pub struct TransferFailure {
    pub phase: Phase,
    pub kind: FailureKind,
}

#[derive(thiserror::Error, Debug)]
pub enum OtaError {
    #[error("a transfer session is already active for {0}")]
    SessionActive(DeviceAddress),
    #[error("firmware image is empty")]
    EmptyImage,
    #[error(transparent)]
    Transfer(#[from] TransferFailure),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),
}
