//! Transfer phases and user-facing notices

use std::time::Duration;

use slota_proto::DeviceAddress;

/// Phase of the transfer state machine.
///
/// `Ready` is both where a session starts and where a successful one ends;
/// `Aborted` is where a failed one ends. Both accept a new `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Ready,
    Connecting,
    ResettingToBootloader,
    Reconnecting,
    BeginningTransfer,
    NegotiatingMtu,
    Uploading,
    Ending,
    Disconnecting,
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Aborted)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ready => "ready",
            Self::Connecting => "connecting",
            Self::ResettingToBootloader => "resetting to bootloader",
            Self::Reconnecting => "reconnecting",
            Self::BeginningTransfer => "beginning transfer",
            Self::NegotiatingMtu => "negotiating mtu",
            Self::Uploading => "uploading",
            Self::Ending => "ending transfer",
            Self::Disconnecting => "disconnecting",
            Self::Aborted => "aborted",
        })
    }
}

/// One-off messages meant for whoever is watching the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Connect timeout fired. Under the advisory policy nothing else happens.
    ConnectTimeout { address: DeviceAddress, after: Duration },
    UploadStarted { frames: usize, frame_size: usize },
    UploadDone,
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectTimeout { address, after } => write!(
                f,
                "no connection to {address} after {}s, make sure the address is correct and the device is advertising",
                after.as_secs_f32()
            ),
            Self::UploadStarted { frames, frame_size } => {
                write!(f, "uploading {frames} frames of {frame_size} bytes")
            }
            Self::UploadDone => f.write_str("upload done"),
        }
    }
}
