//! BLE GATT Service Protocol Constants for OTA firmware transfer
//!
//! The peripheral exposes one service with two write-only characteristics:
//! a control channel taking single command bytes and a data channel taking
//! firmware frames.

use std::num::NonZeroUsize;

use uuid::Uuid;

/// OTA Service UUID: 1d14d6ee-fd63-4fa1-bfa4-8f47b42119f0
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x1d14d6ee_fd63_4fa1_bfa4_8f47b42119f0);

/// Control Characteristic UUID (write, with response)
pub const CONTROL_UUID: Uuid = Uuid::from_u128(0xf7bf3564_fb6d_4e53_88a4_5e37e0326063);

/// Data Characteristic UUID (write without response)
///
/// Only present once the peripheral runs its bootloader.
pub const DATA_UUID: Uuid = Uuid::from_u128(0x984227f3_34fc_4045_a5d0_2c581f81a153);

/// MTU we aim for; the request adds [`MTU_OVERHEAD`] on top.
pub const DEFAULT_TARGET_MTU: u16 = 247;

/// ATT header bytes the link eats out of every write.
pub const MTU_OVERHEAD: u16 = 3;

/// Control command bytes
pub mod commands {
    /// Reboot into the bootloader. Sent on the application-mode connection.
    pub const REBOOT_TO_BOOTLOADER: u8 = 0x00;

    /// Begin transfer. Sent on the bootloader-mode connection; same byte as
    /// [`REBOOT_TO_BOOTLOADER`], told apart only by which connection is active.
    pub const BEGIN_TRANSFER: u8 = 0x00;

    /// End transfer - all frames have been written
    pub const END_TRANSFER: u8 = 0x03;

    /// Leave the bootloader and boot the new application image
    pub const REBOOT_TO_APPLICATION: u8 = 0x04;
}

/// A control channel command with its meaning attached.
///
/// The wire byte alone is ambiguous (`0x00` is used twice), so the state
/// machine only ever deals in this type and matches acknowledgments against
/// the command it actually sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ControlCommand {
    RebootToBootloader,
    BeginTransfer,
    EndTransfer,
    RebootToApplication,
}

impl ControlCommand {
    pub fn byte(self) -> u8 {
        match self {
            Self::RebootToBootloader => commands::REBOOT_TO_BOOTLOADER,
            Self::BeginTransfer => commands::BEGIN_TRANSFER,
            Self::EndTransfer => commands::END_TRANSFER,
            Self::RebootToApplication => commands::REBOOT_TO_APPLICATION,
        }
    }
}

impl std::fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RebootToBootloader => "reboot-to-bootloader",
            Self::BeginTransfer => "begin-transfer",
            Self::EndTransfer => "end-transfer",
            Self::RebootToApplication => "reboot-to-application",
        };
        write!(f, "{name} (0x{:02x})", self.byte())
    }
}

/// MTU value to put in the exchange request for a given target payload.
pub fn mtu_request(target: u16) -> u16 {
    target.saturating_add(MTU_OVERHEAD)
}

/// Frame size usable on a link with the given negotiated MTU, `None` if the
/// MTU leaves no room for payload.
pub fn frame_size_for_mtu(negotiated: u16) -> Option<NonZeroUsize> {
    negotiated
        .checked_sub(MTU_OVERHEAD)
        .and_then(|size| NonZeroUsize::new(size as usize))
}
