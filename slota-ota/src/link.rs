//! Contract between the transfer state machine and a BLE stack
//!
//! Requests are fire-and-forget: they return as soon as the stack has taken
//! them, and the outcome arrives later as a [`LinkEvent`] on the
//! [`EventSink`] the link was built with. Every request and every event names
//! the connection [`Generation`] it belongs to, so an acknowledgment from the
//! application-mode connection can never be mistaken for one from the
//! bootloader-mode connection.

use slota_proto::{CONTROL_UUID, ControlCommand, DATA_UUID, DeviceAddress, SERVICE_UUID};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::LinkError;

/// Identifies one link-layer connection. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u32);

impl Generation {
    pub const FIRST: Generation = Generation(1);

    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection #{}", self.0)
    }
}

/// What discovery found under the OTA service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceMap {
    pub ota_service: bool,
    pub control: bool,
    pub data: bool,
}

impl ServiceMap {
    /// Build from `(service, characteristic)` UUID pairs as reported by discovery.
    pub fn from_characteristics(pairs: impl IntoIterator<Item = (Uuid, Uuid)>) -> Self {
        let mut map = Self::default();
        for (service, characteristic) in pairs {
            if service != SERVICE_UUID {
                continue;
            }
            map.ota_service = true;
            if characteristic == CONTROL_UUID {
                map.control = true;
            } else if characteristic == DATA_UUID {
                map.data = true;
            }
        }
        map
    }

    /// Application-mode peripheral: service and control channel only.
    pub fn application() -> Self {
        Self { ota_service: true, control: true, data: false }
    }

    /// Bootloader-mode peripheral: control and data channels.
    pub fn bootloader() -> Self {
        Self { ota_service: true, control: true, data: true }
    }

    pub fn has_control(&self) -> bool {
        self.ota_service && self.control
    }

    pub fn in_bootloader(&self) -> bool {
        self.ota_service && self.data
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected { generation: Generation, name: Option<String> },
    Disconnected { generation: Generation },
    ServicesDiscovered { generation: Generation, services: ServiceMap },
    /// A control channel write finished. `value` is the byte that was written.
    WriteComplete { generation: Generation, value: u8, success: bool },
    MtuChanged { generation: Generation, mtu: u16, success: bool },
    /// A frame [`PeripheralLink::write_data`] accepted never reached the peer.
    DataWriteFailed { generation: Generation, reason: String },
}

pub type EventSink = mpsc::UnboundedSender<LinkEvent>;
pub type EventStream = mpsc::UnboundedReceiver<LinkEvent>;

/// Channel a link delivers its events on. Events for one connection arrive in order.
pub fn event_channel() -> (EventSink, EventStream) {
    mpsc::unbounded_channel()
}

/// A BLE stack able to carry one OTA transfer.
pub trait PeripheralLink: Send + Sync + 'static {
    /// Open a connection to `address`; answered by `Connected` or `Disconnected`.
    fn connect(&self, address: DeviceAddress, generation: Generation) -> Result<(), LinkError>;

    /// Answered by `ServicesDiscovered`.
    fn discover_services(&self, generation: Generation) -> Result<(), LinkError>;

    /// Write one command byte, with response. Answered by `WriteComplete`.
    fn write_control(&self, generation: Generation, command: ControlCommand)
    -> Result<(), LinkError>;

    /// Queue a frame for an unacknowledged write. `false` means the local
    /// buffer is full and the caller has to try again later. A queued frame
    /// that later fails to go out is reported as `DataWriteFailed`.
    fn write_data(&self, generation: Generation, frame: &[u8]) -> bool;

    /// Answered by `MtuChanged`.
    fn request_mtu(&self, generation: Generation, mtu: u16) -> Result<(), LinkError>;

    /// `false` when `MtuChanged` only echoes the requested MTU because the
    /// stack cannot negotiate one.
    fn negotiates_mtu(&self) -> bool {
        true
    }

    /// Close the connection. Safe to call for connections already gone.
    fn disconnect(&self, generation: Generation);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_map_from_discovery() {
        let other = Uuid::from_u128(0x1800);
        let app = ServiceMap::from_characteristics([
            (other, Uuid::from_u128(0x2a00)),
            (SERVICE_UUID, CONTROL_UUID),
        ]);
        assert_eq!(app, ServiceMap::application());
        assert!(app.has_control());
        assert!(!app.in_bootloader());

        let boot = ServiceMap::from_characteristics([
            (SERVICE_UUID, CONTROL_UUID),
            (SERVICE_UUID, DATA_UUID),
        ]);
        assert_eq!(boot, ServiceMap::bootloader());

        // the data uuid under some other service does not count
        let stray = ServiceMap::from_characteristics([(other, DATA_UUID)]);
        assert!(!stray.in_bootloader());
        assert!(!stray.has_control());
    }
}
