//! slota wire protocol - GATT identifiers, command bytes and frame slicing
//!
//! Nothing in here does I/O. The transfer state machine in `slota-ota` and the
//! btleplug link in `slota-ble` both build on these definitions.

pub mod address;
pub mod ble;
pub mod frame;

pub use address::{AddressError, DeviceAddress};
pub use ble::{
    CONTROL_UUID, ControlCommand, DATA_UUID, DEFAULT_TARGET_MTU, MTU_OVERHEAD, SERVICE_UUID,
    frame_size_for_mtu, mtu_request,
};
pub use frame::{Frames, frame_count};
