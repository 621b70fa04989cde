//! Nordic secure DFU over a control/data channel pair.
//!
//! Implements the object transfer of the nRF5 SDK secure bootloader as
//! described in
//! [DFU Protocol](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/lib_dfu_transport_ble.html).
//! Connecting to the target is left to a transport backend implementing
//! [`ControlChannel`] and [`DataChannel`].

pub mod config;
pub mod crc;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod waiter;

#[cfg(test)]
mod mock;

pub use config::{DfuConfig, RetryPolicy};
pub use error::{DfuCause, DfuError, Phase};
pub use events::{DfuEvent, DfuObserver, NullObserver};
pub use session::{DfuSession, FirmwareImage, run};
pub use transport::{
    ControlChannel, DataChannel, DeviceDescriptor, DeviceFilter, Discovered, Discovery, FirmwareSource,
    TransportError, find_device,
};
