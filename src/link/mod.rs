//! # Sensor Link
//!
//! BLE central side of the sensor unit connection: the platform adapter
//! seam, the connection state, the state machine that drives it and a
//! capture replay adapter for running without hardware.

pub mod adapter;
pub mod machine;
pub mod replay;
pub mod state;

pub use adapter::{BleAdapter, DeviceId, LinkEvent, LinkEventSink};
pub use machine::{LinkHandle, LinkMachine};
pub use replay::ReplayAdapter;
pub use state::LinkConnectionState;
