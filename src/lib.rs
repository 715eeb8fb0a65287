//! Aquarium peripheral coordinator: autonomous filter and heater modules
//! speaking a line-delimited JSON envelope protocol to a central hub.
//!
//! Modules own their control and safety logic and keep running with or
//! without the hub; the hub mirrors their pushed state and issues
//! fire-and-forget commands. See `protocol` for the wire format.

pub mod alarm;
pub mod config;
pub mod hub;
pub mod modules;
pub mod protocol;
pub mod spool;
pub mod store;

pub use alarm::AlarmManager;
pub use config::{HeaterTunables, Param, RollerTunables};
pub use hub::{ConnectionRecord, HubAction, HubDispatcher, SpoolUsageEntry};
pub use modules::{HeaterInputs, HeaterModule, ModuleController, RollerInputs, RollerModule};
pub use protocol::{
    AtoMode, Command, EnvelopeCodec, Frame, FrameBody, ProtocolError, PROTOCOL_VERSION,
};
pub use spool::SpoolEstimator;
pub use store::{FlatStore, StoreError};
