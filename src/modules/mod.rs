pub mod heater;
pub mod roller;

pub use heater::{HeaterInputs, HeaterModule};
pub use roller::{RollerInputs, RollerModule};

use crate::protocol::{Command, Frame};

/// One autonomous peripheral controller. Each module runs a single
/// cooperative control loop: the host samples sensors, feeds at most one
/// inbound command, then calls `tick`, all from one execution context.
pub trait ModuleController: Send {
    fn module_id(&self) -> &str;

    /// Advance the control and safety state machines one step and return
    /// the frames to push (heartbeat status, alarms, cycle logs).
    fn tick(&mut self, now_ms: u64) -> Vec<Frame>;

    /// Apply one decoded hub command. Every control request is answered
    /// with a fresh status frame; persisted-parameter changes also emit a
    /// full config frame.
    fn handle_command(&mut self, command: &Command, now_ms: u64) -> Vec<Frame>;
}
