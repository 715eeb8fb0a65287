use tracing::{debug, info, warn};

use crate::alarm::AlarmManager;
use crate::config::RollerTunables;
use crate::modules::ModuleController;
use crate::protocol::{AtoMode, Command, CycleLogPayload, Frame, Severity};
use crate::spool::SpoolEstimator;
use crate::store::FlatStore;

/// Stall detection is suppressed for this long after the motor starts, so
/// the mechanism has time to spin up before the first encoder pulse.
pub const STALL_GRACE_MS: u64 = 1_500;
/// Clearing the media-empty lockout takes this many control presses...
pub const ACK_PRESSES: usize = 3;
/// ...inside this window.
pub const ACK_WINDOW_MS: u64 = 2_000;
/// Presses closer together than this are treated as switch bounce.
pub const ACK_DEBOUNCE_MS: u64 = 50;

const STATUS_PERIOD_MS: u64 = 1_000;

const ROLLER_EMPTY: &str = "roller_empty";
const PUMP_TIMEOUT: &str = "pump_timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorState {
    Stopped,
    RampingUp,
    Running,
    RampingDown,
}

impl MotorState {
    pub fn as_str(self) -> &'static str {
        match self {
            MotorState::Stopped => "stopped",
            MotorState::RampingUp => "ramping_up",
            MotorState::Running => "running",
            MotorState::RampingDown => "ramping_down",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunTrigger {
    Float,
    Manual,
}

impl RunTrigger {
    fn as_str(self) -> &'static str {
        match self {
            RunTrigger::Float => "float",
            RunTrigger::Manual => "manual",
        }
    }
}

/// Sensor sample for one control tick. Floats are level-triggered; the
/// encoder and button fields are deltas observed since the previous tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollerInputs {
    /// Mechanism float: water backed up behind dirty media.
    pub float_main: bool,
    /// Reservoir low-level float (pump start condition).
    pub float_min: bool,
    /// Reservoir high-level float (pump stop condition).
    pub float_max: bool,
    pub encoder_edges: u64,
    pub button_presses: u8,
}

/// Roller-filter and top-off controller. Advances media on float demand,
/// tops off the reservoir, and latches a hard lockout when the media roll
/// runs out.
pub struct RollerModule {
    module_id: String,
    store: FlatStore,
    spool: SpoolEstimator,
    alarms: AlarmManager,

    motor: MotorState,
    current_speed: u8,
    run_started_ms: u64,
    ramp_started_ms: u64,
    run_trigger: RunTrigger,
    /// Auto-stop deadline armed when the mechanism float releases.
    stop_deadline_ms: Option<u64>,
    last_pulse_ms: u64,
    /// Hard lockout after a media-empty stall. Only the physical-control
    /// acknowledge sequence clears it.
    lockout: bool,
    ack_presses: heapless::Vec<u64, 8>,
    last_press_ms: u64,

    ato_mode: AtoMode,
    pump_running: bool,
    pump_started_ms: u64,

    inputs: RollerInputs,
    last_status_ms: Option<u64>,
}

impl RollerModule {
    pub fn new(module_id: &str, store: FlatStore) -> Self {
        let spool = SpoolEstimator::from_store(&store);
        Self {
            module_id: module_id.to_string(),
            store,
            spool,
            alarms: AlarmManager::new(),
            motor: MotorState::Stopped,
            current_speed: 0,
            run_started_ms: 0,
            ramp_started_ms: 0,
            run_trigger: RunTrigger::Float,
            stop_deadline_ms: None,
            last_pulse_ms: 0,
            lockout: false,
            ack_presses: heapless::Vec::new(),
            last_press_ms: 0,
            ato_mode: AtoMode::Auto,
            pump_running: false,
            pump_started_ms: 0,
            inputs: RollerInputs::default(),
            last_status_ms: None,
        }
    }

    /// Feed the sensor sample for the upcoming tick.
    pub fn ingest_inputs(&mut self, inputs: RollerInputs, now_ms: u64) {
        if inputs.encoder_edges > 0 {
            self.last_pulse_ms = now_ms;
            // Only motor-driven advance consumes media; a calibration
            // hand-pull counts toward the session baseline delta alone.
            if self.motor != MotorState::Stopped {
                self.spool.record_pulses(inputs.encoder_edges);
            } else if self.spool.calibrating() {
                self.spool.record_calibration_pulses(inputs.encoder_edges);
            }
        }
        self.inputs = inputs;
    }

    pub fn motor_state(&self) -> MotorState {
        self.motor
    }

    pub fn current_speed(&self) -> u8 {
        self.current_speed
    }

    pub fn locked_out(&self) -> bool {
        self.lockout
    }

    pub fn ato_mode(&self) -> AtoMode {
        self.ato_mode
    }

    pub fn pump_running(&self) -> bool {
        self.pump_running
    }

    fn tunables(&self) -> RollerTunables {
        RollerTunables::from_store(&self.store)
    }

    fn status_frame(&mut self, now_ms: u64) -> Frame {
        let tun = self.tunables();
        let runtime_ms = if self.motor == MotorState::Stopped {
            0
        } else {
            now_ms.saturating_sub(self.run_started_ms)
        };
        let payload = serde_json::json!({
            "uptime_s": now_ms / 1000,
            "motor": {
                "state": self.motor.as_str(),
                "speed": self.current_speed,
                "runtime_ms": runtime_ms,
                "mode": self.run_trigger.as_str(),
            },
            "floats": {
                "main": self.inputs.float_main,
                "min": self.inputs.float_min,
                "max": self.inputs.float_max,
            },
            "ato": {
                "mode": self.ato_mode.to_wire(),
                "pump_running": self.pump_running,
                "manual_mode": self.ato_mode == AtoMode::Manual,
                "paused": self.ato_mode == AtoMode::Paused,
                "timeout_alarm": self.alarms.is_active(PUMP_TIMEOUT),
            },
            "system": {
                "chirp_enabled": tun.chirp_enabled,
                "uptime_s": now_ms / 1000,
                "alarm_chirp_interval_ms": tun.alarm_chirp_interval_ms,
                "lockout": self.lockout,
            },
            "spool": self.spool.snapshot(&self.store, self.alarms.is_active(ROLLER_EMPTY)),
            "alarms": self.alarms.active_snapshot(),
        });
        self.last_status_ms = Some(now_ms);
        Frame::status(&self.module_id, now_ms, payload)
    }

    fn config_frame(&self, now_ms: u64) -> Frame {
        let tun = self.tunables();
        let payload = serde_json::json!({
            "motor": {
                "max_speed": tun.motor_max_speed,
                "run_time_ms": tun.motor_run_time_ms,
                "ramp_up_ms": tun.ramp_up_ms,
                "ramp_down_ms": tun.ramp_down_ms,
                "stall_timeout_ms": tun.stall_timeout_ms,
            },
            "ato": {
                "mode": self.ato_mode.to_wire(),
                "pump_speed": tun.pump_speed,
                "pump_timeout_ms": tun.pump_timeout_ms,
            },
            "spool": {
                "length_mm": tun.spool_length_mm,
                "core_diameter_mm": tun.core_diameter_mm,
                "media_thickness_um": tun.media_thickness_um,
            },
            "system": {
                "chirp_enabled": tun.chirp_enabled,
                "alarm_chirp_interval_ms": tun.alarm_chirp_interval_ms,
            },
        });
        Frame::config(&self.module_id, now_ms, payload)
    }

    fn start_run(&mut self, trigger: RunTrigger, now_ms: u64) {
        info!(trigger = trigger.as_str(), "roller run starting");
        self.motor = MotorState::RampingUp;
        self.run_started_ms = now_ms;
        self.ramp_started_ms = now_ms;
        self.run_trigger = trigger;
        self.stop_deadline_ms = None;
        // Arm stall detection from a fresh baseline, not a stale pulse.
        self.last_pulse_ms = now_ms;
    }

    fn begin_ramp_down(&mut self, now_ms: u64) {
        self.motor = MotorState::RampingDown;
        self.ramp_started_ms = now_ms;
        self.stop_deadline_ms = None;
    }

    /// Encoder went silent while the motor was commanded on: the roll is
    /// out of media. Hard stop, no ramp, latched until acknowledged.
    fn stall_lockout(&mut self, now_ms: u64) -> Vec<Frame> {
        warn!("encoder stall, latching media-empty lockout");
        let duration = now_ms.saturating_sub(self.run_started_ms);
        let trigger = self.run_trigger;
        self.motor = MotorState::Stopped;
        self.current_speed = 0;
        self.stop_deadline_ms = None;
        self.lockout = true;
        self.ack_presses.clear();

        let mut out = Vec::new();
        let interval = self.tunables().alarm_chirp_interval_ms;
        if let Some(event) = self.alarms.assert(
            ROLLER_EMPTY,
            Severity::Critical,
            "filter roll is out of media",
            None,
            now_ms,
            interval,
        ) {
            out.push(Frame::alarm(&self.module_id, now_ms, event));
        }
        out.push(Frame::cycle_log(
            &self.module_id,
            now_ms,
            CycleLogPayload {
                timestamp_s: now_ms / 1000,
                cycle_type: "roller".to_string(),
                duration_ms: duration,
                trigger: trigger.as_str().to_string(),
                timeout: true,
            },
        ));
        out.push(self.status_frame(now_ms));
        out
    }

    /// Multi-press acknowledge while locked out. A single bounce or an
    /// accidental press never clears a media-empty condition.
    fn handle_ack_press(&mut self, now_ms: u64) -> Vec<Frame> {
        if now_ms.saturating_sub(self.last_press_ms) < ACK_DEBOUNCE_MS {
            return Vec::new();
        }
        self.last_press_ms = now_ms;
        self.ack_presses.retain(|t| now_ms.saturating_sub(*t) < ACK_WINDOW_MS);
        if self.ack_presses.push(now_ms).is_err() {
            self.ack_presses.clear();
            let _ = self.ack_presses.push(now_ms);
        }
        if self.ack_presses.len() < ACK_PRESSES {
            return Vec::new();
        }
        info!("media-empty lockout acknowledged");
        self.lockout = false;
        self.ack_presses.clear();
        let mut out = Vec::new();
        if let Some(event) = self.alarms.clear(ROLLER_EMPTY, now_ms) {
            out.push(Frame::alarm(&self.module_id, now_ms, event));
        }
        out.push(self.status_frame(now_ms));
        out
    }

    fn update_motor(&mut self, now_ms: u64, tun: &RollerTunables) -> Vec<Frame> {
        let mut out = Vec::new();

        // Stall detection covers every commanded-on state once the
        // spin-up grace has passed.
        if self.motor != MotorState::Stopped
            && now_ms.saturating_sub(self.run_started_ms) >= STALL_GRACE_MS
            && now_ms.saturating_sub(self.last_pulse_ms) >= tun.stall_timeout_ms
        {
            return self.stall_lockout(now_ms);
        }

        match self.motor {
            MotorState::Stopped => {
                self.current_speed = 0;
                if !self.lockout && self.inputs.float_main {
                    self.start_run(RunTrigger::Float, now_ms);
                    out.push(self.status_frame(now_ms));
                }
            }
            MotorState::RampingUp => {
                let elapsed = now_ms.saturating_sub(self.ramp_started_ms);
                if elapsed >= tun.ramp_up_ms {
                    self.motor = MotorState::Running;
                    self.current_speed = tun.motor_max_speed;
                } else {
                    let frac = elapsed as f64 / tun.ramp_up_ms as f64;
                    self.current_speed = (f64::from(tun.motor_max_speed) * frac) as u8;
                }
            }
            MotorState::Running => {
                self.current_speed = tun.motor_max_speed;
                // Float release arms the auto-stop timer; re-trigger disarms.
                if self.inputs.float_main {
                    self.stop_deadline_ms = None;
                } else if self.stop_deadline_ms.is_none() {
                    self.stop_deadline_ms = Some(now_ms + tun.motor_run_time_ms);
                }
                if let Some(deadline) = self.stop_deadline_ms {
                    if now_ms >= deadline {
                        self.begin_ramp_down(now_ms);
                    }
                }
            }
            MotorState::RampingDown => {
                let elapsed = now_ms.saturating_sub(self.ramp_started_ms);
                if elapsed >= tun.ramp_down_ms {
                    let duration = now_ms.saturating_sub(self.run_started_ms);
                    self.motor = MotorState::Stopped;
                    self.current_speed = 0;
                    out.push(Frame::cycle_log(
                        &self.module_id,
                        now_ms,
                        CycleLogPayload {
                            timestamp_s: now_ms / 1000,
                            cycle_type: "roller".to_string(),
                            duration_ms: duration,
                            trigger: self.run_trigger.as_str().to_string(),
                            timeout: false,
                        },
                    ));
                    out.push(self.status_frame(now_ms));
                } else {
                    let frac = 1.0 - elapsed as f64 / tun.ramp_down_ms as f64;
                    self.current_speed = (f64::from(tun.motor_max_speed) * frac) as u8;
                }
            }
        }
        out
    }

    fn stop_pump(&mut self, now_ms: u64, timeout: bool) -> Frame {
        let runtime = now_ms.saturating_sub(self.pump_started_ms);
        self.pump_running = false;
        info!(runtime_ms = runtime, timeout, "top-off pump stopped");
        Frame::cycle_log(
            &self.module_id,
            now_ms,
            CycleLogPayload {
                timestamp_s: now_ms / 1000,
                cycle_type: "ato".to_string(),
                duration_ms: runtime,
                trigger: match self.ato_mode {
                    AtoMode::Manual => "manual".to_string(),
                    _ => "auto".to_string(),
                },
                timeout,
            },
        )
    }

    fn update_pump(&mut self, now_ms: u64, tun: &RollerTunables) -> Vec<Frame> {
        let mut out = Vec::new();

        // Runtime watchdog applies in every mode. Exceeding the budget
        // means the reservoir is dry or a sensor failed.
        if self.pump_running
            && now_ms.saturating_sub(self.pump_started_ms) >= tun.pump_timeout_ms
        {
            let runtime = now_ms.saturating_sub(self.pump_started_ms);
            out.push(self.stop_pump(now_ms, true));
            if let Some(event) = self.alarms.assert(
                PUMP_TIMEOUT,
                Severity::Warning,
                "top-off pump exceeded its runtime budget",
                Some(serde_json::json!({
                    "timeout_ms": tun.pump_timeout_ms,
                    "runtime_ms": runtime,
                })),
                now_ms,
                tun.alarm_chirp_interval_ms,
            ) {
                out.push(Frame::alarm(&self.module_id, now_ms, event));
            }
            out.push(self.status_frame(now_ms));
            return out;
        }

        match self.ato_mode {
            AtoMode::Auto => {
                if self.pump_running {
                    // Keep filling through the band between the floats;
                    // only the high-level float ends the top-up.
                    if self.inputs.float_max {
                        out.push(self.stop_pump(now_ms, false));
                        out.push(self.status_frame(now_ms));
                    }
                } else if self.inputs.float_min
                    && !self.inputs.float_max
                    && !self.alarms.is_active(PUMP_TIMEOUT)
                {
                    info!("top-off pump starting (auto)");
                    self.pump_running = true;
                    self.pump_started_ms = now_ms;
                    out.push(self.status_frame(now_ms));
                }
            }
            AtoMode::Manual => {
                // Runs until the mode changes or the watchdog fires.
                if !self.pump_running && !self.alarms.is_active(PUMP_TIMEOUT) {
                    info!("top-off pump starting (manual)");
                    self.pump_running = true;
                    self.pump_started_ms = now_ms;
                    out.push(self.status_frame(now_ms));
                }
            }
            AtoMode::Paused => {
                if self.pump_running {
                    out.push(self.stop_pump(now_ms, false));
                    out.push(self.status_frame(now_ms));
                }
            }
        }
        out
    }

    fn set_ato_mode(&mut self, mode: AtoMode, now_ms: u64) -> Vec<Frame> {
        let mut out = Vec::new();
        if mode == self.ato_mode {
            return out;
        }
        info!(mode = mode.to_wire(), "top-off mode changed");
        if self.pump_running {
            out.push(self.stop_pump(now_ms, false));
        }
        self.ato_mode = mode;
        out
    }
}

impl ModuleController for RollerModule {
    fn module_id(&self) -> &str {
        &self.module_id
    }

    fn tick(&mut self, now_ms: u64) -> Vec<Frame> {
        let tun = self.tunables();
        let mut out = Vec::new();

        // Calibration deadline: an abandoned session aborts like a cancel,
        // announced right away.
        if self.spool.tick(now_ms) {
            out.push(self.status_frame(now_ms));
            out.push(self.config_frame(now_ms));
        }

        for code in self.alarms.tick(now_ms, tun.alarm_chirp_interval_ms) {
            if tun.chirp_enabled {
                debug!(code = %code, "reminder chirp");
            }
        }

        let presses = self.inputs.button_presses;
        for _ in 0..presses {
            if self.lockout {
                out.extend(self.handle_ack_press(now_ms));
            } else if self.motor == MotorState::Stopped {
                self.start_run(RunTrigger::Manual, now_ms);
                out.push(self.status_frame(now_ms));
            } else if self.motor == MotorState::Running {
                self.begin_ramp_down(now_ms);
                out.push(self.status_frame(now_ms));
            }
        }
        self.inputs.button_presses = 0;

        if self.lockout {
            self.motor = MotorState::Stopped;
            self.current_speed = 0;
        } else {
            out.extend(self.update_motor(now_ms, &tun));
        }
        out.extend(self.update_pump(now_ms, &tun));

        // The first tick after boot always announces itself.
        if self
            .last_status_ms
            .is_none_or(|last| now_ms.saturating_sub(last) >= STATUS_PERIOD_MS)
        {
            out.push(self.status_frame(now_ms));
        }
        out
    }

    fn handle_command(&mut self, command: &Command, now_ms: u64) -> Vec<Frame> {
        let mut out = Vec::new();
        match command {
            Command::RequestStatus => {}
            Command::RequestConfig => out.push(self.config_frame(now_ms)),
            Command::SetParam { param, value } => match self.store.set(*param, *value) {
                Ok(stored) => {
                    debug!(param = param.wire_name(), stored, "parameter persisted");
                    out.push(self.config_frame(now_ms));
                }
                Err(err) => warn!(%err, "parameter write failed"),
            },
            Command::SetParams(entries) => match self.store.set_many(entries) {
                Ok(()) => out.push(self.config_frame(now_ms)),
                Err(err) => warn!(%err, "parameter batch write failed"),
            },
            Command::SpoolReset { value } => {
                match self.spool.reset(*value, now_ms, &mut self.store) {
                    Ok(true) => {
                        if let Some(event) = self.alarms.clear(ROLLER_EMPTY, now_ms) {
                            self.lockout = false;
                            out.push(Frame::alarm(&self.module_id, now_ms, event));
                        }
                    }
                    Ok(false) => {}
                    Err(err) => warn!(%err, "spool reset failed"),
                }
            }
            Command::CalibrateStart => {
                self.spool.calibrate_start(now_ms);
                out.push(self.config_frame(now_ms));
            }
            Command::CalibrateFinish { roll_length_mm } => {
                match self.spool.calibrate_finish(*roll_length_mm, &mut self.store) {
                    Ok(Some(result)) => {
                        info!(full_edges = result.full_edges, "calibration complete");
                        if let Some(event) = self.alarms.clear(ROLLER_EMPTY, now_ms) {
                            self.lockout = false;
                            out.push(Frame::alarm(&self.module_id, now_ms, event));
                        }
                        out.push(self.config_frame(now_ms));
                    }
                    Ok(None) => {}
                    Err(err) => warn!(%err, "calibration persist failed"),
                }
            }
            Command::CalibrateCancel => {
                if self.spool.calibrate_cancel() {
                    out.push(self.config_frame(now_ms));
                }
            }
            Command::MarkRefilled => {
                if let Some(event) = self.alarms.clear(PUMP_TIMEOUT, now_ms) {
                    out.push(Frame::alarm(&self.module_id, now_ms, event));
                }
            }
            Command::SetAtoMode(mode) => {
                out.extend(self.set_ato_mode(*mode, now_ms));
            }
            Command::Unknown(name) => {
                debug!(command = %name, "ignoring unknown command");
                return out;
            }
        }
        // Every recognized control request answers with a fresh status.
        out.push(self.status_frame(now_ms));
        out
    }
}
