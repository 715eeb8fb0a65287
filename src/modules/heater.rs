use serde_json::Value;
use tracing::{debug, info, warn};

use crate::alarm::AlarmManager;
use crate::config::{HeaterTunables, Param};
use crate::modules::ModuleController;
use crate::protocol::{Command, Frame, Severity};
use crate::store::FlatStore;

/// Over-temperature must hold continuously this long before it is treated
/// as runaway rather than a transient (sunlit glass, water change).
pub const RUNAWAY_HOLD_MS: u64 = 30_000;
/// After the relay opens, temperature must fall at least this much within
/// the stuck-detection window or the relay is presumed welded closed.
pub const STUCK_FALL_DELTA_C: f64 = 0.3;

/// An overrun lockout holds the element off this long before the on-timer
/// is allowed to start over.
const OVERRUN_COOLDOWN_MS: u64 = 600_000;
const STATUS_PERIOD_MS: u64 = 1_000;
/// Relay samples kept for the duty-cycle figure, one per control tick.
const DUTY_WINDOW: usize = 60;

/// Safety conditions in display priority order: when several are active
/// the earliest listed is the one surfaced as `visible_alarm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaterCondition {
    AllProbesOffline,
    ThermalRunaway,
    RelayStuck,
    HeaterOverrun,
    ProbeOffline,
    ThermistorMismatch,
}

pub const ALL_CONDITIONS: &[HeaterCondition] = &[
    HeaterCondition::AllProbesOffline,
    HeaterCondition::ThermalRunaway,
    HeaterCondition::RelayStuck,
    HeaterCondition::HeaterOverrun,
    HeaterCondition::ProbeOffline,
    HeaterCondition::ThermistorMismatch,
];

impl HeaterCondition {
    pub fn code(self) -> &'static str {
        match self {
            HeaterCondition::AllProbesOffline => "all_probes_offline",
            HeaterCondition::ThermalRunaway => "thermal_runaway",
            HeaterCondition::RelayStuck => "relay_stuck",
            HeaterCondition::HeaterOverrun => "heater_overrun",
            HeaterCondition::ProbeOffline => "probe_offline",
            HeaterCondition::ThermistorMismatch => "thermistor_mismatch",
        }
    }

    /// Lockout conditions force the element off until the underlying
    /// condition clears; the rest are advisory.
    pub fn forces_lockout(self) -> bool {
        matches!(
            self,
            HeaterCondition::AllProbesOffline
                | HeaterCondition::ThermalRunaway
                | HeaterCondition::RelayStuck
                | HeaterCondition::HeaterOverrun
        )
    }

    fn severity(self) -> Severity {
        if self.forces_lockout() {
            Severity::Critical
        } else {
            Severity::Warning
        }
    }

    fn message(self) -> &'static str {
        match self {
            HeaterCondition::AllProbesOffline => "both temperature probes are offline",
            HeaterCondition::ThermalRunaway => "water temperature is running away above setpoint",
            HeaterCondition::RelayStuck => "heater relay appears stuck closed",
            HeaterCondition::HeaterOverrun => "heater element exceeded its continuous-on budget",
            HeaterCondition::ProbeOffline => "one temperature probe is offline",
            HeaterCondition::ThermistorMismatch => "temperature probes disagree",
        }
    }

    fn index(self) -> usize {
        match self {
            HeaterCondition::AllProbesOffline => 0,
            HeaterCondition::ThermalRunaway => 1,
            HeaterCondition::RelayStuck => 2,
            HeaterCondition::HeaterOverrun => 3,
            HeaterCondition::ProbeOffline => 4,
            HeaterCondition::ThermistorMismatch => 5,
        }
    }
}

/// Probe sample for one control tick. `None` means the probe did not
/// answer on the sensor bus.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaterInputs {
    pub primary_c: Option<f64>,
    pub secondary_c: Option<f64>,
}

/// Hysteresis thermostat with an independent safety supervisor. The
/// supervisor evaluates every tick from raw probe data; any lockout
/// condition forces the relay open regardless of the thermostat.
pub struct HeaterModule {
    module_id: String,
    store: FlatStore,
    alarms: AlarmManager,
    inputs: HeaterInputs,

    relay_on: bool,
    relay_on_since_ms: u64,
    /// Set on the on→off transition: (when, water temperature then).
    off_baseline: Option<(u64, f64)>,
    runaway_since_ms: Option<u64>,
    overrun_until_ms: Option<u64>,
    active: [bool; 6],
    duty_samples: heapless::Deque<bool, DUTY_WINDOW>,

    /// Link block mirrored into status while associated; absent otherwise.
    network: Option<Value>,
    last_status_ms: Option<u64>,
}

impl HeaterModule {
    pub fn new(module_id: &str, store: FlatStore) -> Self {
        Self {
            module_id: module_id.to_string(),
            store,
            alarms: AlarmManager::new(),
            inputs: HeaterInputs::default(),
            relay_on: false,
            relay_on_since_ms: 0,
            off_baseline: None,
            runaway_since_ms: None,
            overrun_until_ms: None,
            active: [false; 6],
            duty_samples: heapless::Deque::new(),
            network: None,
            last_status_ms: None,
        }
    }

    pub fn ingest_inputs(&mut self, inputs: HeaterInputs) {
        self.inputs = inputs;
    }

    pub fn set_network(&mut self, network: Option<Value>) {
        self.network = network;
    }

    pub fn relay_on(&self) -> bool {
        self.relay_on
    }

    pub fn locked_out(&self) -> bool {
        ALL_CONDITIONS
            .iter()
            .any(|c| c.forces_lockout() && self.active[c.index()])
    }

    pub fn visible_alarm(&self) -> Option<HeaterCondition> {
        ALL_CONDITIONS
            .iter()
            .copied()
            .find(|c| self.active[c.index()])
    }

    pub fn condition_active(&self, condition: HeaterCondition) -> bool {
        self.active[condition.index()]
    }

    fn tunables(&self) -> HeaterTunables {
        HeaterTunables::from_store(&self.store)
    }

    /// Mean of whichever probes answered this tick.
    fn water_temp(&self) -> Option<f64> {
        match (self.inputs.primary_c, self.inputs.secondary_c) {
            (Some(a), Some(b)) => Some((a + b) / 2.0),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    fn duty_cycle_percent(&self) -> f64 {
        if self.duty_samples.is_empty() {
            return 0.0;
        }
        let on = self.duty_samples.iter().filter(|s| **s).count();
        (on as f64 / self.duty_samples.len() as f64) * 100.0
    }

    /// Recompute every safety condition from this tick's probe data and
    /// emit one alarm frame per transition.
    fn evaluate_safety(&mut self, now_ms: u64, tun: &HeaterTunables) -> Vec<Frame> {
        let temp = self.water_temp();
        let mut desired = [false; 6];

        match (self.inputs.primary_c, self.inputs.secondary_c) {
            (None, None) => desired[HeaterCondition::AllProbesOffline.index()] = true,
            (Some(a), Some(b)) => {
                if (a - b).abs() > tun.mismatch_tolerance_c {
                    desired[HeaterCondition::ThermistorMismatch.index()] = true;
                }
            }
            _ => desired[HeaterCondition::ProbeOffline.index()] = true,
        }

        // Runaway: over-temperature sustained past the hold time.
        if let Some(avg) = temp {
            if avg > tun.setpoint_c + tun.runaway_delta_c {
                let since = *self.runaway_since_ms.get_or_insert(now_ms);
                if now_ms.saturating_sub(since) >= RUNAWAY_HOLD_MS {
                    desired[HeaterCondition::ThermalRunaway.index()] = true;
                }
            } else {
                self.runaway_since_ms = None;
            }
        }

        // Overrun: continuous element-on past the budget, held through a
        // cooldown so the timer cannot immediately rearm.
        if self.relay_on
            && now_ms.saturating_sub(self.relay_on_since_ms) >= tun.max_relay_on_ms
        {
            self.overrun_until_ms = Some(now_ms + OVERRUN_COOLDOWN_MS);
        }
        if let Some(until) = self.overrun_until_ms {
            if now_ms < until {
                desired[HeaterCondition::HeaterOverrun.index()] = true;
            } else {
                self.overrun_until_ms = None;
            }
        }

        // Stuck relay: commanded off, yet the water does not cool.
        if let (Some((off_at, baseline)), Some(avg)) = (self.off_baseline, temp) {
            if now_ms.saturating_sub(off_at) >= tun.stuck_window_ms
                && avg > tun.setpoint_c
                && baseline - avg < STUCK_FALL_DELTA_C
            {
                desired[HeaterCondition::RelayStuck.index()] = true;
            }
        }

        let interval = self.store.get(Param::AlarmChirpIntervalMs) as u64;
        let mut out = Vec::new();
        for condition in ALL_CONDITIONS.iter().copied() {
            let idx = condition.index();
            if desired[idx] && !self.active[idx] {
                self.active[idx] = true;
                if let Some(event) = self.alarms.assert(
                    condition.code(),
                    condition.severity(),
                    condition.message(),
                    None,
                    now_ms,
                    interval,
                ) {
                    out.push(Frame::alarm(&self.module_id, now_ms, event));
                }
            } else if !desired[idx] && self.active[idx] {
                self.active[idx] = false;
                if let Some(event) = self.alarms.clear(condition.code(), now_ms) {
                    out.push(Frame::alarm(&self.module_id, now_ms, event));
                }
            }
        }
        out
    }

    fn drive_relay(&mut self, now_ms: u64, tun: &HeaterTunables) {
        let want_on = if self.locked_out() {
            false
        } else {
            match self.water_temp() {
                Some(avg) if avg <= tun.setpoint_c - tun.hysteresis_half_c => true,
                Some(avg) if avg >= tun.setpoint_c + tun.hysteresis_half_c => false,
                // Inside the band: hold the previous relay state.
                Some(_) => self.relay_on,
                None => false,
            }
        };

        if want_on && !self.relay_on {
            info!("heater element on");
            self.relay_on = true;
            self.relay_on_since_ms = now_ms;
            self.off_baseline = None;
        } else if !want_on && self.relay_on {
            info!("heater element off");
            self.relay_on = false;
            if let Some(temp) = self.water_temp() {
                self.off_baseline = Some((now_ms, temp));
            }
        }
    }

    fn operating_state(&self) -> &'static str {
        if self.locked_out() {
            "locked"
        } else if self.relay_on {
            "heating"
        } else {
            "idle"
        }
    }

    fn badge(&self) -> &'static str {
        match self.visible_alarm() {
            Some(c) if c.forces_lockout() => "alarm",
            Some(_) => "warn",
            None => "ok",
        }
    }

    fn status_frame(&mut self, now_ms: u64) -> Frame {
        let tun = self.tunables();
        let conditions: Vec<&str> = ALL_CONDITIONS
            .iter()
            .copied()
            .filter(|c| self.active[c.index()])
            .map(HeaterCondition::code)
            .collect();
        let mut payload = serde_json::json!({
            "uptime_s": now_ms / 1000,
            "firmware": {
                "version": env!("CARGO_PKG_VERSION"),
                "build": if cfg!(debug_assertions) { "debug" } else { "release" },
            },
            "environment": { "temperature_c": self.water_temp() },
            "subsystems": [{
                "id": "heater",
                "state": self.operating_state(),
                "badge": self.badge(),
                "safety_lockout": self.locked_out(),
                "visible_alarm": self.visible_alarm().map(HeaterCondition::code),
                "setpoints": {
                    "setpoint_c": tun.setpoint_c,
                    "hysteresis_half_c": tun.hysteresis_half_c,
                },
                "safety": {
                    "conditions": conditions,
                    "duty_cycle_percent": self.duty_cycle_percent(),
                },
                "relay": {
                    "on": self.relay_on,
                    "on_ms": if self.relay_on {
                        now_ms.saturating_sub(self.relay_on_since_ms)
                    } else {
                        0
                    },
                },
                "sensors": [
                    {
                        "id": "primary",
                        "temperature_c": self.inputs.primary_c,
                        "online": self.inputs.primary_c.is_some(),
                    },
                    {
                        "id": "secondary",
                        "temperature_c": self.inputs.secondary_c,
                        "online": self.inputs.secondary_c.is_some(),
                    },
                ],
            }],
            "alarms": self.alarms.active_snapshot(),
        });
        if let Some(network) = &self.network {
            payload["network"] = network.clone();
        }
        self.last_status_ms = Some(now_ms);
        Frame::status(&self.module_id, now_ms, payload)
    }

    fn config_frame(&self, now_ms: u64) -> Frame {
        let tun = self.tunables();
        let payload = serde_json::json!({
            "heater": {
                "setpoint_c": tun.setpoint_c,
                "hysteresis_half_c": tun.hysteresis_half_c,
                "runaway_delta_c": tun.runaway_delta_c,
                "mismatch_tolerance_c": tun.mismatch_tolerance_c,
                "max_relay_on_ms": tun.max_relay_on_ms,
                "stuck_window_ms": tun.stuck_window_ms,
            },
            "system": {
                "chirp_enabled": self.store.get(Param::ChirpEnabled) != 0.0,
                "alarm_chirp_interval_ms": self.store.get(Param::AlarmChirpIntervalMs) as u64,
            },
        });
        Frame::config(&self.module_id, now_ms, payload)
    }
}

impl ModuleController for HeaterModule {
    fn module_id(&self) -> &str {
        &self.module_id
    }

    fn tick(&mut self, now_ms: u64) -> Vec<Frame> {
        let tun = self.tunables();
        let chirp_enabled = self.store.get(Param::ChirpEnabled) != 0.0;
        let interval = self.store.get(Param::AlarmChirpIntervalMs) as u64;
        let mut out = Vec::new();

        for code in self.alarms.tick(now_ms, interval) {
            if chirp_enabled {
                debug!(code = %code, "reminder chirp");
            }
        }

        out.extend(self.evaluate_safety(now_ms, &tun));
        self.drive_relay(now_ms, &tun);

        if self.duty_samples.is_full() {
            let _ = self.duty_samples.pop_front();
        }
        let _ = self.duty_samples.push_back(self.relay_on);

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
            Command::Unknown(name) => {
                debug!(command = %name, "ignoring unknown command");
                return out;
            }
            other => {
                debug!(?other, "command not applicable to heater");
            }
        }
        out.push(self.status_frame(now_ms));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameBody;

    fn module() -> HeaterModule {
        HeaterModule::new("heater-1", FlatStore::in_memory())
    }

    fn both(temp: f64) -> HeaterInputs {
        HeaterInputs {
            primary_c: Some(temp),
            secondary_c: Some(temp),
        }
    }

    fn step(m: &mut HeaterModule, now_ms: u64, inputs: HeaterInputs) -> Vec<Frame> {
        m.ingest_inputs(inputs);
        m.tick(now_ms)
    }

    #[test]
    fn first_tick_emits_boot_status_with_firmware_identity() {
        let mut m = module();
        let frames = step(&mut m, 0, both(25.0));
        let status = frames
            .iter()
            .find_map(|f| match &f.body {
                FrameBody::Status(v) => Some(v.clone()),
                _ => None,
            })
            .expect("boot status");
        assert_eq!(status["firmware"]["version"], env!("CARGO_PKG_VERSION"));
        assert!(status["firmware"]["build"].is_string());
    }

    #[test]
    fn hysteresis_band_holds_relay_state() {
        let mut m = module();
        // Defaults: setpoint 25.0, half-band 0.1.
        step(&mut m, 0, both(24.8));
        assert!(m.relay_on());
        step(&mut m, 1_000, both(25.05));
        assert!(m.relay_on(), "inside the band the relay holds");
        step(&mut m, 2_000, both(25.1));
        assert!(!m.relay_on());
        step(&mut m, 3_000, both(24.95));
        assert!(!m.relay_on(), "inside the band the relay holds off too");
        step(&mut m, 4_000, both(24.9));
        assert!(m.relay_on());
    }

    #[test]
    fn single_probe_offline_warns_but_keeps_heating() {
        let mut m = module();
        let frames = step(
            &mut m,
            0,
            HeaterInputs {
                primary_c: Some(24.0),
                secondary_c: None,
            },
        );
        assert!(frames
            .iter()
            .any(|f| matches!(&f.body, FrameBody::Alarm(a) if a.code == "probe_offline" && a.active)));
        assert!(!m.locked_out());
        assert!(m.relay_on(), "thermostat keeps working on the remaining probe");
        assert_eq!(m.visible_alarm(), Some(HeaterCondition::ProbeOffline));
    }

    #[test]
    fn all_probes_offline_locks_out() {
        let mut m = module();
        step(&mut m, 0, both(24.0));
        assert!(m.relay_on());

        let frames = step(&mut m, 1_000, HeaterInputs::default());
        assert!(m.locked_out());
        assert!(!m.relay_on());
        assert_eq!(m.visible_alarm(), Some(HeaterCondition::AllProbesOffline));
        assert!(frames
            .iter()
            .any(|f| matches!(&f.body, FrameBody::Alarm(a) if a.code == "all_probes_offline" && a.active)));

        // Probes return: condition clears, lockout releases.
        let frames = step(&mut m, 2_000, both(24.0));
        assert!(!m.locked_out());
        assert!(m.relay_on());
        assert!(frames
            .iter()
            .any(|f| matches!(&f.body, FrameBody::Alarm(a) if a.code == "all_probes_offline" && !a.active)));
    }

    #[test]
    fn runaway_requires_the_hold_time() {
        let mut m = module();
        // Default runaway delta 2.0 over setpoint 25.0.
        step(&mut m, 0, both(28.0));
        assert!(!m.condition_active(HeaterCondition::ThermalRunaway));
        step(&mut m, RUNAWAY_HOLD_MS - 1_000, both(28.0));
        assert!(!m.condition_active(HeaterCondition::ThermalRunaway));

        let frames = step(&mut m, RUNAWAY_HOLD_MS, both(28.0));
        assert!(m.condition_active(HeaterCondition::ThermalRunaway));
        assert!(m.locked_out());
        assert!(!m.relay_on());
        assert!(frames
            .iter()
            .any(|f| matches!(&f.body, FrameBody::Alarm(a) if a.code == "thermal_runaway" && a.active)));

        // A dip below threshold resets the hold timer.
        let mut m = module();
        step(&mut m, 0, both(28.0));
        step(&mut m, 20_000, both(26.0));
        step(&mut m, 21_000, both(28.0));
        step(&mut m, 21_000 + RUNAWAY_HOLD_MS - 1, both(28.0));
        assert!(!m.condition_active(HeaterCondition::ThermalRunaway));
    }

    #[test]
    fn runaway_clears_when_temperature_recovers() {
        let mut m = module();
        step(&mut m, 0, both(28.0));
        step(&mut m, RUNAWAY_HOLD_MS, both(28.0));
        assert!(m.locked_out());

        let frames = step(&mut m, RUNAWAY_HOLD_MS + 10_000, both(25.0));
        assert!(!m.condition_active(HeaterCondition::ThermalRunaway));
        assert!(!m.locked_out());
        assert!(frames
            .iter()
            .any(|f| matches!(&f.body, FrameBody::Alarm(a) if a.code == "thermal_runaway" && !a.active)));
    }

    #[test]
    fn overrun_fires_after_continuous_on_budget() {
        let mut m = module();
        // Shortest allowed budget so the test clock stays small.
        m.handle_command(
            &Command::SetParam {
                param: Param::MaxRelayOnMs,
                value: 600_000.0,
            },
            0,
        );
        step(&mut m, 0, both(20.0));
        assert!(m.relay_on());

        step(&mut m, 500_000, both(20.0));
        assert!(!m.condition_active(HeaterCondition::HeaterOverrun));
        let frames = step(&mut m, 600_000, both(20.0));
        assert!(m.condition_active(HeaterCondition::HeaterOverrun));
        assert!(m.locked_out());
        assert!(!m.relay_on());
        assert!(frames
            .iter()
            .any(|f| matches!(&f.body, FrameBody::Alarm(a) if a.code == "heater_overrun" && a.active)));
    }

    #[test]
    fn stuck_relay_detected_when_water_never_cools() {
        let mut m = module();
        m.handle_command(
            &Command::SetParam {
                param: Param::StuckWindowMs,
                value: 60_000.0,
            },
            0,
        );
        step(&mut m, 0, both(24.0));
        assert!(m.relay_on());
        // Thermostat opens the relay above the band.
        step(&mut m, 10_000, both(25.2));
        assert!(!m.relay_on());

        // An hour of "off" with no cooling at all.
        step(&mut m, 40_000, both(25.2));
        assert!(!m.condition_active(HeaterCondition::RelayStuck));
        let frames = step(&mut m, 70_000, both(25.2));
        assert!(m.condition_active(HeaterCondition::RelayStuck));
        assert!(m.locked_out());
        assert!(frames
            .iter()
            .any(|f| matches!(&f.body, FrameBody::Alarm(a) if a.code == "relay_stuck" && a.active)));
    }

    #[test]
    fn visible_alarm_prefers_runaway_over_mismatch() {
        let mut m = module();
        // 30 vs 32: mismatch beyond the 1.0 tolerance, average 31 well
        // above the runaway threshold.
        let split = HeaterInputs {
            primary_c: Some(30.0),
            secondary_c: Some(32.0),
        };
        step(&mut m, 0, split);
        assert_eq!(m.visible_alarm(), Some(HeaterCondition::ThermistorMismatch));
        step(&mut m, RUNAWAY_HOLD_MS, split);
        assert!(m.condition_active(HeaterCondition::ThermistorMismatch));
        assert!(m.condition_active(HeaterCondition::ThermalRunaway));
        assert_eq!(m.visible_alarm(), Some(HeaterCondition::ThermalRunaway));
    }

    #[test]
    fn status_reports_lockout_and_sensors() {
        let mut m = module();
        step(&mut m, 0, HeaterInputs::default());
        m.ingest_inputs(HeaterInputs::default());
        let frames = m.tick(1_000);
        let status = frames
            .iter()
            .find_map(|f| match &f.body {
                FrameBody::Status(v) => Some(v.clone()),
                _ => None,
            })
            .expect("heartbeat status");
        let sub = &status["subsystems"][0];
        assert_eq!(sub["state"], "locked");
        assert_eq!(sub["safety_lockout"], true);
        assert_eq!(sub["visible_alarm"], "all_probes_offline");
        assert_eq!(sub["sensors"][0]["online"], false);
        assert!(status.get("network").is_none());
    }

    #[test]
    fn setpoint_change_applies_clamped() {
        let mut m = module();
        let frames = m.handle_command(
            &Command::SetParam {
                param: Param::HeaterSetpointC,
                value: 40.0,
            },
            0,
        );
        let config = frames
            .iter()
            .find_map(|f| match &f.body {
                FrameBody::Config(v) => Some(v.clone()),
                _ => None,
            })
            .expect("config frame");
        assert_eq!(config["heater"]["setpoint_c"], 32.0);
    }
}
