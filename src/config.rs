use serde::{Deserialize, Serialize};

use crate::store::FlatStore;

/// Every persisted tunable. Values travel as f64 on the wire and in the
/// store; booleans are 0/1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Param {
    MotorMaxSpeed,
    MotorRunTimeMs,
    RampUpMs,
    RampDownMs,
    StallTimeoutMs,
    PumpSpeed,
    PumpTimeoutMs,
    SpoolLengthMm,
    CoreDiameterMm,
    MediaThicknessUm,
    ChirpEnabled,
    AlarmChirpIntervalMs,
    HeaterSetpointC,
    HysteresisHalfC,
    RunawayDeltaC,
    MismatchToleranceC,
    MaxRelayOnMs,
    StuckWindowMs,
}

pub const ALL_PARAMS: &[Param] = &[
    Param::MotorMaxSpeed,
    Param::MotorRunTimeMs,
    Param::RampUpMs,
    Param::RampDownMs,
    Param::StallTimeoutMs,
    Param::PumpSpeed,
    Param::PumpTimeoutMs,
    Param::SpoolLengthMm,
    Param::CoreDiameterMm,
    Param::MediaThicknessUm,
    Param::ChirpEnabled,
    Param::AlarmChirpIntervalMs,
    Param::HeaterSetpointC,
    Param::HysteresisHalfC,
    Param::RunawayDeltaC,
    Param::MismatchToleranceC,
    Param::MaxRelayOnMs,
    Param::StuckWindowMs,
];

impl Param {
    pub fn wire_name(self) -> &'static str {
        match self {
            Param::MotorMaxSpeed => "motor_max_speed",
            Param::MotorRunTimeMs => "motor_runtime",
            Param::RampUpMs => "ramp_up_ms",
            Param::RampDownMs => "ramp_down_ms",
            Param::StallTimeoutMs => "stall_timeout_ms",
            Param::PumpSpeed => "pump_speed",
            Param::PumpTimeoutMs => "pump_timeout_ms",
            Param::SpoolLengthMm => "spool_length_mm",
            Param::CoreDiameterMm => "spool_core_diameter_mm",
            Param::MediaThicknessUm => "spool_media_thickness_um",
            Param::ChirpEnabled => "chirp_enabled",
            Param::AlarmChirpIntervalMs => "alarm_chirp_interval_ms",
            Param::HeaterSetpointC => "heater_setpoint_c",
            Param::HysteresisHalfC => "hysteresis_half_c",
            Param::RunawayDeltaC => "runaway_delta_c",
            Param::MismatchToleranceC => "mismatch_tolerance_c",
            Param::MaxRelayOnMs => "max_relay_on_ms",
            Param::StuckWindowMs => "stuck_window_ms",
        }
    }

    /// Accepts the canonical name plus the legacy aliases still sent by
    /// older hub builds (`motor_speed`, `motor_run_time_ms`).
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "motor_max_speed" | "motor_speed" => Some(Param::MotorMaxSpeed),
            "motor_runtime" | "motor_run_time_ms" => Some(Param::MotorRunTimeMs),
            "ramp_up_ms" => Some(Param::RampUpMs),
            "ramp_down_ms" => Some(Param::RampDownMs),
            "stall_timeout_ms" => Some(Param::StallTimeoutMs),
            "pump_speed" => Some(Param::PumpSpeed),
            "pump_timeout_ms" => Some(Param::PumpTimeoutMs),
            "spool_length_mm" => Some(Param::SpoolLengthMm),
            "spool_core_diameter_mm" => Some(Param::CoreDiameterMm),
            "spool_media_thickness_um" => Some(Param::MediaThicknessUm),
            "chirp_enabled" => Some(Param::ChirpEnabled),
            "alarm_chirp_interval_ms" => Some(Param::AlarmChirpIntervalMs),
            "heater_setpoint_c" => Some(Param::HeaterSetpointC),
            "hysteresis_half_c" => Some(Param::HysteresisHalfC),
            "runaway_delta_c" => Some(Param::RunawayDeltaC),
            "mismatch_tolerance_c" => Some(Param::MismatchToleranceC),
            "max_relay_on_ms" => Some(Param::MaxRelayOnMs),
            "stuck_window_ms" => Some(Param::StuckWindowMs),
            _ => None,
        }
    }

    /// Documented valid range, inclusive.
    pub fn range(self) -> (f64, f64) {
        match self {
            Param::MotorMaxSpeed => (50.0, 255.0),
            Param::MotorRunTimeMs => (1_000.0, 30_000.0),
            Param::RampUpMs | Param::RampDownMs => (100.0, 5_000.0),
            Param::StallTimeoutMs => (1_000.0, 30_000.0),
            Param::PumpSpeed => (0.0, 255.0),
            Param::PumpTimeoutMs => (60_000.0, 600_000.0),
            Param::SpoolLengthMm => (10_000.0, 200_000.0),
            Param::CoreDiameterMm => (12.0, 80.0),
            Param::MediaThicknessUm => (40.0, 400.0),
            Param::ChirpEnabled => (0.0, 1.0),
            Param::AlarmChirpIntervalMs => (30_000.0, 600_000.0),
            Param::HeaterSetpointC => (18.0, 32.0),
            Param::HysteresisHalfC => (0.05, 1.0),
            Param::RunawayDeltaC => (0.5, 5.0),
            Param::MismatchToleranceC => (0.2, 5.0),
            Param::MaxRelayOnMs => (600_000.0, 14_400_000.0),
            Param::StuckWindowMs => (60_000.0, 1_800_000.0),
        }
    }

    pub fn default_value(self) -> f64 {
        match self {
            Param::MotorMaxSpeed => 255.0,
            Param::MotorRunTimeMs => 5_000.0,
            Param::RampUpMs | Param::RampDownMs => 1_000.0,
            Param::StallTimeoutMs => 4_000.0,
            Param::PumpSpeed => 255.0,
            Param::PumpTimeoutMs => 120_000.0,
            Param::SpoolLengthMm => 50_000.0,
            Param::CoreDiameterMm => 25.0,
            Param::MediaThicknessUm => 100.0,
            Param::ChirpEnabled => 1.0,
            Param::AlarmChirpIntervalMs => 60_000.0,
            Param::HeaterSetpointC => 25.0,
            Param::HysteresisHalfC => 0.1,
            Param::RunawayDeltaC => 2.0,
            Param::MismatchToleranceC => 1.0,
            Param::MaxRelayOnMs => 3_600_000.0,
            Param::StuckWindowMs => 300_000.0,
        }
    }

    /// Out-of-range values are constrained to the nearest valid bound
    /// rather than rejected.
    pub fn clamp(self, value: f64) -> f64 {
        let (lo, hi) = self.range();
        value.clamp(lo, hi)
    }
}

/// Roller-module view of the persisted tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollerTunables {
    pub motor_max_speed: u8,
    pub motor_run_time_ms: u64,
    pub ramp_up_ms: u64,
    pub ramp_down_ms: u64,
    pub stall_timeout_ms: u64,
    pub pump_speed: u8,
    pub pump_timeout_ms: u64,
    pub spool_length_mm: u32,
    pub core_diameter_mm: f64,
    pub media_thickness_um: u32,
    pub chirp_enabled: bool,
    pub alarm_chirp_interval_ms: u64,
}

impl RollerTunables {
    pub fn from_store(store: &FlatStore) -> Self {
        Self {
            motor_max_speed: store.get(Param::MotorMaxSpeed) as u8,
            motor_run_time_ms: store.get(Param::MotorRunTimeMs) as u64,
            ramp_up_ms: store.get(Param::RampUpMs) as u64,
            ramp_down_ms: store.get(Param::RampDownMs) as u64,
            stall_timeout_ms: store.get(Param::StallTimeoutMs) as u64,
            pump_speed: store.get(Param::PumpSpeed) as u8,
            pump_timeout_ms: store.get(Param::PumpTimeoutMs) as u64,
            spool_length_mm: store.get(Param::SpoolLengthMm) as u32,
            core_diameter_mm: store.get(Param::CoreDiameterMm),
            media_thickness_um: store.get(Param::MediaThicknessUm) as u32,
            chirp_enabled: store.get(Param::ChirpEnabled) != 0.0,
            alarm_chirp_interval_ms: store.get(Param::AlarmChirpIntervalMs) as u64,
        }
    }
}

/// Heater-module view of the persisted tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeaterTunables {
    pub setpoint_c: f64,
    pub hysteresis_half_c: f64,
    pub runaway_delta_c: f64,
    pub mismatch_tolerance_c: f64,
    pub max_relay_on_ms: u64,
    pub stuck_window_ms: u64,
}

impl HeaterTunables {
    pub fn from_store(store: &FlatStore) -> Self {
        Self {
            setpoint_c: store.get(Param::HeaterSetpointC),
            hysteresis_half_c: store.get(Param::HysteresisHalfC),
            runaway_delta_c: store.get(Param::RunawayDeltaC),
            mismatch_tolerance_c: store.get(Param::MismatchToleranceC),
            max_relay_on_ms: store.get(Param::MaxRelayOnMs) as u64,
            stuck_window_ms: store.get(Param::StuckWindowMs) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_constrains_to_documented_bounds() {
        assert_eq!(Param::MotorMaxSpeed.clamp(20.0), 50.0);
        assert_eq!(Param::MotorMaxSpeed.clamp(300.0), 255.0);
        assert_eq!(Param::MotorMaxSpeed.clamp(128.0), 128.0);
    }

    #[test]
    fn wire_aliases_resolve_to_the_same_param() {
        assert_eq!(Param::from_wire("motor_speed"), Some(Param::MotorMaxSpeed));
        assert_eq!(
            Param::from_wire("motor_max_speed"),
            Some(Param::MotorMaxSpeed)
        );
        assert_eq!(Param::from_wire("not_a_param"), None);
    }

    #[test]
    fn every_default_is_in_range() {
        for param in ALL_PARAMS {
            let (lo, hi) = param.range();
            let default = param.default_value();
            assert!(default >= lo && default <= hi, "{param:?}");
        }
    }
}
