use reefbus::config::Param;
use reefbus::modules::heater::{HeaterCondition, RUNAWAY_HOLD_MS};
use reefbus::modules::{HeaterInputs, HeaterModule, ModuleController};
use reefbus::protocol::{Command, FrameBody};
use reefbus::store::FlatStore;

fn heater() -> HeaterModule {
    HeaterModule::new("heater-1", FlatStore::in_memory())
}

fn both(temp: f64) -> HeaterInputs {
    HeaterInputs {
        primary_c: Some(temp),
        secondary_c: Some(temp),
    }
}

fn step(m: &mut HeaterModule, now_ms: u64, inputs: HeaterInputs) -> Vec<reefbus::Frame> {
    m.ingest_inputs(inputs);
    m.tick(now_ms)
}

#[test]
fn test_any_lockout_condition_forces_the_relay_open() {
    // Each lockout source on a fresh module; the relay must open in all
    // of them even when the thermostat still wants heat.
    let mut m = heater();
    step(&mut m, 0, both(20.0));
    assert!(m.relay_on());
    step(&mut m, 1_000, HeaterInputs::default());
    assert!(!m.relay_on());
    assert!(m.locked_out());

    let mut m = heater();
    step(&mut m, 0, both(28.0));
    step(&mut m, RUNAWAY_HOLD_MS, both(28.0));
    assert!(m.locked_out());
    assert!(!m.relay_on());
}

#[test]
fn test_status_payload_over_a_lockout_and_recovery() {
    let mut m = heater();
    step(&mut m, 0, both(28.0));
    step(&mut m, RUNAWAY_HOLD_MS, both(28.0));

    m.ingest_inputs(both(28.0));
    let frames = m.tick(RUNAWAY_HOLD_MS + 1_000);
    let status = frames
        .iter()
        .find_map(|f| match &f.body {
            FrameBody::Status(v) => Some(v.clone()),
            _ => None,
        })
        .expect("heartbeat status");
    let sub = &status["subsystems"][0];
    assert_eq!(sub["state"], "locked");
    assert_eq!(sub["badge"], "alarm");
    assert_eq!(sub["visible_alarm"], "thermal_runaway");
    assert_eq!(status["alarms"][0]["code"], "thermal_runaway");

    // Recovery: condition clears, push event emitted, thermostat resumes.
    let frames = step(&mut m, RUNAWAY_HOLD_MS + 60_000, both(24.0));
    assert!(frames
        .iter()
        .any(|f| matches!(&f.body, FrameBody::Alarm(a) if a.code == "thermal_runaway" && !a.active)));
    assert!(!m.locked_out());
    assert!(m.relay_on(), "24.0 is below the band, heating resumes");
}

#[test]
fn test_mismatch_is_advisory_not_lockout() {
    let mut m = heater();
    let frames = step(
        &mut m,
        0,
        HeaterInputs {
            primary_c: Some(23.0),
            secondary_c: Some(25.0),
        },
    );
    assert!(m.condition_active(HeaterCondition::ThermistorMismatch));
    assert!(!m.locked_out());
    // Average 24.0 is below the band: still heating.
    assert!(m.relay_on());
    let alarm = frames
        .iter()
        .find_map(|f| match &f.body {
            FrameBody::Alarm(a) => Some(a.clone()),
            _ => None,
        })
        .expect("mismatch alarm");
    assert_eq!(alarm.code, "thermistor_mismatch");
    assert_eq!(alarm.severity, reefbus::protocol::Severity::Warning);
}

#[test]
fn test_tightened_tolerance_applies_immediately() {
    let mut m = heater();
    let split = HeaterInputs {
        primary_c: Some(24.5),
        secondary_c: Some(25.0),
    };
    step(&mut m, 0, split);
    assert!(!m.condition_active(HeaterCondition::ThermistorMismatch));

    m.handle_command(
        &Command::SetParam {
            param: Param::MismatchToleranceC,
            value: 0.2,
        },
        1_000,
    );
    step(&mut m, 2_000, split);
    assert!(m.condition_active(HeaterCondition::ThermistorMismatch));
}

#[test]
fn test_probe_flap_emits_paired_transitions() {
    let mut m = heater();
    let one = HeaterInputs {
        primary_c: Some(24.0),
        secondary_c: None,
    };
    let frames = step(&mut m, 0, one);
    assert_eq!(alarm_events(&frames, "probe_offline"), vec![true]);

    // Same condition again: no duplicate push.
    let frames = step(&mut m, 1_000, one);
    assert!(alarm_events(&frames, "probe_offline").is_empty());

    let frames = step(&mut m, 2_000, both(24.0));
    assert_eq!(alarm_events(&frames, "probe_offline"), vec![false]);

    let frames = step(&mut m, 3_000, one);
    assert_eq!(alarm_events(&frames, "probe_offline"), vec![true]);
}

#[test]
fn test_duty_cycle_tracks_relay_history() {
    let mut m = heater();
    // Ten ticks heating, ten ticks idle-hot.
    for tick in 0..10u64 {
        step(&mut m, tick * 1_000, both(24.0));
        assert!(m.relay_on());
    }
    for tick in 10..20u64 {
        step(&mut m, tick * 1_000, both(25.5));
        assert!(!m.relay_on());
    }
    m.ingest_inputs(both(25.5));
    let frames = m.tick(20_000);
    let status = frames
        .iter()
        .find_map(|f| match &f.body {
            FrameBody::Status(v) => Some(v.clone()),
            _ => None,
        })
        .expect("status");
    let duty = status["subsystems"][0]["safety"]["duty_cycle_percent"]
        .as_f64()
        .unwrap();
    assert!(duty > 30.0 && duty < 60.0, "duty was {duty}");
}

fn alarm_events(frames: &[reefbus::Frame], code: &str) -> Vec<bool> {
    frames
        .iter()
        .filter_map(|f| match &f.body {
            FrameBody::Alarm(a) if a.code == code => Some(a.active),
            _ => None,
        })
        .collect()
}
