use reefbus::config::Param;
use reefbus::modules::{ModuleController, RollerModule};
use reefbus::protocol::{
    Command, EnvelopeCodec, Frame, FrameBody, ProtocolError, MAX_FRAME_SIZE,
};
use reefbus::store::FlatStore;

fn roller() -> RollerModule {
    RollerModule::new("roller-1", FlatStore::in_memory())
}

#[test]
fn test_status_frame_survives_the_wire() {
    let mut module = roller();
    let mut codec = EnvelopeCodec::new();

    let frames = module.tick(1_000);
    let status = frames
        .iter()
        .find(|f| matches!(f.body, FrameBody::Status(_)))
        .expect("heartbeat status");

    let line = codec.encode(status).unwrap().to_string();
    let decoded = codec.decode(&line).unwrap();
    assert_eq!(decoded.module_id, "roller-1");
    match decoded.body {
        FrameBody::Status(payload) => {
            assert_eq!(payload["motor"]["state"], "stopped");
            assert!(payload["spool"]["full_edges"].as_u64().unwrap() > 0);
            // Envelope defaults flow into the payload on decode.
            assert_eq!(payload["module_id"], "roller-1");
        }
        other => panic!("unexpected body {other:?}"),
    }
}

#[test]
fn test_wire_set_param_lands_clamped() {
    let mut module = roller();
    let codec = EnvelopeCodec::new();

    let raw = r#"{"protocol":"1","module_id":"hub","type":"control","command":"set_param","sent_at":5,"payload":{"param":"motor_max_speed","value":9000}}"#;
    let frame = codec.decode(raw).unwrap();
    let FrameBody::Control(command) = frame.body else {
        panic!("expected control frame");
    };

    let responses = module.handle_command(&command, 1_000);
    let config = responses
        .iter()
        .find_map(|f| match &f.body {
            FrameBody::Config(v) => Some(v.clone()),
            _ => None,
        })
        .expect("config response");
    assert_eq!(config["motor"]["max_speed"], 255);
}

#[test]
fn test_batch_set_applies_every_entry() {
    let mut module = roller();
    let codec = EnvelopeCodec::new();

    let raw = r#"{"type":"set_param","parameters":{"motor_runtime":8000,"ramp_up_ms":500,"pump_timeout_ms":90000}}"#;
    let frame = codec.decode(raw).unwrap();
    let FrameBody::Control(command) = frame.body else {
        panic!("expected control frame");
    };

    let responses = module.handle_command(&command, 1_000);
    let config = responses
        .iter()
        .find_map(|f| match &f.body {
            FrameBody::Config(v) => Some(v.clone()),
            _ => None,
        })
        .expect("config response");
    assert_eq!(config["motor"]["run_time_ms"], 8_000);
    assert_eq!(config["motor"]["ramp_up_ms"], 500);
    assert_eq!(config["ato"]["pump_timeout_ms"], 90_000);
}

#[test]
fn test_protocol_mismatch_never_reaches_the_module() {
    let codec = EnvelopeCodec::new();
    // Payload is garbage on purpose: the version gate must fire first.
    let raw = r#"{"protocol":"9","type":"control","command":"set_param","payload":{"param":42}}"#;
    assert!(matches!(
        codec.decode(raw),
        Err(ProtocolError::ProtocolMismatch(_))
    ));
}

#[test]
fn test_oversized_frame_rejected() {
    let codec = EnvelopeCodec::new();
    let raw = format!(
        r#"{{"type":"status","payload":{{"blob":"{}"}}}}"#,
        "x".repeat(MAX_FRAME_SIZE)
    );
    assert_eq!(codec.decode(&raw), Err(ProtocolError::MessageTooLarge));
}

#[test]
fn test_legacy_flat_frame_and_alias_pair() {
    let mut module = roller();
    let codec = EnvelopeCodec::new();

    // Old firmware shape: no envelope, bare command type, both name keys.
    let raw = r#"{"type":"set_param","param":"motor_speed","name":"motor_max_speed","value":200}"#;
    let frame = codec.decode(raw).unwrap();
    let FrameBody::Control(command) = frame.body else {
        panic!("expected control frame");
    };
    assert_eq!(
        command,
        Command::SetParam {
            param: Param::MotorMaxSpeed,
            value: 200.0
        }
    );

    module.handle_command(&command, 1_000);
    let frames = module.handle_command(&Command::RequestConfig, 2_000);
    let config = frames
        .iter()
        .find_map(|f| match &f.body {
            FrameBody::Config(v) => Some(v.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(config["motor"]["max_speed"], 200);
}

#[test]
fn test_control_frames_round_trip_for_every_trigger_param() {
    let mut codec = EnvelopeCodec::new();
    let commands = [
        Command::SpoolReset { value: 1 },
        Command::CalibrateStart,
        Command::CalibrateFinish {
            roll_length_mm: 50_000,
        },
        Command::CalibrateCancel,
        Command::MarkRefilled,
    ];
    for command in commands {
        let frame = Frame::control("roller-1", 7, command.clone());
        let line = codec.encode(&frame).unwrap().to_string();
        let decoded = codec.decode(&line).unwrap();
        assert_eq!(decoded.body, FrameBody::Control(command));
    }
}
