use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{App, Arg, SubCommand};
use colored::*;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time;
use tracing::{debug, error, info, warn};

use reefbus::hub::HubDispatcher;
use reefbus::modules::{
    HeaterInputs, HeaterModule, ModuleController, RollerInputs, RollerModule,
};
use reefbus::protocol::{Command, EnvelopeCodec, Frame, FrameBody};
use reefbus::store::FlatStore;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8765";
/// Modules keep their control loop running and retry the hub link at
/// this cadence when it drops.
const RECONNECT_DELAY_MS: u64 = 3_000;
const TICK_PERIOD_MS: u64 = 1_000;
const FRAME_CHANNEL_SIZE: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("reefbus")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Aquarium peripheral coordinator: hub and module simulators")
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Hub host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Hub TCP port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("hub")
                .about("Run the central hub: mirrors module state, issues commands"),
        )
        .subcommand(
            SubCommand::with_name("roller")
                .about("Run a simulated roller-filter module")
                .arg(
                    Arg::with_name("module-id")
                        .long("module-id")
                        .value_name("ID")
                        .takes_value(true)
                        .default_value("roller-1"),
                )
                .arg(
                    Arg::with_name("store")
                        .long("store")
                        .value_name("FILE")
                        .help("Persisted tunable store (defaults to <module-id>.json)")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("heater")
                .about("Run a simulated heater module")
                .arg(
                    Arg::with_name("module-id")
                        .long("module-id")
                        .value_name("ID")
                        .takes_value(true)
                        .default_value("heater-1"),
                )
                .arg(
                    Arg::with_name("store")
                        .long("store")
                        .value_name("FILE")
                        .takes_value(true),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap().to_string();
    let port: u16 = matches.value_of("port").unwrap().parse()?;

    match matches.subcommand() {
        ("hub", _) => run_hub(port).await,
        ("roller", Some(sub)) => {
            let module_id = sub.value_of("module-id").unwrap().to_string();
            let store = open_store(sub.value_of("store"), &module_id)?;
            let module = RollerModule::new(&module_id, store);
            let sim = roller_simulation();
            run_module(module, format!("{host}:{port}"), sim).await
        }
        ("heater", Some(sub)) => {
            let module_id = sub.value_of("module-id").unwrap().to_string();
            let store = open_store(sub.value_of("store"), &module_id)?;
            let module = HeaterModule::new(&module_id, store);
            let sim = heater_simulation();
            run_module(module, format!("{host}:{port}"), sim).await
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage.".yellow());
            println!("  {}  start the hub", "reefbus hub".bright_cyan());
            println!("  {}  attach a filter module", "reefbus roller".bright_cyan());
            println!("  {}  attach a heater module", "reefbus heater".bright_cyan());
            Ok(())
        }
    }
}

fn open_store(path: Option<&str>, module_id: &str) -> Result<FlatStore, reefbus::StoreError> {
    let path = path
        .map(str::to_string)
        .unwrap_or_else(|| format!("{module_id}.json"));
    FlatStore::open(path)
}

// ---------------------------------------------------------------------------
// Hub

async fn run_hub(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "Reef peripheral hub".bright_blue().bold());

    let hub = Arc::new(Mutex::new(HubDispatcher::new()));
    let writers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let start = Instant::now();

    // Housekeeping: staleness marking, deferred config requests, and a
    // periodic console summary.
    let tick_hub = Arc::clone(&hub);
    let tick_writers = Arc::clone(&writers);
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_millis(TICK_PERIOD_MS));
        let mut codec = EnvelopeCodec::new();
        let mut ticks: u64 = 0;
        loop {
            interval.tick().await;
            ticks += 1;
            let now_ms = start.elapsed().as_millis() as u64;
            let actions = {
                let mut hub = tick_hub.lock().await;
                hub.tick(now_ms)
            };
            for action in actions {
                let reefbus::hub::HubAction::SendConfigRequest { module_id } = action;
                let frame = Frame::control(&module_id, now_ms, Command::RequestConfig);
                let line = match codec.encode(&frame) {
                    Ok(line) => line.to_string(),
                    Err(err) => {
                        error!(%err, "failed to encode config request");
                        continue;
                    }
                };
                let writers = tick_writers.lock().await;
                if let Some(tx) = writers.get(&module_id) {
                    if tx.send(line).is_err() {
                        debug!(module = %module_id, "writer gone, config request dropped");
                    }
                }
            }
            if ticks % 10 == 0 {
                print_summary(&tick_hub).await;
            }
        }
    });

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!(port, "hub listening");
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(%addr, "module link opened");
                let hub = Arc::clone(&hub);
                let writers = Arc::clone(&writers);
                tokio::spawn(async move {
                    if let Err(err) = handle_module_link(stream, hub, writers, start).await {
                        warn!(%addr, %err, "module link error");
                    }
                    info!(%addr, "module link closed");
                });
            }
            Err(err) => error!(%err, "accept failed"),
        }
    }
}

async fn handle_module_link(
    stream: TcpStream,
    hub: Arc<Mutex<HubDispatcher>>,
    writers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>,
    start: Instant,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let codec = EnvelopeCodec::new();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if writer.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let mut registered: Option<String> = None;
    let mut line = String::new();
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let now_ms = start.elapsed().as_millis() as u64;
                match codec.decode(trimmed) {
                    Ok(frame) => {
                        if registered.as_deref() != Some(frame.module_id.as_str()) {
                            writers
                                .lock()
                                .await
                                .insert(frame.module_id.clone(), tx.clone());
                            registered = Some(frame.module_id.clone());
                        }
                        let mut hub = hub.lock().await;
                        hub.ingest(&frame, now_ms);
                    }
                    // Malformed frames never take the link down.
                    Err(err) => warn!(%err, "dropping bad frame"),
                }
            }
            Err(err) => {
                warn!(%err, "link read failed");
                break;
            }
        }
    }

    writer_task.abort();
    Ok(())
}

async fn print_summary(hub: &Arc<Mutex<HubDispatcher>>) {
    let hub = hub.lock().await;
    for record in hub.modules() {
        let link = if record.connected {
            "online".bright_green()
        } else {
            "stale".bright_red()
        };
        let alarms = if record.alarms.is_empty() {
            "no alarms".dimmed()
        } else {
            format!("{} alarm(s)", record.alarms.len()).bright_yellow()
        };
        println!(
            "  {} [{}] {}",
            HubDispatcher::display_name(record).bright_white(),
            link,
            alarms
        );
    }
}

// ---------------------------------------------------------------------------
// Module clients

/// Drive one module: a 1 Hz control loop that never stops, plus a hub
/// link that reconnects in the background. Frames emitted while the link
/// is down simply fall off the buffer; the next status heartbeat catches
/// the hub up.
async fn run_module<M, F>(
    module: M,
    hub_addr: String,
    mut simulate: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    M: ModuleController + 'static,
    F: FnMut(&mut M, u64) + Send + 'static,
{
    let module_id = module.module_id().to_string();
    println!(
        "{} {}",
        "Module controller starting:".bright_blue().bold(),
        module_id.bright_white()
    );

    let module = Arc::new(Mutex::new(module));
    let start = Instant::now();
    let (frame_tx, _) = broadcast::channel::<String>(FRAME_CHANNEL_SIZE);

    let loop_module = Arc::clone(&module);
    let loop_tx = frame_tx.clone();
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_millis(TICK_PERIOD_MS));
        let mut codec = EnvelopeCodec::new();
        loop {
            interval.tick().await;
            let now_ms = start.elapsed().as_millis() as u64;
            let frames = {
                let mut module = loop_module.lock().await;
                simulate(&mut *module, now_ms);
                module.tick(now_ms)
            };
            send_frames(&mut codec, &loop_tx, &frames);
        }
    });

    loop {
        match TcpStream::connect(&hub_addr).await {
            Ok(stream) => {
                info!(addr = %hub_addr, "hub link up");
                let rx = frame_tx.subscribe();
                if let Err(err) =
                    drive_hub_link(stream, Arc::clone(&module), frame_tx.clone(), rx, start).await
                {
                    warn!(%err, "hub link dropped");
                }
            }
            Err(err) => {
                debug!(%err, "hub unreachable, retrying");
            }
        }
        time::sleep(Duration::from_millis(RECONNECT_DELAY_MS)).await;
    }
}

async fn drive_hub_link<M: ModuleController>(
    stream: TcpStream,
    module: Arc<Mutex<M>>,
    frame_tx: broadcast::Sender<String>,
    mut frame_rx: broadcast::Receiver<String>,
    start: Instant,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        tokio::select! {
            outbound = frame_rx.recv() => {
                match outbound {
                    Ok(frame_line) => {
                        writer.write_all(frame_line.as_bytes()).await?;
                        writer.write_all(b"\n").await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "outbound buffer lagged while offline");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
            inbound = buf_reader.read_line(&mut line) => {
                match inbound {
                    Ok(0) => return Ok(()),
                    Ok(_) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            handle_inbound(trimmed, &module, &frame_tx, start).await;
                        }
                        line.clear();
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }
}

async fn handle_inbound<M: ModuleController>(
    raw: &str,
    module: &Arc<Mutex<M>>,
    frame_tx: &broadcast::Sender<String>,
    start: Instant,
) {
    let codec = EnvelopeCodec::new();
    match codec.decode(raw) {
        Ok(frame) => match frame.body {
            FrameBody::Control(command) => {
                let now_ms = start.elapsed().as_millis() as u64;
                let responses = {
                    let mut module = module.lock().await;
                    module.handle_command(&command, now_ms)
                };
                let mut out_codec = EnvelopeCodec::new();
                send_frames(&mut out_codec, frame_tx, &responses);
            }
            other => debug!(frame_type = other.type_name(), "ignoring non-control frame"),
        },
        Err(err) => warn!(%err, "dropping bad inbound frame"),
    }
}

fn send_frames(codec: &mut EnvelopeCodec, tx: &broadcast::Sender<String>, frames: &[Frame]) {
    for frame in frames {
        match codec.encode(frame) {
            Ok(line) => {
                // No receiver means the link is down; drop and move on.
                let _ = tx.send(line.to_string());
            }
            Err(err) => error!(%err, "failed to encode frame"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sensor simulations

/// Scripted roller plumbing: the mechanism float trips periodically and
/// the encoder follows the commanded speed, so the module exercises whole
/// run cycles end to end.
fn roller_simulation() -> impl FnMut(&mut RollerModule, u64) + Send {
    let mut reservoir_mm: f64 = 80.0;
    move |module, now_ms| {
        let tick = now_ms / TICK_PERIOD_MS;
        let float_main = tick % 45 < 3;

        // The reservoir evaporates slowly and refills while the pump runs.
        if module.pump_running() {
            reservoir_mm += 2.0;
        } else {
            reservoir_mm -= 0.05;
        }
        let float_min = reservoir_mm < 60.0;
        let float_max = reservoir_mm >= 100.0;

        let encoder_edges = if module.current_speed() > 0 {
            u64::from(module.current_speed()) * 2
        } else {
            0
        };
        module.ingest_inputs(
            RollerInputs {
                float_main,
                float_min,
                float_max,
                encoder_edges,
                button_presses: 0,
            },
            now_ms,
        );
    }
}

/// First-order tank thermal model: the water drifts toward ambient and
/// the element pushes it back up.
fn heater_simulation() -> impl FnMut(&mut HeaterModule, u64) + Send {
    let mut water_c: f64 = 23.5;
    move |module, _now_ms| {
        if module.relay_on() {
            water_c += 0.03;
        } else {
            water_c -= 0.01;
        }
        water_c = water_c.clamp(18.0, 34.0);
        module.ingest_inputs(HeaterInputs {
            primary_c: Some(water_c + 0.02),
            secondary_c: Some(water_c - 0.02),
        });
    }
}
