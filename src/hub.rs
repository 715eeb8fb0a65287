use std::collections::HashMap;
use std::collections::VecDeque;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Param;
use crate::protocol::{AlarmPayload, Command, CycleLogPayload, Frame, FrameBody};

/// A module that has not pushed anything for this long is shown stale.
pub const SILENCE_WINDOW_MS: u64 = 5_000;
/// Wait for the module's first burst to settle before asking for config.
pub const SETTLE_DELAY_MS: u64 = 500;

const MAX_USAGE_ENTRIES: usize = 5_000;
const MAX_CYCLE_ENTRIES: usize = 50;

/// One derived media-consumption sample, computed from the difference
/// between consecutive status frames rather than trusted from the module.
#[derive(Debug, Clone, PartialEq)]
pub struct SpoolUsageEntry {
    pub module_id: String,
    pub delta_edges: f64,
    pub delta_mm: f64,
    pub total_used_edges: f64,
    pub recorded_at_ms: u64,
}

/// Everything the hub mirrors for one module. Created lazily on the first
/// frame received; identity is whatever the module claims in its envelope.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRecord {
    pub module_id: String,
    /// Friendly name, taken from the module's status payload when it
    /// advertises one.
    pub label: Option<String>,
    pub connected: bool,
    pub last_seen_ms: u64,
    pub status: Option<Value>,
    pub config: Option<Value>,
    pub alarms: Vec<AlarmPayload>,
    pub cycle_log: VecDeque<CycleLogPayload>,
    config_request_at_ms: Option<u64>,
    last_spool_used_edges: Option<f64>,
}

/// Side effects the caller must carry out on the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum HubAction {
    SendConfigRequest { module_id: String },
}

/// Central mirror of every known module. The hub never blocks on a
/// module: commands are fire-and-forget and state converges from the
/// periodic status frames.
#[derive(Debug, Default)]
pub struct HubDispatcher {
    records: HashMap<String, ConnectionRecord>,
    usage: VecDeque<SpoolUsageEntry>,
}

impl HubDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one inbound frame into the mirror.
    pub fn ingest(&mut self, frame: &Frame, now_ms: u64) {
        let record = self
            .records
            .entry(frame.module_id.clone())
            .or_insert_with(|| {
                info!(module = %frame.module_id, "new module registered");
                ConnectionRecord {
                    module_id: frame.module_id.clone(),
                    ..ConnectionRecord::default()
                }
            });

        if !record.connected {
            // New or returning module: let its boot burst settle, then
            // pull the authoritative config.
            record.config_request_at_ms = Some(now_ms + SETTLE_DELAY_MS);
            record.connected = true;
        }
        record.last_seen_ms = now_ms;

        match &frame.body {
            FrameBody::Status(payload) => {
                Self::derive_spool_usage(
                    &mut self.usage,
                    record,
                    payload,
                    now_ms,
                );
                if let Some(label) = payload.get("label").and_then(Value::as_str) {
                    record.label = Some(label.to_string());
                }
                // Complete replacement, never a merge.
                record.status = Some(payload.clone());
            }
            FrameBody::Config(payload) => {
                record.config = Some(payload.clone());
            }
            FrameBody::Alarm(alarm) => {
                record.alarms.retain(|a| a.code != alarm.code);
                if alarm.active {
                    record.alarms.push(alarm.clone());
                }
            }
            FrameBody::CycleLog(entry) => {
                if record.cycle_log.len() >= MAX_CYCLE_ENTRIES {
                    record.cycle_log.pop_front();
                }
                record.cycle_log.push_back(entry.clone());
            }
            FrameBody::Control(command) => {
                debug!(module = %frame.module_id, ?command, "ignoring control frame from module");
            }
            FrameBody::Unknown(name) => {
                debug!(module = %frame.module_id, frame_type = %name, "ignoring unknown frame");
            }
        }
    }

    /// Periodic housekeeping: mark silent modules stale and surface the
    /// config requests whose settle delay has elapsed.
    pub fn tick(&mut self, now_ms: u64) -> Vec<HubAction> {
        let mut actions = Vec::new();
        for record in self.records.values_mut() {
            if record.connected
                && now_ms.saturating_sub(record.last_seen_ms) > SILENCE_WINDOW_MS
            {
                warn!(module = %record.module_id, "module went silent");
                record.connected = false;
                record.config_request_at_ms = None;
            }
            if let Some(due) = record.config_request_at_ms {
                if now_ms >= due {
                    record.config_request_at_ms = None;
                    actions.push(HubAction::SendConfigRequest {
                        module_id: record.module_id.clone(),
                    });
                }
            }
        }
        actions
    }

    /// Build control frames for every connected module, optionally
    /// narrowed to one module id. Delivery is fire-and-forget.
    pub fn broadcast(
        &self,
        command: &Command,
        only_module: Option<&str>,
        now_ms: u64,
    ) -> Vec<Frame> {
        self.records
            .values()
            .filter(|r| r.connected)
            .filter(|r| only_module.is_none_or(|id| r.module_id == id))
            .map(|r| Frame::control(&r.module_id, now_ms, command.clone()))
            .collect()
    }

    /// Clamp a parameter write before it ever leaves the hub, mirroring
    /// what the module will do on receipt.
    pub fn set_param_command(param: Param, value: f64) -> Command {
        let clamped = param.clamp(value);
        if clamped != value {
            debug!(param = param.wire_name(), value, clamped, "clamping outbound parameter");
        }
        Command::SetParam {
            param,
            value: clamped,
        }
    }

    pub fn module(&self, module_id: &str) -> Option<&ConnectionRecord> {
        self.records.get(module_id)
    }

    /// Display name for a record: the advertised label, else the id.
    pub fn display_name(record: &ConnectionRecord) -> &str {
        record.label.as_deref().unwrap_or(&record.module_id)
    }

    pub fn modules(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.values()
    }

    pub fn usage_entries(&self, module_id: Option<&str>) -> Vec<&SpoolUsageEntry> {
        self.usage
            .iter()
            .filter(|e| module_id.is_none_or(|id| e.module_id == id))
            .collect()
    }

    /// Media consumption is derived from the movement of `used_edges`
    /// between consecutive status frames. Non-positive deltas (restarts,
    /// resets) and full-roll jumps (recalibration) are discarded as noise.
    fn derive_spool_usage(
        usage: &mut VecDeque<SpoolUsageEntry>,
        record: &mut ConnectionRecord,
        payload: &Value,
        now_ms: u64,
    ) {
        let Some(spool) = payload.get("spool") else {
            return;
        };
        let used = spool.get("used_edges").and_then(Value::as_f64);
        let full = spool.get("full_edges").and_then(Value::as_f64);
        let total_length_mm = spool.get("total_length_mm").and_then(Value::as_f64);
        let (Some(used), Some(full), Some(total_length_mm)) = (used, full, total_length_mm)
        else {
            return;
        };

        let previous = record.last_spool_used_edges.replace(used);
        let Some(previous) = previous else {
            return;
        };
        let delta_edges = used - previous;
        if delta_edges <= 0.0 || full <= 0.0 {
            return;
        }
        let mm_per_edge = total_length_mm / full;
        let delta_mm = delta_edges * mm_per_edge;
        if delta_mm > total_length_mm {
            debug!(module = %record.module_id, delta_mm, "discarding implausible usage delta");
            return;
        }
        if usage.len() >= MAX_USAGE_ENTRIES {
            usage.pop_front();
        }
        usage.push_back(SpoolUsageEntry {
            module_id: record.module_id.clone(),
            delta_edges,
            delta_mm,
            total_used_edges: used,
            recorded_at_ms: now_ms,
        });
    }
}
