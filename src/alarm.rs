use heapless::Vec;
use serde_json::Value;
use tracing::info;

use crate::protocol::{AlarmPayload, Severity};

pub const MAX_ALARMS: usize = 16;

#[derive(Debug, Clone)]
struct AlarmRecord {
    code: String,
    severity: Severity,
    message: String,
    meta: Option<Value>,
    active: bool,
    /// Deadline for the next reminder chirp; None while inactive.
    next_reminder_ms: Option<u64>,
}

/// Tracks per-code alarm assert/clear state for one module and schedules
/// reminder chirps. Each transition is emitted exactly once; at most one
/// outstanding reminder exists per active code.
#[derive(Debug, Default)]
pub struct AlarmManager {
    records: Vec<AlarmRecord, MAX_ALARMS>,
}

impl AlarmManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assert an alarm. Returns the push event only on the inactive→active
    /// transition; re-asserting an active alarm refreshes its metadata.
    pub fn assert(
        &mut self,
        code: &str,
        severity: Severity,
        message: &str,
        meta: Option<Value>,
        now_ms: u64,
        reminder_interval_ms: u64,
    ) -> Option<AlarmPayload> {
        if let Some(record) = self.records.iter_mut().find(|r| r.code == code) {
            if record.active {
                record.meta = meta;
                return None;
            }
            record.active = true;
            record.severity = severity;
            record.message = message.to_string();
            record.meta = meta.clone();
            record.next_reminder_ms = Some(now_ms + reminder_interval_ms);
        } else {
            let record = AlarmRecord {
                code: code.to_string(),
                severity,
                message: message.to_string(),
                meta: meta.clone(),
                active: true,
                next_reminder_ms: Some(now_ms + reminder_interval_ms),
            };
            if self.records.push(record).is_err() {
                // Oldest inactive record makes room; active ones are kept.
                if let Some(idx) = self.records.iter().position(|r| !r.active) {
                    self.records.remove(idx);
                    let _ = self.records.push(AlarmRecord {
                        code: code.to_string(),
                        severity,
                        message: message.to_string(),
                        meta: meta.clone(),
                        active: true,
                        next_reminder_ms: Some(now_ms + reminder_interval_ms),
                    });
                }
            }
        }
        info!(code, "alarm asserted");
        Some(AlarmPayload {
            code: code.to_string(),
            severity,
            active: true,
            timestamp_s: now_ms / 1000,
            message: message.to_string(),
            meta,
        })
    }

    /// Clear an alarm. Returns the push event only on the active→inactive
    /// transition and cancels the outstanding reminder.
    pub fn clear(&mut self, code: &str, now_ms: u64) -> Option<AlarmPayload> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.code == code && r.active)?;
        record.active = false;
        record.next_reminder_ms = None;
        info!(code, "alarm cleared");
        Some(AlarmPayload {
            code: record.code.clone(),
            severity: record.severity,
            active: false,
            timestamp_s: now_ms / 1000,
            message: record.message.clone(),
            meta: record.meta.take(),
        })
    }

    /// Advance reminder timers. Returns the codes whose chirp is due; each
    /// due code is rescheduled one interval out.
    pub fn tick(&mut self, now_ms: u64, reminder_interval_ms: u64) -> std::vec::Vec<String> {
        let mut due = std::vec::Vec::new();
        for record in self.records.iter_mut().filter(|r| r.active) {
            if let Some(deadline) = record.next_reminder_ms {
                if now_ms >= deadline {
                    due.push(record.code.clone());
                    record.next_reminder_ms = Some(now_ms + reminder_interval_ms);
                }
            }
        }
        due
    }

    pub fn is_active(&self, code: &str) -> bool {
        self.records.iter().any(|r| r.code == code && r.active)
    }

    /// Currently-active alarms, mirrored into the periodic status payload
    /// so an observer that missed a push event recovers on the next tick.
    pub fn active_snapshot(&self) -> std::vec::Vec<Value> {
        self.records
            .iter()
            .filter(|r| r.active)
            .map(|r| {
                serde_json::json!({
                    "code": r.code,
                    "severity": r.severity,
                    "active": true,
                    "message": r.message,
                    "meta": r.meta,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: u64 = 60_000;

    #[test]
    fn assert_and_clear_emit_exactly_once() {
        let mut alarms = AlarmManager::new();
        assert!(alarms
            .assert("roller_empty", Severity::Critical, "spool empty", None, 0, INTERVAL)
            .is_some());
        assert!(alarms
            .assert("roller_empty", Severity::Critical, "spool empty", None, 100, INTERVAL)
            .is_none());
        assert!(alarms.clear("roller_empty", 200).is_some());
        assert!(alarms.clear("roller_empty", 300).is_none());
    }

    #[test]
    fn reminder_fires_and_reschedules() {
        let mut alarms = AlarmManager::new();
        alarms
            .assert("pump_timeout", Severity::Warning, "pump ran too long", None, 0, INTERVAL)
            .unwrap();
        assert!(alarms.tick(INTERVAL - 1, INTERVAL).is_empty());
        assert_eq!(alarms.tick(INTERVAL, INTERVAL), vec!["pump_timeout"]);
        // Rescheduled one interval out, not immediately due again.
        assert!(alarms.tick(INTERVAL + 1, INTERVAL).is_empty());
        assert_eq!(alarms.tick(2 * INTERVAL, INTERVAL), vec!["pump_timeout"]);
    }

    #[test]
    fn clearing_cancels_the_reminder() {
        let mut alarms = AlarmManager::new();
        alarms
            .assert("pump_timeout", Severity::Warning, "pump ran too long", None, 0, INTERVAL)
            .unwrap();
        alarms.clear("pump_timeout", 10).unwrap();
        assert!(alarms.tick(10 * INTERVAL, INTERVAL).is_empty());
    }

    #[test]
    fn active_snapshot_mirrors_only_active_codes() {
        let mut alarms = AlarmManager::new();
        alarms
            .assert("roller_empty", Severity::Critical, "spool empty", None, 0, INTERVAL)
            .unwrap();
        alarms
            .assert("pump_timeout", Severity::Warning, "pump ran too long", None, 0, INTERVAL)
            .unwrap();
        alarms.clear("pump_timeout", 10).unwrap();
        let snapshot = alarms.active_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0]["code"], "roller_empty");
    }
}
