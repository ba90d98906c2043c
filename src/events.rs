//! Governed transaction event stream.
//!
//! One JSON record per line, appended to the transaction log. Every record
//! carries the ISA-95 hierarchy envelope, a ULID `eventId` that sorts in
//! emission order, and a millisecond UTC timestamp. Emission goes through a
//! bounded queue to a flusher thread that writes and flushes each line
//! before taking the next; a full queue blocks the producer (correctness
//! over availability), and a disk failure is fatal to the simulation.
//!
//! Records that fail governance validation are not written; a
//! `TransactionRejected` record is appended in their place.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::microstops::Fingerprint;
use crate::schedule::ChangeoverType;
use crate::state::{LineState, StopCode};

const EMIT_QUEUE_DEPTH: usize = 256;
const SEEN_ID_HIGH_WATER: usize = 10_000;
const SEEN_ID_LOW_WATER: usize = 5_000;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("failed to open transaction log {path}: {source}")]
    Open { path: String, source: std::io::Error },
    #[error("transaction log writer failed; event stream is no longer durable")]
    WriterFailed,
    #[error("event id generator overflowed within one millisecond")]
    IdOverflow,
}

/// Result classification per bottle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BottleResult {
    Good,
    Reject,
}

/// Cause of a bottle reject, also encoded in the `reject_reason` register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Weight,
    Torque,
    Barcode,
    Label,
    Hazard,
}

impl RejectReason {
    pub fn register_value(self) -> u16 {
        match self {
            RejectReason::Weight => 1,
            RejectReason::Torque => 2,
            RejectReason::Barcode => 3,
            RejectReason::Label => 4,
            RejectReason::Hazard => 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    pub status: String,
    pub version: String,
}

/// Common fields shared by every record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub event_id: String,
    pub ts: String,
    pub enterprise: String,
    pub site: String,
    pub area: String,
    pub line: String,
    pub order_id: Option<String>,
    pub sku: Option<String>,
    pub actor: Actor,
    pub validation: Validation,
}

/// Event-specific payload; the variant name is the `eventType` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum EventPayload {
    #[serde(rename_all = "camelCase")]
    OrderStarted {
        planned_qty: u32,
        planned_start_ts: String,
        planned_end_ts: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    OrderCompleted {
        good_count_delta: u32,
        reject_count_delta: u32,
        duration_ms: u64,
        #[serde(rename = "yield")]
        yield_frac: f64,
    },
    #[serde(rename_all = "camelCase")]
    StateChanged {
        from_state: LineState,
        to_state: LineState,
        stop_code: Option<StopCode>,
        fault_code: Option<StopCode>,
        reason_id: Option<u16>,
        duration_ms: Option<u64>,
        fingerprint: Option<Fingerprint>,
    },
    #[serde(rename_all = "camelCase")]
    BottleCompleted {
        result: BottleResult,
        station: String,
        reject_reason: Option<RejectReason>,
        weight: Option<f64>,
        torque: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    MicrostopStarted { stop_code: StopCode, fingerprint: Fingerprint },
    #[serde(rename_all = "camelCase")]
    MicrostopEnded {
        stop_code: StopCode,
        duration_ms: u64,
        fingerprint: Fingerprint,
    },
    #[serde(rename_all = "camelCase")]
    StopStarted {
        stop_code: StopCode,
        reason_id: Option<u16>,
        reason_text: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StopEnded {
        stop_code: StopCode,
        duration_ms: u64,
        reason_id: Option<u16>,
    },
    #[serde(rename_all = "camelCase")]
    FaultRaised {
        fault_code: StopCode,
        severity: crate::breakdowns::Severity,
        station: String,
    },
    #[serde(rename_all = "camelCase")]
    FaultCleared {
        fault_code: StopCode,
        severity: crate::breakdowns::Severity,
        station: String,
        duration_ms: u64,
    },
    #[serde(rename = "CIPStarted")]
    CipStarted {},
    #[serde(rename = "CIPEnded", rename_all = "camelCase")]
    CipEnded { duration_ms: u64 },
    #[serde(rename_all = "camelCase")]
    ChangeoverStarted {
        changeover_type: ChangeoverType,
        stop_code: StopCode,
    },
    #[serde(rename_all = "camelCase")]
    ChangeoverCompleted {
        changeover_type: ChangeoverType,
        stop_code: StopCode,
        duration_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    TransactionRejected {
        rejected_event_type: String,
        rejected_event_id: String,
        reasons: Vec<String>,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::OrderStarted { .. } => "OrderStarted",
            EventPayload::OrderCompleted { .. } => "OrderCompleted",
            EventPayload::StateChanged { .. } => "StateChanged",
            EventPayload::BottleCompleted { .. } => "BottleCompleted",
            EventPayload::MicrostopStarted { .. } => "MicrostopStarted",
            EventPayload::MicrostopEnded { .. } => "MicrostopEnded",
            EventPayload::StopStarted { .. } => "StopStarted",
            EventPayload::StopEnded { .. } => "StopEnded",
            EventPayload::FaultRaised { .. } => "FaultRaised",
            EventPayload::FaultCleared { .. } => "FaultCleared",
            EventPayload::CipStarted {} => "CIPStarted",
            EventPayload::CipEnded { .. } => "CIPEnded",
            EventPayload::ChangeoverStarted { .. } => "ChangeoverStarted",
            EventPayload::ChangeoverCompleted { .. } => "ChangeoverCompleted",
            EventPayload::TransactionRejected { .. } => "TransactionRejected",
        }
    }

    /// Governance rules applied before a record reaches the log.
    fn validation_failures(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        match self {
            EventPayload::MicrostopEnded { duration_ms, .. } => {
                // A fault override may truncate an episode below the sampled
                // minimum, so only the hard cap is governed here.
                if *duration_ms > 120_000 {
                    reasons.push(format!("microstop durationMs {duration_ms} above cap 120000"));
                }
            }
            EventPayload::MicrostopStarted { stop_code, .. } => {
                if !stop_code.is_microstop() {
                    reasons.push(format!("{stop_code} is not a microstop code"));
                }
            }
            EventPayload::OrderCompleted { yield_frac, .. } => {
                if !(0.0..=1.0).contains(yield_frac) {
                    reasons.push(format!("yield {yield_frac} outside [0, 1]"));
                }
            }
            EventPayload::StateChanged { from_state, to_state, .. } => {
                if from_state == to_state {
                    reasons.push("self-transition".to_string());
                }
            }
            _ => {}
        }
        reasons
    }
}

/// The full on-disk record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// ISA-95 identity stamped onto every record.
#[derive(Debug, Clone)]
pub struct Hierarchy {
    pub enterprise: String,
    pub site: String,
    pub area: String,
    pub line: String,
    pub actor_id: String,
}

struct EmitterState {
    ulid_gen: ulid::Generator,
    last_ts: DateTime<Utc>,
    seen_ids: HashSet<String>,
}

/// Serialises, validates and enqueues records; owns the flusher thread.
pub struct EventEmitter {
    hierarchy: Hierarchy,
    console: bool,
    tx: Option<SyncSender<String>>,
    state: Mutex<EmitterState>,
    write_failed: Arc<AtomicBool>,
    flusher: Option<JoinHandle<()>>,
}

impl EventEmitter {
    pub fn new(path: &Path, hierarchy: Hierarchy, console: bool) -> Result<Self, EmitError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| EmitError::Open {
                    path: path.display().to_string(),
                    source,
                })?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| EmitError::Open { path: path.display().to_string(), source })?;

        let (tx, rx) = sync_channel::<String>(EMIT_QUEUE_DEPTH);
        let write_failed = Arc::new(AtomicBool::new(false));
        let flusher = spawn_flusher(file, rx, Arc::clone(&write_failed));

        Ok(Self {
            hierarchy,
            console,
            tx: Some(tx),
            state: Mutex::new(EmitterState {
                ulid_gen: ulid::Generator::new(),
                last_ts: Utc::now(),
                seen_ids: HashSet::new(),
            }),
            write_failed,
            flusher: Some(flusher),
        })
    }

    /// Append one record. Blocks when the queue is full; fails once the
    /// flusher has lost the disk.
    pub fn emit(
        &self,
        order_id: Option<&str>,
        sku: Option<&str>,
        payload: EventPayload,
    ) -> Result<(), EmitError> {
        let failures = payload.validation_failures();
        if failures.is_empty() {
            self.emit_record(order_id, sku, payload)
        } else {
            let rejected_type = payload.event_type().to_string();
            let rejected_id = self.next_event_id()?;
            warn!(event_type = %rejected_type, reasons = ?failures, "transaction rejected");
            self.emit_record(
                order_id,
                sku,
                EventPayload::TransactionRejected {
                    rejected_event_type: rejected_type,
                    rejected_event_id: rejected_id,
                    reasons: failures,
                },
            )
        }
    }

    fn emit_record(
        &self,
        order_id: Option<&str>,
        sku: Option<&str>,
        payload: EventPayload,
    ) -> Result<(), EmitError> {
        if self.write_failed.load(Ordering::SeqCst) {
            return Err(EmitError::WriterFailed);
        }

        // One lock covers id generation, ordering and the enqueue, so
        // eventId order equals log order.
        let mut state = self.state.lock().expect("emitter mutex poisoned");

        let event_id = state
            .ulid_gen
            .generate()
            .map_err(|_| EmitError::IdOverflow)?
            .to_string();

        if !state.seen_ids.insert(event_id.clone()) {
            warn!(%event_id, "duplicate event suppressed");
            return Ok(());
        }
        if state.seen_ids.len() > SEEN_ID_HIGH_WATER {
            // Bounded idempotency window: keep only the most recent ids.
            let mut ids: Vec<_> = state.seen_ids.drain().collect();
            ids.sort_unstable();
            state.seen_ids = ids.into_iter().rev().take(SEEN_ID_LOW_WATER).collect();
        }

        // Wall clock can step backwards; the log timestamp may not.
        let now = Utc::now().max(state.last_ts);
        state.last_ts = now;

        let event = Event {
            envelope: Envelope {
                event_id,
                ts: now.to_rfc3339_opts(SecondsFormat::Millis, true),
                enterprise: self.hierarchy.enterprise.clone(),
                site: self.hierarchy.site.clone(),
                area: self.hierarchy.area.clone(),
                line: self.hierarchy.line.clone(),
                order_id: order_id.map(String::from),
                sku: sku.map(String::from),
                actor: Actor { kind: "system".to_string(), id: self.hierarchy.actor_id.clone() },
                validation: Validation { status: "ACCEPTED".to_string(), version: "v1".to_string() },
            },
            payload,
        };

        let mut line = serde_json::to_string(&event).expect("event record serialises");
        line.push('\n');
        if self.console {
            debug!(
                event_type = event.payload.event_type(),
                order = event.envelope.order_id.as_deref().unwrap_or("-"),
                "event"
            );
        }

        self.tx
            .as_ref()
            .ok_or(EmitError::WriterFailed)?
            .send(line)
            .map_err(|_| EmitError::WriterFailed)
    }

    fn next_event_id(&self) -> Result<String, EmitError> {
        let mut state = self.state.lock().expect("emitter mutex poisoned");
        Ok(state.ulid_gen.generate().map_err(|_| EmitError::IdOverflow)?.to_string())
    }

    /// Drain the queue and join the flusher. Reports a writer failure that
    /// happened after the last successful `emit`.
    pub fn close(mut self) -> Result<(), EmitError> {
        drop(self.tx.take());
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
        if self.write_failed.load(Ordering::SeqCst) {
            return Err(EmitError::WriterFailed);
        }
        Ok(())
    }
}

impl Drop for EventEmitter {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_flusher(file: File, rx: Receiver<String>, failed: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("txn-flusher".to_string())
        .spawn(move || {
            let mut writer = BufWriter::new(file);
            while let Ok(line) = rx.recv() {
                // The record arrives newline-terminated; one write + flush
                // per event keeps the log free of torn lines.
                let result = writer.write_all(line.as_bytes()).and_then(|()| writer.flush());
                if let Err(e) = result {
                    error!("transaction log append failed: {e}");
                    failed.store(true, Ordering::SeqCst);
                    break;
                }
            }
            let _ = writer.flush();
        })
        .expect("spawn txn-flusher thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use ulid::Ulid;

    fn hierarchy() -> Hierarchy {
        Hierarchy {
            enterprise: "Aerogen".into(),
            site: "Shannon".into(),
            area: "Bottling".into(),
            line: "Line01".into(),
            actor_id: "sim01".into(),
        }
    }

    fn read_events(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn records_carry_the_full_envelope() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transactions.jsonl");
        let emitter = EventEmitter::new(&path, hierarchy(), false).unwrap();

        emitter
            .emit(
                Some("ORD-001"),
                Some("LEM-500-IE"),
                EventPayload::OrderStarted {
                    planned_qty: 4000,
                    planned_start_ts: "2026-08-02T06:00:00.000Z".into(),
                    planned_end_ts: None,
                },
            )
            .unwrap();
        emitter.close().unwrap();

        let events = read_events(&path);
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e["eventType"], "OrderStarted");
        assert_eq!(e["enterprise"], "Aerogen");
        assert_eq!(e["line"], "Line01");
        assert_eq!(e["orderId"], "ORD-001");
        assert_eq!(e["sku"], "LEM-500-IE");
        assert_eq!(e["actor"]["type"], "system");
        assert_eq!(e["validation"]["status"], "ACCEPTED");
        assert_eq!(e["plannedQty"], 4000);
        assert!(Ulid::from_string(e["eventId"].as_str().unwrap()).is_ok());
        // Millisecond UTC timestamp.
        assert!(e["ts"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn event_ids_sort_in_emission_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        let emitter = EventEmitter::new(&path, hierarchy(), false).unwrap();
        for _ in 0..100 {
            emitter.emit(None, None, EventPayload::CipStarted {}).unwrap();
        }
        emitter.close().unwrap();

        let ids: Vec<String> = read_events(&path)
            .iter()
            .map(|e| e["eventId"].as_str().unwrap().to_string())
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 100);
        // Strictly increasing, not merely sorted.
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn out_of_bounds_microstop_duration_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        let emitter = EventEmitter::new(&path, hierarchy(), false).unwrap();

        emitter
            .emit(
                Some("ORD-001"),
                Some("LEM-500-IE"),
                EventPayload::MicrostopEnded {
                    stop_code: StopCode::Ms02,
                    duration_ms: 500_000,
                    fingerprint: Fingerprint::FillStabilisation {
                        scale_stable: false,
                        fill_time_delta_ms: 300,
                    },
                },
            )
            .unwrap();
        emitter.close().unwrap();

        let events = read_events(&path);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["eventType"], "TransactionRejected");
        assert_eq!(events[0]["rejectedEventType"], "MicrostopEnded");
        assert!(!events[0]["reasons"].as_array().unwrap().is_empty());
    }

    #[test]
    fn records_round_trip_through_serde() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        let emitter = EventEmitter::new(&path, hierarchy(), false).unwrap();
        emitter
            .emit(
                Some("ORD-002"),
                Some("LEM-200-IE"),
                EventPayload::StateChanged {
                    from_state: LineState::Running,
                    to_state: LineState::Microstop,
                    stop_code: Some(StopCode::Ms08),
                    fault_code: None,
                    reason_id: None,
                    duration_ms: None,
                    fingerprint: Some(Fingerprint::BarcodeRescan { rescan_count: 2 }),
                },
            )
            .unwrap();
        emitter.close().unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let event: Event = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        match event.payload {
            EventPayload::StateChanged { from_state, to_state, stop_code, .. } => {
                assert_eq!(from_state, LineState::Running);
                assert_eq!(to_state, LineState::Microstop);
                assert_eq!(stop_code, Some(StopCode::Ms08));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
