//! Bottling line simulation engine.
//!
//! The tick loop is the single writer of simulation state: it advances the
//! schedule, samples stochastic interruptions, drives the state machine,
//! runs each bottle through the stations, and publishes the register image
//! once per tick. Stop and fault episodes are bookkept here so their
//! durations come exactly from entry/exit virtual timestamps.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp, Normal};
use tracing::{info, warn};

use crate::breakdowns::{self, Breakdown, Severity};
use crate::clock::Clock;
use crate::events::{BottleResult, EmitError, EventEmitter, EventPayload, RejectReason};
use crate::microstops::{self, Fingerprint};
use crate::registers::{
    RegisterBank, RegisterImage, R_ACTUAL_WEIGHT, R_BARCODE_OK, R_BOTTLE_PRESENCE,
    R_CAP_FEED_OK, R_DRIP_SENSOR, R_FAULT_CODE, R_FILL_TIME_MS, R_GOOD_COUNT, R_GROSS_WEIGHT,
    R_HAZARD_APPLIED, R_HAZARD_REQUIRED, R_HAZARD_STOCK, R_INFEED_RATE, R_JAM_DETECTED,
    R_LABEL_APPLIED, R_LABEL_SENSOR_OK, R_LABEL_STOCK, R_LINE_SPEED, R_LINE_STATE,
    R_ORDER_IDX, R_ORDER_SEQ, R_PUSHER_CYCLE_MS, R_REJECT_COUNT, R_REJECT_REASON,
    R_REJECT_TRIGGERED, R_RESCAN_COUNT, R_SCALE_STABLE, R_SIM_SPEED_X10, R_SKU_IDX,
    R_STARVED, R_STOP_CODE, R_TARGET_WEIGHT, R_TORQUE_ACTUAL, R_TORQUE_IN_SPEC,
    R_TORQUE_TARGET, R_WEIGHT_IN_SPEC,
};
use crate::schedule::{BlockKind, ChangeoverType, ScheduleEntry};
use crate::sku::{self, Sku, IDLE_INDEX};
use crate::state::{LineState, StateMachine, StopCode, TriggerSet};

/// Weight/torque acceptance tolerances, fractions of target.
const WEIGHT_TOLERANCE: f64 = 0.02;
const TORQUE_TOLERANCE: f64 = 0.05;
/// First-scan barcode failure rate; only a tenth of those become rejects.
const BARCODE_FAIL_PROB: f64 = 0.005;
const BARCODE_REJECT_GIVEN_FAIL: f64 = 0.1;
/// Stock level below which the labeller can no longer apply.
const STOCK_EXHAUSTED_PCT: f64 = 2.0;
/// Lunch break operator reason.
const BREAK_REASON_ID: u16 = 4;

/// Tunables distilled from the configuration file.
#[derive(Debug, Clone)]
pub struct SimSettings {
    pub tick_interval: Duration,
    pub speed_factor: f64,
    pub microstop_mean_interval_s: f64,
    pub microstop_weights: [f64; 10],
    pub minor_stop_mean_interval_s: f64,
    pub starved_mean_interval_s: f64,
    pub blocked_mean_interval_s: f64,
    pub planned_breakdowns: bool,
    pub base_reject_probability: f64,
    pub label_stock_initial_pct: f64,
    pub label_stock_depletion_per_1000: f64,
    pub good_bottle_sample_rate: f64,
    pub rng_seed: u64,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            speed_factor: 60.0,
            microstop_mean_interval_s: 480.0,
            microstop_weights: microstops::default_weights(),
            minor_stop_mean_interval_s: 7_200.0,
            starved_mean_interval_s: 14_400.0,
            blocked_mean_interval_s: 14_400.0,
            planned_breakdowns: true,
            base_reject_probability: 0.005,
            label_stock_initial_pct: 95.0,
            label_stock_depletion_per_1000: 3.0,
            good_bottle_sample_rate: 0.02,
            rng_seed: 0x1234_5678_9ABC_DEF0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpisodeKind {
    Microstop,
    MinorStop,
    Starved,
    Blocked,
    Fault,
}

/// An open stop/fault episode. `ends_at` is the sampled exit time; a fault
/// override may close the episode earlier.
#[derive(Debug, Clone)]
struct Episode {
    kind: EpisodeKind,
    code: StopCode,
    station: &'static str,
    started_at: Duration,
    ends_at: Duration,
    fingerprint: Option<Fingerprint>,
    reason_id: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimedBlockKind {
    Changeover(ChangeoverType),
    Cip,
    Break,
}

/// An active schedule block with a fixed duration.
#[derive(Debug, Clone)]
struct TimedBlock {
    kind: TimedBlockKind,
    stop_code: Option<StopCode>,
    started_at: Duration,
    ends_at: Duration,
}

/// A planned breakdown waiting for its trigger offset.
#[derive(Debug, Clone, Copy)]
struct PendingBreakdown {
    code: StopCode,
    trigger_at_running_s: f64,
}

#[derive(Debug)]
struct OrderRun {
    entry_id: String,
    sku: &'static Sku,
    planned_qty: u32,
    good_produced: u32,
    start_good: u32,
    start_reject: u32,
    started_at: Duration,
    /// Virtual seconds spent in RUNNING; stochastic timers count against
    /// this so stops do not compress the inter-arrival distribution.
    running_s: f64,
    bottle_acc: f64,
    next_microstop_at: f64,
    next_minor_stop_at: f64,
    next_starved_at: f64,
    next_blocked_at: f64,
    breakdown: Option<PendingBreakdown>,
    cip_after: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Active,
    ScheduleComplete,
}

/// The line simulator. Owns the state machine, counters and the staged
/// register image; everything else reads through [`RegisterBank`] snapshots
/// or the transaction log.
pub struct LineSimulator {
    settings: SimSettings,
    clock: Arc<dyn Clock>,
    emitter: EventEmitter,
    bank: Arc<RegisterBank>,
    image: RegisterImage,
    rng: StdRng,
    machine: StateMachine,

    schedule: Vec<ScheduleEntry>,
    cursor: usize,
    pending_cips: VecDeque<u32>,

    block: Option<TimedBlock>,
    order: Option<OrderRun>,
    episode: Option<Episode>,

    good_count: u32,
    reject_count: u32,
    completions: VecDeque<Duration>,
    label_stock: f64,
    hazard_stock: f64,
    order_seq: u16,
    done: bool,

    weight_noise: Normal<f64>,
    torque_noise: Normal<f64>,
    speed_noise: Normal<f64>,
}

impl LineSimulator {
    pub fn new(
        settings: SimSettings,
        schedule: Vec<ScheduleEntry>,
        clock: Arc<dyn Clock>,
        bank: Arc<RegisterBank>,
        emitter: EventEmitter,
    ) -> Self {
        let rng = StdRng::seed_from_u64(settings.rng_seed);
        let label_stock = settings.label_stock_initial_pct;
        let mut sim = Self {
            weight_noise: Normal::new(0.0, 0.005).expect("valid sigma"),
            torque_noise: Normal::new(0.0, 0.01).expect("valid sigma"),
            speed_noise: Normal::new(0.0, 0.01).expect("valid sigma"),
            settings,
            clock,
            emitter,
            bank,
            image: RegisterImage::new(),
            rng,
            machine: StateMachine::new(),
            schedule,
            cursor: 0,
            pending_cips: VecDeque::new(),
            block: None,
            order: None,
            episode: None,
            good_count: 0,
            reject_count: 0,
            completions: VecDeque::new(),
            label_stock,
            hazard_stock: label_stock,
            order_seq: 0,
            done: false,
        };
        sim.init_registers();
        sim
    }

    fn init_registers(&mut self) {
        self.image.set_u16(R_LINE_STATE, LineState::Idle.register_code());
        self.image.set_u16(R_ORDER_IDX, IDLE_INDEX);
        self.image.set_u16(R_SKU_IDX, IDLE_INDEX);
        self.image.set_u16(R_LABEL_STOCK, self.label_stock as u16);
        self.image.set_u16(R_HAZARD_STOCK, self.hazard_stock as u16);
        self.image.set_bool(R_CAP_FEED_OK, true);
        self.image.set_bool(R_LABEL_SENSOR_OK, true);
        self.image.set_bool(R_BARCODE_OK, true);
        self.image.set_bool(R_SCALE_STABLE, true);
        self.image.set_bool(R_TORQUE_IN_SPEC, true);
        self.image.set_u16(R_SIM_SPEED_X10, (self.settings.speed_factor * 10.0) as u16);
        self.bank.publish(&self.image);
    }

    // -- Accessors ---------------------------------------------------------

    pub fn state(&self) -> LineState {
        self.machine.state()
    }

    pub fn good_count(&self) -> u32 {
        self.good_count
    }

    pub fn reject_count(&self) -> u32 {
        self.reject_count
    }

    pub fn schedule_complete(&self) -> bool {
        self.done
    }

    /// Release the emitter for draining after the run.
    pub fn into_emitter(self) -> EventEmitter {
        self.emitter
    }

    // -- Run loop ----------------------------------------------------------

    /// Drive ticks off the clock until the schedule completes or shutdown
    /// is signalled, then settle the line to IDLE.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), EmitError> {
        info!(entries = self.schedule.len(), speed = self.settings.speed_factor, "simulation starting");
        while !self.done && !shutdown.load(Ordering::SeqCst) {
            self.tick()?;
            self.clock.sleep(self.settings.tick_interval);
        }
        self.finish()?;
        info!(good = self.good_count, reject = self.reject_count, "simulation stopped");
        Ok(())
    }

    /// One simulation step. Deterministic given the seed and tick count.
    pub fn tick(&mut self) -> Result<TickOutcome, EmitError> {
        let t = self.clock.now();
        let mut closed_duration_ms = None;

        // Close whatever ran out this tick before arbitration.
        if self.episode.as_ref().is_some_and(|e| t >= e.ends_at) {
            closed_duration_ms = Some(self.close_episode(t)?);
        }
        if self.block.as_ref().is_some_and(|b| t >= b.ends_at) {
            closed_duration_ms = Some(self.complete_block(t)?);
        }
        if self.order.as_ref().is_some_and(|o| o.good_produced >= o.planned_qty) {
            self.complete_order(t)?;
        }

        // Start the next schedule activity once the line has settled.
        if self.machine.state() == LineState::Idle
            && self.block.is_none()
            && self.episode.is_none()
            && self.order.is_none()
        {
            self.advance_schedule(t)?;
        }

        // Stochastic interruptions only fire on a running line.
        if self.machine.state() == LineState::Running
            && self.episode.is_none()
            && self.block.is_none()
        {
            self.sample_interruptions(t)?;
        }

        // Arbitrate concurrent triggers by precedence.
        let triggers = self.current_triggers();
        if let Some(transition) = self.machine.evaluate(&triggers) {
            self.emit_state_changed(transition.from, transition.to, closed_duration_ms)?;
        }

        // Production.
        if self.machine.state() == LineState::Running {
            self.produce(t)?;
        }

        self.refresh_registers(t);
        self.bank.publish(&self.image);

        Ok(if self.done { TickOutcome::ScheduleComplete } else { TickOutcome::Active })
    }

    /// Terminal settle: close open episodes and orders, emit the final
    /// transition to IDLE, publish an idle image.
    fn finish(&mut self) -> Result<(), EmitError> {
        let t = self.clock.now();
        if self.episode.is_some() {
            self.close_episode(t)?;
        }
        if self.block.is_some() {
            self.complete_block(t)?;
        }
        if self.order.is_some() {
            self.complete_order(t)?;
        }
        if let Some(transition) = self.machine.evaluate(&TriggerSet::default()) {
            self.emit_state_changed(transition.from, transition.to, None)?;
        }
        self.image.set_u16(R_ORDER_IDX, IDLE_INDEX);
        self.image.set_u16(R_SKU_IDX, IDLE_INDEX);
        self.refresh_registers(t);
        self.bank.publish(&self.image);
        Ok(())
    }

    // -- Schedule handling -------------------------------------------------

    fn advance_schedule(&mut self, t: Duration) -> Result<(), EmitError> {
        // Sanitation owed from a liquid changeover or a cip_after order runs
        // before the next schedule entry.
        if let Some(duration_min) = self.pending_cips.pop_front() {
            self.start_cip(t, duration_min)?;
            return Ok(());
        }

        let Some(entry) = self.schedule.get(self.cursor).cloned() else {
            if !self.done {
                info!(good = self.good_count, reject = self.reject_count, "schedule complete");
            }
            self.done = true;
            return Ok(());
        };
        self.cursor += 1;

        match entry.kind {
            BlockKind::Order { .. } => self.start_order(t, &entry)?,
            BlockKind::Changeover { changeover_type, duration_lo_min, duration_hi_min } => {
                self.start_changeover(t, changeover_type, duration_lo_min, duration_hi_min)?;
            }
            BlockKind::Cip { duration_min } => self.start_cip(t, duration_min)?,
            BlockKind::Break { duration_min } => self.start_break(t, duration_min)?,
        }
        Ok(())
    }

    fn start_order(&mut self, t: Duration, entry: &ScheduleEntry) -> Result<(), EmitError> {
        let BlockKind::Order { sku_id, planned_qty, inject_breakdown, cip_after, .. } = &entry.kind
        else {
            return Ok(());
        };
        let Some(sku) = sku::get_sku(sku_id) else {
            // Validation catches this at load; a loader bypass only skips the order.
            warn!(order = %entry.entry_id, sku = %sku_id, "unknown SKU, skipping order");
            return Ok(());
        };

        self.order_seq = self.order_seq.saturating_add(1);

        let breakdown = match inject_breakdown {
            Some(code) if self.settings.planned_breakdowns => Some(PendingBreakdown {
                code: *code,
                trigger_at_running_s: breakdowns::trigger_offset(
                    &mut self.rng,
                    *planned_qty,
                    sku.nominal_speed_bpm,
                )
                .as_secs_f64(),
            }),
            _ => None,
        };

        let run = OrderRun {
            entry_id: entry.entry_id.clone(),
            sku,
            planned_qty: *planned_qty,
            good_produced: 0,
            start_good: self.good_count,
            start_reject: self.reject_count,
            started_at: t,
            running_s: 0.0,
            bottle_acc: 0.0,
            next_microstop_at: self.sample_interval(self.settings.microstop_mean_interval_s),
            next_minor_stop_at: self.sample_interval(self.settings.minor_stop_mean_interval_s),
            next_starved_at: self.sample_interval(self.settings.starved_mean_interval_s),
            next_blocked_at: self.sample_interval(self.settings.blocked_mean_interval_s),
            breakdown,
            cip_after: *cip_after,
        };

        self.image.set_u16(R_SKU_IDX, sku::sku_index(sku.sku_id));
        self.image.set_u16(R_ORDER_IDX, self.order_seq - 1);
        self.image.set_u16(R_ORDER_SEQ, self.order_seq);
        self.image.set_f32(R_TARGET_WEIGHT, sku.target_weight_g() as f32);
        self.image.set_f32(R_TORQUE_TARGET, sku.torque_target_ncm as f32);
        self.image.set_bool(R_HAZARD_REQUIRED, sku.hazard_flag);

        let planned_start = Utc::now();
        let nominal_secs = f64::from(*planned_qty) / sku.nominal_speed_bpm * 60.0;
        let planned_end = planned_start + chrono::Duration::milliseconds((nominal_secs * 1000.0) as i64);

        info!(
            order = %run.entry_id,
            sku = sku.sku_id,
            qty = run.planned_qty,
            bpm = sku.nominal_speed_bpm,
            "order starting"
        );
        self.order = Some(run);
        self.emit(EventPayload::OrderStarted {
            planned_qty: *planned_qty,
            planned_start_ts: planned_start.to_rfc3339_opts(SecondsFormat::Millis, true),
            planned_end_ts: Some(planned_end.to_rfc3339_opts(SecondsFormat::Millis, true)),
        })
    }

    fn complete_order(&mut self, t: Duration) -> Result<(), EmitError> {
        let Some(run) = self.order.take() else { return Ok(()) };

        let good_delta = self.good_count - run.start_good;
        let reject_delta = self.reject_count - run.start_reject;
        let duration_ms = (t - run.started_at).as_millis() as u64;
        let yield_frac = f64::from(good_delta) / f64::from(run.planned_qty.max(1));

        info!(
            order = %run.entry_id,
            good = good_delta,
            reject = reject_delta,
            yield_pct = yield_frac * 100.0,
            "order complete"
        );
        self.emitter.emit(
            Some(&run.entry_id),
            Some(run.sku.sku_id),
            EventPayload::OrderCompleted {
                good_count_delta: good_delta,
                reject_count_delta: reject_delta,
                duration_ms,
                yield_frac: (yield_frac * 10_000.0).round() / 10_000.0,
            },
        )?;

        if run.cip_after {
            self.pending_cips.push_back(45);
        }
        self.image.set_u16(R_ORDER_IDX, IDLE_INDEX);
        self.image.set_u16(R_SKU_IDX, IDLE_INDEX);
        Ok(())
    }

    fn start_changeover(
        &mut self,
        t: Duration,
        ty: ChangeoverType,
        lo_min: u32,
        hi_min: u32,
    ) -> Result<(), EmitError> {
        let secs = self.rng.gen_range(f64::from(lo_min) * 60.0..=f64::from(hi_min) * 60.0);
        let code = ty.stop_code();
        info!(changeover = ?ty, minutes = secs / 60.0, "changeover starting");
        self.emit(EventPayload::ChangeoverStarted { changeover_type: ty, stop_code: code })?;
        self.block = Some(TimedBlock {
            kind: TimedBlockKind::Changeover(ty),
            stop_code: Some(code),
            started_at: t,
            ends_at: t + Duration::from_secs_f64(secs),
        });
        Ok(())
    }

    fn start_cip(&mut self, t: Duration, duration_min: u32) -> Result<(), EmitError> {
        info!(minutes = duration_min, "CIP starting");
        self.emit(EventPayload::CipStarted {})?;
        self.block = Some(TimedBlock {
            kind: TimedBlockKind::Cip,
            stop_code: None,
            started_at: t,
            ends_at: t + Duration::from_secs(u64::from(duration_min) * 60),
        });
        Ok(())
    }

    fn start_break(&mut self, t: Duration, duration_min: u32) -> Result<(), EmitError> {
        info!(minutes = duration_min, "break starting");
        self.emit(EventPayload::StopStarted {
            stop_code: StopCode::St04,
            reason_id: Some(BREAK_REASON_ID),
            reason_text: Some("Lunch Break".to_string()),
        })?;
        self.block = Some(TimedBlock {
            kind: TimedBlockKind::Break,
            stop_code: Some(StopCode::St04),
            started_at: t,
            ends_at: t + Duration::from_secs(u64::from(duration_min) * 60),
        });
        Ok(())
    }

    fn complete_block(&mut self, t: Duration) -> Result<u64, EmitError> {
        let Some(block) = self.block.take() else { return Ok(0) };
        let duration_ms = (t - block.started_at).as_millis() as u64;
        match block.kind {
            TimedBlockKind::Changeover(ty) => {
                self.emit(EventPayload::ChangeoverCompleted {
                    changeover_type: ty,
                    stop_code: ty.stop_code(),
                    duration_ms,
                })?;
                // A liquid change always finishes with a sanitation cycle.
                if ty == ChangeoverType::Liquid {
                    self.pending_cips.push_back(45);
                }
            }
            TimedBlockKind::Cip => {
                self.emit(EventPayload::CipEnded { duration_ms })?;
            }
            TimedBlockKind::Break => {
                self.emit(EventPayload::StopEnded {
                    stop_code: StopCode::St04,
                    duration_ms,
                    reason_id: Some(BREAK_REASON_ID),
                })?;
            }
        }
        Ok(duration_ms)
    }

    // -- Stochastic interruptions ------------------------------------------

    fn sample_interval(&mut self, mean_s: f64) -> f64 {
        if !mean_s.is_finite() || mean_s <= 0.0 {
            return f64::INFINITY;
        }
        Exp::new(1.0 / mean_s).expect("positive rate").sample(&mut self.rng)
    }

    fn sample_interruptions(&mut self, t: Duration) -> Result<(), EmitError> {
        let Some(order) = &self.order else { return Ok(()) };
        let running_s = order.running_s;

        if let Some(pending) = order.breakdown {
            if running_s >= pending.trigger_at_running_s {
                if let Some(order) = &mut self.order {
                    order.breakdown = None;
                }
                if let Some(bd) = breakdowns::get_major(pending.code) {
                    self.open_fault(t, bd)?;
                }
                return Ok(());
            }
        }

        if running_s >= order.next_microstop_at {
            let sku = order.sku;
            let ms = microstops::pick(&mut self.rng, sku, &self.settings.microstop_weights);
            self.open_microstop(t, ms)?;
            let next = running_s + self.sample_interval(self.settings.microstop_mean_interval_s);
            if let Some(order) = &mut self.order {
                order.next_microstop_at = next;
            }
            return Ok(());
        }

        if running_s >= order.next_minor_stop_at {
            let bd = *breakdowns::pick_minor(&mut self.rng);
            self.open_minor_stop(t, &bd)?;
            let next = running_s + self.sample_interval(self.settings.minor_stop_mean_interval_s);
            if let Some(order) = &mut self.order {
                order.next_minor_stop_at = next;
            }
            return Ok(());
        }

        if running_s >= order.next_starved_at {
            self.open_flow_stop(t, EpisodeKind::Starved)?;
            let next = running_s + self.sample_interval(self.settings.starved_mean_interval_s);
            if let Some(order) = &mut self.order {
                order.next_starved_at = next;
            }
            return Ok(());
        }

        if running_s >= order.next_blocked_at {
            self.open_flow_stop(t, EpisodeKind::Blocked)?;
            let next = running_s + self.sample_interval(self.settings.blocked_mean_interval_s);
            if let Some(order) = &mut self.order {
                order.next_blocked_at = next;
            }
        }
        Ok(())
    }

    fn open_microstop(&mut self, t: Duration, ms: &'static microstops::Microstop) -> Result<(), EmitError> {
        let Some(order) = &self.order else { return Ok(()) };
        let sku = order.sku;
        let fingerprint = microstops::sample_fingerprint(&mut self.rng, ms.code, sku);
        let duration = microstops::sample_duration(&mut self.rng, ms);

        microstops::apply(ms.code, &fingerprint, &mut self.image, sku);
        self.episode = Some(Episode {
            kind: EpisodeKind::Microstop,
            code: ms.code,
            station: ms.station,
            started_at: t,
            ends_at: t + duration,
            fingerprint: Some(fingerprint.clone()),
            reason_id: None,
        });
        self.emit(EventPayload::MicrostopStarted { stop_code: ms.code, fingerprint })
    }

    fn open_minor_stop(&mut self, t: Duration, bd: &Breakdown) -> Result<(), EmitError> {
        let duration = breakdowns::sample_duration(&mut self.rng, bd);
        warn!(stop = %bd.code, station = bd.station, minutes = duration.as_secs_f64() / 60.0, "minor stop");
        self.episode = Some(Episode {
            kind: EpisodeKind::MinorStop,
            code: bd.code,
            station: bd.station,
            started_at: t,
            ends_at: t + duration,
            fingerprint: None,
            reason_id: None,
        });
        self.emit(EventPayload::StopStarted {
            stop_code: bd.code,
            reason_id: None,
            reason_text: Some(bd.name.to_string()),
        })
    }

    fn open_flow_stop(&mut self, t: Duration, kind: EpisodeKind) -> Result<(), EmitError> {
        let (code, station, reason) = match kind {
            EpisodeKind::Starved => (StopCode::St08, "Infeed01", "Upstream starvation"),
            EpisodeKind::Blocked => (StopCode::St09, "Line01", "Downstream blockage"),
            _ => return Ok(()),
        };
        let duration = Duration::from_secs_f64(self.rng.gen_range(120.0..=360.0));
        if kind == EpisodeKind::Starved {
            self.image.set_bool(R_STARVED, true);
            self.image.set_bool(R_BOTTLE_PRESENCE, false);
        }
        self.episode = Some(Episode {
            kind,
            code,
            station,
            started_at: t,
            ends_at: t + duration,
            fingerprint: None,
            reason_id: None,
        });
        self.emit(EventPayload::StopStarted {
            stop_code: code,
            reason_id: None,
            reason_text: Some(reason.to_string()),
        })
    }

    fn open_fault(&mut self, t: Duration, bd: &'static Breakdown) -> Result<(), EmitError> {
        // A fault preempts whatever stop was in progress; the subordinate
        // episode closes with its duration so far.
        if self.episode.is_some() {
            self.close_episode(t)?;
        }

        let duration = breakdowns::sample_duration(&mut self.rng, bd);
        warn!(
            fault = %bd.code,
            station = bd.station,
            minutes = duration.as_secs_f64() / 60.0,
            "major breakdown"
        );

        self.emit(EventPayload::FaultRaised {
            fault_code: bd.code,
            severity: Severity::Major,
            station: bd.station.to_string(),
        })?;
        self.emit(EventPayload::StopStarted {
            stop_code: bd.code,
            reason_id: None,
            reason_text: Some(bd.name.to_string()),
        })?;

        breakdowns::apply(bd.code, &mut self.image);
        self.episode = Some(Episode {
            kind: EpisodeKind::Fault,
            code: bd.code,
            station: bd.station,
            started_at: t,
            ends_at: t + duration,
            fingerprint: None,
            reason_id: None,
        });
        Ok(())
    }

    fn close_episode(&mut self, t: Duration) -> Result<u64, EmitError> {
        let Some(episode) = self.episode.take() else { return Ok(0) };
        let duration_ms = (t - episode.started_at).as_millis() as u64;

        match episode.kind {
            EpisodeKind::Microstop => {
                microstops::revert(&mut self.image);
                let fingerprint = episode
                    .fingerprint
                    .clone()
                    .expect("microstop episodes carry a fingerprint");
                self.emit(EventPayload::MicrostopEnded {
                    stop_code: episode.code,
                    duration_ms,
                    fingerprint,
                })?;
            }
            EpisodeKind::MinorStop => {
                self.emit(EventPayload::StopEnded {
                    stop_code: episode.code,
                    duration_ms,
                    reason_id: episode.reason_id,
                })?;
            }
            EpisodeKind::Starved | EpisodeKind::Blocked => {
                self.image.set_bool(R_STARVED, false);
                self.image.set_bool(R_BOTTLE_PRESENCE, true);
                self.emit(EventPayload::StopEnded {
                    stop_code: episode.code,
                    duration_ms,
                    reason_id: episode.reason_id,
                })?;
            }
            EpisodeKind::Fault => {
                breakdowns::clear(&mut self.image);
                self.emit(EventPayload::FaultCleared {
                    fault_code: episode.code,
                    severity: Severity::Major,
                    station: episode.station.to_string(),
                    duration_ms,
                })?;
                self.emit(EventPayload::StopEnded {
                    stop_code: episode.code,
                    duration_ms,
                    reason_id: None,
                })?;
            }
        }
        Ok(duration_ms)
    }

    // -- Trigger arbitration -----------------------------------------------

    fn current_triggers(&self) -> TriggerSet {
        let mut triggers = TriggerSet::default();
        if let Some(episode) = &self.episode {
            match episode.kind {
                EpisodeKind::Fault => triggers.fault = true,
                EpisodeKind::Microstop => triggers.microstop = true,
                EpisodeKind::MinorStop => triggers.stopped = true,
                EpisodeKind::Starved => triggers.starved = true,
                EpisodeKind::Blocked => triggers.blocked = true,
            }
        }
        if let Some(block) = &self.block {
            match block.kind {
                TimedBlockKind::Cip => triggers.cip = true,
                TimedBlockKind::Changeover(_) => triggers.changeover = true,
                TimedBlockKind::Break => triggers.stopped = true,
            }
        }
        triggers.running =
            self.order.is_some() && self.episode.is_none() && self.block.is_none();
        triggers
    }

    fn emit_state_changed(
        &mut self,
        from: LineState,
        to: LineState,
        closed_duration_ms: Option<u64>,
    ) -> Result<(), EmitError> {
        let (stop_code, fault_code, fingerprint) = match &self.episode {
            Some(e) => (
                Some(e.code),
                (e.kind == EpisodeKind::Fault).then_some(e.code),
                e.fingerprint.clone(),
            ),
            None => (self.block.as_ref().and_then(|b| b.stop_code), None, None),
        };
        let reason_id = match &self.block {
            Some(b) if b.kind == TimedBlockKind::Break => Some(BREAK_REASON_ID),
            _ => None,
        };
        // Duration rides on transitions that leave a stop-like state.
        let duration_ms = (from != LineState::Running && from != LineState::Idle)
            .then_some(closed_duration_ms)
            .flatten();

        self.emit(EventPayload::StateChanged {
            from_state: from,
            to_state: to,
            stop_code,
            fault_code,
            reason_id,
            duration_ms,
            fingerprint,
        })
    }

    // -- Production --------------------------------------------------------

    fn produce(&mut self, t: Duration) -> Result<(), EmitError> {
        let tick_s = self.settings.tick_interval.as_secs_f64();
        let Some(order) = &mut self.order else { return Ok(()) };

        order.running_s += tick_s;
        order.bottle_acc += order.sku.nominal_speed_bpm / 60.0 * tick_s;

        let sku = order.sku;
        while self.order.as_ref().is_some_and(|o| o.bottle_acc >= 1.0 && o.good_produced < o.planned_qty) {
            if let Some(order) = &mut self.order {
                order.bottle_acc -= 1.0;
            }
            let good = self.process_bottle(t, sku)?;
            if let Some(order) = &mut self.order {
                if good {
                    order.good_produced += 1;
                }
            }
        }

        self.update_line_signals(sku);
        Ok(())
    }

    /// One bottle through every station. Updates the staged registers and
    /// counters; returns whether the bottle was good.
    fn process_bottle(&mut self, t: Duration, sku: &'static Sku) -> Result<bool, EmitError> {
        let mut reject = None;

        // Filler01: σ 0.5 % against a ±2 % acceptance window.
        let target_w = sku.target_weight_g();
        let actual_w = target_w * (1.0 + self.weight_noise.sample(&mut self.rng));
        let fill_delta = self.rng.gen_range(0.02..0.05);
        let fill_sign = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        let fill_ms = (f64::from(sku.fill_time_ms()) * (1.0 + fill_sign * fill_delta)) as u32;
        let weight_ok = (actual_w - target_w).abs() <= target_w * WEIGHT_TOLERANCE;
        self.image.set_f32(R_ACTUAL_WEIGHT, actual_w as f32);
        self.image.set_u32(R_FILL_TIME_MS, fill_ms);
        self.image.set_bool(R_SCALE_STABLE, true);
        self.image.set_bool(R_DRIP_SENSOR, self.rng.gen_bool(0.02));
        self.image.set_f32(R_GROSS_WEIGHT, actual_w as f32);
        self.image.set_bool(R_WEIGHT_IN_SPEC, weight_ok);
        if !weight_ok {
            reject = Some(RejectReason::Weight);
        }

        // Capper01: σ 1 % against ±5 %.
        let target_t = sku.torque_target_ncm;
        let actual_t = target_t * (1.0 + self.torque_noise.sample(&mut self.rng));
        let torque_ok = (actual_t - target_t).abs() <= target_t * TORQUE_TOLERANCE;
        self.image.set_f32(R_TORQUE_ACTUAL, actual_t as f32);
        self.image.set_bool(R_TORQUE_IN_SPEC, torque_ok);
        self.image.set_bool(R_CAP_FEED_OK, true);
        if !torque_ok && reject.is_none() {
            reject = Some(RejectReason::Torque);
        }

        // Scanner01: most first-scan failures resolve on rescan.
        let barcode_ok = !self.rng.gen_bool(BARCODE_FAIL_PROB);
        self.image.set_bool(R_BARCODE_OK, barcode_ok);
        self.image.set_u16(R_RESCAN_COUNT, if barcode_ok { 0 } else { self.rng.gen_range(1..=2) });
        if !barcode_ok && self.rng.gen_bool(BARCODE_REJECT_GIVEN_FAIL) && reject.is_none() {
            reject = Some(RejectReason::Barcode);
        }

        // Labeller01.
        let label_ok = self.label_stock > STOCK_EXHAUSTED_PCT;
        self.image.set_bool(R_LABEL_APPLIED, label_ok);
        self.image.set_bool(R_LABEL_SENSOR_OK, true);
        self.image.set_u16(R_LABEL_STOCK, self.label_stock.clamp(0.0, 100.0) as u16);
        if !label_ok && reject.is_none() {
            reject = Some(RejectReason::Label);
        }

        // Labeller02 (hazard).
        if sku.hazard_flag {
            let hazard_ok = self.hazard_stock > STOCK_EXHAUSTED_PCT;
            self.image.set_bool(R_HAZARD_REQUIRED, true);
            self.image.set_bool(R_HAZARD_APPLIED, hazard_ok);
            self.image.set_u16(R_HAZARD_STOCK, self.hazard_stock.clamp(0.0, 100.0) as u16);
            if !hazard_ok && reject.is_none() {
                reject = Some(RejectReason::Hazard);
            }
        } else {
            self.image.set_bool(R_HAZARD_REQUIRED, false);
            self.image.set_bool(R_HAZARD_APPLIED, false);
        }

        // Residual quality rejects beyond the station models.
        if reject.is_none() && self.rng.gen_bool(self.settings.base_reject_probability) {
            reject = Some(RejectReason::Weight);
        }

        let is_good = reject.is_none();

        // RejectPusher01.
        let cycle_ms = if is_good {
            self.rng.gen_range(200..=500)
        } else {
            self.rng.gen_range(500..=800)
        };
        self.image.set_u32(R_PUSHER_CYCLE_MS, cycle_ms);
        self.image.set_bool(R_REJECT_TRIGGERED, !is_good);
        self.image
            .set_u16(R_REJECT_REASON, reject.map_or(0, RejectReason::register_value));

        if is_good {
            self.good_count = self.good_count.saturating_add(1);
        } else {
            self.reject_count = self.reject_count.saturating_add(1);
        }
        self.image.set_u32(R_GOOD_COUNT, self.good_count);
        self.image.set_u32(R_REJECT_COUNT, self.reject_count);
        self.completions.push_back(t);

        // Consumables.
        self.label_stock =
            (self.label_stock - self.settings.label_stock_depletion_per_1000 / 1000.0).max(0.0);
        if sku.hazard_flag {
            self.hazard_stock =
                (self.hazard_stock - self.settings.label_stock_depletion_per_1000 / 1000.0).max(0.0);
        }

        // Rejects always reach the log; good bottles are sampled.
        let sampled = !is_good || self.rng.gen_bool(self.settings.good_bottle_sample_rate);
        if sampled {
            self.emit(EventPayload::BottleCompleted {
                result: if is_good { BottleResult::Good } else { BottleResult::Reject },
                station: if is_good { "Checkweigher01" } else { "RejectPusher01" }.to_string(),
                reject_reason: reject,
                weight: Some((actual_w * 100.0).round() / 100.0),
                torque: Some((actual_t * 100.0).round() / 100.0),
            })?;
        }
        Ok(is_good)
    }

    fn update_line_signals(&mut self, sku: &'static Sku) {
        let infeed = sku.nominal_speed_bpm * (1.0 + 1.5 * self.speed_noise.sample(&mut self.rng));
        self.image.set_f32(R_INFEED_RATE, infeed as f32);
        self.image.set_bool(R_BOTTLE_PRESENCE, true);
        self.image.set_bool(R_STARVED, false);
        self.image.set_bool(R_JAM_DETECTED, false);
        self.image.set_f32(R_TORQUE_TARGET, sku.torque_target_ncm as f32);
        self.image.set_f32(R_TARGET_WEIGHT, sku.target_weight_g() as f32);
    }

    /// Per-tick register refresh: state, codes, counters, rolling speed.
    fn refresh_registers(&mut self, t: Duration) {
        let state = self.machine.state();
        self.image.set_u16(R_LINE_STATE, state.register_code());

        let stop_code = self
            .episode
            .as_ref()
            .map(|e| e.code)
            .or_else(|| self.block.as_ref().and_then(|b| b.stop_code));
        self.image
            .set_u16(R_STOP_CODE, stop_code.map_or(0, StopCode::register_value));

        let fault_code = self
            .episode
            .as_ref()
            .filter(|e| e.kind == EpisodeKind::Fault)
            .map_or(0, |e| e.code.fault_code());
        self.image.set_u16(R_FAULT_CODE, fault_code);

        // Bottles completed in the last rolling second of virtual time.
        let window_start = t.saturating_sub(Duration::from_secs(1));
        while self.completions.front().is_some_and(|&c| c <= window_start) {
            self.completions.pop_front();
        }
        let bpm = if state == LineState::Running {
            self.completions.len() as f32 * 60.0
        } else {
            0.0
        };
        self.image.set_f32(R_LINE_SPEED, bpm);
    }

    // -- Operator / test injection hooks -----------------------------------

    /// Force a microstop episode now, as if the sampler had fired.
    pub fn inject_microstop(&mut self, code: StopCode) -> Result<bool, EmitError> {
        if self.machine.state() != LineState::Running || self.episode.is_some() {
            return Ok(false);
        }
        let Some(ms) = microstops::get(code) else { return Ok(false) };
        let t = self.clock.now();
        self.open_microstop(t, ms)?;
        Ok(true)
    }

    /// Force a major breakdown now. Overrides any in-progress stop.
    pub fn inject_breakdown(&mut self, code: StopCode) -> Result<bool, EmitError> {
        let Some(bd) = breakdowns::get_major(code) else { return Ok(false) };
        if self.episode.as_ref().is_some_and(|e| e.kind == EpisodeKind::Fault) {
            return Ok(false);
        }
        let t = self.clock.now();
        self.open_fault(t, bd)?;
        Ok(true)
    }

    /// Clear an active fault ahead of its sampled duration.
    pub fn clear_fault(&mut self) -> Result<bool, EmitError> {
        if self.episode.as_ref().is_some_and(|e| e.kind == EpisodeKind::Fault) {
            let t = self.clock.now();
            self.close_episode(t)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn emit(&self, payload: EventPayload) -> Result<(), EmitError> {
        let (order_id, sku_id) = match &self.order {
            Some(run) => (Some(run.entry_id.as_str()), Some(run.sku.sku_id)),
            None => (None, None),
        };
        self.emitter.emit(order_id, sku_id, payload)
    }
}
