//! Breakdown library: major faults BD-M1/M2/M3 and minor stops.
//!
//! Majors latch a fault code and hold the line in FAULT for about an hour.
//! Minors are 5–20 minute STOPPED episodes with an operator-style ST code
//! and no fault latch.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::registers::{RegisterImage, R_REZERO_ACTIVE, R_SCALE_STABLE, R_TORQUE_IN_SPEC};
use crate::state::StopCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Major,
    Minor,
}

#[derive(Debug, Clone, Copy)]
pub struct Breakdown {
    pub code: StopCode,
    pub name: &'static str,
    pub station: &'static str,
    pub severity: Severity,
    pub duration_lo_s: f64,
    pub duration_hi_s: f64,
}

/// Major breakdowns: nominal 60 minutes drawn ±10 %.
pub const MAJOR_BREAKDOWNS: &[Breakdown] = &[
    Breakdown {
        code: StopCode::BdM1,
        name: "Filler Scale Failure",
        station: "Filler01",
        severity: Severity::Major,
        duration_lo_s: 54.0 * 60.0,
        duration_hi_s: 66.0 * 60.0,
    },
    Breakdown {
        code: StopCode::BdM2,
        name: "Capper Torque Sensor Failure",
        station: "Capper01",
        severity: Severity::Major,
        duration_lo_s: 54.0 * 60.0,
        duration_hi_s: 66.0 * 60.0,
    },
    Breakdown {
        code: StopCode::BdM3,
        name: "Checkweigher Loadcell Failure",
        station: "Checkweigher01",
        severity: Severity::Major,
        duration_lo_s: 54.0 * 60.0,
        duration_hi_s: 66.0 * 60.0,
    },
];

/// Minor breakdowns: operator-coded stops, no fault latch.
pub const MINOR_BREAKDOWNS: &[Breakdown] = &[
    Breakdown {
        code: StopCode::St05,
        name: "Photoeye Misalignment",
        station: "Infeed01",
        severity: Severity::Minor,
        duration_lo_s: 5.0 * 60.0,
        duration_hi_s: 20.0 * 60.0,
    },
    Breakdown {
        code: StopCode::St06,
        name: "Label Sensor Cleaning",
        station: "Labeller01",
        severity: Severity::Minor,
        duration_lo_s: 5.0 * 60.0,
        duration_hi_s: 20.0 * 60.0,
    },
    Breakdown {
        code: StopCode::St07,
        name: "Cap Chute Adjustment",
        station: "Capper01",
        severity: Severity::Minor,
        duration_lo_s: 5.0 * 60.0,
        duration_hi_s: 20.0 * 60.0,
    },
];

pub fn get_major(code: StopCode) -> Option<&'static Breakdown> {
    MAJOR_BREAKDOWNS.iter().find(|b| b.code == code)
}

pub fn sample_duration<R: Rng>(rng: &mut R, bd: &Breakdown) -> Duration {
    Duration::from_secs_f64(rng.gen_range(bd.duration_lo_s..=bd.duration_hi_s))
}

pub fn pick_minor<R: Rng>(rng: &mut R) -> &'static Breakdown {
    &MINOR_BREAKDOWNS[rng.gen_range(0..MINOR_BREAKDOWNS.len())]
}

/// Running-time offset into the order at which a planned breakdown fires:
/// 20–40 % of the order's nominal duration.
pub fn trigger_offset<R: Rng>(rng: &mut R, planned_qty: u32, speed_bpm: f64) -> Duration {
    let order_duration_s = f64::from(planned_qty) / speed_bpm * 60.0;
    Duration::from_secs_f64(order_duration_s * rng.gen_range(0.20..0.40))
}

/// Force the fault's signal pattern while the breakdown is active.
pub fn apply(code: StopCode, image: &mut RegisterImage) {
    match code {
        StopCode::BdM1 => image.set_bool(R_SCALE_STABLE, false),
        StopCode::BdM2 => image.set_bool(R_TORQUE_IN_SPEC, false),
        StopCode::BdM3 => image.set_bool(R_REZERO_ACTIVE, true),
        _ => {}
    }
}

/// Release the fault's signal pattern.
pub fn clear(image: &mut RegisterImage) {
    image.set_bool(R_SCALE_STABLE, true);
    image.set_bool(R_TORQUE_IN_SPEC, true);
    image.set_bool(R_REZERO_ACTIVE, false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn majors_latch_fault_codes() {
        assert_eq!(MAJOR_BREAKDOWNS.len(), 3);
        for bd in MAJOR_BREAKDOWNS {
            assert!(bd.code.fault_code() > 0);
            assert_eq!(bd.severity, Severity::Major);
        }
    }

    #[test]
    fn minors_carry_st_codes_without_fault_latch() {
        for bd in MINOR_BREAKDOWNS {
            assert_eq!(bd.code.fault_code(), 0);
            let v = bd.code.register_value();
            assert!((11..=20).contains(&v), "{} outside ST range", bd.code);
        }
    }

    #[test]
    fn major_duration_is_an_hour_give_or_take_ten_percent() {
        let mut rng = StdRng::seed_from_u64(11);
        let bd = get_major(StopCode::BdM1).unwrap();
        for _ in 0..100 {
            let d = sample_duration(&mut rng, bd).as_secs_f64();
            assert!((54.0 * 60.0..=66.0 * 60.0).contains(&d));
        }
    }

    #[test]
    fn trigger_offset_lands_in_the_first_half_of_the_order() {
        let mut rng = StdRng::seed_from_u64(5);
        // 1200 bottles at 60 bpm → 20 minute order.
        for _ in 0..100 {
            let offset = trigger_offset(&mut rng, 1200, 60.0).as_secs_f64();
            assert!((240.0..480.0).contains(&offset), "offset {offset}");
        }
    }
}
