//! Microstop library: MS01 through MS10.
//!
//! Each microstop carries a duration range, a relative selection weight, the
//! register signals it forces while active, and the fingerprint captured at
//! episode entry. The fingerprint is a typed variant per code, serialised to
//! the flat signal map the downstream miners expect.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::registers::{
    RegisterImage, R_BARCODE_OK, R_BOTTLE_PRESENCE, R_CAP_FEED_OK, R_DRIP_SENSOR,
    R_FILL_TIME_MS, R_INFEED_RATE, R_LABEL_SENSOR_OK, R_PUSHER_CYCLE_MS,
    R_RESCAN_COUNT, R_REZERO_ACTIVE, R_SCALE_STABLE, R_TORQUE_IN_SPEC,
};
use crate::sku::Sku;
use crate::state::StopCode;

/// Hard bounds on an effective microstop episode, seconds.
pub const MICROSTOP_MIN_SEC: u64 = 3;
pub const MICROSTOP_MAX_SEC: u64 = 120;

/// Signal values captured at microstop entry. One variant per stop code;
/// field names are the published telemetry vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fingerprint {
    InfeedMisfeed { bottle_presence: bool, infeed_rate_bpm: f32 },
    FillStabilisation { scale_stable: bool, fill_time_delta_ms: u32 },
    NozzleDrip { drip_sensor: bool, post_fill_delay_ms: u32 },
    CapFeed { cap_feed_ok: bool },
    TorqueRecheck { torque_in_spec_toggle_count: u32 },
    CheckweigherRezero { rezero_active: bool },
    LabelPeelback { label_sensor_ok_toggles: u32 },
    BarcodeRescan { rescan_count: u32 },
    PusherSlowReturn { pusher_cycle_ms: u32 },
    OutfeedAccumulation { outfeed_full: bool, line_speed_dip_pct: f32 },
}

#[derive(Debug, Clone, Copy)]
pub struct Microstop {
    pub code: StopCode,
    pub name: &'static str,
    pub station: &'static str,
    pub duration_lo_s: f64,
    pub duration_hi_s: f64,
    /// Relative selection probability.
    pub weight: f64,
}

pub const MICROSTOPS: &[Microstop] = &[
    Microstop { code: StopCode::Ms01, name: "Infeed Misfeed", station: "Infeed01", duration_lo_s: 6.0, duration_hi_s: 25.0, weight: 12.0 },
    Microstop { code: StopCode::Ms02, name: "Fill Stabilisation Wait", station: "Filler01", duration_lo_s: 8.0, duration_hi_s: 40.0, weight: 18.0 },
    Microstop { code: StopCode::Ms03, name: "Nozzle Drip Detect", station: "Filler01", duration_lo_s: 5.0, duration_hi_s: 20.0, weight: 8.0 },
    Microstop { code: StopCode::Ms04, name: "Cap Feed Stutter", station: "Capper01", duration_lo_s: 10.0, duration_hi_s: 50.0, weight: 10.0 },
    Microstop { code: StopCode::Ms05, name: "Torque Recheck", station: "Capper01", duration_lo_s: 12.0, duration_hi_s: 60.0, weight: 9.0 },
    Microstop { code: StopCode::Ms06, name: "Checkweigher Re-zero", station: "Checkweigher01", duration_lo_s: 10.0, duration_hi_s: 90.0, weight: 11.0 },
    Microstop { code: StopCode::Ms07, name: "Label Peelback", station: "Labeller01", duration_lo_s: 8.0, duration_hi_s: 45.0, weight: 10.0 },
    Microstop { code: StopCode::Ms08, name: "Barcode Re-scan", station: "Scanner01", duration_lo_s: 5.0, duration_hi_s: 30.0, weight: 9.0 },
    Microstop { code: StopCode::Ms09, name: "Reject Pusher Slow Return", station: "RejectPusher01", duration_lo_s: 8.0, duration_hi_s: 35.0, weight: 7.0 },
    Microstop { code: StopCode::Ms10, name: "Outfeed Accumulation Nudge", station: "Line01", duration_lo_s: 15.0, duration_hi_s: 120.0, weight: 6.0 },
];

pub fn get(code: StopCode) -> Option<&'static Microstop> {
    MICROSTOPS.iter().find(|m| m.code == code)
}

/// Weighted pick biased by SKU format: large-volume SKUs see more fill
/// stabilisation waits. `weights` are the configured per-code overrides,
/// indexed like [`MICROSTOPS`].
pub fn pick<R: Rng>(rng: &mut R, sku: &Sku, weights: &[f64; 10]) -> &'static Microstop {
    let mut effective = *weights;
    if sku.is_large_volume() {
        effective[1] *= 1.8; // MS02
    }
    let total: f64 = effective.iter().sum();
    let mut roll = rng.gen_range(0.0..total);
    for (ms, w) in MICROSTOPS.iter().zip(effective) {
        if roll < w {
            return ms;
        }
        roll -= w;
    }
    &MICROSTOPS[MICROSTOPS.len() - 1]
}

pub fn default_weights() -> [f64; 10] {
    let mut weights = [0.0; 10];
    for (slot, ms) in weights.iter_mut().zip(MICROSTOPS) {
        *slot = ms.weight;
    }
    weights
}

/// Uniform draw from the stop's range, clamped to the published bounds.
pub fn sample_duration<R: Rng>(rng: &mut R, ms: &Microstop) -> Duration {
    let drawn = rng.gen_range(ms.duration_lo_s..=ms.duration_hi_s);
    let clamped = drawn.clamp(MICROSTOP_MIN_SEC as f64, MICROSTOP_MAX_SEC as f64);
    Duration::from_secs_f64(clamped)
}

/// Build the fingerprint captured at episode entry.
pub fn sample_fingerprint<R: Rng>(rng: &mut R, code: StopCode, sku: &Sku) -> Fingerprint {
    match code {
        StopCode::Ms01 => Fingerprint::InfeedMisfeed {
            bottle_presence: false,
            infeed_rate_bpm: (sku.nominal_speed_bpm * 0.5) as f32,
        },
        StopCode::Ms02 => Fingerprint::FillStabilisation {
            scale_stable: false,
            fill_time_delta_ms: (sku.fill_time_ms() as f64 * rng.gen_range(0.15..0.40)) as u32,
        },
        StopCode::Ms03 => Fingerprint::NozzleDrip {
            drip_sensor: true,
            post_fill_delay_ms: rng.gen_range(300..=800),
        },
        StopCode::Ms04 => Fingerprint::CapFeed { cap_feed_ok: false },
        StopCode::Ms05 => Fingerprint::TorqueRecheck {
            torque_in_spec_toggle_count: rng.gen_range(1..=4),
        },
        StopCode::Ms06 => Fingerprint::CheckweigherRezero { rezero_active: true },
        StopCode::Ms07 => Fingerprint::LabelPeelback {
            label_sensor_ok_toggles: rng.gen_range(1..=3),
        },
        StopCode::Ms08 => Fingerprint::BarcodeRescan { rescan_count: rng.gen_range(1..=3) },
        StopCode::Ms09 => Fingerprint::PusherSlowReturn {
            pusher_cycle_ms: rng.gen_range(900..=2000),
        },
        StopCode::Ms10 => Fingerprint::OutfeedAccumulation {
            outfeed_full: true,
            line_speed_dip_pct: rng.gen_range(5.0..20.0),
        },
        other => unreachable!("{other} is not a microstop code"),
    }
}

/// Force the stop's signals into the staged register image at entry.
pub fn apply(code: StopCode, fingerprint: &Fingerprint, image: &mut RegisterImage, sku: &Sku) {
    match (code, fingerprint) {
        (StopCode::Ms01, Fingerprint::InfeedMisfeed { infeed_rate_bpm, .. }) => {
            image.set_bool(R_BOTTLE_PRESENCE, false);
            image.set_f32(R_INFEED_RATE, *infeed_rate_bpm);
        }
        (StopCode::Ms02, Fingerprint::FillStabilisation { fill_time_delta_ms, .. }) => {
            image.set_bool(R_SCALE_STABLE, false);
            image.set_u32(R_FILL_TIME_MS, sku.fill_time_ms() + fill_time_delta_ms);
        }
        (StopCode::Ms03, _) => image.set_bool(R_DRIP_SENSOR, true),
        (StopCode::Ms04, _) => image.set_bool(R_CAP_FEED_OK, false),
        (StopCode::Ms05, _) => image.set_bool(R_TORQUE_IN_SPEC, false),
        (StopCode::Ms06, _) => image.set_bool(R_REZERO_ACTIVE, true),
        (StopCode::Ms07, _) => image.set_bool(R_LABEL_SENSOR_OK, false),
        (StopCode::Ms08, Fingerprint::BarcodeRescan { rescan_count }) => {
            image.set_bool(R_BARCODE_OK, false);
            image.set_u16(R_RESCAN_COUNT, *rescan_count as u16);
        }
        (StopCode::Ms09, Fingerprint::PusherSlowReturn { pusher_cycle_ms }) => {
            image.set_u32(R_PUSHER_CYCLE_MS, *pusher_cycle_ms);
        }
        // MS10: the outfeed pressure and speed dip live in the fingerprint;
        // the line_speed register reads 0 while the line is not RUNNING.
        _ => {}
    }
}

/// Restore the signals a microstop may have forced. Called at episode exit.
pub fn revert(image: &mut RegisterImage) {
    image.set_bool(R_BOTTLE_PRESENCE, true);
    image.set_bool(R_SCALE_STABLE, true);
    image.set_bool(R_DRIP_SENSOR, false);
    image.set_bool(R_CAP_FEED_OK, true);
    image.set_bool(R_TORQUE_IN_SPEC, true);
    image.set_bool(R_REZERO_ACTIVE, false);
    image.set_bool(R_LABEL_SENSOR_OK, true);
    image.set_bool(R_BARCODE_OK, true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sku::get_sku;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn library_covers_ms01_through_ms10() {
        assert_eq!(MICROSTOPS.len(), 10);
        for (i, ms) in MICROSTOPS.iter().enumerate() {
            assert_eq!(ms.code.register_value() as usize, i + 1);
            assert!(ms.duration_lo_s <= ms.duration_hi_s);
            assert!(ms.duration_lo_s >= MICROSTOP_MIN_SEC as f64);
            assert!(ms.duration_hi_s <= MICROSTOP_MAX_SEC as f64);
        }
    }

    #[test]
    fn durations_stay_within_published_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for ms in MICROSTOPS {
            for _ in 0..200 {
                let d = sample_duration(&mut rng, ms);
                assert!(d >= Duration::from_secs(MICROSTOP_MIN_SEC), "{}", ms.code);
                assert!(d <= Duration::from_secs(MICROSTOP_MAX_SEC), "{}", ms.code);
            }
        }
    }

    #[test]
    fn large_volume_skus_upweight_fill_stabilisation() {
        let mut rng = StdRng::seed_from_u64(42);
        let small = get_sku("LEM-500-IE").unwrap();
        let large = get_sku("LEM-2L-IE").unwrap();
        let weights = default_weights();

        let count = |sku, rng: &mut StdRng| {
            (0..4000)
                .filter(|_| pick(rng, sku, &weights).code == StopCode::Ms02)
                .count()
        };
        let small_hits = count(small, &mut rng);
        let large_hits = count(large, &mut rng);
        assert!(large_hits > small_hits, "expected MS02 bias: {large_hits} vs {small_hits}");
    }

    #[test]
    fn fingerprint_serialises_to_flat_signal_map() {
        let mut rng = StdRng::seed_from_u64(1);
        let sku = get_sku("LEM-500-IE").unwrap();
        let fp = sample_fingerprint(&mut rng, StopCode::Ms02, sku);
        let json = serde_json::to_value(&fp).unwrap();
        assert_eq!(json["scale_stable"], serde_json::json!(false));
        assert!(json["fill_time_delta_ms"].as_u64().unwrap() > 0);

        let fp = sample_fingerprint(&mut rng, StopCode::Ms08, sku);
        let json = serde_json::to_value(&fp).unwrap();
        assert!(json["rescan_count"].as_u64().unwrap() >= 1);
    }

    #[test]
    fn apply_then_revert_restores_normal_signals() {
        let mut rng = StdRng::seed_from_u64(3);
        let sku = get_sku("LEM-500-IE").unwrap();
        let mut image = RegisterImage::new();
        revert(&mut image); // establish normal baseline

        let fp = sample_fingerprint(&mut rng, StopCode::Ms02, sku);
        apply(StopCode::Ms02, &fp, &mut image, sku);
        assert!(!image.get_bool(R_SCALE_STABLE));
        assert!(image.get_u32(R_FILL_TIME_MS) > sku.fill_time_ms());

        revert(&mut image);
        assert!(image.get_bool(R_SCALE_STABLE));
        assert!(image.get_bool(R_BARCODE_OK));
    }
}
