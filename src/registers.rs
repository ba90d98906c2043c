//! Modbus holding register map and bank.
//!
//! All addresses are 0-indexed; documentation addresses = index + 40001.
//! Encodings per Modbus convention:
//!
//! - `float32` → 2 consecutive registers, IEEE-754 big-endian, high word first
//! - `uint32`  → 2 consecutive registers, big-endian, high word first
//! - `uint16`  → 1 register
//! - `bool`    → 1 register (0 or 1)
//!
//! The simulator stages every write into a private [`RegisterImage`] and
//! publishes the whole image once per tick. Readers take a locked snapshot
//! of the last published image, so a 32-bit pair can never be observed torn
//! or mid-tick.

use parking_lot::RwLock;

pub const TOTAL_REGISTERS: usize = 100;

// Line-level
pub const R_LINE_STATE: usize = 0; // 40001: uint16 (see LineState::register_code)
pub const R_LINE_SPEED: usize = 1; // 40002–40003: float32 bpm
pub const R_GOOD_COUNT: usize = 3; // 40004–40005: uint32 (monotonic)
pub const R_REJECT_COUNT: usize = 5; // 40006–40007: uint32 (monotonic)
pub const R_ORDER_IDX: usize = 7; // 40008: uint16 (0-based, 0xFFFF=IDLE)
pub const R_SKU_IDX: usize = 8; // 40009: uint16 (0-based, 0xFFFF=IDLE)
pub const R_STOP_CODE: usize = 9; // 40010: uint16 (0=none, see StopCode)
pub const R_FAULT_CODE: usize = 10; // 40011: uint16 (0=none, 1..3=BD-M1..M3)
pub const R_ORDER_SEQ: usize = 11; // 40012: uint16 sequential order number (1-based)
pub const R_SIM_SPEED_X10: usize = 12; // 40013: uint16 speed_factor × 10

// Infeed01
pub const R_BOTTLE_PRESENCE: usize = 14; // 40015: bool
pub const R_INFEED_RATE: usize = 15; // 40016–40017: float32 bpm
pub const R_STARVED: usize = 17; // 40018: bool
pub const R_JAM_DETECTED: usize = 18; // 40019: bool

// Filler01
pub const R_TARGET_WEIGHT: usize = 20; // 40021–40022: float32 g
pub const R_ACTUAL_WEIGHT: usize = 22; // 40023–40024: float32 g
pub const R_FILL_TIME_MS: usize = 24; // 40025–40026: uint32 ms
pub const R_SCALE_STABLE: usize = 26; // 40027: bool
pub const R_DRIP_SENSOR: usize = 27; // 40028: bool

// Capper01
pub const R_TORQUE_TARGET: usize = 29; // 40030–40031: float32 Ncm
pub const R_TORQUE_ACTUAL: usize = 31; // 40032–40033: float32 Ncm
pub const R_TORQUE_IN_SPEC: usize = 33; // 40034: bool
pub const R_CAP_FEED_OK: usize = 34; // 40035: bool

// Checkweigher01
pub const R_GROSS_WEIGHT: usize = 36; // 40037–40038: float32 g
pub const R_WEIGHT_IN_SPEC: usize = 38; // 40039: bool
pub const R_REZERO_ACTIVE: usize = 39; // 40040: bool

// Labeller01
pub const R_LABEL_APPLIED: usize = 41; // 40042: bool
pub const R_LABEL_SENSOR_OK: usize = 42; // 40043: bool
pub const R_LABEL_STOCK: usize = 43; // 40044: uint16 %

// Scanner01
pub const R_BARCODE_OK: usize = 45; // 40046: bool
pub const R_RESCAN_COUNT: usize = 46; // 40047: uint16

// Labeller02
pub const R_HAZARD_REQUIRED: usize = 48; // 40049: bool
pub const R_HAZARD_APPLIED: usize = 49; // 40050: bool
pub const R_HAZARD_STOCK: usize = 50; // 40051: uint16 %

// RejectPusher01
pub const R_REJECT_TRIGGERED: usize = 52; // 40053: bool
pub const R_REJECT_REASON: usize = 53; // 40054: uint16 (0=none, see RejectReason)
pub const R_PUSHER_CYCLE_MS: usize = 54; // 40055–40056: uint32 ms

/// Value encoding of a mapped register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegType {
    U16,
    U32,
    F32,
    Bool,
}

impl RegType {
    pub fn word_count(self) -> usize {
        match self {
            RegType::U16 | RegType::Bool => 1,
            RegType::U32 | RegType::F32 => 2,
        }
    }
}

/// One row of the documented register map. The table drives both the
/// simulator's write path and the test decode path, so the external contract
/// has a single source of truth.
#[derive(Debug, Clone, Copy)]
pub struct RegisterSpec {
    pub name: &'static str,
    pub addr: usize,
    pub ty: RegType,
}

pub const REGISTER_MAP: &[RegisterSpec] = &[
    RegisterSpec { name: "line_state", addr: R_LINE_STATE, ty: RegType::U16 },
    RegisterSpec { name: "line_speed_bpm", addr: R_LINE_SPEED, ty: RegType::F32 },
    RegisterSpec { name: "good_count", addr: R_GOOD_COUNT, ty: RegType::U32 },
    RegisterSpec { name: "reject_count", addr: R_REJECT_COUNT, ty: RegType::U32 },
    RegisterSpec { name: "order_index", addr: R_ORDER_IDX, ty: RegType::U16 },
    RegisterSpec { name: "sku_index", addr: R_SKU_IDX, ty: RegType::U16 },
    RegisterSpec { name: "stop_code", addr: R_STOP_CODE, ty: RegType::U16 },
    RegisterSpec { name: "fault_code", addr: R_FAULT_CODE, ty: RegType::U16 },
    RegisterSpec { name: "order_seq", addr: R_ORDER_SEQ, ty: RegType::U16 },
    RegisterSpec { name: "sim_speed_x10", addr: R_SIM_SPEED_X10, ty: RegType::U16 },
    RegisterSpec { name: "bottle_presence", addr: R_BOTTLE_PRESENCE, ty: RegType::Bool },
    RegisterSpec { name: "infeed_rate_bpm", addr: R_INFEED_RATE, ty: RegType::F32 },
    RegisterSpec { name: "starved", addr: R_STARVED, ty: RegType::Bool },
    RegisterSpec { name: "jam_detected", addr: R_JAM_DETECTED, ty: RegType::Bool },
    RegisterSpec { name: "target_weight_g", addr: R_TARGET_WEIGHT, ty: RegType::F32 },
    RegisterSpec { name: "actual_weight_g", addr: R_ACTUAL_WEIGHT, ty: RegType::F32 },
    RegisterSpec { name: "fill_time_ms", addr: R_FILL_TIME_MS, ty: RegType::U32 },
    RegisterSpec { name: "scale_stable", addr: R_SCALE_STABLE, ty: RegType::Bool },
    RegisterSpec { name: "drip_sensor", addr: R_DRIP_SENSOR, ty: RegType::Bool },
    RegisterSpec { name: "torque_target_ncm", addr: R_TORQUE_TARGET, ty: RegType::F32 },
    RegisterSpec { name: "torque_actual_ncm", addr: R_TORQUE_ACTUAL, ty: RegType::F32 },
    RegisterSpec { name: "torque_in_spec", addr: R_TORQUE_IN_SPEC, ty: RegType::Bool },
    RegisterSpec { name: "cap_feed_ok", addr: R_CAP_FEED_OK, ty: RegType::Bool },
    RegisterSpec { name: "gross_weight_g", addr: R_GROSS_WEIGHT, ty: RegType::F32 },
    RegisterSpec { name: "weight_in_spec", addr: R_WEIGHT_IN_SPEC, ty: RegType::Bool },
    RegisterSpec { name: "rezero_active", addr: R_REZERO_ACTIVE, ty: RegType::Bool },
    RegisterSpec { name: "label_applied", addr: R_LABEL_APPLIED, ty: RegType::Bool },
    RegisterSpec { name: "label_sensor_ok", addr: R_LABEL_SENSOR_OK, ty: RegType::Bool },
    RegisterSpec { name: "label_stock_pct", addr: R_LABEL_STOCK, ty: RegType::U16 },
    RegisterSpec { name: "barcode_read_ok", addr: R_BARCODE_OK, ty: RegType::Bool },
    RegisterSpec { name: "rescan_count", addr: R_RESCAN_COUNT, ty: RegType::U16 },
    RegisterSpec { name: "hazard_required", addr: R_HAZARD_REQUIRED, ty: RegType::Bool },
    RegisterSpec { name: "hazard_applied", addr: R_HAZARD_APPLIED, ty: RegType::Bool },
    RegisterSpec { name: "hazard_stock_pct", addr: R_HAZARD_STOCK, ty: RegType::U16 },
    RegisterSpec { name: "reject_triggered", addr: R_REJECT_TRIGGERED, ty: RegType::Bool },
    RegisterSpec { name: "reject_reason", addr: R_REJECT_REASON, ty: RegType::U16 },
    RegisterSpec { name: "pusher_cycle_ms", addr: R_PUSHER_CYCLE_MS, ty: RegType::U32 },
];

// -- Pack/unpack helpers ---------------------------------------------------

/// Split a float32 into (high word, low word), big-endian.
pub fn pack_f32(value: f32) -> (u16, u16) {
    let bits = value.to_bits();
    ((bits >> 16) as u16, bits as u16)
}

pub fn unpack_f32(high: u16, low: u16) -> f32 {
    f32::from_bits(((high as u32) << 16) | low as u32)
}

/// Split a uint32 into (high word, low word), big-endian.
pub fn pack_u32(value: u32) -> (u16, u16) {
    ((value >> 16) as u16, value as u16)
}

pub fn unpack_u32(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}

pub fn bool_word(value: bool) -> u16 {
    u16::from(value)
}

// -- Staging image ---------------------------------------------------------

/// The simulator's private working copy of the register array. Writes land
/// here during a tick; [`RegisterBank::publish`] makes them visible.
#[derive(Clone)]
pub struct RegisterImage {
    words: [u16; TOTAL_REGISTERS],
}

impl Default for RegisterImage {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterImage {
    pub fn new() -> Self {
        Self { words: [0; TOTAL_REGISTERS] }
    }

    pub fn set_u16(&mut self, addr: usize, value: u16) {
        self.words[addr] = value;
    }

    pub fn set_bool(&mut self, addr: usize, value: bool) {
        self.words[addr] = bool_word(value);
    }

    pub fn set_u32(&mut self, addr: usize, value: u32) {
        let (h, l) = pack_u32(value);
        self.words[addr] = h;
        self.words[addr + 1] = l;
    }

    pub fn set_f32(&mut self, addr: usize, value: f32) {
        let (h, l) = pack_f32(value);
        self.words[addr] = h;
        self.words[addr + 1] = l;
    }

    pub fn get_u16(&self, addr: usize) -> u16 {
        self.words[addr]
    }

    pub fn get_bool(&self, addr: usize) -> bool {
        self.words[addr] != 0
    }

    pub fn get_u32(&self, addr: usize) -> u32 {
        unpack_u32(self.words[addr], self.words[addr + 1])
    }

    pub fn get_f32(&self, addr: usize) -> f32 {
        unpack_f32(self.words[addr], self.words[addr + 1])
    }

    pub fn words(&self) -> &[u16; TOTAL_REGISTERS] {
        &self.words
    }
}

// -- Published bank --------------------------------------------------------

/// The snapshot the Modbus server reads. Exactly one writer (the simulator
/// tick) publishes; any number of sessions snapshot concurrently.
pub struct RegisterBank {
    published: RwLock<[u16; TOTAL_REGISTERS]>,
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterBank {
    pub fn new() -> Self {
        Self { published: RwLock::new([0; TOTAL_REGISTERS]) }
    }

    /// Atomically replace the published image with the staged one.
    pub fn publish(&self, image: &RegisterImage) {
        *self.published.write() = image.words;
    }

    /// Coherent copy of `count` registers starting at `start`, or `None`
    /// when the range falls outside the bank.
    pub fn snapshot(&self, start: usize, count: usize) -> Option<Vec<u16>> {
        let end = start.checked_add(count)?;
        if count == 0 || end > TOTAL_REGISTERS {
            return None;
        }
        let guard = self.published.read();
        Some(guard[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_round_trip_is_exact() {
        for v in [0.0f32, 1.5, -273.15, 98.6, 1.0e-6, 512.25] {
            let (h, l) = pack_f32(v);
            assert_eq!(unpack_f32(h, l), v);
        }
    }

    #[test]
    fn u32_round_trip_and_word_order() {
        let (h, l) = pack_u32(0x0001_0000);
        assert_eq!((h, l), (1, 0));
        assert_eq!(unpack_u32(h, l), 0x0001_0000);

        let (h, l) = pack_u32(0xDEAD_BEEF);
        assert_eq!((h, l), (0xDEAD, 0xBEEF));
    }

    #[test]
    fn register_map_fits_bank_without_overlap() {
        let mut occupied = [false; TOTAL_REGISTERS];
        for spec in REGISTER_MAP {
            for w in 0..spec.ty.word_count() {
                let addr = spec.addr + w;
                assert!(addr < TOTAL_REGISTERS, "{} out of range", spec.name);
                assert!(!occupied[addr], "{} overlaps at {}", spec.name, addr);
                occupied[addr] = true;
            }
        }
    }

    #[test]
    fn snapshot_rejects_out_of_range_reads() {
        let bank = RegisterBank::new();
        assert!(bank.snapshot(0, TOTAL_REGISTERS).is_some());
        assert!(bank.snapshot(0, 0).is_none());
        assert!(bank.snapshot(TOTAL_REGISTERS - 1, 2).is_none());
        assert!(bank.snapshot(usize::MAX, 1).is_none());
    }

    #[test]
    fn publish_makes_staged_words_visible() {
        let bank = RegisterBank::new();
        let mut image = RegisterImage::new();
        image.set_u32(R_GOOD_COUNT, 0xFFFE);
        image.set_f32(R_LINE_SPEED, 99.5);

        // Nothing visible before publish.
        assert_eq!(bank.snapshot(R_GOOD_COUNT, 2).unwrap(), vec![0, 0]);

        bank.publish(&image);
        let words = bank.snapshot(R_GOOD_COUNT, 2).unwrap();
        assert_eq!(unpack_u32(words[0], words[1]), 0xFFFE);
        let words = bank.snapshot(R_LINE_SPEED, 2).unwrap();
        assert_eq!(unpack_f32(words[0], words[1]), 99.5);
    }
}
