//! Liquid base and SKU catalogue.
//!
//! Mirrors the Material_Defs sheet of the master-data workbook; the workbook
//! loader is an external collaborator, so the catalogue ships built in. Fill
//! targets derive from volume × liquid density, fill time from the global
//! line fill rate.

/// Line fill rate, millilitres per second.
pub const FILL_RATE_ML_PER_SEC: f64 = 120.0;

/// Sentinel for "no order / no SKU" in the index registers.
pub const IDLE_INDEX: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiquidBase {
    pub base_id: &'static str,
    pub name: &'static str,
    pub density_g_ml: f64,
    pub carbonated: bool,
    /// CIP cadence: orders between CIPs for still liquids; 0 means CIP on
    /// every liquid change.
    pub cip_after_orders: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sku {
    pub sku_id: &'static str,
    pub name: &'static str,
    pub liquid_base_id: &'static str,
    pub volume_ml: f64,
    pub torque_target_ncm: f64,
    pub hazard_flag: bool,
    pub market: &'static str,
    pub label_group: &'static str,
    pub nominal_speed_bpm: f64,
    pub work_master_id: &'static str,
}

impl Sku {
    pub fn liquid_base(&self) -> &'static LiquidBase {
        LIQUID_BASES
            .iter()
            .find(|b| b.base_id == self.liquid_base_id)
            .expect("catalogue lists a base for every SKU")
    }

    /// Net fill target in grams.
    pub fn target_weight_g(&self) -> f64 {
        self.volume_ml * self.liquid_base().density_g_ml
    }

    pub fn fill_time_ms(&self) -> u32 {
        (self.volume_ml / FILL_RATE_ML_PER_SEC * 1000.0) as u32
    }

    /// Large formats queue longer at the filler and skew the microstop mix.
    pub fn is_large_volume(&self) -> bool {
        self.volume_ml >= 2000.0
    }
}

pub const LIQUID_BASES: &[LiquidBase] = &[
    LiquidBase { base_id: "BASE-LEM", name: "Lemon Base", density_g_ml: 1.01, carbonated: false, cip_after_orders: 4 },
    LiquidBase { base_id: "BASE-DL", name: "Diet Lemon Base", density_g_ml: 1.02, carbonated: false, cip_after_orders: 4 },
    LiquidBase { base_id: "BASE-COL", name: "Cola Base", density_g_ml: 1.04, carbonated: true, cip_after_orders: 0 },
    LiquidBase { base_id: "BASE-DC", name: "Diet Cola Base", density_g_ml: 1.02, carbonated: true, cip_after_orders: 0 },
];

pub const SKUS: &[Sku] = &[
    Sku { sku_id: "LEM-200-IE", name: "Lemon 200mL", liquid_base_id: "BASE-LEM", volume_ml: 200.0, torque_target_ncm: 32.0, hazard_flag: false, market: "IE", label_group: "LBL-A", nominal_speed_bpm: 120.0, work_master_id: "WM-001" },
    Sku { sku_id: "LEM-500-IE", name: "Lemon 500mL", liquid_base_id: "BASE-LEM", volume_ml: 500.0, torque_target_ncm: 34.0, hazard_flag: false, market: "IE", label_group: "LBL-A", nominal_speed_bpm: 100.0, work_master_id: "WM-002" },
    Sku { sku_id: "LEM-2L-IE", name: "Lemon 2L", liquid_base_id: "BASE-LEM", volume_ml: 2000.0, torque_target_ncm: 36.0, hazard_flag: false, market: "IE", label_group: "LBL-A", nominal_speed_bpm: 60.0, work_master_id: "WM-003" },
    Sku { sku_id: "LEM-6L-IE", name: "Lemon 6L", liquid_base_id: "BASE-LEM", volume_ml: 6000.0, torque_target_ncm: 40.0, hazard_flag: false, market: "IE", label_group: "LBL-A", nominal_speed_bpm: 30.0, work_master_id: "WM-004" },
    Sku { sku_id: "DL-200-IE", name: "Diet Lemon 200mL", liquid_base_id: "BASE-DL", volume_ml: 200.0, torque_target_ncm: 32.0, hazard_flag: false, market: "IE", label_group: "LBL-B", nominal_speed_bpm: 120.0, work_master_id: "WM-001" },
    Sku { sku_id: "DL-500-IE", name: "Diet Lemon 500mL", liquid_base_id: "BASE-DL", volume_ml: 500.0, torque_target_ncm: 34.0, hazard_flag: false, market: "IE", label_group: "LBL-B", nominal_speed_bpm: 100.0, work_master_id: "WM-002" },
    Sku { sku_id: "COL-500-IE", name: "Cola 500mL", liquid_base_id: "BASE-COL", volume_ml: 500.0, torque_target_ncm: 34.0, hazard_flag: false, market: "IE", label_group: "LBL-C", nominal_speed_bpm: 95.0, work_master_id: "WM-005" },
    Sku { sku_id: "COL-2L-IE", name: "Cola 2L", liquid_base_id: "BASE-COL", volume_ml: 2000.0, torque_target_ncm: 36.0, hazard_flag: false, market: "IE", label_group: "LBL-C", nominal_speed_bpm: 55.0, work_master_id: "WM-005" },
    Sku { sku_id: "DC-500-IE", name: "Diet Cola 500mL IE", liquid_base_id: "BASE-DC", volume_ml: 500.0, torque_target_ncm: 34.0, hazard_flag: true, market: "IE", label_group: "LBL-D", nominal_speed_bpm: 95.0, work_master_id: "WM-006" },
    Sku { sku_id: "DC-500-UK", name: "Diet Cola 500mL UK", liquid_base_id: "BASE-DC", volume_ml: 500.0, torque_target_ncm: 34.0, hazard_flag: true, market: "UK", label_group: "LBL-E", nominal_speed_bpm: 95.0, work_master_id: "WM-006" },
];

pub fn get_sku(sku_id: &str) -> Option<&'static Sku> {
    SKUS.iter().find(|s| s.sku_id == sku_id)
}

/// 0-based catalogue index for the `sku_index` register.
pub fn sku_index(sku_id: &str) -> u16 {
    SKUS.iter()
        .position(|s| s.sku_id == sku_id)
        .map_or(IDLE_INDEX, |i| i as u16)
}
