//! Production week schedule.
//!
//! The schedule is a time-ordered list of blocks the simulator executes
//! sequentially: production orders, changeovers, CIP cycles and breaks.
//! A breakdown planned for an order rides along as payload and triggers
//! once at a sampled offset into the run. The built-in week mirrors the
//! Production_Schedule sheet; the workbook loader is an external
//! collaborator that would return the same shape.

use thiserror::Error;

use crate::sku;
use crate::state::StopCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeoverType {
    Label,
    Size,
    Liquid,
}

impl ChangeoverType {
    /// Operator stop code for the changeover class.
    pub fn stop_code(self) -> StopCode {
        match self {
            ChangeoverType::Label => StopCode::St01,
            ChangeoverType::Size => StopCode::St02,
            ChangeoverType::Liquid => StopCode::St03,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    Order {
        sku_id: String,
        planned_qty: u32,
        work_master_id: String,
        /// Major breakdown injected during this order, if planned.
        inject_breakdown: Option<StopCode>,
        /// Sanitation cycle appended after the order completes.
        cip_after: bool,
    },
    Changeover {
        changeover_type: ChangeoverType,
        duration_lo_min: u32,
        duration_hi_min: u32,
    },
    Cip {
        duration_min: u32,
    },
    Break {
        duration_min: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub entry_id: String,
    pub day: &'static str,
    pub shift: &'static str,
    pub kind: BlockKind,
    pub notes: &'static str,
}

impl ScheduleEntry {
    pub fn order(entry_id: &str, day: &'static str, shift: &'static str, wm: &str, sku_id: &str, qty: u32) -> Self {
        Self {
            entry_id: entry_id.into(),
            day,
            shift,
            kind: BlockKind::Order {
                sku_id: sku_id.into(),
                planned_qty: qty,
                work_master_id: wm.into(),
                inject_breakdown: None,
                cip_after: false,
            },
            notes: "",
        }
    }

    pub fn changeover(entry_id: &str, day: &'static str, shift: &'static str, ty: ChangeoverType, lo_min: u32, hi_min: u32) -> Self {
        Self {
            entry_id: entry_id.into(),
            day,
            shift,
            kind: BlockKind::Changeover { changeover_type: ty, duration_lo_min: lo_min, duration_hi_min: hi_min },
            notes: "",
        }
    }

    pub fn cip(entry_id: &str, day: &'static str, shift: &'static str, duration_min: u32) -> Self {
        Self { entry_id: entry_id.into(), day, shift, kind: BlockKind::Cip { duration_min }, notes: "" }
    }

    pub fn lunch_break(entry_id: &str, day: &'static str, shift: &'static str, duration_min: u32) -> Self {
        Self { entry_id: entry_id.into(), day, shift, kind: BlockKind::Break { duration_min }, notes: "" }
    }

    pub fn with_breakdown(mut self, code: StopCode) -> Self {
        if let BlockKind::Order { inject_breakdown, .. } = &mut self.kind {
            *inject_breakdown = Some(code);
        }
        self
    }

    pub fn with_cip_after(mut self) -> Self {
        if let BlockKind::Order { cip_after, .. } = &mut self.kind {
            *cip_after = true;
        }
        self
    }

    pub fn with_notes(mut self, notes: &'static str) -> Self {
        self.notes = notes;
        self
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule is empty")]
    Empty,
    #[error("duplicate entry id {0}")]
    DuplicateId(String),
    #[error("order {entry_id} references unknown SKU {sku_id}")]
    UnknownSku { entry_id: String, sku_id: String },
    #[error("order {0} has planned quantity 0")]
    ZeroQuantity(String),
    #[error("changeover {entry_id} has inverted duration range {lo}..{hi} min")]
    InvertedRange { entry_id: String, lo: u32, hi: u32 },
    #[error("entry {entry_id} injects {code}, which is not a major breakdown code")]
    InvalidBreakdown { entry_id: String, code: StopCode },
    #[error("{entry_id}: {kind} block has zero duration")]
    ZeroDuration { entry_id: String, kind: &'static str },
}

/// Load-time validation. Any failure is fatal at startup (exit code 2).
pub fn validate(entries: &[ScheduleEntry]) -> Result<(), ScheduleError> {
    if entries.is_empty() {
        return Err(ScheduleError::Empty);
    }
    for (i, entry) in entries.iter().enumerate() {
        if entries.iter().skip(i + 1).any(|e| e.entry_id == entry.entry_id) {
            return Err(ScheduleError::DuplicateId(entry.entry_id.clone()));
        }
        match &entry.kind {
            BlockKind::Order { sku_id, planned_qty, inject_breakdown, .. } => {
                if sku::get_sku(sku_id).is_none() {
                    return Err(ScheduleError::UnknownSku {
                        entry_id: entry.entry_id.clone(),
                        sku_id: sku_id.clone(),
                    });
                }
                if *planned_qty == 0 {
                    return Err(ScheduleError::ZeroQuantity(entry.entry_id.clone()));
                }
                if let Some(code) = inject_breakdown {
                    if code.fault_code() == 0 {
                        return Err(ScheduleError::InvalidBreakdown {
                            entry_id: entry.entry_id.clone(),
                            code: *code,
                        });
                    }
                }
            }
            BlockKind::Changeover { duration_lo_min, duration_hi_min, .. } => {
                if duration_lo_min > duration_hi_min {
                    return Err(ScheduleError::InvertedRange {
                        entry_id: entry.entry_id.clone(),
                        lo: *duration_lo_min,
                        hi: *duration_hi_min,
                    });
                }
                if *duration_hi_min == 0 {
                    return Err(ScheduleError::ZeroDuration { entry_id: entry.entry_id.clone(), kind: "changeover" });
                }
            }
            BlockKind::Cip { duration_min } => {
                if *duration_min == 0 {
                    return Err(ScheduleError::ZeroDuration { entry_id: entry.entry_id.clone(), kind: "CIP" });
                }
            }
            BlockKind::Break { duration_min } => {
                if *duration_min == 0 {
                    return Err(ScheduleError::ZeroDuration { entry_id: entry.entry_id.clone(), kind: "break" });
                }
            }
        }
    }
    Ok(())
}

/// The built-in production week.
pub fn built_in_week() -> Vec<ScheduleEntry> {
    use ChangeoverType::*;
    vec![
        // Monday Shift 1
        ScheduleEntry::order("ORD-001", "Mon", "Shift 1", "WM-002", "LEM-500-IE", 4000)
            .with_notes("Opening order"),
        ScheduleEntry::changeover("CO-001", "Mon", "Shift 1", Label, 20, 25)
            .with_notes("Label changeover LBL-A"),
        ScheduleEntry::order("ORD-002", "Mon", "Shift 1", "WM-001", "LEM-200-IE", 3000),
        ScheduleEntry::changeover("CO-002", "Mon", "Shift 1", Size, 40, 50)
            .with_notes("Size change 200mL to 2L"),
        ScheduleEntry::order("ORD-003", "Mon", "Shift 1", "WM-003", "LEM-2L-IE", 1200)
            .with_breakdown(StopCode::BdM1)
            .with_notes("BD-M1 injected"),
        ScheduleEntry::cip("CIP-001", "Mon", "Shift 1", 45).with_notes("After 3rd order"),
        // Monday Shift 2
        ScheduleEntry::changeover("CO-003", "Mon", "Shift 2", Liquid, 60, 90)
            .with_notes("Liquid change Still to Cola"),
        ScheduleEntry::order("ORD-004", "Mon", "Shift 2", "WM-005", "COL-500-IE", 3800),
        ScheduleEntry::order("ORD-005", "Mon", "Shift 2", "WM-006", "DC-500-IE", 2500)
            .with_breakdown(StopCode::BdM2)
            .with_notes("Hazard SKU. BD-M2 injected"),
        ScheduleEntry::lunch_break("BRK-001", "Mon", "Shift 2", 30),
        ScheduleEntry::changeover("CO-004", "Mon", "Shift 2", Size, 35, 45)
            .with_notes("Size change 500mL to 2L"),
        ScheduleEntry::order("ORD-006", "Mon", "Shift 2", "WM-005", "COL-2L-IE", 800),
        // Tuesday Shift 1
        ScheduleEntry::changeover("CO-005", "Tue", "Shift 1", Liquid, 60, 90)
            .with_notes("Liquid change Cola to Lemon"),
        ScheduleEntry::order("ORD-007", "Tue", "Shift 1", "WM-002", "LEM-500-IE", 5000)
            .with_breakdown(StopCode::BdM3)
            .with_notes("BD-M3 injected"),
        ScheduleEntry::order("ORD-008", "Tue", "Shift 1", "WM-002", "LEM-500-IE", 4000)
            .with_notes("Continuation same SKU"),
        ScheduleEntry::changeover("CO-006", "Tue", "Shift 1", Size, 40, 55),
        ScheduleEntry::order("ORD-009", "Tue", "Shift 1", "WM-004", "LEM-6L-IE", 300)
            .with_cip_after()
            .with_notes("6L format. High MS02 risk. CIP after."),
        ScheduleEntry::cip("CIP-002", "Tue", "Shift 1", 45).with_notes("After 4th order"),
        // Tuesday Shift 2
        ScheduleEntry::changeover("CO-007", "Tue", "Shift 2", Liquid, 60, 90),
        ScheduleEntry::order("ORD-010", "Tue", "Shift 2", "WM-006", "DC-500-UK", 2000)
            .with_notes("UK hazard variant"),
        ScheduleEntry::changeover("CO-008", "Tue", "Shift 2", Liquid, 60, 90),
        ScheduleEntry::order("ORD-011", "Tue", "Shift 2", "WM-002", "LEM-500-IE", 4500)
            .with_notes("Long order. Cola to Still."),
        // Wednesday Shift 1
        ScheduleEntry::changeover("CO-009", "Wed", "Shift 1", Size, 35, 50),
        ScheduleEntry::order("ORD-012", "Wed", "Shift 1", "WM-001", "LEM-200-IE", 5000),
        ScheduleEntry::changeover("CO-010", "Wed", "Shift 1", Size, 40, 55),
        ScheduleEntry::order("ORD-013", "Wed", "Shift 1", "WM-003", "LEM-2L-IE", 1500),
        ScheduleEntry::changeover("CO-011", "Wed", "Shift 1", Size, 35, 45),
        ScheduleEntry::order("ORD-014", "Wed", "Shift 1", "WM-002", "LEM-500-IE", 3500)
            .with_cip_after()
            .with_notes("4th order, CIP follows"),
        ScheduleEntry::cip("CIP-003", "Wed", "Shift 1", 45),
        // Wednesday Shift 2
        ScheduleEntry::changeover("CO-012", "Wed", "Shift 2", Liquid, 60, 90),
        ScheduleEntry::order("ORD-015", "Wed", "Shift 2", "WM-005", "COL-500-IE", 4000),
        ScheduleEntry::lunch_break("BRK-002", "Wed", "Shift 2", 30),
        ScheduleEntry::changeover("CO-013", "Wed", "Shift 2", Liquid, 60, 90),
        ScheduleEntry::order("ORD-016", "Wed", "Shift 2", "WM-002", "LEM-500-IE", 3000),
        // Thursday
        ScheduleEntry::order("ORD-017", "Thu", "Shift 1", "WM-002", "LEM-500-IE", 5000)
            .with_notes("Long run"),
        ScheduleEntry::changeover("CO-014", "Thu", "Shift 2", Liquid, 60, 90),
        ScheduleEntry::order("ORD-018", "Thu", "Shift 2", "WM-006", "DC-500-IE", 3500)
            .with_notes("Hazard run"),
        // Friday
        ScheduleEntry::changeover("CO-015", "Fri", "Shift 1", Liquid, 60, 90),
        ScheduleEntry::order("ORD-019", "Fri", "Shift 1", "WM-002", "LEM-500-IE", 4500)
            .with_notes("End of week"),
        ScheduleEntry::changeover("CO-016", "Fri", "Shift 2", Size, 35, 45),
        ScheduleEntry::order("ORD-020", "Fri", "Shift 2", "WM-001", "LEM-200-IE", 4000)
            .with_notes("Final order"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_week_validates() {
        let week = built_in_week();
        validate(&week).expect("built-in schedule must be valid");
        assert_eq!(
            week.iter().filter(|e| matches!(e.kind, BlockKind::Order { .. })).count(),
            20
        );
    }

    #[test]
    fn unknown_sku_is_rejected() {
        let entries = vec![ScheduleEntry::order("ORD-X", "Mon", "Shift 1", "WM-000", "NOPE-1L", 100)];
        assert!(matches!(validate(&entries), Err(ScheduleError::UnknownSku { .. })));
    }

    #[test]
    fn zero_quantity_is_rejected() {
        let entries = vec![ScheduleEntry::order("ORD-X", "Mon", "Shift 1", "WM-002", "LEM-500-IE", 0)];
        assert!(matches!(validate(&entries), Err(ScheduleError::ZeroQuantity(_))));
    }

    #[test]
    fn inverted_changeover_range_is_rejected() {
        let entries = vec![ScheduleEntry::changeover("CO-X", "Mon", "Shift 1", ChangeoverType::Label, 30, 20)];
        assert!(matches!(validate(&entries), Err(ScheduleError::InvertedRange { .. })));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let entries = vec![
            ScheduleEntry::order("ORD-1", "Mon", "Shift 1", "WM-002", "LEM-500-IE", 10),
            ScheduleEntry::order("ORD-1", "Mon", "Shift 1", "WM-002", "LEM-500-IE", 20),
        ];
        assert!(matches!(validate(&entries), Err(ScheduleError::DuplicateId(_))));
    }

    #[test]
    fn microstop_code_cannot_be_planned_as_breakdown() {
        let entries = vec![
            ScheduleEntry::order("ORD-1", "Mon", "Shift 1", "WM-002", "LEM-500-IE", 10)
                .with_breakdown(StopCode::Ms02),
        ];
        assert!(matches!(validate(&entries), Err(ScheduleError::InvalidBreakdown { .. })));
    }
}
