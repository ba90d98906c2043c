//! Line state machine: states, stop codes, transition table, and the
//! precedence-based trigger arbiter.
//!
//! The machine owns nothing but the current state. Each tick the simulator
//! assembles a [`TriggerSet`] from its active episodes and schedule blocks;
//! [`select`] picks the highest-precedence permissible target, and
//! [`StateMachine::apply`] records the transition. Event emission stays with
//! the caller so lifecycle events and `StateChanged` can be sequenced.

use serde::{Deserialize, Serialize};

/// Operational mode of the line. STARVED and BLOCKED are distinct states in
/// the machine but fold to the STOPPED register code on the Modbus surface,
/// distinguished there by `stop_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LineState {
    Idle,
    Running,
    Microstop,
    Stopped,
    Fault,
    Changeover,
    Cip,
    Starved,
    Blocked,
}

impl LineState {
    /// Value written to the `line_state` holding register.
    pub fn register_code(self) -> u16 {
        match self {
            LineState::Idle => 0,
            LineState::Running => 1,
            LineState::Microstop => 2,
            LineState::Stopped | LineState::Starved | LineState::Blocked => 3,
            LineState::Fault => 4,
            LineState::Changeover => 5,
            LineState::Cip => 6,
        }
    }

    /// Arbitration rank; higher wins when triggers collide in one tick.
    fn precedence(self) -> u8 {
        match self {
            LineState::Fault => 8,
            LineState::Cip => 7,
            LineState::Changeover => 6,
            LineState::Blocked => 5,
            LineState::Starved => 4,
            LineState::Stopped => 3,
            LineState::Microstop => 2,
            LineState::Running => 1,
            LineState::Idle => 0,
        }
    }
}

impl std::fmt::Display for LineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LineState::Idle => "IDLE",
            LineState::Running => "RUNNING",
            LineState::Microstop => "MICROSTOP",
            LineState::Stopped => "STOPPED",
            LineState::Fault => "FAULT",
            LineState::Changeover => "CHANGEOVER",
            LineState::Cip => "CIP",
            LineState::Starved => "STARVED",
            LineState::Blocked => "BLOCKED",
        };
        f.write_str(name)
    }
}

/// Stop and fault codes as exposed in events and the `stop_code` register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopCode {
    #[serde(rename = "MS01")] Ms01,
    #[serde(rename = "MS02")] Ms02,
    #[serde(rename = "MS03")] Ms03,
    #[serde(rename = "MS04")] Ms04,
    #[serde(rename = "MS05")] Ms05,
    #[serde(rename = "MS06")] Ms06,
    #[serde(rename = "MS07")] Ms07,
    #[serde(rename = "MS08")] Ms08,
    #[serde(rename = "MS09")] Ms09,
    #[serde(rename = "MS10")] Ms10,
    #[serde(rename = "ST01")] St01,
    #[serde(rename = "ST02")] St02,
    #[serde(rename = "ST03")] St03,
    #[serde(rename = "ST04")] St04,
    #[serde(rename = "ST05")] St05,
    #[serde(rename = "ST06")] St06,
    #[serde(rename = "ST07")] St07,
    #[serde(rename = "ST08")] St08,
    #[serde(rename = "ST09")] St09,
    #[serde(rename = "ST10")] St10,
    #[serde(rename = "BD-M1")] BdM1,
    #[serde(rename = "BD-M2")] BdM2,
    #[serde(rename = "BD-M3")] BdM3,
}

impl StopCode {
    /// Value written to the `stop_code` holding register.
    pub fn register_value(self) -> u16 {
        match self {
            StopCode::Ms01 => 1,
            StopCode::Ms02 => 2,
            StopCode::Ms03 => 3,
            StopCode::Ms04 => 4,
            StopCode::Ms05 => 5,
            StopCode::Ms06 => 6,
            StopCode::Ms07 => 7,
            StopCode::Ms08 => 8,
            StopCode::Ms09 => 9,
            StopCode::Ms10 => 10,
            StopCode::St01 => 11,
            StopCode::St02 => 12,
            StopCode::St03 => 13,
            StopCode::St04 => 14,
            StopCode::St05 => 15,
            StopCode::St06 => 16,
            StopCode::St07 => 17,
            StopCode::St08 => 18,
            StopCode::St09 => 19,
            StopCode::St10 => 20,
            StopCode::BdM1 => 21,
            StopCode::BdM2 => 22,
            StopCode::BdM3 => 23,
        }
    }

    /// Value written to the `fault_code` register; 0 for non-fault codes.
    pub fn fault_code(self) -> u16 {
        match self {
            StopCode::BdM1 => 1,
            StopCode::BdM2 => 2,
            StopCode::BdM3 => 3,
            _ => 0,
        }
    }

    pub fn is_microstop(self) -> bool {
        self.register_value() <= 10
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StopCode::Ms01 => "MS01",
            StopCode::Ms02 => "MS02",
            StopCode::Ms03 => "MS03",
            StopCode::Ms04 => "MS04",
            StopCode::Ms05 => "MS05",
            StopCode::Ms06 => "MS06",
            StopCode::Ms07 => "MS07",
            StopCode::Ms08 => "MS08",
            StopCode::Ms09 => "MS09",
            StopCode::Ms10 => "MS10",
            StopCode::St01 => "ST01",
            StopCode::St02 => "ST02",
            StopCode::St03 => "ST03",
            StopCode::St04 => "ST04",
            StopCode::St05 => "ST05",
            StopCode::St06 => "ST06",
            StopCode::St07 => "ST07",
            StopCode::St08 => "ST08",
            StopCode::St09 => "ST09",
            StopCode::St10 => "ST10",
            StopCode::BdM1 => "BD-M1",
            StopCode::BdM2 => "BD-M2",
            StopCode::BdM3 => "BD-M3",
        }
    }
}

impl std::fmt::Display for StopCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Active triggers observed in one tick. Each flag asserts that the
/// corresponding state has live cause this tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerSet {
    pub fault: bool,
    pub cip: bool,
    pub changeover: bool,
    pub blocked: bool,
    pub starved: bool,
    pub stopped: bool,
    pub microstop: bool,
    pub running: bool,
}

impl TriggerSet {
    fn candidates(self) -> impl Iterator<Item = LineState> {
        [
            (self.fault, LineState::Fault),
            (self.cip, LineState::Cip),
            (self.changeover, LineState::Changeover),
            (self.blocked, LineState::Blocked),
            (self.starved, LineState::Starved),
            (self.stopped, LineState::Stopped),
            (self.microstop, LineState::Microstop),
            (self.running, LineState::Running),
        ]
        .into_iter()
        .filter_map(|(active, state)| active.then_some(state))
    }
}

/// Whether `from → to` appears in the allowed-transition table.
pub fn transition_allowed(from: LineState, to: LineState) -> bool {
    use LineState::*;
    if from == to {
        return false;
    }
    // FAULT is reachable from everywhere.
    if to == Fault {
        return true;
    }
    match from {
        Idle => matches!(to, Running | Changeover | Cip | Stopped),
        Running => matches!(to, Microstop | Stopped | Starved | Blocked | Changeover | Cip | Idle),
        Microstop => matches!(to, Running | Stopped | Idle),
        Stopped => matches!(to, Running | Idle),
        Fault => matches!(to, Running | Stopped | Idle),
        Changeover => matches!(to, Idle | Cip),
        Cip => matches!(to, Idle),
        Starved => matches!(to, Running | Stopped | Idle),
        Blocked => matches!(to, Running | Stopped | Idle),
    }
}

/// Pick the highest-precedence permissible target for the given triggers.
/// With no live trigger the line settles to IDLE. Returns the current state
/// unchanged when nothing permissible outranks it.
pub fn select(current: LineState, triggers: &TriggerSet) -> LineState {
    triggers
        .candidates()
        .filter(|&target| target == current || transition_allowed(current, target))
        .max_by_key(|s| s.precedence())
        .unwrap_or(if transition_allowed(current, LineState::Idle) || current == LineState::Idle {
            LineState::Idle
        } else {
            current
        })
}

/// A committed state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: LineState,
    pub to: LineState,
}

/// Holder of the authoritative `line_state`.
#[derive(Debug)]
pub struct StateMachine {
    state: LineState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self { state: LineState::Idle }
    }

    pub fn state(&self) -> LineState {
        self.state
    }

    /// Evaluate triggers and commit the selected transition, if any.
    pub fn evaluate(&mut self, triggers: &TriggerSet) -> Option<Transition> {
        let target = select(self.state, triggers);
        if target == self.state {
            return None;
        }
        let transition = Transition { from: self.state, to: target };
        self.state = target;
        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_idle() {
        assert_eq!(StateMachine::new().state(), LineState::Idle);
    }

    #[test]
    fn fault_outranks_every_other_trigger() {
        let triggers = TriggerSet {
            fault: true,
            cip: true,
            changeover: true,
            microstop: true,
            running: true,
            ..Default::default()
        };
        assert_eq!(select(LineState::Running, &triggers), LineState::Fault);
        assert_eq!(select(LineState::Microstop, &triggers), LineState::Fault);
        assert_eq!(select(LineState::Idle, &triggers), LineState::Fault);
    }

    #[test]
    fn microstop_beats_running_but_not_stops() {
        let triggers = TriggerSet { microstop: true, running: true, ..Default::default() };
        assert_eq!(select(LineState::Running, &triggers), LineState::Microstop);

        let triggers = TriggerSet { microstop: true, stopped: true, running: true, ..Default::default() };
        assert_eq!(select(LineState::Running, &triggers), LineState::Stopped);
    }

    #[test]
    fn no_triggers_settles_to_idle() {
        assert_eq!(select(LineState::Running, &TriggerSet::default()), LineState::Idle);
        assert_eq!(select(LineState::Cip, &TriggerSet::default()), LineState::Idle);
        assert_eq!(select(LineState::Idle, &TriggerSet::default()), LineState::Idle);
    }

    #[test]
    fn selection_respects_the_transition_table() {
        // A changeover trigger cannot pull the line straight out of CIP;
        // the line falls back to finishing the CIP first.
        let triggers = TriggerSet { changeover: false, cip: true, ..Default::default() };
        assert_eq!(select(LineState::Cip, &triggers), LineState::Cip);

        // CHANGEOVER → RUNNING is not in the table; the machine passes
        // through IDLE between blocks.
        assert!(!transition_allowed(LineState::Changeover, LineState::Running));
        assert!(transition_allowed(LineState::Changeover, LineState::Idle));
        assert!(transition_allowed(LineState::Idle, LineState::Running));
    }

    #[test]
    fn evaluate_reports_transitions_once() {
        let mut machine = StateMachine::new();
        let running = TriggerSet { running: true, ..Default::default() };

        let t = machine.evaluate(&running).expect("transition");
        assert_eq!((t.from, t.to), (LineState::Idle, LineState::Running));
        // Same triggers again: no new transition.
        assert!(machine.evaluate(&running).is_none());
    }

    #[test]
    fn starved_and_blocked_fold_to_stopped_register_code() {
        assert_eq!(LineState::Starved.register_code(), 3);
        assert_eq!(LineState::Blocked.register_code(), 3);
        assert_eq!(LineState::Stopped.register_code(), 3);
        assert_eq!(LineState::Cip.register_code(), 6);
    }

    #[test]
    fn stop_code_register_values_match_the_contract() {
        assert_eq!(StopCode::Ms01.register_value(), 1);
        assert_eq!(StopCode::Ms10.register_value(), 10);
        assert_eq!(StopCode::St01.register_value(), 11);
        assert_eq!(StopCode::St10.register_value(), 20);
        assert_eq!(StopCode::BdM1.register_value(), 21);
        assert_eq!(StopCode::BdM3.register_value(), 23);
        assert_eq!(StopCode::BdM2.fault_code(), 2);
        assert_eq!(StopCode::Ms05.fault_code(), 0);
    }
}
