//! PLC-style on-delay counters and the current-state/status finite
//! automata built on top of them (C7).

use crate::model::{CurrState, HealthGrade, OccurrenceClusterList, Status};

/// A PLC-style counter: counts ticks of a condition being true, saturating
/// at `preset`, and exposes `out` once the preset is reached. Resets to
/// zero the instant the condition goes false.
#[derive(Debug, Clone, Copy)]
pub struct OnDelayCounter {
    counts: u32,
    preset: u32,
    pub out: bool,
}

impl OnDelayCounter {
    pub fn new(initial: u32, preset: u32) -> Self {
        Self {
            counts: initial,
            preset: preset.max(1),
            out: false,
        }
    }

    pub fn tick(&mut self, cond: bool) {
        if cond {
            self.counts += 1;
            if self.counts >= self.preset {
                self.counts = self.preset;
                self.out = true;
            }
        } else {
            self.counts = 0;
            self.out = false;
        }
    }
}

/// States of [`CurrStateAutomaton`]. Includes OFF, unlike `Status`/`CurrState`'s
/// plain four-way scale, because this automaton also tracks an "off" input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CsaState {
    Off,
    Undefined,
    Ok,
    Warning,
    Error,
}

/// Assigns a current state based on four independent on-delay-debounced
/// input flags (err/off/ok/warn), each sharing the same debounce preset.
/// Permanent actions on entering ERROR/WARNING also raise an alarm via the
/// caller-supplied sink.
pub struct CurrStateAutomaton {
    state: CsaState,
    err_counter: OnDelayCounter,
    off_counter: OnDelayCounter,
    ok_counter: OnDelayCounter,
    warn_counter: OnDelayCounter,
    pub curr_state: CurrState,
    pub health_from_app: HealthGrade,
}

impl CurrStateAutomaton {
    pub fn new(count_thres: u32) -> Self {
        Self {
            state: CsaState::Undefined,
            err_counter: OnDelayCounter::new(0, count_thres),
            off_counter: OnDelayCounter::new(0, count_thres),
            ok_counter: OnDelayCounter::new(0, count_thres),
            warn_counter: OnDelayCounter::new(0, count_thres),
            curr_state: CurrState::Undefined,
            health_from_app: HealthGrade::Undefined,
        }
    }

    /// Advance the automaton by one cycle. `raise_alarm(name, ts)` is
    /// invoked for the "Bad input data" (ERROR) / "Stall detected"
    /// (WARNING) permanent actions.
    pub fn execute(
        &mut self,
        rts: i64,
        err_flag: bool,
        off_flag: bool,
        ok_flag: bool,
        warn_flag: bool,
        mut raise_alarm: impl FnMut(&str, i64),
    ) {
        self.err_counter.tick(err_flag);
        self.off_counter.tick(off_flag);
        self.ok_counter.tick(ok_flag);
        self.warn_counter.tick(warn_flag);

        loop {
            let mut again = false;
            self.health_from_app = HealthGrade::Undefined;

            match self.state {
                CsaState::Off => {
                    if self.err_counter.out {
                        self.state = CsaState::Error;
                        again = true;
                    } else if !self.off_counter.out {
                        self.state = CsaState::Undefined;
                        again = true;
                    } else {
                        self.curr_state = CurrState::Undefined;
                    }
                }
                CsaState::Undefined => {
                    if self.err_counter.out {
                        self.state = CsaState::Error;
                        again = true;
                    } else if self.off_counter.out {
                        self.state = CsaState::Off;
                        again = true;
                    } else if self.warn_counter.out {
                        self.state = CsaState::Warning;
                        again = true;
                    } else if self.ok_counter.out {
                        self.state = CsaState::Ok;
                        again = true;
                    } else {
                        self.curr_state = CurrState::Undefined;
                    }
                }
                CsaState::Error => {
                    if !self.err_counter.out {
                        self.state = CsaState::Undefined;
                        again = true;
                    } else {
                        self.health_from_app = HealthGrade::Error;
                        raise_alarm("Bad input data", rts);
                        self.curr_state = CurrState::Undefined;
                    }
                }
                CsaState::Ok => {
                    if self.err_counter.out {
                        self.state = CsaState::Error;
                        again = true;
                    } else if self.off_counter.out {
                        self.state = CsaState::Off;
                        again = true;
                    } else if self.warn_counter.out {
                        self.state = CsaState::Warning;
                        again = true;
                    } else {
                        self.curr_state = CurrState::Ok;
                    }
                }
                CsaState::Warning => {
                    if self.err_counter.out {
                        self.state = CsaState::Error;
                        again = true;
                    } else if self.off_counter.out {
                        self.state = CsaState::Off;
                        again = true;
                    } else if self.ok_counter.out {
                        self.state = CsaState::Ok;
                        again = true;
                    } else {
                        self.curr_state = CurrState::Warning;
                        raise_alarm("Stall detected", rts);
                    }
                }
            }

            if !again {
                break;
            }
        }
    }
}

/// `>`,`<`,`>=`,`<=`,`==`,`!=` comparator used by [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

pub fn eval_cond(first: u32, cond: Cmp, second: u32) -> bool {
    match cond {
        Cmp::Eq => first == second,
        Cmp::Ne => first != second,
        Cmp::Gt => first > second,
        Cmp::Ge => first >= second,
        Cmp::Lt => first < second,
        Cmp::Le => first <= second,
    }
}

/// Threshold-on-occurrence-counts condition for [`StatusAutomaton`]
/// transitions: ANDs three comparisons over the last `total_occs`
/// occurrences of current-state.
#[derive(Debug, Clone)]
pub struct Condition {
    total_occs: u32,
    ok_cond: Cmp,
    num_of_ok_occs: u32,
    warn_cond: Cmp,
    num_of_warn_occs: u32,
    undef_cond: Cmp,
    num_of_undef_occs: u32,
}

impl Condition {
    pub fn new(
        total_occs: u32,
        ok_cond: Cmp,
        num_of_ok_occs: u32,
        warn_cond: Cmp,
        num_of_warn_occs: u32,
        undef_cond: Cmp,
        num_of_undef_occs: u32,
    ) -> Self {
        assert!(
            num_of_ok_occs + num_of_warn_occs + num_of_undef_occs <= total_occs,
            "num_of_ok_occs + num_of_warn_occs + num_of_undef_occs > total_occs"
        );
        Self {
            total_occs,
            ok_cond,
            num_of_ok_occs,
            warn_cond,
            num_of_warn_occs,
            undef_cond,
            num_of_undef_occs,
        }
    }

    pub fn matches(&self, occs: &OccurrenceClusterList<CurrState>) -> bool {
        let last_occs = occs.get_slice_with_last_n_occurrences(self.total_occs);
        let ok = last_occs.count_occurrences_of_value(&CurrState::Ok);
        let undef = last_occs.count_occurrences_of_value(&CurrState::Undefined);
        let warn = last_occs.count_occurrences_of_value(&CurrState::Warning);
        eval_cond(ok, self.ok_cond, self.num_of_ok_occs)
            && eval_cond(undef, self.undef_cond, self.num_of_undef_occs)
            && eval_cond(warn, self.warn_cond, self.num_of_warn_occs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaState {
    Undefined,
    Ok,
    Warning,
    Error,
}

/// Assigns a status based on the distribution of current-state occurrences
/// over a trailing window, optimistically preferring OK over WARNING when
/// both conditions would match.
pub struct StatusAutomaton {
    state: SaState,
    pub status: Status,
    undef_cond: Condition,
    ok_from_undef_cond: Condition,
    ok_from_warn_cond: Condition,
    warn_cond: Condition,
}

impl StatusAutomaton {
    pub fn new(undef_cond: Condition, ok_from_undef_cond: Condition, ok_from_warn_cond: Condition, warn_cond: Condition) -> Self {
        Self {
            state: SaState::Undefined,
            status: Status::Undefined,
            undef_cond,
            ok_from_undef_cond,
            ok_from_warn_cond,
            warn_cond,
        }
    }

    pub fn execute(&mut self, all_occs: &OccurrenceClusterList<CurrState>) {
        loop {
            let mut again = false;
            match self.state {
                SaState::Undefined => {
                    if self.ok_from_undef_cond.matches(all_occs) {
                        self.state = SaState::Ok;
                        again = true;
                    } else if self.warn_cond.matches(all_occs) {
                        self.state = SaState::Warning;
                        again = true;
                    } else {
                        self.status = Status::Undefined;
                    }
                }
                SaState::Ok => {
                    if self.warn_cond.matches(all_occs) {
                        self.state = SaState::Warning;
                        again = true;
                    } else if self.undef_cond.matches(all_occs) {
                        self.state = SaState::Undefined;
                        again = true;
                    } else {
                        self.status = Status::Ok;
                    }
                }
                SaState::Warning => {
                    if self.ok_from_warn_cond.matches(all_occs) {
                        self.state = SaState::Ok;
                        again = true;
                    } else if self.undef_cond.matches(all_occs) {
                        self.state = SaState::Undefined;
                        again = true;
                    } else {
                        self.status = Status::Warning;
                    }
                }
                SaState::Error => {
                    // reachable only if a future caller drives the automaton there;
                    // the source conditions never transition into it directly.
                    self.status = Status::Error;
                }
            }
            if !again {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_delay_counter_saturates_and_resets() {
        let mut c = OnDelayCounter::new(0, 3);
        c.tick(true);
        assert!(!c.out);
        c.tick(true);
        assert!(!c.out);
        c.tick(true);
        assert!(c.out);
        c.tick(false);
        assert!(!c.out);
    }

    #[test]
    fn curr_state_automaton_enters_error_and_raises_alarm() {
        let mut automaton = CurrStateAutomaton::new(1);
        let mut alarms = Vec::new();
        automaton.execute(1000, true, false, false, false, |name, ts| alarms.push((name.to_string(), ts)));
        assert_eq!(automaton.curr_state, CurrState::Undefined);
        assert_eq!(automaton.health_from_app, HealthGrade::Error);
        assert_eq!(alarms, vec![("Bad input data".to_string(), 1000)]);
    }

    #[test]
    fn curr_state_automaton_settles_ok() {
        let mut automaton = CurrStateAutomaton::new(1);
        automaton.execute(0, false, false, true, false, |_, _| {});
        assert_eq!(automaton.curr_state, CurrState::Ok);
    }

    #[test]
    fn status_automaton_prefers_ok_over_warning_from_undefined() {
        let undef = Condition::new(5, Cmp::Le, 0, Cmp::Ge, 0, Cmp::Ge, 5);
        let ok_from_undef = Condition::new(5, Cmp::Ge, 5, Cmp::Le, 0, Cmp::Le, 0);
        let ok_from_warn = Condition::new(5, Cmp::Ge, 5, Cmp::Le, 0, Cmp::Le, 0);
        let warn = Condition::new(5, Cmp::Le, 5, Cmp::Ge, 1, Cmp::Le, 5);

        let mut occs = OccurrenceClusterList::new();
        for _ in 0..5 {
            occs.append_occurrence(CurrState::Ok);
        }

        let mut automaton = StatusAutomaton::new(undef, ok_from_undef, ok_from_warn, warn);
        automaton.execute(&occs);
        assert_eq!(automaton.status, Status::Ok);
    }
}
