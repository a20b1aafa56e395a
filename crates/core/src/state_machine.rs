//! Bot State Machine
//!
//! Tracks the conversational posture of the bot for one session. Transitions
//! follow an explicit adjacency table; anything outside the table is rejected
//! and leaves the machine untouched. `idle` is the initial state and can be
//! reached from every other state in one step.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// The five postures the bot can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotState {
    Idle,
    Listening,
    Thinking,
    Speaking,
    Working,
}

impl BotState {
    pub const ALL: [BotState; 5] = [
        BotState::Idle,
        BotState::Listening,
        BotState::Thinking,
        BotState::Speaking,
        BotState::Working,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BotState::Idle => "idle",
            BotState::Listening => "listening",
            BotState::Thinking => "thinking",
            BotState::Speaking => "speaking",
            BotState::Working => "working",
        }
    }

    /// Animation tag the avatar frontend plays while in this state.
    pub fn animation(&self) -> &'static str {
        match self {
            BotState::Idle => "idle_breathe",
            BotState::Listening => "listen_attentive",
            BotState::Thinking => "think_ponder",
            BotState::Speaking => "talk",
            BotState::Working => "work_typing",
        }
    }

    /// Whether new user input may cut this state short.
    ///
    /// Thinking and working hold an in-flight turn; input arriving then is
    /// queued rather than interleaved.
    pub fn is_interruptible(&self) -> bool {
        matches!(
            self,
            BotState::Idle | BotState::Listening | BotState::Speaking
        )
    }

    /// States reachable from this one through a normal transition.
    pub fn successors(&self) -> &'static [BotState] {
        match self {
            BotState::Idle => &[BotState::Listening, BotState::Thinking, BotState::Speaking],
            BotState::Listening => &[BotState::Thinking, BotState::Idle],
            BotState::Thinking => &[BotState::Speaking, BotState::Working, BotState::Idle],
            BotState::Speaking => &[BotState::Idle, BotState::Listening],
            BotState::Working => &[BotState::Thinking, BotState::Speaking, BotState::Idle],
        }
    }

    pub fn can_transition_to(&self, next: BotState) -> bool {
        self.successors().contains(&next)
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal transition from {from} to {to}")]
    Illegal { from: BotState, to: BotState },
}

/// A completed state change.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: BotState,
    pub to: BotState,
    pub reason: String,
    pub forced: bool,
    /// Time spent in `from` before leaving it.
    pub dwell: Duration,
}

#[derive(Debug, Clone, Default)]
struct StateStats {
    visits: u64,
    exits: u64,
    total_dwell: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateDiagnostics {
    pub state: BotState,
    pub visits: u64,
    pub average_dwell_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub current: BotState,
    pub states: Vec<StateDiagnostics>,
    pub forced_transitions: usize,
    pub recent: Vec<(BotState, BotState)>,
}

/// Per-session automaton with a bounded transition log.
#[derive(Debug)]
pub struct StateMachine {
    current: BotState,
    entered_at: Instant,
    history: VecDeque<Transition>,
    history_limit: usize,
    stats: HashMap<BotState, StateStats>,
    notifier: watch::Sender<BotState>,
}

impl StateMachine {
    pub fn new(history_limit: usize) -> Self {
        let (notifier, _) = watch::channel(BotState::Idle);
        let mut stats: HashMap<BotState, StateStats> = HashMap::new();
        stats.entry(BotState::Idle).or_default().visits = 1;
        Self {
            current: BotState::Idle,
            entered_at: Instant::now(),
            history: VecDeque::with_capacity(history_limit),
            history_limit: history_limit.max(1),
            stats,
            notifier,
        }
    }

    pub fn current(&self) -> BotState {
        self.current
    }

    /// Time spent in the current state so far.
    pub fn dwell(&self) -> Duration {
        self.entered_at.elapsed()
    }

    /// Subscribes to state changes. The receiver always holds the latest state.
    pub fn observe(&self) -> watch::Receiver<BotState> {
        self.notifier.subscribe()
    }

    /// Moves to `to` if the adjacency table allows it.
    pub fn transition(
        &mut self,
        to: BotState,
        reason: impl Into<String>,
    ) -> Result<Transition, TransitionError> {
        if !self.current.can_transition_to(to) {
            debug!(from = %self.current, to = %to, "Rejected illegal transition");
            return Err(TransitionError::Illegal {
                from: self.current,
                to,
            });
        }
        Ok(self.apply(to, reason.into(), false))
    }

    /// Moves to `to` regardless of the adjacency table. Reserved for error recovery.
    pub fn force(&mut self, to: BotState, reason: impl Into<String>) -> Transition {
        self.apply(to, reason.into(), true)
    }

    fn apply(&mut self, to: BotState, reason: String, forced: bool) -> Transition {
        let from = self.current;
        let dwell = self.entered_at.elapsed();

        let leaving = self.stats.entry(from).or_default();
        leaving.exits += 1;
        leaving.total_dwell += dwell;
        self.stats.entry(to).or_default().visits += 1;

        if forced {
            warn!(%from, %to, forced = true, %reason, "Forced state transition");
        } else {
            debug!(%from, %to, forced = false, %reason, "State transition");
        }

        let transition = Transition {
            from,
            to,
            reason,
            forced,
            dwell,
        };
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());

        self.current = to;
        self.entered_at = Instant::now();
        self.notifier.send_replace(to);
        transition
    }

    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let states = BotState::ALL
            .iter()
            .map(|state| {
                let stats = self.stats.get(state).cloned().unwrap_or_default();
                let average_dwell_ms = if stats.exits == 0 {
                    0
                } else {
                    (stats.total_dwell.as_millis() / u128::from(stats.exits)) as u64
                };
                StateDiagnostics {
                    state: *state,
                    visits: stats.visits,
                    average_dwell_ms,
                }
            })
            .collect();
        Diagnostics {
            current: self.current,
            states,
            forced_transitions: self.history.iter().filter(|t| t.forced).count(),
            recent: self.history.iter().map(|t| (t.from, t.to)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let machine = StateMachine::new(16);
        assert_eq!(machine.current(), BotState::Idle);
        assert_eq!(machine.history().count(), 0);
    }

    #[test]
    fn illegal_transitions_are_rejected_and_leave_state_unchanged() {
        for from in BotState::ALL {
            for to in BotState::ALL {
                if from.can_transition_to(to) {
                    continue;
                }
                let mut machine = StateMachine::new(16);
                if from != BotState::Idle {
                    machine.force(from, "setup");
                }
                let before = machine.history().count();
                let err = machine.transition(to, "test").unwrap_err();
                assert_eq!(err, TransitionError::Illegal { from, to });
                assert_eq!(machine.current(), from);
                assert_eq!(machine.history().count(), before);
            }
        }
    }

    #[test]
    fn idle_is_reachable_from_every_state_in_one_step() {
        for state in BotState::ALL {
            if state == BotState::Idle {
                continue;
            }
            assert!(state.can_transition_to(BotState::Idle), "{state} cannot reach idle");
        }
    }

    #[test]
    fn tool_turn_sequence_is_legal() {
        let mut machine = StateMachine::new(16);
        for next in [
            BotState::Thinking,
            BotState::Working,
            BotState::Speaking,
            BotState::Idle,
        ] {
            machine.transition(next, "turn").unwrap();
        }
        let path: Vec<_> = machine.history().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![
                BotState::Thinking,
                BotState::Working,
                BotState::Speaking,
                BotState::Idle
            ]
        );
    }

    #[test]
    fn forced_transitions_are_marked() {
        let mut machine = StateMachine::new(16);
        machine.transition(BotState::Listening, "audio").unwrap();
        let t = machine.force(BotState::Working, "recovery");
        assert!(t.forced);
        assert_eq!(machine.current(), BotState::Working);
        assert_eq!(machine.diagnostics().forced_transitions, 1);
    }

    #[test]
    fn history_is_bounded() {
        let mut machine = StateMachine::new(3);
        for _ in 0..5 {
            machine.transition(BotState::Listening, "a").unwrap();
            machine.transition(BotState::Idle, "b").unwrap();
        }
        assert_eq!(machine.history().count(), 3);
    }

    #[test]
    fn observers_see_latest_state() {
        let mut machine = StateMachine::new(4);
        let rx = machine.observe();
        machine.transition(BotState::Thinking, "turn").unwrap();
        assert_eq!(*rx.borrow(), BotState::Thinking);
    }

    #[tokio::test(start_paused = true)]
    async fn diagnostics_track_visits_and_dwell() {
        let mut machine = StateMachine::new(16);
        machine.transition(BotState::Thinking, "turn").unwrap();
        tokio::time::advance(Duration::from_millis(400)).await;
        machine.transition(BotState::Idle, "done").unwrap();
        machine.transition(BotState::Thinking, "turn").unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;
        machine.transition(BotState::Idle, "done").unwrap();

        let diag = machine.diagnostics();
        let thinking = diag
            .states
            .iter()
            .find(|s| s.state == BotState::Thinking)
            .unwrap();
        assert_eq!(thinking.visits, 2);
        assert_eq!(thinking.average_dwell_ms, 300);
        let idle = diag.states.iter().find(|s| s.state == BotState::Idle).unwrap();
        assert_eq!(idle.visits, 3);
    }
}
