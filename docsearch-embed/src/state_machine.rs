//! Lifecycle tracking for a single embedding worker.
//!
//! ```text
//!  Uninitialized ──► Spawning ──► Ready ──► Restarting ──► Spawning ...
//!        │              │  ▲        │  ▲        │
//!        │              ▼  │        ▼  │        ▼
//!        │            Error ◄───────┘  └──── Error
//!        ▼
//!  (any live state) ──► ShuttingDown ──► Shutdown
//! ```
//!
//! Every transition outside the table in [`WorkerState::can_transition_to`] is
//! rejected with [`EmbedError::InvalidTransition`].
use crate::error::{EmbedError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// Number of transitions kept for diagnostics.
const HISTORY_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Uninitialized,
    Spawning,
    Ready,
    Error,
    Restarting,
    ShuttingDown,
    Shutdown,
}

impl WorkerState {
    pub const ALL: [WorkerState; 7] = [
        WorkerState::Uninitialized,
        WorkerState::Spawning,
        WorkerState::Ready,
        WorkerState::Error,
        WorkerState::Restarting,
        WorkerState::ShuttingDown,
        WorkerState::Shutdown,
    ];

    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Uninitialized, Spawning | ShuttingDown)
                | (Spawning, Ready | Error | ShuttingDown)
                | (Ready, Error | Restarting | ShuttingDown)
                | (Error, Restarting | ShuttingDown)
                | (Restarting, Spawning | Error | ShuttingDown)
                | (ShuttingDown, Shutdown)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Uninitialized => "uninitialized",
            WorkerState::Spawning => "spawning",
            WorkerState::Ready => "ready",
            WorkerState::Error => "error",
            WorkerState::Restarting => "restarting",
            WorkerState::ShuttingDown => "shutting_down",
            WorkerState::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: WorkerState,
    pub to: WorkerState,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct WorkerStateMachine {
    worker_id: usize,
    state: WorkerState,
    entered_at: Instant,
    time_in_state: HashMap<WorkerState, Duration>,
    history: VecDeque<Transition>,
}

impl WorkerStateMachine {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            state: WorkerState::Uninitialized,
            entered_at: Instant::now(),
            time_in_state: HashMap::new(),
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn transition(&mut self, to: WorkerState) -> Result<()> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(EmbedError::InvalidTransition { from, to });
        }

        let now = Instant::now();
        *self.time_in_state.entry(from).or_default() += now.duration_since(self.entered_at);
        self.entered_at = now;
        self.state = to;

        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(Transition {
            from,
            to,
            at: Utc::now(),
        });
        tracing::debug!("Worker {} transitioned {} -> {}", self.worker_id, from, to);
        Ok(())
    }

    /// Embedding is only accepted while `Ready`.
    pub fn ensure_ready(&self) -> Result<()> {
        if self.state == WorkerState::Ready {
            Ok(())
        } else {
            Err(EmbedError::NotReady {
                worker: self.worker_id,
                state: self.state,
            })
        }
    }

    /// Cumulative time spent in `state`, including the current stay.
    pub fn time_in(&self, state: WorkerState) -> Duration {
        let past = self.time_in_state.get(&state).copied().unwrap_or_default();
        if state == self.state {
            past + self.entered_at.elapsed()
        } else {
            past
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkerState::*;

    #[test]
    fn test_transition_table_is_exact() {
        let legal = [
            (Uninitialized, Spawning),
            (Uninitialized, ShuttingDown),
            (Spawning, Ready),
            (Spawning, Error),
            (Spawning, ShuttingDown),
            (Ready, Error),
            (Ready, Restarting),
            (Ready, ShuttingDown),
            (Error, Restarting),
            (Error, ShuttingDown),
            (Restarting, Spawning),
            (Restarting, Error),
            (Restarting, ShuttingDown),
            (ShuttingDown, Shutdown),
        ];
        for from in WorkerState::ALL {
            for to in WorkerState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut machine = WorkerStateMachine::new(0);
        let err = machine.transition(Ready).unwrap_err();

        assert!(matches!(
            err,
            EmbedError::InvalidTransition {
                from: Uninitialized,
                to: Ready
            }
        ));
        assert_eq!(machine.state(), Uninitialized);
        assert_eq!(machine.history().count(), 0);
    }

    #[test]
    fn test_embed_requires_ready() {
        let mut machine = WorkerStateMachine::new(3);
        assert!(matches!(
            machine.ensure_ready(),
            Err(EmbedError::NotReady {
                worker: 3,
                state: Uninitialized
            })
        ));

        machine.transition(Spawning).unwrap();
        machine.transition(Ready).unwrap();
        assert!(machine.ensure_ready().is_ok());

        machine.transition(Error).unwrap();
        assert!(machine.ensure_ready().is_err());
    }

    #[test]
    fn test_restart_cycle_records_history_and_time() {
        let mut machine = WorkerStateMachine::new(1);
        for state in [Spawning, Ready, Error, Restarting, Spawning, Ready] {
            machine.transition(state).unwrap();
        }
        std::thread::sleep(Duration::from_millis(5));

        let path: Vec<_> = machine.history().map(|t| (t.from, t.to)).collect();
        assert_eq!(path.len(), 6);
        assert_eq!(path[2], (Ready, Error));
        assert_eq!(path[5], (Spawning, Ready));
        assert!(machine.time_in(Ready) >= Duration::from_millis(5));
        assert_eq!(machine.time_in(Shutdown), Duration::ZERO);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut machine = WorkerStateMachine::new(0);
        machine.transition(Spawning).unwrap();
        machine.transition(Ready).unwrap();
        for _ in 0..40 {
            machine.transition(Restarting).unwrap();
            machine.transition(Spawning).unwrap();
            machine.transition(Ready).unwrap();
        }
        assert_eq!(machine.history().count(), HISTORY_LIMIT);
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let mut machine = WorkerStateMachine::new(0);
        machine.transition(ShuttingDown).unwrap();
        machine.transition(Shutdown).unwrap();
        for to in WorkerState::ALL {
            assert!(machine.transition(to).is_err());
        }
    }
}
