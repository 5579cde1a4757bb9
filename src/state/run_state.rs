/// Lifecycle state definitions for a crawling session
use std::fmt;

/// Represents the current lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    /// Constructed, accepting tasks and rules, not yet started
    Idle,

    /// Dispatcher cycles are running
    Running,

    /// No new task starts; already started tasks run to completion
    Paused,

    /// Pending tasks were dropped; in-flight tasks finish, then the session ends
    Stopped,

    /// Every admitted task reached a terminal outcome; the grace window is open
    Draining,

    /// Final counts have been emitted; the session no longer changes
    Finished,
}

impl RunState {
    /// Returns true once the session can no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Returns true if new tasks may be assigned an id and begin fetching
    pub fn accepts_starts(&self) -> bool {
        matches!(self, Self::Running | Self::Draining)
    }

    /// Returns true if newly added tasks are queued rather than ignored
    pub fn accepts_admissions(&self) -> bool {
        !matches!(self, Self::Stopped | Self::Finished)
    }

    /// Checks whether moving from `self` to `next` is a legal transition
    ///
    /// ```text
    /// Idle -> Running -> {Paused <-> Running} -> Draining -> Finished
    ///            |                                  |
    ///            +-> Stopped -> Draining            +-> Running (late task)
    /// ```
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Paused)
                | (Running, Stopped)
                | (Running, Draining)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Draining, Running)
                | (Draining, Paused)
                | (Draining, Stopped)
                | (Draining, Finished)
                | (Stopped, Draining)
                | (Stopped, Finished)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Draining => "draining",
            Self::Finished => "finished",
        };
        f.write_str(name)
    }
}
