//! The closed state set a [`crate::task::Task`] moves through.
//!
//! The state set never grows at runtime, so it's modeled as a tagged enum
//! with a transition table rather than a name-keyed handler table (see
//! REDESIGN FLAGS in the design notes) — simpler exhaustiveness checking,
//! no dynamic dispatch for something that's closed by construction.

/// One of the four states a task can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Status {
    /// Completed and Failed are terminal: no further transitions apply.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

/// Events that drive transitions between [`Status`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    Complete,
    Fail,
}

/// The current status plus the legal-transition table. Entry/exit side
/// effects (hook firing) are the owning `Task`'s responsibility, not this
/// type's — keeping the state machine itself free of any back-reference to
/// the task it belongs to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StateMachine {
    current: Status,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        Self {
            current: Status::Pending,
        }
    }

    pub(crate) fn current(&self) -> Status {
        self.current
    }

    /// Applies `event`. Returns the new status on a legal transition, or
    /// `None` if the event is a no-op for the current state (including
    /// every event once a terminal state is reached).
    pub(crate) fn apply(&mut self, event: Event) -> Option<Status> {
        let next = match (self.current, event) {
            (Status::Pending, Event::Start) => Status::Running,
            (Status::Running, Event::Complete) => Status::Completed,
            (Status::Running, Event::Fail) => Status::Failed,
            // A task whose dependency already failed is never run at all;
            // it short-circuits straight from Pending to Failed.
            (Status::Pending, Event::Fail) => Status::Failed,
            _ => return None,
        };
        self.current = next;
        Some(next)
    }
}
