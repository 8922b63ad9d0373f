//! Connection state machine.
//!
//! # Design
//! The machine is a pure transition table: it knows nothing about sockets,
//! parsers or queues. `apply` moves to the next state and returns a `Step`
//! telling the caller which side effect the edge implies. Keeping the table
//! here, away from the I/O handlers, makes every edge (including the single
//! automatic-reconnect edge) something a test can name and drive directly.

use crate::error::Invariant;

/// Lifecycle state of the one transport a `Client` owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No transport. Initial state and the state after any teardown.
    Closed,

    /// Transport requested, not yet confirmed.
    Opening,

    /// Ready to carry request/response traffic.
    Open,

    /// An unrecoverable transport fault occurred.
    Dead,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Closed => "closed",
            ConnState::Opening => "opening",
            ConnState::Open => "open",
            ConnState::Dead => "dead",
        }
    }
}

/// Inputs that move the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Establish,
    Connected,
    Error,
    /// The transport closed cleanly. `head_sent` records whether the queue
    /// head had already put bytes on the wire.
    Ended { head_sent: bool },
    /// Local close after the last response the connection will carry.
    Finish,
    Destroy,
}

/// Side effect implied by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Create the transport and ask the host to connect.
    Connect,
    /// Write the queue head's buffered bytes.
    FlushHead,
    /// Report a fatal transport fault.
    Fail,
    /// Tear the transport down and establish again.
    Reconnect,
    /// Nothing can be done: the head already sent bytes.
    Stall,
    /// Tear the transport down.
    Teardown,
}

#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnState,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnState::Closed,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn apply(&mut self, signal: Signal) -> Result<Step, Invariant> {
        use ConnState::*;

        let (next, step) = match (self.state, signal) {
            (_, Signal::Destroy) => (Closed, Step::Teardown),
            (Closed, Signal::Establish) => (Opening, Step::Connect),
            (Opening, Signal::Connected) => (Open, Step::FlushHead),
            (Opening | Open, Signal::Error) => (Dead, Step::Fail),
            (Opening | Open, Signal::Ended { head_sent: false }) => (Closed, Step::Reconnect),
            (current @ (Opening | Open), Signal::Ended { head_sent: true }) => (current, Step::Stall),
            (Open, Signal::Finish) => (Closed, Step::Teardown),
            (from, signal) => return Err(Invariant::IllegalTransition { from, signal }),
        };

        log::trace!("state {} -> {} on {signal:?}", self.state.as_str(), next.as_str());
        self.state = next;
        Ok(step)
    }
}
