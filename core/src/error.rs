//! Error types for the connection core.
//!
//! # Design
//! Every failure the core can observe lands in `ConnError`. Callers rarely
//! care about the exact variant; they care whether the connection is gone
//! (`Fatal`), whether the core itself was driven incorrectly (`Invariant`),
//! or whether only their call was refused (`Rejected`). `ConnError::class`
//! answers that question so tests and hosts can branch on it without
//! matching every variant.

use std::fmt;

use crate::parser::ParseError;
use crate::queue::RequestId;
use crate::state::{ConnState, Signal};

/// Coarse classification of a `ConnError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The connection was terminated. Every queued request is affected.
    Fatal,

    /// The core was driven in a way its invariants forbid.
    Invariant,

    /// A caller operation was refused; connection state is unchanged.
    Rejected,
}

/// A broken internal invariant. These indicate a bug in the host or in the
/// core, never a misbehaving peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invariant {
    /// Response bytes arrived while no request was queued.
    DataWithoutRequest,

    /// A response completed for a request that is not the queue head.
    CompletionOutOfOrder {
        head: Option<RequestId>,
        completed: RequestId,
    },

    /// The state machine was asked to take an edge it does not have.
    IllegalTransition { from: ConnState, signal: Signal },
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invariant::DataWithoutRequest => write!(f, "data received with an empty request queue"),
            Invariant::CompletionOutOfOrder { head, completed } => match head {
                Some(head) => write!(f, "request {completed} completed while {head} is the queue head"),
                None => write!(f, "request {completed} completed with an empty queue"),
            },
            Invariant::IllegalTransition { from, signal } => {
                write!(f, "no transition from {} on {signal:?}", from.as_str())
            }
        }
    }
}

/// Errors surfaced by `Client` and its components.
#[derive(Debug)]
pub enum ConnError {
    /// The socket reported a failure.
    Transport(String),

    /// TLS setup or record processing failed.
    Tls(String),

    /// The peer sent bytes that are not a valid HTTP/1.x response.
    Parse(ParseError),

    /// The peer switched protocols but nobody registered for upgrades.
    UnhandledUpgrade,

    /// See `Invariant`.
    Invariant(Invariant),

    /// The connection hit a transport fault earlier and accepts no new work.
    Dead,

    /// The id does not name a queued request.
    UnknownRequest(RequestId),
}

impl ConnError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ConnError::Transport(_)
            | ConnError::Tls(_)
            | ConnError::Parse(_)
            | ConnError::UnhandledUpgrade => ErrorClass::Fatal,
            ConnError::Invariant(_) => ErrorClass::Invariant,
            ConnError::Dead | ConnError::UnknownRequest(_) => ErrorClass::Rejected,
        }
    }

    pub fn is_invariant_violation(&self) -> bool {
        self.class() == ErrorClass::Invariant
    }
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnError::Transport(msg) => write!(f, "transport error: {msg}"),
            ConnError::Tls(msg) => write!(f, "tls error: {msg}"),
            ConnError::Parse(err) => write!(f, "parse error: {err}"),
            ConnError::UnhandledUpgrade => write!(f, "protocol upgrade with no upgrade observer"),
            ConnError::Invariant(inv) => write!(f, "invariant violated: {inv}"),
            ConnError::Dead => write!(f, "connection is dead"),
            ConnError::UnknownRequest(id) => write!(f, "unknown request {id}"),
        }
    }
}

impl std::error::Error for ConnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnError::Parse(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ParseError> for ConnError {
    fn from(err: ParseError) -> Self {
        ConnError::Parse(err)
    }
}

impl From<Invariant> for ConnError {
    fn from(inv: Invariant) -> Self {
        ConnError::Invariant(inv)
    }
}

impl From<rustls::Error> for ConnError {
    fn from(err: rustls::Error) -> Self {
        ConnError::Tls(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_faults_are_fatal() {
        assert_eq!(ConnError::Transport("reset".into()).class(), ErrorClass::Fatal);
        assert_eq!(ConnError::Tls("bad record".into()).class(), ErrorClass::Fatal);
        assert_eq!(ConnError::UnhandledUpgrade.class(), ErrorClass::Fatal);
    }

    #[test]
    fn invariant_violations_are_distinct_from_fatal() {
        let err = ConnError::from(Invariant::DataWithoutRequest);
        assert!(err.is_invariant_violation());
        assert_ne!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn rejected_calls_leave_connection_alone() {
        assert_eq!(ConnError::Dead.class(), ErrorClass::Rejected);
        assert_eq!(ConnError::UnknownRequest(RequestId::new()).class(), ErrorClass::Rejected);
    }

    #[test]
    fn illegal_transition_names_state() {
        let err = ConnError::from(Invariant::IllegalTransition {
            from: ConnState::Dead,
            signal: Signal::Establish,
        });
        assert_eq!(err.to_string(), "invariant violated: no transition from dead on Establish");
    }
}
