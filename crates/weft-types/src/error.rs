use thiserror::Error;

/// Failure raised by user routine code.
///
/// Routines return `Err(RoutineError)` instead of unwinding; the engine wraps
/// the error with the strand stack of the failing strand before surfacing it
/// as [`RuntimeFault::UserRoutine`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RoutineError(pub String);

impl RoutineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for RoutineError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<RuntimeFault> for RoutineError {
    fn from(fault: RuntimeFault) -> Self {
        Self::new(fault.to_string())
    }
}

/// Engine-level fault. Every variant preserves the offending message and,
/// where a strand is implicated, its rendered stack.
///
/// Faults propagate to the caller of `run`; nothing is retried. Cancellation
/// is not a fault — cancelled strands simply stop being scheduled.
#[derive(Debug, Error)]
pub enum RuntimeFault {
    /// A strand suspended on a foreign future without publishing an effect.
    #[error("Strand suspended without yielding an effect, in\n{stack}")]
    NonEffectYield { stack: String },

    /// An effect reached the dispatcher in a position it cannot handle.
    #[error("Unhandled effect {effect}, in\n{stack}")]
    UnhandledEffect { effect: String, stack: String },

    /// Parked strands remained at shutdown, neither done nor cancelled.
    #[error("Hanging strands detected waiting for {effect}, in\n{stack}")]
    HangingStrands { effect: String, stack: String },

    /// A race that must cancel its losers found more than one entrant
    /// already completed.
    #[error("Race between strands that are already completed, in\n{stack}")]
    RaceAlreadyResolved { stack: String },

    /// A race over zero entrants can never produce a winner.
    #[error("Race over an empty set of strands, in\n{stack}")]
    EmptyRace { stack: String },

    /// An intercept effect was yielded while test mode was off.
    #[error("Cannot intercept outside of test mode, in\n{stack}")]
    InterceptOutsideTestMode { stack: String },

    /// A user routine failed; the original message is preserved.
    #[error("Exception caught at\n{stack}\n{source}")]
    UserRoutine {
        stack: String,
        #[source]
        source: RoutineError,
    },

    /// The result of a strand was read before it completed.
    #[error("Tried to get the result of a strand that is still running")]
    StrandStillRunning,

    /// The root strand was cancelled before it could complete.
    #[error("Root strand was cancelled before completing")]
    RootCancelled,
}
