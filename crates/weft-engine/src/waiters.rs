use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use weft_types::{ReceivePredicate, Strand, StrandId};

/// Key into the waiter table. One flat namespace with two prefixes:
/// `broadcast.<key>` for message routing and `done.<strand-id>` for joins
/// and races.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum WaitKey {
    Broadcast(String),
    Done(StrandId),
}

impl fmt::Display for WaitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast(key) => write!(f, "broadcast.{key}"),
            Self::Done(id) => write!(f, "done.{id}"),
        }
    }
}

/// One registered callback in the waiter table. Entries are visited in
/// registration order; an entry either consumes the resolution (and is
/// removed) or stays registered.
pub(crate) enum Waiter {
    /// A strand parked on a broadcast key. A predicate miss keeps it
    /// registered without consuming.
    Receive {
        strand: StrandId,
        predicate: Option<ReceivePredicate>,
    },
    /// A strand parked on a child's completion key.
    Join { strand: StrandId },
    /// One leg of a race, sharing its bookkeeping with the other legs.
    Race {
        strand: StrandId,
        entry: usize,
        state: Rc<RefCell<RaceState>>,
    },
}

impl Waiter {
    pub(crate) fn strand(&self) -> StrandId {
        match self {
            Self::Receive { strand, .. } | Self::Join { strand } | Self::Race { strand, .. } => {
                *strand
            }
        }
    }
}

/// Shared bookkeeping for one `First` effect. The first completion settles
/// the race; later completions of other entrants are ignored.
pub(crate) struct RaceState {
    pub(crate) caller: StrandId,
    pub(crate) entrants: Vec<Strand>,
    pub(crate) cancel_losers: bool,
    pub(crate) ensure_cancel: bool,
    pub(crate) received: bool,
}
