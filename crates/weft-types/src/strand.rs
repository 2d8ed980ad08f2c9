use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::error::RuntimeFault;
use crate::value::Value;

/// Index of a strand in the engine's arena.
///
/// All engine tables (waiter table, ready deque, live-children lists,
/// blocking-task map) refer to strands by id, never by owning pointer.
///
/// Display: `s<index>`, e.g. `s3`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StrandId(u32);

impl StrandId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StrandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Completion record shared between the engine and every handle to one
/// strand. The engine is the only writer.
#[derive(Debug, Default)]
pub struct StrandShared {
    done: Cell<bool>,
    cancelled: Cell<bool>,
    result: RefCell<Option<Value>>,
}

impl StrandShared {
    pub fn mark_done(&self, result: Value) {
        self.result.replace(Some(result));
        self.done.set(true);
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.set(true);
    }

    pub fn is_done(&self) -> bool {
        self.done.get()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    pub fn result(&self) -> Option<Value> {
        self.result.borrow().clone()
    }
}

/// Handle to a running or finished strand.
///
/// Handles are cheap to clone and remain valid after the strand terminates;
/// they are how routines join, race and cancel the work they forked.
#[derive(Clone, Debug)]
pub struct Strand {
    id: StrandId,
    shared: Rc<StrandShared>,
}

impl Strand {
    pub fn new(id: StrandId, shared: Rc<StrandShared>) -> Self {
        Self { id, shared }
    }

    pub fn id(&self) -> StrandId {
        self.id
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// The strand's return value. Fails while the strand is still running.
    pub fn result(&self) -> Result<Value, RuntimeFault> {
        self.shared.result().ok_or(RuntimeFault::StrandStillRunning)
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Strand[{}]", self.id)
    }
}
