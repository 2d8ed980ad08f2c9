use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use uuid::Uuid;
use weft_types::{Ctx, Effect, RoutineError, Value};

/// FIFO mutual exclusion for strands.
///
/// Acquirers queue on tickets; each parked acquirer waits on its own
/// broadcast key with a cancel hook that retracts the ticket, so cancelling
/// a waiting strand leaves the queue consistent. Release hands the lock to
/// the next ticket with an immediate broadcast.
#[derive(Clone)]
pub struct Lock {
    state: Rc<RefCell<LockState>>,
    key_prefix: String,
}

#[derive(Default)]
struct LockState {
    queue: VecDeque<u64>,
    next_ticket: u64,
}

/// Proof of acquisition; releasing consumes it.
#[derive(Debug)]
pub struct LockGuard {
    ticket: u64,
}

impl Lock {
    pub fn new() -> Self {
        Self {
            state: Rc::default(),
            key_prefix: format!("lock.{}", Uuid::new_v4()),
        }
    }

    fn slot_key(&self, ticket: u64) -> String {
        format!("{}.{}", self.key_prefix, ticket)
    }

    /// Take the lock, parking behind earlier acquirers.
    pub async fn acquire(&self, ctx: &Ctx) -> LockGuard {
        let (ticket, must_wait) = {
            let mut state = self.state.borrow_mut();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let must_wait = !state.queue.is_empty();
            state.queue.push_back(ticket);
            (ticket, must_wait)
        };
        if must_wait {
            let state = Rc::clone(&self.state);
            let retract = move || {
                state.borrow_mut().queue.retain(|queued| *queued != ticket);
            };
            ctx.perform(Effect::receive(self.slot_key(ticket)).with_cancel_hook(retract))
                .await;
        }
        LockGuard { ticket }
    }

    /// Release the lock, waking the next queued acquirer.
    ///
    /// Fails when `guard` does not hold this lock (a guard from another
    /// lock instance).
    pub async fn release(&self, ctx: &Ctx, guard: LockGuard) -> Result<(), RoutineError> {
        let next = {
            let mut state = self.state.borrow_mut();
            match state.queue.front() {
                Some(&holder) if holder == guard.ticket => {
                    state.queue.pop_front();
                }
                _ => return Err(RoutineError::new("lock released out of turn")),
            }
            state.queue.front().copied()
        };
        if let Some(next) = next {
            // immediate, so the hand-off happens before anything queued
            // behind this release gets a turn
            ctx.perform(Effect::broadcast_immediate(self.slot_key(next), Value::unit()))
                .await;
        }
        Ok(())
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}
