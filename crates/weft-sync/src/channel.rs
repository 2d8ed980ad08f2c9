use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use uuid::Uuid;
use weft_types::{Ctx, Effect, Value};

/// Bounded queue with blocking `put` and `get`.
///
/// A put delivers straight to a parked getter when one exists, buffers while
/// the buffer has room, and otherwise parks with its value until a getter
/// frees a slot. A get drains the buffer (promoting the oldest parked put
/// into the freed slot), takes directly from a parked put when the buffer is
/// empty, and otherwise parks. Parked operations carry cancel hooks that
/// retract them — and their values — when their strand is cancelled.
#[derive(Clone)]
pub struct Channel {
    state: Rc<RefCell<ChannelState>>,
    capacity: usize,
    key_prefix: String,
}

#[derive(Default)]
struct ChannelState {
    buffer: VecDeque<Value>,
    pending_puts: VecDeque<(u64, Value)>,
    pending_gets: VecDeque<u64>,
    next_ticket: u64,
}

enum PutAction {
    Delivered(u64, Value),
    Buffered,
    Parked(u64),
}

enum GetAction {
    Taken(Value, Option<u64>),
    Parked(u64),
}

impl Channel {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Rc::default(),
            capacity,
            key_prefix: format!("chan.{}", Uuid::new_v4()),
        }
    }

    fn put_key(&self, ticket: u64) -> String {
        format!("{}.put.{}", self.key_prefix, ticket)
    }

    fn get_key(&self, ticket: u64) -> String {
        format!("{}.get.{}", self.key_prefix, ticket)
    }

    /// Whether a get could complete without parking.
    pub fn has_work(&self) -> bool {
        let state = self.state.borrow();
        !state.buffer.is_empty() || !state.pending_puts.is_empty()
    }

    pub async fn put(&self, ctx: &Ctx, value: Value) {
        let action = {
            let mut state = self.state.borrow_mut();
            if let Some(getter) = state.pending_gets.pop_front() {
                PutAction::Delivered(getter, value)
            } else if state.buffer.len() < self.capacity {
                state.buffer.push_back(value);
                PutAction::Buffered
            } else {
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                state.pending_puts.push_back((ticket, value));
                PutAction::Parked(ticket)
            }
        };
        match action {
            PutAction::Delivered(getter, value) => {
                ctx.perform(Effect::broadcast_immediate(self.get_key(getter), value))
                    .await;
            }
            PutAction::Buffered => {}
            PutAction::Parked(ticket) => {
                let state = Rc::clone(&self.state);
                let retract = move || {
                    state
                        .borrow_mut()
                        .pending_puts
                        .retain(|(queued, _)| *queued != ticket);
                };
                ctx.perform(Effect::receive(self.put_key(ticket)).with_cancel_hook(retract))
                    .await;
            }
        }
    }

    pub async fn get(&self, ctx: &Ctx) -> Value {
        let action = {
            let mut state = self.state.borrow_mut();
            if let Some(value) = state.buffer.pop_front() {
                let promoted = state.pending_puts.pop_front().map(|(ticket, queued)| {
                    state.buffer.push_back(queued);
                    ticket
                });
                GetAction::Taken(value, promoted)
            } else if let Some((ticket, value)) = state.pending_puts.pop_front() {
                // zero-capacity rendezvous
                GetAction::Taken(value, Some(ticket))
            } else {
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                state.pending_gets.push_back(ticket);
                GetAction::Parked(ticket)
            }
        };
        match action {
            GetAction::Taken(value, woken_put) => {
                if let Some(ticket) = woken_put {
                    ctx.perform(Effect::broadcast_immediate(
                        self.put_key(ticket),
                        Value::unit(),
                    ))
                    .await;
                }
                value
            }
            GetAction::Parked(ticket) => {
                let state = Rc::clone(&self.state);
                let retract = move || {
                    state
                        .borrow_mut()
                        .pending_gets
                        .retain(|queued| *queued != ticket);
                };
                ctx.perform(Effect::receive(self.get_key(ticket)).with_cancel_hook(retract))
                    .await
            }
        }
    }
}
