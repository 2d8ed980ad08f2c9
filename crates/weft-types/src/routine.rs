//! The routine side of the engine protocol.
//!
//! A routine is an `async` body polled one step at a time by the engine's
//! single-threaded loop. Suspension is explicit: the routine builds an
//! [`Effect`] and awaits [`Ctx::perform`], which publishes the effect into
//! the strand's [`EffectCell`] and pends. The engine pops the cell, routes
//! the effect, and later resumes the strand by storing a value back into the
//! cell and re-polling. Awaiting any other future pends without publishing,
//! which the engine reports as a fault — there is no external executor here
//! to make progress on it.

use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::effect::Effect;
use crate::error::RoutineError;
use crate::strand::Strand;
use crate::value::Value;

/// What a routine produces when it finishes.
pub type RoutineResult = Result<Value, RoutineError>;

/// A routine body, boxed and pinned for the engine.
pub type RoutineFuture = Pin<Box<dyn Future<Output = RoutineResult>>>;

/// Factory the engine invokes to start a routine on a fresh strand.
pub type RoutineFn = Box<dyn FnOnce(Ctx) -> RoutineFuture>;

/// Mailbox between one strand's routine and the engine: the outgoing effect
/// published at a suspension, and the incoming value set before a resume.
#[derive(Default)]
pub struct EffectCell {
    outgoing: RefCell<Option<Effect>>,
    incoming: RefCell<Option<Value>>,
}

impl EffectCell {
    pub fn publish(&self, effect: Effect) {
        self.outgoing.replace(Some(effect));
    }

    pub fn take_effect(&self) -> Option<Effect> {
        self.outgoing.borrow_mut().take()
    }

    pub fn set_resume(&self, value: Value) {
        self.incoming.replace(Some(value));
    }

    pub fn take_resume(&self) -> Option<Value> {
        self.incoming.borrow_mut().take()
    }
}

/// A routine's handle to its own strand's effect cell.
///
/// Each strand gets its own `Ctx`; routines must suspend through the `Ctx`
/// they were given, not one captured from another routine.
#[derive(Clone)]
pub struct Ctx {
    cell: Rc<EffectCell>,
}

impl Ctx {
    pub fn new(cell: Rc<EffectCell>) -> Self {
        Self { cell }
    }

    /// Suspend on `effect`; resolves to the value the engine resumes with.
    pub fn perform(&self, effect: Effect) -> Perform {
        Perform {
            cell: Rc::clone(&self.cell),
            pending: Some(effect),
        }
    }

    #[track_caller]
    pub fn broadcast(&self, key: impl Into<String>, value: Value) -> Perform {
        self.perform(Effect::broadcast(key, value))
    }

    #[track_caller]
    pub fn broadcast_immediate(&self, key: impl Into<String>, value: Value) -> Perform {
        self.perform(Effect::broadcast_immediate(key, value))
    }

    #[track_caller]
    pub fn receive(&self, key: impl Into<String>) -> Perform {
        self.perform(Effect::receive(key))
    }

    #[track_caller]
    pub fn receive_match(
        &self,
        key: impl Into<String>,
        predicate: impl Fn(&Value) -> bool + 'static,
    ) -> Perform {
        self.perform(Effect::receive_match(key, predicate))
    }

    #[track_caller]
    pub fn call<F, Fut>(&self, name: impl Into<String>, body: F) -> Perform
    where
        F: FnOnce(Ctx) -> Fut + 'static,
        Fut: Future<Output = RoutineResult> + 'static,
    {
        self.perform(Effect::call(name, body))
    }

    #[track_caller]
    pub fn fork<F, Fut>(&self, name: impl Into<String>, body: F) -> Typed<Strand>
    where
        F: FnOnce(Ctx) -> Fut + 'static,
        Fut: Future<Output = RoutineResult> + 'static,
    {
        Typed::new(self.perform(Effect::fork(name, body)))
    }

    #[track_caller]
    pub fn fork_eager<F, Fut>(&self, name: impl Into<String>, body: F) -> Typed<Strand>
    where
        F: FnOnce(Ctx) -> Fut + 'static,
        Fut: Future<Output = RoutineResult> + 'static,
    {
        Typed::new(self.perform(Effect::fork_eager(name, body)))
    }

    #[track_caller]
    pub fn call_blocking<F, R>(&self, name: impl Into<String>, task: F) -> Perform
    where
        F: FnOnce() -> R + Send + 'static,
        R: Any + Send,
    {
        self.perform(Effect::call_blocking(name, task))
    }

    #[track_caller]
    pub fn first(
        &self,
        entrants: Vec<Strand>,
        cancel_losers: bool,
        ensure_cancel: bool,
    ) -> Typed<(usize, Value)> {
        Typed::new(self.perform(Effect::first(entrants, cancel_losers, ensure_cancel)))
    }

    /// First-to-finish with losers cancelled and the winner checked unique.
    #[track_caller]
    pub fn race(&self, entrants: Vec<Strand>) -> Typed<(usize, Value)> {
        self.first(entrants, true, true)
    }

    #[track_caller]
    pub fn cancel(&self, target: &Strand) -> Perform {
        self.perform(Effect::cancel(target.clone()))
    }

    #[track_caller]
    pub fn debug_tree(&self) -> Typed<String> {
        Typed::new(self.perform(Effect::debug_tree()))
    }

    #[track_caller]
    pub fn intercept_any(&self) -> Perform {
        self.perform(Effect::intercept_any())
    }

    #[track_caller]
    pub fn intercept_matching(&self, predicate: impl Fn(&Effect) -> bool + 'static) -> Perform {
        self.perform(Effect::intercept_matching(predicate))
    }
}

/// Future for one suspension: publishes its effect on the first poll, then
/// waits for the engine to store a resume value.
pub struct Perform {
    cell: Rc<EffectCell>,
    pending: Option<Effect>,
}

impl Future for Perform {
    type Output = Value;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Value> {
        let this = self.get_mut();
        if let Some(effect) = this.pending.take() {
            this.cell.publish(effect);
            return Poll::Pending;
        }
        match this.cell.take_resume() {
            Some(value) => Poll::Ready(value),
            None => Poll::Pending,
        }
    }
}

/// [`Perform`] with the resume value downcast to `T`.
///
/// The engine always resumes these effects with the right type; the fallible
/// signature exists because a test interceptor may inject anything.
pub struct Typed<T> {
    inner: Perform,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Typed<T> {
    fn new(inner: Perform) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<T: Any + Clone> Future for Typed<T> {
    type Output = Result<T, RoutineError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(value) => {
                let got = value.type_name();
                Poll::Ready(value.downcast::<T>().ok_or_else(|| {
                    RoutineError::new(format!(
                        "effect resumed with {got} where {} was expected",
                        std::any::type_name::<T>()
                    ))
                }))
            }
        }
    }
}
