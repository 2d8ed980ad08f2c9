//! The scheduler / effect interpreter.
//!
//! `run` builds the root strand, advances it once, then drains work until
//! both the ready deque and the blocking-task inbox are empty. The deque is
//! popped LIFO from the tail so that causally related effects interleave
//! naturally ("I just broadcast, the receivers run, then I continue");
//! deferred effects are pushed at the head instead, yielding their turn to
//! everything already queued.
//!
//! Strands live in an arena and are referred to by id everywhere: the
//! waiter table, the live-children lists, the intercept list and the
//! blocking-task map. A parked strand is reachable from exactly one of
//! those structures; the hanging set mirrors waiter-table and intercept
//! membership so shutdown can report strands that can never resume.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::Location;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::thread;

use tracing::{debug, trace};
use weft_types::{
    CancelHook, Ctx, Effect, EffectCell, EffectKind, EffectPredicate, Intercepted, RoutineError,
    RoutineFn, RoutineFuture, RoutineResult, RuntimeFault, Strand, StrandId, StrandShared, Value,
};

use crate::bridge::{BlockingBridge, TaskDelivery};
use crate::waiters::{RaceState, WaitKey, Waiter};

/// Options for one `run` invocation.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Emit a `debug!` event for every dispatched effect.
    pub debug: bool,
    /// Enable the intercept table. Off by default so production runs pay
    /// nothing for it.
    pub test_mode: bool,
    /// Cap on blocking worker threads. Defaults to the available
    /// parallelism, floored at 4.
    pub max_blocking_workers: Option<usize>,
}

/// Execute `routine` to completion on the calling thread.
///
/// Returns the root strand's result, or the first fault raised — including
/// the hang report when parked strands remain at shutdown.
#[track_caller]
pub fn run<F, Fut>(routine: F) -> Result<Value, RuntimeFault>
where
    F: FnOnce(Ctx) -> Fut + 'static,
    Fut: Future<Output = RoutineResult> + 'static,
{
    run_with(routine, RunOptions::default())
}

/// [`run`] with explicit [`RunOptions`].
#[track_caller]
pub fn run_with<F, Fut>(routine: F, options: RunOptions) -> Result<Value, RuntimeFault>
where
    F: FnOnce(Ctx) -> Fut + 'static,
    Fut: Future<Output = RoutineResult> + 'static,
{
    let caller = Location::caller();
    let mut engine = Engine::new(options);
    let root = engine.spawn(
        Box::new(move |ctx| Box::pin(routine(ctx))),
        None,
        None,
        caller,
    );
    engine.advance(root, None)?;
    engine.drain()?;
    engine.finish(root)
}

fn default_worker_cap() -> usize {
    thread::available_parallelism().map_or(4, |n| n.get().max(4))
}

/// The description and cancel hook of the effect a strand last yielded,
/// kept on the strand so cancellation can run the hook even while the
/// effect itself sits in the ready deque or the intercept machinery.
pub(crate) struct PendingEffect {
    pub(crate) describe: String,
    pub(crate) hook: Option<CancelHook>,
}

pub(crate) struct StrandState {
    pub(crate) routine: Option<RoutineFuture>,
    pub(crate) cell: Rc<EffectCell>,
    pub(crate) shared: Rc<StrandShared>,
    pub(crate) parent: Option<StrandId>,
    /// Description of the parent's effect that spawned this strand.
    pub(crate) spawned_by: Option<String>,
    pub(crate) edge: Option<String>,
    pub(crate) children: Vec<StrandId>,
    pub(crate) current: Option<PendingEffect>,
    /// Waiter-table keys this strand is currently registered under.
    pub(crate) registered: Vec<WaitKey>,
    pub(crate) created_at: &'static Location<'static>,
}

struct ReadyItem {
    strand: StrandId,
    effect: Effect,
}

struct InterceptEntry {
    strand: StrandId,
    predicate: Option<EffectPredicate>,
}

pub(crate) struct Engine {
    pub(crate) strands: Vec<StrandState>,
    ready: VecDeque<ReadyItem>,
    waiting: HashMap<WaitKey, Vec<Waiter>>,
    hanging: HashSet<StrandId>,
    intercepts: Vec<InterceptEntry>,
    bridge: BlockingBridge,
    options: RunOptions,
}

impl Engine {
    fn new(options: RunOptions) -> Self {
        let workers = options.max_blocking_workers.unwrap_or_else(default_worker_cap);
        Self {
            strands: Vec::new(),
            ready: VecDeque::new(),
            waiting: HashMap::new(),
            hanging: HashSet::new(),
            intercepts: Vec::new(),
            bridge: BlockingBridge::new(workers),
            options,
        }
    }

    fn spawn(
        &mut self,
        routine: RoutineFn,
        parent: Option<StrandId>,
        edge: Option<String>,
        created_at: &'static Location<'static>,
    ) -> StrandId {
        let id = StrandId::new(self.strands.len() as u32);
        let cell = Rc::new(EffectCell::default());
        let future = routine(Ctx::new(Rc::clone(&cell)));
        let spawned_by = parent.and_then(|p| {
            self.strands[p.index()]
                .current
                .as_ref()
                .map(|pending| pending.describe.clone())
        });
        if let Some(p) = parent {
            self.strands[p.index()].children.push(id);
        }
        self.strands.push(StrandState {
            routine: Some(future),
            cell,
            shared: Rc::new(StrandShared::default()),
            parent,
            spawned_by,
            edge,
            children: Vec::new(),
            current: None,
            registered: Vec::new(),
            created_at,
        });
        trace!(strand = %id, "spawned");
        id
    }

    fn handle(&self, id: StrandId) -> Strand {
        Strand::new(id, Rc::clone(&self.strands[id.index()].shared))
    }

    fn is_cancelled(&self, id: StrandId) -> bool {
        self.strands[id.index()].shared.is_cancelled()
    }

    /// Step `id` once with an optional resume value. A normal return marks
    /// the strand done and resolves its completion key; a suspension
    /// records the yielded effect and enqueues it.
    fn advance(&mut self, id: StrandId, resume: Option<Value>) -> Result<(), RuntimeFault> {
        let state = &mut self.strands[id.index()];
        if state.shared.is_cancelled() || state.shared.is_done() {
            return Ok(());
        }
        let Some(mut routine) = state.routine.take() else {
            return Ok(());
        };
        state.current = None;
        state.cell.set_resume(resume.unwrap_or_else(Value::unit));

        let waker = Waker::noop();
        let mut poll_cx = Context::from_waker(waker);
        match routine.as_mut().poll(&mut poll_cx) {
            Poll::Ready(Ok(result)) => {
                trace!(strand = %id, "done");
                let parent = {
                    let state = &mut self.strands[id.index()];
                    state.shared.mark_done(result.clone());
                    state.parent
                };
                if let Some(p) = parent {
                    self.strands[p.index()].children.retain(|child| *child != id);
                }
                self.resolve(WaitKey::Done(id), result)
            }
            Poll::Ready(Err(source)) => Err(RuntimeFault::UserRoutine {
                stack: self.stack(id),
                source,
            }),
            Poll::Pending => {
                let state = &mut self.strands[id.index()];
                state.routine = Some(routine);
                match state.cell.take_effect() {
                    Some(effect) => {
                        state.current = Some(PendingEffect {
                            describe: effect.to_string(),
                            hook: effect.cancel_hook(),
                        });
                        self.enqueue(id, effect);
                        Ok(())
                    }
                    None => Err(RuntimeFault::NonEffectYield {
                        stack: self.stack(id),
                    }),
                }
            }
        }
    }

    fn enqueue(&mut self, strand: StrandId, effect: Effect) {
        trace!(strand = %strand, effect = %effect, deferred = effect.deferred(), "enqueue");
        if effect.deferred() {
            self.ready.push_front(ReadyItem { strand, effect });
        } else {
            self.ready.push_back(ReadyItem { strand, effect });
        }
    }

    /// Main loop: drain blocking-task results (blocking only when the deque
    /// is empty), then dispatch the tail of the deque.
    fn drain(&mut self) -> Result<(), RuntimeFault> {
        loop {
            if self.ready.is_empty() && self.bridge.in_flight() == 0 {
                return Ok(());
            }
            while self.bridge.in_flight() > 0 {
                let delivery = if self.ready.is_empty() {
                    self.bridge.recv()
                } else {
                    self.bridge.try_recv()
                };
                let Some(delivery) = delivery else { break };
                self.deliver(delivery)?;
            }
            if let Some(item) = self.ready.pop_back() {
                self.dispatch(item)?;
            }
        }
    }

    fn deliver(&mut self, delivery: TaskDelivery) -> Result<(), RuntimeFault> {
        let strand = delivery.strand;
        if self.is_cancelled(strand) {
            trace!(strand = %strand, "blocking result discarded after cancellation");
            return Ok(());
        }
        match delivery.outcome {
            Ok(value) => self.advance(strand, Some(Value::from_boxed(value))),
            Err(message) => Err(RuntimeFault::UserRoutine {
                stack: self.stack(strand),
                source: RoutineError::new(format!("blocking task panicked: {message}")),
            }),
        }
    }

    fn dispatch(&mut self, item: ReadyItem) -> Result<(), RuntimeFault> {
        let ReadyItem { strand, effect } = item;
        if self.is_cancelled(strand) {
            return Ok(());
        }
        if self.options.debug {
            debug!(strand = %strand, "handling {effect}");
        } else {
            trace!(strand = %strand, "handling {effect}");
        }

        // Interceptors capture any non-intercept effect before it reaches
        // its handler, in registration order.
        if self.options.test_mode && !matches!(effect.kind(), EffectKind::Intercept { .. }) {
            let captured = self
                .intercepts
                .iter()
                .position(|entry| entry.predicate.as_ref().is_none_or(|p| (**p)(&effect)));
            if let Some(position) = captured {
                let entry = self.intercepts.remove(position);
                self.hanging.remove(&entry.strand);
                self.hanging.insert(strand);
                trace!(interceptor = %entry.strand, captured = %effect, "intercepted");
                return self.advance(
                    entry.strand,
                    Some(Value::new(Intercepted::new(effect, strand))),
                );
            }
        }

        let parts = effect.into_parts();
        match parts.kind {
            EffectKind::Broadcast { key, value, .. } => {
                self.resolve(WaitKey::Broadcast(key), value)?;
                self.advance(strand, None)
            }
            EffectKind::Receive { key, predicate } => {
                self.park(
                    strand,
                    WaitKey::Broadcast(key),
                    Waiter::Receive { strand, predicate },
                );
                Ok(())
            }
            EffectKind::Call { routine } => {
                let child = self.spawn(routine, Some(strand), Some(parts.name), parts.caller);
                self.park(strand, WaitKey::Done(child), Waiter::Join { strand });
                self.advance(child, None)
            }
            EffectKind::CallFork { routine, run_first } => {
                let child = self.spawn(routine, Some(strand), Some(parts.name), parts.caller);
                let handle = Value::new(self.handle(child));
                if run_first {
                    self.advance(child, None)?;
                    self.advance(strand, Some(handle))
                } else {
                    self.advance(strand, Some(handle))?;
                    self.advance(child, None)
                }
            }
            EffectKind::CallBlocking { task } => {
                self.bridge.submit(strand, task);
                Ok(())
            }
            EffectKind::First {
                entrants,
                cancel_losers,
                ensure_cancel,
            } => self.begin_race(strand, entrants, cancel_losers, ensure_cancel),
            EffectKind::Cancel { target } => {
                self.cancel_strand(target.id());
                self.advance(strand, None)
            }
            EffectKind::Intercept { predicate } => {
                if !self.options.test_mode {
                    return Err(RuntimeFault::InterceptOutsideTestMode {
                        stack: self.stack(strand),
                    });
                }
                self.intercepts.push(InterceptEntry { strand, predicate });
                self.hanging.insert(strand);
                Ok(())
            }
            EffectKind::Resume { target, value } => {
                if target.index() >= self.strands.len() {
                    return Err(RuntimeFault::UnhandledEffect {
                        effect: format!("Resume({target})"),
                        stack: self.stack(strand),
                    });
                }
                let target_state = &self.strands[target.index()];
                if !target_state.shared.is_cancelled() && !target_state.shared.is_done() {
                    self.hanging.remove(&target);
                    self.advance(target, Some(value))?;
                }
                self.advance(strand, None)
            }
            EffectKind::DebugTree => {
                let tree = self.tree();
                self.advance(strand, Some(Value::new(tree)))
            }
            EffectKind::Wrapper { .. } => Err(RuntimeFault::UnhandledEffect {
                effect: parts.name,
                stack: self.stack(strand),
            }),
        }
    }

    fn park(&mut self, strand: StrandId, key: WaitKey, waiter: Waiter) {
        trace!(strand = %strand, key = %key, "parked");
        self.strands[strand.index()].registered.push(key.clone());
        self.waiting.entry(key).or_default().push(waiter);
        self.hanging.insert(strand);
    }

    fn unpark(&mut self, strand: StrandId) {
        self.hanging.remove(&strand);
        self.strands[strand.index()].registered.clear();
    }

    /// Fan a resolution out to every waiter registered under `key`, in
    /// registration order. Waiters that do not consume (predicate misses)
    /// stay registered, ahead of anything registered mid-resolution.
    fn resolve(&mut self, key: WaitKey, value: Value) -> Result<(), RuntimeFault> {
        let Some(waiters) = self.waiting.remove(&key) else {
            return Ok(());
        };
        trace!(key = %key, waiters = waiters.len(), "resolving");
        let mut kept = Vec::new();
        for waiter in waiters {
            if let Some(back) = self.fire(waiter, &value)? {
                kept.push(back);
            }
        }
        if !kept.is_empty() {
            let slot = self.waiting.entry(key).or_default();
            for (index, waiter) in kept.into_iter().enumerate() {
                slot.insert(index, waiter);
            }
        }
        Ok(())
    }

    /// Invoke one waiter. Returns the waiter when it should stay
    /// registered; entries for cancelled strands are dropped.
    fn fire(&mut self, waiter: Waiter, value: &Value) -> Result<Option<Waiter>, RuntimeFault> {
        if self.is_cancelled(waiter.strand()) {
            return Ok(None);
        }
        match waiter {
            Waiter::Receive { strand, predicate } => {
                if let Some(accepts) = &predicate {
                    if !(**accepts)(value) {
                        return Ok(Some(Waiter::Receive { strand, predicate }));
                    }
                }
                self.unpark(strand);
                self.advance(strand, Some(value.clone()))?;
                Ok(None)
            }
            Waiter::Join { strand } => {
                self.unpark(strand);
                self.advance(strand, Some(value.clone()))?;
                Ok(None)
            }
            Waiter::Race { entry, state, .. } => {
                self.settle_race(&state, entry, value.clone())?;
                Ok(None)
            }
        }
    }

    fn begin_race(
        &mut self,
        caller: StrandId,
        entrants: Vec<Strand>,
        cancel_losers: bool,
        ensure_cancel: bool,
    ) -> Result<(), RuntimeFault> {
        self.hanging.insert(caller);
        if entrants.is_empty() {
            return Err(RuntimeFault::EmptyRace {
                stack: self.stack(caller),
            });
        }
        let done: Vec<usize> = entrants
            .iter()
            .enumerate()
            .filter(|(_, entrant)| entrant.is_done())
            .map(|(index, _)| index)
            .collect();
        if ensure_cancel && done.len() > 1 {
            return Err(RuntimeFault::RaceAlreadyResolved {
                stack: self.stack(caller),
            });
        }
        let ids: Vec<StrandId> = entrants.iter().map(|entrant| entrant.id()).collect();
        let state = Rc::new(std::cell::RefCell::new(RaceState {
            caller,
            entrants,
            cancel_losers,
            ensure_cancel,
            received: false,
        }));
        if let Some(&winner) = done.first() {
            let value = state.borrow().entrants[winner].result()?;
            return self.settle_race(&state, winner, value);
        }
        for (entry, id) in ids.into_iter().enumerate() {
            self.park(
                caller,
                WaitKey::Done(id),
                Waiter::Race {
                    strand: caller,
                    entry,
                    state: Rc::clone(&state),
                },
            );
        }
        Ok(())
    }

    /// Shared race resolver: fires at most once; cancels losers before the
    /// winner's value reaches the racing strand.
    fn settle_race(
        &mut self,
        state: &Rc<std::cell::RefCell<RaceState>>,
        winner: usize,
        value: Value,
    ) -> Result<(), RuntimeFault> {
        let (caller, entrants, cancel_losers, ensure_cancel) = {
            let mut race = state.borrow_mut();
            if race.received {
                return Ok(());
            }
            race.received = true;
            (
                race.caller,
                race.entrants.clone(),
                race.cancel_losers,
                race.ensure_cancel,
            )
        };
        debug_assert!(entrants[winner].is_done());
        for (index, entrant) in entrants.iter().enumerate() {
            if index == winner {
                continue;
            }
            if ensure_cancel && entrant.is_done() {
                return Err(RuntimeFault::RaceAlreadyResolved {
                    stack: self.stack(caller),
                });
            }
            if cancel_losers {
                self.cancel_strand(entrant.id());
            }
        }
        self.unpark(caller);
        self.advance(caller, Some(Value::new((winner, value))))
    }

    /// Cascade cancellation: run the pending effect's cancel hook exactly
    /// once, drop the completion key, retract every registration, cancel
    /// live descendants, then mark the strand.
    fn cancel_strand(&mut self, id: StrandId) {
        if id.index() >= self.strands.len() {
            return;
        }
        {
            let state = &self.strands[id.index()];
            if state.shared.is_done() || state.shared.is_cancelled() {
                return;
            }
        }
        trace!(strand = %id, "cancelling");
        let pending = self.strands[id.index()].current.take();
        if let Some(pending) = pending {
            if let Some(hook) = pending.hook {
                (*hook)();
            }
        }
        // joiners and racers parked on this strand can never resolve now;
        // they are either cancelled alongside or reported as hangs
        self.waiting.remove(&WaitKey::Done(id));
        let registered = std::mem::take(&mut self.strands[id.index()].registered);
        for key in registered {
            if let Some(list) = self.waiting.get_mut(&key) {
                list.retain(|waiter| waiter.strand() != id);
                if list.is_empty() {
                    self.waiting.remove(&key);
                }
            }
        }
        self.hanging.remove(&id);
        self.intercepts.retain(|entry| entry.strand != id);
        let children = self.strands[id.index()].children.clone();
        for child in children {
            self.cancel_strand(child);
        }
        let parent = self.strands[id.index()].parent;
        self.strands[id.index()].shared.mark_cancelled();
        if let Some(p) = parent {
            self.strands[p.index()].children.retain(|child| *child != id);
        }
    }

    /// Shutdown check: any parked strand that is neither done nor cancelled
    /// can never resume.
    fn finish(&mut self, root: StrandId) -> Result<Value, RuntimeFault> {
        for index in 0..self.strands.len() {
            let id = StrandId::new(index as u32);
            if !self.hanging.contains(&id) {
                continue;
            }
            let state = &self.strands[index];
            if state.shared.is_done() || state.shared.is_cancelled() {
                continue;
            }
            let effect = state
                .current
                .as_ref()
                .map_or_else(|| "<no effect>".to_string(), |c| c.describe.clone());
            return Err(RuntimeFault::HangingStrands {
                effect,
                stack: self.stack(id),
            });
        }
        let state = &self.strands[root.index()];
        if state.shared.is_done() {
            state.shared.result().ok_or(RuntimeFault::StrandStillRunning)
        } else {
            Err(RuntimeFault::RootCancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::future::Future;
    use std::rc::Rc;
    use std::time::Duration;

    use weft_types::{Ctx, Effect, Intercepted, RoutineError, RuntimeFault, Value};

    use super::{RunOptions, run, run_with};

    fn int(value: i64) -> Value {
        Value::new(value)
    }

    fn as_int(value: &Value) -> i64 {
        value.downcast::<i64>().expect("an i64 payload")
    }

    /// One round-trip through the blocking pool: everything already queued
    /// runs before this resumes.
    fn flush() -> Effect {
        Effect::call_blocking("flush", || {})
    }

    #[test]
    fn returns_without_suspending() {
        let result = run(|_ctx| async move { Ok(int(3)) }).unwrap();
        assert_eq!(as_int(&result), 3);
    }

    #[test]
    fn broadcast_without_receivers_is_dropped() {
        let result = run(|ctx| async move {
            ctx.broadcast("key", int(1)).await;
            Ok(int(5))
        })
        .unwrap();
        assert_eq!(as_int(&result), 5);
    }

    #[test_log::test]
    fn forked_receiver_gets_the_broadcast() {
        let result = run(|ctx| async move {
            let receiver = ctx
                .fork("receiver", |c: Ctx| async move { Ok(c.receive("key").await) })
                .await?;
            ctx.fork("sender", |c: Ctx| async move {
                c.broadcast("key", int(5)).await;
                Ok(Value::unit())
            })
            .await?;
            let (_, value) = ctx.first(vec![receiver.clone()], false, false).await?;
            // joining again gives the same thing, it's already done
            let again = receiver.result()?;
            assert_eq!(as_int(&again), as_int(&value));
            Ok(value)
        })
        .unwrap();
        assert_eq!(as_int(&result), 5);
    }

    #[test]
    fn fork_order_does_not_matter_for_deferred_broadcasts() {
        let result = run(|ctx| async move {
            let sender = ctx
                .fork("sender", |c: Ctx| async move {
                    c.broadcast("key", int(5)).await;
                    Ok(Value::unit())
                })
                .await?;
            let receiver = ctx
                .fork("receiver", |c: Ctx| async move { Ok(c.receive("key").await) })
                .await?;
            ctx.first(vec![sender], false, false).await?;
            let (_, value) = ctx.first(vec![receiver], false, false).await?;
            Ok(value)
        })
        .unwrap();
        assert_eq!(as_int(&result), 5);
    }

    #[test]
    fn broadcast_before_registration_hangs_the_receiver() {
        let err = run(|ctx| async move {
            ctx.broadcast("key", int(5)).await;
            ctx.fork("receiver", |c: Ctx| async move { Ok(c.receive("key").await) })
                .await?;
            Ok(Value::unit())
        })
        .unwrap_err();
        assert!(
            err.to_string()
                .starts_with("Hanging strands detected waiting for Receive(key)")
        );
    }

    #[test]
    fn unjoined_forks_do_not_hang_the_run() {
        let result = run(|ctx| async move {
            ctx.fork("sender", |c: Ctx| async move {
                c.broadcast("key", int(5)).await;
                c.broadcast("key2", int(5)).await;
                Ok(Value::unit())
            })
            .await?;
            Ok(Value::unit())
        })
        .unwrap();
        assert!(result.is_unit());
    }

    #[test]
    fn foreign_futures_are_reported_as_faults() {
        let err = run(|_ctx| async move {
            std::future::pending::<()>().await;
            Ok(Value::unit())
        })
        .unwrap_err();
        assert!(matches!(err, RuntimeFault::NonEffectYield { .. }));
    }

    #[test]
    fn routine_errors_carry_the_strand_stack() {
        let err = run(|ctx| async move {
            ctx.call("failing", |_c| async move {
                Err(RoutineError::new("boom"))
            })
            .await;
            Ok(Value::unit())
        })
        .unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.starts_with("Exception caught at"));
        assert!(rendered.contains("boom"));
    }

    #[test]
    fn trivial_calls_resume_with_the_value() {
        let result = run(|ctx| async move {
            let value = ctx.call("ten", |_c| async move { Ok(int(10)) }).await;
            Ok(value)
        })
        .unwrap();
        assert_eq!(as_int(&result), 10);
    }

    #[test]
    fn eager_forks_of_trivial_routines_are_done_on_return() {
        run(|ctx| async move {
            let strand = ctx.fork_eager("ten", |_c| async move { Ok(int(10)) }).await?;
            assert!(strand.is_done());
            assert_eq!(as_int(&strand.result()?), 10);
            Ok(Value::unit())
        })
        .unwrap();
    }

    #[test]
    fn cancellation_stops_a_receiver_mid_sequence() {
        let counter = Rc::new(Cell::new(0));
        let observed = Rc::clone(&counter);
        run(move |ctx| async move {
            let strand = ctx
                .fork("adder", {
                    let counter = Rc::clone(&counter);
                    move |c: Ctx| async move {
                        for _ in 0..3 {
                            c.receive("key").await;
                            counter.set(counter.get() + 5);
                        }
                        Ok(Value::unit())
                    }
                })
                .await?;
            ctx.broadcast("key", Value::unit()).await;
            ctx.broadcast("key", Value::unit()).await;
            ctx.cancel(&strand).await;
            assert!(strand.is_cancelled());
            ctx.cancel(&strand).await; // idempotent
            Ok(Value::unit())
        })
        .unwrap();
        assert_eq!(observed.get(), 10);
    }

    #[test]
    fn cancellation_cascades_to_descendants() {
        let pairs = Rc::new(Cell::new(0));
        let singles = Rc::new(Cell::new(0));
        let observed = (Rc::clone(&pairs), Rc::clone(&singles));
        run(move |ctx| async move {
            let outer = ctx
                .fork("outer", {
                    let pairs = Rc::clone(&pairs);
                    let singles = Rc::clone(&singles);
                    move |c: Ctx| async move {
                        c.fork("inner", {
                            let pairs = Rc::clone(&pairs);
                            move |ci: Ctx| async move {
                                loop {
                                    ci.receive("key").await;
                                    ci.receive("key").await;
                                    pairs.set(pairs.get() + 1);
                                }
                            }
                        })
                        .await?;
                        loop {
                            c.receive("key").await;
                            singles.set(singles.get() + 1);
                        }
                    }
                })
                .await?;
            for _ in 0..4 {
                ctx.broadcast("key", Value::unit()).await;
            }
            ctx.cancel(&outer).await;
            for _ in 0..4 {
                ctx.broadcast("key", Value::unit()).await;
            }
            Ok(Value::unit())
        })
        .unwrap();
        assert_eq!((observed.0.get(), observed.1.get()), (2, 4));
    }

    #[test]
    fn predicate_misses_do_not_consume() {
        let result = run(|ctx| async move {
            let receiver = ctx
                .fork("picky", |c: Ctx| async move {
                    Ok(c.receive_match("key", |v: &Value| v.downcast::<i64>() == Some(2))
                        .await)
                })
                .await?;
            ctx.broadcast("key", int(1)).await;
            ctx.broadcast("key", int(2)).await;
            let (_, value) = ctx.first(vec![receiver], false, false).await?;
            Ok(value)
        })
        .unwrap();
        assert_eq!(as_int(&result), 2);
    }

    #[test]
    fn fan_out_visits_receivers_in_registration_order() {
        let log = Rc::new(std::cell::RefCell::new(Vec::new()));
        let observed = Rc::clone(&log);
        run(move |ctx| async move {
            for tag in 1..=3i64 {
                let log = Rc::clone(&log);
                ctx.fork("listener", move |c: Ctx| async move {
                    c.receive("key").await;
                    log.borrow_mut().push(tag);
                    Ok(Value::unit())
                })
                .await?;
            }
            ctx.broadcast("key", Value::unit()).await;
            Ok(Value::unit())
        })
        .unwrap();
        assert_eq!(*observed.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn deferred_broadcasts_reach_a_reregistering_receiver() {
        let seen = Rc::new(Cell::new(0));
        let observed = Rc::clone(&seen);
        run(move |ctx| async move {
            let receiver = ctx
                .fork("twice", {
                    let seen = Rc::clone(&seen);
                    move |c: Ctx| async move {
                        for _ in 0..2 {
                            c.receive("key").await;
                            seen.set(seen.get() + 1);
                        }
                        Ok(Value::unit())
                    }
                })
                .await?;
            ctx.broadcast("key", Value::unit()).await;
            ctx.broadcast("key", Value::unit()).await;
            ctx.first(vec![receiver], false, false).await?;
            Ok(Value::unit())
        })
        .unwrap();
        assert_eq!(observed.get(), 2);
    }

    #[test]
    fn immediate_broadcasts_outrun_a_reregistering_receiver() {
        let err = run(|ctx| async move {
            let receiver = ctx
                .fork("twice", |c: Ctx| async move {
                    c.receive("key").await;
                    c.receive("key").await;
                    Ok(Value::unit())
                })
                .await?;
            ctx.broadcast("key", Value::unit()).await;
            // dispatched before the receiver re-registers, so it is dropped
            ctx.broadcast_immediate("key", Value::unit()).await;
            ctx.first(vec![receiver], false, false).await?;
            Ok(Value::unit())
        })
        .unwrap_err();
        assert!(matches!(err, RuntimeFault::HangingStrands { .. }));
    }

    fn value_receiver(
        want: i64,
    ) -> impl FnOnce(Ctx) -> std::pin::Pin<Box<dyn Future<Output = weft_types::RoutineResult>>>
    {
        move |c: Ctx| {
            Box::pin(async move {
                Ok(c.receive_match("key", move |v: &Value| v.downcast::<i64>() == Some(want))
                    .await)
            })
        }
    }

    #[test_log::test]
    fn overlapping_races_cancel_only_their_own_losers() {
        let outcome = run(|ctx| async move {
            let s1 = ctx.fork("recv1", value_receiver(1)).await?;
            let s2 = ctx.fork("recv2", value_receiver(2)).await?;
            let s3 = ctx.fork("recv3", value_receiver(3)).await?;
            let race_a = ctx
                .fork("first 1v2", {
                    let (s1, s2) = (s1.clone(), s2.clone());
                    move |c: Ctx| async move {
                        let won = c.first(vec![s1, s2], true, false).await?;
                        Ok(Value::new(won))
                    }
                })
                .await?;
            let race_b = ctx
                .fork("first 2v3", {
                    let (s2, s3) = (s2.clone(), s3.clone());
                    move |c: Ctx| async move {
                        let won = c.first(vec![s2, s3], true, false).await?;
                        Ok(Value::new(won))
                    }
                })
                .await?;
            ctx.broadcast("key", int(5)).await;
            ctx.broadcast("key", int(1)).await;
            ctx.broadcast("key", int(3)).await;
            let (_, a) = ctx.first(vec![race_a], false, false).await?;
            let (_, b) = ctx.first(vec![race_b], false, false).await?;
            assert!(s2.is_cancelled());
            let (ai, av) = a.downcast::<(usize, Value)>().expect("a race outcome");
            let (bi, bv) = b.downcast::<(usize, Value)>().expect("a race outcome");
            Ok(Value::new(vec![(ai, as_int(&av)), (bi, as_int(&bv))]))
        })
        .unwrap();
        similar_asserts::assert_eq!(
            outcome.downcast::<Vec<(usize, i64)>>().unwrap(),
            vec![(0, 1), (1, 3)]
        );
    }

    #[test]
    fn losers_survive_when_cancel_losers_is_off() {
        let result = run(|ctx| async move {
            let s1 = ctx.fork("recv1", value_receiver(1)).await?;
            let s2 = ctx.fork("recv2", value_receiver(2)).await?;
            ctx.fork("sender", |c: Ctx| async move {
                c.broadcast("key", int(1)).await;
                Ok(Value::unit())
            })
            .await?;
            let (index, value) = ctx.first(vec![s1, s2.clone()], false, false).await?;
            assert_eq!(index, 0);
            assert_eq!(as_int(&value), 1);
            assert!(!s2.is_cancelled());
            // the loser keeps running and can still finish on its own
            ctx.broadcast("key", int(2)).await;
            Ok(s2.result()?)
        })
        .unwrap();
        assert_eq!(as_int(&result), 2);
    }

    #[test]
    fn joining_a_cancelled_loser_hangs() {
        let err = run(|ctx| async move {
            let s1 = ctx.fork("recv1", value_receiver(1)).await?;
            let s2 = ctx.fork("recv2", value_receiver(2)).await?;
            ctx.broadcast("key", int(1)).await;
            ctx.first(vec![s1, s2.clone()], true, false).await?;
            assert!(s2.is_cancelled());
            ctx.first(vec![s2], false, false).await?;
            Ok(Value::unit())
        })
        .unwrap_err();
        assert!(
            err.to_string()
                .starts_with("Hanging strands detected waiting for First(")
        );
    }

    #[test]
    fn racing_nothing_is_a_fault() {
        let err = run(|ctx| async move {
            ctx.first(vec![], true, true).await?;
            Ok(Value::unit())
        })
        .unwrap_err();
        assert!(matches!(err, RuntimeFault::EmptyRace { .. }));
    }

    #[test]
    fn an_already_done_entrant_wins_immediately() {
        let result = run(|ctx| async move {
            let done = ctx.fork_eager("ready", |_c| async move { Ok(int(7)) }).await?;
            let (index, value) = ctx.first(vec![done], false, false).await?;
            assert_eq!(index, 0);
            Ok(value)
        })
        .unwrap();
        assert_eq!(as_int(&result), 7);
    }

    #[test]
    fn two_already_done_entrants_fault_under_ensure_cancel() {
        let err = run(|ctx| async move {
            let a = ctx.fork_eager("a", |_c| async move { Ok(int(1)) }).await?;
            let b = ctx.fork_eager("b", |_c| async move { Ok(int(2)) }).await?;
            ctx.race(vec![a, b]).await?;
            Ok(Value::unit())
        })
        .unwrap_err();
        assert!(matches!(err, RuntimeFault::RaceAlreadyResolved { .. }));
    }

    #[test]
    fn blocking_tasks_resume_with_their_result() {
        let result = run(|ctx| async move {
            let value = ctx.call_blocking("multiply", || 6i64 * 7).await;
            Ok(value)
        })
        .unwrap();
        assert_eq!(as_int(&result), 42);
    }

    #[test]
    fn blocking_task_panics_surface_as_faults() {
        let err = run(|ctx| async move {
            ctx.call_blocking("explode", || -> i64 { panic!("kaboom") })
                .await;
            Ok(Value::unit())
        })
        .unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }

    #[test]
    fn the_slower_blocking_task_loses_and_is_discarded() {
        let result = run(|ctx| async move {
            let slow = ctx
                .fork("slow", |c: Ctx| async move {
                    Ok(c.call_blocking("sleep 30ms", || {
                        std::thread::sleep(Duration::from_millis(30));
                        30i64
                    })
                    .await)
                })
                .await?;
            let fast = ctx
                .fork("fast", |c: Ctx| async move {
                    Ok(c.call_blocking("sleep 20ms", || {
                        std::thread::sleep(Duration::from_millis(20));
                        20i64
                    })
                    .await)
                })
                .await?;
            let (index, value) = ctx.race(vec![slow, fast]).await?;
            assert_eq!((index, as_int(&value)), (1, 20));
            Ok(Value::unit())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn flush_lets_queued_work_finish_first() {
        let seen = Rc::new(Cell::new(false));
        let observed = Rc::clone(&seen);
        run(move |ctx| async move {
            ctx.fork("worker", {
                let seen = Rc::clone(&seen);
                move |_c: Ctx| async move {
                    seen.set(true);
                    Ok(Value::unit())
                }
            })
            .await?;
            ctx.perform(flush()).await;
            assert!(seen.get());
            Ok(Value::unit())
        })
        .unwrap();
        assert!(observed.get());
    }

    #[test]
    fn debug_tree_shows_parked_descendants() {
        run(|ctx| async move {
            let receiver = ctx
                .fork("listener", |c: Ctx| async move { Ok(c.receive("ping").await) })
                .await?;
            let tree = ctx.debug_tree().await?;
            assert!(tree.contains("Strand[s0]"));
            assert!(tree.contains("waiting for Receive(ping)"));
            ctx.cancel(&receiver).await;
            Ok(Value::unit())
        })
        .unwrap();
    }

    #[test]
    fn wrapped_effects_keep_their_replacement_name_in_diagnostics() {
        let err = run(|ctx| async move {
            ctx.perform(Effect::wrap(Effect::receive("nope"), "Acquire"))
                .await;
            Ok(Value::unit())
        })
        .unwrap_err();
        assert!(
            err.to_string()
                .starts_with("Hanging strands detected waiting for Acquire(nope)")
        );
    }

    #[test]
    fn nested_runs_are_independent() {
        let result = run(|ctx| async move {
            let inner = run(|c| async move {
                c.broadcast("key", int(1)).await;
                Ok(int(9))
            })
            .map_err(RoutineError::from)?;
            let value = ctx.call("wrap", move |_c| async move { Ok(inner) }).await;
            Ok(value)
        })
        .unwrap();
        assert_eq!(as_int(&result), 9);
    }

    #[test]
    fn intercept_outside_test_mode_is_a_fault() {
        let err = run(|ctx| async move {
            ctx.intercept_any().await;
            Ok(Value::unit())
        })
        .unwrap_err();
        assert!(matches!(err, RuntimeFault::InterceptOutsideTestMode { .. }));
    }

    #[test]
    fn interceptors_replace_the_captured_effects_result() {
        let options = RunOptions {
            test_mode: true,
            ..RunOptions::default()
        };
        let result = run_with(
            |ctx| async move {
                ctx.fork("mock", |c: Ctx| async move {
                    let captured = c.intercept_any().await.take::<Intercepted>()?;
                    assert_eq!(captured.effect().kind_name(), "CallBlocking");
                    c.perform(captured.inject(int(99))).await;
                    Ok(Value::unit())
                })
                .await?;
                let value = ctx.call_blocking("expensive", || 5i64).await;
                Ok(value)
            },
            options,
        )
        .unwrap();
        // the real blocking task never ran
        assert_eq!(as_int(&result), 99);
    }

    #[test]
    fn interceptors_only_capture_matching_effects() {
        let options = RunOptions {
            test_mode: true,
            ..RunOptions::default()
        };
        run_with(
            |ctx| async move {
                let receiver = ctx
                    .fork("listener", |c: Ctx| async move { Ok(c.receive("k").await) })
                    .await?;
                ctx.fork("spy", |c: Ctx| async move {
                    let captured = c
                        .intercept_matching(|e: &Effect| e.kind_name() == "Broadcast")
                        .await
                        .take::<Intercepted>()?;
                    assert_eq!(captured.effect().key(), Some("k"));
                    let payload = captured
                        .effect()
                        .broadcast_value()
                        .and_then(|v| v.downcast::<i64>());
                    assert_eq!(payload, Some(7));
                    c.perform(captured.inject(Value::unit())).await;
                    Ok(Value::unit())
                })
                .await?;
                // captured by the spy; the listener never hears it
                ctx.broadcast("k", int(7)).await;
                assert!(!receiver.is_done());
                ctx.cancel(&receiver).await;
                Ok(Value::unit())
            },
            options,
        )
        .unwrap();
    }

    #[test]
    fn reading_a_running_strands_result_fails() {
        run(|ctx| async move {
            let receiver = ctx
                .fork("listener", |c: Ctx| async move { Ok(c.receive("never").await) })
                .await?;
            assert!(matches!(
                receiver.result(),
                Err(RuntimeFault::StrandStillRunning)
            ));
            ctx.cancel(&receiver).await;
            Ok(Value::unit())
        })
        .unwrap();
    }
}
