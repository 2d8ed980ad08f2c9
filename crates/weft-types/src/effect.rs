use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::rc::Rc;

use crate::routine::{Ctx, RoutineFn, RoutineResult};
use crate::strand::{Strand, StrandId};
use crate::value::Value;

/// Predicate a receiver applies to broadcast payloads. A rejected payload
/// leaves the receiver registered.
pub type ReceivePredicate = Rc<dyn Fn(&Value) -> bool>;

/// Predicate a test interceptor applies to in-flight effects.
pub type EffectPredicate = Rc<dyn Fn(&Effect) -> bool>;

/// Hook invoked when the owning strand is cancelled while this effect is
/// pending. Must be synchronous, non-throwing and idempotent, and safe to
/// call when the effect was never dispatched.
pub type CancelHook = Rc<dyn Fn()>;

/// Off-loop task executed by the blocking worker pool.
pub type BlockingFn = Box<dyn FnOnce() -> Box<dyn Any + Send> + Send>;

/// The reason a strand suspended, with its operand data.
pub enum EffectKind {
    Broadcast {
        key: String,
        value: Value,
        immediate: bool,
    },
    Receive {
        key: String,
        predicate: Option<ReceivePredicate>,
    },
    Call {
        routine: RoutineFn,
    },
    CallFork {
        routine: RoutineFn,
        run_first: bool,
    },
    CallBlocking {
        task: BlockingFn,
    },
    First {
        entrants: Vec<Strand>,
        cancel_losers: bool,
        ensure_cancel: bool,
    },
    Cancel {
        target: Strand,
    },
    Wrapper {
        inner: Box<Effect>,
        kind: String,
    },
    Intercept {
        predicate: Option<EffectPredicate>,
    },
    Resume {
        target: StrandId,
        value: Value,
    },
    DebugTree,
}

/// A declarative, inert description of what a routine is asking the engine
/// to do at one suspension point.
///
/// Every effect carries a human-readable name for diagnostics, an optional
/// cancel hook, and the call site captured at construction.
pub struct Effect {
    kind: EffectKind,
    name: String,
    cancel_hook: Option<CancelHook>,
    caller: &'static Location<'static>,
}

/// An effect decomposed for dispatch. `Wrapper` layers are flattened away;
/// they only affect the diagnostic name, which the engine captures before
/// taking the effect apart.
pub struct EffectParts {
    pub kind: EffectKind,
    pub name: String,
    pub caller: &'static Location<'static>,
}

impl Effect {
    #[track_caller]
    fn new(kind: EffectKind, name: String) -> Self {
        Self {
            kind,
            name,
            cancel_hook: None,
            caller: Location::caller(),
        }
    }

    /// Broadcast `value` under `key`; receivers drain before the broadcaster
    /// continues. A broadcast that finds no receiver is dropped.
    #[track_caller]
    pub fn broadcast(key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        Self::new(
            EffectKind::Broadcast {
                key: key.clone(),
                value,
                immediate: false,
            },
            key,
        )
    }

    /// Broadcast `value` under `key` and keep running before the woken
    /// receivers get their turn.
    #[track_caller]
    pub fn broadcast_immediate(key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        Self::new(
            EffectKind::Broadcast {
                key: key.clone(),
                value,
                immediate: true,
            },
            key,
        )
    }

    /// Park until a broadcast arrives under `key`.
    #[track_caller]
    pub fn receive(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(
            EffectKind::Receive {
                key: key.clone(),
                predicate: None,
            },
            key,
        )
    }

    /// Park until a broadcast under `key` satisfies `predicate`.
    #[track_caller]
    pub fn receive_match(
        key: impl Into<String>,
        predicate: impl Fn(&Value) -> bool + 'static,
    ) -> Self {
        let key = key.into();
        Self::new(
            EffectKind::Receive {
                key: key.clone(),
                predicate: Some(Rc::new(predicate)),
            },
            key,
        )
    }

    /// Run `body` as a child strand and park until it returns.
    #[track_caller]
    pub fn call<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(Ctx) -> Fut + 'static,
        Fut: Future<Output = RoutineResult> + 'static,
    {
        Self::new(
            EffectKind::Call {
                routine: Box::new(move |ctx| Box::pin(body(ctx))),
            },
            name.into(),
        )
    }

    /// Spin `body` off as a child strand and resume immediately with its
    /// handle. The child is not awaited.
    #[track_caller]
    pub fn fork<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(Ctx) -> Fut + 'static,
        Fut: Future<Output = RoutineResult> + 'static,
    {
        Self::new(
            EffectKind::CallFork {
                routine: Box::new(move |ctx| Box::pin(body(ctx))),
                run_first: false,
            },
            name.into(),
        )
    }

    /// Like [`Effect::fork`], but the child takes its first step before the
    /// caller resumes with the handle.
    #[track_caller]
    pub fn fork_eager<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(Ctx) -> Fut + 'static,
        Fut: Future<Output = RoutineResult> + 'static,
    {
        Self::new(
            EffectKind::CallFork {
                routine: Box::new(move |ctx| Box::pin(body(ctx))),
                run_first: true,
            },
            name.into(),
        )
    }

    /// Hand `task` to the blocking worker pool and park until its result
    /// comes back. The task itself cannot be cancelled; cancelling the
    /// strand makes the engine discard the eventual result.
    #[track_caller]
    pub fn call_blocking<F, R>(name: impl Into<String>, task: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
        R: Any + Send,
    {
        Self::new(
            EffectKind::CallBlocking {
                task: Box::new(move || Box::new(task()) as Box<dyn Any + Send>),
            },
            name.into(),
        )
    }

    /// Park until the first of `entrants` completes; resumes with
    /// `(index, value)` of the winner.
    #[track_caller]
    pub fn first(entrants: Vec<Strand>, cancel_losers: bool, ensure_cancel: bool) -> Self {
        let name = entrants
            .iter()
            .map(|s| s.id().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Self::new(
            EffectKind::First {
                entrants,
                cancel_losers,
                ensure_cancel,
            },
            name,
        )
    }

    /// Cancel `target` and its live descendants, then resume.
    #[track_caller]
    pub fn cancel(target: Strand) -> Self {
        let name = target.to_string();
        Self::new(EffectKind::Cancel { target }, name)
    }

    /// Rename `inner` for diagnostics; dispatch is unchanged.
    #[track_caller]
    pub fn wrap(inner: Effect, kind: impl Into<String>) -> Self {
        let name = inner.name.clone();
        Self::new(
            EffectKind::Wrapper {
                inner: Box::new(inner),
                kind: kind.into(),
            },
            name,
        )
    }

    /// Capture the next effect any strand is about to dispatch. Test mode
    /// only.
    #[track_caller]
    pub fn intercept_any() -> Self {
        Self::new(EffectKind::Intercept { predicate: None }, String::new())
    }

    /// Capture the next effect matching `predicate`. Test mode only.
    #[track_caller]
    pub fn intercept_matching(predicate: impl Fn(&Effect) -> bool + 'static) -> Self {
        Self::new(
            EffectKind::Intercept {
                predicate: Some(Rc::new(predicate)),
            },
            String::new(),
        )
    }

    /// Resume with a rendering of the live strand tree.
    #[track_caller]
    pub fn debug_tree() -> Self {
        Self::new(EffectKind::DebugTree, String::new())
    }

    /// Attach a cancel hook, replacing any existing one.
    pub fn with_cancel_hook(mut self, hook: impl Fn() + 'static) -> Self {
        self.cancel_hook = Some(Rc::new(hook));
        self
    }

    pub fn kind(&self) -> &EffectKind {
        &self.kind
    }

    /// The variant name, or the replacement tag for wrapped effects.
    pub fn kind_name(&self) -> &str {
        match &self.kind {
            EffectKind::Broadcast { .. } => "Broadcast",
            EffectKind::Receive { .. } => "Receive",
            EffectKind::Call { .. } => "Call",
            EffectKind::CallFork { .. } => "CallFork",
            EffectKind::CallBlocking { .. } => "CallBlocking",
            EffectKind::First { .. } => "First",
            EffectKind::Cancel { .. } => "Cancel",
            EffectKind::Wrapper { kind, .. } => kind,
            EffectKind::Intercept { .. } => "Intercept",
            EffectKind::Resume { .. } => "Resume",
            EffectKind::DebugTree => "DebugTree",
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Broadcast/receive key, looked up through wrapper layers.
    pub fn key(&self) -> Option<&str> {
        match &self.kind {
            EffectKind::Broadcast { key, .. } | EffectKind::Receive { key, .. } => Some(key),
            EffectKind::Wrapper { inner, .. } => inner.key(),
            _ => None,
        }
    }

    /// Broadcast payload, looked up through wrapper layers.
    pub fn broadcast_value(&self) -> Option<&Value> {
        match &self.kind {
            EffectKind::Broadcast { value, .. } => Some(value),
            EffectKind::Wrapper { inner, .. } => inner.broadcast_value(),
            _ => None,
        }
    }

    /// Whether this effect yields its turn to already-queued work.
    pub fn deferred(&self) -> bool {
        match &self.kind {
            EffectKind::Broadcast { immediate, .. } => !immediate,
            EffectKind::Wrapper { inner, .. } => inner.deferred(),
            _ => false,
        }
    }

    /// The cancel hook, falling back to the wrapped effect's hook.
    pub fn cancel_hook(&self) -> Option<CancelHook> {
        if let Some(hook) = &self.cancel_hook {
            return Some(Rc::clone(hook));
        }
        match &self.kind {
            EffectKind::Wrapper { inner, .. } => inner.cancel_hook(),
            _ => None,
        }
    }

    pub fn caller(&self) -> &'static Location<'static> {
        self.caller
    }

    /// Decompose for dispatch, flattening wrapper layers.
    pub fn into_parts(self) -> EffectParts {
        let Effect {
            kind, name, caller, ..
        } = self;
        match kind {
            EffectKind::Wrapper { inner, .. } => inner.into_parts(),
            kind => EffectParts { kind, name, caller },
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.kind_name())
        } else {
            write!(f, "{}({})", self.kind_name(), self.name)
        }
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Effect[{self}]")
    }
}

/// An effect captured by a test interceptor before dispatch, together with
/// the strand that yielded it.
///
/// The captured effect is never executed; [`Intercepted::inject`] builds the
/// effect that resumes the captured strand with a replacement value.
pub struct Intercepted {
    effect: Effect,
    source: StrandId,
}

impl Intercepted {
    pub fn new(effect: Effect, source: StrandId) -> Self {
        Self { effect, source }
    }

    pub fn effect(&self) -> &Effect {
        &self.effect
    }

    pub fn source(&self) -> StrandId {
        self.source
    }

    /// Build the effect that resumes the intercepted strand with `value`.
    #[track_caller]
    pub fn inject(self, value: Value) -> Effect {
        Effect::new(
            EffectKind::Resume {
                target: self.source,
                value,
            },
            "inject".to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_pairs_kind_and_name() {
        assert_eq!(
            Effect::broadcast("tick", Value::unit()).to_string(),
            "Broadcast(tick)"
        );
        assert_eq!(Effect::receive("tick").to_string(), "Receive(tick)");
        assert_eq!(Effect::debug_tree().to_string(), "DebugTree");
        assert_eq!(Effect::intercept_any().to_string(), "Intercept");
    }

    #[test]
    fn wrapping_replaces_the_kind_but_keeps_the_name() {
        let wrapped = Effect::wrap(Effect::receive("slot"), "Acquire");
        assert_eq!(wrapped.to_string(), "Acquire(slot)");
        assert_eq!(wrapped.key(), Some("slot"));
    }

    #[test]
    fn only_non_immediate_broadcasts_defer() {
        assert!(Effect::broadcast("k", Value::unit()).deferred());
        assert!(!Effect::broadcast_immediate("k", Value::unit()).deferred());
        assert!(!Effect::receive("k").deferred());
        assert!(Effect::wrap(Effect::broadcast("k", Value::unit()), "Send").deferred());
    }

    #[test]
    fn cancel_hooks_fall_through_wrappers() {
        use std::cell::Cell;
        use std::rc::Rc;

        let fired = Rc::new(Cell::new(0));
        let hook_fired = Rc::clone(&fired);
        let inner = Effect::receive("slot").with_cancel_hook(move || {
            hook_fired.set(hook_fired.get() + 1);
        });
        let wrapped = Effect::wrap(inner, "Acquire");

        let hook = wrapped.cancel_hook().expect("hook survives wrapping");
        (*hook)();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn into_parts_flattens_wrapper_layers() {
        let wrapped = Effect::wrap(
            Effect::wrap(Effect::broadcast("deep", Value::unit()), "Inner"),
            "Outer",
        );
        let parts = wrapped.into_parts();
        assert!(matches!(parts.kind, EffectKind::Broadcast { ref key, .. } if key == "deep"));
        assert_eq!(parts.name, "deep");
    }

    #[test]
    fn first_names_its_entrants() {
        use crate::strand::{Strand, StrandId, StrandShared};

        let a = Strand::new(StrandId::new(1), Rc::new(StrandShared::default()));
        let b = Strand::new(StrandId::new(2), Rc::new(StrandShared::default()));
        assert_eq!(
            Effect::first(vec![a, b], true, true).to_string(),
            "First(s1, s2)"
        );
    }
}
