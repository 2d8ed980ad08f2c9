//! Combinators layered on the engine's effect contracts.
//!
//! Everything here is plain routine code: sequences, joins, races, forked
//! effects, subscriptions and blocking sleeps. None of it needs engine
//! support beyond the documented behavior of `First`, `CallFork`,
//! `Broadcast`/`Receive` and the blocking-task bridge.

use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use weft_types::{Ctx, Effect, RoutineError, RoutineResult, Strand, Value};

/// Perform each effect in order and collect the results.
pub async fn sequence(ctx: &Ctx, effects: Vec<Effect>) -> Vec<Value> {
    let mut results = Vec::with_capacity(effects.len());
    for effect in effects {
        results.push(ctx.perform(effect).await);
    }
    results
}

/// The result of `strand`, parking until it completes.
///
/// An already-done strand short-circuits to its stored result. Joining a
/// cancelled strand parks forever and is reported by hang detection.
pub async fn join(ctx: &Ctx, strand: &Strand) -> Result<Value, RoutineError> {
    if strand.is_done() {
        return Ok(strand.result()?);
    }
    let (_, value) = ctx.first(vec![strand.clone()], false, false).await?;
    Ok(value)
}

/// [`join`] over several strands, in order.
pub async fn join_all(ctx: &Ctx, strands: &[Strand]) -> Result<Vec<Value>, RoutineError> {
    let mut results = Vec::with_capacity(strands.len());
    for strand in strands {
        results.push(join(ctx, strand).await?);
    }
    Ok(results)
}

/// Spin `effect` into its own strand and hand back the handle.
pub async fn fork_effect(ctx: &Ctx, effect: Effect) -> Result<Strand, RoutineError> {
    let label = effect.to_string();
    let forked = Effect::wrap(
        Effect::fork(label, move |c: Ctx| async move { Ok(c.perform(effect).await) }),
        "Fork",
    );
    ctx.perform(forked)
        .await
        .downcast::<Strand>()
        .ok_or_else(|| RoutineError::new("fork resumed without a strand handle"))
}

/// First of `effects` to finish: forks every entrant, cancels the losers,
/// and resolves to `(index, value)` of the winner.
pub async fn race(ctx: &Ctx, effects: Vec<Effect>) -> Result<(usize, Value), RoutineError> {
    let mut entrants = Vec::with_capacity(effects.len());
    for effect in effects {
        entrants.push(fork_effect(ctx, effect).await?);
    }
    ctx.first(entrants, true, true).await
}

/// How [`subscribe`] schedules its handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeMode {
    /// Fork the handler for every message.
    Every,
    /// Run the handler inline; messages arriving meanwhile are dropped.
    Leading,
    /// Cancel the previous handler before forking the next.
    Latest,
}

/// Run `handler` on every broadcast under `key`, per `mode`.
///
/// Returns the subscription strand; cancel it to stop listening, otherwise
/// hang detection reports it at shutdown.
pub async fn subscribe<H, Fut>(
    ctx: &Ctx,
    key: &str,
    mode: SubscribeMode,
    handler: H,
) -> Result<Strand, RoutineError>
where
    H: Fn(Ctx, Value) -> Fut + 'static,
    Fut: Future<Output = RoutineResult> + 'static,
{
    let key = key.to_string();
    let handler = Rc::new(handler);
    ctx.fork("subscription", move |c: Ctx| async move {
        let mut task: Option<Strand> = None;
        loop {
            let message = c.receive(key.as_str()).await;
            let handler = Rc::clone(&handler);
            match mode {
                SubscribeMode::Leading => {
                    c.call("subscriber", move |cc| (*handler)(cc, message)).await;
                }
                SubscribeMode::Every => {
                    c.fork("subscriber", move |cc| (*handler)(cc, message)).await?;
                }
                SubscribeMode::Latest => {
                    if let Some(previous) = task.take() {
                        c.cancel(&previous).await;
                    }
                    let forked = c.fork("subscriber", move |cc| (*handler)(cc, message)).await?;
                    task = Some(forked);
                }
            }
        }
    })
    .await
}

/// Block a worker thread for `duration`. `Duration::ZERO` is the idiomatic
/// barrier: everything already queued runs before the sleeper resumes.
#[track_caller]
pub fn sleep(duration: Duration) -> Effect {
    Effect::call_blocking("sleep", move || {
        std::thread::sleep(duration);
    })
}
