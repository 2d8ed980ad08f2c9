//! Bridge between the single-threaded loop and the blocking worker pool.
//!
//! The loop submits tasks; workers post `(task id, outcome)` into a
//! thread-safe inbox which the loop drains — non-blocking while ready work
//! remains, blocking otherwise. Workers never touch engine state.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use uuid::Uuid;
use weft_types::{BlockingFn, StrandId};

type Outcome = Result<Box<dyn Any + Send>, String>;

/// A completed blocking task, resolved back to its waiting strand.
pub(crate) struct TaskDelivery {
    pub(crate) strand: StrandId,
    pub(crate) outcome: Outcome,
}

struct Job {
    id: Uuid,
    task: BlockingFn,
}

pub(crate) struct BlockingBridge {
    jobs_tx: Sender<Job>,
    jobs_rx: Receiver<Job>,
    results_tx: Sender<(Uuid, Outcome)>,
    results_rx: Receiver<(Uuid, Outcome)>,
    in_flight: HashMap<Uuid, StrandId>,
    spawned: usize,
    max_workers: usize,
}

impl BlockingBridge {
    pub(crate) fn new(max_workers: usize) -> Self {
        let (jobs_tx, jobs_rx) = unbounded();
        let (results_tx, results_rx) = unbounded();
        Self {
            jobs_tx,
            jobs_rx,
            results_tx,
            results_rx,
            in_flight: HashMap::new(),
            spawned: 0,
            max_workers: max_workers.max(1),
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Queue `task` for off-loop execution on behalf of `strand`, growing
    /// the pool if every worker is busy and the cap allows.
    pub(crate) fn submit(&mut self, strand: StrandId, task: BlockingFn) {
        let id = Uuid::new_v4();
        self.in_flight.insert(id, strand);
        if self.spawned < self.max_workers && self.in_flight.len() > self.spawned {
            self.spawn_worker();
        }
        // the bridge holds the receiver, so the channel cannot be closed
        let _ = self.jobs_tx.send(Job { id, task });
    }

    fn spawn_worker(&mut self) {
        let jobs = self.jobs_rx.clone();
        let results = self.results_tx.clone();
        self.spawned += 1;
        // Detached: a task that never returns must not wedge the caller of
        // `run`. The worker exits once the job channel closes.
        thread::spawn(move || {
            for Job { id, task } in jobs.iter() {
                let outcome = catch_unwind(AssertUnwindSafe(task)).map_err(panic_message);
                if results.send((id, outcome)).is_err() {
                    break;
                }
            }
        });
    }

    /// Wait for the next completed task. Used only when the ready deque is
    /// empty, so the loop sleeps exactly when nothing else can progress.
    pub(crate) fn recv(&mut self) -> Option<TaskDelivery> {
        loop {
            match self.results_rx.recv() {
                Ok(message) => {
                    if let Some(delivery) = self.accept(message) {
                        return Some(delivery);
                    }
                }
                Err(_) => {
                    self.in_flight.clear();
                    return None;
                }
            }
        }
    }

    pub(crate) fn try_recv(&mut self) -> Option<TaskDelivery> {
        loop {
            match self.results_rx.try_recv() {
                Ok(message) => {
                    if let Some(delivery) = self.accept(message) {
                        return Some(delivery);
                    }
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return None,
            }
        }
    }

    fn accept(&mut self, (id, outcome): (Uuid, Outcome)) -> Option<TaskDelivery> {
        let strand = self.in_flight.remove(&id)?;
        Some(TaskDelivery { strand, outcome })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "blocking task panicked".to_string()
    }
}
