mod bridge;
pub mod scheduler;
mod trace;
mod waiters;

pub use scheduler::{RunOptions, run, run_with};
