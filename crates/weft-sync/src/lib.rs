pub mod channel;
pub mod combinators;
pub mod lock;

pub use channel::Channel;
pub use combinators::{
    SubscribeMode, fork_effect, join, join_all, race, sequence, sleep, subscribe,
};
pub use lock::{Lock, LockGuard};
