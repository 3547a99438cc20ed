//! Synchronization primitives for coroutines sharing one runtime.
//!
//! Every primitive here suspends the calling coroutine rather than the OS
//! thread — there's only one OS thread driving any given runtime, so a
//! primitive that actually blocked it would deadlock the whole process.

pub mod async_notify;
pub mod channel;
pub mod mono_barrier;
pub mod wait_group;

pub use async_notify::AsyncNotify;
pub use channel::Channel;
pub use mono_barrier::MonoBarrier;
pub use wait_group::WaitGroup;
