//! Starvation watchdog: a background OS thread samples the runtime's round
//! counter every `quantum` and fires an alerter callback whenever a full
//! quantum passed with no coroutine switch.
//!
//! The round counter is published to an `AtomicU64` on every jump
//! ([`crate::runtime::round_counter`]) precisely so this thread can read it
//! without touching the runtime's thread-local state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_QUANTUM: Duration = Duration::from_millis(10);

struct Shared {
    alert_count: AtomicU64,
    stop: AtomicBool,
}

pub struct WatchDog {
    quantum: Duration,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl WatchDog {
    /// Starts sampling the calling thread's runtime. `alerter` runs on the
    /// watchdog's own OS thread, so it must not touch coroutine state
    /// directly — only `Send` data (counters, channels to the outside
    /// world) is safe to close over.
    pub fn run(quantum: Duration, alerter: impl Fn(&WatchDogHandle) + Send + 'static) -> WatchDog {
        let shared = Arc::new(Shared { alert_count: AtomicU64::new(0), stop: AtomicBool::new(false) });
        let round_counter = crate::runtime::round_counter();
        let thread_shared = shared.clone();

        let thread = thread::spawn(move || {
            let mut last_round = round_counter.load(Ordering::Relaxed);
            while !thread_shared.stop.load(Ordering::Relaxed) {
                thread::sleep(quantum);
                if thread_shared.stop.load(Ordering::Relaxed) {
                    break;
                }
                let round = round_counter.load(Ordering::Relaxed);
                if round == last_round {
                    thread_shared.alert_count.fetch_add(1, Ordering::Relaxed);
                    alerter(&WatchDogHandle { shared: thread_shared.clone() });
                }
                last_round = round;
            }
        });

        WatchDog { quantum, shared, thread: Some(thread) }
    }

    pub fn quantum(&self) -> Duration {
        self.quantum
    }

    pub fn alert_count(&self) -> u64 {
        self.shared.alert_count.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stop.load(Ordering::Relaxed)
    }

    pub fn stop(mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WatchDog {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// What an alerter callback is allowed to touch: the alert counter only
/// (mirrors `cat_watch_dog_t`'s "public, writable only in alerter" field).
pub struct WatchDogHandle {
    shared: Arc<Shared>,
}

impl WatchDogHandle {
    pub fn alert_count(&self) -> u64 {
        self.shared.alert_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_alerter_when_runtime_is_idle() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let dog = WatchDog::run(Duration::from_millis(5), move |_| {
            fired2.fetch_add(1, Ordering::Relaxed);
        });
        thread::sleep(Duration::from_millis(40));
        dog.stop();
        assert!(fired.load(Ordering::Relaxed) > 0);
    }
}
