// SPDX-License-Identifier: MIT OR Apache-2.0

//! Re-armable debounce timer.
//!
//! One timer thread per debouncer, spawned lazily on the first arm and
//! parked between uses, so arming on every mutation stays cheap during
//! training bursts. Each arm replaces the pending deadline and action;
//! the action runs once the quiet period elapses with no further arms.
//! Callers pass a closure capturing a `Weak` handle to their owner, so
//! a pending timer never extends the owner's lifetime.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type Action = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct DebounceState {
    deadline: Option<Instant>,
    action: Option<Action>,
    shutdown: bool,
}

/// Debounced one-shot action scheduler.
pub struct Debouncer {
    state: Arc<(Mutex<DebounceState>, Condvar)>,
    delay: Duration,
    timer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer").field("delay", &self.delay).finish()
    }
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            state: Arc::new((Mutex::new(DebounceState::default()), Condvar::new())),
            delay,
            timer: Mutex::new(None),
        }
    }

    #[inline]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// (Re)arm the timer. `action` runs once after the configured quiet
    /// period unless another `arm` or a `cancel` happens first.
    pub fn arm<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let (lock, signal) = &*self.state;
        {
            let mut state = lock.lock().unwrap();
            state.deadline = Some(Instant::now() + self.delay);
            state.action = Some(Box::new(action));
        }
        signal.notify_all();
        self.ensure_timer();
    }

    /// Invalidate any pending timer without running it.
    pub fn cancel(&self) {
        let (lock, signal) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.deadline = None;
        state.action = None;
        signal.notify_all();
    }

    fn ensure_timer(&self) {
        let mut timer = self.timer.lock().unwrap();
        if timer.is_some() {
            return;
        }
        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name("markov-debounce".to_string())
            .spawn(move || timer_loop(state));
        match spawned {
            Ok(handle) => *timer = Some(handle),
            Err(e) => log::error!("failed to spawn debounce timer: {e}"),
        }
    }
}

fn timer_loop(state: Arc<(Mutex<DebounceState>, Condvar)>) {
    let (lock, signal) = &*state;
    let mut guard = lock.lock().unwrap();
    loop {
        if guard.shutdown {
            return;
        }
        match guard.deadline {
            None => {
                guard = signal.wait(guard).unwrap();
            }
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    let (next, _) = signal.wait_timeout(guard, deadline - now).unwrap();
                    guard = next;
                    continue;
                }
                guard.deadline = None;
                if let Some(action) = guard.action.take() {
                    drop(guard);
                    action();
                    guard = lock.lock().unwrap();
                }
            }
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        {
            let (lock, signal) = &*self.state;
            let mut state = lock.lock().unwrap();
            state.shutdown = true;
            state.deadline = None;
            state.action = None;
            signal.notify_all();
        }
        if let Some(handle) = self.timer.lock().unwrap().take() {
            // The fired action may hold the last strong reference to the
            // owner, putting this drop on the timer thread itself; a
            // self-join would hang, and the loop exits on its own.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
