//! Time source and one-shot callback scheduling for lifecycle timing
//!
//! Everything in the nursery that depends on time (idle sweeps, operation
//! budgets, readiness polling) goes through [`Clock`], so tests can drive a
//! [`ManualClock`] instead of waiting out real timeouts.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;

/// Callback invoked when a scheduled task fires.
///
/// The returned future runs to completion on the clock's scheduling context,
/// never on the context of whatever operation the timer may be bounding.
pub type ClockCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Cancellable handle for a pending scheduled callback.
///
/// Cancelling a task that already fired, or cancelling twice, is a no-op.
pub struct ScheduledTask {
    cancel: Box<dyn Fn() + Send + Sync>,
}

impl ScheduledTask {
    fn new(cancel: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
        }
    }

    pub fn cancel(&self) {
        (self.cancel)()
    }
}

/// Wall-clock time plus one-shot delayed callbacks, in milliseconds.
pub trait Clock: Send + Sync + 'static {
    /// Current time in milliseconds. Monotonic non-decreasing.
    fn now(&self) -> u64;

    /// Arrange exactly one invocation of `callback` no earlier than `at_ms`.
    fn schedule(&self, at_ms: u64, callback: ClockCallback) -> ScheduledTask;

    /// Cancel a pending invocation if it has not fired yet.
    fn unschedule(&self, task: &ScheduledTask) {
        task.cancel();
    }
}

/// Suspend until the clock reaches `now() + delay_ms`.
pub async fn sleep_for(clock: &Arc<dyn Clock>, delay_ms: u64) {
    let (tx, rx) = oneshot::channel::<()>();
    let task = clock.schedule(
        clock.now() + delay_ms,
        Box::new(move || {
            Box::pin(async move {
                let _ = tx.send(());
            }) as BoxFuture<'static, ()>
        }),
    );
    if rx.await.is_err() {
        // Sender dropped without firing; nothing left to wait for.
        task.cancel();
    }
}

/// Production clock backed by the tokio timer.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn schedule(&self, at_ms: u64, callback: ClockCallback) -> ScheduledTask {
        let delay = at_ms.saturating_sub(self.now());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            callback().await;
        });
        let abort = handle.abort_handle();
        ScheduledTask::new(move || abort.abort())
    }
}

struct ManualState {
    now_ms: u64,
    next_id: u64,
    // Keyed by (fire time, insertion id) so same-time tasks fire in
    // scheduling order.
    tasks: BTreeMap<(u64, u64), ClockCallback>,
}

/// Virtual clock for tests.
///
/// Time only moves when [`advance`](ManualClock::advance) is called; the
/// advance fires every due callback in non-decreasing time order, including
/// callbacks scheduled by callbacks when their time falls inside the
/// advanced window (the idle sweep re-arming itself relies on this).
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(now_ms: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now_ms,
                next_id: 0,
                tasks: BTreeMap::new(),
            })),
        }
    }

    /// Move time forward by `delta_ms`, running every callback due on the way.
    pub async fn advance(&self, delta_ms: u64) {
        let target = self.state.lock().now_ms + delta_ms;
        loop {
            let callback = {
                let mut state = self.state.lock();
                match state.tasks.keys().next().copied() {
                    Some(key) if key.0 <= target => {
                        let callback = state.tasks.remove(&key).expect("key just observed");
                        if key.0 > state.now_ms {
                            state.now_ms = key.0;
                        }
                        Some(callback)
                    }
                    _ => None,
                }
            };
            match callback {
                Some(callback) => callback().await,
                None => break,
            }
        }
        self.state.lock().now_ms = target;
    }

    /// Number of callbacks still pending.
    pub fn pending(&self) -> usize {
        self.state.lock().tasks.len()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.state.lock().now_ms
    }

    fn schedule(&self, at_ms: u64, callback: ClockCallback) -> ScheduledTask {
        let key = {
            let mut state = self.state.lock();
            let key = (at_ms, state.next_id);
            state.next_id += 1;
            state.tasks.insert(key, callback);
            key
        };
        let state = Arc::clone(&self.state);
        ScheduledTask::new(move || {
            state.lock().tasks.remove(&key);
        })
    }
}
