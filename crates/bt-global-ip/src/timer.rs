use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// A single periodic callback whose interval can be changed while it's running.
/// Modeled on the `TimerMaker`/`Timer` collaborator pair so the cache's update logic
/// doesn't need to know whether it's driven by a real clock or a test double.
pub trait Timer: Send {
    fn set_callback(&mut self, cb: Arc<dyn Fn() + Send + Sync>);
    fn set_interval(&mut self, interval: Duration);
    fn stop(&mut self);
}

pub trait TimerMaker: Send + Sync {
    fn create(&self) -> Box<dyn Timer>;
}

/// Drives its callback from a spawned tokio task, woken early whenever the interval
/// changes so a transition from `UpkeepInterval` to `RetryUpkeepInterval` (or back)
/// takes effect on the next tick rather than waiting out the old, longer period.
pub struct TokioTimer {
    inner: Arc<Mutex<Inner>>,
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
}

struct Inner {
    callback: Option<Arc<dyn Fn() + Send + Sync>>,
    interval: Duration,
}

pub struct TokioTimerMaker;

impl TimerMaker for TokioTimerMaker {
    fn create(&self) -> Box<dyn Timer> {
        Box::new(TokioTimer::new())
    }
}

impl TokioTimer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                callback: None,
                interval: Duration::from_secs(u64::MAX / 2),
            })),
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    fn ensure_running(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        self.handle = Some(tokio::task::spawn(async move {
            loop {
                let interval = inner.lock().interval;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let cb = inner.lock().callback.clone();
                if let Some(cb) = cb {
                    cb();
                }
            }
        }));
    }
}

impl Default for TokioTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for TokioTimer {
    fn set_callback(&mut self, cb: Arc<dyn Fn() + Send + Sync>) {
        self.inner.lock().callback = Some(cb);
        self.ensure_running();
    }

    fn set_interval(&mut self, interval: Duration) {
        self.inner.lock().interval = interval;
        self.ensure_running();
        // the running task is asleep on the *old* interval; restart it so the new
        // one takes effect immediately instead of after the stale sleep elapses.
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.handle = None;
        self.ensure_running();
    }

    fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
