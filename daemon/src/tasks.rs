//! Cancellable background loops and deadline-bounded calls.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use log::{error, warn};

const TASK_SLEEP_CHUNK_MS: u64 = 100;

/// Runs `action` on its own thread every `interval` until dropped.
pub struct RepeatingTask {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RepeatingTask {
    pub fn start<F>(name: impl Into<String>, interval: Duration, mut action: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            loop {
                if sleep_with_cancellation(&flag, interval) {
                    break;
                }
                action();
                if flag.load(Ordering::Relaxed) {
                    break;
                }
            }
        })?;

        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        join_task_handle(&mut self.handle, &self.name);
    }
}

/// Sleeps in short chunks so a stop request is observed promptly.
/// Returns true when the flag was raised.
pub fn sleep_with_cancellation(flag: &AtomicBool, duration: Duration) -> bool {
    let mut elapsed = Duration::ZERO;
    while elapsed < duration {
        if flag.load(Ordering::Relaxed) {
            return true;
        }
        let remaining = duration - elapsed;
        let step = remaining.min(Duration::from_millis(TASK_SLEEP_CHUNK_MS));
        thread::sleep(step);
        elapsed += step;
    }
    flag.load(Ordering::Relaxed)
}

pub fn join_task_handle(handle: &mut Option<thread::JoinHandle<()>>, task_name: &str) {
    if let Some(handle) = handle.take() {
        if handle.thread().id() == thread::current().id() {
            warn!(
                "Skipping join for `{}` because shutdown was called from the same thread",
                task_name
            );
            return;
        }

        if handle.join().is_err() {
            error!("`{}` thread panicked during shutdown", task_name);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    /// The deadline passed before the call returned.
    TimedOut,
    /// A previous call that timed out is still running.
    Busy,
    /// The call panicked or its worker could not be spawned.
    Failed,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::TimedOut => write!(f, "call timed out"),
            CallError::Busy => write!(f, "previous call still in flight"),
            CallError::Failed => write!(f, "call worker failed"),
        }
    }
}

impl std::error::Error for CallError {}

/// Executes blocking collaborator calls with a deadline.
///
/// Each call runs on a short-lived worker thread. When the deadline passes the
/// caller gets `TimedOut` and the worker's eventual result is dropped, so a
/// late answer never reaches the caller. Only one call may be outstanding.
pub struct TimedCall {
    name: String,
    in_flight: Arc<AtomicBool>,
}

struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl TimedCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn call<T, F>(&self, timeout: Duration, f: F) -> Result<T, CallError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(CallError::Busy);
        }

        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        let (tx, rx) = mpsc::sync_channel(1);
        let spawned = thread::Builder::new()
            .name(format!("{}-call", self.name))
            .spawn(move || {
                let _guard = guard;
                let result = f();
                let _ = tx.send(result);
            });

        if let Err(err) = spawned {
            error!("[{}] failed to spawn call worker: {}", self.name, err);
            self.in_flight.store(false, Ordering::Release);
            return Err(CallError::Failed);
        }

        match rx.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(CallError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(CallError::Failed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn sleep_returns_early_when_cancelled() {
        let flag = AtomicBool::new(true);
        let start = Instant::now();
        assert!(sleep_with_cancellation(&flag, Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn repeating_task_runs_until_dropped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task_counter = Arc::clone(&counter);
        let task = RepeatingTask::start("test-repeat", Duration::from_millis(10), move || {
            task_counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        thread::sleep(Duration::from_millis(200));
        drop(task);
        let seen = counter.load(Ordering::SeqCst);
        assert!(seen > 0);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn timed_call_returns_value() {
        let caller = TimedCall::new("fast");
        assert_eq!(caller.call(Duration::from_secs(1), || 42), Ok(42));
        assert!(!caller.is_in_flight());
    }

    #[test]
    fn timed_call_times_out_and_refuses_while_hung() {
        let caller = TimedCall::new("slow");
        let result = caller.call(Duration::from_millis(20), || {
            thread::sleep(Duration::from_millis(300));
            1
        });
        assert_eq!(result, Err(CallError::TimedOut));
        assert_eq!(caller.call(Duration::from_millis(20), || 2), Err(CallError::Busy));

        thread::sleep(Duration::from_millis(400));
        assert_eq!(caller.call(Duration::from_secs(1), || 3), Ok(3));
    }

    #[test]
    fn timed_call_reports_panics_as_failed() {
        let caller = TimedCall::new("panicky");
        let result: Result<u8, _> = caller.call(Duration::from_secs(1), || panic!("boom"));
        assert_eq!(result, Err(CallError::Failed));
        thread::sleep(Duration::from_millis(20));
        assert!(!caller.is_in_flight());
    }
}
