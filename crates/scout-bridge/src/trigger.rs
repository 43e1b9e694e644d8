//! # Periodic Trigger
//!
//! Fires a callback at a fixed interval on its own tokio task.
//!
//! ## Run-State Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Periodic Trigger States                           │
//! │                                                                         │
//! │            start()                     stop()                           │
//! │  ┌─────────┐ ─────► ┌─────────┐ ─────► ┌─────────┐                     │
//! │  │ Stopped │        │ Running │        │ Stopped │   (both idempotent) │
//! │  └─────────┘ ◄───── └─────────┘        └─────────┘                     │
//! │                                                                         │
//! │  RUN STATE: one AtomicBool checked before every tick, flipped by       │
//! │  start/stop from any thread; a Notify wakes the parked loop.           │
//! │                                                                         │
//! │  TICK POLICY: best-effort periodic. A slow callback delays the next    │
//! │  tick (MissedTickBehavior::Delay); ticks are never skipped or queued   │
//! │  for catch-up.                                                         │
//! │                                                                         │
//! │  FAILURE POLICY: a callback error is logged and the loop continues.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::BridgeResult;

// =============================================================================
// Trigger Handle
// =============================================================================

/// Handle controlling a spawned periodic trigger. Cheap to clone; start and
/// stop are safe from any thread or task.
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    running: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl TriggerHandle {
    /// Begins firing. A no-op if already running.
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            debug!("Trigger started");
            self.wake.notify_one();
        }
    }

    /// Suspends firing. A no-op if already stopped.
    ///
    /// Takes effect before the next tick fires; a callback already in
    /// flight completes normally.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!("Trigger stopped");
            self.wake.notify_one();
        }
    }

    /// Returns true if the trigger is currently firing.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Terminates the trigger task. The trigger cannot be restarted.
    pub fn shutdown(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

// =============================================================================
// Periodic Trigger
// =============================================================================

/// Periodic trigger that fires an async callback on a dedicated task.
pub struct PeriodicTrigger;

impl PeriodicTrigger {
    /// Spawns the trigger task. The trigger is created stopped; call
    /// [`TriggerHandle::start`] to begin firing.
    pub fn spawn<F, Fut>(period: Duration, mut callback: F) -> TriggerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = BridgeResult<()>> + Send,
    {
        let handle = TriggerHandle {
            running: Arc::new(AtomicBool::new(false)),
            live: Arc::new(AtomicBool::new(true)),
            wake: Arc::new(Notify::new()),
        };

        let running = handle.running.clone();
        let live = handle.live.clone();
        let wake = handle.wake.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if !live.load(Ordering::SeqCst) {
                    debug!("Trigger task terminating");
                    break;
                }

                if !running.load(Ordering::SeqCst) {
                    // Parked until start() or shutdown(); reset the cadence
                    // so a restart does not fire a stale backlog tick.
                    wake.notified().await;
                    interval.reset();
                    continue;
                }

                tokio::select! {
                    _ = interval.tick() => {
                        // stop() may have landed between the check and the tick.
                        if !running.load(Ordering::SeqCst) {
                            continue;
                        }
                        if let Err(e) = callback().await {
                            warn!(?e, "Trigger callback failed");
                        }
                    }
                    _ = wake.notified() => {
                        // Run-state changed; loop re-checks the flags.
                    }
                }
            }
        });

        handle
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use std::sync::atomic::AtomicUsize;

    fn counting_trigger(period: Duration) -> (TriggerHandle, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = PeriodicTrigger::spawn(period, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        (handle, count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_periodically_after_start() {
        let (handle, count) = counting_trigger(Duration::from_secs(1));

        // Not started yet: nothing fires.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        handle.start();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 3, "expected >= 3 ticks, got {fired}");

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_ticks() {
        let (handle, count) = counting_trigger(Duration::from_secs(1));
        handle.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.stop();

        let at_stop = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), at_stop);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_idempotent() {
        let (handle, count) = counting_trigger(Duration::from_secs(1));

        handle.start();
        handle.start();
        handle.start();
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let fired = count.load(Ordering::SeqCst);
        // Repeated starts must not multiply the tick rate.
        assert!(fired <= 3, "expected <= 3 ticks, got {fired}");

        handle.stop();
        handle.stop();
        assert!(!handle.is_running());

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resumes_firing() {
        let (handle, count) = counting_trigger(Duration::from_secs(1));
        handle.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.stop();
        let at_stop = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(count.load(Ordering::SeqCst) > at_stop);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_error_does_not_kill_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = PeriodicTrigger::spawn(Duration::from_secs(1), move || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(BridgeError::Internal("boom".into()))
                } else {
                    Ok(())
                }
            }
        });
        handle.start();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        // The failed first tick did not stop subsequent ticks.
        assert!(count.load(Ordering::SeqCst) >= 3);

        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_terminates() {
        let (handle, count) = counting_trigger(Duration::from_secs(1));
        handle.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.shutdown();

        let at_shutdown = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), at_shutdown);
    }
}
