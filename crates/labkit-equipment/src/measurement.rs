/*!
 * Measurement loop controller.
 *
 * A [`MeasurementWorker`] is the single background task that drives
 * continuous measurement for one equipment instance. It sleeps one period,
 * runs one tick, and repeats until it is cancelled or a tick asks it to stop.
 * Cancellation is cooperative: it is observed between ticks and can be
 * re-checked by the tick itself through [`Cancellation`].
 */
use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use labkit_core::config::MeasurementConfig;
use labkit_core::utils::{join_with_timeout, JoinOutcome};

/// Result of `start_measurement()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementStart {
    /// A new worker was launched
    Started,
    /// A worker was already running; nothing was started
    AlreadyRunning,
}

/// Timing limits for the measurement loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTiming {
    /// How long `stop_measurement()` waits for the worker to exit
    pub stop_timeout: Duration,
    /// Lower bound on the polling period, whatever the sample rate
    pub min_poll_interval: Duration,
}

impl Default for LoopTiming {
    fn default() -> Self {
        Self::from(&MeasurementConfig::default())
    }
}

impl From<&MeasurementConfig> for LoopTiming {
    fn from(config: &MeasurementConfig) -> Self {
        Self {
            stop_timeout: config.stop_timeout(),
            min_poll_interval: config.min_poll_interval(),
        }
    }
}

/// Read side of a worker's cancellation flag
#[derive(Debug, Clone)]
pub struct Cancellation(watch::Receiver<bool>);

impl Cancellation {
    /// Whether the owner asked the worker to stop
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// Handle to a running measurement worker.
///
/// Dropping the handle without cancelling still stops the worker at its next
/// suspension point.
#[derive(Debug)]
pub struct MeasurementWorker {
    name: String,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MeasurementWorker {
    /// Spawn a worker that runs `tick` every `period`.
    ///
    /// The first tick happens one period after the spawn.
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut(Cancellation) -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let name = name.into();
        let (cancel, mut cancelled) = watch::channel(false);
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            info!("Measurement worker for '{}' started ({:?} period)", task_name, period);
            let mut ticks: u64 = 0;

            loop {
                tokio::select! {
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(period) => {}
                }

                if *cancelled.borrow() {
                    break;
                }

                ticks += 1;
                if tick(Cancellation(cancelled.clone())).await.is_break() {
                    break;
                }
            }

            debug!("Measurement worker for '{}' exited after {} ticks", task_name, ticks);
        });

        Self { name, cancel, handle }
    }

    /// Raise the cancellation flag
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Whether the worker task has exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the worker and wait up to `timeout` for it to exit.
    ///
    /// A worker that misses the deadline is detached and logged.
    pub async fn stop(self, timeout: Duration) -> JoinOutcome {
        self.cancel();
        join_with_timeout(&self.name, self.handle, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_worker(period: Duration, stop_after: usize) -> (MeasurementWorker, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let worker = MeasurementWorker::spawn("test", period, move |_| {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= stop_after {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
        });
        (worker, count)
    }

    #[tokio::test]
    async fn test_worker_ticks_until_break() {
        let (worker, count) = counting_worker(Duration::from_millis(5), 3);
        let outcome = worker.stop_after_exit().await;
        assert_eq!(outcome, JoinOutcome::Finished);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stop_before_first_tick() {
        let (worker, count) = counting_worker(Duration::from_secs(10), usize::MAX);
        let outcome = worker.stop(Duration::from_secs(1)).await;
        assert_eq!(outcome, JoinOutcome::Finished);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hung_tick_is_detached() {
        let worker = MeasurementWorker::spawn("hung", Duration::from_millis(1), |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            ControlFlow::Continue(())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = worker.stop(Duration::from_millis(20)).await;
        assert_eq!(outcome, JoinOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_tick_sees_cancellation() {
        let worker = MeasurementWorker::spawn("observer", Duration::from_millis(1), |cancel| async move {
            if cancel.is_cancelled() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(worker.stop(Duration::from_secs(1)).await, JoinOutcome::Finished);
    }

    #[test]
    fn test_timing_from_config() {
        let timing = LoopTiming::default();
        assert_eq!(timing.stop_timeout, Duration::from_millis(2000));
        assert_eq!(timing.min_poll_interval, Duration::from_millis(10));
    }

    impl MeasurementWorker {
        async fn stop_after_exit(self) -> JoinOutcome {
            join_with_timeout(&self.name, self.handle, Duration::from_secs(1)).await
        }
    }
}
