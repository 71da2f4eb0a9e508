use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Runs `job` every `every` until `shutdown` flips to true.
///
/// A tick that arrives while the previous run is still going is skipped, so
/// at most one run is in flight at a time.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let in_flight = Arc::new(AtomicBool::new(false));
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; wait a full period before the first run.
        ticker.tick().await;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if in_flight.swap(true, Ordering::AcqRel) {
                        debug!(event = "periodic_skip", job = name);
                        continue;
                    }
                    let guard = InFlight(in_flight.clone());
                    let run = job();
                    tokio::spawn(async move {
                        let _guard = guard;
                        run.await;
                    });
                }
            }
        }
        debug!(event = "periodic_stop", job = name);
    })
}

/// Clears the in-flight flag when a run ends, including by panic.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
