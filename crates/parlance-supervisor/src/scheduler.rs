use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::supervisor::Supervisor;

/// Owns one periodic task per supervisor. Each supervisor ticks on its own
/// cadence; a slow tick delays only its own supervisor.
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(supervisors: Vec<(Arc<dyn Supervisor>, Duration)>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let handles = supervisors
            .into_iter()
            .map(|(supervisor, period)| {
                let mut shutdown = shutdown.subscribe();
                tokio::spawn(async move {
                    info!(supervisor = supervisor.name(), ?period, "supervisor started");
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                debug!(supervisor = supervisor.name(), "tick");
                                supervisor.do_work().await;
                            }
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                    info!(supervisor = supervisor.name(), "supervisor stopped");
                })
            })
            .collect();
        Scheduler { shutdown, handles }
    }

    /// Stop ticking and wait for in-flight ticks to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSupervisor {
        ticks: AtomicUsize,
    }

    #[async_trait]
    impl Supervisor for CountingSupervisor {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn do_work(&self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn ticks_until_shutdown() {
        let supervisor = Arc::new(CountingSupervisor { ticks: AtomicUsize::new(0) });
        let scheduler = Scheduler::start(vec![(
            supervisor.clone() as Arc<dyn Supervisor>,
            Duration::from_millis(10),
        )]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown().await;
        let observed = supervisor.ticks.load(Ordering::SeqCst);
        assert!(observed >= 2, "expected multiple ticks, saw {observed}");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            supervisor.ticks.load(Ordering::SeqCst),
            observed,
            "no ticks after shutdown"
        );
    }
}
