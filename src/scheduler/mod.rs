use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::interfaces::scheduler::ScheduledJob;

/// Runs each registered job on its own fixed interval until stopped. A tick
/// that overruns the interval delays the next one instead of bursting.
pub struct Scheduler {
    jobs: Vec<Arc<dyn ScheduledJob>>,
    handles: Vec<JoinHandle<()>>,
    stop: Option<watch::Sender<bool>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            handles: Vec::new(),
            stop: None,
        }
    }

    pub fn register_job(&mut self, job: Arc<dyn ScheduledJob>) {
        self.jobs.push(job);
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.iter().map(|job| job.name().to_string()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.stop.is_some()
    }

    pub fn start(&mut self) {
        if self.stop.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        self.stop = Some(tx);

        for job in &self.jobs {
            let job = Arc::clone(job);
            let mut tick = tokio::time::interval(job.interval());
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut rx = rx.clone();
            let handle = tokio::spawn(async move {
                debug!(job = job.name(), "scheduled job started");
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            // The stop flag is checked between ticks; a running
                            // job always finishes.
                            if *rx.borrow() {
                                break;
                            }
                            if let Err(err) = job.run().await {
                                warn!(job = job.name(), error = %err, "scheduled job failed");
                            }
                        }
                        changed = rx.changed() => {
                            if changed.is_err() || *rx.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!(job = job.name(), "scheduled job stopped");
            });
            self.handles.push(handle);
        }
    }

    /// Signals every job and waits for in-progress runs to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(true);
        }
        let handles = std::mem::take(&mut self.handles);
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "scheduled job task ended abnormally");
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, VesperError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        fn name(&self) -> &str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn run(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(VesperError::Runtime("boom".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn jobs_keep_running_after_errors_and_stop_cleanly() {
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
            fail: true,
        });
        let mut scheduler = Scheduler::new();
        scheduler.register_job(job.clone());
        assert_eq!(scheduler.job_names(), vec!["counting".to_string()]);

        scheduler.start();
        assert!(scheduler.is_running());
        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.stop().await;
        assert!(!scheduler.is_running());

        let runs = job.runs.load(Ordering::SeqCst);
        assert!(runs >= 2, "expected repeated runs, got {runs}");
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), runs);
    }
}
