//! ---
//! ems_section: "04-runtime"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the battery daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Fixed-period tick source. A late tick delays the following ones instead
/// of bursting to catch up, so the controller never sees back-to-back ticks.
#[derive(Debug)]
pub struct RateLimiter {
    period: Duration,
    interval: tokio::time::Interval,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { period, interval }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next tick and return it as a std instant, the clock the
    /// engine compares frame timestamps against.
    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await.into_std()
    }
}

/// Named background tasks, joined together at shutdown.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        debug!(task = name, "spawning task");
        let handle = tokio::spawn(fut);
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Abort every task that has not finished yet.
    pub fn abort_all(&self) {
        for (name, task) in &self.tasks {
            if !task.is_finished() {
                debug!(task = name, "aborting task");
                task.abort();
            }
        }
    }

    /// Await every task; the first failure is returned after all have ended.
    /// Aborted tasks count as clean exits.
    pub async fn join(self) -> Result<()> {
        let mut first_error = None;
        for (name, task) in self.tasks {
            let outcome = match task.await {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Ok(()),
                Err(err) => Err(anyhow!("task {} join failure: {}", name, err)),
            };
            if let Err(err) = outcome {
                warn!(task = name, error = %err, "task ended with error");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ticks_are_spaced_by_period() {
        let mut limiter = RateLimiter::new(Duration::from_millis(20));
        let first = limiter.tick().await;
        let second = limiter.tick().await;
        let third = limiter.tick().await;
        assert!(second.duration_since(first) >= Duration::from_millis(15));
        assert!(third > second);
        assert_eq!(limiter.period(), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn join_reports_failures_and_ignores_aborts() {
        let mut tasks = TaskSet::new();
        tasks.spawn("ok", async { Ok(()) });
        tasks.spawn("fails", async { Err(anyhow!("boom")) });
        tasks.spawn("forever", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        assert_eq!(tasks.len(), 3);
        tokio::time::sleep(Duration::from_millis(20)).await;
        tasks.abort_all();

        let err = tasks.join().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
