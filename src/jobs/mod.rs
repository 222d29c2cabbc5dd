use crate::{context::AppContext, metrics};
use rand::Rng;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};
use tokio::{
    task::JoinHandle,
    time::{interval, interval_at, Duration},
};
use tracing::{debug, error, info};

pub mod tasks;

const DIRECTORY_POLL: &str = "directory_poll";
const RECONCILE: &str = "reconcile";
const HEALTH_CHECK: &str = "health_check";
const HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(300);

struct Heartbeat {
    period: Duration,
    first_due: Instant,
    last_run: Option<Instant>,
    last_succeeded: Option<bool>,
}

impl Heartbeat {
    /// A job is overdue once it has missed a whole period past its next tick
    fn is_overdue(&self, now: Instant) -> bool {
        let next_due = match self.last_run {
            Some(at) => at + self.period,
            None => self.first_due,
        };
        now > next_due + self.period
    }
}

/// Reported state of one background job
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: &'static str,
    pub period_secs: u64,
    pub last_run_secs_ago: Option<f64>,
    pub last_succeeded: Option<bool>,
    pub overdue: bool,
}

/// Last run of every scheduled job
#[derive(Default)]
pub struct JobHeartbeats {
    jobs: Mutex<BTreeMap<&'static str, Heartbeat>>,
}

impl JobHeartbeats {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, BTreeMap<&'static str, Heartbeat>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start tracking a job whose first tick comes after `initial_delay`
    pub fn register(&self, name: &'static str, period: Duration, initial_delay: Duration) {
        self.jobs().insert(
            name,
            Heartbeat {
                period,
                first_due: Instant::now() + initial_delay,
                last_run: None,
                last_succeeded: None,
            },
        );
    }

    /// Note a completed run
    pub fn record(&self, name: &'static str, succeeded: bool) {
        if let Some(beat) = self.jobs().get_mut(name) {
            beat.last_run = Some(Instant::now());
            beat.last_succeeded = Some(succeeded);
        }
    }

    pub fn status(&self) -> Vec<JobStatus> {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> Vec<JobStatus> {
        self.jobs()
            .iter()
            .map(|(&name, beat)| JobStatus {
                name,
                period_secs: beat.period.as_secs(),
                last_run_secs_ago: beat
                    .last_run
                    .map(|at| now.saturating_duration_since(at).as_secs_f64()),
                last_succeeded: beat.last_succeeded,
                overdue: beat.is_overdue(now),
            })
            .collect()
    }
}

/// Job scheduler for background tasks
pub struct JobScheduler {
    context: Arc<AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    /// Start all background jobs. Abort the returned handles to stop them.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        info!("Starting background job scheduler");

        let handles = vec![
            tokio::spawn(Self::directory_poll_job(Arc::clone(&self))),
            tokio::spawn(Self::reconcile_job(Arc::clone(&self))),
            tokio::spawn(Self::health_check_job(Arc::clone(&self))),
        ];

        info!("Background jobs started");
        handles
    }

    /// Delay before the first directory poll
    fn poll_initial_delay(&self) -> Duration {
        match self.context.config.jobs.directory_poll_initial_delay_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(rand::thread_rng().gen_range(1..=4)),
        }
    }

    async fn timed<T, E, F>(&self, job_type: &'static str, run: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = run.await;
        let status = if result.is_ok() { "success" } else { "failure" };
        metrics::record_background_job(job_type, status, started.elapsed().as_secs_f64());
        self.context.jobs.record(job_type, result.is_ok());
        result
    }

    /// Watch the store's directory version for writes made by other instances
    async fn directory_poll_job(scheduler: Arc<Self>) {
        let period = Duration::from_secs(scheduler.context.config.jobs.directory_poll_period_secs);
        let delay = scheduler.poll_initial_delay();
        scheduler.context.jobs.register(DIRECTORY_POLL, period, delay);
        let mut interval = interval_at(tokio::time::Instant::now() + delay, period);

        loop {
            interval.tick().await;

            match scheduler
                .timed(DIRECTORY_POLL, tasks::poll_directory(&scheduler.context))
                .await
            {
                Ok(true) => info!("Directory changed externally, caches invalidated"),
                Ok(false) => debug!("Directory version unchanged"),
                Err(e) => error!("Directory poll failed: {}", e),
            }
        }
    }

    /// Retry failed post-write invalidations
    async fn reconcile_job(scheduler: Arc<Self>) {
        let period = Duration::from_secs(scheduler.context.config.jobs.reconcile_period_secs);
        scheduler.context.jobs.register(RECONCILE, period, Duration::ZERO);
        let mut interval = interval(period);

        loop {
            interval.tick().await;

            if scheduler.context.engine.pending_reconciliation() == 0 {
                scheduler.context.jobs.record(RECONCILE, true);
                continue;
            }

            match scheduler
                .timed(RECONCILE, async { tasks::reconcile(&scheduler.context) })
                .await
            {
                Ok(count) => info!("Reconciled {} cache keys", count),
                Err(e) => error!("Cache reconciliation failed: {}", e),
            }
        }
    }

    /// Health check job (runs every 5 minutes)
    async fn health_check_job(scheduler: Arc<Self>) {
        scheduler
            .context
            .jobs
            .register(HEALTH_CHECK, HEALTH_CHECK_PERIOD, Duration::ZERO);
        let mut interval = interval(HEALTH_CHECK_PERIOD);

        loop {
            interval.tick().await;
            metrics::UPTIME_SECONDS.set(scheduler.context.uptime_seconds());

            match scheduler
                .timed(HEALTH_CHECK, tasks::health_check(&scheduler.context))
                .await
            {
                Ok(_) => {
                    // Silent success - health is good
                }
                Err(e) => error!("Health check failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_jobs_are_ignored() {
        let heartbeats = JobHeartbeats::new();
        heartbeats.record(RECONCILE, true);
        assert!(heartbeats.status().is_empty());
    }

    #[test]
    fn test_job_becomes_overdue_after_a_missed_period() {
        let heartbeats = JobHeartbeats::new();
        heartbeats.register(DIRECTORY_POLL, Duration::from_secs(60), Duration::from_secs(4));
        let now = Instant::now();

        let status = heartbeats.status_at(now);
        assert_eq!(status.len(), 1);
        assert!(!status[0].overdue);
        assert_eq!(status[0].last_run_secs_ago, None);

        // First tick was due after 4 s, one full period of slack on top
        assert!(!heartbeats.status_at(now + Duration::from_secs(60))[0].overdue);
        assert!(heartbeats.status_at(now + Duration::from_secs(70))[0].overdue);
    }

    #[test]
    fn test_recorded_run_resets_the_deadline() {
        let heartbeats = JobHeartbeats::new();
        heartbeats.register(RECONCILE, Duration::from_secs(10), Duration::ZERO);
        heartbeats.record(RECONCILE, false);
        let now = Instant::now();

        let status = &heartbeats.status_at(now + Duration::from_secs(15))[0];
        assert!(!status.overdue);
        assert_eq!(status.last_succeeded, Some(false));
        assert!(status.last_run_secs_ago.unwrap() >= 15.0);

        assert!(heartbeats.status_at(now + Duration::from_secs(25))[0].overdue);
    }
}
