//! Recurring jobs driven by cron triggers.
//!
//! One driver task sleeps until the earliest next fire time, fires every due
//! job on its own task, and reschedules it from the time it was due, not the
//! time it finished. A job whose previous firing is still running is
//! skipped for that slot.

pub mod cron;

pub use cron::{CronError, CronExpression};

use crate::error::{HandlerResult, Result, ServerError};
use crate::processor::BoxFuture;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Passed to a job handler on every firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: JobId,
    pub name: String,
    /// The slot this firing belongs to.
    pub scheduled_for: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub id: JobId,
    pub name: String,
    pub trigger: String,
    pub next_fire: Option<DateTime<Utc>>,
    pub running: bool,
    pub fired: u64,
    pub skipped: u64,
}

/// Wall clock in UTC that advances with the tokio clock, so paused time in
/// tests drives cron evaluation.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerClock {
    origin: Instant,
    origin_utc: DateTime<Utc>,
}

impl SchedulerClock {
    pub fn system() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(origin_utc: DateTime<Utc>) -> Self {
        Self {
            origin: Instant::now(),
            origin_utc,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin_utc + elapsed
    }

    /// Tokio instant at which `at` is reached. Past times map to the origin.
    pub fn instant_for(&self, at: DateTime<Utc>) -> Instant {
        match (at - self.origin_utc).to_std() {
            Ok(offset) => self.origin + offset,
            Err(_) => self.origin,
        }
    }
}

type JobHandler = Arc<dyn Fn(JobContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

struct Job {
    name: String,
    trigger: CronExpression,
    handler: JobHandler,
    next_fire: Option<DateTime<Utc>>,
    running: Arc<AtomicBool>,
    fired: u64,
    skipped: u64,
}

/// Clears the running flag when a firing ends, however it ends.
struct RunningGuard {
    name: String,
    running: Arc<AtomicBool>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if std::thread::panicking() {
            error!("Job '{}' panicked", self.name);
        }
    }
}

struct Driver {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

struct SchedulerShared {
    jobs: Mutex<BTreeMap<JobId, Job>>,
    next_id: AtomicU64,
    changed: Notify,
    clock: SchedulerClock,
    grace: Duration,
    driver: Mutex<Option<Driver>>,
}

impl SchedulerShared {
    fn jobs(&self) -> MutexGuard<'_, BTreeMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advances every due job to its next slot and returns the firings to
    /// run. Overlapping firings are skipped here.
    ///
    /// Handlers are invoked after the job table is unlocked, so a handler may
    /// schedule, unschedule or list jobs itself.
    fn collect_due(&self, now: DateTime<Utc>) -> Vec<BoxFuture<'static, ()>> {
        let mut claimed = Vec::new();
        {
            let mut jobs = self.jobs();
            for (id, job) in jobs.iter_mut() {
                let scheduled_for = match job.next_fire {
                    Some(at) if at <= now => at,
                    _ => continue,
                };

                job.next_fire = match job.trigger.next_after(&scheduled_for) {
                    Some(next) if next <= now => {
                        debug!("Job '{}' misfired at {}, re-anchoring", job.name, scheduled_for);
                        job.trigger.next_after(&now)
                    }
                    next => next,
                };
                if job.next_fire.is_none() {
                    info!("Job '{}' has no further fire times", job.name);
                }

                if job.running.swap(true, Ordering::AcqRel) {
                    job.skipped += 1;
                    warn!(
                        "{}, skipping slot {}",
                        ServerError::JobOverlap(job.name.clone()),
                        scheduled_for
                    );
                    continue;
                }
                job.fired += 1;

                let guard = RunningGuard {
                    name: job.name.clone(),
                    running: Arc::clone(&job.running),
                };
                let ctx = JobContext {
                    job_id: *id,
                    name: job.name.clone(),
                    scheduled_for,
                    fired_at: now,
                };
                claimed.push((Arc::clone(&job.handler), ctx, guard));
            }
        }

        claimed
            .into_iter()
            .map(|(handler, ctx, guard)| {
                let firing = handler(ctx);
                Box::pin(async move {
                    let guard = guard;
                    if let Err(e) = firing.await {
                        error!("Job '{}' failed: {}", guard.name, e);
                    }
                }) as BoxFuture<'static, ()>
            })
            .collect()
    }

    fn next_wake(&self) -> Option<Instant> {
        self.jobs()
            .values()
            .filter_map(|job| job.next_fire)
            .min()
            .map(|at| self.clock.instant_for(at))
    }
}

/// Handle to the job table and its driver. Clones share state.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.shared.jobs().len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Scheduler {
    /// `grace` bounds how long `stop` waits for running firings.
    pub fn new(grace: Duration) -> Self {
        Self::with_clock(SchedulerClock::system(), grace)
    }

    pub fn with_clock(clock: SchedulerClock, grace: Duration) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                jobs: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                changed: Notify::new(),
                clock,
                grace,
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn clock(&self) -> SchedulerClock {
        self.shared.clock
    }

    /// Registers a recurring job. Names are unique; an unparsable or
    /// unsatisfiable trigger is rejected.
    pub fn schedule<F, Fut>(&self, name: &str, trigger: &str, handler: F) -> Result<JobId>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let trigger = CronExpression::parse(trigger)?;
        let next_fire = trigger.next_after(&self.shared.clock.now()).ok_or_else(|| {
            ServerError::SchedulerConfig(format!("trigger '{}' never fires", trigger))
        })?;

        let mut jobs = self.shared.jobs();
        if jobs.values().any(|job| job.name == name) {
            return Err(ServerError::SchedulerConfig(format!(
                "job '{}' already scheduled",
                name
            )));
        }

        let id = JobId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: JobHandler =
            Arc::new(move |ctx: JobContext| -> BoxFuture<'static, HandlerResult> {
                Box::pin(handler(ctx))
            });

        info!("Scheduled job '{}' ({}) with trigger '{}'", name, id, trigger);
        jobs.insert(
            id,
            Job {
                name: name.to_string(),
                trigger,
                handler,
                next_fire: Some(next_fire),
                running: Arc::new(AtomicBool::new(false)),
                fired: 0,
                skipped: 0,
            },
        );
        drop(jobs);

        self.shared.changed.notify_one();
        Ok(id)
    }

    /// Removes a job. A firing already in progress runs to completion.
    pub fn unschedule(&self, id: JobId) -> bool {
        let removed = self.shared.jobs().remove(&id);
        match removed {
            Some(job) => {
                info!("Unscheduled job '{}' ({})", job.name, id);
                self.shared.changed.notify_one();
                true
            }
            None => false,
        }
    }

    /// Summaries of every scheduled job in id order
    ///
    /// Safe to call from inside a job handler. The `running` flag reflects
    /// the moment of the call; a firing may start or finish right after.
    pub fn jobs(&self) -> Vec<JobSummary> {
        self.shared
            .jobs()
            .iter()
            .map(|(id, job)| JobSummary {
                id: *id,
                name: job.name.clone(),
                trigger: job.trigger.to_string(),
                next_fire: job.next_fire,
                running: job.running.load(Ordering::Acquire),
                fired: job.fired,
                skipped: job.skipped,
            })
            .collect()
    }

    /// Whether the driver task is started and not yet stopped
    pub fn is_running(&self) -> bool {
        self.shared
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Spawns the driver. Fire times are recomputed from now.
    pub fn start(&self) {
        let mut driver = self.shared.driver.lock().unwrap_or_else(|e| e.into_inner());
        if driver.is_some() {
            warn!("Scheduler already running");
            return;
        }

        let now = self.shared.clock.now();
        let count = {
            let mut jobs = self.shared.jobs();
            for job in jobs.values_mut() {
                job.next_fire = job.trigger.next_after(&now);
            }
            jobs.len()
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_driver(Arc::clone(&self.shared), shutdown_rx));
        *driver = Some(Driver { handle, shutdown });
        info!("Scheduler started with {} jobs", count);
    }

    /// Stops the driver. No firing starts after this returns; firings in
    /// progress get the grace period, then are aborted.
    pub async fn stop(&self) {
        let driver = self
            .shared
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(driver) = driver else {
            return;
        };

        let _ = driver.shutdown.send(true);
        if let Err(e) = driver.handle.await {
            error!("Scheduler driver ended abnormally: {}", e);
        }
        info!("Scheduler stopped");
    }
}

async fn run_driver(shared: Arc<SchedulerShared>, mut shutdown: watch::Receiver<bool>) {
    let mut firings = JoinSet::new();

    loop {
        if *shutdown.borrow() {
            break;
        }

        for firing in shared.collect_due(shared.clock.now()) {
            firings.spawn(firing);
        }

        let wake = shared.next_wake();
        let sleep = async {
            match wake {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = sleep => {}
            _ = shared.changed.notified() => {}
            _ = shutdown.changed() => break,
            Some(_) = firings.join_next(), if !firings.is_empty() => {}
        }
    }

    if !firings.is_empty() {
        info!(
            "Waiting up to {:?} for {} running jobs",
            shared.grace,
            firings.len()
        );
        let drained = tokio::time::timeout(shared.grace, async {
            while firings.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("Aborting {} jobs still running after grace", firings.len());
            firings.shutdown().await;
        }
    }
    debug!("Scheduler driver exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::{assert_err, assert_ok};

    /// A quarter second past a whole second, so fire times never coincide
    /// with the test's own sleeps.
    fn test_clock() -> SchedulerClock {
        let origin = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
            + chrono::Duration::milliseconds(250);
        SchedulerClock::starting_at(origin)
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_second_fires_three_times_in_three_seconds() {
        let scheduler = Scheduler::with_clock(test_clock(), Duration::from_secs(1));
        let fired = counter();
        let active = counter();
        let max_active = counter();

        {
            let (fired, active, max_active) = (fired.clone(), active.clone(), max_active.clone());
            assert_ok!(scheduler.schedule("tick", "* * * * * ?", move |_| {
                let (fired, active, max_active) =
                    (fired.clone(), active.clone(), max_active.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    fired.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_job_skips_overlapping_slots() {
        let scheduler = Scheduler::with_clock(test_clock(), Duration::from_secs(1));
        let fired = counter();

        let id = {
            let fired = fired.clone();
            assert_ok!(scheduler.schedule("slow", "* * * * * ?", move |_| {
                let fired = fired.clone();
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2500)).await;
                    Ok(())
                }
            }))
        };

        scheduler.start();
        // Fires at 0.75s, runs until 3.25s, fires again at 3.75s.
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 2);
        let summary = scheduler.jobs().into_iter().find(|job| job.id == id).unwrap();
        assert_eq!(summary.fired, 2);
        assert_eq!(summary.skipped, 2);
        assert!(summary.running);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_keeps_its_schedule() {
        let scheduler = Scheduler::with_clock(test_clock(), Duration::from_secs(1));
        let fired = counter();

        {
            let fired = fired.clone();
            assert_ok!(scheduler.schedule("flaky", "* * * * * ?", move |_| {
                let fired = fired.clone();
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    Err::<(), HandlerError>("world unavailable".into())
                }
            }));
        }

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_context_carries_slot() {
        let scheduler = Scheduler::with_clock(test_clock(), Duration::from_secs(1));
        let seen: Arc<Mutex<Vec<JobContext>>> = Arc::new(Mutex::new(Vec::new()));

        {
            let seen = seen.clone();
            assert_ok!(scheduler.schedule("ctx", "*/2 * * * * ?", move |ctx| {
                seen.lock().unwrap().push(ctx);
                async { Ok(()) }
            }));
        }

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(3)).await;
        scheduler.stop().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].name, "ctx");
        assert_eq!(
            seen[0].scheduled_for,
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 2).unwrap()
        );
        assert!(seen[0].fired_at >= seen[0].scheduled_for);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unschedule_disables_job() {
        let scheduler = Scheduler::with_clock(test_clock(), Duration::from_secs(1));
        let fired = counter();

        let id = {
            let fired = fired.clone();
            assert_ok!(scheduler.schedule("once", "* * * * * ?", move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }))
        };

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(scheduler.unschedule(id));
        assert!(!scheduler.unschedule(id));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.jobs().is_empty());
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_can_unschedule_itself() {
        let scheduler = Scheduler::with_clock(test_clock(), Duration::from_secs(1));
        let fired = counter();
        let own_id: Arc<Mutex<Option<JobId>>> = Arc::new(Mutex::new(None));

        let id = {
            let (fired, own_id, handle) = (fired.clone(), own_id.clone(), scheduler.clone());
            assert_ok!(scheduler.schedule("one-shot", "* * * * * ?", move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *own_id.lock().unwrap() {
                    handle.unschedule(id);
                }
                async { Ok(()) }
            }))
        };
        *own_id.lock().unwrap() = Some(id);

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.jobs().is_empty());
        tokio::time::timeout(Duration::from_secs(5), scheduler.stop())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_can_inspect_the_job_table() {
        let scheduler = Scheduler::with_clock(test_clock(), Duration::from_secs(1));
        let listed = counter();

        {
            let (listed, handle) = (listed.clone(), scheduler.clone());
            assert_ok!(scheduler.schedule("census", "* * * * * ?", move |_| {
                listed.fetch_add(handle.jobs().len(), Ordering::SeqCst);
                async { Ok(()) }
            }));
        }

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(listed.load(Ordering::SeqCst), 3);
        tokio::time::timeout(Duration::from_secs(5), scheduler.stop())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_added_while_running_is_picked_up() {
        let scheduler = Scheduler::with_clock(test_clock(), Duration::from_secs(1));
        scheduler.start();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let fired = counter();
        {
            let fired = fired.clone();
            assert_ok!(scheduler.schedule("late", "* * * * * ?", move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }));
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_firings_and_aborts_after_grace() {
        let scheduler = Scheduler::with_clock(test_clock(), Duration::from_millis(500));
        let fired = counter();
        let finished = counter();

        {
            let (fired, finished) = (fired.clone(), finished.clone());
            assert_ok!(scheduler.schedule("stuck", "* * * * * ?", move |_| {
                let (fired, finished) = (fired.clone(), finished.clone());
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }

        scheduler.start();
        assert!(scheduler.is_running());
        tokio::time::sleep(Duration::from_secs(1)).await;
        scheduler.stop().await;
        assert!(!scheduler.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert!(!scheduler.jobs()[0].running);
    }

    #[tokio::test]
    async fn test_misfire_fires_once_and_reanchors() {
        let clock = test_clock();
        let scheduler = Scheduler::with_clock(clock, Duration::from_secs(1));
        assert_ok!(scheduler.schedule("minutely", "0 * * * * ?", |_| async { Ok(()) }));

        let late = Utc.with_ymd_and_hms(2024, 1, 1, 12, 10, 30).unwrap();
        let firings = scheduler.shared.collect_due(late);
        assert_eq!(firings.len(), 1);
        drop(firings);

        let job = &scheduler.jobs()[0];
        assert_eq!(
            job.next_fire,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 11, 0).unwrap())
        );
        assert!(!job.running);
    }

    #[tokio::test]
    async fn test_schedule_rejects_bad_configuration() {
        let scheduler = Scheduler::new(Duration::from_secs(1));
        assert_ok!(scheduler.schedule("tick", "* * * * * ?", |_| async { Ok(()) }));

        let duplicate = assert_err!(scheduler.schedule("tick", "*/5 * * * * ?", |_| async { Ok(()) }));
        assert!(matches!(duplicate, ServerError::SchedulerConfig(_)));

        let malformed = assert_err!(scheduler.schedule("bad", "every second", |_| async { Ok(()) }));
        assert!(matches!(malformed, ServerError::SchedulerConfig(_)));

        let never = assert_err!(scheduler.schedule("never", "0 0 0 30 FEB ?", |_| async { Ok(()) }));
        assert!(matches!(never, ServerError::SchedulerConfig(_)));

        assert_eq!(scheduler.jobs().len(), 1);
    }

    #[test]
    fn test_clock_maps_times_to_instants() {
        let clock = test_clock();
        let later = clock.now() + chrono::Duration::seconds(2);
        let instant = clock.instant_for(later);
        assert!(instant >= clock.origin + Duration::from_secs(2));
        assert_eq!(
            clock.instant_for(clock.origin_utc - chrono::Duration::seconds(5)),
            clock.origin
        );
    }
}
