//! Bounded producer/consumer pipeline.
//!
//! A [`Processor`] owns a fixed number of lanes. Each lane is a bounded FIFO
//! queue drained by exactly one worker task, so items in the same lane start
//! in enqueue order. Items bound to an owner are routed to a lane by owner
//! id, which keeps every message from one connection in order. Unbound
//! items are spread round-robin.
//!
//! Failures and panics inside an item are caught at the worker boundary and
//! logged; the worker moves on to the next item.

use crate::client_manager::Owner;
use crate::config::ProcessorConfig;
use crate::error::{HandlerResult, Result, ServerError};
use log::{debug, error, info, warn};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

/// Boxed future for handler bodies.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What `enqueue` does when the target lane is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Wait for a free slot, at most this long, then fail with `QueueFull`.
    Block(Duration),
    /// Fail immediately with `QueueFull`.
    DropNewest,
    /// Evict the oldest queued item and accept the new one.
    DropOldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// Accepted after evicting the oldest queued item.
    DroppedOldest,
}

/// A unit of work owned by the processor from enqueue to completion.
pub struct WorkItem {
    owner: Option<Owner>,
    type_id: Option<u16>,
    label: Cow<'static, str>,
    task: BoxFuture<'static, HandlerResult>,
}

impl WorkItem {
    /// Work produced by decoding a message from `owner`.
    pub fn message<F>(owner: Owner, type_id: u16, label: &'static str, task: F) -> Self
    where
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            owner: Some(owner),
            type_id: Some(type_id),
            label: Cow::Borrowed(label),
            task: Box::pin(task),
        }
    }

    /// Internally generated work, such as a scheduler tick.
    pub fn task<F>(label: impl Into<Cow<'static, str>>, task: F) -> Self
    where
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            owner: None,
            type_id: None,
            label: label.into(),
            task: Box::pin(task),
        }
    }

    /// Same lane as every other item from this owner.
    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn owner_id(&self) -> Option<u32> {
        self.owner.as_ref().map(Owner::id)
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("owner", &self.owner_id())
            .field("type_id", &self.type_id)
            .field("label", &self.label)
            .finish()
    }
}

struct Lane {
    queue: Mutex<VecDeque<WorkItem>>,
    /// Free slots. Invariant under the queue lock: permits + len == capacity.
    slots: Semaphore,
    ready: Notify,
    capacity: usize,
    /// Set while the lane's worker is running an item.
    busy: AtomicBool,
}

impl Lane {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Semaphore::new(capacity),
            ready: Notify::new(),
            capacity,
            busy: AtomicBool::new(false),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<WorkItem>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues an item unless the processor stopped accepting. The check
    /// happens under the queue lock, so `stop` either sees the item when it
    /// clears the lane or the item is refused here.
    fn push(&self, item: WorkItem, accepting: &AtomicBool) -> bool {
        let mut queue = self.queue();
        if !accepting.load(Ordering::Acquire) {
            return false;
        }
        queue.push_back(item);
        drop(queue);
        self.ready.notify_one();
        true
    }

    fn pop(&self) -> Option<WorkItem> {
        let mut queue = self.queue();
        let item = queue.pop_front();
        if item.is_some() {
            self.slots.add_permits(1);
        }
        item
    }
}

fn lane_capacity(capacity: usize, workers: usize, lane: usize) -> usize {
    let extra = usize::from(lane < capacity % workers);
    (capacity / workers + extra).max(1)
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

/// Queue health for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub depth: usize,
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub rejected: u64,
}

impl fmt::Display for ProcessorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "depth={} enqueued={} completed={} failed={} dropped={} rejected={}",
            self.depth, self.enqueued, self.completed, self.failed, self.dropped, self.rejected
        )
    }
}

/// Result of `Processor::stop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub name: String,
    pub completed: u64,
    /// Items lost because the grace period ran out: everything still queued
    /// plus any item a worker was aborted in the middle of.
    pub dropped: usize,
}

struct Shared {
    name: String,
    lanes: Vec<Lane>,
    backpressure: Backpressure,
    shutdown_grace: Duration,
    accepting: AtomicBool,
    next_lane: AtomicUsize,
    counters: Counters,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Named queue plus its worker pool. Clones share the same pipeline.
#[derive(Clone)]
pub struct Processor {
    shared: Arc<Shared>,
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("name", &self.shared.name)
            .field("lanes", &self.shared.lanes.len())
            .field("backpressure", &self.shared.backpressure)
            .finish()
    }
}

impl Processor {
    /// Builds the processor and spawns its workers on the current runtime.
    pub fn start(config: &ProcessorConfig) -> Self {
        Self::with_settings(
            &config.name,
            config.workers,
            config.capacity,
            config.backpressure(),
            config.shutdown_grace(),
        )
    }

    /// `capacity` bounds the whole processor and is split across the lanes,
    /// the first `capacity % workers` lanes taking one extra slot. Every lane
    /// holds at least one item.
    pub fn with_settings(
        name: &str,
        workers: usize,
        capacity: usize,
        backpressure: Backpressure,
        shutdown_grace: Duration,
    ) -> Self {
        let workers = workers.max(1);
        let shared = Arc::new(Shared {
            name: name.to_string(),
            lanes: (0..workers)
                .map(|lane| Lane::new(lane_capacity(capacity, workers, lane)))
                .collect(),
            backpressure,
            shutdown_grace,
            accepting: AtomicBool::new(true),
            next_lane: AtomicUsize::new(0),
            counters: Counters::default(),
            workers: Mutex::new(Vec::with_capacity(workers)),
        });

        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|lane| {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move { run_worker(shared, lane).await })
            })
            .collect();
        shared
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);

        debug!("Processor '{}' started with {} workers", name, workers);
        Self { shared }
    }

    /// Name used for routing and in log lines.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Total queue slots across all lanes.
    pub fn capacity(&self) -> usize {
        self.shared.lanes.iter().map(|lane| lane.capacity).sum()
    }

    /// False once `stop` has begun.
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    fn lane_for(&self, item: &WorkItem) -> &Lane {
        let lanes = &self.shared.lanes;
        let index = match item.owner_id() {
            Some(owner) => owner as usize % lanes.len(),
            None => self.shared.next_lane.fetch_add(1, Ordering::Relaxed) % lanes.len(),
        };
        &lanes[index]
    }

    fn reject(&self, item: &WorkItem) -> ServerError {
        self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(
            "[{}] queue full, rejected {} (owner {:?})",
            self.shared.name,
            item.label,
            item.owner_id()
        );
        ServerError::QueueFull(self.shared.name.clone())
    }

    fn accepted(&self) {
        self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Submits an item, applying this processor's backpressure policy.
    pub async fn enqueue(&self, item: WorkItem) -> Result<EnqueueOutcome> {
        if !self.is_accepting() {
            return Err(ServerError::ProcessorStopped(self.shared.name.clone()));
        }

        let lane = self.lane_for(&item);
        let stopped = || ServerError::ProcessorStopped(self.shared.name.clone());

        match self.shared.backpressure {
            Backpressure::Block(wait) => {
                match lane.slots.try_acquire() {
                    Ok(permit) => permit.forget(),
                    Err(TryAcquireError::Closed) => return Err(stopped()),
                    Err(TryAcquireError::NoPermits) => {
                        match tokio::time::timeout(wait, lane.slots.acquire()).await {
                            Ok(Ok(permit)) => permit.forget(),
                            Ok(Err(_)) => return Err(stopped()),
                            Err(_) => return Err(self.reject(&item)),
                        }
                    }
                }
                if !lane.push(item, &self.shared.accepting) {
                    return Err(stopped());
                }
                self.accepted();
                Ok(EnqueueOutcome::Accepted)
            }
            Backpressure::DropNewest => match lane.slots.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    if !lane.push(item, &self.shared.accepting) {
                        return Err(stopped());
                    }
                    self.accepted();
                    Ok(EnqueueOutcome::Accepted)
                }
                Err(TryAcquireError::Closed) => Err(stopped()),
                Err(TryAcquireError::NoPermits) => {
                    self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    Err(self.reject(&item))
                }
            },
            Backpressure::DropOldest => {
                let mut queue = lane.queue();
                if !self.is_accepting() {
                    return Err(stopped());
                }
                let outcome = match lane.slots.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        EnqueueOutcome::Accepted
                    }
                    Err(TryAcquireError::Closed) => return Err(stopped()),
                    Err(TryAcquireError::NoPermits) => {
                        if let Some(evicted) = queue.pop_front() {
                            self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                            debug!("[{}] evicted {} to make room", self.shared.name, evicted.label);
                        }
                        EnqueueOutcome::DroppedOldest
                    }
                };
                queue.push_back(item);
                drop(queue);
                lane.ready.notify_one();
                self.accepted();
                Ok(outcome)
            }
        }
    }

    /// Current queue depth plus lifetime counters
    ///
    /// Depth is summed over the lanes one lock at a time, so it is a close
    /// estimate under load. The monitor-report job logs this for every
    /// processor.
    pub fn stats(&self) -> ProcessorStats {
        let counters = &self.shared.counters;
        ProcessorStats {
            depth: self.shared.lanes.iter().map(|lane| lane.queue().len()).sum(),
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting work, drains for up to the shutdown grace, then
    /// discards whatever is still queued. Workers still running at the
    /// deadline are aborted and their item counts as dropped.
    pub async fn stop(&self) -> StopReport {
        let shared = &self.shared;
        if shared.accepting.swap(false, Ordering::AcqRel) {
            for lane in &shared.lanes {
                lane.slots.close();
                lane.ready.notify_one();
            }
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = shared.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };

        let deadline = Instant::now() + shared.shutdown_grace;
        let mut aborted = 0;
        for (lane, mut handle) in shared.lanes.iter().zip(handles) {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
                if lane.busy.swap(false, Ordering::AcqRel) {
                    warn!("[{}] aborted an in-flight item after grace", shared.name);
                    aborted += 1;
                }
            }
        }

        let queued: usize = shared
            .lanes
            .iter()
            .map(|lane| {
                let mut queue = lane.queue();
                let n = queue.len();
                queue.clear();
                n
            })
            .sum();
        let dropped = queued + aborted;
        shared
            .counters
            .dropped
            .fetch_add(dropped as u64, Ordering::Relaxed);

        let completed = shared.counters.completed.load(Ordering::Relaxed);
        info!(
            "Processor '{}' stopped: {} completed, {} dropped",
            shared.name, completed, dropped
        );

        StopReport {
            name: shared.name.clone(),
            completed,
            dropped,
        }
    }
}

/// Aborts the in-flight item if the worker itself is aborted.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_worker(shared: Arc<Shared>, lane_index: usize) {
    let lane = &shared.lanes[lane_index];

    loop {
        match lane.pop() {
            Some(item) => {
                lane.busy.store(true, Ordering::Release);
                run_item(&shared, item).await;
                lane.busy.store(false, Ordering::Release);
            }
            None => {
                if !shared.accepting.load(Ordering::Acquire) {
                    break;
                }
                lane.ready.notified().await;
            }
        }
    }

    debug!("[{}] worker {} exited", shared.name, lane_index);
}

async fn run_item(shared: &Shared, item: WorkItem) {
    let WorkItem {
        owner,
        type_id,
        label,
        task,
    } = item;
    let owner_id = owner.as_ref().map(Owner::id);

    if let Some(owner) = &owner {
        if !owner.is_alive() {
            shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                "[{}] {}",
                shared.name,
                ServerError::OwnerGone(owner.id())
            );
            return;
        }
    }

    // Run on its own task so a panic unwinds there, not through the worker.
    let handle = tokio::spawn(task);
    let _guard = AbortOnDrop(handle.abort_handle());

    let failure = match handle.await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(join_error) if join_error.is_panic() => Some("handler panicked".to_string()),
        Err(_) => Some("handler cancelled".to_string()),
    };

    match failure {
        None => {
            shared.counters.completed.fetch_add(1, Ordering::Relaxed);
        }
        Some(reason) => {
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            let err = ServerError::HandlerFailure {
                owner: owner_id,
                type_id,
                reason,
            };
            error!("[{}] {} ({})", shared.name, err, label);
        }
    }
}
