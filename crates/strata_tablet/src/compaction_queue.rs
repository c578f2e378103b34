//! Per-resource-group compaction job queues with async consumers and
//! generation-based staleness eviction.
//!
//! Concurrency model:
//! - the set keeps one queue per resource group in a read-mostly map; queues
//!   are created on first use for a group
//! - all per-group state (ordered job map, per-tablet index, waiter list,
//!   queued weight) lives under one mutex, so adds, polls, async handoffs,
//!   and generation eviction for a group never interleave
//! - a job added while consumers wait is handed to exactly one waiter from
//!   inside the lock and never becomes observable in the queue
//!
//! Generation tracking: a full metadata scan begins by bumping the per-level
//! generation; entries queued during the scan carry the new generation, and
//! `end_full_scan` evicts whatever the scan did not re-assert.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::extent::{DataLevel, KeyExtent};

/// Named pool of worker servers; compaction queues are partitioned per group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceGroupId(String);

impl ResourceGroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceGroupId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for ResourceGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompactionKind {
    /// Scheduled by the system from size thresholds.
    System,
    /// Requested by a user operation.
    User,
}

impl fmt::Display for CompactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompactionKind::System => f.write_str("system"),
            CompactionKind::User => f.write_str("user"),
        }
    }
}

/// Immutable description of one unit of compaction work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactionJob {
    pub group: ResourceGroupId,
    /// Higher is more urgent.
    pub priority: i16,
    /// Input files of the compaction.
    pub files: Vec<String>,
    pub kind: CompactionKind,
}

impl CompactionJob {
    pub fn new(
        group: ResourceGroupId,
        priority: i16,
        files: Vec<String>,
        kind: CompactionKind,
    ) -> Self {
        Self {
            group,
            priority,
            files,
            kind,
        }
    }
}

/// Assigns a queue-bounding weight to a job.
pub type Weigher = fn(&CompactionJob) -> u64;

/// Approximates the job's in-memory footprint.
pub fn default_job_weigher(job: &CompactionJob) -> u64 {
    let files: usize = job.files.iter().map(|f| f.len() + 48).sum();
    (64 + job.group.as_str().len() + files) as u64
}

/// Time source for queue metrics.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> u64;
}

/// Monotonic clock anchored at construction.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        self.start.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64
    }
}

/// Queue position: priority descending, then insertion order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct JobKey {
    priority: i16,
    seq: u64,
}

impl PartialOrd for JobKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JobKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

struct QueuedJob {
    extent: KeyExtent,
    job: CompactionJob,
    level: DataLevel,
    generation: u64,
    weight: u64,
    queued_at_nanos: u64,
}

struct QueueState {
    jobs: BTreeMap<JobKey, QueuedJob>,
    /// Keys currently queued per tablet, so a re-add replaces them.
    tablet_jobs: HashMap<KeyExtent, Vec<JobKey>>,
    queued_weight: u64,
    next_seq: u64,
    waiters: VecDeque<oneshot::Sender<CompactionJob>>,
}

impl QueueState {
    fn remove_key(&mut self, key: &JobKey) -> Option<QueuedJob> {
        let queued = self.jobs.remove(key)?;
        self.queued_weight -= queued.weight;
        if let Some(keys) = self.tablet_jobs.get_mut(&queued.extent) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.tablet_jobs.remove(&queued.extent);
            }
        }
        Some(queued)
    }

    fn pop_first(&mut self) -> Option<QueuedJob> {
        let key = *self.jobs.keys().next()?;
        self.remove_key(&key)
    }

    fn pop_last(&mut self) -> Option<QueuedJob> {
        let key = *self.jobs.keys().next_back()?;
        self.remove_key(&key)
    }
}

/// One resource group's bounded priority queue.
///
/// Bounded by total weigher weight, not count: when an insertion pushes the
/// queue over its bound, the lowest-priority entries are rejected, never
/// handed to a consumer.
pub struct CompactionJobPriorityQueue {
    group: ResourceGroupId,
    max_weight: AtomicU64,
    weigher: Weigher,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    dequeued_jobs: AtomicU64,
    rejected_jobs: AtomicU64,
    total_queued_nanos: AtomicU64,
    max_queued_nanos: AtomicU64,
}

impl CompactionJobPriorityQueue {
    fn new(group: ResourceGroupId, max_weight: u64, weigher: Weigher, clock: Arc<dyn Clock>) -> Self {
        Self {
            group,
            max_weight: AtomicU64::new(max_weight),
            weigher,
            clock,
            state: Mutex::new(QueueState {
                jobs: BTreeMap::new(),
                tablet_jobs: HashMap::new(),
                queued_weight: 0,
                next_seq: 0,
                waiters: VecDeque::new(),
            }),
            dequeued_jobs: AtomicU64::new(0),
            rejected_jobs: AtomicU64::new(0),
            total_queued_nanos: AtomicU64::new(0),
            max_queued_nanos: AtomicU64::new(0),
        }
    }

    fn add(
        &self,
        extent: &KeyExtent,
        level: DataLevel,
        generation: u64,
        jobs: Vec<CompactionJob>,
    ) {
        let mut state = lock_state(&self.state);

        // a fresh set of jobs for a tablet supersedes whatever is queued
        if let Some(keys) = state.tablet_jobs.remove(extent) {
            for key in keys {
                if let Some(queued) = state.jobs.remove(&key) {
                    state.queued_weight -= queued.weight;
                }
            }
        }

        'jobs: for job in jobs {
            // pending consumers get the job before it ever becomes visible
            while let Some(waiter) = state.waiters.pop_front() {
                match waiter.send(job.clone()) {
                    Ok(()) => {
                        self.dequeued_jobs.fetch_add(1, Ordering::Relaxed);
                        continue 'jobs;
                    }
                    // the consumer abandoned its waiter; try the next one
                    Err(_) => continue,
                }
            }

            let weight = (self.weigher)(&job);
            let key = JobKey {
                priority: job.priority,
                seq: state.next_seq,
            };
            state.next_seq += 1;
            state.queued_weight += weight;
            state.tablet_jobs.entry(extent.clone()).or_default().push(key);
            state.jobs.insert(
                key,
                QueuedJob {
                    extent: extent.clone(),
                    job,
                    level,
                    generation,
                    weight,
                    queued_at_nanos: self.clock.now_nanos(),
                },
            );
        }

        self.enforce_bound(&mut state);
    }

    fn enforce_bound(&self, state: &mut QueueState) {
        let max_weight = self.max_weight.load(Ordering::Relaxed);
        while state.queued_weight > max_weight {
            match state.pop_last() {
                Some(rejected) => {
                    self.rejected_jobs.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        group = %self.group,
                        extent = %rejected.extent,
                        priority = rejected.job.priority,
                        "rejecting lowest priority job, queue over weight"
                    );
                }
                None => break,
            }
        }
    }

    /// Highest-priority job, or `None` when empty. Never blocks.
    pub fn poll(&self) -> Option<CompactionJob> {
        let mut state = lock_state(&self.state);
        let queued = state.pop_first()?;
        drop(state);
        self.note_dequeued(&queued);
        Some(queued.job)
    }

    /// Highest-priority job, completing immediately if one is queued and
    /// otherwise when one next arrives. Dropping the returned future
    /// abandons the wait without losing any job.
    pub fn get_async(&self) -> JobWaiter {
        let mut state = lock_state(&self.state);
        if let Some(queued) = state.pop_first() {
            drop(state);
            self.note_dequeued(&queued);
            return JobWaiter {
                inner: WaiterInner::Ready(Some(queued.job)),
            };
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        JobWaiter {
            inner: WaiterInner::Waiting(rx),
        }
    }

    /// Evict every entry of `level` tagged with a generation older than
    /// `current_generation`. Returns how many were evicted.
    pub fn remove_older_generations(&self, level: DataLevel, current_generation: u64) -> usize {
        let mut state = lock_state(&self.state);
        let stale: Vec<JobKey> = state
            .jobs
            .iter()
            .filter(|(_, queued)| {
                queued.level == level && queued.generation < current_generation
            })
            .map(|(key, _)| *key)
            .collect();
        for key in &stale {
            state.remove_key(key);
        }
        if !stale.is_empty() {
            debug!(
                group = %self.group,
                level = %level,
                evicted = stale.len(),
                "evicted stale queue entries after full scan"
            );
        }
        stale.len()
    }

    /// Apply a new weight bound, shedding lowest-priority entries if the
    /// queue is now over it.
    pub fn reset_max_size(&self, max_weight: u64) {
        self.max_weight.store(max_weight, Ordering::Relaxed);
        let mut state = lock_state(&self.state);
        self.enforce_bound(&mut state);
    }

    pub fn group(&self) -> &ResourceGroupId {
        &self.group
    }

    pub fn max_size(&self) -> u64 {
        self.max_weight.load(Ordering::Relaxed)
    }

    pub fn queued_jobs(&self) -> usize {
        lock_state(&self.state).jobs.len()
    }

    pub fn queued_weight(&self) -> u64 {
        lock_state(&self.state).queued_weight
    }

    pub fn dequeued_jobs(&self) -> u64 {
        self.dequeued_jobs.load(Ordering::Relaxed)
    }

    pub fn rejected_jobs(&self) -> u64 {
        self.rejected_jobs.load(Ordering::Relaxed)
    }

    /// Priority of the worst queued job, or 0 when empty.
    pub fn lowest_priority(&self) -> i16 {
        lock_state(&self.state)
            .jobs
            .keys()
            .next_back()
            .map(|key| key.priority)
            .unwrap_or(0)
    }

    /// Total and maximum time jobs spent queued before dequeue, in nanos.
    pub fn queued_time_nanos(&self) -> (u64, u64) {
        (
            self.total_queued_nanos.load(Ordering::Relaxed),
            self.max_queued_nanos.load(Ordering::Relaxed),
        )
    }

    fn note_dequeued(&self, queued: &QueuedJob) {
        self.dequeued_jobs.fetch_add(1, Ordering::Relaxed);
        let waited = self
            .clock
            .now_nanos()
            .saturating_sub(queued.queued_at_nanos);
        self.total_queued_nanos.fetch_add(waited, Ordering::Relaxed);
        self.max_queued_nanos.fetch_max(waited, Ordering::Relaxed);
    }
}

fn lock_state(state: &Mutex<QueueState>) -> std::sync::MutexGuard<'_, QueueState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

enum WaiterInner {
    Ready(Option<CompactionJob>),
    Waiting(oneshot::Receiver<CompactionJob>),
}

/// Deferred dequeue result. Resolves to `None` only if the queue set was
/// torn down while waiting.
pub struct JobWaiter {
    inner: WaiterInner,
}

impl Future for JobWaiter {
    type Output = Option<CompactionJob>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            WaiterInner::Ready(job) => Poll::Ready(job.take()),
            WaiterInner::Waiting(rx) => Pin::new(rx).poll(cx).map(|res| res.ok()),
        }
    }
}

/// The set of per-resource-group queues, shared by the metadata-scan
/// producers and the worker consumers.
pub struct CompactionJobQueues {
    queues: RwLock<HashMap<ResourceGroupId, Arc<CompactionJobPriorityQueue>>>,
    max_weight: AtomicU64,
    generations: [AtomicU64; DataLevel::ALL.len()],
    weigher: Weigher,
    clock: Arc<dyn Clock>,
}

impl CompactionJobQueues {
    pub fn new(max_weight: u64) -> Self {
        Self::with_parts(max_weight, default_job_weigher, Arc::new(SystemClock::new()))
    }

    pub fn with_parts(max_weight: u64, weigher: Weigher, clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            max_weight: AtomicU64::new(max_weight),
            generations: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            weigher,
            clock,
        }
    }

    /// A full metadata scan of `level` is starting; jobs added from here on
    /// carry the new generation.
    pub fn begin_full_scan(&self, level: DataLevel) {
        self.generations[level.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// The full scan of `level` finished: evict every entry of that level the
    /// scan did not re-assert. Work queued for a while that a fresh scan no
    /// longer finds is work that no longer needs doing.
    pub fn end_full_scan(&self, level: DataLevel) {
        let current = self.generations[level.index()].load(Ordering::Relaxed);
        let queues: Vec<Arc<CompactionJobPriorityQueue>> =
            read_queues(&self.queues).values().cloned().collect();
        for queue in queues {
            queue.remove_older_generations(level, current);
        }
    }

    /// Route `jobs` to their groups' queues, tagged with the current
    /// generation for `extent`'s data level.
    pub fn add(&self, extent: &KeyExtent, jobs: Vec<CompactionJob>) {
        let level = DataLevel::of(extent.table_id());
        let generation = self.generations[level.index()].load(Ordering::Relaxed);

        if jobs.len() == 1 {
            let group = jobs[0].group.clone();
            self.add_to_group(extent, level, generation, group, jobs);
            return;
        }

        let mut by_group: HashMap<ResourceGroupId, Vec<CompactionJob>> = HashMap::new();
        for job in jobs {
            by_group.entry(job.group.clone()).or_default().push(job);
        }
        for (group, group_jobs) in by_group {
            self.add_to_group(extent, level, generation, group, group_jobs);
        }
    }

    fn add_to_group(
        &self,
        extent: &KeyExtent,
        level: DataLevel,
        generation: u64,
        group: ResourceGroupId,
        jobs: Vec<CompactionJob>,
    ) {
        trace!(
            group = %group,
            extent = %extent,
            jobs = jobs.len(),
            "adding jobs to queue"
        );
        self.queue_for(group).add(extent, level, generation, jobs);
    }

    /// Non-blocking dequeue; `None` when the group has no queue or no jobs.
    pub fn poll(&self, group: &ResourceGroupId) -> Option<CompactionJob> {
        let queue = read_queues(&self.queues).get(group).cloned();
        queue.and_then(|q| q.poll())
    }

    /// Deferred dequeue for `group`, creating its queue on demand so a
    /// consumer can wait for the first job ever queued there.
    pub fn get_async(&self, group: &ResourceGroupId) -> JobWaiter {
        self.queue_for(group.clone()).get_async()
    }

    /// Apply a new per-queue weight bound to every queue, current and future.
    pub fn reset_max_size(&self, max_weight: u64) {
        self.max_weight.store(max_weight, Ordering::Relaxed);
        let queues: Vec<Arc<CompactionJobPriorityQueue>> =
            read_queues(&self.queues).values().cloned().collect();
        for queue in queues {
            queue.reset_max_size(max_weight);
        }
    }

    pub fn queue(&self, group: &ResourceGroupId) -> Option<Arc<CompactionJobPriorityQueue>> {
        read_queues(&self.queues).get(group).cloned()
    }

    pub fn queue_ids(&self) -> Vec<ResourceGroupId> {
        read_queues(&self.queues).keys().cloned().collect()
    }

    pub fn queue_count(&self) -> usize {
        read_queues(&self.queues).len()
    }

    pub fn queued_job_count(&self) -> usize {
        read_queues(&self.queues)
            .values()
            .map(|q| q.queued_jobs())
            .sum()
    }

    pub fn queue_max_size(&self, group: &ResourceGroupId) -> u64 {
        self.queue(group).map(|q| q.max_size()).unwrap_or(0)
    }

    pub fn queued_jobs(&self, group: &ResourceGroupId) -> usize {
        self.queue(group).map(|q| q.queued_jobs()).unwrap_or(0)
    }

    pub fn dequeued_jobs(&self, group: &ResourceGroupId) -> u64 {
        self.queue(group).map(|q| q.dequeued_jobs()).unwrap_or(0)
    }

    pub fn rejected_jobs(&self, group: &ResourceGroupId) -> u64 {
        self.queue(group).map(|q| q.rejected_jobs()).unwrap_or(0)
    }

    pub fn lowest_priority(&self, group: &ResourceGroupId) -> i16 {
        self.queue(group).map(|q| q.lowest_priority()).unwrap_or(0)
    }

    fn queue_for(&self, group: ResourceGroupId) -> Arc<CompactionJobPriorityQueue> {
        if let Some(queue) = read_queues(&self.queues).get(&group) {
            return Arc::clone(queue);
        }
        let mut queues = match self.queues.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(queues.entry(group.clone()).or_insert_with(|| {
            Arc::new(CompactionJobPriorityQueue::new(
                group,
                self.max_weight.load(Ordering::Relaxed),
                self.weigher,
                Arc::clone(&self.clock),
            ))
        }))
    }
}

fn read_queues(
    queues: &RwLock<HashMap<ResourceGroupId, Arc<CompactionJobPriorityQueue>>>,
) -> std::sync::RwLockReadGuard<'_, HashMap<ResourceGroupId, Arc<CompactionJobPriorityQueue>>> {
    match queues.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
