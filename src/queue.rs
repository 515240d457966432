//! Priority task queue
//!
//! Accepts, orders, batches, dispatches, and retains results for async
//! inference tasks. Ordering is strict priority with FIFO inside one
//! class; a short collation window groups same-agent-kind tasks into one
//! routing decision. All queue state sits behind one short mutex that is
//! never held across an await.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QueueSettings;
use crate::dispatch::Dispatcher;
use crate::metrics;
use crate::result_store::{ResponseCache, ResultStore, TaskResult};
use crate::types::{AgentKind, ChatMessage, GatewayError, Priority, TaskStatus};
use crate::utils::{generate_id, timestamp_nanos, timestamp_now};

/// Queue-wide EMA smoothing for service time.
const SERVICE_TIME_SMOOTHING: f64 = 0.1;

/// Wait estimate used before any task has completed.
const DEFAULT_SERVICE_ESTIMATE_MS: f64 = 1000.0;

/// Idle workers re-check the heap at this cadence; requeued tasks get
/// retried even when no new submission arrives.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Pause after the balancer reports no viable target.
const BACKPRESSURE_BACKOFF: Duration = Duration::from_millis(250);

/// Heap entries inspected when collecting batch peers.
const BATCH_SCAN_LIMIT: usize = 128;

/// Sweeper cadence for expired results and stale records.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Terminal task records outlive their results by this factor, so clients
/// can observe `Expired` before the record disappears entirely.
const RECORD_RETENTION_FACTOR: u32 = 4;

/// One async task submission.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub agent_kind: AgentKind,
    pub messages: Vec<ChatMessage>,
    pub priority: Priority,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Completion budget relative to submit time, if the client set one.
    pub deadline_ms: Option<u64>,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub task_id: String,
    pub position: usize,
    pub estimated_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSubmitReceipt {
    pub batch_id: String,
    pub tasks: Vec<SubmitReceipt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    pub agent_kind: AgentKind,
    pub priority: Priority,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatusView {
    pub batch_id: String,
    pub tasks: Vec<TaskView>,
    pub progress: BatchProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    TooLate,
    NotFound,
}

#[derive(Debug, Clone)]
pub enum ResultOutcome {
    Ready(TaskResult),
    NotReady,
    NotFound,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Aggregate queue statistics.
///
/// `queued` and `processing` are live counts (`queued` covers `Batching`
/// too); the terminal fields are cumulative, so
/// `queued + processing + completed + failed + cancelled ==
/// submitted - rejected` holds across cleanup.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub submitted: u64,
    pub rejected: u64,
    pub by_priority: HashMap<String, usize>,
    pub ema_service_time_ms: f64,
    pub tasks_per_minute: usize,
    pub cache_hit_rate: f64,
    pub failures_last_minute: usize,
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    priority_ordinal: u8,
    submitted_nanos: u128,
    task_id: String,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the smallest
        // (priority, submit time, id) key dispatches first.
        other
            .priority_ordinal
            .cmp(&self.priority_ordinal)
            .then_with(|| other.submitted_nanos.cmp(&self.submitted_nanos))
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct TaskRecord {
    task_id: String,
    agent_kind: AgentKind,
    priority: Priority,
    messages: Vec<ChatMessage>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    request_id: String,
    batch_id: Option<String>,
    submitted_at_unix: u64,
    submitted_nanos: u128,
    deadline: Option<Instant>,
    status: TaskStatus,
    started_at_unix: Option<u64>,
    started_instant: Option<Instant>,
    completed_at_unix: Option<u64>,
    terminal_at: Option<Instant>,
    model_used: Option<String>,
}

impl TaskRecord {
    fn view(&self, position: Option<usize>) -> TaskView {
        TaskView {
            task_id: self.task_id.clone(),
            status: self.status,
            position,
            agent_kind: self.agent_kind,
            priority: self.priority,
            created_at: self.submitted_at_unix,
            started_at: self.started_at_unix,
            completed_at: self.completed_at_unix,
            model_used: self.model_used.clone(),
        }
    }

    fn is_waiting(&self) -> bool {
        matches!(self.status, TaskStatus::Queued | TaskStatus::Batching)
    }

    fn ordering_key(&self) -> (u8, u128, &str) {
        (self.priority.ordinal(), self.submitted_nanos, &self.task_id)
    }
}

struct QueueState {
    heap: BinaryHeap<HeapEntry>,
    tasks: HashMap<String, TaskRecord>,
    batches: HashMap<String, Vec<String>>,
    queued: usize,
    processing: usize,
    submitted: u64,
    rejected: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    ema_service_ms: f64,
    recent_outcomes: VecDeque<(Instant, bool)>,
    cache_lookups: u64,
    cache_hits: u64,
}

impl QueueState {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            tasks: HashMap::new(),
            batches: HashMap::new(),
            queued: 0,
            processing: 0,
            submitted: 0,
            rejected: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            ema_service_ms: 0.0,
            recent_outcomes: VecDeque::new(),
            cache_lookups: 0,
            cache_hits: 0,
        }
    }

    /// 1-based rank among waiting tasks by ordering key.
    fn rank_of(&self, key: (u8, u128, &str)) -> usize {
        1 + self
            .tasks
            .values()
            .filter(|record| record.is_waiting() && record.ordering_key() < key)
            .count()
    }

    fn prune_outcomes(&mut self) {
        let horizon = Duration::from_secs(60);
        while let Some(&(at, _)) = self.recent_outcomes.front() {
            if at.elapsed() > horizon {
                self.recent_outcomes.pop_front();
            } else {
                break;
            }
        }
    }
}

/// One task pulled out for dispatch, detached from the queue state.
#[derive(Clone)]
struct DispatchableTask {
    task_id: String,
    request_id: String,
    messages: Vec<ChatMessage>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    deadline: Option<Instant>,
}

pub struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    settings: QueueSettings,
    results: ResultStore,
    cache: ResponseCache,
}

impl TaskQueue {
    pub fn new(settings: QueueSettings) -> Self {
        let results = ResultStore::new(Duration::from_millis(settings.result_ttl_ms));
        let cache = ResponseCache::new(
            settings.cache_enabled,
            Duration::from_millis(settings.cache_ttl_ms),
        );

        Self {
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            settings,
            results,
            cache,
        }
    }

    /// Enqueue one task; fails with `RejectedFull` above capacity.
    pub fn submit(&self, submission: TaskSubmission) -> Result<SubmitReceipt, GatewayError> {
        let mut state = self.state.lock();

        if state.queued >= self.settings.capacity {
            state.rejected += 1;
            state.submitted += 1;
            return Err(GatewayError::RejectedFull);
        }

        let receipt = self.enqueue_locked(&mut state, submission, None);
        metrics::record_task_submitted();
        metrics::set_queue_depth(state.queued);
        drop(state);

        self.notify.notify_one();
        Ok(receipt)
    }

    /// Atomic multi-task submission: either every task enters the queue or
    /// none does.
    pub fn submit_batch(
        &self,
        submissions: Vec<TaskSubmission>,
    ) -> Result<BatchSubmitReceipt, GatewayError> {
        let mut state = self.state.lock();

        let n = submissions.len() as u64;
        if state.queued + submissions.len() > self.settings.capacity {
            state.rejected += n;
            state.submitted += n;
            return Err(GatewayError::RejectedFull);
        }

        let batch_id = generate_id();
        let mut receipts = Vec::with_capacity(submissions.len());
        for submission in submissions {
            let receipt = self.enqueue_locked(&mut state, submission, Some(batch_id.clone()));
            metrics::record_task_submitted();
            receipts.push(receipt);
        }
        state
            .batches
            .insert(batch_id.clone(), receipts.iter().map(|r| r.task_id.clone()).collect());
        metrics::set_queue_depth(state.queued);
        drop(state);

        for _ in 0..receipts.len() {
            self.notify.notify_one();
        }

        Ok(BatchSubmitReceipt {
            batch_id,
            tasks: receipts,
        })
    }

    fn enqueue_locked(
        &self,
        state: &mut QueueState,
        submission: TaskSubmission,
        batch_id: Option<String>,
    ) -> SubmitReceipt {
        let task_id = generate_id();
        let submitted_nanos = timestamp_nanos();
        let deadline = submission
            .deadline_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        let record = TaskRecord {
            task_id: task_id.clone(),
            agent_kind: submission.agent_kind,
            priority: submission.priority,
            messages: submission.messages,
            temperature: submission.temperature,
            max_tokens: submission.max_tokens,
            request_id: submission.request_id,
            batch_id,
            submitted_at_unix: timestamp_now(),
            submitted_nanos,
            deadline,
            status: TaskStatus::Queued,
            started_at_unix: None,
            started_instant: None,
            completed_at_unix: None,
            terminal_at: None,
            model_used: None,
        };

        let position = state.rank_of((record.priority.ordinal(), submitted_nanos, &task_id));
        let estimated_wait_ms = self.estimate_wait(state, position);

        state.heap.push(HeapEntry {
            priority_ordinal: record.priority.ordinal(),
            submitted_nanos,
            task_id: task_id.clone(),
        });
        state.tasks.insert(task_id.clone(), record);
        state.queued += 1;
        state.submitted += 1;

        SubmitReceipt {
            task_id,
            position,
            estimated_wait_ms,
        }
    }

    fn estimate_wait(&self, state: &QueueState, position: usize) -> u64 {
        let per_task = if state.ema_service_ms > 0.0 {
            state.ema_service_ms
        } else {
            DEFAULT_SERVICE_ESTIMATE_MS
        };
        let workers = self.settings.workers.max(1) as f64;
        ((position as f64) * per_task / workers).ceil() as u64
    }

    pub fn status(&self, task_id: &str) -> Option<TaskView> {
        let state = self.state.lock();
        let record = state.tasks.get(task_id)?;
        let position = if record.is_waiting() {
            Some(state.rank_of(record.ordering_key()))
        } else {
            None
        };
        Some(record.view(position))
    }

    pub fn result(&self, task_id: &str) -> ResultOutcome {
        let terminal = {
            let state = self.state.lock();
            match state.tasks.get(task_id) {
                None => return ResultOutcome::NotFound,
                Some(record) if record.status.is_terminal() => true,
                Some(_) => false,
            }
        };

        if !terminal {
            return ResultOutcome::NotReady;
        }
        match self.results.get(task_id) {
            Some(result) => ResultOutcome::Ready(result),
            None => ResultOutcome::Expired,
        }
    }

    /// Cancellation is honored only while the task is `Queued` or still in
    /// an open collation window; a closed batch is past the point of no
    /// return and the queue reports `TooLate`.
    pub fn cancel(&self, task_id: &str) -> CancelOutcome {
        let outcome = {
            let mut state = self.state.lock();
            let Some(record) = state.tasks.get_mut(task_id) else {
                return CancelOutcome::NotFound;
            };

            match record.status {
                TaskStatus::Queued | TaskStatus::Batching => {
                    record.status = TaskStatus::Cancelled;
                    record.completed_at_unix = Some(timestamp_now());
                    record.terminal_at = Some(Instant::now());
                    state.queued -= 1;
                    state.cancelled += 1;
                    metrics::record_task_terminal("cancelled");
                    metrics::set_queue_depth(state.queued);
                    CancelOutcome::Cancelled
                }
                TaskStatus::Cancelled => CancelOutcome::Cancelled,
                TaskStatus::Processing | TaskStatus::Completed | TaskStatus::Failed => {
                    CancelOutcome::TooLate
                }
            }
        };

        if outcome == CancelOutcome::Cancelled {
            self.results
                .insert(task_id, Err(GatewayError::Cancelled));
        }
        outcome
    }

    pub fn batch_status(&self, batch_id: &str) -> Option<BatchStatusView> {
        let state = self.state.lock();
        let task_ids = state.batches.get(batch_id)?;

        let mut tasks = Vec::new();
        let mut progress = BatchProgress {
            total: task_ids.len(),
            completed: 0,
            failed: 0,
            cancelled: 0,
            pending: 0,
        };

        for task_id in task_ids {
            let Some(record) = state.tasks.get(task_id) else {
                continue;
            };
            match record.status {
                TaskStatus::Completed => progress.completed += 1,
                TaskStatus::Failed => progress.failed += 1,
                TaskStatus::Cancelled => progress.cancelled += 1,
                _ => progress.pending += 1,
            }
            let position = if record.is_waiting() {
                Some(state.rank_of(record.ordering_key()))
            } else {
                None
            };
            tasks.push(record.view(position));
        }

        Some(BatchStatusView {
            batch_id: batch_id.to_string(),
            tasks,
            progress,
        })
    }

    pub fn stats(&self) -> QueueStats {
        let mut state = self.state.lock();
        state.prune_outcomes();

        let mut by_priority: HashMap<String, usize> = Priority::ALL
            .iter()
            .map(|p| (format!("{p:?}").to_lowercase(), 0))
            .collect();
        for record in state.tasks.values().filter(|r| r.is_waiting()) {
            *by_priority
                .entry(format!("{:?}", record.priority).to_lowercase())
                .or_insert(0) += 1;
        }

        let failures_last_minute = state
            .recent_outcomes
            .iter()
            .filter(|(_, success)| !success)
            .count();
        let cache_hit_rate = if state.cache_lookups > 0 {
            state.cache_hits as f64 / state.cache_lookups as f64
        } else {
            0.0
        };

        QueueStats {
            queued: state.queued,
            processing: state.processing,
            completed: state.completed,
            failed: state.failed,
            cancelled: state.cancelled,
            submitted: state.submitted,
            rejected: state.rejected,
            by_priority,
            ema_service_time_ms: state.ema_service_ms,
            tasks_per_minute: state.recent_outcomes.len(),
            cache_hit_rate,
            failures_last_minute,
        }
    }

    pub fn health(&self) -> QueueHealth {
        const DEGRADED_DEPTH_RATIO: f64 = 0.8;
        const DEGRADED_FAILURES: usize = 20;
        const UNHEALTHY_FAILURE_RATIO: f64 = 0.5;
        const MIN_OUTCOMES_FOR_RATIO: usize = 10;

        let stats = self.stats();
        let depth_ratio = stats.queued as f64 / self.settings.capacity.max(1) as f64;
        let outcomes = stats.tasks_per_minute;

        if depth_ratio >= 1.0 {
            return QueueHealth::Unhealthy;
        }
        if outcomes >= MIN_OUTCOMES_FOR_RATIO
            && stats.failures_last_minute as f64 / outcomes as f64 > UNHEALTHY_FAILURE_RATIO
        {
            return QueueHealth::Unhealthy;
        }
        if depth_ratio > DEGRADED_DEPTH_RATIO || stats.failures_last_minute > DEGRADED_FAILURES {
            return QueueHealth::Degraded;
        }
        // Every dispatcher busy with a backlog building up.
        if stats.processing >= self.settings.workers.max(1) && depth_ratio > 0.5 {
            return QueueHealth::Degraded;
        }
        QueueHealth::Healthy
    }

    /// Purge terminal records older than `max_age`.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let mut state = self.state.lock();
        let before = state.tasks.len();

        state.tasks.retain(|_, record| {
            !(record.status.is_terminal()
                && record
                    .terminal_at
                    .map_or(false, |at| at.elapsed() >= max_age))
        });

        let tasks = &state.tasks;
        let mut empty_batches: Vec<String> = Vec::new();
        for (batch_id, task_ids) in state.batches.iter() {
            if !task_ids.iter().any(|id| tasks.contains_key(id)) {
                empty_batches.push(batch_id.clone());
            }
        }
        for batch_id in empty_batches {
            state.batches.remove(&batch_id);
        }

        before - state.tasks.len()
    }

    /// Background sweeper: expired results, expired cache entries, stale
    /// terminal records.
    pub async fn run_sweeper(self: Arc<Self>, token: CancellationToken) {
        let record_retention =
            Duration::from_millis(self.settings.result_ttl_ms) * RECORD_RETENTION_FACTOR;
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("queue sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let expired = self.results.remove_expired();
                    let cache_expired = self.cache.remove_expired();
                    let purged = self.cleanup(record_retention);
                    if expired + cache_expired + purged > 0 {
                        debug!(expired, cache_expired, purged, "sweep pass completed");
                    }
                }
            }
        }
    }

    /// Dispatcher worker loop: pull the top task, collate a batch, route
    /// once, dispatch each task, record results.
    pub async fn run_worker(
        self: Arc<Self>,
        dispatcher: Arc<Dispatcher>,
        token: CancellationToken,
    ) {
        info!("queue worker started");
        loop {
            let first = loop {
                if token.is_cancelled() {
                    return;
                }
                if let Some(first) = self.pop_next_eligible() {
                    break first;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            };

            // Collation window: same-kind tasks submitted inside it join
            // this dispatch.
            if self.settings.batch_window_ms > 0 && self.settings.batch_max_size > 1 {
                tokio::time::sleep(Duration::from_millis(self.settings.batch_window_ms)).await;
            }

            let (first_id, agent_kind) = first;
            let mut batch_ids = vec![first_id];
            batch_ids.extend(
                self.collect_batch_peers(agent_kind, self.settings.batch_max_size.saturating_sub(1)),
            );

            let min_context = self.batch_min_context(&batch_ids);
            let decision = match dispatcher.route(agent_kind, min_context) {
                Ok(decision) => decision,
                Err(GatewayError::BackpressureRetry { .. }) => {
                    self.requeue(&batch_ids);
                    tokio::time::sleep(BACKPRESSURE_BACKOFF).await;
                    continue;
                }
                Err(err) => {
                    // Routing failed for a non-pressure reason; fail the
                    // whole batch with the taxonomy kind.
                    let tasks = self.close_batch(&batch_ids);
                    for task in tasks {
                        self.complete_task(&task.task_id, None, Err(err.clone()));
                    }
                    continue;
                }
            };

            let tasks = self.close_batch(&batch_ids);
            if tasks.is_empty() {
                continue;
            }
            debug!(
                batch_size = tasks.len(),
                model = %decision.model.logical_name,
                "dispatching batch"
            );

            let model_name = decision.model.logical_name.clone();
            let mut to_dispatch = Vec::new();
            for task in tasks {
                let key = ResponseCache::key(&task.messages, &model_name);
                let cached = {
                    let mut state = self.state.lock();
                    state.cache_lookups += 1;
                    let hit = self.cache.get(&key);
                    if hit.is_some() {
                        state.cache_hits += 1;
                    }
                    hit
                };

                if let Some(response) = cached {
                    metrics::record_cache_hit();
                    self.complete_task(&task.task_id, Some(model_name.clone()), Ok(response));
                } else {
                    to_dispatch.push((task, key));
                }
            }

            let dispatches = to_dispatch.iter().map(|(task, _)| {
                dispatcher.dispatch_local(
                    agent_kind,
                    &task.messages,
                    task.temperature,
                    task.max_tokens,
                    task.deadline,
                    &task.request_id,
                    Some(decision.clone()),
                )
            });
            let outcomes = join_all(dispatches).await;

            for ((task, cache_key), outcome) in to_dispatch.into_iter().zip(outcomes) {
                match outcome {
                    Ok((response, model_used)) => {
                        self.cache.insert(cache_key, response.clone());
                        self.complete_task(&task.task_id, Some(model_used), Ok(response));
                    }
                    Err(err) => {
                        warn!(task_id = %task.task_id, error = %err, "task dispatch failed");
                        self.complete_task(&task.task_id, None, Err(err));
                    }
                }
            }
        }
    }

    /// Pop the highest-priority queued task and mark it `Batching`. Stale
    /// heap entries (cancelled or already-taken tasks) are skipped.
    fn pop_next_eligible(&self) -> Option<(String, AgentKind)> {
        let mut state = self.state.lock();
        while let Some(entry) = state.heap.pop() {
            if let Some(record) = state.tasks.get_mut(&entry.task_id) {
                if record.status == TaskStatus::Queued {
                    record.status = TaskStatus::Batching;
                    let kind = record.agent_kind;
                    return Some((entry.task_id, kind));
                }
            }
        }
        None
    }

    /// Pull up to `max_extra` queued tasks with the same agent kind, in
    /// heap order. Entries for other kinds go back untouched.
    fn collect_batch_peers(&self, agent_kind: AgentKind, max_extra: usize) -> Vec<String> {
        if max_extra == 0 {
            return Vec::new();
        }

        let mut state = self.state.lock();
        let mut collected = Vec::new();
        let mut put_back = Vec::new();

        for _ in 0..BATCH_SCAN_LIMIT {
            if collected.len() >= max_extra {
                break;
            }
            let Some(entry) = state.heap.pop() else {
                break;
            };
            match state.tasks.get_mut(&entry.task_id) {
                Some(record) if record.status == TaskStatus::Queued => {
                    if record.agent_kind == agent_kind {
                        record.status = TaskStatus::Batching;
                        collected.push(entry.task_id);
                    } else {
                        put_back.push(entry);
                    }
                }
                // Stale entry; drop it.
                _ => {}
            }
        }

        for entry in put_back {
            state.heap.push(entry);
        }
        collected
    }

    fn batch_min_context(&self, task_ids: &[String]) -> u32 {
        let state = self.state.lock();
        task_ids
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .map(|record| Dispatcher::min_context_tokens(&record.messages, record.max_tokens))
            .max()
            .unwrap_or(0)
    }

    /// Close the collation window: every still-`Batching` task transitions
    /// to `Processing`; tasks cancelled inside the window drop out.
    fn close_batch(&self, task_ids: &[String]) -> Vec<DispatchableTask> {
        let mut state = self.state.lock();
        let mut ready = Vec::new();

        for task_id in task_ids {
            let Some(record) = state.tasks.get_mut(task_id) else {
                continue;
            };
            if record.status != TaskStatus::Batching {
                continue;
            }
            record.status = TaskStatus::Processing;
            record.started_at_unix = Some(timestamp_now());
            record.started_instant = Some(Instant::now());
            ready.push(DispatchableTask {
                task_id: record.task_id.clone(),
                request_id: record.request_id.clone(),
                messages: record.messages.clone(),
                temperature: record.temperature,
                max_tokens: record.max_tokens,
                deadline: record.deadline,
            });
        }

        let moved = ready.len();
        state.queued -= moved;
        state.processing += moved;
        metrics::set_queue_depth(state.queued);
        ready
    }

    /// Put a collated-but-undispatched batch back in line; used when the
    /// balancer has no viable target and the tasks should stay queued.
    fn requeue(&self, task_ids: &[String]) {
        let mut state = self.state.lock();
        for task_id in task_ids {
            let Some(record) = state.tasks.get_mut(task_id) else {
                continue;
            };
            if record.status != TaskStatus::Batching {
                continue;
            }
            record.status = TaskStatus::Queued;
            let entry = HeapEntry {
                priority_ordinal: record.priority.ordinal(),
                submitted_nanos: record.submitted_nanos,
                task_id: record.task_id.clone(),
            };
            state.heap.push(entry);
        }
    }

    fn complete_task(&self, task_id: &str, model_used: Option<String>, result: TaskResult) {
        let success = result.is_ok();
        {
            let mut state = self.state.lock();
            let Some(record) = state.tasks.get_mut(task_id) else {
                return;
            };
            if record.status != TaskStatus::Processing {
                warn!(task_id, status = ?record.status, "completion for task not processing");
                return;
            }

            record.status = if success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            record.completed_at_unix = Some(timestamp_now());
            record.terminal_at = Some(Instant::now());
            record.model_used = model_used;

            let service_ms = record
                .started_instant
                .map(|at| at.elapsed().as_secs_f64() * 1000.0)
                .unwrap_or(0.0);

            state.processing -= 1;
            if success {
                state.completed += 1;
                metrics::record_task_terminal("completed");
            } else {
                state.failed += 1;
                metrics::record_task_terminal("failed");
            }

            if state.ema_service_ms == 0.0 {
                state.ema_service_ms = service_ms;
            } else {
                state.ema_service_ms = SERVICE_TIME_SMOOTHING * service_ms
                    + (1.0 - SERVICE_TIME_SMOOTHING) * state.ema_service_ms;
            }
            state.recent_outcomes.push_back((Instant::now(), success));
            state.prune_outcomes();
        }

        self.results.insert(task_id, result);
    }
}
