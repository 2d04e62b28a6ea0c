//! Multi-queue write executor
//!
//! ```text
//!  add_for_*() ──► hash(identity) % workers
//!                      │
//!          ┌───────────┼───────────┐
//!          ▼           ▼           ▼
//!      [queue 0]   [queue 1]   [queue 2]     crossbeam channels
//!          │           │           │
//!      worker 0    worker 1    worker 2      one OS thread each
//!          │           │           │
//!          └──── batch ┴── sink ───┘
//! ```
//!
//! Every write for one identity lands on the same worker, so per-identity
//! submission order is preserved. A task that keeps failing goes to the back
//! of its worker's buffer and takes the later tasks for its identity along.
//! A sink that panics fails the task at hand; the worker keeps running.

use std::any::Any;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::config::ExecutorConfig;
use super::sink::WriteSink;
use crate::cache::{Changes, Mutation};
use crate::error::{Error, Result};
use crate::model::{IndexKey, Snapshot};
use crate::temporal::Timestamp;

// =============================================================================
// Tasks
// =============================================================================

#[derive(Debug)]
struct QueuedTask {
    seq: u64,
    mutation: Mutation,
    requeues: u32,
}

enum Message {
    Task(QueuedTask),
    Flush,
}

/// A task that exhausted its requeues
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub seq: u64,
    pub kind: &'static str,
    pub identity: String,
    pub error: String,
}

/// Counters since the executor started
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorReport {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
    pub requeues: u64,
    pub batches: u64,
    pub bulk_inserts: u64,
}

#[derive(Default)]
struct ExecutorStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    requeues: AtomicU64,
    batches: AtomicU64,
    bulk_inserts: AtomicU64,
}

impl ExecutorStats {
    fn report(&self) -> ExecutorReport {
        ExecutorReport {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            requeues: self.requeues.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            bulk_inserts: self.bulk_inserts.load(Ordering::Relaxed),
        }
    }
}

/// Sequence numbers handed out and those still in flight
#[derive(Default)]
struct Ledger {
    next_seq: u64,
    outstanding: BTreeSet<u64>,
}

/// State shared between the handle and its workers
#[derive(Default)]
struct Shared {
    ledger: Mutex<Ledger>,
    idle: Condvar,
    failures: Mutex<Vec<TaskFailure>>,
    stats: ExecutorStats,
}

impl Shared {
    fn begin(&self) -> u64 {
        let mut ledger = self.ledger.lock();
        let seq = ledger.next_seq;
        ledger.next_seq += 1;
        ledger.outstanding.insert(seq);
        seq
    }

    fn finish(&self, seqs: impl IntoIterator<Item = u64>) {
        let mut ledger = self.ledger.lock();
        let mut any = false;
        for seq in seqs {
            any |= ledger.outstanding.remove(&seq);
        }
        if any {
            self.idle.notify_all();
        }
    }
}

// =============================================================================
// Executor
// =============================================================================

pub struct MultiQueueExecutor {
    config: ExecutorConfig,
    senders: Vec<Sender<Message>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    shut_down: AtomicBool,
}

impl MultiQueueExecutor {
    /// Start `config.workers` threads writing into `sink`
    pub fn new(config: ExecutorConfig, sink: Arc<dyn WriteSink>) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::default());
        let mut senders = Vec::with_capacity(config.workers);
        let mut workers = Vec::with_capacity(config.workers);

        for id in 0..config.workers {
            let (tx, rx) = channel::unbounded();
            let worker = Worker {
                id,
                config: config.clone(),
                sink: Arc::clone(&sink),
                shared: Arc::clone(&shared),
                buffer: VecDeque::new(),
            };
            let handle = thread::Builder::new()
                .name(format!("write-queue-{}", id))
                .spawn(move || worker.run(rx))?;
            senders.push(tx);
            workers.push(handle);
        }

        info!(
            workers = config.workers,
            batch_size = config.batch_size,
            "Write executor started"
        );
        Ok(Self {
            config,
            senders,
            workers,
            shared,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Queue any mutation
    pub fn submit(&self, mutation: Mutation) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ExecutorShutdown);
        }
        let worker = (mutation.identity().combined_hash() % self.senders.len() as u64) as usize;
        let seq = self.shared.begin();
        let task = QueuedTask {
            seq,
            mutation,
            requeues: 0,
        };
        self.shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
        if self.senders[worker].send(Message::Task(task)).is_err() {
            self.shared.finish([seq]);
            return Err(Error::ExecutorShutdown);
        }
        Ok(())
    }

    pub fn add_for_insert(&self, snapshot: Snapshot) -> Result<()> {
        self.submit(Mutation::Insert(snapshot))
    }

    pub fn add_for_update(&self, identity: &IndexKey, at: Timestamp, changes: Changes) -> Result<()> {
        self.submit(Mutation::Update {
            identity: identity.clone(),
            at,
            business_as_of: None,
            changes,
        })
    }

    /// Queue an update expressed as the old and new state of one version;
    /// only attributes that differ are written
    pub fn add_for_update_from(&self, old: &Snapshot, new: &Snapshot, at: Timestamp) -> Result<()> {
        if old.identity() != new.identity() {
            return Err(Error::AttributeMismatch {
                identity: new.identity().to_string(),
                attribute: "identity".into(),
            });
        }
        let changes: Changes = new
            .attributes()
            .iter()
            .filter(|(name, value)| old.attribute(name) != Some(*value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        if changes.is_empty() {
            return Ok(());
        }
        self.submit(Mutation::Update {
            identity: old.identity().clone(),
            at,
            business_as_of: Some(old.business().from()),
            changes,
        })
    }

    pub fn add_for_termination(&self, identity: &IndexKey, at: Timestamp) -> Result<()> {
        self.submit(Mutation::Terminate {
            identity: identity.clone(),
            at,
        })
    }

    /// Tasks submitted but not yet completed or failed
    pub fn pending(&self) -> usize {
        self.shared.ledger.lock().outstanding.len()
    }

    pub fn report(&self) -> ExecutorReport {
        self.shared.stats.report()
    }

    /// Flush partial batches and block until every task submitted before
    /// this call has completed or failed. Tasks submitted while waiting are
    /// not waited for.
    #[instrument(skip(self))]
    pub fn wait_until_finished(&self) -> Result<ExecutorReport> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ExecutorShutdown);
        }
        let barrier = self.shared.ledger.lock().next_seq;
        for sender in &self.senders {
            sender.send(Message::Flush).map_err(|_| Error::ExecutorShutdown)?;
        }
        {
            let mut ledger = self.shared.ledger.lock();
            while ledger.outstanding.first().is_some_and(|seq| *seq < barrier) {
                self.shared.idle.wait(&mut ledger);
            }
        }

        let failures: Vec<TaskFailure> = {
            let mut all = self.shared.failures.lock();
            let (before, after): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *all).into_iter().partition(|f| f.seq < barrier);
            *all = after;
            before
        };
        if let Some(first) = failures.first() {
            return Err(Error::QueueTasksFailed {
                failed: failures.len(),
                first: format!(
                    "{} {} (task {}): {}",
                    first.kind, first.identity, first.seq, first.error
                ),
            });
        }
        Ok(self.report())
    }

    /// Drain the queues and join the workers
    pub fn shutdown(&mut self) -> ExecutorReport {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return self.report();
        }
        // Closing the channels lets each worker finish its buffer and exit
        self.senders.clear();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Write queue worker panicked");
            }
        }
        let report = self.report();
        info!(
            completed = report.completed,
            failed = report.failed,
            "Write executor stopped"
        );
        report
    }
}

impl Drop for MultiQueueExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for MultiQueueExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiQueueExecutor")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .finish()
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    id: usize,
    config: ExecutorConfig,
    sink: Arc<dyn WriteSink>,
    shared: Arc<Shared>,
    buffer: VecDeque<QueuedTask>,
}

impl Worker {
    fn run(mut self, rx: channel::Receiver<Message>) {
        debug!(worker = self.id, "Write queue worker started");
        loop {
            match rx.recv_timeout(self.config.flush_interval()) {
                Ok(Message::Task(task)) => {
                    self.buffer.push_back(task);
                    if self.buffer.len() >= self.config.batch_size {
                        self.run_batch();
                    }
                }
                Ok(Message::Flush) | Err(RecvTimeoutError::Timeout) => self.drain(),
                Err(RecvTimeoutError::Disconnected) => {
                    self.drain();
                    break;
                }
            }
        }
        debug!(worker = self.id, "Write queue worker stopped");
    }

    fn drain(&mut self) {
        while !self.buffer.is_empty() {
            self.run_batch();
        }
    }

    /// Execute up to one batch from the front of the buffer
    #[instrument(skip(self), fields(worker = self.id))]
    fn run_batch(&mut self) {
        let take = self.config.batch_size.min(self.buffer.len());
        let mut batch: VecDeque<QueuedTask> = self.buffer.drain(..take).collect();
        self.shared.stats.batches.fetch_add(1, Ordering::Relaxed);

        // Identities whose head task went to the back in this batch
        let mut parked: HashSet<IndexKey> = HashSet::new();
        let mut deferred: Vec<QueuedTask> = Vec::new();

        while let Some(task) = batch.pop_front() {
            if parked.contains(task.mutation.identity()) {
                deferred.push(task);
                continue;
            }

            if task.mutation.is_insert() && self.sink.supports_bulk_insert() {
                let mut group = vec![task];
                while batch
                    .front()
                    .map(|next| next.mutation.is_insert() && !parked.contains(next.mutation.identity()))
                    .unwrap_or(false)
                {
                    if let Some(next) = batch.pop_front() {
                        group.push(next);
                    }
                }
                if group.len() > 1 && self.try_bulk(&group) {
                    continue;
                }
                for task in group {
                    if parked.contains(task.mutation.identity()) {
                        deferred.push(task);
                    } else {
                        self.execute(task, &mut parked, &mut deferred);
                    }
                }
                continue;
            }

            self.execute(task, &mut parked, &mut deferred);
        }

        // Parked tasks go behind everything already buffered, in seq order
        deferred.sort_by_key(|t| t.seq);
        self.buffer.extend(deferred);
    }

    fn try_bulk(&self, group: &[QueuedTask]) -> bool {
        let snapshots: Vec<Snapshot> = group
            .iter()
            .filter_map(|t| match &t.mutation {
                Mutation::Insert(snapshot) => Some(snapshot.clone()),
                _ => None,
            })
            .collect();
        match self.guarded(|| self.sink.insert_all(&snapshots)) {
            Ok(()) => {
                self.shared.stats.bulk_inserts.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .stats
                    .completed
                    .fetch_add(group.len() as u64, Ordering::Relaxed);
                self.shared.finish(group.iter().map(|t| t.seq));
                true
            }
            Err(e) => {
                debug!(worker = self.id, error = %e, "Bulk insert failed, inserting one by one");
                false
            }
        }
    }

    fn execute(&self, mut task: QueuedTask, parked: &mut HashSet<IndexKey>, deferred: &mut Vec<QueuedTask>) {
        let mut last = None;
        for attempt in 1..=self.config.max_retries {
            match self.guarded(|| self.sink.apply(&task.mutation)) {
                Ok(()) => {
                    self.shared.stats.completed.fetch_add(1, Ordering::Relaxed);
                    self.shared.finish([task.seq]);
                    return;
                }
                Err(e) if e.is_retriable(true) => {
                    if attempt < self.config.max_retries {
                        self.shared.stats.retries.fetch_add(1, Ordering::Relaxed);
                    }
                    last = Some(e);
                }
                Err(e) => {
                    self.fail(&task, &e);
                    return;
                }
            }
        }

        let error = last.unwrap_or_else(|| Error::Internal("task never attempted".into()));
        if task.requeues < self.config.max_requeues {
            task.requeues += 1;
            self.shared.stats.requeues.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker = self.id,
                task = task.seq,
                identity = %task.mutation.identity(),
                requeues = task.requeues,
                error = %error,
                "Requeueing write"
            );
            parked.insert(task.mutation.identity().clone());
            deferred.push(task);
        } else {
            self.fail(&task, &error);
        }
    }

    fn fail(&self, task: &QueuedTask, error: &Error) {
        error!(
            worker = self.id,
            task = task.seq,
            kind = task.mutation.kind(),
            identity = %task.mutation.identity(),
            error = %error,
            "Write failed"
        );
        self.shared.failures.lock().push(TaskFailure {
            seq: task.seq,
            kind: task.mutation.kind(),
            identity: task.mutation.identity().to_string(),
            error: error.to_string(),
        });
        self.shared.stats.failed.fetch_add(1, Ordering::Relaxed);
        self.shared.finish([task.seq]);
    }

    /// Run a sink call, turning a panic into an error
    fn guarded(&self, call: impl FnOnce() -> Result<()>) -> Result<()> {
        panic::catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
            Err(Error::Internal(format!(
                "write sink panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, DatedCache};
    use crate::model::{Attribute, AttributeKind, EntityDescriptor, Value};
    use crate::queue::CacheWriteSink;
    use crate::temporal::{Interval, Rectangle};
    use crate::txn::{TransactionCoordinator, TransactionStyle};
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn ts(text: &str) -> Timestamp {
        Timestamp::parse(text).unwrap()
    }

    fn trade(id: i64, price: i64) -> Snapshot {
        Snapshot::builder(vec![Value::Int(id)])
            .attribute("id", id)
            .attribute("price", price)
            .rectangle(Rectangle::new(
                Interval::full(),
                Interval::open_from(ts("2015-01-01")),
            ))
            .build()
            .unwrap()
    }

    fn cache_sink() -> (Arc<DatedCache>, Arc<CacheWriteSink>) {
        let descriptor = EntityDescriptor::new("Trade")
            .attribute(Attribute::new("id", AttributeKind::Int))
            .attribute(Attribute::new("price", AttributeKind::Int))
            .primary_key(["id"])
            .processing_dated("in_z", "out_z");
        let cache = Arc::new(DatedCache::new(descriptor, CacheConfig::default()).unwrap());
        let coordinator =
            TransactionCoordinator::new(Arc::clone(&cache), TransactionStyle::default()).unwrap();
        (cache, Arc::new(CacheWriteSink::new(coordinator)))
    }

    /// Records applied writes; fails the first `failures` attempts per identity
    #[derive(Default)]
    struct ScriptedSink {
        failures: HashMap<IndexKey, u32>,
        attempts: Mutex<HashMap<IndexKey, u32>>,
        applied: Mutex<Vec<(IndexKey, &'static str)>>,
        prices: Mutex<Vec<Value>>,
        bulk: bool,
        bulk_fails: bool,
        bulk_calls: AtomicU64,
    }

    impl WriteSink for ScriptedSink {
        fn apply(&self, mutation: &Mutation) -> Result<()> {
            let identity = mutation.identity().clone();
            let mut attempts = self.attempts.lock();
            let seen = attempts.entry(identity.clone()).or_insert(0);
            *seen += 1;
            if *seen <= self.failures.get(&identity).copied().unwrap_or(0) {
                return Err(Error::lock_timeout("row busy"));
            }
            if let Mutation::Insert(snapshot) = mutation {
                if let Some(price) = snapshot.attribute("price") {
                    self.prices.lock().push(price.clone());
                }
            }
            self.applied.lock().push((identity, mutation.kind()));
            Ok(())
        }

        fn insert_all(&self, snapshots: &[Snapshot]) -> Result<()> {
            self.bulk_calls.fetch_add(1, Ordering::Relaxed);
            if self.bulk_fails {
                return Err(Error::conflict("bulk rejected"));
            }
            let mut applied = self.applied.lock();
            for snapshot in snapshots {
                applied.push((snapshot.identity().clone(), "insert"));
            }
            Ok(())
        }

        fn supports_bulk_insert(&self) -> bool {
            self.bulk
        }
    }

    #[test]
    fn test_insert_update_terminate_leaves_odds() {
        let (cache, sink) = cache_sink();
        let config = ExecutorConfig {
            workers: 4,
            batch_size: 7,
            ..Default::default()
        };
        let executor = MultiQueueExecutor::new(config, sink).unwrap();

        for id in 0..100 {
            executor.add_for_insert(trade(id, 100)).unwrap();
        }
        for id in (0..100).step_by(2) {
            let changes: Changes = [("price".to_string(), Value::Int(200))].into();
            executor
                .add_for_update(&IndexKey::single(id), ts("2015-02-01"), changes)
                .unwrap();
            executor
                .add_for_termination(&IndexKey::single(id), ts("2015-03-01"))
                .unwrap();
        }

        let report = executor.wait_until_finished().unwrap();
        assert_eq!(report.submitted, 200);
        assert_eq!(report.completed, 200);
        assert_eq!(report.failed, 0);

        for id in 0..100 {
            let current = cache.find(&IndexKey::single(id), None, None).unwrap();
            assert_eq!(current.is_some(), id % 2 == 1, "identity {}", id);
        }
        // Evens keep their history: original, repriced, terminated
        let history = cache.history(&IndexKey::single(4));
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|s| !s.is_open()));
    }

    #[test]
    fn test_requeue_keeps_identity_order() {
        let sink = Arc::new(ScriptedSink {
            failures: [(IndexKey::single(1), 2)].into(),
            ..Default::default()
        });
        let config = ExecutorConfig {
            workers: 1,
            batch_size: 10,
            max_retries: 1,
            max_requeues: 5,
            flush_interval_ms: 10_000,
        };
        let executor = MultiQueueExecutor::new(config, Arc::clone(&sink) as Arc<dyn WriteSink>).unwrap();

        executor.add_for_insert(trade(1, 10)).unwrap();
        executor
            .add_for_update(&IndexKey::single(1), ts("2015-02-01"), Changes::new())
            .unwrap();
        executor.add_for_insert(trade(2, 10)).unwrap();

        let report = executor.wait_until_finished().unwrap();
        assert_eq!(report.completed, 3);
        assert_eq!(report.requeues, 2);

        let applied = sink.applied.lock().clone();
        assert_eq!(
            applied,
            vec![
                (IndexKey::single(2), "insert"),
                (IndexKey::single(1), "insert"),
                (IndexKey::single(1), "update"),
            ]
        );
    }

    #[test]
    fn test_exhausted_task_reported() {
        let sink = Arc::new(ScriptedSink {
            failures: [(IndexKey::single(9), u32::MAX)].into(),
            ..Default::default()
        });
        let config = ExecutorConfig {
            workers: 2,
            max_retries: 2,
            max_requeues: 1,
            ..Default::default()
        };
        let executor = MultiQueueExecutor::new(config, Arc::clone(&sink) as Arc<dyn WriteSink>).unwrap();
        executor.add_for_insert(trade(9, 1)).unwrap();
        executor.add_for_insert(trade(10, 1)).unwrap();

        assert_matches!(
            executor.wait_until_finished(),
            Err(Error::QueueTasksFailed { failed: 1, .. })
        );
        assert_eq!(sink.attempts.lock()[&IndexKey::single(9)], 4);
        assert_eq!(executor.report().completed, 1);

        // Failures are reported once
        assert!(executor.wait_until_finished().is_ok());
    }

    #[test]
    fn test_consecutive_inserts_use_bulk_path() {
        let sink = Arc::new(ScriptedSink {
            bulk: true,
            ..Default::default()
        });
        let config = ExecutorConfig {
            workers: 1,
            batch_size: 10,
            flush_interval_ms: 10_000,
            ..Default::default()
        };
        let executor = MultiQueueExecutor::new(config, Arc::clone(&sink) as Arc<dyn WriteSink>).unwrap();
        for id in 0..10 {
            executor.add_for_insert(trade(id, 1)).unwrap();
        }
        let report = executor.wait_until_finished().unwrap();
        assert_eq!(report.bulk_inserts, 1);
        assert_eq!(report.completed, 10);
        assert_eq!(sink.bulk_calls.load(Ordering::Relaxed), 1);
        assert_eq!(sink.applied.lock().len(), 10);
    }

    #[test]
    fn test_bulk_fallback_keeps_identity_order() {
        let sink = Arc::new(ScriptedSink {
            failures: [(IndexKey::single(1), 1)].into(),
            bulk: true,
            bulk_fails: true,
            ..Default::default()
        });
        let config = ExecutorConfig {
            workers: 1,
            batch_size: 10,
            max_retries: 1,
            max_requeues: 5,
            flush_interval_ms: 10_000,
        };
        let executor = MultiQueueExecutor::new(config, Arc::clone(&sink) as Arc<dyn WriteSink>).unwrap();
        executor.add_for_insert(trade(1, 1)).unwrap();
        executor.add_for_insert(trade(1, 2)).unwrap();
        executor.add_for_insert(trade(2, 3)).unwrap();

        let report = executor.wait_until_finished().unwrap();
        assert_eq!(report.completed, 3);
        assert_eq!(report.requeues, 1);
        assert_eq!(
            *sink.prices.lock(),
            vec![Value::Int(3), Value::Int(1), Value::Int(2)]
        );
    }

    /// Panics on one identity, blocks on another until its gate opens
    struct UnrulySink {
        panic_on: IndexKey,
        gated: HashMap<IndexKey, channel::Receiver<()>>,
        applied: Mutex<Vec<IndexKey>>,
    }

    impl WriteSink for UnrulySink {
        fn apply(&self, mutation: &Mutation) -> Result<()> {
            let identity = mutation.identity();
            if *identity == self.panic_on {
                panic!("sink bug on {}", identity);
            }
            if let Some(gate) = self.gated.get(identity) {
                let _ = gate.recv();
            }
            self.applied.lock().push(identity.clone());
            Ok(())
        }
    }

    #[test]
    fn test_panicking_sink_fails_task() {
        let sink = Arc::new(UnrulySink {
            panic_on: IndexKey::single(13),
            gated: HashMap::new(),
            applied: Mutex::new(Vec::new()),
        });
        let config = ExecutorConfig {
            workers: 1,
            ..Default::default()
        };
        let executor = MultiQueueExecutor::new(config, Arc::clone(&sink) as Arc<dyn WriteSink>).unwrap();
        executor.add_for_insert(trade(13, 1)).unwrap();
        executor.add_for_insert(trade(14, 1)).unwrap();

        assert_matches!(
            executor.wait_until_finished(),
            Err(Error::QueueTasksFailed { failed: 1, first }) if first.contains("panicked")
        );
        assert_eq!(executor.pending(), 0);
        assert_eq!(*sink.applied.lock(), vec![IndexKey::single(14)]);

        // The worker survived
        executor.add_for_insert(trade(15, 1)).unwrap();
        assert_eq!(executor.wait_until_finished().unwrap().completed, 2);
    }

    #[test]
    fn test_wait_ignores_later_submissions() {
        let (open_first, first_gate) = channel::unbounded();
        let (open_second, second_gate) = channel::unbounded();
        let sink = Arc::new(UnrulySink {
            panic_on: IndexKey::single(-1),
            gated: [
                (IndexKey::single(1), first_gate),
                (IndexKey::single(2), second_gate),
            ]
            .into(),
            applied: Mutex::new(Vec::new()),
        });
        let config = ExecutorConfig {
            workers: 1,
            batch_size: 1,
            ..Default::default()
        };
        let executor = MultiQueueExecutor::new(config, Arc::clone(&sink) as Arc<dyn WriteSink>).unwrap();
        executor.add_for_insert(trade(1, 1)).unwrap();

        let (done_tx, done_rx) = channel::unbounded();
        crossbeam::thread::scope(|scope| {
            scope.spawn(|_| {
                let _ = done_tx.send(executor.wait_until_finished());
            });
            std::thread::sleep(std::time::Duration::from_millis(100));
            executor.add_for_insert(trade(2, 1)).unwrap();
            open_first.send(()).unwrap();

            let waited = done_rx.recv_timeout(std::time::Duration::from_secs(5));
            let still_pending = executor.pending();
            open_second.send(()).unwrap();
            assert_matches!(waited, Ok(Ok(_)));
            assert_eq!(still_pending, 1);
        })
        .unwrap();

        assert_eq!(executor.wait_until_finished().unwrap().completed, 2);
        assert_eq!(
            *sink.applied.lock(),
            vec![IndexKey::single(1), IndexKey::single(2)]
        );
    }

    #[test]
    fn test_update_from_writes_only_changes() {
        let sink = Arc::new(ScriptedSink::default());
        let executor = MultiQueueExecutor::new(
            ExecutorConfig::default(),
            Arc::clone(&sink) as Arc<dyn WriteSink>,
        )
        .unwrap();
        let old = trade(3, 10);
        executor.add_for_update_from(&old, &old, ts("2015-02-01")).unwrap();
        executor
            .add_for_update_from(&old, &trade(3, 11), ts("2015-02-01"))
            .unwrap();
        assert_matches!(
            executor.add_for_update_from(&old, &trade(4, 11), ts("2015-02-01")),
            Err(Error::AttributeMismatch { .. })
        );
        let report = executor.wait_until_finished().unwrap();
        assert_eq!(report.submitted, 1);
    }

    #[test]
    fn test_submit_after_shutdown() {
        let (_, sink) = cache_sink();
        let mut executor = MultiQueueExecutor::new(ExecutorConfig::default(), sink).unwrap();
        executor.add_for_insert(trade(1, 1)).unwrap();
        let report = executor.shutdown();
        assert_eq!(report.completed, 1);
        assert_matches!(executor.add_for_insert(trade(2, 1)), Err(Error::ExecutorShutdown));
        assert_matches!(executor.wait_until_finished(), Err(Error::ExecutorShutdown));
    }
}
