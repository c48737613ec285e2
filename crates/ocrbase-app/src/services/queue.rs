//! Durable FIFO of work items with retry, delay, and attempt bookkeeping.
//!
//! Items are keyed by job id, which doubles as the dedup key: a second
//! enqueue for the same job is rejected in whatever state the first item
//! is in. Workers lease items transactionally, so each item is processed
//! by at most one worker at a time even across processes; expired leases
//! are reclaimed on the next poll.

use std::sync::Arc;
use std::time::Duration;

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore, watch};

use crate::paths::{AppPaths, PathError};
use crate::pipeline::job::{ErrorCode, current_timestamp_ms};

const QUEUE_ENV_MAP_SIZE_BYTES: usize = 1 << 27; // 128 MiB

/// Descriptor pointing at a job to be processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub job_id: String,
    pub tenant_id: String,
    pub submitter_id: String,
    pub request_id: Option<String>,
    /// Attempts that have already run and failed.
    pub attempts_made: u32,
    pub max_attempts: u32,
}

/// What an attempt produced, as classified by the handler.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed,
    /// Transient failure; the queue re-enqueues with backoff until
    /// attempts are exhausted.
    Retry { code: ErrorCode, message: String },
    /// Unrecoverable failure; the item dies on first occurrence.
    Fail { code: ErrorCode, message: String },
}

/// Consumer of work items. `on_terminal_failure` fires exactly when the
/// queue gives up on an item (unrecoverable error or attempts exhausted)
/// and is responsible for flipping the job row to its failed state.
#[async_trait::async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(&self, item: &WorkItem) -> JobOutcome;

    async fn on_terminal_failure(&self, item: &WorkItem, code: ErrorCode, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    Ready,
    Leased,
    Done,
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueRecord {
    item: WorkItem,
    state: ItemState,
    next_attempt_at_ms: i64,
    lease_expires_at_ms: Option<i64>,
    last_error: Option<String>,
    enqueued_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: i64,
    pub backoff_max_ms: i64,
    pub lease_ttl_ms: i64,
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            lease_ttl_ms: 300_000,
            poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("work item for job `{0}` already enqueued")]
    Duplicate(String),
    #[error("work item for job `{0}` not found")]
    NotFound(String),
}

/// Exponential backoff with ±10% jitter, capped.
pub fn calculate_retry_backoff(attempts_made: u32, base_delay_ms: i64, max_delay_ms: i64) -> i64 {
    use rand::Rng;
    debug_assert!(base_delay_ms > 0);
    debug_assert!(max_delay_ms >= base_delay_ms);

    let exponent = attempts_made.min(20);
    let multiplier = 2_i64.saturating_pow(exponent);
    let capped = base_delay_ms.saturating_mul(multiplier).min(max_delay_ms);

    let mut rng = rand::thread_rng();
    let jitter = rng.gen_range(0.9..=1.1);
    let delayed = ((capped as f64) * jitter) as i64;
    delayed.clamp(base_delay_ms, max_delay_ms)
}

/// LMDB-backed work queue.
pub struct WorkQueue {
    env: Env,
    items: Database<Str, Bytes>,
    notify: Notify,
    config: QueueConfig,
}

impl WorkQueue {
    pub fn open(paths: &AppPaths, config: QueueConfig) -> Result<Self, QueueError> {
        let path = paths.queue_lmdb_dir()?;
        debug_assert!(path.exists());
        debug_assert!(config.concurrency >= 1);

        let mut options = EnvOpenOptions::new();
        options.max_dbs(4);
        options.map_size(QUEUE_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };
        let items = {
            let rtxn = env.read_txn()?;
            let opened = env.open_database::<Str, Bytes>(&rtxn, Some("items"))?;
            drop(rtxn);
            match opened {
                Some(existing) => existing,
                None => {
                    let mut wtxn = env.write_txn()?;
                    let db = env.create_database::<Str, Bytes>(&mut wtxn, Some("items"))?;
                    wtxn.commit()?;
                    db
                }
            }
        };
        Ok(Self {
            env,
            items,
            notify: Notify::new(),
            config,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Insert a work item. The job id is the dedup key; re-enqueueing the
    /// same job fails with [`QueueError::Duplicate`] regardless of the
    /// existing item's state.
    pub fn enqueue(&self, mut item: WorkItem) -> Result<(), QueueError> {
        debug_assert!(!item.job_id.is_empty());
        if item.max_attempts == 0 {
            item.max_attempts = self.config.max_attempts;
        }
        let now_ms = current_timestamp_ms();
        let record = QueueRecord {
            item,
            state: ItemState::Ready,
            next_attempt_at_ms: now_ms,
            lease_expires_at_ms: None,
            last_error: None,
            enqueued_at_ms: now_ms,
        };

        let mut wtxn = self.env.write_txn()?;
        let key = record.item.job_id.clone();
        if self.items.get(&wtxn, key.as_str())?.is_some() {
            return Err(QueueError::Duplicate(key));
        }
        let encoded = encode_to_vec(&record, config::standard())?;
        self.items.put(&mut wtxn, key.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        self.notify.notify_one();
        Ok(())
    }

    /// Current state and attempt count of an item, if present.
    pub fn item_state(&self, job_id: &str) -> Result<Option<(ItemState, u32)>, QueueError> {
        let rtxn = self.env.read_txn()?;
        let Some(raw) = self.items.get(&rtxn, job_id)? else {
            return Ok(None);
        };
        let (record, _) = decode_from_slice::<QueueRecord, _>(raw, config::standard())?;
        Ok(Some((record.state, record.item.attempts_made)))
    }

    /// Drive the queue until `shutdown` flips true. Claims due items under
    /// a bounded concurrency and feeds them to the handler.
    pub async fn run(
        self: Arc<Self>,
        handler: Arc<dyn WorkHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        tracing::info!(
            concurrency = self.config.concurrency,
            max_attempts = self.config.max_attempts,
            "work queue started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Sender gone; treat as shutdown.
                        break;
                    }
                    continue;
                }
            };

            let claimed = match self.claim_one() {
                Ok(claimed) => claimed,
                Err(error) => {
                    tracing::error!(%error, "queue claim failed");
                    None
                }
            };

            match claimed {
                Some(item) => {
                    let queue = Arc::clone(&self);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        queue.run_attempt(handler, item).await;
                        drop(permit);
                    });
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        tracing::info!("work queue stopped");
    }

    async fn run_attempt(&self, handler: Arc<dyn WorkHandler>, item: WorkItem) {
        let outcome = handler.handle(&item).await;
        let settled = match outcome {
            JobOutcome::Completed => self.settle_done(&item.job_id),
            JobOutcome::Retry { code, message } => {
                match self.settle_retry(&item.job_id, code, &message) {
                    Ok(exhausted) => {
                        if exhausted {
                            handler.on_terminal_failure(&item, code, &message).await;
                        }
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            }
            JobOutcome::Fail { code, message } => {
                let settled = self.settle_dead(&item.job_id, code, &message);
                if settled.is_ok() {
                    handler.on_terminal_failure(&item, code, &message).await;
                }
                settled
            }
        };
        if let Err(error) = settled {
            tracing::error!(job_id = %item.job_id, %error, "failed to settle work item");
        }
    }

    /// Lease the first due item, reclaiming expired leases on the way.
    fn claim_one(&self) -> Result<Option<WorkItem>, QueueError> {
        let now_ms = current_timestamp_ms();
        let mut wtxn = self.env.write_txn()?;

        let mut claimed: Option<(String, QueueRecord)> = None;
        {
            let iter = self.items.iter(&wtxn)?;
            for entry in iter {
                let (key, raw) = entry?;
                let (record, _) = decode_from_slice::<QueueRecord, _>(raw, config::standard())?;
                let due = match record.state {
                    ItemState::Ready => record.next_attempt_at_ms <= now_ms,
                    ItemState::Leased => record
                        .lease_expires_at_ms
                        .is_some_and(|expires| expires <= now_ms),
                    ItemState::Done | ItemState::Dead => false,
                };
                if due {
                    claimed = Some((key.to_string(), record));
                    break;
                }
            }
        }

        let Some((key, mut record)) = claimed else {
            return Ok(None);
        };
        record.state = ItemState::Leased;
        record.lease_expires_at_ms = Some(now_ms + self.config.lease_ttl_ms);
        let encoded = encode_to_vec(&record, config::standard())?;
        self.items.put(&mut wtxn, key.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(Some(record.item))
    }

    fn settle_done(&self, job_id: &str) -> Result<(), QueueError> {
        self.settle(job_id, |record| {
            record.state = ItemState::Done;
            record.lease_expires_at_ms = None;
        })
    }

    /// Returns true when attempts are exhausted and the item went dead.
    fn settle_retry(
        &self,
        job_id: &str,
        code: ErrorCode,
        message: &str,
    ) -> Result<bool, QueueError> {
        let base = self.config.backoff_base_ms;
        let max = self.config.backoff_max_ms;
        let mut exhausted = false;
        self.settle(job_id, |record| {
            record.item.attempts_made = record.item.attempts_made.saturating_add(1);
            record.last_error = Some(format!("{code}: {message}"));
            record.lease_expires_at_ms = None;
            if record.item.attempts_made >= record.item.max_attempts {
                record.state = ItemState::Dead;
                exhausted = true;
            } else {
                record.state = ItemState::Ready;
                let delay = calculate_retry_backoff(record.item.attempts_made, base, max);
                record.next_attempt_at_ms = current_timestamp_ms() + delay;
            }
        })?;
        if !exhausted {
            self.notify.notify_one();
        }
        Ok(exhausted)
    }

    fn settle_dead(&self, job_id: &str, code: ErrorCode, message: &str) -> Result<(), QueueError> {
        self.settle(job_id, |record| {
            record.item.attempts_made = record.item.attempts_made.saturating_add(1);
            record.state = ItemState::Dead;
            record.lease_expires_at_ms = None;
            record.last_error = Some(format!("{code}: {message}"));
        })
    }

    fn settle<F>(&self, job_id: &str, mutate: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut QueueRecord),
    {
        let mut wtxn = self.env.write_txn()?;
        let Some(raw) = self.items.get(&wtxn, job_id)? else {
            return Err(QueueError::NotFound(job_id.to_string()));
        };
        let (mut record, _) = decode_from_slice::<QueueRecord, _>(raw, config::standard())?;
        mutate(&mut record);
        let encoded = encode_to_vec(&record, config::standard())?;
        self.items.put(&mut wtxn, job_id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> QueueConfig {
        QueueConfig {
            concurrency: 2,
            max_attempts: 3,
            backoff_base_ms: 5,
            backoff_max_ms: 20,
            lease_ttl_ms: 10_000,
            poll_interval_ms: 10,
        }
    }

    fn item(job_id: &str) -> WorkItem {
        WorkItem {
            job_id: job_id.to_string(),
            tenant_id: "org_a".to_string(),
            submitter_id: "user_a".to_string(),
            request_id: None,
            attempts_made: 0,
            max_attempts: 3,
        }
    }

    struct ScriptedHandler {
        fail_first: u32,
        calls: AtomicU32,
        terminal: Mutex<Option<(String, ErrorCode)>>,
        unrecoverable: bool,
    }

    impl ScriptedHandler {
        fn new(fail_first: u32, unrecoverable: bool) -> Self {
            Self {
                fail_first,
                calls: AtomicU32::new(0),
                terminal: Mutex::new(None),
                unrecoverable,
            }
        }
    }

    #[async_trait::async_trait]
    impl WorkHandler for ScriptedHandler {
        async fn handle(&self, _item: &WorkItem) -> JobOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                if self.unrecoverable {
                    JobOutcome::Fail {
                        code: ErrorCode::LlmParseFailed,
                        message: "bad json".to_string(),
                    }
                } else {
                    JobOutcome::Retry {
                        code: ErrorCode::FetchFailed,
                        message: "503".to_string(),
                    }
                }
            } else {
                JobOutcome::Completed
            }
        }

        async fn on_terminal_failure(&self, item: &WorkItem, code: ErrorCode, _message: &str) {
            *self.terminal.lock().expect("terminal lock") = Some((item.job_id.clone(), code));
        }
    }

    async fn run_until<F>(queue: &Arc<WorkQueue>, handler: Arc<ScriptedHandler>, done: F)
    where
        F: Fn(&WorkQueue) -> bool,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn(Arc::clone(queue).run(handler, shutdown_rx));
        for _ in 0..400 {
            if done(queue) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let _ = shutdown_tx.send(true);
        let _ = runner.await;
    }

    fn open_queue() -> (tempfile::TempDir, Arc<WorkQueue>) {
        let temp = tempfile::TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let queue = WorkQueue::open(&paths, test_config()).expect("open queue");
        (temp, Arc::new(queue))
    }

    #[test]
    fn enqueue_dedups_by_job_id() {
        let (_temp, queue) = open_queue();
        queue.enqueue(item("job_1")).expect("first enqueue");
        let err = queue.enqueue(item("job_1")).expect_err("duplicate");
        assert!(matches!(err, QueueError::Duplicate(id) if id == "job_1"));
    }

    #[test]
    fn backoff_is_bounded_and_grows() {
        let base = 100;
        let max = 10_000;
        let first = calculate_retry_backoff(1, base, max);
        let second = calculate_retry_backoff(2, base, max);
        assert!(first >= base && first <= max);
        assert!(second >= base && second <= max);
        assert!(second > first);
        assert!(calculate_retry_backoff(20, base, max) <= max);
    }

    proptest! {
        // Whatever the attempt count or bounds, the delay (jitter
        // included) clamps into [base, max].
        #[test]
        fn prop_backoff_clamps_into_bounds(
            attempts_made in 0_u32..=64,
            base in 1_i64..=60_000,
            headroom in 0_i64..=3_600_000,
        ) {
            let max = base + headroom;
            let delay = calculate_retry_backoff(attempts_made, base, max);
            prop_assert!(delay >= base, "delay {} below base {}", delay, base);
            prop_assert!(delay <= max, "delay {} above max {}", delay, max);
        }
    }

    #[tokio::test]
    async fn item_completes_on_success() {
        let (_temp, queue) = open_queue();
        let handler = Arc::new(ScriptedHandler::new(0, false));
        queue.enqueue(item("job_ok")).expect("enqueue");

        run_until(&queue, Arc::clone(&handler), |queue| {
            matches!(
                queue.item_state("job_ok").expect("state"),
                Some((ItemState::Done, _))
            )
        })
        .await;

        let (state, attempts) = queue
            .item_state("job_ok")
            .expect("state")
            .expect("present");
        assert_eq!(state, ItemState::Done);
        assert_eq!(attempts, 0);
        assert!(handler.terminal.lock().expect("lock").is_none());
    }

    #[tokio::test]
    async fn retryable_failures_retry_then_succeed() {
        let (_temp, queue) = open_queue();
        let handler = Arc::new(ScriptedHandler::new(2, false));
        queue.enqueue(item("job_retry")).expect("enqueue");

        run_until(&queue, Arc::clone(&handler), |queue| {
            matches!(
                queue.item_state("job_retry").expect("state"),
                Some((ItemState::Done, _))
            )
        })
        .await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let (state, attempts) = queue
            .item_state("job_retry")
            .expect("state")
            .expect("present");
        assert_eq!(state, ItemState::Done);
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn retryable_failures_exhaust_attempts() {
        let (_temp, queue) = open_queue();
        let handler = Arc::new(ScriptedHandler::new(u32::MAX, false));
        queue.enqueue(item("job_dead")).expect("enqueue");

        run_until(&queue, Arc::clone(&handler), |queue| {
            matches!(
                queue.item_state("job_dead").expect("state"),
                Some((ItemState::Dead, _))
            )
        })
        .await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let terminal = handler.terminal.lock().expect("lock").clone();
        assert_eq!(
            terminal,
            Some(("job_dead".to_string(), ErrorCode::FetchFailed))
        );
    }

    #[tokio::test]
    async fn unrecoverable_failure_dies_on_first_attempt() {
        let (_temp, queue) = open_queue();
        let handler = Arc::new(ScriptedHandler::new(u32::MAX, true));
        queue.enqueue(item("job_fatal")).expect("enqueue");

        run_until(&queue, Arc::clone(&handler), |queue| {
            matches!(
                queue.item_state("job_fatal").expect("state"),
                Some((ItemState::Dead, _))
            )
        })
        .await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let terminal = handler.terminal.lock().expect("lock").clone();
        assert_eq!(
            terminal,
            Some(("job_fatal".to_string(), ErrorCode::LlmParseFailed))
        );
    }
}
