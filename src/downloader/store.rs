//! In-memory job table: state machine enforcement, event history and fan-out.
//!
//! Every state change and every event goes through the store's lock, so the
//! order in which events are broadcast for one job is the order they were
//! generated, and nothing is emitted for a job after its terminal event.

use crate::error::AdapterAttempt;
use crate::sources::SnapshotContext;
use crate::types::{JobEvent, JobEventKind, JobId, JobSnapshot, JobState, ReleaseRequest};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Position of a job in its adapter chain, kept across retries
#[derive(Clone, Debug, Default)]
pub(crate) struct ChainCursor {
    /// Index into the job's chain
    pub(crate) index: usize,
    /// Transient failures on the current adapter
    pub(crate) failures_on_adapter: u32,
    /// Adapters already moved past
    pub(crate) tried: Vec<AdapterAttempt>,
    /// Candidate the temporary file's bytes belong to
    pub(crate) resume_key: Option<String>,
}

impl ChainCursor {
    /// Move to the next adapter, recording why the current one was left
    pub(crate) fn advance(&mut self, adapter: &str, reason: impl Into<String>) {
        self.tried.push(AdapterAttempt {
            adapter: adapter.to_string(),
            reason: reason.into(),
        });
        self.index += 1;
        self.failures_on_adapter = 0;
    }
}

pub(crate) struct JobRecord {
    pub(crate) snapshot: JobSnapshot,
    pub(crate) context: SnapshotContext,
    pub(crate) cursor: ChainCursor,
    pub(crate) cancel: CancellationToken,
    events: VecDeque<JobEvent>,
    state_tx: watch::Sender<JobState>,
    finished_at: Option<Instant>,
}

impl JobRecord {
    pub(crate) fn new(
        id: JobId,
        request: ReleaseRequest,
        chain: Vec<String>,
        context: SnapshotContext,
    ) -> Self {
        let now = Utc::now();
        let (state_tx, _) = watch::channel(JobState::Queued);
        Self {
            snapshot: JobSnapshot {
                id,
                request,
                state: JobState::Queued,
                attempt: 0,
                chain,
                current_adapter: None,
                bytes_transferred: 0,
                bytes_total: None,
                last_error: None,
                created_at: now,
                updated_at: now,
                destination: None,
            },
            context,
            cursor: ChainCursor::default(),
            cancel: CancellationToken::new(),
            events: VecDeque::new(),
            state_tx,
            finished_at: None,
        }
    }
}

/// What a worker needs to run a job
pub(crate) struct JobParts {
    pub(crate) request: ReleaseRequest,
    pub(crate) chain: Vec<String>,
    pub(crate) context: SnapshotContext,
    pub(crate) cursor: ChainCursor,
    pub(crate) cancel: CancellationToken,
}

pub(crate) struct JobStore {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    event_tx: broadcast::Sender<JobEvent>,
    history: usize,
}

impl JobStore {
    pub(crate) fn new(event_tx: broadcast::Sender<JobEvent>, history: usize) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            event_tx,
            history: history.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the event in the job's history and broadcast it
    fn publish(&self, record: &mut JobRecord, kind: JobEventKind) {
        let event = JobEvent {
            job_id: record.snapshot.id,
            at: Utc::now(),
            kind,
        };
        if record.events.len() == self.history {
            record.events.pop_front();
        }
        record.events.push_back(event.clone());
        // No subscribers is fine
        self.event_tx.send(event).ok();
    }

    /// Add a freshly admitted job and emit `queued`
    pub(crate) fn insert(&self, mut record: JobRecord) {
        let mut jobs = self.lock();
        self.publish(&mut record, JobEventKind::Queued);
        jobs.insert(record.snapshot.id, record);
    }

    pub(crate) fn contains(&self, id: JobId) -> bool {
        self.lock().contains_key(&id)
    }

    pub(crate) fn snapshot(&self, id: JobId) -> Option<JobSnapshot> {
        self.lock().get(&id).map(|r| r.snapshot.clone())
    }

    pub(crate) fn state(&self, id: JobId) -> Option<JobState> {
        self.lock().get(&id).map(|r| r.snapshot.state)
    }

    /// All jobs ordered by ID
    pub(crate) fn list(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<_> = self.lock().values().map(|r| r.snapshot.clone()).collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    pub(crate) fn events(&self, id: JobId) -> Option<Vec<JobEvent>> {
        self.lock().get(&id).map(|r| r.events.iter().cloned().collect())
    }

    pub(crate) fn cancel_token(&self, id: JobId) -> Option<CancellationToken> {
        self.lock().get(&id).map(|r| r.cancel.clone())
    }

    pub(crate) fn watch_state(&self, id: JobId) -> Option<watch::Receiver<JobState>> {
        self.lock().get(&id).map(|r| r.state_tx.subscribe())
    }

    /// IDs of jobs that have not reached a terminal state
    pub(crate) fn unfinished(&self) -> Vec<JobId> {
        self.lock()
            .values()
            .filter(|r| !r.snapshot.state.is_terminal())
            .map(|r| r.snapshot.id)
            .collect()
    }

    /// Number of jobs a worker is busy with right now
    pub(crate) fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|r| r.snapshot.state.is_active())
            .count()
    }

    /// Everything a worker needs, if the job can still run
    pub(crate) fn parts(&self, id: JobId) -> Option<JobParts> {
        let jobs = self.lock();
        let record = jobs.get(&id)?;
        if record.snapshot.state.is_terminal() {
            return None;
        }
        Some(JobParts {
            request: record.snapshot.request.clone(),
            chain: record.snapshot.chain.clone(),
            context: record.context.clone(),
            cursor: record.cursor.clone(),
            cancel: record.cancel.clone(),
        })
    }

    pub(crate) fn save_cursor(&self, id: JobId, cursor: ChainCursor) {
        if let Some(record) = self.lock().get_mut(&id) {
            record.cursor = cursor;
        }
    }

    /// Move a job to `next`, emitting `event` if given
    ///
    /// Returns false without emitting when the state machine forbids the move
    /// (most importantly, once the job is terminal). Re-entering the current
    /// state is allowed and only emits the event.
    pub(crate) fn transition(&self, id: JobId, next: JobState, event: Option<JobEventKind>) -> bool {
        let mut jobs = self.lock();
        let Some(record) = jobs.get_mut(&id) else {
            return false;
        };
        let current = record.snapshot.state;
        if current != next && !current.can_transition_to(next) {
            tracing::debug!(job_id = id.0, from = %current, to = %next, "transition refused");
            return false;
        }
        if current == next && current.is_terminal() {
            return false;
        }

        record.snapshot.state = next;
        record.snapshot.updated_at = Utc::now();
        if next.is_terminal() {
            record.finished_at = Some(Instant::now());
        }
        record.state_tx.send_replace(next);
        if let Some(kind) = event {
            self.publish(record, kind);
        }
        true
    }

    /// Emit an event without changing state; dropped once the job is terminal
    pub(crate) fn emit(&self, id: JobId, kind: JobEventKind) -> bool {
        let mut jobs = self.lock();
        match jobs.get_mut(&id) {
            Some(record) if !record.snapshot.state.is_terminal() => {
                self.publish(record, kind);
                true
            }
            _ => false,
        }
    }

    /// Mutate a job's snapshot in place
    pub(crate) fn update<F>(&self, id: JobId, f: F)
    where
        F: FnOnce(&mut JobSnapshot),
    {
        if let Some(record) = self.lock().get_mut(&id) {
            f(&mut record.snapshot);
            record.snapshot.updated_at = Utc::now();
        }
    }

    /// Drop terminal jobs that finished more than `retention` ago
    pub(crate) fn evict_finished(&self, retention: Duration) -> usize {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, r| r.finished_at.is_none_or(|t| t.elapsed() < retention));
        before - jobs.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
