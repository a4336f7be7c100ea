//! Session task group: pending queries, active pipelines and dispatch

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::Outbox;
use crate::agent::{ChatMessage, Conversation};
use crate::pipeline::{
    Admission, GenerationOutcome, GenerationPipeline, GenerationRequest, GenerationState, Permit,
    PipelineConfig, Services, TaskHandle,
};
use crate::protocol::SessionSettings;

/// A recognized utterance waiting for an admission permit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingQuery {
    pub turn_id: u64,
    pub text: String,
}

#[derive(Debug)]
struct State {
    pending: VecDeque<PendingQuery>,
    active: BTreeMap<u64, TaskHandle>,
    timers: HashMap<u64, Instant>,
    conversation: Conversation,
    settings: SessionSettings,
}

/// Mutable session state shared by the reader loop, the dispatcher and the
/// pipelines. One mutex guards all of it; it is never held across an await.
#[derive(Debug)]
pub struct SessionShared {
    state: Mutex<State>,
    wake: Notify,
    max_pending: usize,
}

impl SessionShared {
    #[must_use]
    pub fn new(settings: SessionSettings, max_pending: usize, history_turns: usize) -> Self {
        Self {
            state: Mutex::new(State {
                pending: VecDeque::new(),
                active: BTreeMap::new(),
                timers: HashMap::new(),
                conversation: Conversation::new(history_turns),
                settings,
            }),
            wake: Notify::new(),
            max_pending: max_pending.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a query for dispatch, returning the query evicted to make room
    pub fn enqueue(&self, query: PendingQuery) -> Option<PendingQuery> {
        let evicted = {
            let mut state = self.lock();
            let evicted = if state.pending.len() >= self.max_pending {
                state.pending.pop_front()
            } else {
                None
            };
            if let Some(old) = &evicted {
                state.timers.remove(&old.turn_id);
            }
            state.pending.push_back(query);
            evicted
        };
        self.wake.notify_one();
        evicted
    }

    #[must_use]
    pub fn pop_pending(&self) -> Option<PendingQuery> {
        self.lock().pending.pop_front()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Snapshot the active set, then add `handle` to it
    pub fn register(&self, handle: TaskHandle) -> Vec<TaskHandle> {
        let mut state = self.lock();
        let older = state.active.values().cloned().collect();
        state.active.insert(handle.turn_id(), handle);
        older
    }

    pub fn deregister(&self, turn_id: u64) {
        self.lock().active.remove(&turn_id);
    }

    #[must_use]
    pub fn active(&self) -> Vec<TaskHandle> {
        self.lock().active.values().cloned().collect()
    }

    pub fn start_timer(&self, turn_id: u64, started: Instant) {
        self.lock().timers.insert(turn_id, started);
    }

    #[must_use]
    pub fn turn_started(&self, turn_id: u64) -> Option<Instant> {
        self.lock().timers.get(&turn_id).copied()
    }

    pub fn clear_timer(&self, turn_id: u64) {
        self.lock().timers.remove(&turn_id);
    }

    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.lock().timers.len()
    }

    #[must_use]
    pub fn settings(&self) -> SessionSettings {
        self.lock().settings
    }

    pub fn update_settings(&self, apply: impl FnOnce(&mut SessionSettings)) -> SessionSettings {
        let mut state = self.lock();
        apply(&mut state.settings);
        state.settings
    }

    #[must_use]
    pub fn history(&self) -> Vec<ChatMessage> {
        self.lock().conversation.messages()
    }

    pub fn record_exchange(&self, user: &str, assistant: &str) {
        self.lock().conversation.push_exchange(user, assistant);
    }

    async fn woken(&self) {
        self.wake.notified().await;
    }
}

/// Completion hook of one pipeline task
///
/// Dropping it (normal return, cancellation, abort or panic) releases the
/// admission permit, leaves the active set, clears the turn timer and
/// signals waiters, in that order and exactly once.
struct TaskGuard {
    shared: Arc<SessionShared>,
    turn_id: u64,
    permit: Option<Permit>,
    done: watch::Sender<bool>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.shared.deregister(self.turn_id);
        self.shared.clear_timer(self.turn_id);
        self.done.send_replace(true);
    }
}

/// Pops pending queries and runs them under admission control
pub struct Dispatcher {
    pub(super) shared: Arc<SessionShared>,
    pub(super) admission: Admission,
    pub(super) services: Services,
    pub(super) pipeline: PipelineConfig,
    pub(super) outbox: Outbox,
    pub(super) cancel: CancellationToken,
    pub(super) shutdown_grace: Duration,
}

impl Dispatcher {
    /// Dispatch until the session is cancelled, then cancel and join every
    /// pipeline it started
    pub async fn run(self) {
        let mut tasks: JoinSet<GenerationOutcome> = JoinSet::new();

        loop {
            let Some(query) = self.next_query(&mut tasks).await else {
                break;
            };

            let permit = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                permit = self.admission.acquire() => permit,
            };
            let Some(permit) = permit else {
                break;
            };

            self.start(query, permit, &mut tasks);
        }

        self.shutdown(tasks).await;
    }

    /// Wait for a pending query, reaping finished pipelines meanwhile
    async fn next_query(&self, tasks: &mut JoinSet<GenerationOutcome>) -> Option<PendingQuery> {
        loop {
            if let Some(query) = self.shared.pop_pending() {
                return Some(query);
            }
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_joined(joined);
                }
                () = self.shared.woken() => {}
            }
        }
    }

    fn start(&self, query: PendingQuery, permit: Permit, tasks: &mut JoinSet<GenerationOutcome>) {
        let PendingQuery { turn_id, text } = query;
        let task_cancel = self.cancel.child_token();
        let (done_tx, done_rx) = watch::channel(false);

        let older = self
            .shared
            .register(TaskHandle::new(turn_id, task_cancel.clone(), done_rx));
        let guard = TaskGuard {
            shared: Arc::clone(&self.shared),
            turn_id,
            permit: Some(permit),
            done: done_tx,
        };

        let request = GenerationRequest {
            turn_id,
            text: text.clone(),
            history: self.shared.history(),
            settings: self.shared.settings(),
            older,
            turn_started: self.shared.turn_started(turn_id).unwrap_or_else(Instant::now),
        };
        tracing::debug!(
            turn_id,
            in_flight = self.admission.stats().in_flight,
            pending = self.shared.pending_len(),
            "dispatching query"
        );

        let pipeline = GenerationPipeline::new(
            self.services.clone(),
            self.pipeline,
            self.outbox.clone(),
            task_cancel,
            request,
        );
        let shared = Arc::clone(&self.shared);

        tasks.spawn(async move {
            let _guard = guard;
            let outcome = pipeline.run().await;
            if outcome.state == GenerationState::Done {
                shared.record_exchange(&text, &outcome.reply);
            }
            outcome
        });
    }

    async fn shutdown(&self, mut tasks: JoinSet<GenerationOutcome>) {
        self.cancel.cancel();
        if tasks.is_empty() {
            return;
        }

        let running = tasks.len();
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_joined(joined);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                "pipelines did not unwind in time, aborting"
            );
            tasks.shutdown().await;
        }
        tracing::debug!(running, "session pipelines joined");
    }
}

fn log_joined(joined: Result<GenerationOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => {
            tracing::trace!(state = %outcome.state, "pipeline joined");
        }
        Err(e) if e.is_cancelled() => {}
        Err(e) => {
            tracing::error!(error = %e, "pipeline task panicked");
        }
    }
}
