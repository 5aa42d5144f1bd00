//! Stack coordinator for production layers.
//!
//! Each active layer owns one background tokio task that polls the store
//! for cards bearing the layer's tag, feeds the card queue, and opens an
//! isolated tag-filtered session once the expected count is reached. The
//! stack is strictly LIFO: starting a layer suspends the one beneath it,
//! and popping resumes whatever is on top afterwards.
//!
//! Poll state parks inside the stack entry whenever no task is running.
//! Every task writes its `PollingManager` back before exiting, so a caller
//! that joins the task handle may take the parked state without racing it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cards::{extract_card_ids, CardId, CardStatus, DeckId};
use crate::layers::models::{
    Layer, LayerError, LayerEvent, LayerFinish, LayerPhase, LayerView, Result,
};
use crate::polling::{PollConfig, PollStatus, PollVerdict, PollingManager};
use crate::queue::CardQueue;
use crate::store::{FilteredSessionOptions, StoreClient, StoreError, StudyAction};

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// One stack entry: layer bookkeeping plus its background-task state.
struct LayerEntry {
    layer: Layer,
    phase: LayerPhase,
    cancel: CancellationToken,
    /// Poll state, parked here whenever no task is running.
    poll: Option<PollingManager>,
    /// Last snapshot published by the poll task.
    poll_view: Option<PollStatus>,
    session_scope_id: Option<DeckId>,
    task: Option<JoinHandle<()>>,
}

/// State shared between the coordinator handle and its poll tasks.
struct CoordinatorShared {
    store: Arc<dyn StoreClient>,
    queue: Arc<Mutex<CardQueue>>,
    /// Ids already delivered or pre-existing; never enqueued again.
    seen: Arc<Mutex<HashSet<CardId>>>,
    poll_config: PollConfig,
    /// Deck the producer writes into; filtered sessions are built over it.
    vocab_scope_id: DeckId,
    session_card_limit: u32,
    stack: Mutex<Vec<LayerEntry>>,
    events: mpsc::Sender<LayerEvent>,
}

impl CoordinatorShared {
    fn with_entry<R>(&self, tag: &str, f: impl FnOnce(&mut LayerEntry) -> R) -> Option<R> {
        let mut stack = self.stack.lock().unwrap();
        stack.iter_mut().find(|e| e.layer.tag == tag).map(f)
    }

    fn layer_counts(&self, tag: &str) -> Option<(usize, usize)> {
        self.with_entry(tag, |e| (e.layer.initial_count, e.layer.expected_count))
    }

    fn emit(&self, event: LayerEvent) {
        if let Err(err) = self.events.try_send(event) {
            log::debug!("Layer event dropped: {}", err);
        }
    }

    /// Marks the layer ready with its freshly opened session.
    fn mark_ready(&self, tag: &str, scope: DeckId) {
        self.with_entry(tag, |entry| {
            entry.session_scope_id = Some(scope);
            entry.phase = LayerPhase::Ready;
        });
        self.emit(LayerEvent::Ready {
            tag: tag.to_string(),
            session_scope_id: scope,
        });
    }

    /// Parks the poll state back into the entry and records how the task
    /// ended. Called exactly once, at the end of every poll task.
    fn settle_poll_exit(&self, tag: &str, poll: PollingManager, exit: PollExit) {
        let retries_remaining = poll.retries_remaining();
        let timed_out = matches!(exit, PollExit::TimedOut);
        let settled = self.with_entry(tag, |entry| {
            entry.poll_view = Some(poll.status());
            entry.poll = Some(poll);
            match exit {
                // Phase and event were already set by the readiness tick.
                PollExit::Ready(_) => {}
                PollExit::Suspended => {
                    if entry.phase == LayerPhase::Polling {
                        entry.phase = LayerPhase::Suspended;
                    }
                }
                PollExit::TimedOut => {
                    entry.phase = LayerPhase::TimedOut;
                }
            }
        });

        match settled {
            None => log::debug!("Layer '{}': popped before its poll task settled", tag),
            Some(()) if timed_out => {
                self.emit(LayerEvent::TimedOut {
                    tag: tag.to_string(),
                    retries_remaining,
                });
            }
            Some(()) => {}
        }
    }

    fn update_view(&self, tag: &str, status: PollStatus) {
        self.with_entry(tag, |e| e.poll_view = Some(status));
    }
}

/// How a poll task ended.
enum PollExit {
    Suspended,
    Ready(DeckId),
    TimedOut,
}

/// Body of one layer's background poll task.
async fn run_layer_poll(
    shared: Arc<CoordinatorShared>,
    tag: String,
    cancel: CancellationToken,
    mut poll: PollingManager,
) {
    log::info!("Layer '{}': polling started", tag);
    let exit = poll_until_exit(&shared, &tag, &cancel, &mut poll).await;
    shared.settle_poll_exit(&tag, poll, exit);
}

async fn poll_until_exit(
    shared: &CoordinatorShared,
    tag: &str,
    cancel: &CancellationToken,
    poll: &mut PollingManager,
) -> PollExit {
    loop {
        if cancel.is_cancelled() {
            return PollExit::Suspended;
        }
        match poll.should_continue() {
            PollVerdict::Continue => {}
            PollVerdict::TimedOut => return PollExit::TimedOut,
            PollVerdict::Completed => return PollExit::Suspended,
        }

        match layer_tick(shared, tag, cancel, poll).await {
            Ok(Some(scope)) => return PollExit::Ready(scope),
            Ok(None) => {}
            // Tick errors delay the next tick, never end polling.
            Err(err) if err.is_transient() => {
                log::debug!("Layer '{}': transient tick failure: {}", tag, err)
            }
            Err(err) => log::warn!("Layer '{}': poll tick failed: {}", tag, err),
        }

        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = poll.wait_interval() => false,
        };
        if cancelled {
            return PollExit::Suspended;
        }
    }
}

/// One poll tick: list the tag, enqueue arrivals, open the isolated
/// session once the expected count is reached. Returns the new session
/// scope on readiness.
async fn layer_tick(
    shared: &CoordinatorShared,
    tag: &str,
    cancel: &CancellationToken,
    poll: &mut PollingManager,
) -> std::result::Result<Option<DeckId>, StoreError> {
    let listed = shared
        .store
        .list_cards_by_tag(tag, Some(CardStatus::New))
        .await?;
    let found = extract_card_ids(&listed);
    let found_count = found.len();
    let new_ids = poll.check_for_new(&found);

    if !new_ids.is_empty() {
        let mut queue = shared.queue.lock().unwrap();
        let mut seen = shared.seen.lock().unwrap();
        for summary in listed {
            let Some(card) = summary.into_card() else {
                continue;
            };
            if !new_ids.contains(&card.id) || !seen.insert(card.id) {
                continue;
            }
            let id = card.id;
            if queue.enqueue(card) {
                log::debug!("Layer '{}': enqueued card {}", tag, id);
            }
        }
    }

    shared.update_view(tag, poll.status());

    let Some((initial, expected)) = shared.layer_counts(tag) else {
        return Ok(None);
    };
    if found_count < initial + expected {
        return Ok(None);
    }
    // Suspension raced readiness; leave session creation to the resume.
    if cancel.is_cancelled() {
        return Ok(None);
    }

    let options = FilteredSessionOptions::for_tag(tag, shared.session_card_limit);
    let scope = match shared
        .store
        .open_filtered_session(shared.vocab_scope_id, &options)
        .await
    {
        Ok(scope) => scope,
        Err(StoreError::SessionBusy) => {
            log::debug!("Layer '{}': session busy at readiness, deferring", tag);
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    poll.mark_completed();
    shared.mark_ready(tag, scope);
    log::info!(
        "Layer '{}': ready, {} card(s) found, session scope {}",
        tag,
        found_count,
        scope
    );
    Ok(Some(scope))
}

/// LIFO stack of layers plus the lifecycle operations on its top entry.
pub struct LayerCoordinator {
    shared: Arc<CoordinatorShared>,
}

impl LayerCoordinator {
    pub fn new(
        store: Arc<dyn StoreClient>,
        queue: Arc<Mutex<CardQueue>>,
        seen: Arc<Mutex<HashSet<CardId>>>,
        vocab_scope_id: DeckId,
        poll_config: PollConfig,
        session_card_limit: u32,
    ) -> (Self, mpsc::Receiver<LayerEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(CoordinatorShared {
            store,
            queue,
            seen,
            poll_config,
            vocab_scope_id,
            session_card_limit,
            stack: Mutex::new(Vec::new()),
            events,
        });
        (LayerCoordinator { shared }, receiver)
    }

    /// Pushes a new layer and starts polling for its cards. The previous
    /// top layer, if any, is suspended first. The baseline count is
    /// captured here; the caller must not let the producer loose before
    /// this returns.
    pub async fn start_layer(&self, tag: &str, expected_count: usize) -> Result<()> {
        let parent_tag = {
            let stack = self.shared.stack.lock().unwrap();
            if stack.iter().any(|e| e.layer.tag == tag) {
                return Err(LayerError::DuplicateTag(tag.to_string()));
            }
            stack.last().map(|e| e.layer.tag.clone())
        };

        let listed = self
            .shared
            .store
            .list_cards_by_tag(tag, Some(CardStatus::New))
            .await?;
        let baseline = extract_card_ids(&listed);
        let initial_count = baseline.len();

        self.suspend_active().await;

        let mut poll = PollingManager::new(self.shared.poll_config.clone());
        poll.record_baseline(baseline);
        let cancel = CancellationToken::new();

        log::info!(
            "Layer '{}': started (initial {}, expecting {})",
            tag,
            initial_count,
            expected_count
        );
        self.shared.stack.lock().unwrap().push(LayerEntry {
            layer: Layer {
                tag: tag.to_string(),
                expected_count,
                initial_count,
                processed_count: 0,
                parent_tag,
            },
            phase: LayerPhase::Polling,
            cancel: cancel.clone(),
            poll: None,
            poll_view: None,
            session_scope_id: None,
            task: None,
        });

        let task = tokio::spawn(run_layer_poll(
            Arc::clone(&self.shared),
            tag.to_string(),
            cancel,
            poll,
        ));
        self.shared.with_entry(tag, |e| e.task = Some(task));
        Ok(())
    }

    /// Drives the active layer's isolated session, submitting cached
    /// answers start-flip-rate until the session is exhausted or a card
    /// without an answer comes up. Exhaustion pops the layer and resumes
    /// the one beneath.
    pub async fn finish_active_layer(&self) -> Result<LayerFinish> {
        let (tag, phase, scope) = {
            let stack = self.shared.stack.lock().unwrap();
            let entry = stack.last().ok_or(LayerError::NoActiveLayer)?;
            (entry.layer.tag.clone(), entry.phase, entry.session_scope_id)
        };
        if !matches!(phase, LayerPhase::Ready | LayerPhase::Studying) {
            return Err(LayerError::NotReady);
        }

        // The session scope is dropped on suspension; reopen on demand.
        let scope = match scope {
            Some(scope) => scope,
            None => {
                let options =
                    FilteredSessionOptions::for_tag(tag.as_str(), self.shared.session_card_limit);
                let scope = self
                    .shared
                    .store
                    .open_filtered_session(self.shared.vocab_scope_id, &options)
                    .await?;
                self.shared
                    .with_entry(&tag, |e| e.session_scope_id = Some(scope));
                scope
            }
        };
        self.shared
            .with_entry(&tag, |e| e.phase = LayerPhase::Studying);

        let mut served = self.shared.store.study(scope, StudyAction::Start).await?;
        while let Some(payload) = served {
            // Peek first; the answer is consumed only after the rating
            // lands, so a failed submission keeps it.
            let cached = payload
                .card_id
                .and_then(|id| self.shared.queue.lock().unwrap().cached_answer(id).map(|r| (id, r)));
            let Some((card_id, rating)) = cached else {
                if let Err(err) = self.shared.store.study(scope, StudyAction::Close).await {
                    log::warn!("Layer '{}': failed to close session {}: {}", tag, scope, err);
                }
                let processed = self
                    .shared
                    .with_entry(&tag, |e| {
                        e.phase = LayerPhase::Ready;
                        e.session_scope_id = None;
                        e.layer.processed_count
                    })
                    .unwrap_or(0);
                log::info!(
                    "Layer '{}': awaiting an answer for card {:?}",
                    tag,
                    payload.card_id
                );
                return Ok(LayerFinish::AwaitingAnswer {
                    tag,
                    card_id: payload.card_id,
                    processed_count: processed,
                });
            };

            self.shared.store.study(scope, StudyAction::Flip).await?;
            served = self
                .shared
                .store
                .study(scope, StudyAction::Rate(rating))
                .await?;
            self.shared.queue.lock().unwrap().pop_cached_answer(card_id);
            self.shared.with_entry(&tag, |e| e.layer.processed_count += 1);
        }

        if let Err(err) = self.shared.store.study(scope, StudyAction::Close).await {
            log::warn!("Layer '{}': failed to close session {}: {}", tag, scope, err);
        }
        let processed = {
            let mut stack = self.shared.stack.lock().unwrap();
            match stack.iter().rposition(|e| e.layer.tag == tag) {
                Some(index) => stack.remove(index).layer.processed_count,
                None => 0,
            }
        };
        log::info!("Layer '{}': completed, {} card(s) processed", tag, processed);
        self.shared.emit(LayerEvent::Completed {
            tag: tag.clone(),
            processed_count: processed,
        });
        self.resume_top().await;
        Ok(LayerFinish::Completed {
            tag,
            processed_count: processed,
        })
    }

    /// Manually retries detection after a timeout. Bounded by the poll
    /// config's retry budget; the original baseline is kept.
    pub async fn retry_active_layer(&self) -> Result<()> {
        let (tag, task) = {
            let mut stack = self.shared.stack.lock().unwrap();
            let entry = stack.last_mut().ok_or(LayerError::NoActiveLayer)?;
            // TimedOut guarantees the task already settled; its handle
            // resolves immediately.
            if entry.phase != LayerPhase::TimedOut {
                return Err(LayerError::NotTimedOut);
            }
            (entry.layer.tag.clone(), entry.task.take())
        };
        if let Some(task) = task {
            let _ = task.await;
        }

        let (poll, cancel) = {
            let mut stack = self.shared.stack.lock().unwrap();
            let entry = match stack.last_mut() {
                Some(entry) if entry.layer.tag == tag => entry,
                _ => return Err(LayerError::NoActiveLayer),
            };
            if entry.phase != LayerPhase::TimedOut {
                return Err(LayerError::NotTimedOut);
            }
            let Some(mut poll) = entry.poll.take() else {
                return Err(LayerError::NotTimedOut);
            };
            if !poll.retry() {
                entry.poll = Some(poll);
                return Err(LayerError::RetriesExhausted(tag.clone()));
            }
            let cancel = CancellationToken::new();
            entry.cancel = cancel.clone();
            entry.phase = LayerPhase::Polling;
            (poll, cancel)
        };

        log::info!("Layer '{}': detection retry started", tag);
        let task = tokio::spawn(run_layer_poll(
            Arc::clone(&self.shared),
            tag.clone(),
            cancel,
            poll,
        ));
        self.shared.with_entry(&tag, |e| e.task = Some(task));
        Ok(())
    }

    /// Tears the active layer down without finishing it: polling stops,
    /// its session closes, the layer pops, and the one beneath resumes.
    pub async fn abandon_active_layer(&self) -> Result<()> {
        let (tag, cancel, task) = {
            let mut stack = self.shared.stack.lock().unwrap();
            let entry = stack.last_mut().ok_or(LayerError::NoActiveLayer)?;
            (entry.layer.tag.clone(), entry.cancel.clone(), entry.task.take())
        };
        cancel.cancel();
        if let Some(task) = task {
            let _ = task.await;
        }

        let scope = {
            let mut stack = self.shared.stack.lock().unwrap();
            match stack.iter().rposition(|e| e.layer.tag == tag) {
                Some(index) => stack.remove(index).session_scope_id,
                None => None,
            }
        };
        if let Some(scope) = scope {
            if let Err(err) = self.shared.store.study(scope, StudyAction::Close).await {
                log::warn!("Layer '{}': failed to close session {}: {}", tag, scope, err);
            }
        }
        log::info!("Layer '{}': abandoned", tag);
        self.resume_top().await;
        Ok(())
    }

    /// Best-effort teardown of every layer, newest first.
    pub async fn close_all(&self) {
        loop {
            let entry = self.shared.stack.lock().unwrap().pop();
            let Some(mut entry) = entry else {
                break;
            };
            entry.cancel.cancel();
            if let Some(task) = entry.task.take() {
                let _ = task.await;
            }
            if let Some(scope) = entry.session_scope_id {
                if let Err(err) = self.shared.store.study(scope, StudyAction::Close).await {
                    log::warn!(
                        "Layer '{}': failed to close session {}: {}",
                        entry.layer.tag,
                        scope,
                        err
                    );
                }
            }
            log::info!("Layer '{}': closed", entry.layer.tag);
        }
    }

    /// Suspends the top layer: cancels its poll task, waits for the task
    /// to park its state, and closes the layer's session if one is open.
    async fn suspend_active(&self) {
        let (tag, task, cancel) = {
            let mut stack = self.shared.stack.lock().unwrap();
            let Some(entry) = stack.last_mut() else {
                return;
            };
            (entry.layer.tag.clone(), entry.task.take(), entry.cancel.clone())
        };
        cancel.cancel();
        if let Some(task) = task {
            if let Err(err) = task.await {
                log::warn!("Layer '{}': poll task join failed: {}", tag, err);
            }
        }

        let scope = self
            .shared
            .with_entry(&tag, |entry| {
                if entry.phase != LayerPhase::TimedOut {
                    entry.phase = LayerPhase::Suspended;
                }
                entry.session_scope_id.take()
            })
            .flatten();
        if let Some(scope) = scope {
            if let Err(err) = self.shared.store.study(scope, StudyAction::Close).await {
                log::warn!("Layer '{}': failed to close session {}: {}", tag, scope, err);
            }
        }
        log::info!("Layer '{}': suspended", tag);
    }

    /// Reactivates whatever is now on top after a pop, or reports the
    /// stack empty. A layer suspended mid-poll resumes with a fresh
    /// timeout window; a layer that was already ready gets its session
    /// reopened.
    async fn resume_top(&self) {
        let Some(tag) = self.active_tag() else {
            log::info!("Layer stack: empty, all layers complete");
            self.shared.emit(LayerEvent::AllLayersComplete);
            return;
        };

        // The task parks its poll state before exiting; join for certainty.
        let task = self.shared.with_entry(&tag, |e| e.task.take()).flatten();
        if let Some(task) = task {
            let _ = task.await;
        }

        enum Plan {
            Respawn(PollingManager, CancellationToken),
            Reopen,
            Nothing,
        }

        let plan = {
            let mut stack = self.shared.stack.lock().unwrap();
            match stack.last_mut() {
                Some(entry) if entry.layer.tag == tag => {
                    match (entry.phase, entry.poll.take()) {
                        // Timed out before suspension; keep the state for a
                        // manual retry.
                        (LayerPhase::TimedOut, poll) => {
                            entry.poll = poll;
                            Plan::Nothing
                        }
                        (_, Some(poll)) if poll.is_completed() => {
                            entry.poll = Some(poll);
                            Plan::Reopen
                        }
                        (_, Some(mut poll)) => {
                            poll.restart_window();
                            let cancel = CancellationToken::new();
                            entry.cancel = cancel.clone();
                            entry.phase = LayerPhase::Polling;
                            Plan::Respawn(poll, cancel)
                        }
                        (_, None) => Plan::Nothing,
                    }
                }
                _ => Plan::Nothing,
            }
        };

        match plan {
            Plan::Respawn(poll, cancel) => {
                let task = tokio::spawn(run_layer_poll(
                    Arc::clone(&self.shared),
                    tag.clone(),
                    cancel,
                    poll,
                ));
                self.shared.with_entry(&tag, |e| e.task = Some(task));
                log::info!("Layer '{}': polling resumed", tag);
            }
            Plan::Reopen => {
                let options =
                    FilteredSessionOptions::for_tag(tag.as_str(), self.shared.session_card_limit);
                match self
                    .shared
                    .store
                    .open_filtered_session(self.shared.vocab_scope_id, &options)
                    .await
                {
                    Ok(scope) => {
                        self.shared.with_entry(&tag, |e| {
                            e.session_scope_id = Some(scope);
                            e.phase = LayerPhase::Ready;
                        });
                        log::info!("Layer '{}': session reopened as scope {}", tag, scope);
                    }
                    Err(err) => {
                        // The finish driver reopens on demand.
                        self.shared.with_entry(&tag, |e| e.phase = LayerPhase::Ready);
                        log::debug!("Layer '{}': session reopen deferred: {}", tag, err);
                    }
                }
            }
            Plan::Nothing => {}
        }

        self.shared.emit(LayerEvent::Resumed { tag });
    }

    pub fn active_tag(&self) -> Option<String> {
        self.shared
            .stack
            .lock()
            .unwrap()
            .last()
            .map(|e| e.layer.tag.clone())
    }

    pub fn active_session_scope(&self) -> Option<DeckId> {
        self.shared
            .stack
            .lock()
            .unwrap()
            .last()
            .and_then(|e| e.session_scope_id)
    }

    pub fn depth(&self) -> usize {
        self.shared.stack.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.stack.lock().unwrap().is_empty()
    }

    /// Snapshots of every stack entry, bottom first.
    pub fn views(&self) -> Vec<LayerView> {
        self.shared
            .stack
            .lock()
            .unwrap()
            .iter()
            .map(|entry| LayerView {
                tag: entry.layer.tag.clone(),
                expected_count: entry.layer.expected_count,
                initial_count: entry.layer.initial_count,
                processed_count: entry.layer.processed_count,
                parent_tag: entry.layer.parent_tag.clone(),
                phase: entry.phase,
                session_scope_id: entry.session_scope_id,
                poll: entry.poll_view.clone(),
            })
            .collect()
    }
}
