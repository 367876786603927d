use crate::identity::SessionIdentity;
use crate::queue::{OfflineQueue, ReplayReport, RetryPolicy, replay};
use crate::remote::{RemoteError, RemoteStore};
use crate::state::{ConflictPolicy, PendingSave, RemoteOutcome, SyncState};
use crisis_api::SaveStateResponse;
use crisis_domain::time::now_rfc3339;
use crisis_domain::{
    Action, AppState, PendingOperation, SessionId, StateError, export_json, parse_app_state,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5000);

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub session_id: SessionId,
    pub poll_interval: Duration,
    pub policy: ConflictPolicy,
    pub retry: RetryPolicy,
    /// Rewritten with the new id whenever a reset hands one out.
    pub identity_path: Option<PathBuf>,
}

impl SyncConfig {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            poll_interval: DEFAULT_POLL_INTERVAL,
            policy: ConflictPolicy::default(),
            retry: RetryPolicy::default(),
            identity_path: None,
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Invalid(#[from] StateError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("synchronizer is offline")]
    Offline,
    #[error("synchronizer stopped")]
    Stopped,
}

/// What the synchronizer currently shows, republished after every change.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncSnapshot {
    pub session_id: SessionId,
    pub state: AppState,
    pub online: bool,
    /// A local edit is not confirmed by the remote yet.
    pub unconfirmed: bool,
    /// A save or queue replay is running.
    pub in_flight: bool,
    pub queued: usize,
}

#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncCommand>,
    snapshot: watch::Receiver<SyncSnapshot>,
}

impl SyncHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SyncCommand,
    ) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| SyncError::Stopped)?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    /// Applies `action` locally and schedules a save. Returns whether anything changed.
    pub async fn dispatch(&self, action: Action) -> Result<bool, SyncError> {
        self.request(|reply| SyncCommand::Dispatch { action, reply })
            .await
    }

    /// Replaces the local document with an exported one. Nothing changes when the text
    /// does not hold a complete document.
    pub async fn import(&self, text: impl Into<String>) -> Result<(), SyncError> {
        let text = text.into();
        self.request(|reply| SyncCommand::Import { text, reply })
            .await?
    }

    pub async fn export(&self) -> Result<String, SyncError> {
        self.request(|reply| SyncCommand::Export { reply }).await
    }

    /// Deletes the current session and continues under a new id with a default document.
    pub async fn reset(&self) -> Result<SessionId, SyncError> {
        self.request(|reply| SyncCommand::Reset { reply }).await?
    }

    /// `false` pauses remote traffic and queues edits; `true` replays the queue.
    pub async fn set_online(&self, online: bool) -> Result<(), SyncError> {
        self.tx
            .send(SyncCommand::SetOnline { online })
            .await
            .map_err(|_| SyncError::Stopped)
    }

    pub async fn poll_now(&self) -> Result<RemoteOutcome, SyncError> {
        self.request(|reply| SyncCommand::PollNow { reply }).await?
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot.clone()
    }

    /// Stops polling. Responses still in flight are dropped.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(SyncCommand::Shutdown).await;
    }
}

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

enum SyncCommand {
    Dispatch {
        action: Action,
        reply: oneshot::Sender<bool>,
    },
    Import {
        text: String,
        reply: Reply<()>,
    },
    Export {
        reply: oneshot::Sender<String>,
    },
    Reset {
        reply: Reply<SessionId>,
    },
    SetOnline {
        online: bool,
    },
    PollNow {
        reply: Reply<RemoteOutcome>,
    },
    Shutdown,
}

/// Completions of work spawned by the actor. `epoch` changes on reset so results for
/// the previous session are ignored.
enum TaskEvent {
    Saved {
        epoch: u64,
        rev: u64,
        result: Result<SaveStateResponse, RemoteError>,
    },
    Polled {
        epoch: u64,
        seq: u64,
        writes_seen: u64,
        result: Result<Option<AppState>, RemoteError>,
        reply: Option<Reply<RemoteOutcome>>,
    },
    Replayed(ReplayReport),
}

/// Keeps one session in step with a remote store: local edits are saved in the
/// background, the remote is polled on an interval and writes that fail are queued.
pub struct SyncEngine {
    config: SyncConfig,
    remote: Arc<dyn RemoteStore>,
    queue: Arc<OfflineQueue>,
    sync: SyncState,
    session_id: SessionId,
    epoch: u64,
    online: bool,
    forced_offline: bool,
    saving: bool,
    replaying: bool,
    // Resets wait here until the writes already sent for the old id have landed.
    parked_resets: Vec<Reply<SessionId>>,
    // Polls issued and the newest one applied; older responses arriving late are dropped.
    poll_seq: u64,
    applied_poll_seq: u64,
    polls_in_flight: usize,
    // Local revision carried by the newest queued upsert.
    queued_rev: Option<u64>,
    // Confirmed writes so far; a poll that overlapped one may carry an older snapshot.
    writes: u64,
    retry_at: Option<Instant>,
    tasks: mpsc::UnboundedSender<TaskEvent>,
    snapshot: watch::Sender<SyncSnapshot>,
}

impl SyncEngine {
    /// Loads the session and spawns the actor. A queued local document from an earlier
    /// run takes precedence over the remote copy.
    pub async fn start(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        queue: Arc<OfflineQueue>,
    ) -> SyncHandle {
        let session_id = config.session_id.clone();
        let mut sync = SyncState::new(AppState::default_session(&now_rfc3339()), config.policy);
        let mut queued_rev = None;
        let mut online = true;

        if let Some(op) = queue.latest_upsert(&session_id)
            && let Some(state) = op.data
        {
            tracing::info!(session_id = %session_id, queued = queue.len(), "resuming from queued local state");
            queued_rev = Some(sync.replace_local(state).rev);
        } else {
            match remote.fetch(&session_id).await {
                Ok(Some(state)) => sync = SyncState::new(state, config.policy),
                Ok(None) => {
                    tracing::debug!(session_id = %session_id, "no remote state, using default");
                }
                Err(err) => {
                    tracing::warn!(session_id = %session_id, error = %err, "failed to load remote state, using default");
                    online = !err.is_retryable();
                }
            }
        }

        let (tx, commands) = mpsc::channel(64);
        let (tasks, task_rx) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(SyncSnapshot {
            session_id: session_id.clone(),
            state: sync.state().clone(),
            online,
            unconfirmed: sync.has_unconfirmed(),
            in_flight: false,
            queued: queue.len(),
        });

        let engine = Self {
            config,
            remote,
            queue,
            sync,
            session_id,
            epoch: 0,
            online,
            forced_offline: false,
            saving: false,
            replaying: false,
            parked_resets: Vec::new(),
            poll_seq: 0,
            applied_poll_seq: 0,
            polls_in_flight: 0,
            queued_rev,
            writes: 0,
            retry_at: None,
            tasks,
            snapshot,
        };
        tokio::spawn(engine.run(commands, task_rx));

        SyncHandle {
            tx,
            snapshot: snapshot_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SyncCommand>,
        mut tasks: mpsc::UnboundedReceiver<TaskEvent>,
    ) {
        let period = self.config.poll_interval;
        let mut poll = tokio::time::interval_at(Instant::now() + period, period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if self.online {
            self.start_replay();
            self.publish();
        }

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(SyncCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle(cmd).await,
                },
                Some(event) = tasks.recv() => self.on_task(event),
                _ = poll.tick() => {
                    if !self.forced_offline && self.polls_in_flight == 0 {
                        self.start_poll(None);
                    }
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.start_replay();
                }
            }
            if !self.parked_resets.is_empty() && !self.saving && !self.replaying {
                for reply in std::mem::take(&mut self.parked_resets) {
                    let result = self.reset().await;
                    let _ = reply.send(result);
                }
                self.flush_unconfirmed();
            }
            self.publish();
        }
        tracing::info!(session_id = %self.session_id, "synchronizer stopped");
    }

    async fn handle(&mut self, cmd: SyncCommand) {
        match cmd {
            SyncCommand::Dispatch { action, reply } => {
                let changed = match self.sync.apply_local(action) {
                    Some(pending) => {
                        self.push(pending);
                        true
                    }
                    None => false,
                };
                let _ = reply.send(changed);
            }
            SyncCommand::Import { text, reply } => {
                let result = match parse_app_state(&text) {
                    Ok(state) => {
                        let pending = self.sync.replace_local(state);
                        tracing::info!(session_id = %self.session_id, "imported session document");
                        self.push(pending);
                        Ok(())
                    }
                    Err(err) => {
                        tracing::warn!(session_id = %self.session_id, error = %err, "rejected import");
                        Err(SyncError::Invalid(err))
                    }
                };
                let _ = reply.send(result);
            }
            SyncCommand::Export { reply } => {
                let _ = reply.send(export_json(self.sync.state()));
            }
            SyncCommand::Reset { reply } => {
                if self.saving || self.replaying {
                    tracing::debug!(session_id = %self.session_id, "reset waits for writes in flight");
                }
                self.parked_resets.push(reply);
            }
            SyncCommand::SetOnline { online } => {
                self.forced_offline = !online;
                if online {
                    tracing::info!(session_id = %self.session_id, "going online");
                    self.online = true;
                    self.start_replay();
                    self.start_poll(None);
                    self.flush_unconfirmed();
                } else {
                    tracing::info!(session_id = %self.session_id, "going offline");
                    self.online = false;
                }
            }
            SyncCommand::PollNow { reply } => {
                if self.forced_offline {
                    let _ = reply.send(Err(SyncError::Offline));
                } else {
                    self.start_poll(Some(reply));
                }
            }
            SyncCommand::Shutdown => {}
        }
    }

    fn on_task(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Saved { epoch, rev, result } => {
                if epoch != self.epoch {
                    return;
                }
                self.saving = false;
                self.sync.complete_save(rev, result.as_ref());
                match &result {
                    Ok(ack) => {
                        self.writes += 1;
                        self.online = true;
                        tracing::debug!(session_id = %self.session_id, version = ack.version, rev, "state saved");
                    }
                    Err(err) if err.is_retryable() => {
                        tracing::warn!(session_id = %self.session_id, error = %err, "save failed, queueing for retry");
                        self.online = false;
                        if let Some(pending) = self.sync.unconfirmed() {
                            self.enqueue(pending);
                        }
                        self.schedule_retry(1);
                    }
                    Err(err) => {
                        tracing::warn!(session_id = %self.session_id, error = %err, "remote rejected save");
                    }
                }
                self.flush_unconfirmed();
            }
            TaskEvent::Polled {
                epoch,
                seq,
                writes_seen,
                result,
                reply,
            } => {
                self.polls_in_flight = self.polls_in_flight.saturating_sub(1);
                let outcome = if epoch != self.epoch {
                    Ok(RemoteOutcome::Unchanged)
                } else if seq < self.applied_poll_seq {
                    tracing::debug!(session_id = %self.session_id, seq, "discarding poll overtaken by a newer one");
                    Ok(RemoteOutcome::Deferred)
                } else {
                    self.applied_poll_seq = seq;
                    self.on_polled(writes_seen, result)
                };
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            TaskEvent::Replayed(report) => self.on_replayed(report),
        }
    }

    fn on_polled(
        &mut self,
        writes_seen: u64,
        result: Result<Option<AppState>, RemoteError>,
    ) -> Result<RemoteOutcome, SyncError> {
        let remote = match result {
            Ok(remote) => remote,
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, error = %err, "poll failed");
                if err.is_retryable() {
                    self.online = false;
                }
                return Err(err.into());
            }
        };

        let stale = self.config.policy == ConflictPolicy::KeepUnconfirmedLocal
            && writes_seen != self.writes;
        let outcome = match remote {
            Some(_) if stale => {
                tracing::debug!(session_id = %self.session_id, "discarding poll that overlapped a write");
                RemoteOutcome::Deferred
            }
            Some(remote) => self.sync.apply_remote(&remote),
            None => RemoteOutcome::Unchanged,
        };
        match outcome {
            RemoteOutcome::Replaced => {
                tracing::info!(session_id = %self.session_id, version = self.sync.state().meta.version, "adopted remote state");
            }
            RemoteOutcome::Deferred => {
                tracing::debug!(session_id = %self.session_id, "kept unconfirmed local edits over remote state");
            }
            RemoteOutcome::Unchanged => {}
        }

        if !self.online {
            tracing::info!(session_id = %self.session_id, "remote reachable again");
        }
        self.online = true;
        self.start_replay();
        self.flush_unconfirmed();
        Ok(outcome)
    }

    fn on_replayed(&mut self, report: ReplayReport) {
        self.replaying = false;
        if let Some((err, attempts)) = &report.error {
            tracing::warn!(session_id = %self.session_id, error = %err, attempts, queued = self.queue.len(), "queue replay failed");
            self.online = false;
            self.schedule_retry(*attempts);
            return;
        }

        tracing::info!(
            session_id = %self.session_id,
            applied = report.applied,
            dropped = report.dropped,
            "queue replayed"
        );
        self.online = true;
        if report.applied > 0 {
            self.writes += 1;
        }
        if !self.queue.is_empty() {
            self.start_replay();
            return;
        }
        if let Some(rev) = self.queued_rev.take()
            && let Some(ack) = report
                .last_ack
                .filter(|ack| ack.session_id == self.session_id)
        {
            self.sync.complete_save(rev, Ok(&ack));
        }
        self.flush_unconfirmed();
    }

    /// Sends a local edit on its way: straight to the remote when it is reachable and
    /// nothing is queued ahead of it, otherwise into the queue to keep order.
    fn push(&mut self, pending: PendingSave) {
        // The pending reset discards this document.
        if !self.parked_resets.is_empty() {
            return;
        }
        if self.forced_offline || !self.online || !self.queue.is_empty() {
            self.enqueue(pending);
            if !self.forced_offline && self.online {
                self.start_replay();
            }
            return;
        }
        // One save at a time; the newest document goes out when the current one lands.
        if !self.saving {
            self.start_save(pending);
        }
    }

    fn enqueue(&mut self, pending: PendingSave) {
        let op = PendingOperation::upsert(self.session_id.clone(), pending.state);
        match self.queue.enqueue(op) {
            Ok(()) => self.queued_rev = Some(pending.rev),
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, error = %err, "failed to queue offline edit");
            }
        }
    }

    fn flush_unconfirmed(&mut self) {
        if !self.online
            || self.forced_offline
            || !self.parked_resets.is_empty()
            || self.saving
            || self.replaying
            || self.queued_rev.is_some()
            || !self.queue.is_empty()
        {
            return;
        }
        if let Some(pending) = self.sync.unconfirmed() {
            self.start_save(pending);
        }
    }

    fn start_save(&mut self, pending: PendingSave) {
        self.saving = true;
        let remote = self.remote.clone();
        let tasks = self.tasks.clone();
        let session_id = self.session_id.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = remote.save(&session_id, &pending.state, None).await;
            let _ = tasks.send(TaskEvent::Saved {
                epoch,
                rev: pending.rev,
                result,
            });
        });
    }

    fn start_poll(&mut self, reply: Option<Reply<RemoteOutcome>>) {
        let remote = self.remote.clone();
        let tasks = self.tasks.clone();
        let session_id = self.session_id.clone();
        let epoch = self.epoch;
        let writes_seen = self.writes;
        self.poll_seq += 1;
        self.polls_in_flight += 1;
        let seq = self.poll_seq;
        tokio::spawn(async move {
            let result = remote.fetch(&session_id).await;
            let _ = tasks.send(TaskEvent::Polled {
                epoch,
                seq,
                writes_seen,
                result,
                reply,
            });
        });
    }

    fn start_replay(&mut self) {
        if self.replaying
            || self.forced_offline
            || !self.parked_resets.is_empty()
            || self.queue.is_empty()
        {
            return;
        }
        self.replaying = true;
        self.retry_at = None;
        let remote = self.remote.clone();
        let queue = self.queue.clone();
        let tasks = self.tasks.clone();
        let policy = self.config.retry;
        tokio::spawn(async move {
            let report = replay(&queue, remote.as_ref(), &policy).await;
            let _ = tasks.send(TaskEvent::Replayed(report));
        });
    }

    fn schedule_retry(&mut self, failed_attempts: u32) {
        let at = Instant::now() + self.config.retry.delay(failed_attempts);
        self.retry_at = Some(self.retry_at.map_or(at, |current| current.min(at)));
    }

    /// Runs only once no save or replay is in flight, so nothing recreates the old record.
    async fn reset(&mut self) -> Result<SessionId, SyncError> {
        let old = self.session_id.clone();
        let remote_id = if self.forced_offline {
            None
        } else {
            match self.remote.reset(&old).await {
                Ok(id) => Some(id),
                Err(err) if err.is_retryable() => {
                    tracing::warn!(session_id = %old, error = %err, "remote reset failed, deleting later");
                    self.online = false;
                    None
                }
                Err(err) => return Err(err.into()),
            }
        };

        if let Err(err) = self.queue.purge_session(&old) {
            tracing::warn!(session_id = %old, error = %err, "failed to purge queued writes");
        }
        let next = match remote_id {
            Some(id) => {
                if let Some(path) = &self.config.identity_path
                    && let Err(err) = SessionIdentity::store(path, &id)
                {
                    tracing::warn!(path = %path.display(), error = %err, "failed to persist session id");
                }
                id
            }
            None => {
                if let Err(err) = self.queue.enqueue(PendingOperation::delete(old.clone())) {
                    tracing::warn!(session_id = %old, error = %err, "failed to queue session delete");
                }
                self.schedule_retry(1);
                self.rotate_identity()
            }
        };

        tracing::info!(old = %old, new = %next, "session reset");
        self.session_id = next.clone();
        self.epoch += 1;
        self.sync = SyncState::new(AppState::default_session(&now_rfc3339()), self.config.policy);
        self.saving = false;
        self.queued_rev = None;
        Ok(next)
    }

    fn rotate_identity(&self) -> SessionId {
        let Some(path) = &self.config.identity_path else {
            return SessionId::generate();
        };
        SessionIdentity::rotate(path).unwrap_or_else(|err| {
            tracing::warn!(path = %path.display(), error = %err, "failed to persist session id");
            SessionId::generate()
        })
    }

    /// Wakes subscribers only when something they can see changed.
    fn publish(&self) {
        let next = SyncSnapshot {
            session_id: self.session_id.clone(),
            state: self.sync.state().clone(),
            online: self.online,
            unconfirmed: self.sync.has_unconfirmed(),
            in_flight: self.saving || self.replaying,
            queued: self.queue.len(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Switchable;
    use crisis_domain::MetaPatch;

    async fn wait_until(handle: &SyncHandle, what: impl Fn(&SyncSnapshot) -> bool) -> SyncSnapshot {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| what(s)))
            .await
            .expect("timed out waiting for synchronizer")
            .expect("synchronizer stopped")
            .clone()
    }

    fn settled(s: &SyncSnapshot) -> bool {
        !s.unconfirmed && !s.in_flight && s.queued == 0
    }

    fn retitle(title: &str) -> Action {
        Action::UpdateMeta(MetaPatch {
            title: Some(title.to_owned()),
            ..Default::default()
        })
    }

    fn config(session: &str) -> SyncConfig {
        SyncConfig {
            poll_interval: Duration::from_millis(50),
            retry: RetryPolicy {
                initial: Duration::from_millis(20),
                max: Duration::from_millis(100),
                multiplier: 2,
                max_attempts: 50,
            },
            ..SyncConfig::new(SessionId::parse(session).unwrap())
        }
    }

    async fn start(
        remote: &Arc<Switchable>,
        config: SyncConfig,
    ) -> (SyncHandle, Arc<OfflineQueue>) {
        let queue = Arc::new(OfflineQueue::in_memory());
        let handle = SyncEngine::start(config, remote.clone(), queue.clone()).await;
        (handle, queue)
    }

    #[tokio::test]
    async fn edits_are_saved_and_stamped() {
        let remote = Arc::new(Switchable::new());
        let (sync, _) = start(&remote, config("s-save")).await;

        assert!(sync.dispatch(retitle("Flood")).await.unwrap());
        assert!(!sync.dispatch(retitle("Flood")).await.unwrap());

        let snapshot = wait_until(&sync, settled).await;
        assert_eq!(snapshot.state.meta.title, "Flood");
        assert_eq!(snapshot.state.meta.version, 1);

        let stored = remote
            .fetch(&SessionId::parse("s-save").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.meta.title, "Flood");
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn offline_edits_replay_in_order() {
        let remote = Arc::new(Switchable::new());
        let (sync, queue) = start(&remote, config("s-offline")).await;

        sync.set_online(false).await.unwrap();
        for title in ["a", "b", "c"] {
            sync.dispatch(retitle(title)).await.unwrap();
        }
        let snapshot = wait_until(&sync, |s| s.queued == 3).await;
        assert!(snapshot.unconfirmed);
        assert!(!snapshot.online);
        assert!(remote.saved_titles().is_empty());

        sync.set_online(true).await.unwrap();
        let snapshot = wait_until(&sync, settled).await;
        assert!(queue.is_empty());
        assert_eq!(remote.saved_titles(), vec!["a", "b", "c"]);
        assert_eq!(snapshot.state.meta.title, "c");
        assert_eq!(snapshot.state.meta.version, 3);
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn failed_save_is_queued_and_retried() {
        let remote = Arc::new(Switchable::new());
        let (sync, _) = start(&remote, config("s-retry")).await;

        remote.set_up(false);
        sync.dispatch(retitle("During outage")).await.unwrap();
        let snapshot = wait_until(&sync, |s| !s.online && s.queued == 1).await;
        assert!(snapshot.unconfirmed);

        remote.set_up(true);
        let snapshot = wait_until(&sync, |s| settled(s) && s.online).await;
        assert_eq!(snapshot.state.meta.version, 1);
        let stored = remote
            .fetch(&SessionId::parse("s-retry").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.meta.title, "During outage");
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn poll_adopts_changes_from_other_clients() {
        let remote = Arc::new(Switchable::new());
        let id = SessionId::parse("s-poll").unwrap();
        let (sync, _) = start(&remote, config("s-poll")).await;

        let mut theirs = AppState::default_session("2024-01-01T00:00:00Z");
        theirs.meta.title = "Written elsewhere".to_owned();
        remote.inner.save(&id, &theirs, None).await.unwrap();

        let snapshot = wait_until(&sync, |s| s.state.meta.title == "Written elsewhere").await;
        assert_eq!(snapshot.state.meta.version, 1);
        assert_eq!(sync.poll_now().await.unwrap(), RemoteOutcome::Unchanged);
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn unconfirmed_edit_survives_a_poll() {
        let remote = Arc::new(Switchable::new());
        let id = SessionId::parse("s-keep").unwrap();
        let mut cfg = config("s-keep");
        cfg.poll_interval = Duration::from_secs(60);
        cfg.retry.initial = Duration::from_secs(60);
        cfg.retry.max = Duration::from_secs(60);
        let (sync, _) = start(&remote, cfg).await;

        remote.set_up(false);
        sync.dispatch(retitle("Mine")).await.unwrap();
        wait_until(&sync, |s| s.queued == 1 && !s.in_flight).await;

        remote.set_up(true);
        let mut theirs = AppState::default_session("2024-01-01T00:00:00Z");
        theirs.meta.title = "Theirs".to_owned();
        remote.inner.save(&id, &theirs, None).await.unwrap();

        assert_eq!(sync.poll_now().await.unwrap(), RemoteOutcome::Deferred);
        assert_eq!(sync.snapshot().state.meta.title, "Mine");

        // The successful poll brings the synchronizer back online and pushes the edit.
        let snapshot = wait_until(&sync, settled).await;
        assert_eq!(snapshot.state.meta.title, "Mine");
        let stored = remote.fetch(&id).await.unwrap().unwrap();
        assert_eq!(stored.meta.title, "Mine");
        assert_eq!(stored.meta.version, 2);
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn reset_starts_a_fresh_session() {
        let dir = tempfile::tempdir().unwrap();
        let identity = crisis_domain::paths::session_identity_path(dir.path());
        let remote = Arc::new(Switchable::new());
        let old = SessionId::parse("s-old").unwrap();
        let mut cfg = config("s-old");
        cfg.identity_path = Some(identity.clone());
        let (sync, _) = start(&remote, cfg).await;

        sync.dispatch(retitle("Before reset")).await.unwrap();
        wait_until(&sync, settled).await;

        let first = sync.reset().await.unwrap();
        let second = sync.reset().await.unwrap();
        assert_ne!(first, old);
        assert_ne!(second, first);

        let snapshot = sync.snapshot();
        assert_eq!(snapshot.session_id, second);
        assert_eq!(snapshot.state.meta.title, AppState::DEFAULT_TITLE);
        assert_eq!(remote.fetch(&old).await.unwrap(), None);
        assert_eq!(std::fs::read_to_string(&identity).unwrap(), second.as_str());
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn reset_waits_for_the_save_in_flight() {
        let remote = Arc::new(Switchable::new());
        let old = SessionId::parse("s-slow-reset").unwrap();
        let mut cfg = config("s-slow-reset");
        cfg.poll_interval = Duration::from_secs(60);
        let (sync, _) = start(&remote, cfg).await;

        remote.set_save_delay(Duration::from_millis(300));
        sync.dispatch(retitle("edit")).await.unwrap();
        let next = sync.reset().await.unwrap();
        assert_ne!(next, old);
        assert_eq!(remote.saved_titles(), vec!["edit"]);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(remote.inner.fetch(&old).await.unwrap(), None);
        assert_eq!(remote.inner.fetch(&next).await.unwrap(), None);
        assert_eq!(sync.snapshot().state.meta.title, AppState::DEFAULT_TITLE);
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn offline_reset_rotates_identity_and_queues_delete() {
        let dir = tempfile::tempdir().unwrap();
        let identity = crisis_domain::paths::session_identity_path(dir.path());
        let remote = Arc::new(Switchable::new());
        let old = SessionId::parse("s-offline-reset").unwrap();
        let mut cfg = config("s-offline-reset");
        cfg.identity_path = Some(identity.clone());
        let (sync, queue) = start(&remote, cfg).await;

        sync.set_online(false).await.unwrap();
        let next = sync.reset().await.unwrap();
        assert_ne!(next, old);
        assert_eq!(std::fs::read_to_string(&identity).unwrap(), next.as_str());

        let ops = queue.snapshot();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation, crisis_domain::OperationKind::Delete);
        assert_eq!(ops[0].session_id, old);
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn late_poll_does_not_roll_back_newer_state() {
        let remote = Arc::new(Switchable::new());
        let id = SessionId::parse("s-late").unwrap();
        let mut first = AppState::default_session("2024-01-01T00:00:00Z");
        first.meta.title = "First".to_owned();
        remote.inner.save(&id, &first, None).await.unwrap();

        let mut cfg = config("s-late");
        cfg.poll_interval = Duration::from_secs(60);
        let (sync, _) = start(&remote, cfg).await;
        assert_eq!(sync.snapshot().state.meta.title, "First");

        remote.set_fetch_delay(Duration::from_millis(300));
        let slow = tokio::spawn({
            let sync = sync.clone();
            async move { sync.poll_now().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        remote.set_fetch_delay(Duration::ZERO);
        let mut second = first.clone();
        second.meta.title = "Second".to_owned();
        remote.inner.save(&id, &second, None).await.unwrap();
        assert_eq!(sync.poll_now().await.unwrap(), RemoteOutcome::Replaced);

        assert_eq!(slow.await.unwrap().unwrap(), RemoteOutcome::Deferred);
        assert_eq!(sync.snapshot().state.meta.title, "Second");
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn idle_polls_do_not_wake_subscribers() {
        let remote = Arc::new(Switchable::new());
        let (sync, _) = start(&remote, config("s-idle")).await;
        sync.dispatch(retitle("Steady")).await.unwrap();
        wait_until(&sync, settled).await;

        let mut rx = sync.subscribe();
        rx.borrow_and_update();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!rx.has_changed().unwrap());
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn import_validates_before_replacing() {
        let remote = Arc::new(Switchable::new());
        let (sync, _) = start(&remote, config("s-import")).await;
        sync.dispatch(retitle("Current")).await.unwrap();
        wait_until(&sync, settled).await;

        let err = sync
            .import(r#"{"meta":{"title":"partial"}}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Invalid(_)), "unexpected: {err}");
        assert_eq!(sync.snapshot().state.meta.title, "Current");

        let mut exported = AppState::default_session("2024-02-02T02:02:02Z");
        exported.meta.title = "From file".to_owned();
        sync.import(export_json(&exported)).await.unwrap();
        let snapshot = wait_until(&sync, settled).await;
        assert_eq!(snapshot.state.meta.title, "From file");
        assert_eq!(
            parse_app_state(&sync.export().await.unwrap())
                .unwrap()
                .meta
                .title,
            "From file"
        );
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn resumes_from_queue_left_by_previous_run() {
        let remote = Arc::new(Switchable::new());
        let id = SessionId::parse("s-resume").unwrap();
        let queue = Arc::new(OfflineQueue::in_memory());
        let mut queued = AppState::default_session("2024-01-01T00:00:00Z");
        queued.meta.title = "Left offline".to_owned();
        queue
            .enqueue(PendingOperation::upsert(id.clone(), queued))
            .unwrap();

        let sync = SyncEngine::start(config("s-resume"), remote.clone(), queue.clone()).await;
        let snapshot = wait_until(&sync, settled).await;
        assert_eq!(snapshot.state.meta.title, "Left offline");
        assert_eq!(snapshot.state.meta.version, 1);
        assert!(queue.is_empty());
        let stored = remote.fetch(&id).await.unwrap().unwrap();
        assert_eq!(stored.meta.title, "Left offline");
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_the_actor() {
        let remote = Arc::new(Switchable::new());
        let (sync, _) = start(&remote, config("s-stop")).await;
        sync.shutdown().await;
        let mut rx = sync.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while rx.changed().await.is_ok() {}
        })
        .await
        .expect("actor did not stop");
        assert!(matches!(
            sync.dispatch(retitle("late")).await,
            Err(SyncError::Stopped)
        ));
    }
}
