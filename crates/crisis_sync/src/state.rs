use crate::remote::RemoteError;
use crisis_api::SaveStateResponse;
use crisis_domain::{Action, AppState};

/// What a poll may do to local edits that the remote has not confirmed yet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConflictPolicy {
    /// The remote snapshot always replaces local state, unconfirmed edits included.
    LastWriterWins,
    /// The remote snapshot is held back while a local edit is newer than the last
    /// confirmed save.
    #[default]
    KeepUnconfirmedLocal,
}

/// Full document to push after a local edit, tagged with the local revision it carries.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingSave {
    pub rev: u64,
    pub state: AppState,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RemoteOutcome {
    Unchanged,
    Replaced,
    Deferred,
}

/// Client-side container: the local document, its serialized form and revision
/// bookkeeping. Pure; all I/O lives in the engine.
#[derive(Clone, Debug)]
pub struct SyncState {
    state: AppState,
    serialized: String,
    local_rev: u64,
    confirmed_rev: u64,
    policy: ConflictPolicy,
}

impl SyncState {
    pub fn new(state: AppState, policy: ConflictPolicy) -> Self {
        let serialized = state.to_json();
        Self {
            state,
            serialized,
            local_rev: 0,
            confirmed_rev: 0,
            policy,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn has_unconfirmed(&self) -> bool {
        self.local_rev > self.confirmed_rev
    }

    /// Runs the reducer. Returns the document to save when the action changed anything.
    pub fn apply_local(&mut self, action: Action) -> Option<PendingSave> {
        if self.state.apply(action).is_empty() {
            return None;
        }
        Some(self.bump())
    }

    /// Replaces the document outright, as an import does.
    pub fn replace_local(&mut self, state: AppState) -> PendingSave {
        self.state = state;
        self.bump()
    }

    /// The latest local document, if it still awaits confirmation.
    pub fn unconfirmed(&self) -> Option<PendingSave> {
        self.has_unconfirmed().then(|| PendingSave {
            rev: self.local_rev,
            state: self.state.clone(),
        })
    }

    fn bump(&mut self) -> PendingSave {
        self.local_rev += 1;
        self.serialized = self.state.to_json();
        PendingSave {
            rev: self.local_rev,
            state: self.state.clone(),
        }
    }

    /// Records the result of saving revision `rev`.
    ///
    /// On success the revision counts as confirmed and, when no newer edit exists, the
    /// server-stamped version and timestamp are adopted. A retryable failure changes
    /// nothing; a permanent one gives the edit up so the remote can win again.
    pub fn complete_save(&mut self, rev: u64, result: Result<&SaveStateResponse, &RemoteError>) {
        match result {
            Ok(ack) => {
                self.confirmed_rev = self.confirmed_rev.max(rev);
                if rev == self.local_rev {
                    self.state.meta.version = ack.version;
                    self.state.meta.updated_at = ack.updated_at.clone();
                    self.serialized = self.state.to_json();
                }
            }
            Err(err) if err.is_retryable() => {}
            Err(_) => {
                self.confirmed_rev = self.confirmed_rev.max(rev);
            }
        }
    }

    /// Feeds a polled snapshot. Equal serialized forms are a no-op.
    pub fn apply_remote(&mut self, remote: &AppState) -> RemoteOutcome {
        let serialized = remote.to_json();
        if serialized == self.serialized {
            return RemoteOutcome::Unchanged;
        }
        if self.policy == ConflictPolicy::KeepUnconfirmedLocal && self.has_unconfirmed() {
            return RemoteOutcome::Deferred;
        }

        self.state = remote.clone();
        self.serialized = serialized;
        // The remote snapshot supersedes every in-flight local revision.
        self.local_rev += 1;
        self.confirmed_rev = self.local_rev;
        RemoteOutcome::Replaced
    }
}
