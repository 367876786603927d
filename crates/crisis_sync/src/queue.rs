use crate::remote::{RemoteError, RemoteStore};
use anyhow::Context as _;
use crisis_api::SaveStateResponse;
use crisis_domain::{OperationKind, PendingOperation, SessionId};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// Writes that could not reach the remote, persisted as a JSON array in FIFO order.
pub struct OfflineQueue {
    path: Option<PathBuf>,
    entries: Mutex<VecDeque<PendingOperation>>,
}

impl OfflineQueue {
    /// Opens the queue file, starting empty when it does not exist yet.
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<VecDeque<PendingOperation>>(&text) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "offline queue is corrupt, starting empty");
                    VecDeque::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    /// A queue that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut VecDeque<PendingOperation>) -> (T, bool),
    ) -> anyhow::Result<T> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (out, dirty) = f(&mut entries);
        if dirty && let Some(path) = &self.path {
            let bytes = serde_json::to_vec_pretty(&*entries).context("failed to encode offline queue")?;
            crisis_backend::write_atomic(path, &bytes)?;
        }
        Ok(out)
    }

    pub fn enqueue(&self, op: PendingOperation) -> anyhow::Result<()> {
        self.with_entries(|entries| {
            entries.push_back(op);
            ((), true)
        })
    }

    pub fn front(&self) -> Option<PendingOperation> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .front()
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<PendingOperation> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Newest queued document for `session_id`, if any.
    pub fn latest_upsert(&self, session_id: &SessionId) -> Option<PendingOperation> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .rev()
            .find(|op| &op.session_id == session_id && op.operation == OperationKind::Upsert)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, id: &str) -> anyhow::Result<bool> {
        self.with_entries(|entries| {
            let before = entries.len();
            entries.retain(|op| op.id != id);
            let removed = entries.len() != before;
            (removed, removed)
        })
    }

    /// Bumps the attempt counter of `id` and returns the new count.
    pub fn record_failure(&self, id: &str) -> anyhow::Result<Option<u32>> {
        self.with_entries(|entries| match entries.iter_mut().find(|op| op.id == id) {
            Some(op) => {
                op.attempts = op.attempts.saturating_add(1);
                (Some(op.attempts), true)
            }
            None => (None, false),
        })
    }

    /// Drops every queued write for `session_id`.
    pub fn purge_session(&self, session_id: &SessionId) -> anyhow::Result<usize> {
        self.with_entries(|entries| {
            let before = entries.len();
            entries.retain(|op| &op.session_id != session_id);
            let removed = before - entries.len();
            (removed, removed > 0)
        })
    }
}

/// Exponential backoff for queue replay.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
    /// Attempts after which a queued write is given up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2,
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// Wait before the next try, given how many attempts already failed.
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1);
        self.initial
            .saturating_mul(self.multiplier.saturating_pow(exponent))
            .min(self.max)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ReplayReport {
    pub applied: usize,
    pub dropped: usize,
    /// Acknowledgement of the last replayed upsert.
    pub last_ack: Option<SaveStateResponse>,
    /// Set when replay stopped on a retryable failure; the head entry is still queued.
    pub error: Option<(RemoteError, u32)>,
}

impl ReplayReport {
    pub fn drained(&self) -> bool {
        self.error.is_none()
    }
}

/// Sends queued writes in order. An entry leaves the queue only once the remote confirmed
/// it, or once it failed permanently or ran out of attempts.
pub async fn replay(
    queue: &OfflineQueue,
    remote: &dyn RemoteStore,
    policy: &RetryPolicy,
) -> ReplayReport {
    let mut report = ReplayReport::default();
    while let Some(op) = queue.front() {
        let result = match (op.operation, &op.data) {
            (OperationKind::Upsert, Some(state)) => remote
                .save(&op.session_id, state, Some(&op.id))
                .await
                .map(Some),
            (OperationKind::Upsert, None) => Err(RemoteError::Rejected {
                status: 400,
                message: "queued upsert has no document".to_owned(),
            }),
            (OperationKind::Delete, _) => remote.delete(&op.session_id).await.map(|()| None),
        };

        match result {
            Ok(ack) => {
                tracing::debug!(op_id = %op.id, session_id = %op.session_id, "replayed queued write");
                report.applied += 1;
                if ack.is_some() {
                    report.last_ack = ack;
                }
            }
            Err(err) if err.is_retryable() => {
                let attempts = match queue.record_failure(&op.id) {
                    Ok(attempts) => attempts.unwrap_or(op.attempts + 1),
                    Err(write_err) => {
                        tracing::warn!(error = %write_err, "failed to persist offline queue");
                        op.attempts + 1
                    }
                };
                if attempts < policy.max_attempts {
                    report.error = Some((err, attempts));
                    return report;
                }
                tracing::warn!(op_id = %op.id, session_id = %op.session_id, attempts, error = %err, "dropping queued write after too many attempts");
                report.dropped += 1;
            }
            Err(err) => {
                tracing::warn!(op_id = %op.id, session_id = %op.session_id, error = %err, "remote rejected queued write, dropping it");
                report.dropped += 1;
            }
        }

        if let Err(err) = queue.remove(&op.id) {
            tracing::warn!(op_id = %op.id, error = %err, "failed to persist offline queue");
        }
    }
    report
}
