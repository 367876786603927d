use crate::remote::{RemoteError, RemoteStore, RepositoryRemote};
use crisis_api::SaveStateResponse;
use crisis_backend::{MemoryStore, SessionRepository};
use crisis_domain::{AppState, SessionId};
use futures::FutureExt as _;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory remote that can be taken down, brought back and slowed down.
pub(crate) struct Switchable {
    pub(crate) inner: RepositoryRemote,
    pub(crate) up: AtomicBool,
    pub(crate) saved_titles: Mutex<Vec<String>>,
    save_delay: Mutex<Duration>,
    fetch_delay: Mutex<Duration>,
}

impl Switchable {
    pub(crate) fn new() -> Self {
        Self {
            inner: RepositoryRemote::new(SessionRepository::new(Arc::new(MemoryStore::new()))),
            up: AtomicBool::new(true),
            saved_titles: Mutex::new(Vec::new()),
            save_delay: Mutex::new(Duration::ZERO),
            fetch_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Saves wait this long before they reach the store.
    pub(crate) fn set_save_delay(&self, delay: Duration) {
        *self.save_delay.lock().unwrap() = delay;
    }

    /// Fetches read the store right away but answer this much later.
    pub(crate) fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    pub(crate) fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub(crate) fn saved_titles(&self) -> Vec<String> {
        self.saved_titles.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unreachable("connection refused".to_owned()))
        }
    }
}

impl RemoteStore for Switchable {
    fn fetch<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, Result<Option<AppState>, RemoteError>> {
        let delay = *self.fetch_delay.lock().unwrap();
        async move {
            self.check()?;
            let result = self.inner.fetch(session_id).await;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            result
        }
        .boxed()
    }

    fn save<'a>(
        &'a self,
        session_id: &'a SessionId,
        state: &'a AppState,
        client_op_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<SaveStateResponse, RemoteError>> {
        let delay = *self.save_delay.lock().unwrap();
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.check()?;
            self.saved_titles
                .lock()
                .unwrap()
                .push(state.meta.title.clone());
            self.inner.save(session_id, state, client_op_id).await
        }
        .boxed()
    }

    fn delete<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, Result<(), RemoteError>> {
        async move {
            self.check()?;
            self.inner.delete(session_id).await
        }
        .boxed()
    }

    fn reset<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, Result<SessionId, RemoteError>> {
        async move {
            self.check()?;
            self.inner.reset(session_id).await
        }
        .boxed()
    }
}
