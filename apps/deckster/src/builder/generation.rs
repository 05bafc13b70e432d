//! Three-state resource tracking a speculative generation placeholder.
//!
//! A placeholder moves `Blank -> Generating -> Resolved`, and the timeout or
//! error path returns it to `Blank` deterministically instead of leaving a
//! stuck spinner behind.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Blank,
    Generating,
    Resolved,
}

#[derive(Clone)]
pub struct GenerationSlot {
    inner: Arc<Mutex<SlotInner>>,
    timeout: Duration,
}

struct SlotInner {
    state: GenerationState,
    /// Bumped on every `begin` so a stale timeout cannot roll back a newer
    /// generation cycle.
    revision: u64,
    timer: Option<JoinHandle<()>>,
}

impl GenerationSlot {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SlotInner {
                state: GenerationState::Blank,
                revision: 0,
                timer: None,
            })),
            timeout,
        }
    }

    pub fn state(&self) -> GenerationState {
        self.inner.lock().unwrap().state
    }

    pub fn is_generating(&self) -> bool {
        self.state() == GenerationState::Generating
    }

    /// Enter `Generating` and arm the rollback deadline. Returns `false`
    /// while a generation is already in flight.
    pub fn begin(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == GenerationState::Generating {
            return false;
        }
        inner.state = GenerationState::Generating;
        inner.revision += 1;
        let revision = inner.revision;
        let slot = self.clone();
        let deadline = self.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            slot.expire(revision);
        });
        if let Some(old) = inner.timer.replace(handle) {
            old.abort();
        }
        true
    }

    /// The generation produced a result before the deadline.
    pub fn resolve(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != GenerationState::Generating {
            return false;
        }
        inner.state = GenerationState::Resolved;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        true
    }

    /// Explicit error path: revert to `Blank` immediately.
    pub fn rollback(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != GenerationState::Generating {
            return false;
        }
        inner.state = GenerationState::Blank;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        true
    }

    /// Teardown: cancel any pending deadline and return to `Blank`.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = GenerationState::Blank;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
    }

    fn expire(&self, revision: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.revision == revision && inner.state == GenerationState::Generating {
            debug!("generation placeholder timed out; reverting to blank");
            inner.state = GenerationState::Blank;
            inner.timer = None;
        }
    }
}
