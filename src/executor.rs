//! Bounded concurrent executor returning results in submission order

use crate::error::{BossError, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Error out if cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(BossError::Internal("operation cancelled".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrderedExecutor {
    concurrency: usize,
}

impl OrderedExecutor {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Run `tasks` with at most `concurrency` in flight; the first error or a
    /// cancellation stops the remaining work
    pub async fn run<T, Fut>(&self, tasks: Vec<Fut>, token: &CancelToken) -> Result<Vec<T>>
    where
        Fut: Future<Output = Result<T>>,
    {
        let work = stream::iter(tasks.into_iter().map(|task| async move {
            token.check()?;
            task.await
        }))
        .buffered(self.concurrency)
        .try_collect::<Vec<T>>();

        tokio::select! {
            result = work => result,
            _ = token.cancelled() => Err(BossError::Internal("operation cancelled".to_string())),
        }
    }
}

/// State of a tracked background execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Background executions addressable by handle, so they can be polled and cancelled
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    executions: Mutex<HashMap<String, (CancelToken, ExecutionState)>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new running execution, returning its handle and token
    pub fn start(&self, kind: &str) -> (String, CancelToken) {
        let arn = format!("{}:{}", kind, Uuid::new_v4());
        let token = CancelToken::new();
        self.executions
            .lock()
            .insert(arn.clone(), (token.clone(), ExecutionState::Running));
        (arn, token)
    }

    /// Record the end state of an execution; a cancelled execution stays cancelled
    pub fn finish(&self, arn: &str, state: ExecutionState) {
        if let Some(entry) = self.executions.lock().get_mut(arn) {
            if entry.1 == ExecutionState::Running {
                entry.1 = state;
            }
        }
    }

    pub fn state(&self, arn: &str) -> Option<ExecutionState> {
        self.executions.lock().get(arn).map(|(_, state)| *state)
    }

    /// Signal an execution to stop; false if it is unknown or already ended
    pub fn cancel(&self, arn: &str) -> bool {
        let mut executions = self.executions.lock();
        match executions.get_mut(arn) {
            Some((token, state)) if *state == ExecutionState::Running => {
                token.cancel();
                *state = ExecutionState::Cancelled;
                true
            }
            _ => false,
        }
    }
}
