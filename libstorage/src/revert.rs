//! Revert stack: compensating actions for multi-step operations.
//!
//! Every multi-step driver operation (pool create, volume create) registers a
//! compensating action after each side effect. On failure the whole stack is
//! executed in reverse registration order so no partial state survives; on
//! success the stack is discarded without running anything.
//!
//! The stack is the sole rollback mechanism in this crate. It is not a
//! concurrency primitive: a [`Reverter`] belongs to exactly one in-flight
//! operation and must not be shared across tasks. Actions must be `'static`,
//! so they capture cloned collaborator handles (e.g. the remote client) and
//! derived names/paths rather than borrowing the driver.

use futures::future::BoxFuture;
use tracing::debug;

type RevertFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Ordered list of compensating actions, run in reverse on failure.
#[derive(Default)]
pub struct Reverter {
    actions: Vec<RevertFn>,
}

impl Reverter {
    /// Create an empty revert stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compensating action for the side effect that just
    /// succeeded.
    ///
    /// Actions are infallible by contract: rollback runs on an error path
    /// where there is nobody left to hand a second error to, so actions log
    /// their own failures instead of returning them.
    pub fn add<F, Fut>(&mut self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.actions.push(Box::new(move || Box::pin(action())));
    }

    /// The operation succeeded: discard all actions without running them.
    pub fn success(&mut self) {
        self.actions.clear();
    }

    /// The operation failed: run every registered action in reverse order,
    /// then discard the stack. Safe to call on an empty stack.
    pub async fn fail(&mut self) {
        if !self.actions.is_empty() {
            debug!(actions = self.actions.len(), "reverting partial operation");
        }
        while let Some(action) = self.actions.pop() {
            action().await;
        }
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no actions are registered.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
