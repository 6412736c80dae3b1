//! Undo stack for multi-step filesystem operations.

use tracing::debug;

type Action = Box<dyn FnOnce() + Send>;

/// Actions run in reverse registration order when the stack is dropped,
/// unless [`reset`](Rollback::reset) was called first.
#[derive(Default)]
pub struct Rollback {
    actions: Vec<Action>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, action: impl FnOnce() + Send + 'static) {
        self.actions.push(Box::new(action));
    }

    /// Forget every registered action. Called once the operation succeeded.
    pub fn reset(&mut self) {
        self.actions.clear();
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every registered action, last registered first.
    pub fn run(&mut self) {
        if !self.actions.is_empty() {
            debug!(actions = self.actions.len(), "Running rollback");
        }
        while let Some(action) = self.actions.pop() {
            action();
        }
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for Rollback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rollback")
            .field("actions", &self.actions.len())
            .finish()
    }
}
