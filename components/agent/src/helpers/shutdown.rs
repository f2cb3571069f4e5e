// External crates
use tokio_util::sync::CancellationToken;

/// Global termination event shared by every long-running component.
///
/// - `trigger()` notifies every holder at once and is sticky: holders
///   created after the trigger still observe it.
/// - Loops check `is_triggered()` between unit operations and wait on
///   `triggered()` in timed selects, never on unbounded blocking
///   primitives, so signals are observed promptly.
/// - `child()` scopes a component (one TailManager incarnation, one
///   consumer pool) so it can be stopped without tearing down the rest.
#[derive(Debug, Clone)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once `trigger()` has been called, immediately if it
    /// already was.
    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }

    /// A scoped event: triggered when either the parent or the child
    /// itself is triggered.
    pub fn child(&self) -> Shutdown {
        Self {
            token: self.token.child_token(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
