use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const SLEEP_TICK: Duration = Duration::from_millis(50);

/// Cooperative cancellation flag handed to every worker thread.
///
/// A token owns one flag and carries the flags of all its ancestors, so
/// cancelling a parent is observed by every descendant with a flat scan
/// instead of a pointer chase. Clones share the same flag; `new_child`
/// extends the lineage with a fresh one.
#[derive(Clone)]
pub struct CancelToken {
    /// Ancestor flags first, own flag last. Never empty.
    lineage: Vec<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new_root() -> Self {
        Self {
            lineage: vec![Arc::new(AtomicBool::new(false))],
        }
    }

    /// Derive a token that observes this one: cancelling `self` cancels
    /// the child, never the other way around.
    pub fn new_child(&self) -> Self {
        let mut lineage = Vec::with_capacity(self.lineage.len() + 1);
        lineage.extend(self.lineage.iter().cloned());
        lineage.push(Arc::new(AtomicBool::new(false)));
        Self { lineage }
    }

    /// Raise this token's own flag. Descendants created from it (before
    /// or after this call) report cancelled; ancestors are untouched.
    pub fn cancel(&self) {
        if let Some(own) = self.lineage.last() {
            own.store(true, Ordering::Release);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.lineage.iter().any(|f| f.load(Ordering::Acquire))
    }

    /// Sleep until `total` has elapsed or the token is cancelled,
    /// whichever comes first. Returns `false` when interrupted by
    /// cancellation.
    pub fn sleep_cancellable(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SLEEP_TICK));
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("depth", &self.lineage.len())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_sees_parent_cancel() {
        let root = CancelToken::new_root();
        let child = root.new_child();
        assert!(!child.is_cancelled());
        root.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn parent_unaffected_by_child_cancel() {
        let root = CancelToken::new_root();
        let child = root.new_child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn cancel_crosses_clones_and_generations() {
        let root = CancelToken::new_root();
        let grandchild = root.new_child().new_child();
        let sibling = root.clone();
        sibling.cancel();
        assert!(root.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn cancelled_sleep_returns_early() {
        let token = CancelToken::new_root();
        token.cancel();
        let start = Instant::now();
        assert!(!token.sleep_cancellable(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn uncancelled_sleep_runs_to_completion() {
        let token = CancelToken::new_root();
        assert!(token.sleep_cancellable(Duration::from_millis(20)));
    }
}
