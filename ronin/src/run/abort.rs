//! Cooperative cancellation with parent-child propagation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<AbortInner>>>,
}

impl AbortInner {
    fn abort(&self) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();
        let children = {
            let mut guard = self.children.lock().expect("abort tree poisoned");
            std::mem::take(&mut *guard)
        };
        for child in children {
            if let Some(child) = child.upgrade() {
                child.abort();
            }
        }
    }
}

/// Owner side of an abort signal.
///
/// Abort is monotonic: once fired it never resets, and it cascades to every
/// linked child controller.
#[derive(Debug, Clone, Default)]
pub struct AbortController {
    inner: Arc<AbortInner>,
}

impl AbortController {
    /// Create a new, un-aborted controller.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The observer side of this controller.
    #[must_use]
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Whether this controller has been aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Fire the abort and cascade to children.
    pub fn abort(&self) {
        self.inner.abort();
    }

    /// Create a child controller linked to this one.
    ///
    /// A child born after the parent aborted starts aborted.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();
        if self.is_aborted() {
            child.abort();
        } else {
            self.inner
                .children
                .lock()
                .expect("abort tree poisoned")
                .push(Arc::downgrade(&child.inner));
            // The parent may have aborted between the check and the link.
            if self.is_aborted() {
                child.abort();
            }
        }
        child
    }
}

/// Observer side of an abort controller.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

impl AbortSignal {
    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        AbortController::new().signal()
    }

    /// Whether the abort has fired.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Wait until the abort fires.
    pub async fn cancelled(&self) {
        while !self.is_aborted() {
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn abort_is_monotonic() {
        let controller = AbortController::new();
        assert!(!controller.is_aborted());
        controller.abort();
        controller.abort();
        assert!(controller.is_aborted());
        assert!(controller.signal().is_aborted());
    }

    #[test]
    fn parent_abort_cascades_to_children() {
        let parent = AbortController::new();
        let child = parent.child();
        let grandchild = child.child();

        parent.abort();

        assert!(child.is_aborted());
        assert!(grandchild.is_aborted());
    }

    #[test]
    fn child_abort_does_not_touch_parent() {
        let parent = AbortController::new();
        let child = parent.child();
        child.abort();
        assert!(!parent.is_aborted());
    }

    #[test]
    fn child_of_aborted_parent_starts_aborted() {
        let parent = AbortController::new();
        parent.abort();
        assert!(parent.child().is_aborted());
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let controller = AbortController::new();
        let signal = controller.signal();

        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.abort();

        let woke = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timed out")
            .expect("waiter panicked");
        assert!(woke);
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_aborted() {
        let controller = AbortController::new();
        controller.abort();
        controller.signal().cancelled().await;
    }
}
