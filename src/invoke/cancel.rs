//! Cooperative cancellation
//!
//! A [`CancellationToken`] is passed through every call that may suspend.
//! Tokens form a tree: cancelling a parent cancels every child, while
//! cancelling a child (e.g. an attempt deadline) leaves the parent untouched.

use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;

use crate::utils::lock;

struct TokenNode {
    tx: watch::Sender<bool>,
    children: Mutex<Vec<Weak<TokenNode>>>,
}

impl TokenNode {
    fn new(cancelled: bool) -> Arc<Self> {
        let (tx, _rx) = watch::channel(cancelled);
        Arc::new(Self {
            tx,
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self) {
        // send_replace stores the value even with no live receivers
        let was_cancelled = self.tx.send_replace(true);
        if was_cancelled {
            return;
        }

        let children = std::mem::take(&mut *lock(&self.children));
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// Cancellation signal shared between the engine and invoked units
#[derive(Clone)]
pub struct CancellationToken {
    node: Arc<TokenNode>,
}

impl CancellationToken {
    /// Create a new, uncancelled root token
    pub fn new() -> Self {
        Self {
            node: TokenNode::new(false),
        }
    }

    /// Create a child token that is cancelled whenever this token is
    pub fn child_token(&self) -> Self {
        let mut children = lock(&self.node.children);

        // Checked under the lock so a concurrent cancel cannot miss the child
        if self.is_cancelled() {
            return Self {
                node: TokenNode::new(true),
            };
        }

        children.retain(|c| c.strong_count() > 0);
        let node = TokenNode::new(false);
        children.push(Arc::downgrade(&node));
        Self { node }
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.node.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.node.tx.borrow()
    }

    /// Wait until cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.node.tx.subscribe();
        // The sender lives as long as self, so wait_for only errors if dropped
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_propagates_to_children() {
        let root = CancellationToken::new();
        let child = root.child_token();
        let grandchild = child.child_token();

        assert!(!grandchild.is_cancelled());
        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let root = CancellationToken::new();
        let child = root.child_token();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_token_starts_cancelled() {
        let root = CancellationToken::new();
        root.cancel();
        assert!(root.child_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let joined = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let waited = tokio::time::timeout(Duration::from_millis(100), token.cancelled()).await;
        assert!(waited.is_ok());
    }
}
