use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

use crate::state::StateView;

/// Waitable view of the node state, signaled on every persisted change.
///
/// Waiters re-check their predicate on each wake, so a single commit that
/// jumps the index past several targets satisfies all of them without
/// further signals, and a predicate that already holds returns immediately.
/// All waits are bounded: `false` means the timeout elapsed first.
#[derive(Clone)]
pub struct CommitSignal {
    receiver: watch::Receiver<StateView>,
}

impl CommitSignal {
    pub(crate) fn new(receiver: watch::Receiver<StateView>) -> Self {
        Self { receiver }
    }

    /// Current state view.
    pub fn view(&self) -> StateView {
        *self.receiver.borrow()
    }

    /// Wait until the commit index advances past its value at call time.
    pub async fn wait_any(&mut self, limit: Duration) -> bool {
        let seen = self.receiver.borrow().commit_index;
        self.wait_for(move |view| view.commit_index > seen, limit).await
    }

    /// Wait until the commit index reaches `target`.
    pub async fn wait_for_index(&mut self, target: u64, limit: Duration) -> bool {
        self.wait_for(move |view| view.commit_index >= target, limit).await
    }

    /// Wait until `predicate` holds over the node state view. Used for
    /// consistency waits such as "the current term has a committed entry".
    pub async fn wait_for<F>(&mut self, mut predicate: F, limit: Duration) -> bool
    where
        F: FnMut(&StateView) -> bool,
    {
        timeout(limit, self.receiver.wait_for(|view| predicate(view)))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (watch::Sender<StateView>, CommitSignal) {
        let (tx, rx) = watch::channel(StateView::default());
        (tx, CommitSignal::new(rx))
    }

    #[tokio::test]
    async fn test_wait_for_index_already_satisfied() {
        let (tx, mut signal) = channel();
        tx.send_modify(|v| v.commit_index = 5);
        // No further signal needed for any target at or below 5.
        assert!(signal.wait_for_index(3, Duration::from_millis(10)).await);
        assert!(signal.wait_for_index(5, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_for_index_wakes_on_advance() {
        let (tx, mut signal) = channel();
        let waiter = tokio::spawn(async move {
            signal.wait_for_index(2, Duration::from_secs(5)).await
        });
        tokio::task::yield_now().await;
        tx.send_modify(|v| v.commit_index = 2);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_any_times_out_without_advance() {
        let (tx, mut signal) = channel();
        tx.send_modify(|v| v.commit_index = 1);
        // Already at 1; wait_any needs a further advance.
        assert!(!signal.wait_any(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_wait_for_predicate_over_term() {
        let (tx, mut signal) = channel();
        let waiter = tokio::spawn(async move {
            signal
                .wait_for(|view| view.term >= 3, Duration::from_secs(5))
                .await
        });
        tokio::task::yield_now().await;
        tx.send_modify(|v| v.term = 3);
        assert!(waiter.await.unwrap());
    }
}
