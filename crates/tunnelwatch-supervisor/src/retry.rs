//! Single-slot deferred retry

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Identifies one armed retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetryTicket(u64);

struct ArmedRetry {
    ticket: RetryTicket,
    handle: JoinHandle<()>,
}

/// Holds at most one pending callback
///
/// Scheduling a new retry cancels the previous one. The callback receives
/// its [`RetryTicket`]; owners that forward the ticket through a queue should
/// [`claim`](RetryScheduler::claim) it before acting, so a retry that fired
/// just before being cancelled is recognized as stale.
pub struct RetryScheduler {
    armed: Option<ArmedRetry>,
    next_ticket: u64,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self {
            armed: None,
            next_ticket: 0,
        }
    }

    /// Arm `callback` to run after `delay`, replacing any pending retry
    pub fn schedule<F>(&mut self, delay: Duration, callback: F) -> RetryTicket
    where
        F: FnOnce(RetryTicket) + Send + 'static,
    {
        self.cancel();

        self.next_ticket += 1;
        let ticket = RetryTicket(self.next_ticket);

        debug!("Scheduling retry {:?} in {}s", ticket, delay.as_secs());

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback(ticket);
        });

        self.armed = Some(ArmedRetry { ticket, handle });
        ticket
    }

    /// Cancel the pending retry, if any. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.armed.take() {
            Some(armed) => {
                debug!("Cancelling retry {:?}", armed.ticket);
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Consume a fired ticket; false if it was cancelled or replaced
    pub fn claim(&mut self, ticket: RetryTicket) -> bool {
        match &self.armed {
            Some(armed) if armed.ticket == ticket => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.armed.is_some()
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = RetryScheduler::new();

        let ticket = scheduler.schedule(Duration::from_secs(20), move |t| {
            let _ = tx.send(t);
        });
        assert!(scheduler.is_pending());

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv().unwrap(), ticket);
        assert!(scheduler.claim(ticket));
        assert!(!scheduler.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = RetryScheduler::new();

        let first_tx = tx.clone();
        let first = scheduler.schedule(Duration::from_secs(5), move |t| {
            let _ = first_tx.send(t);
        });
        let second = scheduler.schedule(Duration::from_secs(10), move |t| {
            let _ = tx.send(t);
        });
        assert_ne!(first, second);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rx.try_recv().unwrap(), second);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel::<RetryTicket>();
        let mut scheduler = RetryScheduler::new();

        scheduler.schedule(Duration::from_secs(1), move |t| {
            let _ = tx.send(t);
        });
        assert!(scheduler.cancel());
        assert!(!scheduler.cancel());
        assert!(!scheduler.is_pending());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_ticket_not_claimed() {
        let mut scheduler = RetryScheduler::new();

        let stale = scheduler.schedule(Duration::from_secs(1), |_| {});
        let current = scheduler.schedule(Duration::from_secs(1), |_| {});

        assert!(!scheduler.claim(stale));
        assert!(scheduler.is_pending());
        assert!(scheduler.claim(current));
        assert!(!scheduler.claim(current));
    }
}
