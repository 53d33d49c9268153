//! Blocking, timeout-bounded waits on the change-notification stream
//!
//! A wait is a single-slot rendezvous. The delivery callback runs the
//! predicate synchronously and records the first match in the slot; only the
//! wake-up of the waiting task is deferred. A match delivered before the
//! caller starts waiting is therefore never lost.
//!
//! One correlator allows one outstanding wait. A second `arm` while a wait is
//! outstanding fails with [`Error::WaitInProgress`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use sandbus_core::prelude::*;
use sandbus_core::{ChangeEvent, NotifierBatch};

use crate::notifier::{Notifier, SubscriptionId};
use crate::predicates::EventPredicate;

/// Resolution of a [`PendingWait`]; exactly one non-pending outcome is ever
/// recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Pending,
    Matched(ChangeEvent),
    TimedOut,
    Cancelled,
}

impl WaitOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, WaitOutcome::Pending)
    }
}

struct WaitCell {
    outcome: WaitOutcome,
    predicate: Box<dyn EventPredicate>,
    /// Events scanned past after the match, in the matching batch
    discarded: usize,
}

struct WaitShared {
    cell: Mutex<WaitCell>,
    wake: Notify,
}

impl WaitShared {
    fn lock(&self) -> MutexGuard<'_, WaitCell> {
        self.cell.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `outcome` unless one was already recorded; wake the waiter
    fn resolve(&self, outcome: WaitOutcome) -> bool {
        let mut cell = self.lock();
        if !cell.outcome.is_pending() {
            return false;
        }
        cell.outcome = outcome;
        drop(cell);
        self.wake.notify_one();
        true
    }
}

/// Issues waits against one notifier
#[derive(Clone)]
pub struct EventCorrelator {
    notifier: Arc<dyn Notifier>,
    busy: Arc<AtomicBool>,
}

impl EventCorrelator {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a wait is currently outstanding
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Subscribe and start the deadline for `predicate`
    ///
    /// Matching starts immediately; trigger the expected change after this
    /// returns and before calling [`PendingWait::wait`].
    pub fn arm<P>(&self, predicate: P, timeout: Duration) -> Result<PendingWait>
    where
        P: EventPredicate + 'static,
    {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::WaitInProgress);
        }

        let description = predicate.describe();
        let shared = Arc::new(WaitShared {
            cell: Mutex::new(WaitCell {
                outcome: WaitOutcome::Pending,
                predicate: Box::new(predicate),
                discarded: 0,
            }),
            wake: Notify::new(),
        });

        let callback_shared = Arc::clone(&shared);
        let subscription = self.notifier.subscribe(Arc::new(move |batch: &NotifierBatch| {
            let mut guard = callback_shared.lock();
            let cell = &mut *guard;
            if !cell.outcome.is_pending() {
                return;
            }

            for (index, event) in batch.events.iter().enumerate() {
                match cell.predicate.check(event) {
                    Ok(Some(matched)) => {
                        cell.outcome = WaitOutcome::Matched(matched);
                        cell.discarded = batch.len() - index - 1;
                        drop(guard);
                        callback_shared.wake.notify_one();
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Predicate failed on event {:?}: {}", event, e),
                }
            }
        }));

        debug!("Awaiting {} (subscription {})", description, subscription);
        Ok(PendingWait {
            description,
            timeout,
            deadline: Instant::now() + timeout,
            shared,
            subscription: Some(subscription),
            notifier: Arc::clone(&self.notifier),
            busy: Arc::clone(&self.busy),
        })
    }

    /// `arm` then `wait`, for predicates whose event is triggered elsewhere
    pub async fn await_event<P>(&self, predicate: P, timeout: Duration) -> Result<ChangeEvent>
    where
        P: EventPredicate + 'static,
    {
        self.arm(predicate, timeout)?.wait().await
    }
}

/// Cancels a [`PendingWait`] from another task
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<WaitShared>,
}

impl CancelHandle {
    /// Resolve the wait as cancelled; `false` if it was already resolved
    pub fn cancel(&self) -> bool {
        self.shared.resolve(WaitOutcome::Cancelled)
    }
}

/// One armed wait
///
/// Dropping it deregisters the subscription and frees the correlator.
pub struct PendingWait {
    description: String,
    timeout: Duration,
    deadline: Instant,
    shared: Arc<WaitShared>,
    subscription: Option<SubscriptionId>,
    notifier: Arc<dyn Notifier>,
    busy: Arc<AtomicBool>,
}

impl PendingWait {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Current outcome without waiting
    pub fn outcome(&self) -> WaitOutcome {
        self.shared.lock().outcome.clone()
    }

    /// Events of the matching batch that came after the match
    pub fn discarded(&self) -> usize {
        self.shared.lock().discarded
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Resolve as cancelled and deregister; never fails
    pub fn cancel(&mut self) {
        if self.shared.resolve(WaitOutcome::Cancelled) {
            debug!("Cancelled wait for {}", self.description);
        }
        self.deregister();
    }

    /// Wait until matched, timed out or cancelled
    pub async fn wait_outcome(&mut self) -> WaitOutcome {
        let shared = Arc::clone(&self.shared);
        loop {
            let woken = shared.wake.notified();
            let outcome = self.outcome();
            if !outcome.is_pending() {
                self.deregister();
                return outcome;
            }

            if timeout_at(self.deadline, woken).await.is_err()
                && shared.resolve(WaitOutcome::TimedOut)
            {
                debug!(
                    "Timed out after {:?} waiting for {}",
                    self.timeout, self.description
                );
            }
        }
    }

    /// Wait for the matching event
    ///
    /// Fails with [`Error::EventTimeout`] naming the predicate and the time
    /// waited, or [`Error::WaitCancelled`].
    pub async fn wait(mut self) -> Result<ChangeEvent> {
        match self.wait_outcome().await {
            WaitOutcome::Matched(event) => Ok(event),
            WaitOutcome::TimedOut => Err(Error::event_timeout(
                self.description.clone(),
                self.timeout,
            )),
            WaitOutcome::Cancelled | WaitOutcome::Pending => Err(Error::WaitCancelled {
                predicate: self.description.clone(),
            }),
        }
    }

    fn deregister(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.notifier.unsubscribe(id);
        }
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        self.deregister();
        self.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::NotifierHub;
    use crate::predicates::{matching, ResourceDeleted};
    use sandbus_core::{ChangeKind, NotifierBatch, ResourceId};
    use std::time::Instant as StdInstant;

    fn correlator() -> (NotifierHub, EventCorrelator) {
        let hub = NotifierHub::new();
        let correlator = EventCorrelator::new(Arc::new(hub.clone()));
        (hub, correlator)
    }

    fn batch(events: Vec<ChangeEvent>) -> NotifierBatch {
        NotifierBatch::new(events)
    }

    #[tokio::test]
    async fn test_match_delivered_before_wait_is_not_lost() {
        let (hub, correlator) = correlator();
        let pending = correlator
            .arm(ResourceDeleted::new(ResourceId(7)), Duration::from_millis(200))
            .unwrap();

        // Delivered synchronously, before anybody awaits
        hub.dispatch(&batch(vec![ChangeEvent::deleted(7)]));

        let started = StdInstant::now();
        let event = pending.wait().await.unwrap();
        assert_eq!(event.subject_id, ResourceId(7));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_wait_stays_pending_until_match() {
        let (hub, correlator) = correlator();
        let pending = correlator
            .arm(ResourceDeleted::new(ResourceId(8)), Duration::from_secs(5))
            .unwrap();
        let mut wait = tokio_test::task::spawn(pending.wait());

        tokio_test::assert_pending!(wait.poll());
        hub.dispatch(&batch(vec![ChangeEvent::created(8)]));
        tokio_test::assert_pending!(wait.poll());

        hub.dispatch(&batch(vec![ChangeEvent::deleted(8)]));
        assert!(wait.is_woken());
        let event = tokio_test::assert_ready_ok!(wait.poll());
        assert_eq!(event.subject_id, ResourceId(8));
    }

    #[tokio::test]
    async fn test_timeout_is_bounded() {
        let (_hub, correlator) = correlator();
        let timeout = Duration::from_millis(150);

        let started = StdInstant::now();
        let err = correlator
            .await_event(ResourceDeleted::new(ResourceId(1)), timeout)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, Error::EventTimeout { .. }));
        assert!(err.to_string().contains("deletion of resource 1"));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout * 2, "waited {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_timeout_deregisters_subscription() {
        let (hub, correlator) = correlator();
        let _ = correlator
            .await_event(ResourceDeleted::new(ResourceId(1)), Duration::from_millis(20))
            .await;
        assert_eq!(hub.subscriber_count(), 0);
        assert!(!correlator.is_busy());
    }

    #[tokio::test]
    async fn test_first_match_in_batch_wins() {
        let (hub, correlator) = correlator();
        let pending = correlator
            .arm(
                matching("any deletion", |e| e.kind == ChangeKind::Deleted),
                Duration::from_secs(1),
            )
            .unwrap();

        hub.dispatch(&batch(vec![
            ChangeEvent::created(1),
            ChangeEvent::deleted(2),
            ChangeEvent::deleted(3),
            ChangeEvent::updated(4),
        ]));
        // A later batch cannot overwrite the recorded match
        hub.dispatch(&batch(vec![ChangeEvent::deleted(5)]));

        assert_eq!(pending.discarded(), 2);
        let event = pending.wait().await.unwrap();
        assert_eq!(event.subject_id, ResourceId(2));
    }

    #[tokio::test]
    async fn test_match_after_timeout_is_ignored() {
        let (hub, correlator) = correlator();
        let mut pending = correlator
            .arm(ResourceDeleted::new(ResourceId(9)), Duration::from_millis(20))
            .unwrap();

        assert_eq!(pending.wait_outcome().await, WaitOutcome::TimedOut);
        hub.dispatch(&batch(vec![ChangeEvent::deleted(9)]));
        assert_eq!(pending.outcome(), WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_second_wait_is_rejected() {
        let (_hub, correlator) = correlator();
        let first = correlator
            .arm(ResourceDeleted::new(ResourceId(1)), Duration::from_secs(1))
            .unwrap();

        let second = correlator.arm(ResourceDeleted::new(ResourceId(2)), Duration::from_secs(1));
        assert!(matches!(second, Err(Error::WaitInProgress)));

        drop(first);
        assert!(correlator
            .arm(ResourceDeleted::new(ResourceId(2)), Duration::from_secs(1))
            .is_ok());
    }

    #[tokio::test]
    async fn test_cancel_resolves_without_error() {
        let (hub, correlator) = correlator();
        let mut pending = correlator
            .arm(ResourceDeleted::new(ResourceId(1)), Duration::from_secs(5))
            .unwrap();

        pending.cancel();
        pending.cancel();
        assert_eq!(pending.outcome(), WaitOutcome::Cancelled);
        assert_eq!(hub.subscriber_count(), 0);

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, Error::WaitCancelled { .. }));
    }

    #[tokio::test]
    async fn test_cancel_from_another_task_wakes_waiter() {
        let (_hub, correlator) = correlator();
        let mut pending = correlator
            .arm(ResourceDeleted::new(ResourceId(1)), Duration::from_secs(5))
            .unwrap();
        let handle = pending.cancel_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });

        let started = StdInstant::now();
        assert_eq!(pending.wait_outcome().await, WaitOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_match_from_another_task() {
        let (hub, correlator) = correlator();
        let pending = correlator
            .arm(ResourceDeleted::new(ResourceId(3)), Duration::from_secs(5))
            .unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            hub.dispatch(&batch(vec![ChangeEvent::created(3), ChangeEvent::deleted(3)]));
        });

        let event = pending.wait().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Deleted);
    }

    #[tokio::test]
    async fn test_failing_predicate_is_a_non_match() {
        struct Broken;
        impl EventPredicate for Broken {
            fn describe(&self) -> String {
                "broken".to_string()
            }
            fn check(&mut self, _event: &ChangeEvent) -> Result<Option<ChangeEvent>> {
                Err(Error::query("store went away"))
            }
        }

        let (hub, correlator) = correlator();
        let mut pending = correlator.arm(Broken, Duration::from_millis(30)).unwrap();
        hub.dispatch(&batch(vec![ChangeEvent::created(1)]));
        assert_eq!(pending.wait_outcome().await, WaitOutcome::TimedOut);
    }
}
