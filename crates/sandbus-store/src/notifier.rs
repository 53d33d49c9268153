//! Change-notification subscriptions

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use sandbus_core::prelude::*;
use sandbus_core::{ChangeEvent, ChangeKind, NotifierBatch, ResourceId};

/// Callback receiving every delivered batch
pub type NotifierCallback = Arc<dyn Fn(&NotifierBatch) + Send + Sync>;

/// Handle returned by [`Notifier::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Source of change notification batches
pub trait Notifier: Send + Sync {
    fn subscribe(&self, callback: NotifierCallback) -> SubscriptionId;

    /// Returns `false` if the subscription was unknown
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

impl<T: Notifier + ?Sized> Notifier for Arc<T> {
    fn subscribe(&self, callback: NotifierCallback) -> SubscriptionId {
        (**self).subscribe(callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        (**self).unsubscribe(id)
    }
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, NotifierCallback)>,
}

/// Subscription registry dispatching batches in registration order
///
/// The lock is released before callbacks run, so a callback may subscribe or
/// unsubscribe. A subscriber removed during a dispatch may still see that one
/// batch.
#[derive(Clone, Default)]
pub struct NotifierHub {
    state: Arc<Mutex<HubState>>,
}

impl NotifierHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver a batch to every current subscriber, returning how many ran
    pub fn dispatch(&self, batch: &NotifierBatch) -> usize {
        let callbacks: Vec<NotifierCallback> = self
            .lock()
            .subscribers
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        trace!(
            "Dispatching {} events from {:?}/{:?} to {} subscribers",
            batch.len(),
            batch.service,
            batch.graph,
            callbacks.len()
        );
        for callback in &callbacks {
            callback(batch);
        }
        callbacks.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl Notifier for NotifierHub {
    fn subscribe(&self, callback: NotifierCallback) -> SubscriptionId {
        let mut state = self.lock();
        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        state.subscribers.push((id, callback));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|(existing, _)| *existing != id);
        before != state.subscribers.len()
    }
}

impl fmt::Debug for NotifierHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Merge events for the same `(subject, property)` within one batch
///
/// First appearance decides the position. An `Updated` never overrides an
/// earlier `Created` or `Deleted`; any other later kind replaces the earlier
/// one. A URI learned from a later event is kept.
pub fn coalesce_events(events: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut merged: Vec<ChangeEvent> = Vec::with_capacity(events.len());
    let mut index: HashMap<(ResourceId, Option<ResourceId>), usize> = HashMap::new();

    for event in events {
        let key = (event.subject_id, event.property_id);
        match index.get(&key) {
            Some(&i) => {
                let existing = &mut merged[i];
                let keep_kind = event.kind == ChangeKind::Updated
                    && matches!(existing.kind, ChangeKind::Created | ChangeKind::Deleted);
                if !keep_kind {
                    existing.kind = event.kind;
                }
                if event.subject_uri.is_some() {
                    existing.subject_uri = event.subject_uri;
                }
                if event.graph.is_some() {
                    existing.graph = event.graph;
                }
            }
            None => {
                index.insert(key, merged.len());
                merged.push(event);
            }
        }
    }

    merged
}
