//! Test fixtures running the same test body over different transports
//!
//! [`DirectFixture`] talks to an in-process store whose notifications arrive
//! synchronously inside `update`. [`BusFixture`] puts the same store behind a
//! transport task, so notifications arrive later, from another task. Tests
//! written against [`StoreFixture`] must pass with both.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use sandbus_core::prelude::*;
use sandbus_core::NotifierBatch;

use crate::client::{Row, StoreClient};
use crate::correlator::EventCorrelator;
use crate::memory::MemoryStore;
use crate::notifier::{Notifier, NotifierHub};

/// What a store test needs: updates, queries and a notifier
pub trait StoreFixture {
    fn store(&self) -> Arc<dyn StoreClient>;

    fn notifier(&self) -> Arc<dyn Notifier>;

    fn update(&self, sparql: &str) -> Result<()> {
        self.store().update(sparql)
    }

    fn query(&self, sparql: &str) -> Result<Vec<Row>> {
        self.store().query(sparql)
    }

    fn correlator(&self) -> EventCorrelator {
        EventCorrelator::new(self.notifier())
    }
}

/// In-process store with synchronous notification delivery
#[derive(Debug, Default)]
pub struct DirectFixture {
    store: Arc<MemoryStore>,
}

impl DirectFixture {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreFixture for DirectFixture {
    fn store(&self) -> Arc<dyn StoreClient> {
        self.store.clone()
    }

    fn notifier(&self) -> Arc<dyn Notifier> {
        Arc::new(self.store.notifier())
    }
}

/// The same store, with notifications relayed through a transport task
///
/// Must be created inside a tokio runtime.
pub struct BusFixture {
    store: Arc<MemoryStore>,
    hub: NotifierHub,
    relay: JoinHandle<()>,
}

impl BusFixture {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let hub = NotifierHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<NotifierBatch>();

        store
            .notifier()
            .subscribe(Arc::new(move |batch: &NotifierBatch| {
                let _ = tx.send(batch.clone());
            }));

        let relay_hub = hub.clone();
        let relay = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                // Let the updating task run on before delivery.
                tokio::task::yield_now().await;
                relay_hub.dispatch(&batch);
            }
            debug!("notification relay finished");
        });

        Self { store, hub, relay }
    }
}

impl StoreFixture for BusFixture {
    fn store(&self) -> Arc<dyn StoreClient> {
        self.store.clone()
    }

    fn notifier(&self) -> Arc<dyn Notifier> {
        Arc::new(self.hub.clone())
    }
}

impl Drop for BusFixture {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StoreExt;
    use crate::predicates::{PropertyUpdated, ResourceCreated, ResourceDeleted};
    use crate::query;
    use sandbus_core::ChangeKind;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(10);

    async fn created_then_deleted(fixture: &dyn StoreFixture) {
        let correlator = fixture.correlator();
        let store = fixture.store();

        let pending = correlator
            .arm(
                ResourceCreated::new(store.clone(), "nfo:Document").with_url("file:///doc.txt"),
                TIMEOUT,
            )
            .unwrap();
        fixture
            .update(&query::insert_data(
                "urn:test:doc",
                &[
                    ("a", "nfo:Document".to_string()),
                    ("nie:url", query::literal("file:///doc.txt")),
                ],
            ))
            .unwrap();
        let created = pending.wait().await.unwrap();
        assert_eq!(created.kind, ChangeKind::Created);
        assert_eq!(created.subject_uri.as_deref(), Some("urn:test:doc"));
        assert_eq!(store.resource_id_by_url("file:///doc.txt").unwrap(), created.subject_id);

        let pending = correlator
            .arm(ResourceDeleted::new(created.subject_id), TIMEOUT)
            .unwrap();
        fixture
            .update(&query::delete_resource("urn:test:doc"))
            .unwrap();
        let deleted = pending.wait().await.unwrap();
        assert_eq!(deleted.kind, ChangeKind::Deleted);
        assert_eq!(deleted.subject_id, created.subject_id);
    }

    async fn property_changed(fixture: &dyn StoreFixture) {
        fixture
            .update("INSERT DATA { <urn:test:song> a nmm:MusicPiece ; nie:title \"Old\" }")
            .unwrap();
        let store = fixture.store();
        let id = store.resource_id_by_uri("<urn:test:song>").unwrap();
        // Let notifications of the setup insert drain first
        tokio::time::sleep(Duration::from_millis(50)).await;

        let correlator = fixture.correlator();
        let predicate = PropertyUpdated::new(store.as_ref(), id, "nie:title").unwrap();
        let pending = correlator.arm(predicate, TIMEOUT).unwrap();
        fixture
            .update("INSERT DATA { <urn:test:song> nie:title \"New\" }")
            .unwrap();

        let event = pending.wait().await.unwrap();
        assert_eq!(event.subject_id, id);
    }

    async fn required_property(fixture: &dyn StoreFixture) {
        // Make the property known before the wait resolves its id
        fixture
            .update("INSERT DATA { <urn:test:other> nie:title \"x\" }")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let correlator = fixture.correlator();
        let predicate = ResourceCreated::new(fixture.store(), "nfo:Document")
            .with_required_property("nie:title")
            .unwrap();
        let pending = correlator.arm(predicate, TIMEOUT).unwrap();

        fixture
            .update("INSERT DATA { <urn:test:late> a nfo:Document }")
            .unwrap();
        fixture
            .update("INSERT DATA { <urn:test:late> nie:title \"Late\" }")
            .unwrap();

        let event = pending.wait().await.unwrap();
        assert_eq!(event.subject_uri.as_deref(), Some("urn:test:late"));
    }

    #[tokio::test]
    async fn test_direct_created_then_deleted() {
        created_then_deleted(&DirectFixture::new()).await;
    }

    #[tokio::test]
    async fn test_bus_created_then_deleted() {
        created_then_deleted(&BusFixture::new()).await;
    }

    #[tokio::test]
    async fn test_direct_property_changed() {
        property_changed(&DirectFixture::new()).await;
    }

    #[tokio::test]
    async fn test_bus_property_changed() {
        property_changed(&BusFixture::new()).await;
    }

    #[tokio::test]
    async fn test_direct_required_property() {
        required_property(&DirectFixture::new()).await;
    }

    #[tokio::test]
    async fn test_bus_required_property() {
        required_property(&BusFixture::new()).await;
    }

    #[tokio::test]
    async fn test_bus_delivery_is_asynchronous() {
        let fixture = BusFixture::new();
        let correlator = fixture.correlator();
        let pending = correlator
            .arm(
                ResourceCreated::new(fixture.store(), "nfo:Document"),
                TIMEOUT,
            )
            .unwrap();

        fixture
            .update("INSERT DATA { <urn:test:a> a nfo:Document }")
            .unwrap();
        assert!(pending.outcome().is_pending());

        assert!(pending.wait().await.is_ok());
    }
}
