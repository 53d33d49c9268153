//! Event predicates for the correlator
//!
//! A notification carries little more than an opaque subject id, so the
//! class/URL/title of a created resource is confirmed with a read-only query
//! against the store. Predicates may keep state across batches (a creation
//! matched in one batch, its required property set in a later one).

use std::sync::Arc;

use sandbus_core::prelude::*;
use sandbus_core::{ChangeEvent, ChangeKind, ResourceId};

use crate::client::{StoreClient, StoreExt};
use crate::query::{self, ResourceFilter};

/// Decides whether an event completes a wait
pub trait EventPredicate: Send {
    /// Human-readable description used in timeout errors
    fn describe(&self) -> String;

    /// `Ok(Some(result))` completes the wait with `result`
    ///
    /// Errors are logged by the correlator and treated as a non-match.
    fn check(&mut self, event: &ChangeEvent) -> Result<Option<ChangeEvent>>;
}

impl EventPredicate for Box<dyn EventPredicate> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn check(&mut self, event: &ChangeEvent) -> Result<Option<ChangeEvent>> {
        (**self).check(event)
    }
}

// ─────────────────────────────────────────────────────────────────
// Closure predicate
// ─────────────────────────────────────────────────────────────────

pub struct FnPredicate<F> {
    description: String,
    f: F,
}

/// Predicate from a closure; the matching event itself completes the wait
pub fn matching<F>(description: impl Into<String>, f: F) -> FnPredicate<F>
where
    F: FnMut(&ChangeEvent) -> bool + Send,
{
    FnPredicate {
        description: description.into(),
        f,
    }
}

impl<F> EventPredicate for FnPredicate<F>
where
    F: FnMut(&ChangeEvent) -> bool + Send,
{
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn check(&mut self, event: &ChangeEvent) -> Result<Option<ChangeEvent>> {
        Ok((self.f)(event).then(|| event.clone()))
    }
}

// ─────────────────────────────────────────────────────────────────
// Resource created
// ─────────────────────────────────────────────────────────────────

/// A resource of `class` (optionally with URL and/or title) was created
///
/// With a required property the wait completes only once that property was
/// also set on the created resource. The result is the creation event with
/// `subject_uri` set to the confirmed URN.
pub struct ResourceCreated {
    store: Arc<dyn StoreClient>,
    class: String,
    filter: ResourceFilter,
    required_property: Option<(String, ResourceId)>,
    matched: Option<ChangeEvent>,
}

impl ResourceCreated {
    pub fn new(store: Arc<dyn StoreClient>, class: impl Into<String>) -> Self {
        Self {
            store,
            class: class.into(),
            filter: ResourceFilter::default(),
            required_property: None,
            matched: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.filter.url = Some(url.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.filter.title = Some(title.into());
        self
    }

    /// Also wait for `property` to be set; resolves its id now
    pub fn with_required_property(mut self, property: impl Into<String>) -> Result<Self> {
        let property = property.into();
        let id = self.store.resource_id_by_uri(&property)?;
        debug!("Required property {} id {}", property, id);
        self.required_property = Some((property, id));
        Ok(self)
    }

    fn confirm(&self, event: &ChangeEvent) -> Result<Option<String>> {
        let sparql = query::confirm_resource_query(&self.class, &self.filter, event.subject_id);
        let rows = self.store.query(&sparql)?;
        Ok(rows.into_iter().next().and_then(|row| row.into_iter().next()))
    }
}

impl EventPredicate for ResourceCreated {
    fn describe(&self) -> String {
        let mut text = format!("creation of {}", self.class);
        if let Some(url) = &self.filter.url {
            text.push_str(&format!(" with url {:?}", url));
        }
        if let Some(title) = &self.filter.title {
            text.push_str(&format!(" with title {:?}", title));
        }
        if let Some((property, _)) = &self.required_property {
            text.push_str(&format!(" having {}", property));
        }
        text
    }

    fn check(&mut self, event: &ChangeEvent) -> Result<Option<ChangeEvent>> {
        if self.matched.is_none() && event.kind == ChangeKind::Created {
            if let Some(urn) = self.confirm(event)? {
                debug!("Matched creation of resource {} ({})", urn, event.subject_id);
                let matched = event.clone().with_uri(urn);
                if self.required_property.is_none() {
                    return Ok(Some(matched));
                }
                self.matched = Some(matched);
            }
        }

        match (&self.matched, &self.required_property) {
            (Some(matched), Some((property, property_id)))
                if event.subject_id == matched.subject_id
                    && event.property_id == Some(*property_id)
                    && event.kind != ChangeKind::Deleted =>
            {
                debug!("Matched {} {}", matched.subject_id, property);
                Ok(Some(matched.clone()))
            }
            _ => Ok(None),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Property updated
// ─────────────────────────────────────────────────────────────────

/// `property` of resource `subject_id` was inserted or updated
pub struct PropertyUpdated {
    subject_id: ResourceId,
    property: String,
    property_id: ResourceId,
}

impl PropertyUpdated {
    /// Resolves the property's id with `store`
    pub fn new(
        store: &dyn StoreClient,
        subject_id: ResourceId,
        property: impl Into<String>,
    ) -> Result<Self> {
        let property = property.into();
        let property_id = store.resource_id_by_uri(&property)?;
        Ok(Self {
            subject_id,
            property,
            property_id,
        })
    }
}

impl EventPredicate for PropertyUpdated {
    fn describe(&self) -> String {
        format!("update of {} on resource {}", self.property, self.subject_id)
    }

    fn check(&mut self, event: &ChangeEvent) -> Result<Option<ChangeEvent>> {
        let hit = matches!(event.kind, ChangeKind::Created | ChangeKind::Updated)
            && event.subject_id == self.subject_id
            && event.property_id == Some(self.property_id);
        Ok(hit.then(|| event.clone()))
    }
}

// ─────────────────────────────────────────────────────────────────
// Resource deleted
// ─────────────────────────────────────────────────────────────────

/// Resource `subject_id` was deleted
pub struct ResourceDeleted {
    subject_id: ResourceId,
}

impl ResourceDeleted {
    pub fn new(subject_id: ResourceId) -> Self {
        Self { subject_id }
    }
}

impl EventPredicate for ResourceDeleted {
    fn describe(&self) -> String {
        format!("deletion of resource {}", self.subject_id)
    }

    fn check(&mut self, event: &ChangeEvent) -> Result<Option<ChangeEvent>> {
        let hit = event.kind == ChangeKind::Deleted && event.subject_id == self.subject_id;
        Ok(hit.then(|| event.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn store_with_document() -> (Arc<MemoryStore>, ResourceId) {
        let store = Arc::new(MemoryStore::new());
        store
            .update(
                "INSERT DATA { <urn:doc:1> a nfo:Document ; nie:url \"file:///a.txt\" ; \
                 nie:title \"A\" }",
            )
            .unwrap();
        let id = store.resource_id_by_url("file:///a.txt").unwrap();
        (store, id)
    }

    #[test]
    fn test_created_confirms_class_and_url() {
        let (store, id) = store_with_document();
        let mut predicate = ResourceCreated::new(store, "nfo:Document").with_url("file:///a.txt");

        let matched = predicate.check(&ChangeEvent::created(id)).unwrap();
        let matched = matched.expect("creation should match");
        assert_eq!(matched.kind, ChangeKind::Created);
        assert_eq!(matched.subject_uri.as_deref(), Some("urn:doc:1"));
    }

    #[test]
    fn test_created_rejects_other_url() {
        let (store, id) = store_with_document();
        let mut predicate = ResourceCreated::new(store, "nfo:Document").with_url("file:///b.txt");
        assert!(predicate.check(&ChangeEvent::created(id)).unwrap().is_none());
    }

    #[test]
    fn test_created_ignores_updates() {
        let (store, id) = store_with_document();
        let mut predicate = ResourceCreated::new(store, "nfo:Document");
        assert!(predicate.check(&ChangeEvent::updated(id)).unwrap().is_none());
    }

    #[test]
    fn test_created_with_required_property_spans_events() {
        let (store, id) = store_with_document();
        let title_id = store.resource_id_by_uri("nie:title").unwrap();
        let mut predicate = ResourceCreated::new(store, "nfo:Document")
            .with_required_property("nie:title")
            .unwrap();

        assert!(predicate.check(&ChangeEvent::created(id)).unwrap().is_none());
        assert!(predicate
            .check(&ChangeEvent::updated(ResourceId(id.get() + 100)).with_property(title_id))
            .unwrap()
            .is_none());

        let matched = predicate
            .check(&ChangeEvent::updated(id).with_property(title_id))
            .unwrap()
            .expect("property should complete the match");
        assert_eq!(matched.kind, ChangeKind::Created);
        assert_eq!(matched.subject_id, id);
    }

    #[test]
    fn test_unknown_required_property_is_error() {
        let store = Arc::new(MemoryStore::new());
        assert!(ResourceCreated::new(store, "nfo:Document")
            .with_required_property("nie:nonexistent")
            .is_err());
    }

    #[test]
    fn test_property_updated() {
        let (store, id) = store_with_document();
        let title_id = store.resource_id_by_uri("nie:title").unwrap();
        let mut predicate = PropertyUpdated::new(store.as_ref(), id, "nie:title").unwrap();

        assert!(predicate.check(&ChangeEvent::updated(id)).unwrap().is_none());
        assert!(predicate
            .check(&ChangeEvent::deleted(id).with_property(title_id))
            .unwrap()
            .is_none());
        assert!(predicate
            .check(&ChangeEvent::updated(id).with_property(title_id))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_deleted() {
        let mut predicate = ResourceDeleted::new(ResourceId(4));
        assert!(predicate.check(&ChangeEvent::created(4)).unwrap().is_none());
        assert!(predicate.check(&ChangeEvent::deleted(5)).unwrap().is_none());
        assert!(predicate.check(&ChangeEvent::deleted(4)).unwrap().is_some());
        assert_eq!(predicate.describe(), "deletion of resource 4");
    }

    #[test]
    fn test_describe_created() {
        let store = Arc::new(MemoryStore::new());
        let predicate = ResourceCreated::new(store, "nmm:MusicPiece")
            .with_url("file:///song.mp3")
            .with_title("Song");
        assert_eq!(
            predicate.describe(),
            "creation of nmm:MusicPiece with url \"file:///song.mp3\" with title \"Song\""
        );
    }
}
