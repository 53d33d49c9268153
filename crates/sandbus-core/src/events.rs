//! Change-notification event definitions

use std::fmt;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────

/// Opaque numeric identifier the data service assigns to every resource
/// and property it knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct ResourceId(pub i64);

impl ResourceId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ResourceId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

// ─────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────

/// What happened to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Updated => write!(f, "updated"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// A single change notification
///
/// Immutable once delivered. `subject_uri` is only present when the
/// notifier was able to resolve it; predicates that need the URI (or the
/// class, URL, title) confirm it with a query instead.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub subject_id: ResourceId,
    #[serde(default)]
    pub subject_uri: Option<String>,
    #[serde(default)]
    pub property_id: Option<ResourceId>,
    #[serde(default)]
    pub graph: Option<String>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, subject_id: impl Into<ResourceId>) -> Self {
        Self {
            kind,
            subject_id: subject_id.into(),
            subject_uri: None,
            property_id: None,
            graph: None,
        }
    }

    pub fn created(subject_id: impl Into<ResourceId>) -> Self {
        Self::new(ChangeKind::Created, subject_id)
    }

    pub fn updated(subject_id: impl Into<ResourceId>) -> Self {
        Self::new(ChangeKind::Updated, subject_id)
    }

    pub fn deleted(subject_id: impl Into<ResourceId>) -> Self {
        Self::new(ChangeKind::Deleted, subject_id)
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.subject_uri = Some(uri.into());
        self
    }

    pub fn with_property(mut self, property_id: impl Into<ResourceId>) -> Self {
        self.property_id = Some(property_id.into());
        self
    }

    pub fn with_graph(mut self, graph: impl Into<String>) -> Self {
        self.graph = Some(graph.into());
        self
    }
}

/// One delivery from the notification stream: ordered events sharing a
/// service/graph origin
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NotifierBatch {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub graph: Option<String>,
    pub events: Vec<ChangeEvent>,
}

impl NotifierBatch {
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self {
            service: None,
            graph: None,
            events,
        }
    }

    pub fn from_origin(
        service: Option<String>,
        graph: Option<String>,
        events: Vec<ChangeEvent>,
    ) -> Self {
        Self {
            service,
            graph,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
