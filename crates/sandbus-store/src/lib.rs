//! # sandbus-store - Event Correlation
//!
//! Turns the store's push-based change notifications into blocking,
//! timeout-bounded waits usable from tests.
//!
//! The store itself is an external collaborator reached through
//! [`StoreClient`]; notifications arrive through a [`Notifier`].
//!
//! ## Public API
//!
//! ### Correlation
//! - [`EventCorrelator`] - Arm a wait, then [`PendingWait::wait`] for its match
//! - [`WaitOutcome`] - Matched, timed out or cancelled
//!
//! ### Predicates
//! - [`ResourceCreated`], [`PropertyUpdated`], [`ResourceDeleted`]
//! - [`matching()`] - Predicate from a closure
//!
//! ### Store Access
//! - [`StoreClient`] - Synchronous query/update
//! - [`StoreExt`] - `count_instances`, `resource_id_by_uri`, `resource_id_by_url`, `ask`
//! - [`NotifierHub`] - Subscription registry, [`coalesce_events()`]
//!
//! ### Test Support (`test-helpers` feature)
//! - `MemoryStore` - In-memory store understanding the harness's SPARQL
//! - `StoreFixture` with `DirectFixture` / `BusFixture`

pub mod client;
pub mod correlator;
#[cfg(any(test, feature = "test-helpers"))]
pub mod fixtures;
#[cfg(any(test, feature = "test-helpers"))]
pub mod memory;
pub mod notifier;
pub mod predicates;
pub mod query;

pub use client::{Row, StoreClient, StoreExt};
pub use correlator::{CancelHandle, EventCorrelator, PendingWait, WaitOutcome};
#[cfg(any(test, feature = "test-helpers"))]
pub use fixtures::{BusFixture, DirectFixture, StoreFixture};
#[cfg(any(test, feature = "test-helpers"))]
pub use memory::MemoryStore;
pub use notifier::{coalesce_events, Notifier, NotifierCallback, NotifierHub, SubscriptionId};
pub use predicates::{matching, EventPredicate, FnPredicate, PropertyUpdated, ResourceCreated, ResourceDeleted};
