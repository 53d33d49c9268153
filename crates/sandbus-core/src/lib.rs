//! # sandbus-core - Core Domain Types
//!
//! Foundation crate for the sandbus harness. Provides the error taxonomy,
//! change-notification events, daemon/process record types and logging setup.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, thiserror, tracing).
//!
//! ## Public API
//!
//! ### Events (`events`)
//! - [`ChangeEvent`] - One created/updated/deleted notification
//! - [`NotifierBatch`] - An ordered delivery of events sharing an origin
//! - [`ResourceId`] - Opaque numeric resource identifier
//!
//! ### Domain Types (`types`)
//! - [`DaemonState`] - Bus daemon lifecycle state
//! - [`DaemonSession`] - Handshake result (address + pid)
//! - [`ServiceProcessRecord`] - Bus name to pid mapping
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Error enum with `fatal` vs `benign teardown` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//!
//! ## Prelude
//!
//! ```rust
//! use sandbus_core::prelude::*;
//! ```

pub mod error;
pub mod events;
pub mod logging;
pub mod prelude;
pub mod types;

pub use error::{Error, Result};
pub use events::{ChangeEvent, ChangeKind, NotifierBatch, ResourceId};
pub use types::{DaemonSession, DaemonState, ServiceProcessRecord};
