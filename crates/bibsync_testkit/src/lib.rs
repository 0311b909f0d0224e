//! # Bibsync Testkit
//!
//! Test utilities for the sync engine.
//!
//! This crate provides:
//! - [`FakeZoteroServer`], an in-memory fake of the Web API implementing
//!   [`ApiClient`](bibsync_engine::ApiClient)
//! - [`SyncHarness`] wiring the fake, a memory store and file storage together
//! - Builders for object payloads in API shape
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bibsync_protocol::{LibraryIdentifier, ObjectKind, SyncType};
//! use bibsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn pulls_a_collection() {
//!     let harness = SyncHarness::new();
//!     harness.server.put_object(LibraryIdentifier::MY_LIBRARY, ObjectKind::Collection, "CCCC2345", collection_data("Reading"));
//!     harness.controller().sync(SyncType::Normal).await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod server;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::server::*;
}

pub use fixtures::*;
pub use generators::*;
pub use server::*;
