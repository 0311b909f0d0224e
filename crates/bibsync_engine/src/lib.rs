//! # Bibsync Engine
//!
//! Sync engine reconciling a local bibliographic library store with the
//! Zotero Web API.
//!
//! This crate provides:
//! - Sync steps (version diffs, fetches, deletions, writes, settings, uploads)
//! - The [`SyncController`] running a full pass per library
//! - The [`ApiClient`] seam with a `reqwest` client and a mock
//! - The [`WebDavTransport`] seam for attachment files kept on WebDAV
//!
//! ## Architecture
//!
//! Every remote object carries a version; every library keeps one cursor per
//! object type. A pass per library:
//! 1. Pulls settings, then version diffs and objects per type
//! 2. Applies remote deletions, surfacing conflicts with local edits
//! 3. Pushes local deletions, writes and settings, chaining the library version
//! 4. Uploads pending attachment files
//!
//! ## Key Invariants
//!
//! - A cursor only moves forward, and only after the data it covers is stored
//! - Every write carries the last known library version as a precondition
//! - A version change mid-pass restarts the pass, a bounded number of times
//! - Each step commits its local writes atomically
//! - One file hash is transferred at most once at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod actions;
mod config;
mod context;
mod controller;
mod error;
mod http;
mod transport;
mod webdav;

pub use config::{RetryConfig, SyncConfig};
pub use context::SyncContext;
pub use controller::{LibraryReport, SyncController, SyncReport, SyncState, SyncStats};
pub use error::{ErrorScope, PreconditionErrorType, SyncError, SyncResult};
pub use http::ZoteroApiClient;
pub use transport::{check_status, ApiClient, ByteStream, MockApiClient};
pub use webdav::{MockWebDav, WebDavCall, WebDavTransport, WebDavUploadPrep, WebDavUploadResult};
