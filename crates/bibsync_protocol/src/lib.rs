//! # Bibsync Protocol
//!
//! Wire types for synchronizing a local library store with the Zotero Web API v3.
//!
//! This crate provides:
//! - `LibraryIdentifier` for personal and group version namespaces
//! - `SyncObject` with its per-type behaviour table (`ObjectTraits`)
//! - `Versions` cursors and the `Last-Modified-Version` header contract
//! - `ApiRequest` builders for every endpoint the sync engine talks to
//! - Response parsing (`UpdatesResponse`, `DeletionsResponse`, object bodies)
//! - Schema validation for item payloads
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod error;
mod library;
mod object;
mod request;
mod response;
mod schema;
mod versions;

pub use conflict::Conflict;
pub use error::{ProtocolError, ProtocolResult};
pub use library::{CustomLibraryKind, LibraryIdentifier};
pub use object::{ObjectKind, ObjectTraits, ParseFn, SyncObject, SyncType};
pub use request::{
    ApiRequest, Endpoint, FilePart, Method, MultipartForm, RequestBody, API_VERSION,
};
pub use response::{
    parse_object, parse_objects, ApiResponse, AuthorizeUploadResponse, DeletionsResponse,
    FailedUpdate, GroupResponse, ObjectParseError, ObjectResponse, ResponseHeaders,
    SettingResponse, UpdatesResponse, ANNOTATION_POSITION_TOO_LONG,
};
pub use schema::{BuiltinSchema, FieldIssue, Schema};
pub use versions::{UpdateVersionType, Versions};
