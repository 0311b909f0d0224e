//! Error types for the sync engine.

use bibsync_protocol::{FailedUpdate, LibraryIdentifier, ProtocolError, SyncObject};
use bibsync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Kinds of `412 Precondition Failed` answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionErrorType {
    /// One object of a write batch changed remotely.
    ObjectConflict,
    /// The library changed remotely since the version the request was based on.
    LibraryConflict,
}

/// How far the effect of an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorScope {
    /// Only the affected objects; the library pass continues.
    Object,
    /// The current library pass is aborted; other libraries continue.
    Library,
    /// The whole sync is aborted.
    Sync,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The API answered with an unexpected status.
    #[error("http error {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// A payload could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The local store or file storage failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The remote library version differs from the version the pass is based on.
    #[error("remote version of {0} changed during sync")]
    VersionMismatch(LibraryIdentifier),

    /// The API rejected a write because of a version precondition.
    #[error("precondition failed: {0:?}")]
    Precondition(PreconditionErrorType),

    /// Annotations were rejected for their position size and were split locally.
    #[error("{} annotation(s) needed splitting", keys.len())]
    AnnotationNeededSplitting {
        /// Keys of the rejected annotations.
        keys: Vec<String>,
    },

    /// Some objects of a write batch were rejected.
    #[error("{} object(s) failed to submit", failures.len())]
    SubmissionFailed {
        /// Rejected entries.
        failures: Vec<FailedUpdate>,
    },

    /// The attachment item has metadata changes that were not submitted yet.
    #[error("attachment item {key} has unsubmitted changes")]
    AttachmentItemNotSubmitted {
        /// Attachment item key.
        key: String,
    },

    /// The attachment file is missing or empty.
    #[error("attachment file of {key} is missing")]
    AttachmentMissing {
        /// Attachment item key.
        key: String,
    },

    /// The remote already has the attachment file.
    #[error("attachment already uploaded")]
    AttachmentAlreadyUploaded,

    /// The remote has no file for the attachment.
    #[error("attachment file of {key} is missing remotely")]
    AttachmentMissingRemotely {
        /// Attachment item key.
        key: String,
    },

    /// The remote file could not be downloaded.
    #[error("attachment file of {key} was not downloaded")]
    FileNotDownloaded {
        /// Attachment item key.
        key: String,
    },

    /// The item does not exist locally or is not an attachment.
    #[error("item {key} is not an attachment")]
    ItemNotAttachment {
        /// Item key.
        key: String,
    },

    /// The attachment is a link, not a file.
    #[error("attachment {key} has no file ({link_mode})")]
    IncorrectAttachmentType {
        /// Attachment item key.
        key: String,
        /// Link mode of the attachment.
        link_mode: String,
    },

    /// The attachment file is not stored by the API.
    #[error("attachment {key} has link mode {link_mode}")]
    IncorrectLinkType {
        /// Attachment item key.
        key: String,
        /// Link mode of the attachment.
        link_mode: String,
    },

    /// An attachment upload failed.
    #[error("attachment upload failed: {source}")]
    Upload {
        /// Underlying failure.
        source: Box<SyncError>,
        /// Whether the failure happened before any remote mutation.
        failed_before_api_request: bool,
    },

    /// The WebDAV server failed.
    #[error("webdav error: {0}")]
    WebDav(String),

    /// The step does not support this object type.
    #[error("unsupported object: {0}")]
    UnsupportedObject(SyncObject),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// A sync is already running.
    #[error("sync already in progress")]
    SyncInProgress,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Wraps an attachment upload failure.
    pub fn upload(source: SyncError, failed_before_api_request: bool) -> Self {
        Self::Upload {
            source: Box::new(source),
            failed_before_api_request,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::Http { status, .. } => *status == 429 || *status >= 500,
            SyncError::Upload { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if the library pass must start over.
    pub fn restarts_library(&self) -> bool {
        matches!(
            self,
            SyncError::VersionMismatch(_)
                | SyncError::Precondition(PreconditionErrorType::LibraryConflict)
        )
    }

    /// Returns how far the effect of this error reaches.
    pub fn scope(&self) -> ErrorScope {
        match self {
            SyncError::Precondition(PreconditionErrorType::ObjectConflict)
            | SyncError::AnnotationNeededSplitting { .. }
            | SyncError::SubmissionFailed { .. }
            | SyncError::AttachmentItemNotSubmitted { .. }
            | SyncError::AttachmentMissing { .. }
            | SyncError::AttachmentAlreadyUploaded
            | SyncError::AttachmentMissingRemotely { .. }
            | SyncError::FileNotDownloaded { .. }
            | SyncError::ItemNotAttachment { .. }
            | SyncError::IncorrectAttachmentType { .. }
            | SyncError::IncorrectLinkType { .. }
            | SyncError::WebDav(_) => ErrorScope::Object,
            SyncError::Upload { source, .. } => match source.as_ref() {
                SyncError::Store(_) => ErrorScope::Library,
                other if other.scope() == ErrorScope::Sync => ErrorScope::Sync,
                _ => ErrorScope::Object,
            },
            SyncError::Http { status: 401 | 403, .. }
            | SyncError::Cancelled
            | SyncError::SyncInProgress => ErrorScope::Sync,
            _ => ErrorScope::Library,
        }
    }
}
