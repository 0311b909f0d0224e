//! Sync steps.
//!
//! Each step makes at most one remote round trip and commits its local
//! writes in one transaction (or one ordered batch). Steps never retry on
//! their own; the [`SyncController`](crate::SyncController) decides what
//! happens after a failure.

mod bookkeeping;
mod deletions;
mod fetch;
mod revert;
mod settings;
mod updates;
mod upload;
mod versions;

pub use bookkeeping::{
    DeleteBatch, DeleteGroup, LibraryData, LoadLibraryData, LoadUploadData, MarkChangesAsResolved,
    MarkForResync, MarkGroupAsLocalOnly, StoreVersion, WriteBatch,
};
pub use deletions::{
    DeletionsResult, LoadDeletions, LoadedDeletions, RestoreDeletions, SubmitDeletion,
    SubmitDeletionResult, SyncDeletions,
};
pub use fetch::{FetchAndStoreGroup, FetchAndStoreObjects, FetchResult};
pub use revert::{RevertLibraryFiles, RevertLibraryUpdates, RevertedFiles};
pub use settings::{SettingsResult, SyncSettings};
pub use updates::{SubmitSettings, SubmitUpdate, SubmitUpdateResult};
pub use upload::{AttachmentBackend, AttachmentUpload, FixUpload, UploadAttachment, UploadOutcome};
pub use versions::{GroupVersionsResult, SyncGroupVersions, SyncVersions, VersionsResult};
