//! WebDAV attachment transport.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::PathBuf;

/// Answer of [`WebDavTransport::prepare_for_upload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebDavUploadPrep {
    /// The server already has this file version.
    Exists,
    /// The file must be uploaded.
    New {
        /// Upload target.
        url: String,
        /// Temporary artifact (zipped file) to upload, relative to file storage.
        file: PathBuf,
    },
}

/// Outcome of a WebDAV byte transfer, passed to [`WebDavTransport::finish_upload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebDavUploadResult {
    /// The file was stored.
    Success {
        /// MD5 of the uploaded file.
        md5: String,
        /// Modification time in milliseconds.
        mtime: i64,
        /// Upload target.
        url: String,
    },
    /// The transfer failed.
    Failure,
}

/// Transport for attachment files kept on a WebDAV server.
#[async_trait]
pub trait WebDavTransport: Send + Sync {
    /// Checks the remote file state and prepares the upload artifact.
    async fn prepare_for_upload(&self, key: &str, md5: &str, mtime: i64, file: PathBuf) -> SyncResult<WebDavUploadPrep>;

    /// Uploads the artifact.
    async fn upload(&self, url: &str, bytes: Bytes) -> SyncResult<()>;

    /// Writes the remote metadata after a transfer and removes the temporary artifact.
    async fn finish_upload(&self, key: &str, result: WebDavUploadResult, file: Option<PathBuf>) -> SyncResult<()>;
}

/// A recorded call to [`MockWebDav`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebDavCall {
    /// `prepare_for_upload`.
    Prepare(String),
    /// `upload`.
    Upload(String),
    /// `finish_upload`.
    Finish(String, WebDavUploadResult),
}

/// A mock WebDAV transport for testing.
#[derive(Debug, Default)]
pub struct MockWebDav {
    exists: Mutex<bool>,
    fail_upload: Mutex<bool>,
    fail_cleanup: Mutex<bool>,
    calls: Mutex<Vec<WebDavCall>>,
}

impl MockWebDav {
    /// Creates a mock that asks for every file to be uploaded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `prepare_for_upload` report existing files.
    pub fn set_exists(&self, exists: bool) {
        *self.exists.lock() = exists;
    }

    /// Makes `upload` fail.
    pub fn set_fail_upload(&self, fail: bool) {
        *self.fail_upload.lock() = fail;
    }

    /// Makes cleanup after a failed transfer fail.
    pub fn set_fail_cleanup(&self, fail: bool) {
        *self.fail_cleanup.lock() = fail;
    }

    /// Returns the recorded calls.
    pub fn calls(&self) -> Vec<WebDavCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl WebDavTransport for MockWebDav {
    async fn prepare_for_upload(&self, key: &str, _md5: &str, _mtime: i64, _file: PathBuf) -> SyncResult<WebDavUploadPrep> {
        self.calls.lock().push(WebDavCall::Prepare(key.to_string()));
        if *self.exists.lock() {
            return Ok(WebDavUploadPrep::Exists);
        }
        Ok(WebDavUploadPrep::New {
            url: format!("https://webdav.example.com/zotero/{}.zip", key),
            file: PathBuf::from("uploads").join(format!("{}.zip", key)),
        })
    }

    async fn upload(&self, url: &str, _bytes: Bytes) -> SyncResult<()> {
        self.calls.lock().push(WebDavCall::Upload(url.to_string()));
        if *self.fail_upload.lock() {
            return Err(SyncError::WebDav(format!("upload to {} failed", url)));
        }
        Ok(())
    }

    async fn finish_upload(&self, key: &str, result: WebDavUploadResult, _file: Option<PathBuf>) -> SyncResult<()> {
        let failed = result == WebDavUploadResult::Failure;
        self.calls.lock().push(WebDavCall::Finish(key.to_string(), result));
        if failed && *self.fail_cleanup.lock() {
            return Err(SyncError::WebDav("cleanup failed".into()));
        }
        Ok(())
    }
}
