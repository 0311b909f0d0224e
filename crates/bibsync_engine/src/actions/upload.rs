//! Attachment upload step.
//!
//! Two backends store attachment files:
//! - ZFS (the Zotero file storage): authorize, upload to a pre-signed target, register
//! - WebDAV: prepare, upload, finish, then submit the new `md5`/`mtime` as an item update
//!
//! Byte transfers are serialized per file hash. A second upload of the same
//! hash waits for the first and then finds the file already stored.
//!
//! [`FixUpload`] repairs a pending attachment whose local file is gone by
//! downloading the remote copy.

use crate::actions::updates::SubmitUpdate;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::transport::check_status;
use crate::webdav::{WebDavTransport, WebDavUploadPrep, WebDavUploadResult};
use bibsync_protocol::{
    ApiRequest, AuthorizeUploadResponse, FilePart, LibraryIdentifier, MultipartForm, ObjectKind,
    SyncObject, UpdateVersionType,
};
use bibsync_store::{FileStorage, Files, LocalStore, WriteRequest};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// Where attachment files of a library are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentBackend {
    /// Zotero file storage.
    Zfs,
    /// A WebDAV server.
    WebDav,
}

/// A local attachment file waiting for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    /// Attachment item key.
    pub key: String,
    /// Library.
    pub library_id: LibraryIdentifier,
    /// File name.
    pub filename: String,
    /// MIME type.
    pub content_type: String,
    /// MD5 of the file.
    pub md5: String,
    /// Modification time in milliseconds.
    pub mtime: i64,
    /// File path in file storage.
    pub file: PathBuf,
    /// MD5 of the previously uploaded version, if any.
    pub old_md5: Option<String>,
}

/// Successful outcome of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The file was transferred and registered.
    Uploaded {
        /// Item version after registration.
        version: u64,
    },
    /// The remote already had the file.
    AlreadyUploaded,
}

/// Uploads one attachment file.
///
/// Errors are returned as [`SyncError::Upload`], telling whether anything
/// remote was touched before the failure.
#[derive(Debug, Clone)]
pub struct UploadAttachment {
    /// The file.
    pub upload: AttachmentUpload,
    /// Storage backend.
    pub backend: AttachmentBackend,
}

impl UploadAttachment {
    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<UploadOutcome> {
        let (item_version, filesize) = self
            .check_preconditions(ctx)
            .map_err(|error| SyncError::upload(error, true))?;

        let permit = ctx.acquire_upload(&self.upload.md5).await;
        let result = match self.backend {
            AttachmentBackend::Zfs => self.upload_to_zfs(ctx, filesize).await,
            AttachmentBackend::WebDav => self.upload_to_webdav(ctx, item_version).await,
        };
        drop(permit);

        match result {
            Ok(version) => {
                tracing::info!(key = %self.upload.key, version, "attachment uploaded");
                Ok(UploadOutcome::Uploaded { version })
            }
            Err((SyncError::AttachmentAlreadyUploaded, _)) => {
                tracing::debug!(key = %self.upload.key, "attachment already stored remotely");
                Ok(UploadOutcome::AlreadyUploaded)
            }
            Err((error, failed_before_api_request)) => {
                tracing::warn!(key = %self.upload.key, error = %error, "attachment upload failed");
                Err(SyncError::upload(error, failed_before_api_request))
            }
        }
    }

    fn check_preconditions<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<(u64, u64)> {
        let upload = &self.upload;
        let record = ctx.store.transaction(|coordinator| {
            Ok(coordinator.object(upload.library_id, ObjectKind::Item, &upload.key))
        })?;
        let record = record.ok_or_else(|| SyncError::AttachmentMissing { key: upload.key.clone() })?;
        if record.changed {
            return Err(SyncError::AttachmentItemNotSubmitted { key: upload.key.clone() });
        }
        let filesize = ctx.files.size(&upload.file);
        if filesize == 0 {
            return Err(SyncError::AttachmentMissing { key: upload.key.clone() });
        }
        Ok((record.version, filesize))
    }

    fn mark_uploaded<S: LocalStore>(&self, ctx: &SyncContext<S>, version: Option<u64>) -> SyncResult<()> {
        let mut requests = vec![WriteRequest::MarkAttachmentUploaded {
            library_id: self.upload.library_id,
            key: self.upload.key.clone(),
            version,
        }];
        if let Some(version) = version {
            requests.push(WriteRequest::SetVersion {
                library_id: self.upload.library_id,
                version_type: UpdateVersionType::Object(SyncObject::Item),
                version,
            });
        }
        ctx.store.perform_batch(requests)?;
        Ok(())
    }

    async fn upload_to_zfs<S: LocalStore>(
        &self,
        ctx: &SyncContext<S>,
        filesize: u64,
    ) -> Result<u64, (SyncError, bool)> {
        let upload = &self.upload;
        let authorize = ApiRequest::authorize_upload(
            upload.library_id,
            ctx.user_id(),
            &upload.key,
            &upload.filename,
            filesize,
            &upload.md5,
            upload.mtime,
            upload.old_md5.as_deref(),
        );
        let response = ctx.send(authorize).await.map_err(|error| (error, true))?;
        let version = response.version();
        let answer = response
            .json_value()
            .and_then(|json| AuthorizeUploadResponse::parse(&json))
            .map_err(|error| (SyncError::from(error), true))?;

        let (url, params, upload_key) = match answer {
            AuthorizeUploadResponse::Exists => {
                self.mark_uploaded(ctx, Some(version)).map_err(|error| (error, false))?;
                return Err((SyncError::AttachmentAlreadyUploaded, false));
            }
            AuthorizeUploadResponse::New {
                url,
                params,
                upload_key,
            } => (url, params, upload_key),
        };

        let bytes = ctx
            .files
            .read(&upload.file)
            .map_err(|error| (SyncError::from(error), true))?;
        let form = MultipartForm {
            params,
            file: FilePart {
                field: "file".into(),
                filename: upload.filename.clone(),
                mime_type: upload.content_type.clone(),
                bytes: Bytes::from(bytes),
            },
        };
        let response = ctx
            .api
            .upload(ApiRequest::file_upload(url), form)
            .await
            .and_then(check_status)
            .map_err(|error| (error, false))?;
        tracing::debug!(key = %upload.key, status = response.status, "file transferred");

        let register = ApiRequest::register_upload(
            upload.library_id,
            ctx.user_id(),
            &upload.key,
            &upload_key,
            upload.old_md5.as_deref(),
        );
        let version = ctx
            .send(register)
            .await
            .map_err(|error| (error, false))?
            .version();
        self.mark_uploaded(ctx, Some(version)).map_err(|error| (error, false))?;
        Ok(version)
    }

    async fn upload_to_webdav<S: LocalStore>(
        &self,
        ctx: &SyncContext<S>,
        item_version: u64,
    ) -> Result<u64, (SyncError, bool)> {
        let upload = &self.upload;
        let webdav: Arc<dyn WebDavTransport> = ctx
            .webdav
            .clone()
            .ok_or_else(|| (SyncError::WebDav("no WebDAV transport configured".into()), true))?;

        let prep = webdav
            .prepare_for_upload(&upload.key, &upload.md5, upload.mtime, upload.file.clone())
            .await
            .map_err(|error| (error, true))?;
        let (url, artifact) = match prep {
            WebDavUploadPrep::Exists => {
                self.mark_uploaded(ctx, None).map_err(|error| (error, false))?;
                return Err((SyncError::AttachmentAlreadyUploaded, false));
            }
            WebDavUploadPrep::New { url, file } => (url, file),
        };

        // Runs detached so the artifact is cleaned up even when the caller
        // stops waiting.
        let transfer = tokio::spawn(transfer_to_webdav(
            webdav,
            Arc::clone(&ctx.files),
            upload.key.clone(),
            upload.md5.clone(),
            upload.mtime,
            url,
            artifact,
        ));
        transfer
            .await
            .map_err(|error| (SyncError::WebDav(format!("upload task failed: {}", error)), false))?
            .map_err(|error| (error, false))?;

        let update = SubmitUpdate {
            parameters: vec![json!({
                "key": upload.key,
                "version": item_version,
                "md5": upload.md5,
                "mtime": upload.mtime,
            })],
            since_version: None,
            object: SyncObject::Item,
            library_id: upload.library_id,
            update_library_version: false,
        };
        let result = update.run(ctx).await.map_err(|error| (error, false))?;
        if let Some(error) = result.error {
            return Err((error, false));
        }
        self.mark_uploaded(ctx, Some(result.version)).map_err(|error| (error, false))?;
        Ok(result.version)
    }
}

/// Replaces a missing local attachment file with the remote one.
///
/// The attachment is marked uploaded and queued for a metadata refetch, so
/// its version and hash are taken from the remote on the next pass.
#[derive(Debug, Clone)]
pub struct FixUpload {
    /// Attachment item key.
    pub key: String,
    /// Library.
    pub library_id: LibraryIdentifier,
}

impl FixUpload {
    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<()> {
        let filename = self.check_attachment(ctx)?;
        tracing::info!(library = %self.library_id, key = %self.key, "downloading remote copy of attachment");

        let request = ApiRequest::download(self.library_id, ctx.user_id(), &self.key);
        let mut chunks = ctx.api.download(request).await.map_err(|error| match error {
            SyncError::Http { status: 404, .. } => SyncError::AttachmentMissingRemotely { key: self.key.clone() },
            other => other,
        })?;
        let mut bytes = Vec::new();
        while let Some(chunk) = chunks.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        if bytes.is_empty() {
            return Err(SyncError::FileNotDownloaded { key: self.key.clone() });
        }
        ctx.files
            .write(&Files::attachment_file(self.library_id, &self.key, &filename), &bytes)?;

        ctx.store.perform_batch(vec![
            WriteRequest::MarkAttachmentUploaded {
                library_id: self.library_id,
                key: self.key.clone(),
                version: None,
            },
            WriteRequest::MarkForResync {
                library_id: self.library_id,
                kind: ObjectKind::Item,
                keys: vec![self.key.clone()],
                attempted_at: ctx.now(),
            },
        ])?;
        Ok(())
    }

    /// Returns the file name of a stored attachment the remote has a file for.
    fn check_attachment<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<String> {
        let record = ctx.store.transaction(|coordinator| {
            Ok(coordinator.object(self.library_id, ObjectKind::Item, &self.key))
        })?;
        let not_attachment = || SyncError::ItemNotAttachment { key: self.key.clone() };
        let record = record.ok_or_else(not_attachment)?;
        if record.data.get("itemType").and_then(Value::as_str) != Some("attachment") {
            return Err(not_attachment());
        }

        match record.data.get("linkMode").and_then(Value::as_str).unwrap_or_default() {
            "imported_file" | "imported_url" => {}
            "linked_url" => {
                return Err(SyncError::IncorrectAttachmentType {
                    key: self.key.clone(),
                    link_mode: "linked_url".into(),
                })
            }
            other => {
                return Err(SyncError::IncorrectLinkType {
                    key: self.key.clone(),
                    link_mode: other.to_string(),
                })
            }
        }

        let attachment = record.attachment.ok_or_else(not_attachment)?;
        if attachment.md5.is_empty() {
            return Err(SyncError::AttachmentMissingRemotely { key: self.key.clone() });
        }
        Ok(attachment.filename)
    }
}

async fn transfer_to_webdav(
    webdav: Arc<dyn WebDavTransport>,
    files: Arc<dyn FileStorage>,
    key: String,
    md5: String,
    mtime: i64,
    url: String,
    artifact: PathBuf,
) -> SyncResult<()> {
    let uploaded = match files.read(&artifact) {
        Ok(bytes) => webdav.upload(&url, Bytes::from(bytes)).await,
        Err(error) => Err(error.into()),
    };

    match uploaded {
        Ok(()) => {
            let result = WebDavUploadResult::Success { md5, mtime, url };
            webdav.finish_upload(&key, result, Some(artifact)).await
        }
        Err(error) => {
            if let Err(cleanup) = webdav
                .finish_upload(&key, WebDavUploadResult::Failure, Some(artifact))
                .await
            {
                tracing::warn!(key = %key, error = %cleanup, "webdav cleanup failed");
            }
            Err(error)
        }
    }
}
