//! Update submission steps.

use crate::context::SyncContext;
use crate::error::{PreconditionErrorType, SyncError, SyncResult};
use bibsync_protocol::{
    parse_object, ApiRequest, FailedUpdate, LibraryIdentifier, SyncObject, UpdateVersionType,
    UpdatesResponse, ANNOTATION_POSITION_TOO_LONG,
};
use bibsync_store::{Files, LocalStore, WriteRequest};
use serde_json::{Map, Value};

/// Result of a write batch.
///
/// The local transaction has been committed even when `error` is set; the
/// error describes entries the server rejected.
#[derive(Debug)]
pub struct SubmitUpdateResult {
    /// New remote library version.
    pub version: u64,
    /// Non-fatal problem with part of the batch.
    pub error: Option<SyncError>,
}

/// Submits a batch of changed objects of one type.
#[derive(Debug, Clone)]
pub struct SubmitUpdate {
    /// Objects in API shape, each with `key` and `version`.
    pub parameters: Vec<Value>,
    /// Version the batch is based on; `None` skips the precondition.
    pub since_version: Option<u64>,
    /// Object type.
    pub object: SyncObject,
    /// Library.
    pub library_id: LibraryIdentifier,
    /// Whether the new version becomes the library cursor of `object`.
    pub update_library_version: bool,
}

#[derive(Default)]
struct Partition {
    requests: Vec<WriteRequest>,
    conflicts: Vec<String>,
    split: Vec<String>,
    failures: Vec<FailedUpdate>,
}

impl SubmitUpdate {
    fn key_at(&self, index: usize) -> Option<String> {
        self.parameters
            .get(index)
            .and_then(|parameters| parameters.get("key"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<SubmitUpdateResult> {
        let kind = self
            .object
            .kind()
            .ok_or(SyncError::UnsupportedObject(self.object))?;

        let request = ApiRequest::updates(
            self.library_id,
            ctx.user_id(),
            self.object,
            self.parameters.clone(),
            self.since_version,
        );
        let response = ctx.send(request).await?;
        let version = response.version();
        let updates = UpdatesResponse::parse(&response.json_value()?)?;
        let attempted_at = ctx.now();

        let mut partition = Partition::default();

        let unchanged: Vec<String> = updates.unchanged.values().cloned().collect();
        let mut synced = unchanged;
        let mut resync = Vec::new();

        for (index, json) in &updates.successful {
            match parse_object(self.object, json, ctx.schema.as_ref()) {
                Ok(object) => {
                    let path = Files::json_cache(self.library_id, kind, &object.key);
                    ctx.files.write(&path, json.to_string().as_bytes())?;
                    partition.requests.push(WriteRequest::UpdateFromResponse {
                        library_id: self.library_id,
                        object,
                    });
                }
                Err(error) => {
                    let key = error.key.clone().or_else(|| self.key_at(*index));
                    tracing::warn!(
                        library = %self.library_id,
                        key = ?key,
                        message = %error.message,
                        "accepted object could not be parsed"
                    );
                    if let Some(key) = key {
                        synced.push(key.clone());
                        resync.push(key);
                    }
                }
            }
        }

        for failure in updates.failed {
            let key = failure.key.clone().or_else(|| self.key_at(failure.index));
            match (failure.code, key) {
                (412, Some(key)) => partition.conflicts.push(key),
                (400, Some(key)) if failure.message.contains(ANNOTATION_POSITION_TOO_LONG) => {
                    partition.split.push(key)
                }
                _ => {
                    tracing::error!(
                        library = %self.library_id,
                        object = %self.object,
                        code = failure.code,
                        message = %failure.message,
                        "object rejected"
                    );
                    partition.failures.push(failure);
                }
            }
        }

        if !synced.is_empty() {
            partition.requests.push(WriteRequest::MarkSynced {
                library_id: self.library_id,
                kind,
                keys: synced,
                version,
            });
        }
        resync.extend(partition.conflicts.iter().cloned());
        if !resync.is_empty() {
            partition.requests.push(WriteRequest::MarkForResync {
                library_id: self.library_id,
                kind,
                keys: resync,
                attempted_at,
            });
        }
        if !partition.split.is_empty() {
            partition.requests.push(WriteRequest::SplitAnnotations {
                library_id: self.library_id,
                keys: partition.split.clone(),
                attempted_at,
            });
        }
        if self.update_library_version {
            partition.requests.push(WriteRequest::SetVersion {
                library_id: self.library_id,
                version_type: UpdateVersionType::Object(self.object),
                version,
            });
        }

        if !partition.requests.is_empty() {
            ctx.store.perform_batch(partition.requests)?;
        }

        let error = if !partition.conflicts.is_empty() {
            tracing::info!(
                library = %self.library_id,
                keys = ?partition.conflicts,
                "objects changed remotely, marked for resync"
            );
            Some(SyncError::Precondition(PreconditionErrorType::ObjectConflict))
        } else if !partition.split.is_empty() {
            Some(SyncError::AnnotationNeededSplitting { keys: partition.split })
        } else if !partition.failures.is_empty() {
            Some(SyncError::SubmissionFailed {
                failures: partition.failures,
            })
        } else {
            None
        };

        tracing::debug!(
            library = %self.library_id,
            object = %self.object,
            count = self.parameters.len(),
            version,
            "write batch submitted"
        );
        Ok(SubmitUpdateResult { version, error })
    }
}

/// Submits locally changed settings.
#[derive(Debug, Clone)]
pub struct SubmitSettings {
    /// Library.
    pub library_id: LibraryIdentifier,
    /// Changed settings.
    pub settings: Vec<(String, Value)>,
    /// Version the change is based on.
    pub since_version: Option<u64>,
}

impl SubmitSettings {
    /// Runs the step and returns the new settings version.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<u64> {
        let body: Map<String, Value> = self
            .settings
            .iter()
            .map(|(key, value)| (key.clone(), serde_json::json!({ "value": value })))
            .collect();
        let request = ApiRequest::submit_settings(
            self.library_id,
            ctx.user_id(),
            Value::Object(body),
            self.since_version,
        );
        let version = ctx.send(request).await?.version();

        ctx.store.perform_batch(vec![
            WriteRequest::MarkSettingsSynced {
                library_id: self.library_id,
                keys: self.settings.iter().map(|(key, _)| key.clone()).collect(),
                version,
            },
            WriteRequest::SetVersion {
                library_id: self.library_id,
                version_type: UpdateVersionType::Object(SyncObject::Settings),
                version,
            },
        ])?;
        Ok(version)
    }
}
