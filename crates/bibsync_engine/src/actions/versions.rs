//! Version diff steps.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use bibsync_protocol::{
    ApiRequest, LibraryIdentifier, ObjectKind, ObjectTraits, SyncObject, SyncType,
};
use bibsync_store::{Coordinator, LocalStore, ObjectRecord, ObjectSyncState, WriteRequest};
use std::collections::{BTreeMap, BTreeSet};

/// Result of a version diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionsResult {
    /// Remote library version the diff is based on.
    pub version: u64,
    /// Keys that must be fetched, sorted.
    pub changed: Vec<String>,
}

/// Lists the objects of one type that changed remotely since a version.
#[derive(Debug, Clone)]
pub struct SyncVersions {
    /// Object type.
    pub object: SyncObject,
    /// Library.
    pub library_id: LibraryIdentifier,
    /// Local cursor of the object type.
    pub since_version: Option<u64>,
    /// Remote library version observed earlier in this pass.
    pub current_version: Option<u64>,
    /// Sync type.
    pub sync_type: SyncType,
    /// Whether to ask the remote at all.
    pub check_remote: bool,
}

impl SyncVersions {
    /// Runs the diff.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<VersionsResult> {
        let traits = self.object.traits();
        let kind = traits.kind.ok_or(SyncError::UnsupportedObject(self.object))?;
        let now = ctx.now();

        if !self.check_remote && self.sync_type != SyncType::Full {
            let changed = ctx.store.transaction(|coordinator| {
                Ok(self.out_of_sync(ctx, coordinator, kind, traits, now))
            })?;
            let version = self.current_version.or(self.since_version).unwrap_or(0);
            tracing::debug!(
                library = %self.library_id,
                object = %self.object,
                count = changed.len(),
                "versions from local bookkeeping"
            );
            return Ok(VersionsResult {
                version,
                changed: changed.into_iter().collect(),
            });
        }

        let since = match self.sync_type {
            SyncType::Full => None,
            _ => self.since_version,
        };
        let request = ApiRequest::versions(self.library_id, ctx.user_id(), self.object, since);
        let response = ctx.send(request).await?;
        let version = response.version();

        if let Some(current) = self.current_version {
            if current != version {
                tracing::info!(library = %self.library_id, current, version, "library version changed during versions diff");
                return Err(SyncError::VersionMismatch(self.library_id));
            }
        }

        let remote: BTreeMap<String, u64> = response.decode()?;

        let changed = ctx.store.transaction(|coordinator| {
            let mut changed = BTreeSet::new();

            if self.sync_type == SyncType::Full {
                changed.extend(remote.keys().cloned());

                let missing: Vec<String> = coordinator
                    .objects(self.library_id, kind)
                    .into_iter()
                    .filter(|record| {
                        record.matches_trash(traits.trash)
                            && record.sync_state == ObjectSyncState::Synced
                            && !record.is_pending_submission()
                            && !remote.contains_key(&record.key)
                    })
                    .map(|record| record.key)
                    .collect();
                if !missing.is_empty() {
                    tracing::info!(
                        library = %self.library_id,
                        object = %self.object,
                        count = missing.len(),
                        "objects missing remotely, marking for submission"
                    );
                    coordinator.perform(WriteRequest::MarkChangedByUser {
                        library_id: self.library_id,
                        kind,
                        keys: missing,
                    })?;
                }
            } else {
                for (key, remote_version) in &remote {
                    let local_version = coordinator
                        .object(self.library_id, kind, key)
                        .map(|record| record.version);
                    match local_version {
                        Some(local) if local >= *remote_version => {}
                        _ => {
                            changed.insert(key.clone());
                        }
                    }
                }
                changed.extend(self.out_of_sync(ctx, coordinator, kind, traits, now));
            }

            Ok(changed)
        })?;

        tracing::debug!(
            library = %self.library_id,
            object = %self.object,
            version,
            count = changed.len(),
            "versions diff"
        );
        Ok(VersionsResult {
            version,
            changed: changed.into_iter().collect(),
        })
    }

    /// Objects marked for resync whose backoff has expired.
    fn out_of_sync<S: LocalStore>(
        &self,
        ctx: &SyncContext<S>,
        coordinator: &dyn Coordinator,
        kind: ObjectKind,
        traits: &ObjectTraits,
        now: u64,
    ) -> BTreeSet<String> {
        let ignore_delays = self.sync_type == SyncType::IgnoreIndividualDelays;
        coordinator
            .objects(self.library_id, kind)
            .into_iter()
            .filter(|record| record.sync_state == ObjectSyncState::Dirty && record.matches_trash(traits.trash))
            .filter(|record| ignore_delays || backoff_expired(ctx, record, now))
            .map(|record| record.key)
            .collect()
    }
}

fn backoff_expired<S: LocalStore>(ctx: &SyncContext<S>, record: &ObjectRecord, now: u64) -> bool {
    match record.last_sync_attempt {
        Some(attempt) => attempt + ctx.config.resync_delay(record.sync_retries).as_secs() <= now,
        None => true,
    }
}

/// Result of a group version diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupVersionsResult {
    /// Remote version of the group list.
    pub version: u64,
    /// Groups that are new or changed.
    pub to_update: Vec<i64>,
    /// Local groups the user no longer has access to, with their names.
    pub to_remove: Vec<(i64, String)>,
}

/// Lists group libraries that changed or disappeared remotely.
#[derive(Debug, Clone, Default)]
pub struct SyncGroupVersions;

impl SyncGroupVersions {
    /// Runs the diff.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<GroupVersionsResult> {
        let response = ctx.send(ApiRequest::group_versions(ctx.user_id())).await?;
        let remote: BTreeMap<String, u64> = response.decode()?;
        let remote: BTreeMap<i64, u64> = remote
            .into_iter()
            .filter_map(|(id, version)| id.parse().ok().map(|id| (id, version)))
            .collect();

        let local = ctx.store.transaction(|coordinator| Ok(coordinator.libraries()))?;
        let mut to_update = Vec::new();
        for (id, version) in &remote {
            let known = local
                .iter()
                .find(|library| library.id == LibraryIdentifier::Group(*id));
            match known {
                Some(library) if library.group_version == *version && !library.local_only => {}
                _ => to_update.push(*id),
            }
        }
        let to_remove = local
            .into_iter()
            .filter_map(|library| match library.id {
                LibraryIdentifier::Group(id) if !remote.contains_key(&id) && !library.local_only => {
                    Some((id, library.name))
                }
                _ => None,
            })
            .collect();

        Ok(GroupVersionsResult {
            version: response.version(),
            to_update,
            to_remove,
        })
    }
}
