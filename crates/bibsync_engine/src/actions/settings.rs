//! Settings download step.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use bibsync_protocol::{
    ApiRequest, LibraryIdentifier, SettingResponse, SyncObject, UpdateVersionType,
};
use bibsync_store::{LocalStore, WriteRequest};

/// Result of a settings download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsResult {
    /// Remote library version.
    pub version: u64,
    /// Whether the download contained tag colors.
    pub has_tag_colors: bool,
}

/// Downloads settings changed since a version and stores them.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Library.
    pub library_id: LibraryIdentifier,
    /// Local settings cursor.
    pub since_version: Option<u64>,
    /// Remote library version observed earlier in this pass.
    pub current_version: Option<u64>,
}

impl SyncSettings {
    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<SettingsResult> {
        let request = ApiRequest::settings(self.library_id, ctx.user_id(), self.since_version);
        let response = ctx.send(request).await?;
        let version = response.version();

        if let Some(current) = self.current_version {
            if current != version {
                return Err(SyncError::VersionMismatch(self.library_id));
            }
        }

        let settings = SettingResponse::parse_map(&response.json_value()?)?;
        let has_tag_colors = settings.contains_key("tagColors");
        let count = settings.len();

        ctx.store.perform_batch(vec![
            WriteRequest::StoreSettings {
                library_id: self.library_id,
                settings: settings.into_iter().collect(),
            },
            WriteRequest::SetVersion {
                library_id: self.library_id,
                version_type: UpdateVersionType::Object(SyncObject::Settings),
                version,
            },
        ])?;

        tracing::debug!(library = %self.library_id, count, version, "settings stored");
        Ok(SettingsResult {
            version,
            has_tag_colors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::transport::MockApiClient;
    use bibsync_protocol::ApiResponse;
    use bibsync_store::{MemoryFileStorage, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    const LIB: LibraryIdentifier = LibraryIdentifier::MY_LIBRARY;

    fn context(api: Arc<MockApiClient>, store: Arc<MemoryStore>) -> SyncContext<MemoryStore> {
        SyncContext::new(SyncConfig::new(1), api, store, Arc::new(MemoryFileStorage::new()))
    }

    #[tokio::test]
    async fn stores_settings_and_version() {
        let api = Arc::new(MockApiClient::new());
        api.push_response(ApiResponse::json(
            &json!({
                "tagColors": {"value": [{"name": "todo", "color": "#ff8c19"}], "version": 8},
                "lastPageIndex_u_ABCD2345": {"value": 12, "version": 9}
            }),
            9,
        ));
        let store = Arc::new(MemoryStore::new());

        let step = SyncSettings {
            library_id: LIB,
            since_version: Some(2),
            current_version: None,
        };
        let result = step.run(&context(api.clone(), store.clone())).await.unwrap();

        assert_eq!(
            result,
            SettingsResult {
                version: 9,
                has_tag_colors: true
            }
        );
        assert_eq!(store.versions(LIB).settings, 9);
        let settings = store.transaction(|coordinator| Ok(coordinator.settings(LIB))).unwrap();
        assert_eq!(settings.len(), 2);
        assert_eq!(api.requests()[0].query_value("since"), Some("2"));
    }

    #[tokio::test]
    async fn version_mismatch_stores_nothing() {
        let api = Arc::new(MockApiClient::new());
        api.push_response(ApiResponse::json(&json!({}), 5));
        let store = Arc::new(MemoryStore::new());

        let step = SyncSettings {
            library_id: LIB,
            since_version: None,
            current_version: Some(4),
        };
        let error = step.run(&context(api, store.clone())).await.unwrap_err();
        assert!(matches!(error, SyncError::VersionMismatch(_)));
        assert_eq!(store.versions(LIB).settings, 0);
    }
}
