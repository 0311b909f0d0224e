//! Collaborators shared by every sync step.

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::transport::{check_status, ApiClient};
use crate::webdav::WebDavTransport;
use bibsync_protocol::{ApiRequest, ApiResponse, BuiltinSchema, Schema};
use bibsync_store::{FileStorage, LocalStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Everything a sync step needs: configuration, the remote API, the local
/// store, file storage and the item schema.
///
/// Cloning is cheap; all collaborators are shared.
pub struct SyncContext<S: LocalStore> {
    /// Configuration.
    pub config: Arc<SyncConfig>,
    /// Remote API client.
    pub api: Arc<dyn ApiClient>,
    /// Local object store.
    pub store: Arc<S>,
    /// Attachment files and JSON cache.
    pub files: Arc<dyn FileStorage>,
    /// Item schema.
    pub schema: Arc<dyn Schema>,
    /// WebDAV transport, when attachment files live on WebDAV.
    pub webdav: Option<Arc<dyn WebDavTransport>>,
    uploads: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    clock: Clock,
}

impl<S: LocalStore> Clone for SyncContext<S> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            api: Arc::clone(&self.api),
            store: Arc::clone(&self.store),
            files: Arc::clone(&self.files),
            schema: Arc::clone(&self.schema),
            webdav: self.webdav.clone(),
            uploads: Arc::clone(&self.uploads),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: LocalStore> SyncContext<S> {
    /// Creates a context using the built-in schema and the system clock.
    pub fn new(config: SyncConfig, api: Arc<dyn ApiClient>, store: Arc<S>, files: Arc<dyn FileStorage>) -> Self {
        Self {
            config: Arc::new(config),
            api,
            store,
            files,
            schema: Arc::new(BuiltinSchema),
            webdav: None,
            uploads: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|elapsed| elapsed.as_secs())
                    .unwrap_or(0)
            }),
        }
    }

    /// Replaces the item schema.
    pub fn with_schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.schema = schema;
        self
    }

    /// Sets the WebDAV transport.
    pub fn with_webdav(mut self, webdav: Arc<dyn WebDavTransport>) -> Self {
        self.webdav = Some(webdav);
        self
    }

    /// Replaces the clock (unix seconds).
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Returns the current unix time in seconds.
    pub fn now(&self) -> u64 {
        (self.clock)()
    }

    /// Returns the id of the syncing user.
    pub fn user_id(&self) -> u64 {
        self.config.user_id
    }

    /// Sends a request and maps error statuses to errors.
    pub async fn send(&self, request: ApiRequest) -> SyncResult<ApiResponse> {
        check_status(self.api.send(request).await?)
    }

    /// Waits until no other upload of the same file hash is transferring.
    ///
    /// The returned permit releases the hash when dropped, including when the
    /// upload future is cancelled.
    pub(crate) async fn acquire_upload(&self, md5: &str) -> UploadPermit {
        let lock = Arc::clone(
            self.uploads
                .lock()
                .entry(md5.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        );
        let guard = lock.lock_owned().await;
        UploadPermit {
            uploads: Arc::clone(&self.uploads),
            md5: md5.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of file hashes with an upload in flight or waiting.
    pub(crate) fn active_uploads(&self) -> usize {
        self.uploads.lock().len()
    }
}

/// Exclusive right to transfer the bytes of one file hash.
pub(crate) struct UploadPermit {
    uploads: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    md5: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for UploadPermit {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut uploads = self.uploads.lock();
        // Waiters keep their own reference until they hold the lock.
        if uploads.get(&self.md5).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            uploads.remove(&self.md5);
        }
    }
}
