//! Remote API client abstraction.

use crate::error::{PreconditionErrorType, SyncError, SyncResult};
use async_trait::async_trait;
use bibsync_protocol::{ApiRequest, ApiResponse, MultipartForm};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Stream of downloaded file chunks.
pub type ByteStream = BoxStream<'static, SyncResult<Bytes>>;

/// A client for the remote Web API.
///
/// Implementations return every HTTP answer as an [`ApiResponse`], whatever
/// its status; mapping statuses to errors is done by [`check_status`].
/// Transport failures (connection, timeout) are returned as errors.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Sends a request.
    async fn send(&self, request: ApiRequest) -> SyncResult<ApiResponse>;

    /// Sends a multipart upload.
    async fn upload(&self, request: ApiRequest, form: MultipartForm) -> SyncResult<ApiResponse>;

    /// Downloads a file as a stream of chunks.
    async fn download(&self, request: ApiRequest) -> SyncResult<ByteStream>;
}

/// Maps non-success statuses to errors.
///
/// A `412` on the request itself means the library changed remotely.
pub fn check_status(response: ApiResponse) -> SyncResult<ApiResponse> {
    match response.status {
        status if (200..300).contains(&status) => Ok(response),
        412 => Err(SyncError::Precondition(PreconditionErrorType::LibraryConflict)),
        status => Err(SyncError::Http {
            status,
            message: String::from_utf8_lossy(&response.body).into_owned(),
        }),
    }
}

type Handler = Box<dyn Fn(&ApiRequest) -> SyncResult<ApiResponse> + Send + Sync>;

/// A mock API client for testing.
///
/// Queued responses are returned first, in order; once the queue is empty the
/// handler (if any) answers. Every request is recorded.
#[derive(Default)]
pub struct MockApiClient {
    responses: Mutex<VecDeque<SyncResult<ApiResponse>>>,
    handler: Mutex<Option<Handler>>,
    requests: Mutex<Vec<ApiRequest>>,
    uploads: Mutex<Vec<MultipartForm>>,
}

impl MockApiClient {
    /// Creates a mock with no responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push_response(&self, response: ApiResponse) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Queues a transport error.
    pub fn push_error(&self, error: SyncError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Sets the fallback handler.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&ApiRequest) -> SyncResult<ApiResponse> + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Box::new(handler));
    }

    /// Returns all recorded requests.
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().clone()
    }

    /// Returns all recorded upload forms.
    pub fn uploads(&self) -> Vec<MultipartForm> {
        self.uploads.lock().clone()
    }

    fn answer(&self, request: ApiRequest) -> SyncResult<ApiResponse> {
        let queued = self.responses.lock().pop_front();
        let response = match queued {
            Some(response) => response,
            None => match self.handler.lock().as_ref() {
                Some(handler) => handler(&request),
                None => Err(SyncError::transport_fatal(format!(
                    "no mock response for {}",
                    request.path()
                ))),
            },
        };
        self.requests.lock().push(request);
        response
    }
}

impl std::fmt::Debug for MockApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockApiClient")
            .field("queued", &self.responses.lock().len())
            .field("requests", &self.requests.lock().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ApiClient for MockApiClient {
    async fn send(&self, request: ApiRequest) -> SyncResult<ApiResponse> {
        self.answer(request)
    }

    async fn upload(&self, request: ApiRequest, form: MultipartForm) -> SyncResult<ApiResponse> {
        self.uploads.lock().push(form);
        self.answer(request)
    }

    async fn download(&self, request: ApiRequest) -> SyncResult<ByteStream> {
        let response = check_status(self.answer(request)?)?;
        Ok(stream::once(async move { Ok(response.body) }).boxed())
    }
}
