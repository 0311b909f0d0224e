//! In-memory fake of the Zotero Web API.
//!
//! Implements [`ApiClient`] directly, so engine code runs against it without
//! a network. The fake keeps one version counter per library, a deletion log,
//! settings, groups and stored attachment files, and enforces the same
//! preconditions as the real API:
//! - `If-Unmodified-Since-Version` older than the library version is a `412`
//! - an object write based on an older object version fails with `412`
//! - a write batch without changes does not bump the library version

use async_trait::async_trait;
use bibsync_engine::{ApiClient, ByteStream, SyncError, SyncResult};
use bibsync_protocol::{
    ApiRequest, ApiResponse, Endpoint, LibraryIdentifier, Method, MultipartForm, ObjectKind,
    RequestBody,
};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Base url of the fake upload target.
pub const UPLOAD_URL: &str = "https://uploads.fake.test";

#[derive(Debug, Clone, PartialEq)]
struct RemoteObject {
    version: u64,
    data: Value,
}

impl RemoteObject {
    fn trashed(&self) -> bool {
        match self.data.get("deleted") {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::Number(number)) => number.as_i64() == Some(1),
            _ => false,
        }
    }

    fn to_json(&self, key: &str) -> Value {
        let mut data = match &self.data {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        data.insert("key".into(), json!(key));
        data.insert("version".into(), json!(self.version));
        json!({"key": key, "version": self.version, "data": data})
    }
}

#[derive(Debug, Clone)]
struct Tombstone {
    category: &'static str,
    key: String,
    version: u64,
}

#[derive(Debug, Default)]
struct RemoteLibrary {
    version: u64,
    objects: BTreeMap<(ObjectKind, String), RemoteObject>,
    deleted: Vec<Tombstone>,
    settings: BTreeMap<String, (Value, u64)>,
}

impl RemoteLibrary {
    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

#[derive(Debug, Clone)]
struct RemoteGroup {
    version: u64,
    name: String,
    owner: u64,
    library_editing: String,
    file_editing: String,
}

#[derive(Debug, Clone)]
struct PendingUpload {
    library: String,
    key: String,
    md5: String,
    mtime: String,
    transferred: bool,
}

#[derive(Default)]
struct ServerState {
    libraries: BTreeMap<String, RemoteLibrary>,
    groups: BTreeMap<i64, RemoteGroup>,
    files: HashMap<String, Bytes>,
    uploads: HashMap<String, PendingUpload>,
    transfers: BTreeMap<String, usize>,
    requests: Vec<ApiRequest>,
    write_failures: HashMap<String, (u16, String)>,
    corrupt: HashSet<String>,
    scheduled_bumps: Vec<(usize, String)>,
    next_upload: u64,
}

fn category(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Collection => "collections",
        ObjectKind::Search => "searches",
        ObjectKind::Item => "items",
    }
}

fn kind_for(path: &str) -> Option<ObjectKind> {
    match path {
        "collections" => Some(ObjectKind::Collection),
        "searches" => Some(ObjectKind::Search),
        "items" | "items/trash" => Some(ObjectKind::Item),
        _ => None,
    }
}

fn key_param(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Collection => "collectionKey",
        ObjectKind::Search => "searchKey",
        ObjectKind::Item => "itemKey",
    }
}

fn without_identity(entry: &Value) -> Value {
    let mut data = entry.as_object().cloned().unwrap_or_default();
    data.remove("key");
    data.remove("version");
    Value::Object(data)
}

fn status(code: u16, message: &str) -> ApiResponse {
    ApiResponse::new(code, message.to_string())
}

/// A fake Zotero Web API server.
///
/// # Example
///
/// ```rust
/// use bibsync_protocol::{LibraryIdentifier, ObjectKind};
/// use bibsync_testkit::FakeZoteroServer;
/// use serde_json::json;
///
/// let server = FakeZoteroServer::new(1);
/// let version = server.put_object(LibraryIdentifier::MY_LIBRARY, ObjectKind::Collection, "CCCC2345", json!({"name": "Reading"}));
/// assert_eq!(version, 1);
/// assert_eq!(server.library_version(LibraryIdentifier::MY_LIBRARY), 1);
/// ```
pub struct FakeZoteroServer {
    user_id: u64,
    state: Mutex<ServerState>,
}

impl FakeZoteroServer {
    /// Creates a server with an empty personal library.
    pub fn new(user_id: u64) -> Self {
        let server = Self {
            user_id,
            state: Mutex::new(ServerState::default()),
        };
        server
            .state
            .lock()
            .libraries
            .insert(LibraryIdentifier::MY_LIBRARY.api_path(user_id), RemoteLibrary::default());
        server
    }

    /// Returns the user id the server answers for.
    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    fn path(&self, library_id: LibraryIdentifier) -> String {
        library_id.api_path(self.user_id)
    }

    fn with_library<R>(&self, library_id: LibraryIdentifier, f: impl FnOnce(&mut RemoteLibrary) -> R) -> R {
        let path = self.path(library_id);
        let mut state = self.state.lock();
        f(state.libraries.entry(path).or_default())
    }

    /// Returns the current library version.
    pub fn library_version(&self, library_id: LibraryIdentifier) -> u64 {
        self.with_library(library_id, |library| library.version)
    }

    /// Writes an object as another client would and returns the new library version.
    pub fn put_object(&self, library_id: LibraryIdentifier, kind: ObjectKind, key: &str, data: Value) -> u64 {
        self.with_library(library_id, |library| {
            let version = library.bump();
            library
                .objects
                .insert((kind, key.to_string()), RemoteObject { version, data });
            version
        })
    }

    /// Deletes an object as another client would and returns the new library version.
    pub fn delete_object(&self, library_id: LibraryIdentifier, kind: ObjectKind, key: &str) -> u64 {
        self.with_library(library_id, |library| {
            let version = library.bump();
            library.objects.remove(&(kind, key.to_string()));
            library.deleted.push(Tombstone {
                category: category(kind),
                key: key.to_string(),
                version,
            });
            version
        })
    }

    /// Deletes a tag name and returns the new library version.
    pub fn delete_tag(&self, library_id: LibraryIdentifier, name: &str) -> u64 {
        self.with_library(library_id, |library| {
            let version = library.bump();
            library.deleted.push(Tombstone {
                category: "tags",
                key: name.to_string(),
                version,
            });
            version
        })
    }

    /// Writes a setting and returns the new library version.
    pub fn put_setting(&self, library_id: LibraryIdentifier, key: &str, value: Value) -> u64 {
        self.with_library(library_id, |library| {
            let version = library.bump();
            library.settings.insert(key.to_string(), (value, version));
            version
        })
    }

    /// Returns a stored object with its version.
    pub fn object(&self, library_id: LibraryIdentifier, kind: ObjectKind, key: &str) -> Option<(u64, Value)> {
        self.with_library(library_id, |library| {
            library
                .objects
                .get(&(kind, key.to_string()))
                .map(|object| (object.version, object.data.clone()))
        })
    }

    /// Returns a stored setting value.
    pub fn setting(&self, library_id: LibraryIdentifier, key: &str) -> Option<Value> {
        self.with_library(library_id, |library| {
            library.settings.get(key).map(|(value, _)| value.clone())
        })
    }

    /// Adds or updates a group the user is a member of.
    pub fn put_group(&self, group_id: i64, name: &str, owner: u64, library_editing: &str, file_editing: &str) {
        let path = LibraryIdentifier::Group(group_id).api_path(self.user_id);
        let mut state = self.state.lock();
        let version = state.groups.get(&group_id).map_or(1, |group| group.version + 1);
        state.groups.insert(
            group_id,
            RemoteGroup {
                version,
                name: name.to_string(),
                owner,
                library_editing: library_editing.to_string(),
                file_editing: file_editing.to_string(),
            },
        );
        state.libraries.entry(path).or_default();
    }

    /// Removes the user from a group.
    pub fn remove_group(&self, group_id: i64) {
        self.state.lock().groups.remove(&group_id);
    }

    /// Makes writes of `key` fail with the given status and message.
    pub fn fail_write(&self, key: &str, code: u16, message: &str) {
        self.state
            .lock()
            .write_failures
            .insert(key.to_string(), (code, message.to_string()));
    }

    /// Makes the server accept writes of `key` but answer with a body that does not parse.
    pub fn corrupt_response(&self, key: &str) {
        self.state.lock().corrupt.insert(key.to_string());
    }

    /// Simulates another client writing to the library right before the
    /// `nth` request from now (1-based) is answered.
    pub fn bump_before_request(&self, nth: usize, library_id: LibraryIdentifier) {
        let path = self.path(library_id);
        let mut state = self.state.lock();
        let at = state.requests.len() + nth.max(1);
        state.scheduled_bumps.push((at, path));
    }

    /// Returns every request received.
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.state.lock().requests.clone()
    }

    /// Returns the requests that modify remote state (POST, PUT, PATCH, DELETE).
    pub fn write_requests(&self) -> Vec<ApiRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.method != Method::Get)
            .collect()
    }

    /// Returns how many byte transfers carried a file with the given hash.
    pub fn transfers(&self, md5: &str) -> usize {
        self.state.lock().transfers.get(md5).copied().unwrap_or(0)
    }

    /// Returns true if a file with the given hash is stored.
    pub fn has_file(&self, md5: &str) -> bool {
        self.state.lock().files.contains_key(md5)
    }

    /// Stores a file as if uploaded by another client.
    pub fn put_file(&self, md5: &str, bytes: impl Into<Bytes>) {
        self.state.lock().files.insert(md5.to_string(), bytes.into());
    }

    fn record(&self, request: &ApiRequest) {
        let mut state = self.state.lock();
        state.requests.push(request.clone());
        let count = state.requests.len();
        let due: Vec<String> = state
            .scheduled_bumps
            .iter()
            .filter(|(at, _)| *at == count)
            .map(|(_, path)| path.clone())
            .collect();
        state.scheduled_bumps.retain(|(at, _)| *at != count);
        for path in due {
            state.libraries.entry(path).or_default().bump();
        }
    }

    fn answer(&self, request: &ApiRequest) -> ApiResponse {
        let path = match &request.endpoint {
            Endpoint::Zotero(path) => path.clone(),
            Endpoint::External(url) => return status(404, &format!("unknown url {}", url)),
        };
        let segments: Vec<&str> = path.split('/').collect();

        match segments.as_slice() {
            ["users", _, "groups"] => self.group_versions(),
            ["groups", id] => match id.parse() {
                Ok(id) => self.group(id),
                Err(_) => status(404, "Not found"),
            },
            [scope @ ("users" | "groups"), id, rest @ ..] if !rest.is_empty() => {
                let library = format!("{}/{}", scope, id);
                let rest = rest.join("/");
                let mut state = self.state.lock();
                if !state.libraries.contains_key(&library) {
                    return status(404, "Not found");
                }
                self.library_request(&mut state, &library, &rest, request)
            }
            _ => status(404, "Not found"),
        }
    }

    fn group_versions(&self) -> ApiResponse {
        let state = self.state.lock();
        let versions: Map<String, Value> = state
            .groups
            .iter()
            .map(|(id, group)| (id.to_string(), json!(group.version)))
            .collect();
        ApiResponse::json(&Value::Object(versions), 0)
    }

    fn group(&self, group_id: i64) -> ApiResponse {
        let state = self.state.lock();
        match state.groups.get(&group_id) {
            Some(group) => ApiResponse::json(
                &json!({
                    "id": group_id,
                    "version": group.version,
                    "data": {
                        "name": group.name,
                        "owner": group.owner,
                        "libraryEditing": group.library_editing,
                        "fileEditing": group.file_editing,
                    }
                }),
                group.version,
            ),
            None => status(404, "Not found"),
        }
    }

    fn library_request(&self, state: &mut ServerState, library: &str, rest: &str, request: &ApiRequest) -> ApiResponse {
        let since = request
            .query_value("since")
            .and_then(|since| since.parse::<u64>().ok())
            .unwrap_or(0);

        match (request.method, rest) {
            (Method::Get, "settings") => {
                let remote = &state.libraries[library];
                let settings: Map<String, Value> = remote
                    .settings
                    .iter()
                    .filter(|(_, (_, version))| *version > since)
                    .map(|(key, (value, version))| (key.clone(), json!({"value": value, "version": version})))
                    .collect();
                ApiResponse::json(&Value::Object(settings), remote.version)
            }
            (Method::Get, "deleted") => {
                let remote = &state.libraries[library];
                let mut deleted: BTreeMap<&str, Vec<String>> = ["collections", "searches", "items", "tags", "settings"]
                    .into_iter()
                    .map(|name| (name, Vec::new()))
                    .collect();
                for tombstone in remote.deleted.iter().filter(|tombstone| tombstone.version > since) {
                    deleted
                        .entry(tombstone.category)
                        .or_default()
                        .push(tombstone.key.clone());
                }
                ApiResponse::json(&json!(deleted), remote.version)
            }
            (Method::Post, "settings") => self.write_settings(state, library, request),
            (Method::Get, path) if kind_for(path).is_some() => {
                let remote = &state.libraries[library];
                match request.query_value("format") {
                    Some("versions") => Self::versions(remote, path, since),
                    _ => Self::objects(remote, path, request),
                }
            }
            (Method::Post, path) if kind_for(path).is_some() => self.write_objects(state, library, path, request),
            (Method::Delete, path) if kind_for(path).is_some() => self.delete_objects(state, library, path, request),
            (Method::Post, path) if path.starts_with("items/") && path.ends_with("/file") => {
                let key = path.trim_start_matches("items/").trim_end_matches("/file");
                self.file_request(state, library, key, request)
            }
            _ => status(404, "Not found"),
        }
    }

    fn versions(remote: &RemoteLibrary, path: &str, since: u64) -> ApiResponse {
        let Some(kind) = kind_for(path) else {
            return status(404, "Not found");
        };
        let trash = match path {
            "items" => Some(false),
            "items/trash" => Some(true),
            _ => None,
        };
        let versions: Map<String, Value> = remote
            .objects
            .iter()
            .filter(|((object_kind, _), object)| {
                *object_kind == kind
                    && object.version > since
                    && trash.map_or(true, |trash| object.trashed() == trash)
            })
            .map(|((_, key), object)| (key.clone(), json!(object.version)))
            .collect();
        ApiResponse::json(&Value::Object(versions), remote.version)
    }

    fn objects(remote: &RemoteLibrary, path: &str, request: &ApiRequest) -> ApiResponse {
        let Some(kind) = kind_for(path) else {
            return status(404, "Not found");
        };
        let keys: Vec<&str> = request
            .query_value(key_param(kind))
            .map(|keys| keys.split(',').collect())
            .unwrap_or_default();
        let objects: Vec<Value> = keys
            .into_iter()
            .filter_map(|key| {
                remote
                    .objects
                    .get(&(kind, key.to_string()))
                    .map(|object| object.to_json(key))
            })
            .collect();
        ApiResponse::json(&Value::Array(objects), remote.version)
    }

    fn precondition(remote: &RemoteLibrary, request: &ApiRequest) -> Option<ApiResponse> {
        let since = request.header("If-Unmodified-Since-Version")?.parse::<u64>().ok()?;
        (since < remote.version).then(|| {
            status(412, &format!("Library has been modified since specified version (expected {}, found {})", since, remote.version))
                .with_version(remote.version)
        })
    }

    fn write_objects(&self, state: &mut ServerState, library: &str, path: &str, request: &ApiRequest) -> ApiResponse {
        let Some(kind) = kind_for(path) else {
            return status(404, "Not found");
        };
        let ServerState {
            libraries,
            write_failures,
            corrupt,
            ..
        } = state;
        let Some(remote) = libraries.get_mut(library) else {
            return status(404, "Not found");
        };
        if let Some(response) = Self::precondition(remote, request) {
            return response;
        }
        let entries = match &request.body {
            RequestBody::Json(Value::Array(entries)) => entries.clone(),
            _ => return status(400, "Body must be a JSON array"),
        };

        let mut successful = Map::new();
        let mut unchanged = Map::new();
        let mut failed = Map::new();
        let mut accepted = Vec::new();

        for (index, entry) in entries.iter().enumerate() {
            let Some(key) = entry.get("key").and_then(Value::as_str) else {
                failed.insert(index.to_string(), json!({"code": 400, "message": "'key' not provided"}));
                continue;
            };
            if let Some((code, message)) = write_failures.get(key) {
                failed.insert(index.to_string(), json!({"key": key, "code": code, "message": message}));
                continue;
            }
            let based_on = entry.get("version").and_then(Value::as_u64).unwrap_or(0);
            let data = without_identity(entry);
            match remote.objects.get(&(kind, key.to_string())) {
                Some(existing) if existing.version > based_on => {
                    failed.insert(
                        index.to_string(),
                        json!({"key": key, "code": 412, "message": "Object has been modified since specified version"}),
                    );
                }
                Some(existing) if existing.data == data => {
                    unchanged.insert(index.to_string(), json!(key));
                }
                _ => accepted.push((index, key.to_string(), data)),
            }
        }

        if !accepted.is_empty() {
            let version = remote.bump();
            for (index, key, data) in accepted {
                let object = RemoteObject { version, data };
                let body = if corrupt.contains(&key) {
                    json!({"key": key, "version": version, "data": "corrupt"})
                } else {
                    object.to_json(&key)
                };
                successful.insert(index.to_string(), body);
                remote.objects.insert((kind, key), object);
            }
        }

        ApiResponse::json(
            &json!({"successful": successful, "unchanged": unchanged, "failed": failed}),
            remote.version,
        )
    }

    fn delete_objects(&self, state: &mut ServerState, library: &str, path: &str, request: &ApiRequest) -> ApiResponse {
        let Some(kind) = kind_for(path) else {
            return status(404, "Not found");
        };
        let Some(remote) = state.libraries.get_mut(library) else {
            return status(404, "Not found");
        };
        if let Some(response) = Self::precondition(remote, request) {
            return response;
        }
        let keys: Vec<String> = request
            .query_value(key_param(kind))
            .map(|keys| keys.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        let version = remote.bump();
        for key in keys {
            remote.objects.remove(&(kind, key.clone()));
            remote.deleted.push(Tombstone {
                category: category(kind),
                key,
                version,
            });
        }
        ApiResponse::new(204, Bytes::new()).with_version(version)
    }

    fn write_settings(&self, state: &mut ServerState, library: &str, request: &ApiRequest) -> ApiResponse {
        let Some(remote) = state.libraries.get_mut(library) else {
            return status(404, "Not found");
        };
        if let Some(response) = Self::precondition(remote, request) {
            return response;
        }
        let settings = match &request.body {
            RequestBody::Json(Value::Object(settings)) => settings.clone(),
            _ => return status(400, "Body must be a JSON object"),
        };
        let version = remote.bump();
        for (key, setting) in settings {
            let value = setting.get("value").cloned().unwrap_or(Value::Null);
            remote.settings.insert(key, (value, version));
        }
        ApiResponse::new(204, Bytes::new()).with_version(version)
    }

    fn file_request(&self, state: &mut ServerState, library: &str, key: &str, request: &ApiRequest) -> ApiResponse {
        let form: HashMap<&str, &str> = match &request.body {
            RequestBody::Form(fields) => fields
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str()))
                .collect(),
            _ => return status(400, "Expected a form body"),
        };
        let version = state.libraries[library].version;
        if !state.libraries[library]
            .objects
            .contains_key(&(ObjectKind::Item, key.to_string()))
        {
            return status(404, "Item not found");
        }

        if let Some(upload_key) = form.get("upload") {
            return self.register_upload(state, library, key, upload_key);
        }

        let (Some(md5), Some(mtime)) = (form.get("md5"), form.get("mtime")) else {
            return status(400, "md5 and mtime not provided");
        };
        if state.files.contains_key(*md5) {
            return ApiResponse::json(&json!({"exists": 1}), version);
        }

        state.next_upload += 1;
        let upload_key = format!("upload{:04}", state.next_upload);
        state.uploads.insert(
            upload_key.clone(),
            PendingUpload {
                library: library.to_string(),
                key: key.to_string(),
                md5: md5.to_string(),
                mtime: mtime.to_string(),
                transferred: false,
            },
        );
        ApiResponse::json(
            &json!({
                "url": format!("{}/{}", UPLOAD_URL, upload_key),
                "contentType": "multipart/form-data",
                "params": {"key": upload_key},
                "uploadKey": upload_key,
            }),
            version,
        )
    }

    fn register_upload(&self, state: &mut ServerState, library: &str, key: &str, upload_key: &str) -> ApiResponse {
        let Some(upload) = state.uploads.get(upload_key).cloned() else {
            return status(400, "Unknown upload key");
        };
        if !upload.transferred || upload.key != key || upload.library != library {
            return status(412, "File was not uploaded");
        }
        state.uploads.remove(upload_key);

        let Some(remote) = state.libraries.get_mut(library) else {
            return status(404, "Not found");
        };
        let version = remote.bump();
        if let Some(object) = remote.objects.get_mut(&(ObjectKind::Item, key.to_string())) {
            if let Value::Object(data) = &mut object.data {
                data.insert("md5".into(), json!(upload.md5));
                data.insert("mtime".into(), json!(upload.mtime.parse::<i64>().unwrap_or(0)));
            }
            object.version = version;
        }
        ApiResponse::new(204, Bytes::new()).with_version(version)
    }

    fn transfer(&self, url: &str, form: MultipartForm) -> ApiResponse {
        let Some(upload_key) = url.strip_prefix(UPLOAD_URL).map(|rest| rest.trim_start_matches('/')) else {
            return status(404, "Unknown upload target");
        };
        let mut state = self.state.lock();
        let Some(upload) = state.uploads.get_mut(upload_key) else {
            return status(400, "Unknown upload key");
        };
        if !form.params.iter().any(|(name, value)| name == "key" && value == upload_key) {
            return status(400, "Missing upload params");
        }
        upload.transferred = true;
        let md5 = upload.md5.clone();
        *state.transfers.entry(md5.clone()).or_insert(0) += 1;
        state.files.insert(md5, form.file.bytes);
        status(201, "")
    }
}

#[async_trait]
impl ApiClient for FakeZoteroServer {
    async fn send(&self, request: ApiRequest) -> SyncResult<ApiResponse> {
        self.record(&request);
        let response = self.answer(&request);
        tracing::trace!(method = request.method.as_str(), path = request.path(), status = response.status, "fake api");
        Ok(response)
    }

    async fn upload(&self, request: ApiRequest, form: MultipartForm) -> SyncResult<ApiResponse> {
        self.record(&request);
        match &request.endpoint {
            Endpoint::External(url) => Ok(self.transfer(url, form)),
            Endpoint::Zotero(path) => Ok(status(404, &format!("uploads go to external targets, got {}", path))),
        }
    }

    async fn download(&self, request: ApiRequest) -> SyncResult<ByteStream> {
        self.record(&request);
        let path = request.path().to_string();
        let key = path
            .rsplit('/')
            .nth(1)
            .ok_or_else(|| SyncError::Http {
                status: 404,
                message: "Not found".into(),
            })?
            .to_string();
        let state = self.state.lock();
        let bytes = state
            .libraries
            .values()
            .find_map(|library| library.objects.get(&(ObjectKind::Item, key.clone())))
            .and_then(|object| object.data.get("md5").and_then(Value::as_str))
            .and_then(|md5| state.files.get(md5).cloned())
            .ok_or_else(|| SyncError::Http {
                status: 404,
                message: format!("no file for {}", key),
            })?;
        Ok(stream::iter(vec![Ok(bytes)]).boxed())
    }
}
