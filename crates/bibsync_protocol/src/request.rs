//! API request descriptions.
//!
//! Requests are plain data; the transport decides how to put them on the wire.

use crate::library::LibraryIdentifier;
use crate::object::SyncObject;
use bytes::Bytes;
use serde_json::Value;

/// Zotero Web API version sent with every request.
pub const API_VERSION: &str = "3";

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET.
    Get,
    /// POST.
    Post,
    /// PUT.
    Put,
    /// PATCH.
    Patch,
    /// DELETE.
    Delete,
}

impl Method {
    /// Returns the method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

/// Where a request is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A path relative to the API base url.
    Zotero(String),
    /// An absolute url, e.g. a pre-signed upload target.
    External(String),
}

/// Request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// No body.
    Empty,
    /// JSON body.
    Json(Value),
    /// `application/x-www-form-urlencoded` body.
    Form(Vec<(String, String)>),
}

/// A request to the remote API.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Target.
    pub endpoint: Endpoint,
    /// Query parameters, in order.
    pub query: Vec<(String, String)>,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
    /// Payload.
    pub body: RequestBody,
}

/// One file part of a multipart upload.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePart {
    /// Form field name.
    pub field: String,
    /// File name sent with the part.
    pub filename: String,
    /// MIME type of the part.
    pub mime_type: String,
    /// File contents.
    pub bytes: Bytes,
}

/// Multipart form for attachment uploads: text params followed by the file.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartForm {
    /// Text fields, sent before the file.
    pub params: Vec<(String, String)>,
    /// The file part.
    pub file: FilePart,
}

impl ApiRequest {
    /// Creates a request without query, headers or body.
    pub fn new(method: Method, endpoint: Endpoint) -> Self {
        Self {
            method,
            endpoint,
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    fn library(method: Method, library_id: LibraryIdentifier, user_id: u64, path: &str) -> Self {
        Self::new(
            method,
            Endpoint::Zotero(format!("{}/{}", library_id.api_path(user_id), path)),
        )
    }

    /// Adds a query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    fn with_since_header(self, version: Option<u64>) -> Self {
        match version {
            Some(version) => self.with_header("If-Unmodified-Since-Version", version.to_string()),
            None => self,
        }
    }

    /// `GET {library}/{object}?format=versions[&since=V]`.
    pub fn versions(
        library_id: LibraryIdentifier,
        user_id: u64,
        object: SyncObject,
        since: Option<u64>,
    ) -> Self {
        let request = Self::library(Method::Get, library_id, user_id, object.traits().path)
            .with_query("format", "versions");
        match since {
            Some(version) => request.with_query("since", version.to_string()),
            None => request,
        }
    }

    /// `GET {library}/{object}?format=json&{keyParam}=k1,k2`.
    pub fn objects(
        library_id: LibraryIdentifier,
        user_id: u64,
        object: SyncObject,
        keys: &[String],
    ) -> Self {
        let traits = object.traits();
        let request = Self::library(Method::Get, library_id, user_id, traits.write_path)
            .with_query("format", "json");
        let request = match traits.key_param {
            Some(param) => request.with_query(param, keys.join(",")),
            None => request,
        };
        if traits.trash.is_some() {
            request.with_query("includeTrashed", "1")
        } else {
            request
        }
    }

    /// `GET {library}/deleted?since=V`.
    pub fn deletions(library_id: LibraryIdentifier, user_id: u64, since: u64) -> Self {
        Self::library(Method::Get, library_id, user_id, "deleted")
            .with_query("since", since.to_string())
    }

    /// `GET {library}/settings[?since=V]`.
    pub fn settings(library_id: LibraryIdentifier, user_id: u64, since: Option<u64>) -> Self {
        let request = Self::library(Method::Get, library_id, user_id, "settings");
        match since {
            Some(version) => request.with_query("since", version.to_string()),
            None => request,
        }
    }

    /// `POST {library}/{object}` with a batch of JSON objects.
    pub fn updates(
        library_id: LibraryIdentifier,
        user_id: u64,
        object: SyncObject,
        parameters: Vec<Value>,
        since: Option<u64>,
    ) -> Self {
        Self::library(Method::Post, library_id, user_id, object.traits().write_path)
            .with_body(RequestBody::Json(Value::Array(parameters)))
            .with_since_header(since)
    }

    /// `POST {library}/settings` with a JSON object of settings.
    pub fn submit_settings(
        library_id: LibraryIdentifier,
        user_id: u64,
        settings: Value,
        since: Option<u64>,
    ) -> Self {
        Self::library(Method::Post, library_id, user_id, "settings")
            .with_body(RequestBody::Json(settings))
            .with_since_header(since)
    }

    /// `DELETE {library}/{object}?{keyParam}=k1,k2`.
    pub fn submit_deletions(
        library_id: LibraryIdentifier,
        user_id: u64,
        object: SyncObject,
        keys: &[String],
        version: u64,
    ) -> Self {
        let traits = object.traits();
        let request = Self::library(Method::Delete, library_id, user_id, traits.write_path);
        let request = match traits.key_param {
            Some(param) => request.with_query(param, keys.join(",")),
            None => request,
        };
        request.with_since_header(Some(version))
    }

    /// `POST {library}/items/{key}/file` asking whether the file must be uploaded.
    pub fn authorize_upload(
        library_id: LibraryIdentifier,
        user_id: u64,
        key: &str,
        filename: &str,
        filesize: u64,
        md5: &str,
        mtime: i64,
        old_md5: Option<&str>,
    ) -> Self {
        let form = vec![
            ("md5".to_string(), md5.to_string()),
            ("filename".to_string(), filename.to_string()),
            ("filesize".to_string(), filesize.to_string()),
            ("mtime".to_string(), mtime.to_string()),
            ("params".to_string(), "1".to_string()),
        ];
        Self::library(Method::Post, library_id, user_id, &format!("items/{}/file", key))
            .with_body(RequestBody::Form(form))
            .with_file_precondition(old_md5)
    }

    /// `POST {library}/items/{key}/file` registering a finished upload.
    pub fn register_upload(
        library_id: LibraryIdentifier,
        user_id: u64,
        key: &str,
        upload_key: &str,
        old_md5: Option<&str>,
    ) -> Self {
        Self::library(Method::Post, library_id, user_id, &format!("items/{}/file", key))
            .with_body(RequestBody::Form(vec![(
                "upload".to_string(),
                upload_key.to_string(),
            )]))
            .with_file_precondition(old_md5)
    }

    fn with_file_precondition(self, old_md5: Option<&str>) -> Self {
        match old_md5 {
            Some(md5) => self.with_header("If-Match", md5),
            None => self.with_header("If-None-Match", "*"),
        }
    }

    /// `GET {library}/items/{key}/file`.
    pub fn download(library_id: LibraryIdentifier, user_id: u64, key: &str) -> Self {
        Self::library(Method::Get, library_id, user_id, &format!("items/{}/file", key))
    }

    /// `POST {url}` to a pre-signed upload target.
    pub fn file_upload(url: impl Into<String>) -> Self {
        Self::new(Method::Post, Endpoint::External(url.into()))
    }

    /// `GET users/{id}/groups?format=versions`.
    pub fn group_versions(user_id: u64) -> Self {
        Self::new(Method::Get, Endpoint::Zotero(format!("users/{}/groups", user_id)))
            .with_query("format", "versions")
    }

    /// `GET groups/{id}`.
    pub fn group(group_id: i64) -> Self {
        Self::new(Method::Get, Endpoint::Zotero(format!("groups/{}", group_id)))
    }

    /// Returns the first header with the given name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the first query parameter with the given name.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Returns the `If-Unmodified-Since-Version` precondition, if any.
    pub fn since_version(&self) -> Option<u64> {
        self.header("If-Unmodified-Since-Version")
            .and_then(|value| value.parse().ok())
    }

    /// Returns the endpoint path (or absolute url) without the query.
    pub fn path(&self) -> &str {
        match &self.endpoint {
            Endpoint::Zotero(path) | Endpoint::External(path) => path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn versions_request_omits_since_for_full_listing() {
        let request = ApiRequest::versions(LibraryIdentifier::MY_LIBRARY, 5, SyncObject::Trash, None);
        assert_eq!(request.path(), "users/5/items/trash");
        assert_eq!(request.query_value("format"), Some("versions"));
        assert_eq!(request.query_value("since"), None);

        let request =
            ApiRequest::versions(LibraryIdentifier::Group(3), 5, SyncObject::Collection, Some(9));
        assert_eq!(request.path(), "groups/3/collections");
        assert_eq!(request.query_value("since"), Some("9"));
    }

    #[test]
    fn objects_request_joins_keys() {
        let keys = vec!["AAAA2222".to_string(), "BBBB3333".to_string()];
        let request = ApiRequest::objects(LibraryIdentifier::MY_LIBRARY, 1, SyncObject::Search, &keys);
        assert_eq!(request.path(), "users/1/searches");
        assert_eq!(request.query_value("searchKey"), Some("AAAA2222,BBBB3333"));
        assert_eq!(request.query_value("includeTrashed"), None);

        let request = ApiRequest::objects(LibraryIdentifier::MY_LIBRARY, 1, SyncObject::Trash, &keys);
        assert_eq!(request.path(), "users/1/items");
        assert_eq!(request.query_value("includeTrashed"), Some("1"));
    }

    #[test]
    fn updates_request_carries_precondition() {
        let request = ApiRequest::updates(
            LibraryIdentifier::MY_LIBRARY,
            1,
            SyncObject::Item,
            vec![json!({"key": "AAAA2222"})],
            Some(12),
        );
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.since_version(), Some(12));

        let request = ApiRequest::updates(LibraryIdentifier::MY_LIBRARY, 1, SyncObject::Item, vec![], None);
        assert_eq!(request.since_version(), None);
    }

    #[test]
    fn authorize_upload_form() {
        let request = ApiRequest::authorize_upload(
            LibraryIdentifier::Group(2),
            1,
            "AAAA2222",
            "paper.pdf",
            1024,
            "abc",
            1_600_000_000,
            None,
        );
        assert_eq!(request.path(), "groups/2/items/AAAA2222/file");
        assert_eq!(request.header("if-none-match"), Some("*"));
        match request.body {
            RequestBody::Form(fields) => {
                assert!(fields.contains(&("filesize".to_string(), "1024".to_string())));
                assert!(fields.contains(&("params".to_string(), "1".to_string())));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }
}
