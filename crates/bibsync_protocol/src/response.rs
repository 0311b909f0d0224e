//! API responses and payload parsing.

use crate::error::{ProtocolError, ProtocolResult};
use crate::object::{ObjectKind, SyncObject};
use crate::schema::{FieldIssue, Schema};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Message the API returns for annotations whose geometry exceeds the size limit.
pub const ANNOTATION_POSITION_TOO_LONG: &str = "Annotation position is too long";

/// Response headers, stored with the casing the transport reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders(HashMap<String, String>);

impl ResponseHeaders {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Returns the header stored under exactly `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Returns the `Last-Modified-Version` header, or 0 when absent.
    ///
    /// Some transports keep header names case-sensitive, so both spellings are checked.
    pub fn last_modified_version(&self) -> u64 {
        self.get("last-modified-version")
            .or_else(|| self.get("Last-Modified-Version"))
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// A response from the remote API.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: ResponseHeaders,
    /// Raw body.
    pub body: Bytes,
}

impl ApiResponse {
    /// Creates a response with no headers.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: ResponseHeaders::new(),
            body: body.into(),
        }
    }

    /// Creates a `200` response with a JSON body and a version header.
    pub fn json(value: &Value, version: u64) -> Self {
        Self::new(200, value.to_string()).with_version(version)
    }

    /// Sets the `Last-Modified-Version` header.
    pub fn with_version(mut self, version: u64) -> Self {
        self.headers
            .insert("Last-Modified-Version", version.to_string());
        self
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns the remote library version reported by this response.
    pub fn version(&self) -> u64 {
        self.headers.last_modified_version()
    }

    /// Decodes the body as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Decodes the body as untyped JSON; an empty body decodes to `null`.
    pub fn json_value(&self) -> ProtocolResult<Value> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        self.decode()
    }
}

/// A decoded collection, item or search.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectResponse {
    /// Object key.
    pub key: String,
    /// Object version.
    pub version: u64,
    /// Storage kind.
    pub kind: ObjectKind,
    /// The `data` object as sent by the API.
    pub data: Value,
    /// Whether the object is in trash.
    pub trash: bool,
    /// Parent collection or parent item key.
    pub parent: Option<String>,
    /// Non-fatal problems found while decoding.
    pub issues: Vec<FieldIssue>,
}

impl ObjectResponse {
    /// Returns the item type for items.
    pub fn item_type(&self) -> Option<&str> {
        self.data.get("itemType").and_then(Value::as_str)
    }
}

/// An object that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectParseError {
    /// Object key, when it could be read.
    pub key: Option<String>,
    /// Description of the failure.
    pub message: String,
}

impl ObjectParseError {
    fn new(key: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            key: key.map(str::to_string),
            message: message.into(),
        }
    }
}

struct Envelope<'a> {
    key: &'a str,
    version: u64,
    data: &'a Map<String, Value>,
}

fn envelope(json: &Value) -> Result<Envelope<'_>, ObjectParseError> {
    let key = json
        .get("key")
        .or_else(|| json.get("data").and_then(|data| data.get("key")))
        .and_then(Value::as_str)
        .ok_or_else(|| ObjectParseError::new(None, "missing key"))?;
    let version = json
        .get("version")
        .or_else(|| json.get("data").and_then(|data| data.get("version")))
        .and_then(Value::as_u64)
        .ok_or_else(|| ObjectParseError::new(Some(key), "missing version"))?;
    let data = json
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| ObjectParseError::new(Some(key), "missing data"))?;
    Ok(Envelope { key, version, data })
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

pub(crate) fn parse_collection(
    json: &Value,
    _schema: &dyn Schema,
) -> Result<ObjectResponse, ObjectParseError> {
    let envelope = envelope(json)?;
    if !envelope.data.get("name").is_some_and(Value::is_string) {
        return Err(ObjectParseError::new(Some(envelope.key), "collection without name"));
    }
    Ok(ObjectResponse {
        key: envelope.key.to_string(),
        version: envelope.version,
        kind: ObjectKind::Collection,
        trash: is_truthy(envelope.data.get("deleted")),
        parent: envelope
            .data
            .get("parentCollection")
            .and_then(Value::as_str)
            .map(str::to_string),
        data: Value::Object(envelope.data.clone()),
        issues: Vec::new(),
    })
}

pub(crate) fn parse_search(
    json: &Value,
    _schema: &dyn Schema,
) -> Result<ObjectResponse, ObjectParseError> {
    let envelope = envelope(json)?;
    if !envelope.data.get("name").is_some_and(Value::is_string) {
        return Err(ObjectParseError::new(Some(envelope.key), "search without name"));
    }
    if !envelope.data.get("conditions").is_some_and(Value::is_array) {
        return Err(ObjectParseError::new(Some(envelope.key), "search without conditions"));
    }
    Ok(ObjectResponse {
        key: envelope.key.to_string(),
        version: envelope.version,
        kind: ObjectKind::Search,
        trash: is_truthy(envelope.data.get("deleted")),
        parent: None,
        data: Value::Object(envelope.data.clone()),
        issues: Vec::new(),
    })
}

const ANNOTATION_TYPES: &[&str] = &["highlight", "underline", "note", "text", "image", "ink"];

pub(crate) fn parse_item(
    json: &Value,
    schema: &dyn Schema,
) -> Result<ObjectResponse, ObjectParseError> {
    let envelope = envelope(json)?;
    let key = envelope.key;
    let item_type = envelope
        .data
        .get("itemType")
        .and_then(Value::as_str)
        .ok_or_else(|| ObjectParseError::new(Some(key), "missing itemType"))?;
    if !schema.is_known_item_type(item_type) {
        return Err(ObjectParseError::new(
            Some(key),
            format!("unknown item type `{}`", item_type),
        ));
    }

    match item_type {
        "attachment" => {
            if !envelope.data.get("linkMode").is_some_and(Value::is_string) {
                return Err(ObjectParseError::new(Some(key), "attachment without linkMode"));
            }
        }
        "annotation" => {
            let annotation_type = envelope
                .data
                .get("annotationType")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !ANNOTATION_TYPES.contains(&annotation_type) {
                return Err(ObjectParseError::new(
                    Some(key),
                    format!("unknown annotation type `{}`", annotation_type),
                ));
            }
            let position = envelope.data.get("annotationPosition");
            let position_ok = match position {
                Some(Value::String(text)) => serde_json::from_str::<Value>(text)
                    .map(|value| value.is_object())
                    .unwrap_or(false),
                Some(Value::Object(_)) => true,
                _ => false,
            };
            if !position_ok {
                return Err(ObjectParseError::new(Some(key), "invalid annotationPosition"));
            }
        }
        _ => {}
    }

    let mut issues = Vec::new();
    for (field, value) in envelope.data {
        if !schema.is_valid_field(item_type, field) {
            issues.push(FieldIssue::UnknownField(field.clone()));
            continue;
        }
        let shape_ok = match field.as_str() {
            "tags" | "collections" | "creators" => value.is_array(),
            "relations" => value.is_object(),
            _ => true,
        };
        if !shape_ok {
            issues.push(FieldIssue::InvalidValue(field.clone()));
        }
    }

    Ok(ObjectResponse {
        key: key.to_string(),
        version: envelope.version,
        kind: ObjectKind::Item,
        trash: is_truthy(envelope.data.get("deleted")),
        parent: envelope
            .data
            .get("parentItem")
            .and_then(Value::as_str)
            .map(str::to_string),
        data: Value::Object(envelope.data.clone()),
        issues,
    })
}

/// Decodes one object body for `object`.
pub fn parse_object(
    object: SyncObject,
    json: &Value,
    schema: &dyn Schema,
) -> Result<ObjectResponse, ObjectParseError> {
    match object.traits().parse {
        Some(parse) => parse(json, schema),
        None => Err(ObjectParseError::new(
            None,
            format!("{} has no object bodies", object.type_name()),
        )),
    }
}

/// Decodes an array of object bodies, collecting failures per object.
pub fn parse_objects(
    object: SyncObject,
    json: &Value,
    schema: &dyn Schema,
) -> ProtocolResult<(Vec<ObjectResponse>, Vec<ObjectParseError>)> {
    let array = json
        .as_array()
        .ok_or_else(|| ProtocolError::UnexpectedResponse("expected an array of objects".into()))?;
    let mut objects = Vec::with_capacity(array.len());
    let mut errors = Vec::new();
    for value in array {
        match parse_object(object, value, schema) {
            Ok(response) => objects.push(response),
            Err(error) => errors.push(error),
        }
    }
    Ok((objects, errors))
}

/// One rejected entry of a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUpdate {
    /// Index in the submitted batch.
    pub index: usize,
    /// Key reported by the server, if any.
    pub key: Option<String>,
    /// HTTP status describing the failure.
    pub code: u16,
    /// Server message.
    pub message: String,
}

/// Partition of a write batch as reported by the API, keyed by submission index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdatesResponse {
    /// Accepted entries with their canonical JSON.
    pub successful: BTreeMap<usize, Value>,
    /// Accepted entries without content changes.
    pub unchanged: BTreeMap<usize, String>,
    /// Rejected entries.
    pub failed: Vec<FailedUpdate>,
}

fn parse_index(index: &str) -> ProtocolResult<usize> {
    index.parse().map_err(|_| ProtocolError::InvalidField {
        field: index.to_string(),
        message: "batch index is not a number".into(),
    })
}

impl UpdatesResponse {
    /// Parses a write response body.
    pub fn parse(json: &Value) -> ProtocolResult<Self> {
        let root = json
            .as_object()
            .ok_or_else(|| ProtocolError::UnexpectedResponse("expected a write result object".into()))?;
        let mut response = UpdatesResponse::default();

        if let Some(successful) = root.get("successful").and_then(Value::as_object) {
            for (index, value) in successful {
                response.successful.insert(parse_index(index)?, value.clone());
            }
        }
        if let Some(unchanged) = root.get("unchanged").and_then(Value::as_object) {
            for (index, value) in unchanged {
                let key = value.as_str().unwrap_or_default().to_string();
                response.unchanged.insert(parse_index(index)?, key);
            }
        }
        if let Some(failed) = root.get("failed").and_then(Value::as_object) {
            for (index, value) in failed {
                let code = value
                    .get("code")
                    .and_then(Value::as_u64)
                    .and_then(|code| u16::try_from(code).ok())
                    .ok_or_else(|| ProtocolError::MissingField {
                        field: "code",
                        context: format!("failed entry {}", index),
                    })?;
                response.failed.push(FailedUpdate {
                    index: parse_index(index)?,
                    key: value.get("key").and_then(Value::as_str).map(str::to_string),
                    code,
                    message: value
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }
        response.failed.sort_by_key(|failure| failure.index);
        Ok(response)
    }
}

/// Keys deleted remotely since a version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionsResponse {
    /// Deleted collection keys.
    #[serde(default)]
    pub collections: Vec<String>,
    /// Deleted search keys.
    #[serde(default)]
    pub searches: Vec<String>,
    /// Deleted item keys.
    #[serde(default)]
    pub items: Vec<String>,
    /// Deleted tag names.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Deleted setting keys.
    #[serde(default)]
    pub settings: Vec<String>,
}

impl DeletionsResponse {
    /// Returns true if nothing was deleted.
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
            && self.searches.is_empty()
            && self.items.is_empty()
            && self.tags.is_empty()
            && self.settings.is_empty()
    }
}

/// One library setting as reported by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingResponse {
    /// Setting value.
    pub value: Value,
    /// Version at which the setting last changed.
    #[serde(default)]
    pub version: u64,
}

impl SettingResponse {
    /// Parses a settings body (`{ key: { value, version } }`).
    pub fn parse_map(json: &Value) -> ProtocolResult<BTreeMap<String, SettingResponse>> {
        if json.is_null() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_value(json.clone())?)
    }
}

/// Answer to an upload authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizeUploadResponse {
    /// A file with the same hash is already stored remotely.
    Exists,
    /// The file must be uploaded.
    New {
        /// Upload target.
        url: String,
        /// Form parameters to send before the file.
        params: Vec<(String, String)>,
        /// Key used to register the upload.
        upload_key: String,
    },
}

impl AuthorizeUploadResponse {
    /// Parses an authorization body.
    pub fn parse(json: &Value) -> ProtocolResult<Self> {
        if is_truthy(json.get("exists")) {
            return Ok(AuthorizeUploadResponse::Exists);
        }
        let url = json
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MissingField {
                field: "url",
                context: "upload authorization".into(),
            })?;
        let upload_key = json
            .get("uploadKey")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MissingField {
                field: "uploadKey",
                context: "upload authorization".into(),
            })?;
        let params = json
            .get("params")
            .and_then(Value::as_object)
            .map(|params| {
                params
                    .iter()
                    .map(|(name, value)| {
                        let value = match value {
                            Value::String(text) => text.clone(),
                            other => other.to_string(),
                        };
                        (name.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(AuthorizeUploadResponse::New {
            url: url.to_string(),
            params,
            upload_key: upload_key.to_string(),
        })
    }
}

/// Group metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupResponse {
    /// Group id.
    pub id: i64,
    /// Group metadata version.
    pub version: u64,
    /// Display name.
    pub name: String,
    /// Owner user id.
    pub owner: u64,
    /// Admin user ids.
    pub admins: Vec<u64>,
    /// Who may edit metadata (`members` or `admins`).
    pub library_editing: String,
    /// Who may edit files (`members`, `admins` or `none`).
    pub file_editing: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupData {
    name: String,
    #[serde(default)]
    owner: u64,
    #[serde(default)]
    admins: Vec<u64>,
    #[serde(default = "default_editing")]
    library_editing: String,
    #[serde(default = "default_file_editing")]
    file_editing: String,
}

fn default_editing() -> String {
    "members".into()
}

fn default_file_editing() -> String {
    "none".into()
}

impl GroupResponse {
    /// Parses a group body.
    pub fn parse(json: &Value) -> ProtocolResult<Self> {
        let id = json
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ProtocolError::MissingField {
                field: "id",
                context: "group".into(),
            })?;
        let version = json.get("version").and_then(Value::as_u64).unwrap_or(0);
        let data: GroupData = serde_json::from_value(
            json.get("data")
                .cloned()
                .ok_or_else(|| ProtocolError::MissingField {
                    field: "data",
                    context: format!("group {}", id),
                })?,
        )?;
        Ok(Self {
            id,
            version,
            name: data.name,
            owner: data.owner,
            admins: data.admins,
            library_editing: data.library_editing,
            file_editing: data.file_editing,
        })
    }

    fn is_admin(&self, user_id: u64) -> bool {
        self.owner == user_id || self.admins.contains(&user_id)
    }

    /// Returns true if `user_id` may edit metadata.
    pub fn can_edit_metadata(&self, user_id: u64) -> bool {
        self.library_editing == "members" || self.is_admin(user_id)
    }

    /// Returns true if `user_id` may edit files.
    pub fn can_edit_files(&self, user_id: u64) -> bool {
        match self.file_editing.as_str() {
            "members" => true,
            "admins" => self.is_admin(user_id),
            _ => false,
        }
    }
}
