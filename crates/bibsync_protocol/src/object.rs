//! Syncable object types and their behaviour table.

use crate::response::{parse_collection, parse_item, parse_search, ObjectParseError, ObjectResponse};
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Storage kinds of syncable objects.
///
/// Trash is not a storage kind: trashed items are items with the trash flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    /// A collection.
    Collection,
    /// An item (regular item, note, attachment or annotation).
    Item,
    /// A saved search.
    Search,
}

impl ObjectKind {
    /// Name used for conflicts, cache folders and logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjectKind::Collection => "collection",
            ObjectKind::Item => "item",
            ObjectKind::Search => "search",
        }
    }

    /// Inverse of [`ObjectKind::type_name`].
    pub fn from_type_name(name: &str) -> Option<ObjectKind> {
        match name {
            "collection" => Some(ObjectKind::Collection),
            "item" => Some(ObjectKind::Item),
            "search" => Some(ObjectKind::Search),
            _ => None,
        }
    }
}

/// Object types the engine synchronizes, each with its own version cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SyncObject {
    /// Collections.
    Collection,
    /// Items outside of trash.
    Item,
    /// Items in trash.
    Trash,
    /// Saved searches.
    Search,
    /// Library settings (tag colors, page indices).
    Settings,
}

/// Function decoding one object body from the API.
pub type ParseFn = fn(&Value, &dyn Schema) -> Result<ObjectResponse, ObjectParseError>;

/// Per-object behaviour, looked up once instead of matching on the object in every step.
pub struct ObjectTraits {
    /// The object this entry describes.
    pub object: SyncObject,
    /// Storage kind, `None` for settings.
    pub kind: Option<ObjectKind>,
    /// Path below the library prefix used for version listings.
    pub path: &'static str,
    /// Path below the library prefix used to fetch, write and delete objects.
    pub write_path: &'static str,
    /// Query parameter selecting objects by key.
    pub key_param: Option<&'static str>,
    /// Trash filter applied to local item storage.
    pub trash: Option<bool>,
    /// Name used for conflicts and logs.
    pub type_name: &'static str,
    /// Decoder for object bodies.
    pub parse: Option<ParseFn>,
}

impl fmt::Debug for ObjectTraits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectTraits")
            .field("object", &self.object)
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("key_param", &self.key_param)
            .field("trash", &self.trash)
            .finish_non_exhaustive()
    }
}

static COLLECTION: ObjectTraits = ObjectTraits {
    object: SyncObject::Collection,
    kind: Some(ObjectKind::Collection),
    path: "collections",
    write_path: "collections",
    key_param: Some("collectionKey"),
    trash: None,
    type_name: "collection",
    parse: Some(parse_collection),
};

static ITEM: ObjectTraits = ObjectTraits {
    object: SyncObject::Item,
    kind: Some(ObjectKind::Item),
    path: "items",
    write_path: "items",
    key_param: Some("itemKey"),
    trash: Some(false),
    type_name: "item",
    parse: Some(parse_item),
};

static TRASH: ObjectTraits = ObjectTraits {
    object: SyncObject::Trash,
    kind: Some(ObjectKind::Item),
    path: "items/trash",
    write_path: "items",
    key_param: Some("itemKey"),
    trash: Some(true),
    type_name: "item",
    parse: Some(parse_item),
};

static SEARCH: ObjectTraits = ObjectTraits {
    object: SyncObject::Search,
    kind: Some(ObjectKind::Search),
    path: "searches",
    write_path: "searches",
    key_param: Some("searchKey"),
    trash: None,
    type_name: "search",
    parse: Some(parse_search),
};

static SETTINGS: ObjectTraits = ObjectTraits {
    object: SyncObject::Settings,
    kind: None,
    path: "settings",
    write_path: "settings",
    key_param: None,
    trash: None,
    type_name: "settings",
    parse: None,
};

impl SyncObject {
    /// Object types synced per library, in pass order.
    pub const LIBRARY_OBJECTS: [SyncObject; 4] = [
        SyncObject::Collection,
        SyncObject::Search,
        SyncObject::Item,
        SyncObject::Trash,
    ];

    /// Returns the behaviour table entry for this object.
    pub fn traits(&self) -> &'static ObjectTraits {
        match self {
            SyncObject::Collection => &COLLECTION,
            SyncObject::Item => &ITEM,
            SyncObject::Trash => &TRASH,
            SyncObject::Search => &SEARCH,
            SyncObject::Settings => &SETTINGS,
        }
    }

    /// Returns the storage kind, if this object is stored as an object record.
    pub fn kind(&self) -> Option<ObjectKind> {
        self.traits().kind
    }

    /// Name used for conflicts and logs.
    pub fn type_name(&self) -> &'static str {
        self.traits().type_name
    }

    /// Returns the sync object for a storage kind, picking items over trash.
    pub fn for_kind(kind: ObjectKind, trash: bool) -> SyncObject {
        match kind {
            ObjectKind::Collection => SyncObject::Collection,
            ObjectKind::Search => SyncObject::Search,
            ObjectKind::Item if trash => SyncObject::Trash,
            ObjectKind::Item => SyncObject::Item,
        }
    }
}

impl fmt::Display for SyncObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.traits().path)
    }
}

/// How thoroughly a sync pass compares remote and local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncType {
    /// Only collections are synced.
    CollectionsOnly,
    /// Normal sync that ignores per-object backoff delays.
    IgnoreIndividualDelays,
    /// Normal sync.
    Normal,
    /// Every remote object is re-fetched and local drift is re-submitted.
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trash_and_items_share_storage() {
        assert_eq!(SyncObject::Item.kind(), SyncObject::Trash.kind());
        assert_eq!(SyncObject::Trash.traits().trash, Some(true));
        assert_eq!(SyncObject::Item.traits().trash, Some(false));
    }

    #[test]
    fn settings_have_no_storage_kind() {
        assert!(SyncObject::Settings.kind().is_none());
        assert!(SyncObject::Settings.traits().parse.is_none());
        assert!(SyncObject::Settings.traits().key_param.is_none());
    }

    #[test]
    fn traits_point_back_to_object() {
        for object in SyncObject::LIBRARY_OBJECTS {
            assert_eq!(object.traits().object, object);
        }
        assert_eq!(SyncObject::for_kind(ObjectKind::Item, true), SyncObject::Trash);
        assert_eq!(SyncObject::for_kind(ObjectKind::Search, true), SyncObject::Search);
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [ObjectKind::Collection, ObjectKind::Item, ObjectKind::Search] {
            assert_eq!(ObjectKind::from_type_name(kind.type_name()), Some(kind));
        }
        assert_eq!(ObjectKind::from_type_name("settings"), None);
    }
}
