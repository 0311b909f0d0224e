//! Item schema used to validate item payloads.

use serde::{Deserialize, Serialize};

/// A non-fatal problem found while validating an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldIssue {
    /// The field is not part of the item type.
    UnknownField(String),
    /// The field has a value of the wrong shape and was ignored.
    InvalidValue(String),
}

/// Knowledge about item types and their fields.
pub trait Schema: Send + Sync {
    /// Returns true if `item_type` is a known item type.
    fn is_known_item_type(&self, item_type: &str) -> bool;

    /// Returns true if `field` may appear on `item_type`.
    fn is_valid_field(&self, item_type: &str, field: &str) -> bool;
}

/// Fields every item may carry.
const BASE_FIELDS: &[&str] = &[
    "key",
    "version",
    "itemType",
    "parentItem",
    "collections",
    "tags",
    "relations",
    "dateAdded",
    "dateModified",
    "deleted",
    "inPublications",
    "creators",
    "extra",
];

const REGULAR_FIELDS: &[&str] = &[
    "title",
    "abstractNote",
    "date",
    "language",
    "shortTitle",
    "url",
    "accessDate",
    "archive",
    "archiveLocation",
    "libraryCatalog",
    "callNumber",
    "rights",
];

const BOOK_FIELDS: &[&str] = &[
    "series",
    "seriesNumber",
    "volume",
    "numberOfVolumes",
    "edition",
    "place",
    "publisher",
    "numPages",
    "ISBN",
];

const ARTICLE_FIELDS: &[&str] = &[
    "publicationTitle",
    "volume",
    "issue",
    "pages",
    "series",
    "seriesTitle",
    "seriesText",
    "journalAbbreviation",
    "DOI",
    "ISSN",
];

const SECTION_FIELDS: &[&str] = &["bookTitle", "pages", "publisher", "place", "ISBN", "edition"];

const WEB_FIELDS: &[&str] = &["websiteTitle", "websiteType"];

const THESIS_FIELDS: &[&str] = &["thesisType", "university", "place", "numPages"];

const REPORT_FIELDS: &[&str] = &[
    "reportNumber",
    "reportType",
    "seriesTitle",
    "place",
    "institution",
    "pages",
];

const NOTE_FIELDS: &[&str] = &["note"];

const ATTACHMENT_FIELDS: &[&str] = &[
    "title",
    "linkMode",
    "contentType",
    "charset",
    "filename",
    "md5",
    "mtime",
    "url",
    "accessDate",
    "path",
    "note",
];

const ANNOTATION_FIELDS: &[&str] = &[
    "annotationType",
    "annotationText",
    "annotationComment",
    "annotationColor",
    "annotationPageLabel",
    "annotationSortIndex",
    "annotationPosition",
    "annotationAuthorName",
    "annotationIsExternal",
];

/// Schema covering the common item types, notes, attachments and annotations.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinSchema;

impl BuiltinSchema {
    fn type_fields(item_type: &str) -> Option<&'static [&'static [&'static str]]> {
        let fields: &'static [&'static [&'static str]] = match item_type {
            "book" => &[REGULAR_FIELDS, BOOK_FIELDS],
            "bookSection" => &[REGULAR_FIELDS, SECTION_FIELDS],
            "journalArticle" | "magazineArticle" | "newspaperArticle" => {
                &[REGULAR_FIELDS, ARTICLE_FIELDS]
            }
            "webpage" | "blogPost" => &[REGULAR_FIELDS, WEB_FIELDS],
            "thesis" => &[REGULAR_FIELDS, THESIS_FIELDS],
            "report" => &[REGULAR_FIELDS, REPORT_FIELDS],
            "document" => &[REGULAR_FIELDS, &["publisher"]],
            "note" => &[NOTE_FIELDS],
            "attachment" => &[ATTACHMENT_FIELDS],
            "annotation" => &[ANNOTATION_FIELDS],
            _ => return None,
        };
        Some(fields)
    }
}

impl Schema for BuiltinSchema {
    fn is_known_item_type(&self, item_type: &str) -> bool {
        Self::type_fields(item_type).is_some()
    }

    fn is_valid_field(&self, item_type: &str, field: &str) -> bool {
        if BASE_FIELDS.contains(&field) {
            return true;
        }
        Self::type_fields(item_type)
            .map(|groups| groups.iter().any(|group| group.contains(&field)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types() {
        let schema = BuiltinSchema;
        assert!(schema.is_known_item_type("journalArticle"));
        assert!(schema.is_known_item_type("annotation"));
        assert!(!schema.is_known_item_type("hologram"));
    }

    #[test]
    fn fields_per_type() {
        let schema = BuiltinSchema;
        assert!(schema.is_valid_field("book", "ISBN"));
        assert!(schema.is_valid_field("book", "tags"));
        assert!(!schema.is_valid_field("note", "ISBN"));
        assert!(schema.is_valid_field("annotation", "annotationPosition"));
        assert!(!schema.is_valid_field("hologram", "title"));
    }
}
