//! Library identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of libraries owned by the signed-in user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CustomLibraryKind {
    /// The personal "My Library".
    MyLibrary,
}

/// Identifies an independent version namespace.
///
/// Every library carries its own version cursors, so all sync steps are
/// parameterized by one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LibraryIdentifier {
    /// A library owned by the user.
    Custom(CustomLibraryKind),
    /// A group library, by group id.
    Group(i64),
}

impl LibraryIdentifier {
    /// The personal library.
    pub const MY_LIBRARY: LibraryIdentifier = LibraryIdentifier::Custom(CustomLibraryKind::MyLibrary);

    /// Returns the API path prefix for this library (`users/{id}` or `groups/{id}`).
    pub fn api_path(&self, user_id: u64) -> String {
        match self {
            LibraryIdentifier::Custom(_) => format!("users/{}", user_id),
            LibraryIdentifier::Group(id) => format!("groups/{}", id),
        }
    }

    /// Returns a directory-safe name used for cached files.
    pub fn folder_name(&self) -> String {
        match self {
            LibraryIdentifier::Custom(CustomLibraryKind::MyLibrary) => "custom_my_library".into(),
            LibraryIdentifier::Group(id) => format!("group_{}", id),
        }
    }

    /// Returns true for group libraries.
    pub fn is_group(&self) -> bool {
        matches!(self, LibraryIdentifier::Group(_))
    }
}

impl fmt::Display for LibraryIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibraryIdentifier::Custom(CustomLibraryKind::MyLibrary) => write!(f, "My Library"),
            LibraryIdentifier::Group(id) => write!(f, "Group ({})", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_paths() {
        assert_eq!(LibraryIdentifier::MY_LIBRARY.api_path(42), "users/42");
        assert_eq!(LibraryIdentifier::Group(7).api_path(42), "groups/7");
    }

    #[test]
    fn folder_names_are_distinct() {
        assert_ne!(
            LibraryIdentifier::MY_LIBRARY.folder_name(),
            LibraryIdentifier::Group(1).folder_name()
        );
        assert_eq!(LibraryIdentifier::Group(12).folder_name(), "group_12");
    }
}
