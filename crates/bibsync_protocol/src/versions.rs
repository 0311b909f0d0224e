//! Per-library version cursors.

use crate::object::SyncObject;
use serde::{Deserialize, Serialize};

/// Which version cursor of a library is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateVersionType {
    /// The cursor of one object type.
    Object(SyncObject),
    /// The cursor of the deletion log.
    Deletions,
}

/// Known remote versions of one library, one cursor per object type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versions {
    /// Collections cursor.
    pub collections: u64,
    /// Items cursor.
    pub items: u64,
    /// Trash cursor.
    pub trash: u64,
    /// Searches cursor.
    pub searches: u64,
    /// Deletion log cursor.
    pub deletions: u64,
    /// Settings cursor.
    pub settings: u64,
}

impl Versions {
    /// Returns the cursor addressed by `version_type`.
    pub fn get(&self, version_type: UpdateVersionType) -> u64 {
        match version_type {
            UpdateVersionType::Object(SyncObject::Collection) => self.collections,
            UpdateVersionType::Object(SyncObject::Item) => self.items,
            UpdateVersionType::Object(SyncObject::Trash) => self.trash,
            UpdateVersionType::Object(SyncObject::Search) => self.searches,
            UpdateVersionType::Object(SyncObject::Settings) => self.settings,
            UpdateVersionType::Deletions => self.deletions,
        }
    }

    /// Advances the cursor addressed by `version_type`.
    ///
    /// Cursors never move backwards. Returns true if the cursor changed.
    pub fn advance(&mut self, version_type: UpdateVersionType, version: u64) -> bool {
        let slot = match version_type {
            UpdateVersionType::Object(SyncObject::Collection) => &mut self.collections,
            UpdateVersionType::Object(SyncObject::Item) => &mut self.items,
            UpdateVersionType::Object(SyncObject::Trash) => &mut self.trash,
            UpdateVersionType::Object(SyncObject::Search) => &mut self.searches,
            UpdateVersionType::Object(SyncObject::Settings) => &mut self.settings,
            UpdateVersionType::Deletions => &mut self.deletions,
        };
        if version > *slot {
            *slot = version;
            true
        } else {
            false
        }
    }

    /// Returns the highest known cursor.
    pub fn max(&self) -> u64 {
        [
            self.collections,
            self.items,
            self.trash,
            self.searches,
            self.deletions,
            self.settings,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn advance_is_monotonic() {
        let mut versions = Versions::default();
        let items = UpdateVersionType::Object(SyncObject::Item);

        assert!(versions.advance(items, 10));
        assert!(!versions.advance(items, 4));
        assert!(!versions.advance(items, 10));
        assert_eq!(versions.get(items), 10);
        assert_eq!(versions.trash, 0);
    }

    #[test]
    fn max_covers_all_cursors() {
        let versions = Versions {
            deletions: 17,
            items: 3,
            ..Versions::default()
        };
        assert_eq!(versions.max(), 17);
    }

    proptest! {
        #[test]
        fn any_sequence_never_decreases(updates in prop::collection::vec(0u64..1000, 0..50)) {
            let mut versions = Versions::default();
            let mut last = 0;
            for version in updates {
                versions.advance(UpdateVersionType::Deletions, version);
                prop_assert!(versions.deletions >= last);
                last = versions.deletions;
            }
        }
    }
}
