//! List items and the contract for domain-specific item data.
//!
//! Each [`ListItem`] is one piece of actual data stored in some list: the
//! domain payload plus an optional link to a cached child list. The payload
//! type is kept free of trait objects since lists may hold tens of thousands
//! of items.

use crate::ids::ListId;

/// What an item represents to the navigation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListItemKind {
    /// Nothing known about the item.
    Opaque,
    /// A directory-like item that can be entered.
    Directory,
    /// A media server exposing a directory tree.
    ServerDevice,
    /// A storage device exposing a directory tree.
    StorageDevice,
    /// A playable leaf item.
    Playable,
}

impl ListItemKind {
    pub fn is_directory(self) -> bool {
        matches!(
            self,
            ListItemKind::Directory | ListItemKind::ServerDevice | ListItemKind::StorageDevice
        )
    }
}

/// Domain data embedded in a [`ListItem`].
///
/// `Default` must produce the reset state a fresh tile slot starts out with.
pub trait ListItemData: Default + Send {
    /// Return the item to its freshly-constructed state.
    fn reset(&mut self);

    /// Human-readable name for presentation.
    fn name(&self) -> &str;

    /// The kind of this item.
    fn kind(&self) -> ListItemKind;
}

/// One item of a list: domain payload plus child-list link.
#[derive(Debug, Default)]
pub struct ListItem<T> {
    child: ListId,
    data: T,
}

impl<T: ListItemData> ListItem<T> {
    pub fn new(data: T) -> Self {
        ListItem {
            child: ListId::INVALID,
            data,
        }
    }

    /// Reset to initialized state, clearing any child link.
    pub fn reset(&mut self) {
        self.data.reset();
        self.child = ListId::INVALID;
    }

    pub fn name(&self) -> &str {
        self.data.name()
    }

    pub fn kind(&self) -> ListItemKind {
        self.data.kind()
    }

    /// Record the cache id of the child list this item links to.
    ///
    /// Re-recording the same id is allowed; it undoes a prior obliviation of
    /// the slot.
    pub fn set_child_list(&mut self, child: ListId) {
        debug_assert!(child.is_valid());
        debug_assert!(!self.child.is_valid() || self.child == child);
        self.child = child;
    }

    /// Forget the child link after the child was discarded from cache.
    pub fn obliviate_child(&mut self) {
        debug_assert!(self.child.is_valid());
        self.child = ListId::INVALID;
    }

    /// Cache id of the child list, or the invalid id if the child does not
    /// exist (yet, or anymore).
    pub fn child_list(&self) -> ListId {
        self.child
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestItem;

    #[test]
    fn test_new_item_has_no_child() {
        let item: ListItem<TestItem> = ListItem::default();
        assert!(!item.child_list().is_valid());
    }

    #[test]
    fn test_child_link_lifecycle() {
        let mut item = ListItem::new(TestItem::dir("albums"));
        let child = ListId::new(5, false, 0);

        item.set_child_list(child);
        assert_eq!(item.child_list(), child);

        // setting the same id again is allowed
        item.set_child_list(child);
        assert_eq!(item.child_list(), child);

        item.obliviate_child();
        assert!(!item.child_list().is_valid());
    }

    #[test]
    fn test_reset_clears_child_and_data() {
        let mut item = ListItem::new(TestItem::dir("albums"));
        item.set_child_list(ListId::new(5, false, 0));

        item.reset();
        assert!(!item.child_list().is_valid());
        assert_eq!(item.name(), "");
        assert_eq!(item.kind(), ListItemKind::Opaque);
    }

    #[test]
    fn test_kind_directory_classification() {
        assert!(ListItemKind::Directory.is_directory());
        assert!(ListItemKind::ServerDevice.is_directory());
        assert!(ListItemKind::StorageDevice.is_directory());
        assert!(!ListItemKind::Playable.is_directory());
        assert!(!ListItemKind::Opaque.is_directory());
    }
}
