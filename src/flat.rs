//! Flat in-memory lists.
//!
//! A flat list is a wrapper around a `Vec` of [`ListItem`]s, used for small
//! data that is reasonable to keep in memory all the time (device lists,
//! volume lists, and the like).

use crate::ids::ListId;
use crate::item::{ListItem, ListItemData};

/// Ordered in-memory sequence of list items.
#[derive(Debug, Default)]
pub struct FlatList<T> {
    items: Vec<ListItem<T>>,
}

impl<T: ListItemData> FlatList<T> {
    pub fn new() -> Self {
        FlatList { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append item to list, keeping it unsorted.
    pub fn append_unsorted(&mut self, item: ListItem<T>) {
        self.items.push(item);
    }

    pub fn insert_before(&mut self, idx: usize, item: ListItem<T>) {
        self.items.insert(idx, item);
    }

    /// Remove the item at `idx`, returning the id of its child list so the
    /// caller can purge the orphaned subtree.
    pub fn remove(&mut self, idx: usize) -> ListId {
        debug_assert!(idx < self.items.len());
        let child = self.items[idx].child_list();
        self.items.remove(idx);
        child
    }

    pub fn get(&self, idx: usize) -> Option<&ListItem<T>> {
        self.items.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut ListItem<T>> {
        self.items.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListItem<T>> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ListItem<T>> {
        self.items.iter_mut()
    }

    /// Find the physically stored item linking to the given child list.
    pub fn lookup_child_by_id(&self, child_id: ListId) -> Option<&ListItem<T>> {
        self.items.iter().find(|it| it.child_list() == child_id)
    }

    /// Find the index of the item linking to the given child list.
    pub fn lookup_item_index_by_child_id(&self, child_id: ListId) -> Option<u32> {
        self.items
            .iter()
            .position(|it| it.child_list() == child_id)
            .map(|pos| pos as u32)
    }

    pub(crate) fn enumerate_direct_sublists(&self, out: &mut Vec<ListId>) {
        for item in &self.items {
            let child = item.child_list();
            if child.is_valid() {
                out.push(child);
            }
        }
    }

    pub(crate) fn obliviate_child(&mut self, child_id: ListId) {
        for item in &mut self.items {
            if item.child_list() == child_id {
                item.obliviate_child();
            }
        }
    }
}
