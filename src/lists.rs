//! The two list representations managed by the cache, unified for the tree
//! manager.
//!
//! Entry kinds are a tagged union rather than trait objects: the set of
//! representations is closed (flat and tiled), and dispatch stays visible at
//! the call sites that care about the difference.

use log::{error, warn};

use crate::cache::CachePayload;
use crate::error::{ListError, ListResult};
use crate::flat::FlatList;
use crate::ids::ListId;
use crate::item::{ListItem, ListItemData};
use crate::tiled::TiledList;

/// One cached list: either a small flat list or a tiled window over a large
/// logical sequence.
pub enum BrowseList<T, const N: usize> {
    Flat(FlatList<T>),
    Tiled(TiledList<T, N>),
}

impl<T: ListItemData + 'static, const N: usize> BrowseList<T, N> {
    /// Logical number of items, independent of what is physically stored.
    pub fn size(&self) -> usize {
        match self {
            BrowseList::Flat(list) => list.len(),
            BrowseList::Tiled(list) => list.len(),
        }
    }

    pub fn as_flat(&self) -> Option<&FlatList<T>> {
        match self {
            BrowseList::Flat(list) => Some(list),
            BrowseList::Tiled(_) => None,
        }
    }

    pub fn as_flat_mut(&mut self) -> Option<&mut FlatList<T>> {
        match self {
            BrowseList::Flat(list) => Some(list),
            BrowseList::Tiled(_) => None,
        }
    }

    pub fn as_tiled(&self) -> Option<&TiledList<T, N>> {
        match self {
            BrowseList::Flat(_) => None,
            BrowseList::Tiled(list) => Some(list),
        }
    }

    pub fn as_tiled_mut(&mut self) -> Option<&mut TiledList<T, N>> {
        match self {
            BrowseList::Flat(_) => None,
            BrowseList::Tiled(list) => Some(list),
        }
    }

    /// Random access to the item at `idx`, materializing it if necessary.
    pub fn with_item<R>(
        &mut self,
        list_id: ListId,
        idx: u32,
        f: impl FnOnce(&ListItem<T>) -> R,
    ) -> ListResult<R> {
        match self {
            BrowseList::Flat(list) => list.get(idx as usize).map(f).ok_or(ListError::InvalidId),
            BrowseList::Tiled(list) => list.with_item(list_id, idx, f),
        }
    }

    pub fn with_item_mut<R>(
        &mut self,
        list_id: ListId,
        idx: u32,
        f: impl FnOnce(&mut ListItem<T>) -> R,
    ) -> ListResult<R> {
        match self {
            BrowseList::Flat(list) => list
                .get_mut(idx as usize)
                .map(f)
                .ok_or(ListError::InvalidId),
            BrowseList::Tiled(list) => list.with_item_mut(list_id, idx, f),
        }
    }

    /// Mutate the item at `idx` only if it is physically stored right now.
    pub fn with_cached_item_mut<R>(
        &mut self,
        idx: u32,
        f: impl FnOnce(&mut ListItem<T>) -> R,
    ) -> ListResult<R> {
        match self {
            BrowseList::Flat(list) => list
                .get_mut(idx as usize)
                .map(f)
                .ok_or(ListError::InvalidId),
            BrowseList::Tiled(list) => list.with_cached_item_mut(idx, f),
        }
    }

    /// Index of the item linking to the given child list, searching the
    /// physically stored items only.
    pub fn lookup_item_index_by_child_id(&self, child_id: ListId) -> Option<u32> {
        match self {
            BrowseList::Flat(list) => list.lookup_item_index_by_child_id(child_id),
            BrowseList::Tiled(list) => list.lookup_item_index_by_child_id(child_id),
        }
    }

    /// Warm the cache for a range read. Returns `true` when the range is
    /// covered; flat lists have no caching mechanism and always return
    /// `false`.
    pub fn prefetch_range(&mut self, list_id: ListId, first: u32, count: usize) -> bool {
        match self {
            BrowseList::Flat(_) => false,
            BrowseList::Tiled(list) => list.prefetch_range(list_id, first, count),
        }
    }
}

impl<T: ListItemData + 'static, const N: usize> CachePayload for BrowseList<T, N> {
    fn enumerate_direct_sublists(&self, out: &mut Vec<ListId>) {
        match self {
            BrowseList::Flat(list) => list.enumerate_direct_sublists(out),
            BrowseList::Tiled(list) => list.enumerate_direct_sublists(out),
        }
    }

    fn obliviate_child(&mut self, child_id: ListId) {
        match self {
            BrowseList::Flat(list) => list.obliviate_child(child_id),
            BrowseList::Tiled(list) => list.obliviate_child(child_id),
        }
    }
}

/// Efficient iteration over a range of items in a list.
///
/// `apply` is called for each item in the range of (up to) `count` items
/// starting at `first`; it returns `true` to continue, `false` to stop
/// early (which is not an error). `count == 0` means "to the end of the
/// list".
///
/// Tiled lists get their tiles prefetched once when the range fits the
/// window, so iteration does not thrash the tiles; oversized ranges fall
/// back to per-element access.
pub fn for_each_item<T: ListItemData + 'static, const N: usize>(
    list: &mut BrowseList<T, N>,
    list_id: ListId,
    first: u32,
    count: usize,
    mut apply: impl FnMut(u32, &ListItem<T>) -> bool,
) -> ListResult<()> {
    let end = if count > 0 {
        std::cmp::min(first as usize + count, list.size())
    } else {
        list.size()
    };

    if first as usize >= end {
        if count > 0 {
            warn!(
                "client requested {} items starting at index {}, but list size is {}",
                count, first, end
            );
        }

        return Ok(());
    }

    let span = end - first as usize;

    match list {
        BrowseList::Flat(flat) => {
            for i in first as usize..end {
                let item = flat.get(i).ok_or(ListError::Internal)?;

                if !apply(i as u32, item) {
                    break;
                }
            }

            Ok(())
        }
        BrowseList::Tiled(tiled) => {
            if tiled.prefetch_range(list_id, first, span) {
                let mut iter = tiled.iter(first);

                for _ in 0..span {
                    match iter.next_with(&mut apply) {
                        Some(true) => {}
                        Some(false) => break,
                        None => {
                            let e = iter.take_error();
                            error!(
                                "failed iterating over list range [{}, {}): {}",
                                first, end, e
                            );
                            return Err(e);
                        }
                    }
                }

                Ok(())
            } else {
                // too many elements for the window, use simple iteration
                for i in first..end as u32 {
                    match tiled.with_item(list_id, i, |item| apply(i, item)) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            error!(
                                "failed iterating over list range [{}, {}): {}",
                                first, end, e
                            );
                            return Err(e);
                        }
                    }
                }

                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FillerPool;
    use crate::test_utils::{SequenceFiller, TestItem};
    use std::sync::Arc;

    const T: usize = 8;
    type TestBrowseList = BrowseList<TestItem, T>;

    fn lid() -> ListId {
        ListId::new(1, false, 0)
    }

    fn tiled_list(len: usize) -> (TestBrowseList, Arc<SequenceFiller>) {
        let pool = Arc::new(FillerPool::new(true));
        pool.start(2);

        let filler = Arc::new(SequenceFiller::new(len));
        let list = BrowseList::Tiled(TiledList::new(len, filler.clone(), pool));

        (list, filler)
    }

    fn flat_list(len: usize) -> TestBrowseList {
        let mut list = FlatList::new();
        for i in 0..len {
            list.append_unsorted(ListItem::new(TestItem::file(&format!("item-{}", i))));
        }
        BrowseList::Flat(list)
    }

    #[test]
    fn test_for_each_over_flat_list() {
        let mut list = flat_list(5);
        let mut seen = Vec::new();

        for_each_item(&mut list, lid(), 1, 3, |idx, item| {
            seen.push((idx, item.name().to_string()));
            true
        })
        .unwrap();

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (1, "item-1".to_string()));
        assert_eq!(seen[2], (3, "item-3".to_string()));
    }

    #[test]
    fn test_for_each_over_tiled_list_prefetches_once() {
        let (mut list, filler) = tiled_list(83);

        let mut seen = Vec::new();
        for_each_item(&mut list, lid(), 8, 16, |idx, item| {
            seen.push((idx, item.name().to_string()));
            true
        })
        .unwrap();

        assert_eq!(seen.len(), 16);
        assert_eq!(seen[0].1, "item-8");
        assert_eq!(seen[15].1, "item-23");
        let calls = filler.fill_calls();

        // iterating the same range again touches no tiles
        for_each_item(&mut list, lid(), 8, 16, |_, _| true).unwrap();
        assert_eq!(filler.fill_calls(), calls);
    }

    #[test]
    fn test_for_each_early_stop() {
        let (mut list, _filler) = tiled_list(83);

        let mut seen = 0;
        for_each_item(&mut list, lid(), 0, 20, |_, _| {
            seen += 1;
            seen < 5
        })
        .unwrap();

        assert_eq!(seen, 5);
    }

    #[test]
    fn test_for_each_oversized_range_falls_back() {
        let (mut list, _filler) = tiled_list(100);

        let mut seen = Vec::new();
        for_each_item(&mut list, lid(), 0, 40, |idx, _| {
            seen.push(idx);
            true
        })
        .unwrap();

        assert_eq!(seen, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn test_for_each_count_zero_means_whole_list() {
        let mut list = flat_list(4);
        let mut seen = 0;
        for_each_item(&mut list, lid(), 0, 0, |_, _| {
            seen += 1;
            true
        })
        .unwrap();
        assert_eq!(seen, 4);
    }

    #[test]
    fn test_for_each_out_of_range_is_harmless() {
        let mut list = flat_list(4);
        let mut seen = 0;
        for_each_item(&mut list, lid(), 10, 5, |_, _| {
            seen += 1;
            true
        })
        .unwrap();
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_size_dispatch() {
        let (tiled, _) = tiled_list(83);
        assert_eq!(tiled.size(), 83);
        assert!(tiled.as_tiled().is_some());
        assert!(tiled.as_flat().is_none());

        let flat = flat_list(3);
        assert_eq!(flat.size(), 3);
        assert!(flat.as_flat().is_some());
    }

    #[test]
    fn test_obliviate_dispatch() {
        let mut flat = flat_list(3);
        let child = ListId::new(9, false, 0);
        flat.with_cached_item_mut(1, |it| it.set_child_list(child))
            .unwrap();

        let mut ids = Vec::new();
        flat.enumerate_direct_sublists(&mut ids);
        assert_eq!(ids, vec![child]);

        flat.obliviate_child(child);
        ids.clear();
        flat.enumerate_direct_sublists(&mut ids);
        assert!(ids.is_empty());
    }
}
