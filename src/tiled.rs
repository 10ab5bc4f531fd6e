//! Tiled lists and the three-tile window.
//!
//! For very large lists, or when retrieving list content is expensive,
//! fetching data on demand beats loading everything up front. A tiled list
//! keeps three consecutive chunks of the logical sequence hot: the *center*
//! tile holding the most recently accessed item, plus the *up* and *down*
//! tiles prefetching the content before and after it. Scrolling through the
//! list slides the window so adjacent content is already in memory when the
//! user gets there.
//!
//! Random access is supported but slides the window on every tile-boundary
//! crossing; ranges should go through [`crate::lists::for_each_item`] or
//! [`TiledList::prefetch_range`] plus the iterator instead.

use std::sync::Arc;

use log::{debug, error};

use crate::error::{ListError, ListResult};
use crate::ids::ListId;
use crate::item::{ListItem, ListItemData};
use crate::pool::{FillerPool, TiledListFiller};
use crate::tile::{Tile, TileState};

/// Number of tiles maintained by the window.
pub const ACTIVE_TILE_COUNT: usize = 3;

/// Window slot, in iteration order Up → Center → Down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Up,
    Center,
    Down,
}

fn si(slot: Slot) -> usize {
    match slot {
        Slot::Up => 0,
        Slot::Center => 1,
        Slot::Down => 2,
    }
}

/// Cyclic successor used by the iterator: Down → Up → Center → Down.
fn next_slot_cyclic(slot: Slot) -> Slot {
    match slot {
        Slot::Down => Slot::Up,
        Slot::Up => Slot::Center,
        Slot::Center => Slot::Down,
    }
}

/// The slot at which an iteration starting at `first` must stop.
fn determine_last_slot(first: Slot) -> Slot {
    match first {
        Slot::Down => Slot::Center,
        Slot::Up => Slot::Down,
        Slot::Center => Slot::Up,
    }
}

/// Three-tile window over a logical item sequence.
///
/// Owns three physical "hot" tiles and maps them onto the Up/Center/Down
/// slots. All methods must be called from the reader thread.
pub struct TileWindow<T, const N: usize> {
    pool: Arc<FillerPool<T, N>>,
    hot: [Arc<Tile<T, N>>; ACTIVE_TILE_COUNT],
    active: [Option<usize>; ACTIVE_TILE_COUNT],
}

impl<T: ListItemData + 'static, const N: usize> TileWindow<T, N> {
    pub fn new(pool: Arc<FillerPool<T, N>>) -> Self {
        TileWindow {
            pool,
            hot: std::array::from_fn(|_| Arc::new(Tile::new())),
            active: [None; ACTIVE_TILE_COUNT],
        }
    }

    pub fn empty(&self) -> bool {
        self.active.iter().all(|slot| slot.is_none())
    }

    fn active_tile(&self, slot: Slot) -> Option<&Arc<Tile<T, N>>> {
        self.active[si(slot)].map(|h| &self.hot[h])
    }

    /// Which slot contains the given item index, if any.
    fn contains(&self, idx: u32) -> Option<Slot> {
        for slot in [Slot::Up, Slot::Center, Slot::Down] {
            if let Some(tile) = self.active_tile(slot) {
                if tile.is_tile_for(idx) {
                    return Some(slot);
                }
            }
        }

        None
    }

    fn find_free_hot(&self) -> usize {
        self.hot
            .iter()
            .position(|t| t.is_free())
            .expect("a free hot tile must exist")
    }

    /// Some index inside the tile adjacent to the tile of `idx`, wrapping to
    /// the opposite end of the list when the adjacent range would fall
    /// outside it.
    fn index_in_adjacent_tile(idx: u32, total: usize, direction: Slot) -> u32 {
        match direction {
            Slot::Up => {
                if idx >= N as u32 {
                    idx - N as u32
                } else {
                    (total - 1) as u32
                }
            }
            Slot::Center => idx,
            Slot::Down => {
                if idx as usize + N < total {
                    idx + N as u32
                } else {
                    0
                }
            }
        }
    }

    /// Low-level sliding step. `push_out` and `keep` must be Up and Down in
    /// some order; together they define the sliding direction. The pushed-out
    /// tile is recycled to fetch the range adjacent to `keep`.
    fn slide(
        &mut self,
        filler: &Arc<dyn TiledListFiller<T>>,
        list_id: ListId,
        idx: u32,
        total: usize,
        push_out: Slot,
        keep: Slot,
    ) {
        let temp = self.active[si(push_out)];
        self.active[si(push_out)] = self.active[si(Slot::Center)];
        self.active[si(Slot::Center)] = self.active[si(keep)];
        self.active[si(keep)] = temp;

        debug_assert!(self.active[si(push_out)].is_some());

        let adjacent = Self::index_in_adjacent_tile(idx, total, keep);

        if let Some(h) = temp {
            let tile = &self.hot[h];

            if tile.is_tile_for(adjacent) {
                // the list is short and resides completely in memory
                debug_assert!(self.active[si(Slot::Center)].is_some());
                return;
            }

            debug_assert!(!tile.is_free());
            self.pool.cancel_filler(tile);
            tile.reset();
        }

        if self.active[si(Slot::Center)].is_none() {
            debug!("materialize center tile around index {}", idx);

            let h = self.find_free_hot();
            self.hot[h].activate(idx);
            self.active[si(Slot::Center)] = Some(h);
            self.pool
                .enqueue(Arc::clone(&self.hot[h]), Arc::clone(filler), list_id);
        }

        if let Some(h) = temp {
            debug!("materialize adjacent tile around index {}", adjacent);
            self.hot[h].activate(adjacent);
            self.pool
                .enqueue(Arc::clone(&self.hot[h]), Arc::clone(filler), list_id);
        }

        self.pool.wait_empty_if_synchronized();
    }

    fn slide_up(
        &mut self,
        filler: &Arc<dyn TiledListFiller<T>>,
        list_id: ListId,
        idx: u32,
        total: usize,
        steps: u32,
    ) {
        debug_assert!(steps > 0 && (steps as usize) < ACTIVE_TILE_COUNT * N);

        for i in 0..steps {
            self.slide(
                filler,
                list_id,
                idx + (steps - i - 1) * N as u32,
                total,
                Slot::Down,
                Slot::Up,
            );
        }
    }

    fn slide_down(
        &mut self,
        filler: &Arc<dyn TiledListFiller<T>>,
        list_id: ListId,
        idx: u32,
        total: usize,
        steps: u32,
    ) {
        debug_assert!(steps > 0 && (steps as usize) < ACTIVE_TILE_COUNT * N);

        for i in 0..steps {
            self.slide(
                filler,
                list_id,
                idx - (steps - i - 1) * N as u32,
                total,
                Slot::Up,
                Slot::Down,
            );
        }
    }

    /// Fresh three-tile fill around `center_idx`; the window must be rebuilt
    /// from scratch. Activates Center, then Down if the list is longer than
    /// one tile, then Up if longer than two, wrapping around list ends.
    fn fill(
        &mut self,
        filler: &Arc<dyn TiledListFiller<T>>,
        list_id: ListId,
        center_idx: u32,
        total: usize,
    ) {
        self.clear();

        if total == 0 {
            return;
        }

        self.hot[0].activate(center_idx);
        self.active[si(Slot::Center)] = Some(0);
        self.pool
            .enqueue(Arc::clone(&self.hot[0]), Arc::clone(filler), list_id);

        let base = self.hot[0].base();

        if total > N {
            let down_idx = if (base as usize) < total - N {
                base + N as u32
            } else {
                0
            };

            self.hot[1].activate(down_idx);
            self.active[si(Slot::Down)] = Some(1);
            self.pool
                .enqueue(Arc::clone(&self.hot[1]), Arc::clone(filler), list_id);

            if total > 2 * N {
                let up_idx = if base > 0 {
                    base - N as u32
                } else {
                    (total - 1) as u32
                };

                self.hot[2].activate(up_idx);
                self.active[si(Slot::Up)] = Some(2);
                self.pool
                    .enqueue(Arc::clone(&self.hot[2]), Arc::clone(filler), list_id);
            }
        }

        self.pool.wait_empty_if_synchronized();
    }

    /// Cancel all fills and drop every hot tile back to `Free`.
    pub fn clear(&mut self) {
        self.pool.cancel_all_queued_fillers();

        for tile in &self.hot {
            if !tile.is_free() {
                self.pool.cancel_filler(tile);
                tile.reset();
            }
        }

        self.active = [None; ACTIVE_TILE_COUNT];
    }

    fn compute_required_slides(direction: Slot, is_first_item: bool, spanned: u32) -> (u32, Slot) {
        match direction {
            Slot::Up => (if is_first_item { 0 } else { spanned - 1 }, Slot::Up),
            Slot::Down => (if is_first_item { spanned - 1 } else { 0 }, Slot::Down),
            Slot::Center => {
                let required = if spanned >= 2 { spanned - 2 } else { 0 };

                let direction = if required > 0 {
                    if is_first_item {
                        Slot::Up
                    } else {
                        Slot::Down
                    }
                } else {
                    Slot::Center
                };

                (required, direction)
            }
        }
    }

    /// Check how the requested range overlaps the current window.
    ///
    /// Returns the number of slides required to cover the range, the number
    /// of tiles the range spans, and the slide direction (`None` when the
    /// range does not overlap the window at all).
    fn check_overlapping_range(&self, first: u32, count: usize) -> (u32, u32, Option<Slot>) {
        let position_of_first_in_tile = first as usize % N;
        let spanned = (1 + (position_of_first_in_tile + count - 1) / N) as u32;

        debug_assert!(spanned >= 1 && spanned <= ACTIVE_TILE_COUNT as u32);

        if let Some(direction) = self.contains(first) {
            let (required, direction) = Self::compute_required_slides(direction, true, spanned);
            debug_assert!(required < ACTIVE_TILE_COUNT as u32);
            return (required, spanned, Some(direction));
        }

        if spanned > 1 {
            let last = first + count as u32 - 1;

            if let Some(direction) = self.contains(last) {
                let (required, direction) =
                    Self::compute_required_slides(direction, false, spanned);
                debug_assert!(required < ACTIVE_TILE_COUNT as u32);
                return (required, spanned, Some(direction));
            }
        }

        (ACTIVE_TILE_COUNT as u32, spanned, None)
    }

    /// Bring the range `[first, first + count)` into the window.
    ///
    /// Returns `true` if the range is (or becomes) covered by the hot tiles,
    /// `false` if it cannot fit (more than three tiles, or `count == 0`).
    /// With `auto_slide`, a range already at the window's edge still slides
    /// once so the accessed tile ends up centered.
    pub fn prefetch(
        &mut self,
        filler: &Arc<dyn TiledListFiller<T>>,
        list_id: ListId,
        first: u32,
        count: usize,
        total: usize,
        auto_slide: bool,
    ) -> bool {
        if count == 0 {
            return false;
        }

        let position_of_first_in_tile = first as usize % N;

        if count + position_of_first_in_tile > ACTIVE_TILE_COUNT * N {
            // need more than three tiles for this
            return false;
        }

        let (mut required_slides, spanned_tiles, direction) =
            self.check_overlapping_range(first, count);

        if required_slides == 0 {
            if auto_slide && matches!(direction, Some(Slot::Up) | Some(Slot::Down)) {
                required_slides = 1;
            } else {
                debug!("no need to prefetch index {}, already in cache", first);
                return true;
            }
        }

        let center_index = if (auto_slide && spanned_tiles < ACTIVE_TILE_COUNT as u32)
            || (direction.is_none() && spanned_tiles < ACTIVE_TILE_COUNT as u32)
            || (direction == Some(Slot::Down) && required_slides == 1)
        {
            // fewer than three tiles required, up tile remains empty
            first
        } else {
            // need three tiles, make sure first ends up in the up tile
            first + N as u32
        };

        match direction {
            Some(Slot::Center) => {
                error!("BUG: invalid slide direction");
                false
            }
            Some(Slot::Up) => {
                debug!("slide up to index {}", first);
                self.slide_up(filler, list_id, center_index, total, required_slides);
                true
            }
            Some(Slot::Down) => {
                debug!("slide down to index {}", first);
                self.slide_down(filler, list_id, center_index, total, required_slides);
                true
            }
            None => {
                debug!("prefetch {} items, starting at index {}", count, first);
                self.fill(filler, list_id, center_index, total);
                true
            }
        }
    }

    /// Read the item at `idx` from the center tile. The index must have been
    /// materialized into the center tile beforehand.
    fn with_center_item<R>(
        &self,
        idx: u32,
        f: impl FnOnce(&ListItem<T>) -> R,
    ) -> ListResult<R> {
        let tile = self.active_tile(Slot::Center).ok_or(ListError::Internal)?;
        let raw = (idx - tile.base()) as usize;
        tile.with_ready(|inner| f(inner.item(raw)))
    }

    fn with_center_item_mut<R>(
        &self,
        idx: u32,
        f: impl FnOnce(&mut ListItem<T>) -> R,
    ) -> ListResult<R> {
        let tile = self.active_tile(Slot::Center).ok_or(ListError::Internal)?;
        let raw = (idx - tile.base()) as usize;
        tile.with_ready_mut(|inner| f(inner.item_mut(raw)))
    }

    /// Mutate the item at `idx` if it is physically present in some hot
    /// tile. Never materializes.
    fn with_cached_item_mut<R>(
        &self,
        idx: u32,
        f: impl FnOnce(&mut ListItem<T>) -> R,
    ) -> ListResult<R> {
        let slot = self.contains(idx).ok_or(ListError::NotFound)?;
        let tile = self.active_tile(slot).ok_or(ListError::Internal)?;
        let raw = (idx - tile.base()) as usize;
        tile.with_ready_mut(|inner| f(inner.item_mut(raw)))
    }

    pub fn iter(&self, first: u32) -> WindowIter<'_, T, N> {
        WindowIter::new(self, (first as usize % N) as u16, self.contains(first))
    }

    pub fn iter_all(&self) -> WindowIter<'_, T, N> {
        WindowIter::new(self, 0, Some(Slot::Up))
    }

    /// Clear any physically stored reference to the given child list.
    ///
    /// Only ready tiles are touched; a tile that is still being filled
    /// cannot reference the child (fills start from reset items, and child
    /// links are recorded by the reader thread only).
    fn obliviate_child(&self, child_id: ListId) {
        for slot in [Slot::Up, Slot::Center, Slot::Down] {
            let Some(tile) = self.active_tile(slot) else {
                continue;
            };

            let Some(mut inner) = tile.try_lock() else {
                continue;
            };

            if inner.state() != TileState::Ready {
                continue;
            }

            for raw in 0..inner.stored() as usize {
                if inner.item(raw).child_list() == child_id {
                    inner.item_mut(raw).obliviate_child();
                }
            }
        }
    }
}

/// Forward-only iterator over the items cached in the current window.
///
/// Traverses tiles starting at the slot containing the begin index, in the
/// cyclic slot order, stopping after the last slot. Per-tile failures are
/// recorded and the traversal continues with the next slot; callers that run
/// out of items before their range ends retrieve the failure with
/// [`WindowIter::take_error`].
pub struct WindowIter<'w, T, const N: usize> {
    window: &'w TileWindow<T, N>,
    last_slot: Option<Slot>,
    slot: Option<Slot>,
    idx: u16,
    first_error: Option<ListError>,
}

impl<'w, T: ListItemData + 'static, const N: usize> WindowIter<'w, T, N> {
    fn new(window: &'w TileWindow<T, N>, idx: u16, slot: Option<Slot>) -> Self {
        let mut iter = WindowIter {
            window,
            last_slot: slot.map(determine_last_slot),
            slot,
            idx: 0,
            first_error: None,
        };

        iter.find_first();

        if iter.slot.is_some() {
            iter.idx = idx;
        }

        iter
    }

    /// Item index (within the whole list) of the current position.
    pub fn item_id(&self) -> Option<u32> {
        let tile = self.window.active_tile(self.slot?)?;
        Some(tile.base() + self.idx as u32)
    }

    /// The first error recorded during traversal, or `Internal` if none.
    pub fn take_error(&self) -> ListError {
        self.first_error.unwrap_or(ListError::Internal)
    }

    /// Yield the current item to `f` and advance. Returns `None` when the
    /// window is exhausted or the current tile cannot be read.
    pub fn next_with<R>(&mut self, f: impl FnOnce(u32, &ListItem<T>) -> R) -> Option<R> {
        let window = self.window;
        let slot = self.slot?;
        let tile = window.active_tile(slot)?;

        let item_id = tile.base() + self.idx as u32;
        let raw = self.idx as usize;

        match tile.with_ready(|inner| f(item_id, inner.item(raw))) {
            Ok(result) => {
                if self.step() {
                    self.find_first();
                }

                Some(result)
            }
            Err(e) => {
                self.put_error(e);
                self.slot = None;
                None
            }
        }
    }

    fn put_error(&mut self, e: ListError) {
        if self.first_error.is_none() {
            self.first_error = Some(e);
        }
    }

    fn next_tile(&mut self) -> bool {
        self.idx = 0;

        if self.slot.is_none() || self.slot == self.last_slot {
            self.slot = None;
            return false;
        }

        self.slot = self.slot.map(next_slot_cyclic);
        true
    }

    fn tile_size(&self, slot: Slot) -> Option<ListResult<u16>> {
        let tile = self.window.active_tile(slot)?;
        Some(tile.with_ready(|inner| inner.stored()))
    }

    fn step(&mut self) -> bool {
        let slot = match self.slot {
            Some(slot) => slot,
            None => return false,
        };

        match self.tile_size(slot) {
            Some(Ok(stored)) => {
                self.idx += 1;

                if self.idx < stored {
                    true
                } else {
                    self.next_tile()
                }
            }
            Some(Err(e)) => {
                self.put_error(e);
                self.next_tile()
            }
            None => self.next_tile(),
        }
    }

    fn find_first(&mut self) {
        while let Some(slot) = self.slot {
            match self.tile_size(slot) {
                None => {
                    self.next_tile();
                }
                Some(Ok(stored)) => {
                    if self.idx < stored {
                        break;
                    }

                    self.step();
                }
                Some(Err(e)) => {
                    self.put_error(e);
                    self.next_tile();
                }
            }
        }
    }
}

/// A logical item sequence backed by the three-tile window.
///
/// The list knows its logical length up front; the actual content is fetched
/// tile by tile through the filler whenever accesses land outside the
/// current window.
pub struct TiledList<T, const N: usize> {
    len: usize,
    filler: Arc<dyn TiledListFiller<T>>,
    window: TileWindow<T, N>,
}

impl<T: ListItemData + 'static, const N: usize> TiledList<T, N> {
    pub fn new(
        len: usize,
        filler: Arc<dyn TiledListFiller<T>>,
        pool: Arc<FillerPool<T, N>>,
    ) -> Self {
        TiledList {
            len,
            filler,
            window: TileWindow::new(pool),
        }
    }

    /// Logical number of items in the list, independent of what is
    /// physically in memory.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bring `[first, first + count)` into the window without sliding it
    /// around an already-covered range.
    pub fn prefetch_range(&mut self, list_id: ListId, first: u32, count: usize) -> bool {
        self.window
            .prefetch(&self.filler, list_id, first, count, self.len, false)
    }

    /// Load the tiles surrounding `idx`, sliding or refilling the window as
    /// needed so the accessed tile ends up centered.
    fn materialize(&mut self, list_id: ListId, idx: u32) -> ListResult<()> {
        if idx as usize >= self.len {
            error!(
                "BUG: requested tile list materialization around {}, but have only {} items",
                idx, self.len
            );
            return Err(ListError::Internal);
        }

        if self
            .window
            .prefetch(&self.filler, list_id, idx, 1, self.len, true)
        {
            Ok(())
        } else {
            Err(ListError::Internal)
        }
    }

    /// Random access. Keeps the accessed item centered, so enumerating a
    /// range through this thrashes the window; use `for_each_item` instead.
    pub fn with_item<R>(
        &mut self,
        list_id: ListId,
        idx: u32,
        f: impl FnOnce(&ListItem<T>) -> R,
    ) -> ListResult<R> {
        self.materialize(list_id, idx)?;
        self.window.with_center_item(idx, f)
    }

    pub fn with_item_mut<R>(
        &mut self,
        list_id: ListId,
        idx: u32,
        f: impl FnOnce(&mut ListItem<T>) -> R,
    ) -> ListResult<R> {
        self.materialize(list_id, idx)?;
        self.window.with_center_item_mut(idx, f)
    }

    /// Mutate an item only if it is physically present in the window.
    pub fn with_cached_item_mut<R>(
        &self,
        idx: u32,
        f: impl FnOnce(&mut ListItem<T>) -> R,
    ) -> ListResult<R> {
        self.window.with_cached_item_mut(idx, f)
    }

    pub fn iter(&self, first: u32) -> WindowIter<'_, T, N> {
        self.window.iter(first)
    }

    pub fn iter_all(&self) -> WindowIter<'_, T, N> {
        self.window.iter_all()
    }

    /// Find the item index linking to the given child list, searching the
    /// physically stored items only.
    pub fn lookup_item_index_by_child_id(&self, child_id: ListId) -> Option<u32> {
        let mut iter = self.iter_all();

        loop {
            match iter.next_with(|idx, item| (idx, item.child_list() == child_id)) {
                Some((idx, true)) => return Some(idx),
                Some((_, false)) => continue,
                None => return None,
            }
        }
    }

    pub(crate) fn enumerate_direct_sublists(&self, out: &mut Vec<ListId>) {
        let mut iter = self.iter_all();

        while let Some(child) = iter.next_with(|_, item| item.child_list()) {
            if child.is_valid() {
                out.push(child);
            }
        }
    }

    pub(crate) fn obliviate_child(&self, child_id: ListId) {
        self.window.obliviate_child(child_id);
    }

    /// Record the logical size of a list created with size 0. Only valid
    /// while the list is still empty and cold.
    pub fn deferred_set_size(&mut self, new_len: usize) {
        debug_assert_eq!(self.len, 0);
        debug_assert!(self.window.empty());
        self.len = new_len;
    }

    /// Reset the list to the empty state without recreating it.
    pub fn clear_all(&mut self) {
        self.window.clear();
        self.len = 0;
    }
}
