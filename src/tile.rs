//! A single tile of a tiled list.
//!
//! Tiles are filled by worker threads and must be locked before reading.
//! The fundamental assumptions about all code that touches tiles:
//!
//! - All read accesses happen on a single reader thread.
//! - Each tile is filled by a single worker at a time; multiple tiles may be
//!   filled concurrently, one worker per tile.
//! - The reader schedules all fills, so it controls the point in time at
//!   which a tile becomes unsafe to read without taking its lock.
//! - A worker holds the tile lock for the whole fill and signals the
//!   condition variable when it is done or has given up. The reader must
//!   check the tile state right after acquiring the lock.
//!
//! Multiple readers and multiple writers per tile are not supported by
//! design.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{ListError, ListResult};
use crate::item::{ListItem, ListItemData};

/// Fill state of one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Free,
    Filling,
    Ready,
    Canceled,
    Error,
}

/// Lock-protected part of a tile.
#[derive(Debug)]
pub struct TileInner<T> {
    items: Vec<ListItem<T>>,
    stored: u16,
    state: TileState,
    error: Option<ListError>,
}

impl<T: ListItemData> TileInner<T> {
    pub fn state(&self) -> TileState {
        self.state
    }

    /// Number of items stored; meaningful once the tile is `Ready`.
    pub fn stored(&self) -> u16 {
        self.stored
    }

    pub fn error(&self) -> Option<ListError> {
        self.error
    }

    pub fn item(&self, raw_index: usize) -> &ListItem<T> {
        &self.items[raw_index]
    }

    pub fn item_mut(&mut self, raw_index: usize) -> &mut ListItem<T> {
        &mut self.items[raw_index]
    }

    /// Raw access for the filling worker.
    pub(crate) fn items_mut(&mut self) -> &mut [ListItem<T>] {
        &mut self.items
    }
}

/// One fixed-capacity tile holding a contiguous run of `N` items.
pub struct Tile<T, const N: usize> {
    inner: Mutex<TileInner<T>>,
    processed: Condvar,
    cancel_requested: AtomicBool,
    /// First list index covered by this tile, multiple of `N`. Written by the
    /// reader thread only; workers read it through the work item.
    base: AtomicU32,
}

impl<T: ListItemData, const N: usize> Tile<T, N> {
    pub fn new() -> Self {
        debug_assert!(N > 0 && N <= u16::MAX as usize);

        let mut items = Vec::new();
        items.resize_with(N, ListItem::default);

        Tile {
            inner: Mutex::new(TileInner {
                items,
                stored: 0,
                state: TileState::Free,
                error: Some(ListError::Internal),
            }),
            processed: Condvar::new(),
            cancel_requested: AtomicBool::new(false),
            base: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, TileInner<T>> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, TileInner<T>>> {
        self.inner.try_lock()
    }

    /// First list index covered by this tile.
    pub fn base(&self) -> u32 {
        self.base.load(Ordering::Relaxed)
    }

    /// Whether the item at `idx` falls into this tile's range. Only
    /// meaningful for active tiles; safe to call from the reader thread
    /// without holding the lock.
    pub fn is_tile_for(&self, idx: u32) -> bool {
        let base = self.base();
        idx >= base && (idx as u64) < base as u64 + N as u64
    }

    /// Whether this tile is free. Reader thread only.
    pub fn is_free(&self) -> bool {
        match self.try_lock() {
            Some(inner) => inner.state == TileState::Free,
            None => false,
        }
    }

    /// Clear the tile back to `Free`.
    ///
    /// Must only be called when no worker references the tile (that is,
    /// after `FillerPool::cancel_filler` or before any fill was scheduled).
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.reset_locked(&mut inner, None, TileState::Free);
    }

    fn reset_locked(&self, inner: &mut TileInner<T>, error: Option<ListError>, state: TileState) {
        for item in &mut inner.items {
            item.reset();
        }

        self.base.store(0, Ordering::Relaxed);
        inner.stored = 0;
        inner.error = error;
        inner.state = state;
    }

    /// Mark the tile as occupied for filling the tile-aligned range around
    /// `idx`. The tile must be free. Reader thread only.
    pub fn activate(&self, idx: u32) {
        let mut inner = self.lock();
        debug_assert_eq!(inner.state, TileState::Free);

        self.base.store(idx - idx % N as u32, Ordering::Relaxed);
        inner.state = TileState::Filling;
        self.cancel_requested.store(false, Ordering::Release);
    }

    /// Ask the worker filling this tile to stop.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    pub fn is_requesting_cancel(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Worker callback: filling ended without data.
    ///
    /// With no error this is a successful cancellation (tile → `Canceled`);
    /// with an error the tile goes to `Error` and stores the error for
    /// evaluation when someone tries to read from the tile. The caller holds
    /// the tile lock.
    pub(crate) fn canceled_locked(&self, inner: &mut TileInner<T>, error: Option<ListError>) {
        match error {
            None => self.reset_locked(inner, None, TileState::Canceled),
            Some(e) => self.reset_locked(inner, Some(e), TileState::Error),
        }

        self.processed.notify_all();
    }

    /// Worker callback: tile is ready for use. The caller holds the tile
    /// lock.
    pub(crate) fn done_locked(&self, inner: &mut TileInner<T>, count: u16) {
        inner.stored += count;
        debug_assert!(inner.stored as usize <= N);
        inner.state = TileState::Ready;

        self.processed.notify_all();
    }

    /// Lock the tile, waiting for the filling worker if necessary.
    ///
    /// Returns the guard once the tile is `Ready`, or the tile's error if
    /// filling was canceled or failed.
    pub fn wait_for_ready(&self) -> ListResult<MutexGuard<'_, TileInner<T>>> {
        let mut inner = self.lock();

        while inner.state == TileState::Filling {
            self.processed.wait(&mut inner);
        }

        if inner.state != TileState::Ready {
            return Err(inner.error.unwrap_or(ListError::Internal));
        }

        Ok(inner)
    }

    /// Run `f` against the ready tile contents, blocking until the tile has
    /// been processed.
    pub fn with_ready<R>(&self, f: impl FnOnce(&TileInner<T>) -> R) -> ListResult<R> {
        let inner = self.wait_for_ready()?;
        Ok(f(&inner))
    }

    pub fn with_ready_mut<R>(&self, f: impl FnOnce(&mut TileInner<T>) -> R) -> ListResult<R> {
        let mut inner = self.wait_for_ready()?;
        Ok(f(&mut inner))
    }
}

impl<T: ListItemData, const N: usize> Default for Tile<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestItem;
    use std::sync::Arc;
    use std::time::Duration;

    type TestTile = Tile<TestItem, 8>;

    #[test]
    fn test_fresh_tile_is_free() {
        let tile = TestTile::new();
        assert!(tile.is_free());
        assert_eq!(tile.lock().state(), TileState::Free);
        assert_eq!(tile.lock().error(), Some(ListError::Internal));
    }

    #[test]
    fn test_activate_aligns_base() {
        let tile = TestTile::new();
        tile.activate(13);
        assert_eq!(tile.base(), 8);
        assert_eq!(tile.lock().state(), TileState::Filling);
        assert!(!tile.is_free());

        assert!(tile.is_tile_for(8));
        assert!(tile.is_tile_for(15));
        assert!(!tile.is_tile_for(16));
        assert!(!tile.is_tile_for(7));
    }

    #[test]
    fn test_done_makes_ready() {
        let tile = TestTile::new();
        tile.activate(0);

        {
            let mut inner = tile.lock();
            tile.done_locked(&mut inner, 5);
        }

        let inner = tile.wait_for_ready().unwrap();
        assert_eq!(inner.stored(), 5);
    }

    #[test]
    fn test_cancel_without_error() {
        let tile = TestTile::new();
        tile.activate(0);

        {
            let mut inner = tile.lock();
            tile.canceled_locked(&mut inner, None);
        }

        assert_eq!(tile.lock().state(), TileState::Canceled);
        assert_eq!(tile.wait_for_ready().unwrap_err(), ListError::Internal);
    }

    #[test]
    fn test_cancel_with_error() {
        let tile = TestTile::new();
        tile.activate(0);

        {
            let mut inner = tile.lock();
            tile.canceled_locked(&mut inner, Some(ListError::NetIo));
        }

        assert_eq!(tile.lock().state(), TileState::Error);
        assert_eq!(tile.wait_for_ready().unwrap_err(), ListError::NetIo);
    }

    #[test]
    fn test_cancel_flag() {
        let tile = TestTile::new();
        tile.activate(0);
        assert!(!tile.is_requesting_cancel());

        tile.cancel();
        assert!(tile.is_requesting_cancel());

        // re-activation clears the flag
        tile.reset();
        tile.activate(0);
        assert!(!tile.is_requesting_cancel());
    }

    #[test]
    fn test_wait_blocks_until_processed() {
        let tile = Arc::new(TestTile::new());
        tile.activate(0);

        let worker_tile = Arc::clone(&tile);
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let mut inner = worker_tile.lock();
            worker_tile.done_locked(&mut inner, 8);
        });

        let inner = tile.wait_for_ready().unwrap();
        assert_eq!(inner.stored(), 8);
        drop(inner);
        worker.join().unwrap();
    }

    #[test]
    fn test_reset_clears_items() {
        let tile = TestTile::new();
        tile.activate(0);
        {
            let mut inner = tile.lock();
            inner.item_mut(0).data_mut().set_name("x");
            tile.done_locked(&mut inner, 1);
        }

        tile.reset();
        assert!(tile.is_free());
        assert_eq!(tile.lock().item(0).name(), "");
        assert_eq!(tile.lock().stored(), 0);
    }
}
