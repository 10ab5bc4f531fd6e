//! Worker pool that fills list tiles.
//!
//! The pool owns a FIFO queue of fill requests and a set of worker threads
//! draining it. Workers pop the front item, lock the tile *before* releasing
//! the queue lock, and run the user-supplied filler against the locked tile.
//! This ordering is what makes the cancellation protocol in
//! [`FillerPool::cancel_filler`] work.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::error;
use parking_lot::{Condvar, Mutex};

use crate::error::ListResult;
use crate::ids::ListId;
use crate::item::{ListItem, ListItemData};
use crate::tile::{Tile, TileInner, TileState};

/// Forward iterator over the writable item slots of one tile.
///
/// Fillers take the next slot to fill by calling [`ItemProvider::next`];
/// the provider decouples the filler implementation from the concrete tile
/// layout and bounds all writes.
pub struct ItemProvider<'a, T> {
    items: &'a mut [ListItem<T>],
    next: usize,
}

impl<'a, T: ListItemData> ItemProvider<'a, T> {
    pub(crate) fn new(items: &'a mut [ListItem<T>]) -> Self {
        ItemProvider { items, next: 0 }
    }

    /// Next writable item slot, or `None` once the tile is full.
    pub fn next(&mut self) -> Option<&mut T> {
        if self.next < self.items.len() {
            let item = self.items[self.next].data_mut();
            self.next += 1;
            Some(item)
        } else {
            None
        }
    }
}

/// Interface for filling in list items on demand.
///
/// Implementations are called from worker threads and must be thread-safe;
/// at any time all running instances work on disjoint tiles.
pub trait TiledListFiller<T>: Send + Sync {
    /// Fill up to `count` items of list `list_id` starting at list index
    /// `first` through `provider`.
    ///
    /// `may_continue` should be polled at convenient points; it returns
    /// `false` once the reader has canceled the tile, at which point the
    /// filler should give up and return `Ok(0)`.
    ///
    /// Returns the number of items written. `Ok(0)` is treated as a
    /// cancellation; an `Err` marks the tile as failed with that error.
    fn fill(
        &self,
        provider: &mut ItemProvider<'_, T>,
        list_id: ListId,
        first: u32,
        count: usize,
        may_continue: &dyn Fn() -> bool,
    ) -> ListResult<usize>;
}

struct Work<T, const N: usize> {
    tile: Arc<Tile<T, N>>,
    filler: Arc<dyn TiledListFiller<T>>,
    list_id: ListId,
}

struct SharedQueue<T, const N: usize> {
    work: Mutex<VecDeque<Work<T, N>>>,
    work_available: Condvar,
    shutdown_request: AtomicBool,
}

/// Pool of threads filling list tiles from a FIFO work queue.
pub struct FillerPool<T, const N: usize> {
    queue: Arc<SharedQueue<T, N>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    synchronous: AtomicBool,
}

impl<T: ListItemData + 'static, const N: usize> FillerPool<T, N> {
    pub fn new(synchronous: bool) -> Self {
        FillerPool {
            queue: Arc::new(SharedQueue {
                work: Mutex::new(VecDeque::new()),
                work_available: Condvar::new(),
                shutdown_request: AtomicBool::new(false),
            }),
            threads: Mutex::new(Vec::new()),
            synchronous: AtomicBool::new(synchronous),
        }
    }

    /// Switch the pool to synchronous mode: every scheduling operation on a
    /// tiled list drains the queue before returning. Used by tests and
    /// callers that need deterministic fill ordering.
    pub fn set_synchronized(&self) {
        self.synchronous.store(true, Ordering::Release);
    }

    /// Start the pool with the given number of threads.
    ///
    /// For best performance the thread count should match or exceed the
    /// number of tiles in a tiled list. A single thread serializes fills in
    /// queue order, which is often convenient for debugging.
    pub fn start(&self, number_of_threads: usize) {
        debug_assert!(number_of_threads > 0);

        let mut threads = self.threads.lock();
        debug_assert!(threads.is_empty());
        debug_assert!(self.queue.work.lock().is_empty());

        self.queue.shutdown_request.store(false, Ordering::Release);

        for i in 0..number_of_threads {
            let queue = Arc::clone(&self.queue);
            let handle = std::thread::Builder::new()
                .name(format!("tile-fill-{}", i))
                .spawn(move || worker(queue))
                .expect("failed to spawn tile filler thread");
            threads.push(handle);
        }
    }

    /// Number of worker threads currently running.
    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Busy-wait until the work queue becomes empty.
    ///
    /// Workers are not necessarily idle when this returns; they may still be
    /// processing their current item. The queue, however, is empty.
    pub fn wait_empty(&self) {
        loop {
            if self.queue.work.lock().is_empty() {
                return;
            }

            std::thread::yield_now();
        }
    }

    pub fn wait_empty_if_synchronized(&self) {
        if self.synchronous.load(Ordering::Acquire) {
            self.wait_empty();
        }
    }

    /// Stop the pool, returning the number of threads that were running.
    pub fn shutdown(&self) -> usize {
        if self.queue.shutdown_request.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let mut threads = self.threads.lock();

        if threads.is_empty() {
            return 0;
        }

        {
            let _queue = self.queue.work.lock();
            self.queue.work_available.notify_all();
        }

        let count = threads.len();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }

        count
    }

    /// Schedule a fill of `tile` for list `list_id`. The tile must be in
    /// `Filling` state (see [`Tile::activate`]).
    pub fn enqueue(
        &self,
        tile: Arc<Tile<T, N>>,
        filler: Arc<dyn TiledListFiller<T>>,
        list_id: ListId,
    ) {
        debug_assert!(!self.threads.lock().is_empty());
        debug_assert_eq!(tile.lock().state(), TileState::Filling);

        let mut work = self.queue.work.lock();
        work.push_back(Work {
            tile,
            filler,
            list_id,
        });
        self.queue.work_available.notify_one();
    }

    /// Drain the queue, marking every still-enqueued tile as canceled.
    ///
    /// Does not affect tiles already being processed by a worker; use
    /// [`FillerPool::cancel_filler`] for those.
    pub fn cancel_all_queued_fillers(&self) {
        let mut queue = self.queue.work.lock();

        for work in queue.iter() {
            // a tile still in the queue cannot be locked by a worker while
            // we hold the queue lock
            let mut inner = work.tile.lock();
            debug_assert_eq!(inner.state(), TileState::Filling);
            work.tile.canceled_locked(&mut inner, None);
        }

        queue.clear();
    }

    /// Cancel filling the given tile. It is an error to call this for free
    /// tiles.
    ///
    /// The protocol:
    ///
    /// 1. Set the tile's cancel flag so a worker already filling it gives up
    ///    at its next `may_continue` check.
    /// 2. Take the queue lock so no worker can dequeue more work, then
    ///    try-lock the tile.
    /// 3. Try-lock success means no worker holds the tile: remove it from
    ///    the queue if still enqueued, and mark it canceled unless it
    ///    already is.
    /// 4. Try-lock failure means a worker is processing the tile: drop the
    ///    queue lock and block on the tile lock until the worker has
    ///    finished, failed, or observed the cancel request.
    ///
    /// Afterwards the tile state is anything but `Free` or `Filling`.
    pub fn cancel_filler(&self, tile: &Arc<Tile<T, N>>) {
        tile.cancel();

        let mut queue = self.queue.work.lock();

        match tile.try_lock() {
            Some(mut inner) => {
                let state = inner.state();

                if state == TileState::Filling {
                    if let Some(pos) = queue.iter().position(|w| Arc::ptr_eq(&w.tile, tile)) {
                        queue.remove(pos);
                    }
                }

                if state != TileState::Canceled {
                    tile.canceled_locked(&mut inner, None);
                }
            }
            None => {
                drop(queue);
                let _wait_for_worker = tile.lock();
            }
        }

        debug_assert!({
            let state = tile.lock().state();
            state != TileState::Free && state != TileState::Filling
        });
    }
}

impl<T, const N: usize> Drop for FillerPool<T, N> {
    fn drop(&mut self) {
        if self.queue.shutdown_request.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut threads = self.threads.lock();

        {
            let _queue = self.queue.work.lock();
            self.queue.work_available.notify_all();
        }

        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker<T: ListItemData, const N: usize>(queue: Arc<SharedQueue<T, N>>) {
    loop {
        let mut pending = queue.work.lock();

        while !queue.shutdown_request.load(Ordering::Acquire) && pending.is_empty() {
            queue.work_available.wait(&mut pending);
        }

        if queue.shutdown_request.load(Ordering::Acquire) {
            return;
        }

        // pop the work item, lock the tile, unlock the queue, fill the
        // tile --- in this order
        let work = match pending.pop_front() {
            Some(work) => work,
            None => continue,
        };

        let tile = Arc::clone(&work.tile);
        let mut inner = tile.lock();
        drop(pending);

        fill_tile(&work, &mut inner);
    }
}

/// Run the filler against the locked tile and record the outcome.
fn fill_tile<T: ListItemData, const N: usize>(work: &Work<T, N>, inner: &mut TileInner<T>) {
    let first = work.tile.base();
    let may_continue = || !work.tile.is_requesting_cancel();

    let outcome = {
        let mut provider = ItemProvider::new(inner.items_mut());
        work.filler
            .fill(&mut provider, work.list_id, first, N, &may_continue)
    };

    match outcome {
        Ok(count) if count > 0 => work.tile.done_locked(inner, count as u16),
        Ok(_) => work.tile.canceled_locked(inner, None),
        Err(e) => {
            error!(
                "failed filling tile from list {}, index {}: {}",
                work.list_id, first, e
            );
            work.tile.canceled_locked(inner, Some(e));
        }
    }
}
