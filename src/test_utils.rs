//! Shared helpers for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cache::CachePayload;
use crate::error::{ListError, ListResult};
use crate::ids::ListId;
use crate::item::{ListItemData, ListItemKind};
use crate::pool::{ItemProvider, TiledListFiller};
use crate::timebase::Timebase;

/// Settable clock; tests advance time explicitly.
pub(crate) struct MockTimebase {
    base: Instant,
    offset: Mutex<Duration>,
}

impl MockTimebase {
    pub fn new() -> Self {
        MockTimebase {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Timebase for MockTimebase {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// Minimal domain item for tests.
#[derive(Debug, Clone)]
pub(crate) struct TestItem {
    name: String,
    kind: ListItemKind,
}

impl TestItem {
    pub fn dir(name: &str) -> Self {
        TestItem {
            name: name.into(),
            kind: ListItemKind::Directory,
        }
    }

    pub fn file(name: &str) -> Self {
        TestItem {
            name: name.into(),
            kind: ListItemKind::Playable,
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.into();
    }
}

impl Default for TestItem {
    fn default() -> Self {
        TestItem {
            name: String::new(),
            kind: ListItemKind::Opaque,
        }
    }
}

impl ListItemData for TestItem {
    fn reset(&mut self) {
        self.name.clear();
        self.kind = ListItemKind::Opaque;
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ListItemKind {
        self.kind
    }
}

/// Bare tree node payload for cache-level tests; tracks child ids the way a
/// real list records them in its items.
#[derive(Debug, Default)]
pub(crate) struct TreePayload {
    children: Vec<ListId>,
}

impl TreePayload {
    pub fn add_child(&mut self, id: ListId) {
        self.children.push(id);
    }

    pub fn remove_child(&mut self, id: ListId) {
        self.children.retain(|c| *c != id);
    }
}

impl CachePayload for TreePayload {
    fn enumerate_direct_sublists(&self, out: &mut Vec<ListId>) {
        out.extend(self.children.iter().copied().filter(|id| id.is_valid()));
    }

    fn obliviate_child(&mut self, child_id: ListId) {
        self.children.retain(|c| *c != child_id);
    }
}

/// Filler producing `item-<index>` names for a list of known total length.
pub(crate) struct SequenceFiller {
    total: usize,
    fill_calls: AtomicUsize,
    items_filled: AtomicUsize,
}

impl SequenceFiller {
    pub fn new(total: usize) -> Self {
        SequenceFiller {
            total,
            fill_calls: AtomicUsize::new(0),
            items_filled: AtomicUsize::new(0),
        }
    }

    pub fn fill_calls(&self) -> usize {
        self.fill_calls.load(Ordering::Acquire)
    }

    pub fn items_filled(&self) -> usize {
        self.items_filled.load(Ordering::Acquire)
    }
}

impl TiledListFiller<TestItem> for SequenceFiller {
    fn fill(
        &self,
        provider: &mut ItemProvider<'_, TestItem>,
        _list_id: ListId,
        first: u32,
        count: usize,
        may_continue: &dyn Fn() -> bool,
    ) -> ListResult<usize> {
        self.fill_calls.fetch_add(1, Ordering::AcqRel);

        let mut written = 0usize;

        for i in 0..count {
            if !may_continue() {
                return Ok(0);
            }

            let index = first as usize + i;
            if index >= self.total {
                break;
            }

            let Some(data) = provider.next() else {
                break;
            };

            data.set_name(&format!("item-{}", index));
            written += 1;
        }

        self.items_filled.fetch_add(written, Ordering::AcqRel);
        Ok(written)
    }
}

/// Filler failing every tile with a fixed error.
pub(crate) struct FailingFiller {
    error: ListError,
}

impl FailingFiller {
    pub fn new(error: ListError) -> Self {
        FailingFiller { error }
    }
}

impl TiledListFiller<TestItem> for FailingFiller {
    fn fill(
        &self,
        _provider: &mut ItemProvider<'_, TestItem>,
        _list_id: ListId,
        _first: u32,
        _count: usize,
        _may_continue: &dyn Fn() -> bool,
    ) -> ListResult<usize> {
        Err(self.error)
    }
}

/// Filler that parks inside `fill` until released, for cancellation tests.
pub(crate) struct BlockingFiller {
    started: Mutex<bool>,
    started_cv: Condvar,
    released: Mutex<bool>,
    released_cv: Condvar,
}

impl BlockingFiller {
    pub fn new() -> Self {
        BlockingFiller {
            started: Mutex::new(false),
            started_cv: Condvar::new(),
            released: Mutex::new(false),
            released_cv: Condvar::new(),
        }
    }

    /// Block until a worker has entered `fill`.
    pub fn wait_started(&self) {
        let mut started = self.started.lock();
        while !*started {
            self.started_cv.wait(&mut started);
        }
    }

    /// Let the parked worker proceed.
    pub fn release(&self) {
        *self.released.lock() = true;
        self.released_cv.notify_all();
    }
}

impl TiledListFiller<TestItem> for BlockingFiller {
    fn fill(
        &self,
        provider: &mut ItemProvider<'_, TestItem>,
        _list_id: ListId,
        first: u32,
        _count: usize,
        may_continue: &dyn Fn() -> bool,
    ) -> ListResult<usize> {
        {
            let mut started = self.started.lock();
            *started = true;
            self.started_cv.notify_all();
        }

        {
            let mut released = self.released.lock();
            while !*released {
                self.released_cv.wait(&mut released);
            }
        }

        if !may_continue() {
            return Ok(0);
        }

        let mut written = 0usize;
        while let Some(data) = provider.next() {
            data.set_name(&format!("blk-{}", first as usize + written));
            written += 1;
        }

        Ok(written)
    }
}
