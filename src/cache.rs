//! LRU cache of list entries organized as a tree.
//!
//! The cache stores entries for fast retrieval once they have been
//! constructed. Entries are identified by ids assigned at insertion time and
//! are organized as a tree by parent links; there is no efficient way to
//! traverse the tree downwards, only towards the root.
//!
//! Besides the memory and count limits there is a time-based limit on the
//! maximum *age* of an entry, the time since its last use. Candidate
//! selection for discarding exploits the tree structure: using an entry also
//! marks all its ancestors as used, so ages decrease monotonically towards
//! the root and the oldest entry is always a leaf.
//!
//! All live entries are additionally linked into the *aging list*, a doubly
//! linked list of non-increasing age. The cache keeps three entry pointers:
//! the root (always a youngest entry), the oldest entry (head of the aging
//! list), and the *deepest youngest* entry, the one farthest from the root
//! among all entries whose last use equals the current maximum.
//!
//! The three primitive operations:
//!
//! - INSERT-NEW marks the parent as used, links the child directly in front
//!   of it in the aging list, and adopts the child as the new deepest
//!   youngest when their ages are equal.
//! - USE unlinks the whole path from the entry to the root, stamps it with
//!   the current time, relinks it in child-before-parent order, and joins it
//!   onto the previous deepest-youngest entry (or rather the topmost
//!   still-linked ancestor of it with the same timestamp, which preserves
//!   the bottom-to-top enumeration of equal ages). Amortized O(depth).
//! - DISCARD-OLDEST unlinks the head of the aging list, which is guaranteed
//!   to be a leaf, making removal O(1).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::ids::{Context, ListId, CONTEXT_COUNT, CONTEXT_MAX};
use crate::timebase::Timebase;

/// Whether an entry shall remain in cache on garbage collection.
///
/// Uncached entries are always collected if they are neither pinned nor
/// promoted by an override; cached entries remain until they expire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Cached,
    Uncached,
}

impl CacheMode {
    /// The cache mode encoded in an entry id.
    pub fn of(id: ListId) -> CacheMode {
        if id.nocache() {
            CacheMode::Uncached
        } else {
            CacheMode::Cached
        }
    }
}

/// Requested cache mode, resolved to [`CacheMode`] by policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheModeRequest {
    Cached,
    Uncached,
    Auto,
}

pub fn to_cache_mode(req: CacheModeRequest) -> CacheMode {
    match req {
        CacheModeRequest::Cached | CacheModeRequest::Auto => CacheMode::Cached,
        CacheModeRequest::Uncached => CacheMode::Uncached,
    }
}

/// Vtable each concrete entry type provides to the cache.
pub trait CachePayload {
    /// Append the ids of all sublists directly referenced by this entry.
    /// Must not clear the vector.
    fn enumerate_direct_sublists(&self, out: &mut Vec<ListId>);

    /// A child list was discarded from cache; remove any reference to its id.
    /// The child may be materialized again later under a new id.
    fn obliviate_child(&mut self, child_id: ListId);
}

/// Cache size limits: a hard upper limit, a soft upper watermark, and a low
/// watermark.
///
/// Exceeding the soft limit should start discarding entries until the value
/// drops below the low watermark. Exceeding the hard limit at least triggers
/// a log message and discards as soon as possible.
#[derive(Debug)]
pub struct CacheLimits {
    hard_upper_limit: usize,
    high_watermark: usize,
    low_watermark: usize,
}

impl CacheLimits {
    pub fn new(hard_upper_limit: usize, high_permil: u32, low_permil: u32) -> Self {
        assert!(hard_upper_limit > 0);
        assert!(high_permil <= 1000);
        assert!(low_permil <= 1000);
        assert!(high_permil > low_permil);

        let limits = CacheLimits {
            hard_upper_limit,
            high_watermark: ((hard_upper_limit as u64 * high_permil as u64 + 500) / 1000) as usize,
            low_watermark: ((hard_upper_limit as u64 * low_permil as u64 + 500) / 1000) as usize,
        };

        assert!(limits.hard_upper_limit >= limits.high_watermark);
        assert!(limits.high_watermark > limits.low_watermark);

        limits
    }

    pub fn exceeds_soft(&self, value: usize) -> bool {
        value > self.high_watermark
    }

    pub fn exceeds_hard(&self, value: usize) -> bool {
        value > self.hard_upper_limit
    }

    pub fn is_low_enough(&self, value: usize) -> bool {
        value < self.low_watermark
    }
}

/// Per-context rolling id allocator.
struct IdGenerator {
    base_id_min: u32,
    base_id_max: u32,
    next_id: [u32; CONTEXT_COUNT],
}

impl IdGenerator {
    fn new(base_id_min: u32, base_id_max: u32) -> Self {
        IdGenerator {
            base_id_min,
            base_id_max,
            next_id: [base_id_min; CONTEXT_COUNT],
        }
    }

    /// Generate the next id for the given context, skipping live ids.
    /// Returns the invalid id once a full cycle found no free slot.
    fn next(
        &mut self,
        cache_mode: CacheMode,
        ctx: Context,
        is_id_free: impl Fn(ListId) -> bool,
    ) -> ListId {
        debug_assert!(ctx <= CONTEXT_MAX);

        let cursor = &mut self.next_id[ctx as usize];
        let start_point = *cursor;

        loop {
            let candidate = ListId::new(*cursor, cache_mode == CacheMode::Uncached, ctx);

            if *cursor < self.base_id_max {
                *cursor += 1;
            } else {
                // id overflow
                *cursor = self.base_id_min;
            }

            if is_id_free(candidate) {
                return candidate;
            }

            if start_point == *cursor {
                return ListId::INVALID;
            }
        }
    }
}

/// Outcome of marking an entry as used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseResult {
    /// The entry's timestamp already equals the current time; nothing to do.
    /// Not an error.
    AlreadyUpToDate,
    /// No entry with the given id.
    InvalidId,
    /// The entry and its ancestors were restamped; carries the number of
    /// edges between the entry and the root.
    Used { depth: usize },
}

/// Callbacks invoked on cache events.
///
/// All of them run synchronously inside the triggering operation, so they
/// may defer work but must not call back into cache mutations.
pub struct CacheCallbacks {
    /// The first entry was inserted into the previously empty cache.
    pub first_inserted: Box<dyn FnMut()>,
    /// A configured limit was exceeded; garbage collection should run.
    pub gc_needed: Box<dyn FnMut()>,
    /// The entry with the given (now dangling) id was removed.
    pub object_removed: Box<dyn FnMut(ListId)>,
    /// The last entry was removed; the cache is empty.
    pub last_removed: Box<dyn FnMut()>,
}

impl Default for CacheCallbacks {
    fn default() -> Self {
        CacheCallbacks {
            first_inserted: Box::new(|| {}),
            gc_needed: Box::new(|| {}),
            object_removed: Box::new(|_| {}),
            last_removed: Box::new(|| {}),
        }
    }
}

struct Node<P> {
    payload: P,
    id: ListId,
    parent: Option<usize>,
    children: usize,
    size: usize,
    pinned: bool,
    last_used: Instant,
    older: Option<usize>,
    younger: Option<usize>,
    /// Discarded ahead of its children (replaced-root purge); the slot is
    /// kept until the last child is gone so their parent links stay valid.
    zombie: bool,
}

/// The LRU cache. Single reader thread by design; see the module docs for
/// the underlying algorithms.
pub struct Cache<P> {
    timebase: Arc<dyn Timebase>,
    id_generator: IdGenerator,
    memory_limits: CacheLimits,
    count_limits: CacheLimits,
    maximum_age: Duration,

    nodes: Vec<Option<Node<P>>>,
    free_slots: Vec<usize>,
    by_id: HashMap<ListId, usize>,

    root: Option<usize>,
    oldest: Option<usize>,
    deepest_youngest: Option<usize>,
    pinned_id: ListId,

    /// Entries created before this time may not be inserted; it equals the
    /// last-use time of the youngest entry. Restricting insertion this way
    /// keeps INSERT-NEW O(1) on top of USE.
    minimum_required_creation_time: Instant,
    total_size: usize,

    gc_running: bool,
    callbacks: CacheCallbacks,
}

impl<P: CachePayload> Cache<P> {
    pub fn new(
        memory_hard_limit: usize,
        count_hard_limit: usize,
        maximum_age: Duration,
        timebase: Arc<dyn Timebase>,
    ) -> Self {
        Self::with_watermarks(
            memory_hard_limit,
            900,
            400,
            count_hard_limit,
            900,
            400,
            maximum_age,
            timebase,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_watermarks(
        memory_hard_limit: usize,
        memory_high_permil: u32,
        memory_low_permil: u32,
        count_hard_limit: usize,
        count_high_permil: u32,
        count_low_permil: u32,
        maximum_age: Duration,
        timebase: Arc<dyn Timebase>,
    ) -> Self {
        let now = timebase.now();

        Cache {
            timebase,
            id_generator: IdGenerator::new(1, ListId::RAW_MAX),
            memory_limits: CacheLimits::new(
                memory_hard_limit,
                memory_high_permil,
                memory_low_permil,
            ),
            count_limits: CacheLimits::new(count_hard_limit, count_high_permil, count_low_permil),
            maximum_age,
            nodes: Vec::new(),
            free_slots: Vec::new(),
            by_id: HashMap::new(),
            root: None,
            oldest: None,
            deepest_youngest: None,
            pinned_id: ListId::INVALID,
            minimum_required_creation_time: now,
            total_size: 0,
            gc_running: false,
            callbacks: CacheCallbacks::default(),
        }
    }

    /// Install the event callbacks. Must be called before the cache is used
    /// in earnest; defaults are no-ops.
    pub fn set_callbacks(&mut self, callbacks: CacheCallbacks) {
        self.callbacks = callbacks;
    }

    pub fn now(&self) -> Instant {
        self.timebase.now()
    }

    pub fn maximum_age(&self) -> Duration {
        self.maximum_age
    }

    fn node(&self, idx: usize) -> &Node<P> {
        self.nodes[idx].as_ref().expect("live cache node")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<P> {
        self.nodes[idx].as_mut().expect("live cache node")
    }

    fn alloc_slot(&mut self, node: Node<P>) -> usize {
        match self.free_slots.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn free_slot(&mut self, idx: usize) -> Node<P> {
        let node = self.nodes[idx].take().expect("live cache node");
        self.free_slots.push(idx);
        node
    }

    /// Number of entries in the cache.
    pub fn count(&self) -> usize {
        self.by_id.len()
    }

    /// Cumulated size of all entries.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn contains(&self, id: ListId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Look up an entry by id. Pure read; does not mark the entry as used.
    pub fn lookup(&self, id: ListId) -> Option<&P> {
        self.by_id.get(&id).map(|&idx| &self.node(idx).payload)
    }

    pub fn lookup_mut(&mut self, id: ListId) -> Option<&mut P> {
        match self.by_id.get(&id) {
            Some(&idx) => Some(&mut self.node_mut(idx).payload),
            None => None,
        }
    }

    /// Id of the entry's parent, or the invalid id for the root or unknown
    /// entries.
    pub fn parent_of(&self, id: ListId) -> ListId {
        self.by_id
            .get(&id)
            .and_then(|&idx| self.node(idx).parent)
            .map(|p| self.node(p).id)
            .unwrap_or(ListId::INVALID)
    }

    /// Number of nodes on the path from the entry to the root, both
    /// included; 1 for the root itself.
    pub fn depth(&self, id: ListId) -> Option<usize> {
        let &idx = self.by_id.get(&id)?;
        let mut depth = 0;
        let mut e = Some(idx);

        while let Some(cur) = e {
            depth += 1;
            e = self.node(cur).parent;
        }

        Some(depth)
    }

    pub fn is_leaf(&self, id: ListId) -> Option<bool> {
        self.by_id.get(&id).map(|&idx| self.node(idx).children == 0)
    }

    pub fn is_pinned(&self, id: ListId) -> bool {
        self.by_id
            .get(&id)
            .map(|&idx| self.node(idx).pinned)
            .unwrap_or(false)
    }

    /// Id of the pinned entry, if any.
    pub fn pinned_object(&self) -> ListId {
        self.pinned_id
    }

    pub fn object_size(&self, id: ListId) -> Option<usize> {
        self.by_id.get(&id).map(|&idx| self.node(idx).size)
    }

    fn age_of(&self, idx: usize) -> Duration {
        self.timebase
            .now()
            .saturating_duration_since(self.node(idx).last_used)
    }

    /// Age of an entry: time since its last use.
    pub fn age(&self, id: ListId) -> Option<Duration> {
        self.by_id.get(&id).map(|&idx| self.age_of(idx))
    }

    /// Ids in aging order, oldest first.
    pub fn aging_ids(&self) -> impl Iterator<Item = ListId> + '_ {
        std::iter::successors(self.oldest, move |&idx| self.node(idx).younger)
            .map(move |idx| self.node(idx).id)
    }

    /// Ids in reverse aging order, youngest first.
    pub fn aging_ids_rev(&self) -> impl Iterator<Item = ListId> + '_ {
        std::iter::successors(self.root, move |&idx| self.node(idx).older)
            .map(move |idx| self.node(idx).id)
    }

    // --- aging list primitives ---

    /// Splice a node out of the aging list, returning its younger neighbor.
    fn unlink_aging(&mut self, idx: usize) -> Option<usize> {
        let (older, younger) = {
            let n = self.node(idx);
            (n.older, n.younger)
        };

        if let Some(o) = older {
            self.node_mut(o).younger = younger;
        }
        if let Some(y) = younger {
            self.node_mut(y).older = older;
        }

        let n = self.node_mut(idx);
        n.older = None;
        n.younger = None;

        younger
    }

    /// Unlink every node on the path from `entry` to the root, fixing up the
    /// oldest pointer and relocating the reconnect tail off the path.
    ///
    /// Afterwards the reconnect tail points at the topmost still-linked node
    /// with the same last-use time as the previous deepest-youngest entry:
    /// the proper join point for the restamped path segment.
    fn unlink_path_to_root(
        &mut self,
        entry: usize,
        mut reconnect_tail: Option<usize>,
    ) -> (usize, Option<usize>) {
        let mut depth = 0usize;
        let mut e = Some(entry);

        while let Some(cur) = e {
            if reconnect_tail == Some(cur) {
                reconnect_tail = self.node(cur).older;
            }

            let younger = self.unlink_aging(cur);

            if self.oldest == Some(cur) {
                self.oldest = younger.or(Some(entry));
            }

            e = self.node(cur).parent;
            if e.is_some() {
                depth += 1;
            }
        }

        if let Some(mut tail) = reconnect_tail {
            // Follow the path towards the root to find the topmost node with
            // the same last-use time. A node still linked in the aging list
            // was not on the unlinked path, and starting from the previously
            // deepest youngest node there cannot be any younger linked node
            // above it.
            let mut e = self.node(tail).parent;

            while let Some(cur) = e {
                let n = self.node(cur);

                if n.younger.is_some() || n.older.is_some() {
                    debug_assert_eq!(n.last_used, self.node(tail).last_used);
                    tail = cur;
                } else {
                    break;
                }

                e = self.node(cur).parent;
            }

            debug_assert!(self.node(tail).younger.is_none());
            reconnect_tail = Some(tail);
        }

        (depth, reconnect_tail)
    }

    /// Restamp every node on the path from `entry` to the root and link the
    /// path in child-before-parent order.
    fn link_path_to_root(&mut self, entry: usize, now: Instant) {
        let mut e = Some(entry);

        while let Some(cur) = e {
            self.node_mut(cur).last_used = now;

            let parent = self.node(cur).parent;

            if let Some(p) = parent {
                debug_assert!(self.node(cur).younger.is_none());
                debug_assert!(self.node(p).older.is_none());
                self.node_mut(cur).younger = Some(p);
                self.node_mut(p).older = Some(cur);
            }

            e = parent;
        }
    }

    /// Append the freshly linked segment starting at `head` onto `tail`.
    fn join_aging(&mut self, tail: usize, head: usize) {
        debug_assert!(self.node(tail).younger.is_none());
        debug_assert!(self.node(head).older.is_none());

        self.node_mut(tail).younger = Some(head);
        self.node_mut(head).older = Some(tail);
    }

    // --- primitive operations ---

    /// Update the entry's timestamp and those of all its ancestors to the
    /// current time.
    pub fn use_entry(&mut self, id: ListId) -> UseResult {
        match self.by_id.get(&id) {
            Some(&idx) => self.use_node(idx),
            None => UseResult::InvalidId,
        }
    }

    fn use_node(&mut self, entry: usize) -> UseResult {
        let now = self.timebase.now();
        debug_assert!(now >= self.minimum_required_creation_time);

        if now <= self.minimum_required_creation_time {
            // Extremely fast re-use, not measurable with the clock's
            // resolution. The entry must already be in the correct place in
            // the aging list, and all its ancestors have the same age.
            return UseResult::AlreadyUpToDate;
        }

        let reconnect_tail = self.deepest_youngest;
        self.deepest_youngest = Some(entry);

        let (depth, reconnect_tail) = self.unlink_path_to_root(entry, reconnect_tail);
        self.link_path_to_root(entry, now);

        if let Some(tail) = reconnect_tail {
            self.join_aging(tail, entry);
        }

        debug_assert!(self
            .oldest
            .map(|o| self.node(o).children == 0)
            .unwrap_or(false));

        UseResult::Used { depth }
    }

    /// Insert an entry into the cache and assign it an id.
    ///
    /// `created_at` is the time the entry was constructed; insertion fails
    /// if it lies before the youngest entry's last use, if the entry's
    /// parent is unknown, or if the id space of the context is exhausted.
    /// Failures return the invalid id.
    pub fn insert(
        &mut self,
        payload: P,
        parent_id: ListId,
        cmode: CacheMode,
        ctx: Context,
        size: usize,
        created_at: Instant,
    ) -> ListId {
        if created_at < self.minimum_required_creation_time {
            error!("BUG: attempted to insert outdated object into cache");
            return ListId::INVALID;
        }

        let parent_idx = if parent_id.is_valid() {
            match self.by_id.get(&parent_id) {
                Some(&idx) => Some(idx),
                None => {
                    error!("BUG: attempted to insert object into cache with unknown parent");
                    return ListId::INVALID;
                }
            }
        } else {
            None
        };

        if let Some(p) = parent_idx {
            if created_at < self.node(p).last_used {
                error!("BUG: attempted to insert object into cache with older parent");
                return ListId::INVALID;
            }
        }

        let by_id = &self.by_id;
        let id = self
            .id_generator
            .next(cmode, ctx, |candidate| !by_id.contains_key(&candidate));

        if !id.is_valid() {
            error!("BUG: no free list ids left in context {}", ctx);
            return ListId::INVALID;
        }

        match parent_idx {
            Some(p) => {
                if self.use_node(p) == UseResult::AlreadyUpToDate {
                    self.deepest_youngest = Some(p);
                }

                self.node_mut(p).children += 1;
                debug_assert_eq!(self.deepest_youngest, Some(p));
            }
            None => {
                debug_assert!(self.root.is_none());
            }
        }

        let slot = self.alloc_slot(Node {
            payload,
            id,
            parent: parent_idx,
            children: 0,
            size,
            pinned: false,
            last_used: created_at,
            older: None,
            younger: None,
            zombie: false,
        });

        debug_assert!(!self.by_id.contains_key(&id));
        self.by_id.insert(id, slot);
        self.minimum_required_creation_time = created_at;

        match parent_idx {
            Some(p) => {
                if created_at == self.node(p).last_used {
                    self.deepest_youngest = Some(slot);
                }

                // link the child directly in front of its parent
                let became_oldest = match self.node(p).older {
                    Some(o) => {
                        self.node_mut(slot).older = Some(o);
                        self.node_mut(slot).younger = Some(p);
                        self.node_mut(o).younger = Some(slot);
                        self.node_mut(p).older = Some(slot);
                        false
                    }
                    None => {
                        self.node_mut(slot).younger = Some(p);
                        self.node_mut(p).older = Some(slot);
                        true
                    }
                };

                if became_oldest {
                    self.oldest = Some(slot);
                }
            }
            None => {
                self.root = Some(slot);
                self.deepest_youngest = Some(slot);
                self.oldest = Some(slot);
            }
        }

        debug_assert!(self
            .oldest
            .map(|o| self.node(o).children == 0)
            .unwrap_or(false));

        self.total_size += size;

        if self.by_id.len() == 1 {
            (self.callbacks.first_inserted)();
        }

        let mut need_gc = false;

        if self.memory_limits.exceeds_soft(self.total_size) {
            info!(
                "{} memory limit exceeded by size {} of new object {}, \
                 attempting to collect garbage",
                if self.memory_limits.exceeds_hard(self.total_size) {
                    "hard"
                } else {
                    "soft"
                },
                size,
                id
            );
            need_gc = true;
        }

        if self.count_limits.exceeds_soft(self.by_id.len()) {
            info!(
                "{} limit of number of objects exceeded by new object {}, \
                 attempting to collect garbage",
                if self.count_limits.exceeds_hard(self.by_id.len()) {
                    "hard"
                } else {
                    "soft"
                },
                id
            );
            need_gc = true;
        }

        if need_gc {
            (self.callbacks.gc_needed)();
        }

        id
    }

    /// Re-insert an entry to assign it a new id, preserving its position in
    /// the tree and in the aging order. Pin status migrates with it.
    pub fn insert_again(&mut self, id: ListId) -> ListId {
        let Some(idx) = self.by_id.remove(&id) else {
            return ListId::INVALID;
        };

        let by_id = &self.by_id;
        let new_id =
            self.id_generator
                .next(CacheMode::of(id), id.context(), |candidate| {
                    !by_id.contains_key(&candidate)
                });

        if !new_id.is_valid() {
            error!("BUG: no free list ids left for re-insertion");
            self.by_id.insert(id, idx);
            return ListId::INVALID;
        }

        self.node_mut(idx).id = new_id;
        let inserted = self.by_id.insert(new_id, idx);
        debug_assert!(inserted.is_none());

        if self.pinned_id == id {
            self.pinned_id = new_id;
        }

        new_id
    }

    /// Change the size of a cached entry and mark it as used. Runs garbage
    /// collection right away when growth pushes memory over the soft limit.
    pub fn set_object_size(&mut self, id: ListId, size: usize) -> bool {
        let Some(&idx) = self.by_id.get(&id) else {
            return false;
        };

        let old_size = self.node(idx).size;
        debug_assert!(old_size <= self.total_size);
        self.total_size -= old_size;
        self.node_mut(idx).size = size;
        self.total_size += size;

        self.use_node(idx);

        if size > old_size && self.memory_limits.exceeds_soft(self.total_size) {
            info!(
                "{} memory limit exceeded by new size {} of object {}, \
                 attempting to collect garbage",
                if self.memory_limits.exceeds_hard(self.total_size) {
                    "hard"
                } else {
                    "soft"
                },
                size,
                id
            );
            self.gc();
        }

        true
    }

    fn set_pin_mode_on_path(&mut self, id: ListId, pin: bool) -> bool {
        if !id.is_valid() {
            return false;
        }

        let Some(&idx) = self.by_id.get(&id) else {
            return false;
        };

        let mut e = Some(idx);
        while let Some(cur) = e {
            self.node_mut(cur).pinned = pin;
            e = self.node(cur).parent;
        }

        true
    }

    /// Pin an entry: neither it nor any entry on its path to the root will
    /// be garbage collected. Pass the invalid id to remove the pin.
    ///
    /// Replacing one pinned path by another unpins the old path first and
    /// runs garbage collection, since the now-unpinned entries may have
    /// become collectible.
    ///
    /// Returns whether some entry is pinned when the function returns.
    pub fn pin(&mut self, id: ListId) -> bool {
        if self.pinned_id == id {
            return self.pinned_id.is_valid();
        }

        let need_gc = self.pinned_id.is_valid();

        if need_gc {
            self.set_pin_mode_on_path(self.pinned_id, false);
        }

        self.pinned_id = id;

        let result = if id.is_valid() {
            self.set_pin_mode_on_path(id, true)
        } else {
            true
        };

        if !result {
            self.pinned_id = ListId::INVALID;
        }

        if !self.gc_running && need_gc {
            self.gc();
        }

        self.pinned_id.is_valid()
    }

    /// Discard one unpinned entry, returning its younger aging-list
    /// neighbor. The candidate is normally a leaf; the root of a replaced
    /// subtree may be discarded ahead of its descendants.
    fn discard(&mut self, candidate: usize, allow_notifications: bool) -> Option<usize> {
        debug_assert!(self.oldest.is_some());
        debug_assert!(!self.node(candidate).pinned);

        let next_candidate = self.unlink_aging(candidate);

        if self.oldest == Some(candidate) {
            self.oldest = next_candidate;
        }

        let parent = self.node(candidate).parent;

        if self.deepest_youngest == Some(candidate) {
            // settle on the nearest live ancestor
            let mut p = parent;
            while let Some(i) = p {
                match self.nodes[i].as_ref() {
                    Some(n) if n.zombie => p = n.parent,
                    Some(_) => break,
                    None => {
                        p = self.root;
                        break;
                    }
                }
            }
            self.deepest_youngest = p;
        }

        let removed_id = self.node(candidate).id;
        let removed_size = self.node(candidate).size;

        debug_assert!(removed_size <= self.total_size);
        self.total_size -= removed_size;

        if self.node(candidate).children > 0 {
            self.node_mut(candidate).zombie = true;
        } else {
            self.free_slot(candidate);
        }

        if let Some(p) = parent {
            let parent_node = self.node_mut(p);
            debug_assert!(parent_node.children > 0);
            parent_node.children -= 1;
            let free_zombie_parent = parent_node.zombie && parent_node.children == 0;

            self.node_mut(p).payload.obliviate_child(removed_id);

            if free_zombie_parent {
                self.free_slot(p);
            }
        }

        let removed = self.by_id.remove(&removed_id);
        debug_assert!(removed.is_some());

        if allow_notifications {
            (self.callbacks.object_removed)(removed_id);
        }

        if self.oldest.is_none() {
            // deleted the last entry, cache is empty now
            self.root = None;

            if allow_notifications {
                (self.callbacks.last_removed)();
            }
        }

        next_candidate
    }

    /// Run garbage collection.
    ///
    /// Discards entries that exceed the maximum age, then keeps discarding
    /// in aging order while any value exceeds its soft limit until all
    /// values drop below their low watermarks. The entry path the user is
    /// currently navigating (ending at the deepest-youngest entry) is only
    /// sacrificed under hard-limit pressure.
    ///
    /// Returns the time after which the function should be called again, or
    /// `None` if no call is needed (cache empty, or all remaining entries
    /// pinned).
    pub fn gc(&mut self) -> Option<Duration> {
        debug_assert!(!self.gc_running);
        if self.gc_running {
            return None;
        }

        self.gc_running = true;
        let next_call = self.run_gc();
        self.gc_running = false;

        next_call
    }

    fn run_gc(&mut self) -> Option<Duration> {
        let mut candidate = self.oldest;

        while let Some(c) = candidate {
            if self.age_of(c) < self.maximum_age {
                break;
            }

            candidate = if !self.node(c).pinned {
                self.discard(c, true)
            } else {
                self.node(c).younger
            };
        }

        if self.memory_limits.exceeds_soft(self.total_size)
            || self.count_limits.exceeds_soft(self.by_id.len())
        {
            // under resource pressure entries die before their time has come
            while let Some(c) = candidate {
                if self.memory_limits.is_low_enough(self.total_size)
                    && self.count_limits.is_low_enough(self.by_id.len())
                {
                    break;
                }

                if self.node(c).pinned {
                    candidate = self.node(c).younger;
                    continue;
                }

                if Some(c) != self.deepest_youngest {
                    candidate = self.discard(c, true);
                } else if self.memory_limits.exceeds_hard(self.total_size)
                    || self.count_limits.exceeds_hard(self.by_id.len())
                {
                    warn!(
                        "discarding hot object {} (size {}exceeded, count {}exceeded)",
                        self.node(c).id,
                        if self.memory_limits.exceeds_hard(self.total_size) {
                            ""
                        } else {
                            "not "
                        },
                        if self.count_limits.exceeds_hard(self.by_id.len()) {
                            ""
                        } else {
                            "not "
                        }
                    );
                    candidate = self.discard(c, true);
                } else {
                    break;
                }
            }
        }

        if self.oldest.is_none() {
            debug_assert!(self.root.is_none());
            debug_assert!(self.deepest_youngest.is_none());
            debug_assert!(self.by_id.is_empty());
            return None;
        }

        while let Some(c) = candidate {
            if self.node(c).pinned {
                candidate = self.node(c).younger;
            } else {
                break;
            }
        }

        let c = candidate?; // remaining entries are all pinned

        let age = self.age_of(c);
        let next_secs = self
            .maximum_age
            .saturating_sub(age)
            .as_secs();

        if next_secs > 0 {
            Some(Duration::from_secs(next_secs))
        } else {
            Some(Duration::from_secs(1))
        }
    }

    /// Collect the ids of all sublists recursively referenced by the entry,
    /// including the entry itself, in worklist (topological, parents-first)
    /// order.
    pub fn enumerate_tree_of_sublists(&self, id: ListId, out: &mut Vec<ListId>, append: bool) {
        if !append {
            out.clear();
        }

        out.push(id);

        let mut next_unprocessed = out.len() - 1;

        while next_unprocessed < out.len() {
            let current = out[next_unprocessed];

            match self.lookup(current) {
                Some(payload) => payload.enumerate_direct_sublists(out),
                None => error!("BUG: no list in cache for id {}", current),
            }

            next_unprocessed += 1;
        }
    }

    /// In-place topological sort of a kill list so that every internal node
    /// appears after all of its descendants in the list.
    ///
    /// The list must contain at least one leaf, every internal node must be
    /// reachable from some leaf in the list via parent links, and ids must
    /// be unique. On failure the list content is unspecified.
    pub fn toposort_for_purge(&self, kill_list: &mut Vec<ListId>) -> bool {
        for id in kill_list.iter() {
            if !self.contains(*id) {
                error!("BUG: cannot sort for purge, id {} not in cache", id);
                return false;
            }
        }

        let (leaves, internals): (Vec<ListId>, Vec<ListId>) = kill_list
            .drain(..)
            .partition(|id| self.is_leaf(*id) == Some(true));

        if internals.is_empty() {
            *kill_list = leaves;
            return true;
        }

        if leaves.is_empty() {
            error!("BUG: cannot sort for purge because set contains no leaves");
            return false;
        }

        // for each internal node, its maximum distance from any leaf in the
        // kill list
        let mut node_distances: HashMap<ListId, usize> = HashMap::new();

        for id in &internals {
            node_distances.insert(*id, 0);
        }

        if node_distances.len() != internals.len() {
            error!("BUG: cannot sort for purge because kill list is inconsistent");
            return false;
        }

        for leaf in &leaves {
            let mut dist = 0usize;
            let mut ancestor = self.parent_of(*leaf);

            while ancestor.is_valid() {
                if let Some(known) = node_distances.get_mut(&ancestor) {
                    dist += 1;

                    if *known < dist {
                        *known = dist;
                    } else {
                        break;
                    }
                }

                ancestor = self.parent_of(ancestor);
            }
        }

        let mut sorted_by_distance: Vec<(usize, ListId)> = node_distances
            .into_iter()
            .map(|(id, dist)| (dist, id))
            .collect();
        sorted_by_distance.sort_by_key(|&(dist, id)| (dist, id.bits()));

        kill_list.extend(leaves);
        kill_list.extend(sorted_by_distance.into_iter().map(|(_, id)| id));

        true
    }

    /// Discard every entry in the given kill list.
    ///
    /// The list must contain all entries of one or more full subtrees and
    /// enumerate them in topological order, leaves first; see
    /// [`Cache::toposort_for_purge`]. A pinned entry is unpinned before it
    /// is discarded.
    pub fn purge_entries(&mut self, kill_list: &[ListId], allow_notifications: bool) {
        for id in kill_list {
            info!("purge entry {}", id);

            if !self.contains(*id) {
                error!("BUG: tried to purge nonexistent entry {}", id);
                continue;
            }

            if self.is_pinned(*id) {
                self.pin(ListId::INVALID);
            }

            // unpinning may already have collected the entry
            if let Some(&idx) = self.by_id.get(id) {
                self.discard(idx, allow_notifications);
            }
        }
    }

    /// Full structural validation of the cache invariants. Diagnostic aid
    /// for tests; panics on inconsistency.
    pub fn self_check(&self) {
        let live: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].is_some())
            .collect();

        assert!(
            live.iter().all(|&i| !self.node(i).zombie),
            "zombie entries must not outlive their purge"
        );
        assert_eq!(live.len(), self.by_id.len());
        assert_eq!(
            self.root.is_none(),
            self.oldest.is_none(),
            "root and oldest must both be set or both be unset"
        );
        assert_eq!(self.root.is_none(), self.deepest_youngest.is_none());

        let mut total_children = 0usize;
        let mut total_size = 0usize;

        for &idx in &live {
            let node = self.node(idx);

            assert_eq!(self.by_id.get(&node.id), Some(&idx));
            assert_ne!(node.parent, Some(idx));

            let children = live
                .iter()
                .filter(|&&other| self.node(other).parent == Some(idx))
                .count();
            assert_eq!(children, node.children);
            total_children += children;
            total_size += node.size;

            if node.pinned {
                let mut e = node.parent;
                while let Some(cur) = e {
                    assert!(self.node(cur).pinned, "pinned entry with unpinned ancestor");
                    e = self.node(cur).parent;
                }
            }

            // ages are monotonic towards the root
            if let Some(p) = node.parent {
                assert!(node.last_used <= self.node(p).last_used);
            }
        }

        assert_eq!(total_size, self.total_size);

        let pinned_count = live
            .iter()
            .filter(|&&idx| self.node(idx).id == self.pinned_id)
            .count();
        assert_eq!(pinned_count, usize::from(self.pinned_id.is_valid()));

        let Some(root) = self.root else {
            assert_eq!(total_children, 0);
            assert!(self.by_id.is_empty());
            return;
        };

        assert_eq!(total_children + 1, self.count());
        assert!(self.node(root).parent.is_none());
        assert!(self.node(root).younger.is_none());

        let oldest = self.oldest.expect("oldest set when root is set");
        assert!(self.node(oldest).older.is_none());
        assert_eq!(self.node(oldest).children, 0, "oldest entry must be a leaf");

        // the aging list enumerates all entries in non-decreasing last-use
        // order and is consistent front-to-back and back-to-front
        let forward: Vec<usize> = std::iter::successors(self.oldest, |&i| self.node(i).younger)
            .collect();
        assert_eq!(forward.len(), self.count());

        for pair in forward.windows(2) {
            assert!(self.node(pair[0]).last_used <= self.node(pair[1]).last_used);
            assert_eq!(self.node(pair[1]).older, Some(pair[0]));
        }

        assert_eq!(forward.last(), Some(&root));

        // all ancestors of the deepest-youngest entry share its timestamp
        let deepest = self.deepest_youngest.expect("deepest set when root is set");
        let youngest_stamp = self.node(deepest).last_used;
        let mut e = self.node(deepest).parent;
        while let Some(cur) = e {
            assert_eq!(self.node(cur).last_used, youngest_stamp);
            e = self.node(cur).parent;
        }
    }
}
