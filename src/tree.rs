//! High-level management of trees of lists.
//!
//! The tree manager glues the cache, the cacheability policy, and the list
//! types together: it wraps allocation and blessing of new lists, entering
//! children, purging subtrees, and id reassignment, and funnels every
//! externally visible id change through one invalidation notifier.

use std::time::{Duration, Instant};

use log::error;

use crate::cache::{
    to_cache_mode, Cache, CacheMode, CacheModeRequest, CachePayload, UseResult,
};
use crate::enter::{enter_child_template, EnterChildOps};
use crate::error::{ListError, ListResult};
use crate::ids::{Context, ListId};
use crate::item::ListItemData;
use crate::lists::BrowseList;
use crate::overrides::CacheCheck;

/// Outcome of purging a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeResult {
    /// The given root id was invalid or unknown; nothing happened.
    Invalid,
    /// No lists were purged, nothing happened.
    Untouched,
    /// No lists were purged, but the root id change was announced.
    ReplacedRoot,
    /// Lists were purged; the root id did not change.
    Purged,
    /// Lists were purged and the root id change was announced.
    PurgedAndReplaced,
}

/// Announcement that the list known under the first id is now known under
/// the second (either may be invalid: appearance resp. disappearance).
pub type ListInvalidateNotifier = Box<dyn FnMut(ListId, ListId)>;

/// Function for patching the entry in the parent list that referred to the
/// old root of a purged subtree.
pub type SetNewRoot<'a, P> = &'a mut dyn FnMut(&mut Cache<P>, ListId, ListId);

struct PendingList<P> {
    payload: P,
    parent: ListId,
    created_at: Instant,
}

/// Policy layer on top of the raw cache and list structures.
pub struct ListTreeManager<P: CachePayload> {
    cache: Cache<P>,
    check: Box<dyn CacheCheck<P>>,
    default_cache_mode: CacheModeRequest,
    pending: Option<PendingList<P>>,
    notify_list_invalidate: ListInvalidateNotifier,
}

impl<P: CachePayload> ListTreeManager<P> {
    pub fn new(cache: Cache<P>, check: Box<dyn CacheCheck<P>>) -> Self {
        ListTreeManager {
            cache,
            check,
            default_cache_mode: CacheModeRequest::Auto,
            pending: None,
            notify_list_invalidate: Box::new(|_, _| {}),
        }
    }

    /// Install the notifier for externally visible list-id changes.
    pub fn set_list_invalidate_notifier(&mut self, notifier: ListInvalidateNotifier) {
        self.notify_list_invalidate = notifier;
    }

    pub fn set_default_cache_mode(&mut self, req: CacheModeRequest) {
        self.default_cache_mode = req;
    }

    pub fn cache(&self) -> &Cache<P> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut Cache<P> {
        &mut self.cache
    }

    pub fn check(&self) -> &dyn CacheCheck<P> {
        self.check.as_ref()
    }

    pub fn check_mut(&mut self) -> &mut dyn CacheCheck<P> {
        self.check.as_mut()
    }

    /// Allocate a new list with the given parent without caching it yet.
    ///
    /// The list is remembered as *pending*; there can be at most one pending
    /// list at any time, and it must either be blessed
    /// ([`ListTreeManager::bless`]) or expelled
    /// ([`ListTreeManager::expel_unblessed`]). The pairing catches leaked
    /// uncached lists.
    pub fn allocate_list(&mut self, parent: ListId, payload: P) {
        debug_assert!(self.pending.is_none());

        self.pending = Some(PendingList {
            payload,
            parent,
            created_at: self.cache.now(),
        });
    }

    /// The pending list, for filling it in before blessing.
    pub fn pending_list_mut(&mut self) -> Option<&mut P> {
        self.pending.as_mut().map(|p| &mut p.payload)
    }

    /// Insert the pending list into the cache, assigning it an id.
    pub fn bless(&mut self, ctx: Context, size_of_list: usize, pin_it: bool) -> ListId {
        let Some(pending) = self.pending.take() else {
            error!("BUG: no pending list to bless");
            return ListId::INVALID;
        };

        let id = self.cache.insert(
            pending.payload,
            pending.parent,
            CacheMode::Cached,
            ctx,
            size_of_list,
            pending.created_at,
        );

        if pin_it {
            self.cache.pin(id);
        }

        id
    }

    /// Allocate and bless in one go.
    pub fn allocate_blessed_list(
        &mut self,
        parent: ListId,
        payload: P,
        ctx: Context,
        size_of_list: usize,
        pin_it: bool,
    ) -> ListId {
        self.allocate_list(parent, payload);
        self.bless(ctx, size_of_list, pin_it)
    }

    /// Discard the pending list without caching it.
    pub fn expel_unblessed(&mut self) {
        debug_assert!(self.pending.is_some());
        self.pending = None;
    }

    /// Insert a child list into the cache under the default cache mode.
    pub fn add_child_list_to_cache(
        &mut self,
        parent_id: ListId,
        ctx: Context,
        size_of_list: usize,
        payload: P,
    ) -> ListId {
        let now = self.cache.now();
        self.cache.insert(
            payload,
            parent_id,
            to_cache_mode(self.default_cache_mode),
            ctx,
            size_of_list,
            now,
        )
    }

    pub fn get_parent_list_id(&self, id: ListId) -> ListId {
        if id.is_valid() {
            self.cache.parent_of(id)
        } else {
            ListId::INVALID
        }
    }

    pub fn get_list_depth(&self, id: ListId) -> usize {
        if id.is_valid() {
            self.cache.depth(id).unwrap_or(0)
        } else {
            0
        }
    }

    /// The first root list came into existence.
    pub fn announce_root_list(&mut self, id: ListId) {
        debug_assert!(id.is_valid());

        self.check.list_invalidate(ListId::INVALID, id);
        (self.notify_list_invalidate)(ListId::INVALID, id);
    }

    /// Reassign the id of a cached list, announcing the change. Returns the
    /// new id, or the invalid id if the list is unknown.
    pub fn reinsert_list(&mut self, id: ListId) -> ListId {
        let new_id = self.cache.insert_again(id);

        if !new_id.is_valid() {
            return ListId::INVALID;
        }

        debug_assert_ne!(new_id, id);

        self.check.list_invalidate(id, new_id);
        (self.notify_list_invalidate)(id, new_id);

        new_id
    }

    /// Mark a list as used, optionally pinning it. When pinning the new list
    /// fails, the previously pinned list is restored.
    pub fn use_list(&mut self, id: ListId, pin_it: bool) -> bool {
        if !id.is_valid() {
            return false;
        }

        if self.cache.use_entry(id) == UseResult::InvalidId {
            return false;
        }

        if !pin_it {
            return true;
        }

        let previous_pinned = self.cache.pinned_object();

        if !self.cache.pin(id) && previous_pinned.is_valid() {
            self.cache.pin(previous_pinned);
        }

        true
    }

    /// Temporarily force an uncacheable list (and its nocache ancestors)
    /// into the cache, or drop the force again. Returns the time the
    /// override stays alive.
    pub fn force_list_into_cache(&mut self, list_id: ListId, force: bool) -> Duration {
        if force {
            self.check
                .put_override(&self.cache, list_id)
                .unwrap_or(Duration::ZERO)
        } else {
            self.check.remove_override(list_id);
            Duration::ZERO
        }
    }

    /// Move the pin to `other_id` if `first_id` is the currently pinned
    /// list.
    pub fn repin_if_first_is_deepest_pinned_list(&mut self, first_id: ListId, other_id: ListId) {
        debug_assert!(other_id.is_valid());

        if !first_id.is_valid() {
            return;
        }

        if first_id == self.cache.pinned_object() {
            self.cache.pin(other_id);
        }
    }

    /// A list was discarded from cache during garbage collection; announce
    /// its disappearance.
    pub fn list_discarded_from_cache(&mut self, id: ListId) {
        self.check.list_invalidate(id, ListId::INVALID);
        (self.notify_list_invalidate)(id, ListId::INVALID);
    }

    /// How long an unused list stays cached; the gc timer base.
    pub fn gc_expiry_time(&self) -> Duration {
        self.cache.maximum_age()
    }

    /// Remove the list `old_id` and all its sublists from cache.
    ///
    /// When `new_id` equals `old_id`, only the subtree below it is removed
    /// and the list itself stays. Otherwise the list is removed along with
    /// its subtree, `new_id` (possibly invalid) replaces it, and the change
    /// is announced through the invalidation notifier; `old_id` is dangling
    /// when this returns.
    ///
    /// `set_root` patches the entry in the parent list that referred to
    /// `old_id`.
    pub fn purge_subtree(
        &mut self,
        old_id: ListId,
        new_id: ListId,
        mut set_root: Option<SetNewRoot<'_, P>>,
    ) -> PurgeResult {
        if !old_id.is_valid() || !self.cache.contains(old_id) {
            if let Some(f) = set_root.as_mut() {
                f(&mut self.cache, old_id, new_id);
            }

            return PurgeResult::Invalid;
        }

        let mut kill_list = Vec::new();
        self.cache
            .enumerate_tree_of_sublists(old_id, &mut kill_list, false);
        debug_assert!(!kill_list.is_empty());

        let (first_to_kill, result) = if !new_id.is_valid() {
            (0, PurgeResult::Purged)
        } else if old_id == new_id {
            (
                1,
                if kill_list.len() > 1 {
                    PurgeResult::Purged
                } else {
                    PurgeResult::Untouched
                },
            )
        } else {
            (
                1,
                if kill_list.len() > 1 {
                    PurgeResult::PurgedAndReplaced
                } else {
                    PurgeResult::ReplacedRoot
                },
            )
        };

        let need_to_process_kill_list = match result {
            PurgeResult::Invalid | PurgeResult::Untouched | PurgeResult::Purged => {
                if let Some(f) = set_root.as_mut() {
                    f(&mut self.cache, old_id, new_id);
                }

                result == PurgeResult::Purged
            }
            PurgeResult::ReplacedRoot | PurgeResult::PurgedAndReplaced => {
                self.cache.purge_entries(&kill_list[..1], false);

                if let Some(f) = set_root.as_mut() {
                    f(&mut self.cache, old_id, new_id);
                }

                self.check.list_invalidate(old_id, new_id);
                (self.notify_list_invalidate)(old_id, new_id);

                result == PurgeResult::PurgedAndReplaced
            }
        };

        if need_to_process_kill_list {
            let mut rest = kill_list.split_off(first_to_kill);

            if self.cache.toposort_for_purge(&mut rest) {
                self.cache.purge_entries(&rest, true);
            }
        }

        result
    }
}

impl<T: ListItemData + Clone + 'static, const N: usize> ListTreeManager<BrowseList<T, N>> {
    /// Resolve the child list of item `item` in list `list_id`, creating it
    /// through `add_to_cache` when no reusable cached copy exists.
    ///
    /// A cached child is reused iff the cacheability policy accepts it.
    /// Stale children are purged before the replacement id is recorded in
    /// the parent item.
    pub fn enter_child<C, A>(
        &mut self,
        list_id: ListId,
        item: u32,
        may_continue: C,
        add_to_cache: A,
    ) -> ListResult<ListId>
    where
        C: Fn() -> bool,
        A: FnOnce(&mut Self, ListId, &T) -> ListResult<ListId>,
    {
        if self.cache.lookup(list_id).is_none() {
            return Err(ListError::InvalidId);
        }

        let mut ops = ManagerEnterOps {
            mgr: self,
            list_id,
            may_continue,
            add: Some(add_to_cache),
        };

        enter_child_template(&mut ops, item)
    }
}

struct ManagerEnterOps<'a, T: ListItemData + 'static, const N: usize, C, A> {
    mgr: &'a mut ListTreeManager<BrowseList<T, N>>,
    list_id: ListId,
    may_continue: C,
    add: Option<A>,
}

impl<'a, T, const N: usize, C, A> EnterChildOps<T> for ManagerEnterOps<'a, T, N, C, A>
where
    T: ListItemData + Clone + 'static,
    C: Fn() -> bool,
    A: FnOnce(&mut ListTreeManager<BrowseList<T, N>>, ListId, &T) -> ListResult<ListId>,
{
    fn may_continue(&self) -> bool {
        (self.may_continue)()
    }

    fn parent_size(&mut self) -> ListResult<usize> {
        self.mgr
            .cache
            .lookup(self.list_id)
            .map(|list| list.size())
            .ok_or(ListError::InvalidId)
    }

    fn read_item(&mut self, idx: u32) -> ListResult<(ListId, T)> {
        let list_id = self.list_id;
        let list = self
            .mgr
            .cache
            .lookup_mut(list_id)
            .ok_or(ListError::InvalidId)?;

        list.with_item(list_id, idx, |item| (item.child_list(), item.data().clone()))
    }

    fn use_cached(&mut self, id: ListId) -> bool {
        self.mgr.check.is_cacheable(&self.mgr.cache, id)
    }

    fn add_to_cache(&mut self, item_data: &T) -> ListResult<ListId> {
        let Some(add) = self.add.take() else {
            error!("BUG: child constructor invoked twice");
            return Err(ListError::Internal);
        };

        add(self.mgr, self.list_id, item_data)
    }

    fn purge(&mut self, item: u32, old_id: ListId, new_id: ListId, write_back: bool) -> ListId {
        let list_id = self.list_id;

        let mut set_root = move |cache: &mut Cache<BrowseList<T, N>>, _old: ListId, new: ListId| {
            if !write_back || !new.is_valid() {
                // the purge already obliviated the slot
                return;
            }

            match cache.lookup_mut(list_id) {
                Some(list) => {
                    if list
                        .with_cached_item_mut(item, |it| it.set_child_list(new))
                        .is_err()
                    {
                        error!(
                            "BUG: cannot record child list {} in item {} of list {}",
                            new, item, list_id
                        );
                    }
                }
                None => error!("BUG: list {} vanished while entering child", list_id),
            }
        };

        self.mgr.purge_subtree(old_id, new_id, Some(&mut set_root));

        new_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flat::FlatList;
    use crate::item::ListItem;
    use crate::overrides::{CheckNoOverrides, CheckWithOverrides, OVERRIDE_EXPIRY};
    use crate::pool::FillerPool;
    use crate::test_utils::{MockTimebase, SequenceFiller, TestItem};
    use crate::tiled::TiledList;
    use crate::timebase::Timebase;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::Duration;

    const T: usize = 8;
    type TestList = BrowseList<TestItem, T>;
    type TestManager = ListTreeManager<TestList>;

    struct Fixture {
        mgr: TestManager,
        timebase: Arc<MockTimebase>,
        pool: Arc<FillerPool<TestItem, T>>,
        invalidated: Rc<RefCell<Vec<(ListId, ListId)>>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_check(|timebase| {
                Box::new(CheckWithOverrides::new(
                    Arc::clone(timebase) as Arc<dyn Timebase>
                ))
            })
        }

        fn with_check(
            make_check: impl FnOnce(&Arc<MockTimebase>) -> Box<dyn CacheCheck<TestList>>,
        ) -> Self {
            let timebase = Arc::new(MockTimebase::new());
            let cache = Cache::new(
                1_000_000,
                1000,
                Duration::from_secs(3600),
                Arc::clone(&timebase) as Arc<dyn Timebase>,
            );

            let mut mgr = ListTreeManager::new(cache, make_check(&timebase));

            let invalidated = Rc::new(RefCell::new(Vec::new()));
            let invalidated_cb = Rc::clone(&invalidated);
            mgr.set_list_invalidate_notifier(Box::new(move |old, new| {
                invalidated_cb.borrow_mut().push((old, new));
            }));

            let pool = Arc::new(FillerPool::new(true));
            pool.start(2);

            Fixture {
                mgr,
                timebase,
                pool,
                invalidated,
            }
        }

        fn flat_payload(names: &[&str]) -> TestList {
            let mut list = FlatList::new();
            for name in names {
                list.append_unsorted(ListItem::new(TestItem::dir(name)));
            }
            BrowseList::Flat(list)
        }

        /// Root list with the given directory items.
        fn make_root(&mut self, names: &[&str]) -> ListId {
            self.timebase.advance(Duration::from_secs(1));
            let id = self.mgr.allocate_blessed_list(
                ListId::INVALID,
                Self::flat_payload(names),
                0,
                100,
                false,
            );
            assert!(id.is_valid());
            id
        }

        fn make_child(&mut self, parent: ListId, item: u32, names: &[&str]) -> ListId {
            self.timebase.advance(Duration::from_secs(1));
            let payload = Self::flat_payload(names);
            let child = self
                .mgr
                .enter_child(
                    parent,
                    item,
                    || true,
                    move |mgr, parent_id, _data| {
                        Ok(mgr.add_child_list_to_cache(parent_id, 0, 50, payload))
                    },
                )
                .unwrap();
            assert!(child.is_valid());
            child
        }
    }

    #[test]
    fn test_allocate_and_bless() {
        let mut fx = Fixture::new();
        fx.mgr
            .allocate_list(ListId::INVALID, Fixture::flat_payload(&["a"]));
        assert!(fx.mgr.pending_list_mut().is_some());

        let id = fx.mgr.bless(0, 10, true);
        assert!(id.is_valid());
        assert!(fx.mgr.pending_list_mut().is_none());
        assert_eq!(fx.mgr.cache().pinned_object(), id);
        assert_eq!(fx.mgr.cache().count(), 1);
    }

    #[test]
    fn test_expel_unblessed() {
        let mut fx = Fixture::new();
        fx.mgr
            .allocate_list(ListId::INVALID, Fixture::flat_payload(&["a"]));
        fx.mgr.expel_unblessed();
        assert!(fx.mgr.pending_list_mut().is_none());
        assert_eq!(fx.mgr.cache().count(), 0);
    }

    #[test]
    fn test_enter_child_creates_and_records() {
        let mut fx = Fixture::new();
        let root = fx.make_root(&["albums", "artists"]);

        let child = fx.make_child(root, 0, &["x", "y"]);

        assert_eq!(fx.mgr.get_parent_list_id(child), root);
        assert_eq!(fx.mgr.get_list_depth(child), 2);

        // the child id was recorded in the parent item
        let recorded = fx
            .mgr
            .cache_mut()
            .lookup_mut(root)
            .unwrap()
            .with_item(root, 0, |it| it.child_list())
            .unwrap();
        assert_eq!(recorded, child);
    }

    #[test]
    fn test_enter_child_reuses_cached_child() {
        let mut fx = Fixture::new();
        let root = fx.make_root(&["albums"]);
        let child = fx.make_child(root, 0, &["x"]);

        let again = fx
            .mgr
            .enter_child(root, 0, || true, |_mgr, _parent, _data| {
                panic!("cached child must be reused")
            })
            .unwrap();

        assert_eq!(again, child);
        assert_eq!(fx.mgr.cache().count(), 2);
    }

    #[test]
    fn test_enter_child_interrupted() {
        let mut fx = Fixture::new();
        let root = fx.make_root(&["albums"]);

        let result = fx.mgr.enter_child(root, 0, || false, |_mgr, _parent, _data| {
            panic!("must not be called")
        });
        assert_eq!(result, Err(ListError::Interrupted));
    }

    #[test]
    fn test_enter_child_out_of_range() {
        let mut fx = Fixture::new();
        let root = fx.make_root(&["albums"]);

        let result = fx
            .mgr
            .enter_child(root, 5, || true, |_mgr, _parent, _data| {
                panic!("must not be called")
            });
        assert_eq!(result, Err(ListError::InvalidId));
    }

    #[test]
    fn test_enter_child_unknown_list() {
        let mut fx = Fixture::new();
        let result = fx.mgr.enter_child(
            ListId::new(77, false, 0),
            0,
            || true,
            |_mgr, _parent, _data| panic!("must not be called"),
        );
        assert_eq!(result, Err(ListError::InvalidId));
    }

    #[test]
    fn test_enter_child_constructor_failure_propagates() {
        let mut fx = Fixture::new();
        let root = fx.make_root(&["albums"]);

        let result = fx
            .mgr
            .enter_child(root, 0, || true, |_mgr, _parent, _data| Err(ListError::NetIo));
        assert_eq!(result, Err(ListError::NetIo));

        // nothing was recorded in the item
        let recorded = fx
            .mgr
            .cache_mut()
            .lookup_mut(root)
            .unwrap()
            .with_item(root, 0, |it| it.child_list())
            .unwrap();
        assert!(!recorded.is_valid());
    }

    #[test]
    fn test_enter_uncached_child_is_recreated() {
        let mut fx = Fixture::new();
        fx.mgr.set_default_cache_mode(CacheModeRequest::Uncached);

        let root = fx.make_root(&["server"]);
        let first = fx.make_child(root, 0, &["a"]);
        assert!(first.nocache());

        // no override in place: the cached copy must not be reused
        let created = Rc::new(RefCell::new(false));
        let created_cb = Rc::clone(&created);
        let second = fx
            .mgr
            .enter_child(root, 0, || true, move |mgr, parent, _data| {
                *created_cb.borrow_mut() = true;
                Ok(mgr.add_child_list_to_cache(
                    parent,
                    0,
                    50,
                    Fixture::flat_payload(&["a"]),
                ))
            })
            .unwrap();

        assert!(*created.borrow());
        assert_ne!(second, first);
        assert!(!fx.mgr.cache().contains(first));
        assert!(fx.mgr.cache().contains(second));
    }

    #[test]
    fn test_enter_child_with_tiled_parent() {
        let mut fx = Fixture::new();

        fx.timebase.advance(Duration::from_secs(1));
        let filler = Arc::new(SequenceFiller::new(83));
        let root = fx.mgr.allocate_blessed_list(
            ListId::INVALID,
            BrowseList::Tiled(TiledList::new(83, filler, Arc::clone(&fx.pool))),
            0,
            100,
            false,
        );

        let child = fx.make_child(root, 20, &["inner"]);
        assert!(child.is_valid());
        assert_eq!(fx.mgr.get_parent_list_id(child), root);

        // recorded in the tile item, so a second enter reuses it
        let again = fx
            .mgr
            .enter_child(root, 20, || true, |_mgr, _parent, _data| {
                panic!("cached child must be reused")
            })
            .unwrap();
        assert_eq!(again, child);
    }

    #[test]
    fn test_purge_subtree_scenario() {
        let mut fx = Fixture::new();
        let root = fx.make_root(&["a", "inner", "d"]);
        let _leaf_a = fx.make_child(root, 0, &["x"]);
        let inner = fx.make_child(root, 1, &["b", "c"]);
        let leaf_b = fx.make_child(inner, 0, &[]);
        let leaf_c = fx.make_child(inner, 1, &[]);
        let _leaf_d = fx.make_child(root, 2, &["y"]);

        assert_eq!(fx.mgr.cache().count(), 6);

        // purge the inner subtree but keep the inner list itself
        let result = fx.mgr.purge_subtree(inner, inner, None);
        assert_eq!(result, PurgeResult::Purged);

        assert_eq!(fx.mgr.cache().count(), 4);
        assert!(fx.mgr.cache().contains(inner));
        assert!(!fx.mgr.cache().contains(leaf_b));
        assert!(!fx.mgr.cache().contains(leaf_c));
        fx.mgr.cache().self_check();
    }

    #[test]
    fn test_purge_subtree_with_replacement() {
        let mut fx = Fixture::new();
        let root = fx.make_root(&["inner"]);
        let inner = fx.make_child(root, 0, &["b"]);
        let leaf = fx.make_child(inner, 0, &[]);

        fx.invalidated.borrow_mut().clear();

        let replacement = ListId::new(2222, false, 0);
        let result = fx.mgr.purge_subtree(inner, replacement, None);

        assert_eq!(result, PurgeResult::PurgedAndReplaced);
        assert!(!fx.mgr.cache().contains(inner));
        assert!(!fx.mgr.cache().contains(leaf));
        assert_eq!(fx.invalidated.borrow().as_slice(), &[(inner, replacement)]);
    }

    #[test]
    fn test_purge_subtree_of_leaf_is_untouched() {
        let mut fx = Fixture::new();
        let root = fx.make_root(&["a"]);
        let leaf = fx.make_child(root, 0, &[]);

        assert_eq!(fx.mgr.purge_subtree(leaf, leaf, None), PurgeResult::Untouched);
        assert!(fx.mgr.cache().contains(leaf));
    }

    #[test]
    fn test_purge_subtree_invalid_id() {
        let mut fx = Fixture::new();
        fx.make_root(&["a"]);

        assert_eq!(
            fx.mgr
                .purge_subtree(ListId::new(404, false, 0), ListId::INVALID, None),
            PurgeResult::Invalid
        );
        assert_eq!(
            fx.mgr.purge_subtree(ListId::INVALID, ListId::INVALID, None),
            PurgeResult::Invalid
        );
    }

    #[test]
    fn test_purge_subtree_without_replacement_purges_root_too() {
        let mut fx = Fixture::new();
        let root = fx.make_root(&["inner"]);
        let inner = fx.make_child(root, 0, &["b"]);
        let leaf = fx.make_child(inner, 0, &[]);

        let result = fx.mgr.purge_subtree(inner, ListId::INVALID, None);
        assert_eq!(result, PurgeResult::Purged);
        assert!(!fx.mgr.cache().contains(inner));
        assert!(!fx.mgr.cache().contains(leaf));
        assert!(fx.mgr.cache().contains(root));

        // the parent item no longer references the purged list
        let recorded = fx
            .mgr
            .cache_mut()
            .lookup_mut(root)
            .unwrap()
            .with_item(root, 0, |it| it.child_list())
            .unwrap();
        assert!(!recorded.is_valid());
        fx.mgr.cache().self_check();
    }

    #[test]
    fn test_reinsert_list() {
        let mut fx = Fixture::new();
        let root = fx.make_root(&["a"]);
        let child = fx.make_child(root, 0, &[]);

        fx.invalidated.borrow_mut().clear();
        let new_root = fx.mgr.reinsert_list(root);

        assert!(new_root.is_valid());
        assert_ne!(new_root, root);
        assert!(!fx.mgr.cache().contains(root));
        assert_eq!(fx.mgr.get_parent_list_id(child), new_root);
        assert_eq!(fx.invalidated.borrow().as_slice(), &[(root, new_root)]);

        assert!(!fx.mgr.reinsert_list(ListId::new(404, false, 0)).is_valid());
    }

    #[test]
    fn test_announce_root_list() {
        let mut fx = Fixture::new();
        let root = fx.make_root(&["a"]);

        fx.invalidated.borrow_mut().clear();
        fx.mgr.announce_root_list(root);
        assert_eq!(
            fx.invalidated.borrow().as_slice(),
            &[(ListId::INVALID, root)]
        );
    }

    #[test]
    fn test_list_discarded_from_cache() {
        let mut fx = Fixture::new();
        let root = fx.make_root(&["a"]);

        fx.invalidated.borrow_mut().clear();
        fx.mgr.list_discarded_from_cache(root);
        assert_eq!(
            fx.invalidated.borrow().as_slice(),
            &[(root, ListId::INVALID)]
        );
    }

    #[test]
    fn test_use_list_with_pinning() {
        let mut fx = Fixture::new();
        let root = fx.make_root(&["a", "b"]);
        let a = fx.make_child(root, 0, &[]);
        let b = fx.make_child(root, 1, &[]);

        assert!(fx.mgr.use_list(a, true));
        assert_eq!(fx.mgr.cache().pinned_object(), a);

        assert!(fx.mgr.use_list(b, true));
        assert_eq!(fx.mgr.cache().pinned_object(), b);

        assert!(fx.mgr.use_list(a, false));
        assert_eq!(fx.mgr.cache().pinned_object(), b);

        assert!(!fx.mgr.use_list(ListId::INVALID, false));
        assert!(!fx.mgr.use_list(ListId::new(404, false, 0), true));
    }

    #[test]
    fn test_repin() {
        let mut fx = Fixture::new();
        let root = fx.make_root(&["a", "b"]);
        let a = fx.make_child(root, 0, &[]);
        let b = fx.make_child(root, 1, &[]);

        fx.mgr.cache_mut().pin(a);
        fx.mgr.repin_if_first_is_deepest_pinned_list(b, a);
        assert_eq!(fx.mgr.cache().pinned_object(), a);

        fx.mgr.repin_if_first_is_deepest_pinned_list(a, b);
        assert_eq!(fx.mgr.cache().pinned_object(), b);
    }

    #[test]
    fn test_force_list_into_cache() {
        let mut fx = Fixture::new();
        fx.mgr.set_default_cache_mode(CacheModeRequest::Uncached);

        let root = fx.make_root(&["server"]);
        let child = fx.make_child(root, 0, &["a"]);
        assert!(child.nocache());

        let lifetime = fx.mgr.force_list_into_cache(child, true);
        assert_eq!(lifetime, OVERRIDE_EXPIRY);
        assert!(fx.mgr.check().is_cacheable(fx.mgr.cache(), child));

        assert_eq!(fx.mgr.force_list_into_cache(child, false), Duration::ZERO);
        assert!(!fx.mgr.check().is_cacheable(fx.mgr.cache(), child));
    }

    #[test]
    fn test_forced_child_is_reused() {
        let mut fx = Fixture::new();
        fx.mgr.set_default_cache_mode(CacheModeRequest::Uncached);

        let root = fx.make_root(&["server"]);
        let child = fx.make_child(root, 0, &["a"]);

        fx.mgr.force_list_into_cache(child, true);

        let again = fx
            .mgr
            .enter_child(root, 0, || true, |_mgr, _parent, _data| {
                panic!("forced child must be reused")
            })
            .unwrap();
        assert_eq!(again, child);
    }

    #[test]
    fn test_no_overrides_policy() {
        let mut fx = Fixture::with_check(|_| Box::new(CheckNoOverrides));
        fx.mgr.set_default_cache_mode(CacheModeRequest::Uncached);

        let root = fx.make_root(&["server"]);
        let child = fx.make_child(root, 0, &["a"]);

        assert_eq!(fx.mgr.force_list_into_cache(child, true), Duration::ZERO);
        assert!(!fx.mgr.check().is_cacheable(fx.mgr.cache(), child));
    }

    #[test]
    fn test_gc_expiry_time() {
        let fx = Fixture::new();
        assert_eq!(fx.mgr.gc_expiry_time(), Duration::from_secs(3600));
    }
}
