//! Generic algorithm for entering a child list.
//!
//! Entering a child means resolving the item at some index of a parent list
//! to the id of a cached child list, creating and caching the child when no
//! reusable cached copy exists. The policy pieces (cacheability check,
//! domain-specific child construction, subtree purging) are supplied through
//! [`EnterChildOps`]; the tree manager wires them up.

use log::info;

use crate::error::{ListError, ListResult};
use crate::ids::ListId;

/// Collaborators of [`enter_child_template`].
pub trait EnterChildOps<T> {
    /// `false` once the caller was interrupted.
    fn may_continue(&self) -> bool;

    /// Logical size of the parent list.
    fn parent_size(&mut self) -> ListResult<usize>;

    /// The recorded child-list id and a copy of the domain data of the item
    /// at `idx`, materializing the item if necessary.
    fn read_item(&mut self, idx: u32) -> ListResult<(ListId, T)>;

    /// Whether a cached child with this id may be reused as-is.
    fn use_cached(&mut self, id: ListId) -> bool;

    /// Construct the child list for the given item and add it to the cache,
    /// returning its new id. Called at most once.
    fn add_to_cache(&mut self, item_data: &T) -> ListResult<ListId>;

    /// Unconditionally purge the stale child subtree and, when `write_back`
    /// holds, record `new_id` in the parent item at `item`. Returns the id
    /// the caller should report.
    fn purge(&mut self, item: u32, old_id: ListId, new_id: ListId, write_back: bool) -> ListId;
}

/// Resolve the child list of item `item`, creating it when the cached copy
/// is missing or must not be reused.
///
/// The new id is recorded in the parent item even when it is invalid, unless
/// child construction failed with `InvalidId` (meaning the attempt to enter
/// the child was an error in the first place).
pub fn enter_child_template<T, O: EnterChildOps<T>>(ops: &mut O, item: u32) -> ListResult<ListId> {
    if !ops.may_continue() {
        return Err(ListError::Interrupted);
    }

    if item as usize >= ops.parent_size()? {
        return Err(ListError::InvalidId);
    }

    let (cached_child_id, item_data) = match ops.read_item(item) {
        Ok(read) => read,
        Err(e) => {
            info!("cannot enter child item {}: {}", item, e);
            return Err(e);
        }
    };

    if ops.use_cached(cached_child_id) {
        debug_assert!(cached_child_id.is_valid());
        return Ok(cached_child_id);
    }

    let (new_id, err) = match ops.add_to_cache(&item_data) {
        Ok(id) => (id, None),
        Err(e) => (ListId::INVALID, Some(e)),
    };

    let write_back = new_id.is_valid() || err != Some(ListError::InvalidId);
    let final_id = ops.purge(item, cached_child_id, new_id, write_back);

    match err {
        Some(e) => {
            info!("cannot enter child item {}: {}", item, e);
            Err(e)
        }
        None => Ok(final_id),
    }
}
