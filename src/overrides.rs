//! Cacheability checks and time-bounded overrides.
//!
//! Entries whose id carries the nocache bit are discarded by garbage
//! collection unless pinned. An *override* temporarily promotes such an
//! entry to cacheable, together with every nocache ancestor on its path to
//! the root, so a client can work inside an uncacheable subtree for a
//! while.
//!
//! Overrides expire after three minutes unless renewed. Expiry is
//! cooperative: the owning loop asks for [`CacheCheck::next_expiry`] and
//! calls [`CacheCheck::fire_due`] once the deadline passes, on the same
//! thread that runs all other cache operations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::error;

use crate::cache::{Cache, CachePayload};
use crate::ids::ListId;
use crate::timebase::Timebase;

/// How long an override lives without renewal.
pub const OVERRIDE_EXPIRY: Duration = Duration::from_secs(3 * 60);

/// Notification that a live override timed out, called once per override.
pub type OverrideExpiredFn = Box<dyn FnMut(ListId)>;

/// Cacheability policy interface.
pub trait CacheCheck<P: CachePayload> {
    /// Whether the entry with the given id may stay in cache across garbage
    /// collection.
    fn is_cacheable(&self, cache: &Cache<P>, id: ListId) -> bool;

    /// Create or renew an override for the given list. Returns the time
    /// until expiry, or `None` if the list is unknown (or overrides are not
    /// supported).
    fn put_override(&mut self, cache: &Cache<P>, id: ListId) -> Option<Duration>;

    /// Drop the override for the given list, if any.
    fn remove_override(&mut self, id: ListId) -> bool;

    fn has_overrides(&self) -> bool;

    /// A list id was invalidated: `replacement_id` took over (or, when
    /// invalid, the list is gone). Overrides and recorded paths are patched
    /// accordingly.
    fn list_invalidate(&mut self, id: ListId, replacement_id: ListId);

    /// Earliest override deadline, if any.
    fn next_expiry(&self) -> Option<Instant> {
        None
    }

    /// Drop overrides whose deadline passed, notifying per expired
    /// override. Returns the expired ids.
    fn fire_due(&mut self) -> Vec<ListId> {
        Vec::new()
    }
}

/// Policy without overrides: cacheable means "valid id without the nocache
/// bit".
#[derive(Debug, Default)]
pub struct CheckNoOverrides;

impl<P: CachePayload> CacheCheck<P> for CheckNoOverrides {
    fn is_cacheable(&self, _cache: &Cache<P>, id: ListId) -> bool {
        id.is_valid() && !id.nocache()
    }

    fn put_override(&mut self, _cache: &Cache<P>, _id: ListId) -> Option<Duration> {
        None
    }

    fn remove_override(&mut self, _id: ListId) -> bool {
        false
    }

    fn has_overrides(&self) -> bool {
        false
    }

    fn list_invalidate(&mut self, _id: ListId, _replacement_id: ListId) {}
}

struct OverrideRecord {
    /// Ancestors of the overridden list whose nocache bit is set, up to but
    /// not including the first cacheable ancestor.
    path_to_root: HashSet<ListId>,
    /// When the override was last created or renewed.
    armed_at: Instant,
}

impl OverrideRecord {
    fn is_on_path_to_override(&self, id: ListId) -> bool {
        self.path_to_root.contains(&id)
    }

    fn list_invalidate(&mut self, id: ListId, replacement_id: ListId) {
        debug_assert!(id.is_valid());
        debug_assert!(replacement_id.is_valid());

        if self.path_to_root.remove(&id) {
            self.path_to_root.insert(replacement_id);
        }
    }
}

/// Cacheability policy with time-bounded overrides.
pub struct CheckWithOverrides {
    timebase: Arc<dyn Timebase>,
    overrides: HashMap<ListId, OverrideRecord>,
    expired_notifier: Option<OverrideExpiredFn>,
}

impl CheckWithOverrides {
    pub fn new(timebase: Arc<dyn Timebase>) -> Self {
        CheckWithOverrides {
            timebase,
            overrides: HashMap::new(),
            expired_notifier: None,
        }
    }

    /// Install the expiry notification.
    pub fn set_expired_notifier(&mut self, notifier: OverrideExpiredFn) {
        self.expired_notifier = Some(notifier);
    }

    pub fn remove_override(&mut self, id: ListId) -> bool {
        self.overrides.remove(&id).is_some()
    }

    pub fn has_overrides(&self) -> bool {
        !self.overrides.is_empty()
    }

    pub fn list_invalidate(&mut self, id: ListId, replacement_id: ListId) {
        if !id.is_valid() {
            return;
        }

        if self.overrides.is_empty() {
            return;
        }

        if replacement_id.is_valid() {
            if id != replacement_id {
                if let Some(record) = self.overrides.remove(&id) {
                    self.overrides.insert(replacement_id, record);
                }
            }

            for record in self.overrides.values_mut() {
                record.list_invalidate(id, replacement_id);
            }
        } else {
            // Overrides for lists deeper down the purged subtree are
            // dropped when those lists are invalidated in turn.
            self.overrides.remove(&id);
        }
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.overrides
            .values()
            .map(|record| record.armed_at + OVERRIDE_EXPIRY)
            .min()
    }

    pub fn fire_due(&mut self) -> Vec<ListId> {
        let now = self.timebase.now();

        let due: Vec<ListId> = self
            .overrides
            .iter()
            .filter(|(_, record)| {
                now.saturating_duration_since(record.armed_at) >= OVERRIDE_EXPIRY
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &due {
            self.overrides.remove(id);

            if let Some(notify) = self.expired_notifier.as_mut() {
                notify(*id);
            }
        }

        due
    }
}

impl<P: CachePayload> CacheCheck<P> for CheckWithOverrides {
    fn is_cacheable(&self, cache: &Cache<P>, id: ListId) -> bool {
        if !id.is_valid() {
            return false;
        }

        if !cache.contains(id) {
            error!("BUG: no list in cache for id {}", id);
            return false;
        }

        if !id.nocache() {
            return true;
        }

        if self.overrides.is_empty() {
            return false;
        }

        for (overridden, record) in &self.overrides {
            if *overridden == id {
                return true;
            }

            if record.is_on_path_to_override(id) {
                return true;
            }
        }

        let mut ancestor = cache.parent_of(id);

        while ancestor.is_valid() {
            if self.overrides.contains_key(&ancestor) {
                return true;
            }

            ancestor = cache.parent_of(ancestor);
        }

        false
    }

    fn put_override(&mut self, cache: &Cache<P>, id: ListId) -> Option<Duration> {
        debug_assert!(id.is_valid());

        if !cache.contains(id) {
            return None;
        }

        let mut nodes = HashSet::new();
        let mut ancestor = cache.parent_of(id);

        while ancestor.is_valid() && ancestor.nocache() {
            nodes.insert(ancestor);
            ancestor = cache.parent_of(ancestor);
        }

        let now = self.timebase.now();
        let record = self
            .overrides
            .entry(id)
            .or_insert_with(|| OverrideRecord {
                path_to_root: nodes,
                armed_at: now,
            });

        // keep alive: renew the deadline
        record.armed_at = now;

        Some(OVERRIDE_EXPIRY)
    }

    fn remove_override(&mut self, id: ListId) -> bool {
        CheckWithOverrides::remove_override(self, id)
    }

    fn has_overrides(&self) -> bool {
        CheckWithOverrides::has_overrides(self)
    }

    fn list_invalidate(&mut self, id: ListId, replacement_id: ListId) {
        CheckWithOverrides::list_invalidate(self, id, replacement_id)
    }

    fn next_expiry(&self) -> Option<Instant> {
        CheckWithOverrides::next_expiry(self)
    }

    fn fire_due(&mut self) -> Vec<ListId> {
        CheckWithOverrides::fire_due(self)
    }
}
