//! Packed list identifiers.
//!
//! A list id is a single `u32` carrying three fields:
//!
//! ```text
//! [ context:4 | nocache:1 | raw:27 ]
//! ```
//!
//! `raw == 0` is the invalid sentinel regardless of the other bits. The
//! nocache bit marks entries that must not survive garbage collection unless
//! pinned or promoted by a cacheability override. Context ids partition the
//! raw-id space so independent subsystems never hand out colliding ids.

use std::fmt;

/// List context, `0..=15`.
pub type Context = u8;

/// Largest usable context id.
pub const CONTEXT_MAX: Context = 15;

/// Number of distinct contexts.
pub const CONTEXT_COUNT: usize = CONTEXT_MAX as usize + 1;

const CONTEXT_SHIFT: u32 = 28;
const NOCACHE_BIT: u32 = 1 << 27;
const RAW_MASK: u32 = NOCACHE_BIT - 1;

/// Identifier of one cached list.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ListId(u32);

impl ListId {
    /// The invalid sentinel.
    pub const INVALID: ListId = ListId(0);

    /// Largest raw id the 27-bit field can hold.
    pub const RAW_MAX: u32 = RAW_MASK;

    /// Pack a raw id, cache mode, and context into one id.
    pub fn new(raw: u32, nocache: bool, ctx: Context) -> Self {
        debug_assert!(raw <= RAW_MASK);
        debug_assert!(ctx <= CONTEXT_MAX);

        ListId(
            (raw & RAW_MASK)
                | (u32::from(ctx) << CONTEXT_SHIFT)
                | if nocache { NOCACHE_BIT } else { 0 },
        )
    }

    /// Reconstruct an id from its packed representation.
    pub fn from_bits(bits: u32) -> Self {
        ListId(bits)
    }

    /// Packed representation, the only bit-exact artifact of this crate.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// An id is valid iff its raw part is non-zero.
    pub fn is_valid(self) -> bool {
        self.0 & RAW_MASK != 0
    }

    /// Raw id without context and mode bits.
    pub fn raw(self) -> u32 {
        self.0 & RAW_MASK
    }

    /// Context the id was allocated in.
    pub fn context(self) -> Context {
        (self.0 >> CONTEXT_SHIFT) as Context
    }

    /// Whether the nocache bit is set.
    pub fn nocache(self) -> bool {
        self.0 & NOCACHE_BIT != 0
    }
}

impl fmt::Debug for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "ListId(invalid)");
        }

        write!(
            f,
            "ListId({}, ctx {}{})",
            self.raw(),
            self.context(),
            if self.nocache() { ", nocache" } else { "" }
        )
    }
}

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw())
    }
}
