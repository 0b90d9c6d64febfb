use std::fmt::{Debug, Display, Formatter};
use std::num::NonZeroU16;

use crate::name_of;

/// Attribute handle ([Vol 3] Part F, Section 3.2.2). Handle 0 is invalid and
/// unrepresentable.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Handle(NonZeroU16);

impl Handle {
    /// Smallest valid handle.
    pub const MIN: Self = Self(
        // SAFETY: Non-zero
        unsafe { NonZeroU16::new_unchecked(0x0001) },
    );
    /// Largest valid handle.
    pub const MAX: Self = Self(
        // SAFETY: Non-zero
        unsafe { NonZeroU16::new_unchecked(0xFFFF) },
    );

    /// Wraps a raw handle. Returns `None` if the handle is invalid.
    #[inline]
    #[must_use]
    pub const fn new(h: u16) -> Option<Self> {
        match NonZeroU16::new(h) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Returns the next handle or `None` if the maximum handle was reached.
    #[inline]
    #[must_use]
    pub(crate) const fn next(self) -> Option<Self> {
        Self::new(self.0.get().wrapping_add(1))
    }

    /// Returns the raw handle value.
    #[inline(always)]
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0.get()
    }
}

impl Debug for Handle {
    #[allow(clippy::use_self)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#06X})", name_of!(Handle), self.0.get())
    }
}

impl Display for Handle {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl From<Handle> for u16 {
    #[inline]
    fn from(h: Handle) -> Self {
        h.0.get()
    }
}

impl From<Handle> for usize {
    #[inline]
    fn from(h: Handle) -> Self {
        usize::from(h.0.get())
    }
}

/// Inclusive attribute handle range with `start <= end`.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct HandleRange {
    start: Handle,
    end: Handle,
}

impl HandleRange {
    /// Full handle range.
    pub const ALL: Self = Self {
        start: Handle::MIN,
        end: Handle::MAX,
    };

    /// Creates a handle range. Returns `None` if `start > end`.
    #[inline]
    #[must_use]
    pub fn new(start: Handle, end: Handle) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Returns the first handle in the range.
    #[inline(always)]
    #[must_use]
    pub const fn start(self) -> Handle {
        self.start
    }

    /// Returns the last handle in the range.
    #[inline(always)]
    #[must_use]
    pub const fn end(self) -> Handle {
        self.end
    }

    /// Returns the remaining range after `last`, or `None` once the range is
    /// exhausted. The window only ever moves forward, so a peer reporting a
    /// handle below the current start cannot stall the ranging loop.
    #[inline]
    #[must_use]
    pub(crate) fn after(self, last: Handle) -> Option<Self> {
        match last.next() {
            Some(next) if self.start < next && next <= self.end => {
                Some(Self { start: next, ..self })
            }
            _ => None,
        }
    }
}

impl Debug for HandleRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06X}..={:#06X}", self.start.raw(), self.end.raw())
    }
}

crate::impl_display_via_debug! { HandleRange }
