//! Client-side Bluetooth LE Attribute Protocol and Generic Attribute Profile
//! engine.
//!
//! This crate implements the GATT client role over the ATT bearer: a
//! per-connection state machine that encodes client requests, pairs server
//! responses with the single outstanding request, drives multi-round
//! procedures (service/characteristic/descriptor discovery, long-attribute
//! reads and reliable writes, MTU exchange), and dispatches server-initiated
//! notifications and indications to registered applications.
//!
//! The engine performs no I/O of its own. The L2CAP bearer is abstracted
//! behind [`att::Transport`], inbound PDUs are fed through
//! [`gatt::Client::deliver`], and timers are driven through
//! [`gatt::Client::poll_timeout`] / [`gatt::Client::handle_timeout`]. All
//! calls against one [`gatt::Client`] must be serialized by the driver.

use std::fmt::{Debug, Formatter};

#[path = "att/att.rs"]
pub mod att;
#[path = "gatt/gatt.rs"]
pub mod gatt;
mod uuid;

pub use crate::uuid::{Uuid, Uuid16};

/// Returns a string representation of the specified type.
macro_rules! name_of {
    ($t:ty) => {{
        // TODO: Switch to `std::any::type_name` when stabilized
        type _T = $t; // Allows $t to be recognized as a type for refactoring
        stringify!($t)
    }};
}
pub(crate) use name_of;

/// Implements `Display` in terms of `Debug`.
macro_rules! impl_display_via_debug {
    { $($t:ty),* $(,)? } => {$(
        impl ::std::fmt::Display for $t {
            #[inline(always)]
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::Debug::fmt(self, f)
            }
        }
    )*};
}
pub(crate) use impl_display_via_debug;

/// Transport-assigned connection index. Identifies one ACL link between the
/// local host and a peer.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct LinkId(u8);

impl LinkId {
    /// Wraps a raw link index.
    #[inline(always)]
    #[must_use]
    pub const fn new(v: u8) -> Self {
        Self(v)
    }

    #[inline(always)]
    pub(crate) const fn idx(self) -> usize {
        self.0 as usize
    }
}

impl Debug for LinkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", name_of!(LinkId), self.0)
    }
}

impl From<u8> for LinkId {
    #[inline(always)]
    fn from(v: u8) -> Self {
        Self(v)
    }
}

impl From<LinkId> for u8 {
    #[inline(always)]
    fn from(id: LinkId) -> Self {
        id.0
    }
}

crate::impl_display_via_debug! { LinkId }

/// Public Bluetooth device address.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct BdAddr([u8; 6]);

impl BdAddr {
    /// Creates a device address from a little-endian byte array.
    #[inline(always)]
    #[must_use]
    pub const fn new(b: [u8; 6]) -> Self {
        Self(b)
    }

    /// Returns the address as a little-endian byte array.
    #[inline(always)]
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 6] {
        self.0
    }
}

impl Debug for BdAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[5], self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

impl From<[u8; 6]> for BdAddr {
    #[inline(always)]
    fn from(b: [u8; 6]) -> Self {
        Self(b)
    }
}

crate::impl_display_via_debug! { BdAddr }
