use std::time::Duration;

use bitflags::bitflags;

use crate::uuid::{Uuid, Uuid16};

/// Maximum attribute value length accepted for reassembly, long writes, and
/// notification values.
pub const MAX_ATTR_LEN: usize = 4096;

/// Maximum number of registered client applications.
pub const MAX_APPS: usize = 32;

/// Maximum number of handles in one Read Multiple request.
pub const MAX_READ_MULTI_HANDLES: usize = 10;

/// Default ATT transaction timeout ([Vol 3] Part F, Section 3.3.3).
pub const RSP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for application indication acknowledgements.
pub const IND_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// GATT declaration attribute types ([Vol 3] Part G, Section 3).
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u16)]
pub enum Declaration {
    PrimaryService = 0x2800,
    SecondaryService = 0x2801,
    Include = 0x2802,
    Characteristic = 0x2803,
}

impl Declaration {
    /// Returns the declaration type as a 16-bit UUID.
    #[inline]
    #[must_use]
    pub const fn uuid16(self) -> Uuid16 {
        // SAFETY: All discriminants are non-zero
        unsafe { Uuid16::new_unchecked(self as u16) }
    }

    /// Returns the declaration type as a full UUID.
    #[inline]
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        self.uuid16().as_uuid()
    }
}

crate::impl_display_via_debug! { Declaration }

bitflags! {
    /// Characteristic properties ([Vol 3] Part G, Section 3.3.1.1).
    #[repr(transparent)]
    pub struct CharProps: u8 {
        /// Permits broadcasts of the Characteristic Value.
        const BROADCAST = 0x01;
        /// Permits reads of the Characteristic Value.
        const READ = 0x02;
        /// Permits writes of the Characteristic Value without response.
        const WRITE_WITHOUT_RESPONSE = 0x04;
        /// Permits writes of the Characteristic Value with response.
        const WRITE = 0x08;
        /// Permits notifications of a Characteristic Value without
        /// acknowledgment.
        const NOTIFY = 0x10;
        /// Permits indications of a Characteristic Value with acknowledgment.
        const INDICATE = 0x20;
        /// Permits signed writes to the Characteristic Value.
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        /// Additional properties are defined in the Characteristic Extended
        /// Properties descriptor.
        const EXTENDED_PROPERTIES = 0x80;
    }
}
