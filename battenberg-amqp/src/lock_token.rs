//! Lock tokens: per-delivery identifiers used to settle or renew peek-locked messages.
//!
//! The broker hands the token out as the 16-byte `delivery-tag` of the transfer frame. The
//! canonical form is the usual UUID string. The management `renew-lock` operation, however,
//! expects the token with the first three groups byte-swapped (the little-endian GUID layout
//! used by the broker) - [`LockToken::reordered_bytes`] produces that wire form.

use std::fmt;

use uuid::Uuid;

/// Byte positions of the canonical token, in wire order.
const WIRE_ORDER: [usize; 16] = [3, 2, 1, 0, 5, 4, 7, 6, 8, 9, 10, 11, 12, 13, 14, 15];

/// A 16-byte per-delivery lock token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Extract a lock token from the delivery tag of a transfer frame.
    ///
    /// Returns `None` if the tag is not exactly 16 bytes long.
    pub fn from_delivery_tag(tag: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = tag.try_into().ok()?;
        Some(Self(Uuid::from_bytes(bytes)))
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// The token bytes in the order expected by the `renew-lock` management request.
    pub fn reordered_bytes(&self) -> [u8; 16] {
        let canonical = self.0.into_bytes();
        let mut wire = [0u8; 16];
        for (slot, &position) in wire.iter_mut().zip(WIRE_ORDER.iter()) {
            *slot = canonical[position];
        }
        wire
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}
