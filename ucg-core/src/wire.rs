// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire header encode/decode.
//!
//! §3 fixes an 8-byte, little-endian-on-the-wire header. DESIGN NOTES §9
//! calls out that the original overlays this as a bit field on a 64-bit
//! union and relies on host struct layout; here the layout is defined once,
//! explicitly, by `to_bytes`/`from_bytes`, and nothing else in the crate is
//! allowed to assume anything about in-memory representation.

use crate::ids::{GroupId, StepIdx};

pub const HEADER_LEN: usize = 8;

/// `{ remote_offset: u32, group_id: u16, coll_id: u8, step_idx: u8 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub remote_offset: u32,
    pub group_id: GroupId,
    pub coll_id: u8,
    pub step_idx: u8,
}

impl Header {
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.remote_offset.to_le_bytes());
        buf[4..6].copy_from_slice(&(self.group_id.get() as u16).to_le_bytes());
        buf[6] = self.coll_id;
        buf[7] = self.step_idx;
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let remote_offset = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let group_id = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        let coll_id = buf[6];
        let step_idx = buf[7];
        Some(Header {
            remote_offset,
            group_id: GroupId::new(group_id as u32)?,
            coll_id,
            step_idx,
        })
    }

    /// The low 16 bits `(step_idx << 8) | coll_id` operations match RX
    /// against, irrespective of `remote_offset`/`group_id`.
    pub fn local_id(&self) -> LocalId {
        LocalId::pack(self.step_idx, self.coll_id)
    }

    /// `step_idx` as the typed, `>= 1` index the rest of the crate uses.
    /// Wire messages for a slot that has already been freed can carry a
    /// stale `0`; treat that as step 1 rather than panicking in `recv`.
    pub fn step_idx_typed(&self) -> StepIdx {
        StepIdx::new(self.step_idx.max(1))
    }
}

/// `(step_idx << 8) | coll_id`. A value of `0` means "slot is free" (see
/// `StepIdx`'s doc comment on why `step_idx` is never actually `0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalId(u16);

impl LocalId {
    pub const FREE: LocalId = LocalId(0);

    pub fn pack(step_idx: u8, coll_id: u8) -> Self {
        LocalId(((step_idx as u16) << 8) | coll_id as u16)
    }

    pub fn of(step_idx: StepIdx, coll_id: u8) -> Self {
        Self::pack(step_idx.get(), coll_id)
    }

    pub fn is_free(self) -> bool {
        self == Self::FREE
    }

    pub fn step_idx(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn coll_id(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    pub fn raw(self) -> u16 {
        self.0
    }
}

/// Length-info mode packed into the high 3 bits of an incast transport's
/// 32-bit length field (I10, §6 wire format).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthMode {
    Default,
    Packed,
    VarCount,
    VarDtype,
}

impl LengthMode {
    fn tag(self) -> u32 {
        match self {
            LengthMode::Default => 0,
            LengthMode::Packed => 1,
            LengthMode::VarCount => 2,
            LengthMode::VarDtype => 3,
        }
    }

    fn from_tag(tag: u32) -> Self {
        match tag {
            0 => LengthMode::Default,
            1 => LengthMode::Packed,
            2 => LengthMode::VarCount,
            _ => LengthMode::VarDtype,
        }
    }
}

const LENGTH_VALUE_BITS: u32 = 29;
const LENGTH_VALUE_MASK: u32 = (1 << LENGTH_VALUE_BITS) - 1;

/// Pack `(mode, value)` into a single `u32`, per (I10): mode in the top 3
/// bits, value in the low 29. Panics if `value` does not fit -- the caller
/// is expected to have already checked against `max_bcopy`/`max_zcopy`.
pub fn pack_length(mode: LengthMode, value: u32) -> u32 {
    assert!(
        value <= LENGTH_VALUE_MASK,
        "length {value} exceeds the 29-bit packed-length field"
    );
    (mode.tag() << LENGTH_VALUE_BITS) | value
}

pub fn unpack_length(packed: u32) -> (LengthMode, u32) {
    let mode = LengthMode::from_tag(packed >> LENGTH_VALUE_BITS);
    let value = packed & LENGTH_VALUE_MASK;
    (mode, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let h = Header {
            remote_offset: 0xdead_beef,
            group_id: GroupId::new(7).unwrap(),
            coll_id: 42,
            step_idx: 3,
        };
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);
        let back = Header::from_bytes(&bytes).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn header_is_little_endian_on_the_wire() {
        let h = Header {
            remote_offset: 1,
            group_id: GroupId::new(0x0201).unwrap(),
            coll_id: 0xaa,
            step_idx: 0xbb,
        };
        let bytes = h.to_bytes();
        assert_eq!(&bytes, &[1, 0, 0, 0, 0x01, 0x02, 0xaa, 0xbb]);
    }

    #[test]
    fn local_id_matches_step_and_coll() {
        let id = LocalId::pack(3, 42);
        assert_eq!(id.step_idx(), 3);
        assert_eq!(id.coll_id(), 42);
        assert!(!id.is_free());
        assert!(LocalId::FREE.is_free());
    }

    #[test]
    fn length_packing_roundtrips_every_mode() {
        for mode in [
            LengthMode::Default,
            LengthMode::Packed,
            LengthMode::VarCount,
            LengthMode::VarDtype,
        ] {
            let packed = pack_length(mode, 123_456);
            let (got_mode, got_value) = unpack_length(packed);
            assert_eq!(got_mode, mode);
            assert_eq!(got_value, 123_456);
        }
    }

    #[test]
    #[should_panic]
    fn length_packing_rejects_oversized_value() {
        pack_length(LengthMode::Default, 1 << 30);
    }
}
