//! Jump entry records and resolved views

use std::mem;

/// Size of one packed record in bytes (three pointer-width fields)
pub const ENTRY_SIZE: usize = mem::size_of::<JumpEntry>();

/// Required alignment of the table base
pub const ENTRY_ALIGN: usize = mem::align_of::<JumpEntry>();

/// Size of one key slot: a pointer-width word holding the numeric key id
pub const KEY_SLOT_SIZE: usize = mem::size_of::<usize>();

/// One packed jump-entry record
///
/// Describes exactly one patch site. All three fields are displacements from
/// the record's own load address; see the crate docs for the layout. The
/// record never changes after emission.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct JumpEntry {
    site_rel: isize,
    target_rel: isize,
    key_rel: isize,
}

impl JumpEntry {
    /// Pack a record for storage at `record_addr`
    ///
    /// All inputs are the absolute addresses the fields must resolve to once
    /// the record lives at `record_addr`. The polarity bit is stolen from the
    /// key displacement; `key_slot_addr` must be pointer-aligned so the bit
    /// is recoverable.
    pub fn pack(
        record_addr: usize,
        site_addr: usize,
        target_addr: usize,
        key_slot_addr: usize,
        polarity: Polarity,
    ) -> Self {
        debug_assert_eq!(
            key_slot_addr % KEY_SLOT_SIZE,
            0,
            "key slot {key_slot_addr:#x} must be pointer-aligned"
        );
        let rel = |addr: usize| addr.wrapping_sub(record_addr) as isize;
        Self {
            site_rel: rel(site_addr),
            target_rel: rel(target_addr),
            key_rel: rel(key_slot_addr | polarity as usize),
        }
    }

    /// Raw native-endian bytes of this record
    pub fn to_bytes(self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        let word = mem::size_of::<isize>();
        out[..word].copy_from_slice(&self.site_rel.to_ne_bytes());
        out[word..2 * word].copy_from_slice(&self.target_rel.to_ne_bytes());
        out[2 * word..].copy_from_slice(&self.key_rel.to_ne_bytes());
        out
    }
}

/// Branch polarity: whether a site's taken behavior follows the key's state
/// directly or inverted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarity {
    /// Site branches when the key is enabled
    Direct = 0,
    /// Site branches when the key is disabled
    Inverted = 1,
}

impl Polarity {
    /// The physical branch state a site must be in for a key's logical state
    pub fn branch_state(self, enabled: bool) -> bool {
        match self {
            Polarity::Direct => enabled,
            Polarity::Inverted => !enabled,
        }
    }
}

/// A view of one record at its load address
///
/// Resolution is pure pointer arithmetic against the record address, computed
/// on every call. Nothing resolved is cached here, so the view stays correct
/// wherever the containing section was loaded.
#[derive(Clone, Copy, Debug)]
pub struct EntryRef {
    record: *const JumpEntry,
}

impl EntryRef {
    /// Create a view of the record at `record_addr`
    ///
    /// # Safety
    ///
    /// `record_addr` must point to a live, properly aligned `JumpEntry` that
    /// outlives the returned view.
    pub unsafe fn from_addr(record_addr: usize) -> Self {
        debug_assert_eq!(record_addr % ENTRY_ALIGN, 0);
        Self {
            record: record_addr as *const JumpEntry,
        }
    }

    /// Address of the record itself
    pub fn record_addr(&self) -> usize {
        self.record as usize
    }

    fn entry(&self) -> JumpEntry {
        // Safety: from_addr's contract guarantees the record is live
        unsafe { *self.record }
    }

    /// Absolute address of the patch site
    pub fn site_addr(&self) -> usize {
        self.record_addr().wrapping_add_signed(self.entry().site_rel)
    }

    /// Absolute address of the taken-branch target
    pub fn target_addr(&self) -> usize {
        self.record_addr().wrapping_add_signed(self.entry().target_rel)
    }

    /// Absolute address of the key slot this site tests
    pub fn key_slot_addr(&self) -> usize {
        self.record_addr().wrapping_add_signed(self.entry().key_rel) & !1
    }

    /// Branch polarity of this site
    pub fn polarity(&self) -> Polarity {
        if self.record_addr().wrapping_add_signed(self.entry().key_rel) & 1 == 0 {
            Polarity::Direct
        } else {
            Polarity::Inverted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_is_three_words() {
        assert_eq!(ENTRY_SIZE, 3 * mem::size_of::<isize>());
    }

    /// Pack a record in place so the displacements are taken against the
    /// address it actually lives at. Offsets are relative to the record.
    fn packed_at(
        site_off: isize,
        target_off: isize,
        key_off: isize,
        polarity: Polarity,
    ) -> (Box<JumpEntry>, usize) {
        let mut boxed = Box::new(JumpEntry {
            site_rel: 0,
            target_rel: 0,
            key_rel: 0,
        });
        let addr = &*boxed as *const JumpEntry as usize;
        *boxed = JumpEntry::pack(
            addr,
            addr.wrapping_add_signed(site_off),
            addr.wrapping_add_signed(target_off),
            addr.wrapping_add_signed(key_off),
            polarity,
        );
        (boxed, addr)
    }

    #[test]
    fn test_pack_resolve_round_trip() {
        let (entry, addr) = packed_at(0x1000, 0x1040, 0x6008, Polarity::Direct);
        let entry_ref = unsafe { EntryRef::from_addr(addr) };

        assert_eq!(entry_ref.site_addr(), addr + 0x1000);
        assert_eq!(entry_ref.target_addr(), addr + 0x1040);
        assert_eq!(entry_ref.key_slot_addr(), addr + 0x6008);
        assert_eq!(entry_ref.polarity(), Polarity::Direct);
        drop(entry);
    }

    #[test]
    fn test_polarity_bit_does_not_disturb_slot_address() {
        let (entry, addr) = packed_at(0x10, 0x20, 0x40, Polarity::Inverted);
        let entry_ref = unsafe { EntryRef::from_addr(addr) };

        assert_eq!(entry_ref.key_slot_addr(), addr + 0x40);
        assert_eq!(entry_ref.polarity(), Polarity::Inverted);
        drop(entry);
    }

    #[test]
    fn test_branch_state_truth_table() {
        assert!(Polarity::Direct.branch_state(true));
        assert!(!Polarity::Direct.branch_state(false));
        assert!(!Polarity::Inverted.branch_state(true));
        assert!(Polarity::Inverted.branch_state(false));
    }

    #[test]
    fn test_negative_displacements() {
        // Sites below the record address resolve through signed arithmetic
        let (entry, addr) = packed_at(-0x8000, -0x8800, -0x1000, Polarity::Direct);
        let entry_ref = unsafe { EntryRef::from_addr(addr) };

        assert_eq!(entry_ref.site_addr(), addr - 0x8000);
        assert_eq!(entry_ref.target_addr(), addr - 0x8800);
        assert_eq!(entry_ref.key_slot_addr(), addr - 0x1000);
        drop(entry);
    }
}
